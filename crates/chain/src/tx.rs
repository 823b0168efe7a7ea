//! Raw transaction and header decoding.

use bitcoin::{Address, Transaction, block::Header, consensus::encode::deserialize};
use tern_types::{Network, TernError, TernResult, TransactionDetails, TxInput, TxOutput};

use crate::bitcoin_network;

fn decode_hex(raw_hex: &str) -> TernResult<Vec<u8>> {
    hex::decode(raw_hex.trim()).map_err(|e| TernError::Protocol(format!("invalid hex: {e}")))
}

fn decode_tx(raw_hex: &str) -> TernResult<Transaction> {
    let bytes = decode_hex(raw_hex)?;
    deserialize(&bytes).map_err(|e| TernError::Protocol(format!("invalid transaction: {e}")))
}

/// Decode a raw transaction.
///
/// Input values are unknown at this point (`None`) and so is the fee; both
/// need the previous transactions. Height, confirmations and `net` are left
/// at zero for the caller to fill in.
pub fn parse_transaction(raw_hex: &str, network: Network) -> TernResult<TransactionDetails> {
    let tx = decode_tx(raw_hex)?;
    let coinbase = tx.is_coinbase();
    let params = bitcoin_network(network);

    let inputs = if coinbase {
        Vec::new()
    } else {
        tx.input
            .iter()
            .map(|input| TxInput {
                txid: input.previous_output.txid.to_string(),
                vout: input.previous_output.vout,
                value: None,
                address: None,
            })
            .collect()
    };

    let outputs = tx
        .output
        .iter()
        .map(|output| TxOutput {
            value: output.value.to_sat(),
            address: Address::from_script(&output.script_pubkey, params).ok().map(|a| a.to_string()),
            script_hex: hex::encode(output.script_pubkey.as_bytes()),
        })
        .collect();

    Ok(TransactionDetails {
        txid: tx.compute_txid().to_string(),
        height: 0,
        confirmations: 0,
        inputs,
        outputs,
        fee: None,
        vsize: tx.vsize() as u64,
        weight: tx.weight().to_wu(),
        coinbase,
        net: 0,
    })
}

/// Value in satoshis of output `vout` of a raw transaction.
pub fn output_value(raw_hex: &str, vout: u32) -> TernResult<u64> {
    let tx = decode_tx(raw_hex)?;
    tx.output
        .get(vout as usize)
        .map(|o| o.value.to_sat())
        .ok_or_else(|| TernError::Protocol(format!("output {vout} out of range")))
}

/// Timestamp (unix seconds) of a hex-encoded 80-byte block header.
pub fn header_timestamp(header_hex: &str) -> TernResult<u32> {
    let bytes = decode_hex(header_hex)?;
    if bytes.len() != 80 {
        return Err(TernError::Protocol(format!("header must be 80 bytes, got {}", bytes.len())));
    }
    let header: Header =
        deserialize(&bytes).map_err(|e| TernError::Protocol(format!("invalid header: {e}")))?;
    Ok(header.time)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENESIS_COINBASE: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";
    const GENESIS_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

    #[test]
    fn test_parse_genesis_coinbase() {
        let details = parse_transaction(GENESIS_COINBASE, Network::Bitcoin).unwrap();
        assert_eq!(
            details.txid,
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
        assert!(details.coinbase);
        assert!(details.inputs.is_empty());
        assert_eq!(details.outputs.len(), 1);
        assert_eq!(details.outputs[0].value, 5_000_000_000);
        // Pay-to-pubkey has no address form.
        assert_eq!(details.outputs[0].address, None);
        assert!(details.vsize > 0);
        assert_eq!(details.weight, details.vsize * 4);
    }

    #[test]
    fn test_output_value() {
        assert_eq!(output_value(GENESIS_COINBASE, 0).unwrap(), 5_000_000_000);
        assert!(matches!(output_value(GENESIS_COINBASE, 1), Err(TernError::Protocol(_))));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_transaction("zz", Network::Bitcoin), Err(TernError::Protocol(_))));
        assert!(matches!(parse_transaction("0100", Network::Bitcoin), Err(TernError::Protocol(_))));
    }

    #[test]
    fn test_header_timestamp() {
        assert_eq!(header_timestamp(GENESIS_HEADER).unwrap(), 1_231_006_505);
        assert!(header_timestamp("00").is_err());
    }
}
