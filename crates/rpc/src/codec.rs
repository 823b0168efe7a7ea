//! Line codec for the Electrum wire format.
//!
//! Every message is one line of JSON. A line holds either a single object
//! or an array of objects (array batching).

use derive_more::Display;
use serde_json::Value;
use tern_types::{TernError, TernResult};

use crate::{Notification, Request, Response};

/// Default cap on a single line. Large `get_history` answers from busy
/// addresses can run to several megabytes.
pub const DEFAULT_MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// How a batch of requests is framed on the wire.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum BatchEncoding {
    /// One JSON array holding every request, on one line.
    #[display("array")]
    Array,
    /// Each request on its own line, sent back to back.
    #[display("newline")]
    Newline,
}

/// A decoded line received from a server.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// One or more responses. A single object yields a vector of one.
    Responses(Vec<Response>),
    /// A subscription push.
    Notification(Notification),
}

/// Bounded codec for Electrum lines.
#[derive(Debug, Clone, Copy)]
pub struct RpcCodec {
    max_line_size: usize,
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_SIZE)
    }
}

impl RpcCodec {
    #[must_use]
    /// Create a codec with the given line limit.
    pub const fn new(max_line_size: usize) -> Self {
        Self { max_line_size }
    }

    #[must_use]
    /// The line limit.
    pub const fn max_line_size(&self) -> usize {
        self.max_line_size
    }

    /// Encode one request as a line (without the trailing newline).
    pub fn encode_request(&self, request: &Request) -> TernResult<String> {
        serde_json::to_string(request).map_err(|e| TernError::Internal(format!("encode error: {e}")))
    }

    /// Encode a batch into the lines to write, in request order.
    pub fn encode_batch(
        &self,
        requests: &[Request],
        encoding: BatchEncoding,
    ) -> TernResult<Vec<String>> {
        match encoding {
            BatchEncoding::Array => serde_json::to_string(requests)
                .map(|line| vec![line])
                .map_err(|e| TernError::Internal(format!("encode error: {e}"))),
            BatchEncoding::Newline => requests.iter().map(|r| self.encode_request(r)).collect(),
        }
    }

    /// Decode a line received from a server.
    pub fn decode(&self, line: &str) -> TernResult<Incoming> {
        self.validate_size(line.len())?;
        let trimmed = line.trim();

        match trimmed.as_bytes().first() {
            Some(b'[') => {
                let responses: Vec<Response> = serde_json::from_str(trimmed)
                    .map_err(|e| TernError::Protocol(format!("invalid response batch: {e}")))?;
                if responses.is_empty() {
                    return Err(TernError::Protocol("empty response batch".to_string()));
                }
                Ok(Incoming::Responses(responses))
            }
            Some(b'{') => {
                let value: Value = serde_json::from_str(trimmed)
                    .map_err(|e| TernError::Protocol(format!("invalid message: {e}")))?;
                let has_id = value.get("id").is_some_and(|id| !id.is_null());
                if has_id {
                    let response: Response = serde_json::from_value(value)
                        .map_err(|e| TernError::Protocol(format!("invalid response: {e}")))?;
                    Ok(Incoming::Responses(vec![response]))
                } else if value.get("method").is_some() {
                    let notification: Notification = serde_json::from_value(value)
                        .map_err(|e| TernError::Protocol(format!("invalid notification: {e}")))?;
                    Ok(Incoming::Notification(notification))
                } else {
                    Err(TernError::Protocol("message has neither id nor method".to_string()))
                }
            }
            Some(c) => Err(TernError::Protocol(format!(
                "expected '{{' or '[', got '{}'",
                *c as char
            ))),
            None => Err(TernError::Protocol("empty line".to_string())),
        }
    }

    /// Decode a line of requests, as a server would. Returns the requests
    /// and whether they arrived as a JSON array.
    pub fn decode_requests(&self, line: &str) -> TernResult<(Vec<Request>, bool)> {
        self.validate_size(line.len())?;
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            let requests = serde_json::from_str(trimmed)
                .map_err(|e| TernError::Protocol(format!("invalid request batch: {e}")))?;
            Ok((requests, true))
        } else {
            let request = serde_json::from_str(trimmed)
                .map_err(|e| TernError::Protocol(format!("invalid request: {e}")))?;
            Ok((vec![request], false))
        }
    }

    fn validate_size(&self, size: usize) -> TernResult<()> {
        if size > self.max_line_size {
            return Err(TernError::Protocol(format!(
                "line size {size} exceeds maximum {}",
                self.max_line_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::methods;

    fn requests(n: u64) -> Vec<Request> {
        (0..n).map(|i| Request::new(i, methods::SERVER_PING, vec![])).collect()
    }

    #[test]
    fn test_encode_batch_array() {
        let codec = RpcCodec::default();
        let lines = codec.encode_batch(&requests(3), BatchEncoding::Array).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with('['));
        let (decoded, is_array) = codec.decode_requests(&lines[0]).unwrap();
        assert!(is_array);
        assert_eq!(decoded, requests(3));
    }

    #[test]
    fn test_encode_batch_newline() {
        let codec = RpcCodec::default();
        let lines = codec.encode_batch(&requests(3), BatchEncoding::Newline).unwrap();
        assert_eq!(lines.len(), 3);
        for (i, line) in lines.iter().enumerate() {
            let (decoded, is_array) = codec.decode_requests(line).unwrap();
            assert!(!is_array);
            assert_eq!(decoded[0].id, i as u64);
        }
    }

    #[test]
    fn test_decode_single_response() {
        let codec = RpcCodec::default();
        let incoming = codec.decode(r#"{"jsonrpc":"2.0","id":4,"result":"pong"}"#).unwrap();
        let Incoming::Responses(responses) = incoming else { panic!("expected responses") };
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].request_id(), Some(4));
    }

    #[test]
    fn test_decode_out_of_order_array() {
        let codec = RpcCodec::default();
        let line = json!([{"id": 2, "result": "b"}, {"id": 1, "result": "a"}]).to_string();
        let Incoming::Responses(responses) = codec.decode(&line).unwrap() else {
            panic!("expected responses")
        };
        let ids: Vec<_> = responses.iter().filter_map(Response::request_id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn test_decode_notification() {
        let codec = RpcCodec::default();
        let line = json!({"jsonrpc": "2.0", "method": methods::HEADERS_SUBSCRIBE, "params": [{"height": 1, "hex": "00"}]})
            .to_string();
        let Incoming::Notification(n) = codec.decode(&line).unwrap() else {
            panic!("expected notification")
        };
        assert_eq!(n.header().unwrap().height, 1);
    }

    #[rstest]
    #[case::empty("")]
    #[case::whitespace("   ")]
    #[case::garbage("hello")]
    #[case::truncated("{\"id\":1")]
    #[case::empty_batch("[]")]
    #[case::no_id_no_method("{\"result\":1}")]
    fn test_decode_invalid(#[case] line: &str) {
        let codec = RpcCodec::default();
        assert!(matches!(codec.decode(line), Err(TernError::Protocol(_))));
    }

    #[rstest]
    #[case::within_limit(100, 50, true)]
    #[case::at_limit(100, 100, true)]
    #[case::over_limit(100, 101, false)]
    fn test_size_validation(
        #[case] max_size: usize,
        #[case] input_size: usize,
        #[case] should_pass: bool,
    ) {
        let codec = RpcCodec::new(max_size);
        let prefix = r#"{"id":1,"result":""#;
        let suffix = r#""}"#;
        let fill = input_size - prefix.len() - suffix.len();
        let line = format!("{prefix}{}{suffix}", "a".repeat(fill));
        assert_eq!(line.len(), input_size);
        assert_eq!(codec.decode(&line).is_ok(), should_pass);
    }
}
