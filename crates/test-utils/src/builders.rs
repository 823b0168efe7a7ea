//! Raw line and configuration builders.

use std::fmt::Write as _;

use serde_json::{Value, json};

/// Builder for raw Electrum request lines.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use tern_test_utils::RequestBuilder;
///
/// let line = RequestBuilder::new("blockchain.scripthash.get_history")
///     .with_params(json!(["8b01df4e368ea28f8dc0423bcf7a4923e3a12d307c875e47a0cfbf90b5c39161"]))
///     .with_id(2)
///     .build();
/// assert!(line.contains("get_history"));
/// ```
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: String,
    params: Value,
    id: Value,
}

impl RequestBuilder {
    /// Create a request for `method` with id 1 and no params.
    pub fn new(method: &str) -> Self {
        Self { method: method.to_string(), params: json!([]), id: json!(1) }
    }

    /// Set the params.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Set the id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = id.into();
        self
    }

    /// Build the line.
    pub fn build(self) -> String {
        json!({"jsonrpc": "2.0", "id": self.id, "method": self.method, "params": self.params})
            .to_string()
    }
}

/// Builder for raw Electrum response lines.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use tern_test_utils::ResponseBuilder;
///
/// let ok = ResponseBuilder::success(1, json!(null)).build();
/// assert!(ok.contains("result"));
/// let err = ResponseBuilder::error(2, 2, "missing transaction").build();
/// assert!(err.contains("missing transaction"));
/// ```
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    id: Value,
    result: Option<Value>,
    error: Option<(i64, String)>,
}

impl ResponseBuilder {
    /// A success response.
    pub fn success(id: impl Into<Value>, result: Value) -> Self {
        Self { id: id.into(), result: Some(result), error: None }
    }

    /// An error response.
    pub fn error(id: impl Into<Value>, code: i64, message: &str) -> Self {
        Self { id: id.into(), result: None, error: Some((code, message.to_string())) }
    }

    /// Build the line.
    pub fn build(self) -> String {
        let mut obj = json!({"jsonrpc": "2.0", "id": self.id});
        if let Some(result) = self.result {
            obj["result"] = result;
        }
        if let Some((code, message)) = self.error {
            obj["error"] = json!({"code": code, "message": message});
        }
        obj.to_string()
    }
}

/// Builder for `tern.toml` snippets.
///
/// # Example
///
/// ```
/// use tern_test_utils::TestConfigBuilder;
///
/// let toml = TestConfigBuilder::new()
///     .with_network("regtest")
///     .with_server("127.0.0.1", 50001, false)
///     .with_pool_size(2, 3)
///     .build_toml();
/// assert!(toml.contains("regtest"));
/// assert!(toml.contains("[[servers]]"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TestConfigBuilder {
    network: Option<String>,
    servers: Vec<(String, u16, bool)>,
    pool: Option<(usize, usize)>,
    connect_timeout_ms: Option<u64>,
    cache_ttl_secs: Option<u64>,
}

impl TestConfigBuilder {
    /// Start an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the network.
    #[must_use]
    pub fn with_network(mut self, network: &str) -> Self {
        self.network = Some(network.to_string());
        self
    }

    /// Add a server override.
    #[must_use]
    pub fn with_server(mut self, host: &str, port: u16, tls: bool) -> Self {
        self.servers.push((host.to_string(), port, tls));
        self
    }

    /// Set pool bounds.
    #[must_use]
    pub const fn with_pool_size(mut self, min: usize, max: usize) -> Self {
        self.pool = Some((min, max));
        self
    }

    /// Set the connect budget.
    #[must_use]
    pub const fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    /// Set the facade cache TTL.
    #[must_use]
    pub const fn with_cache_ttl_secs(mut self, secs: u64) -> Self {
        self.cache_ttl_secs = Some(secs);
        self
    }

    /// Render TOML.
    pub fn build_toml(self) -> String {
        let mut toml = String::new();
        if let Some(network) = &self.network {
            let _ = writeln!(toml, "network = \"{network}\"\n");
        }
        for (host, port, tls) in &self.servers {
            let _ = writeln!(toml, "[[servers]]\nhost = \"{host}\"\nport = {port}\ntls = {tls}\n");
        }
        if let Some(ms) = self.connect_timeout_ms {
            let _ = writeln!(toml, "[client]\nconnect_timeout_ms = {ms}\n");
        }
        if let Some((min, max)) = self.pool {
            let _ = writeln!(toml, "[pool]\nmin_workers = {min}\nmax_workers = {max}\n");
        }
        if let Some(secs) = self.cache_ttl_secs {
            let _ = writeln!(toml, "[service]\ncache_ttl_secs = {secs}\n");
        }
        toml
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::success(ResponseBuilder::success(1, json!(5)), "result")]
    #[case::error(ResponseBuilder::error(1, -32601, "unknown method"), "unknown method")]
    fn test_response_builder(#[case] builder: ResponseBuilder, #[case] needle: &str) {
        let line = builder.build();
        assert!(line.contains(needle));
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], 1);
    }

    #[test]
    fn test_request_builder_parses() {
        let line = RequestBuilder::new("server.ping").with_id(9).build();
        let codec = tern_rpc::RpcCodec::default();
        let (requests, is_array) = codec.decode_requests(&line).unwrap();
        assert!(!is_array);
        assert_eq!(requests[0].id, 9);
    }
}
