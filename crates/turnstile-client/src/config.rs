// Configuration for the HTTP store client

/// Configuration for [`HttpStore`](crate::HttpStore).
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Server addresses (e.g. ["http://127.0.0.1:8500"])
    pub server_addrs: Vec<String>,
    /// Connection timeout in milliseconds (default: 5000)
    pub connect_timeout_ms: u64,
    /// Read timeout in milliseconds (default: 30000). Blocking reads widen
    /// this per request by their wait time.
    pub read_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            server_addrs: vec!["http://127.0.0.1:8500".to_string()],
            connect_timeout_ms: 5000,
            read_timeout_ms: 30000,
        }
    }
}

impl StoreConfig {
    /// Create a new config with a single server address
    pub fn new(server_addr: &str) -> Self {
        Self {
            server_addrs: vec![server_addr.to_string()],
            ..Default::default()
        }
    }

    /// Create a config with multiple server addresses
    pub fn with_servers(server_addrs: Vec<String>) -> Self {
        Self {
            server_addrs,
            ..Default::default()
        }
    }

    /// Set timeouts
    pub fn with_timeouts(mut self, connect_ms: u64, read_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.read_timeout_ms = read_ms;
        self
    }
}
