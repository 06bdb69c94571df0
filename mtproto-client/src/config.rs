//! Client configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mtproto_core::{DcOption, MtprotoError, MtprotoResult, RsaPublicKey};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address, `ip:port`.
    pub server_addr: String,
    /// Datacenter the address belongs to.
    pub dc_id: i32,
    /// Application API ID.
    pub api_id: i32,
    /// Application API hash.
    pub api_hash: String,
    /// Trusted server keys, PEM-encoded.
    pub public_keys_pem: Vec<String>,
    /// Largest frame accepted from the server, in bytes.
    pub max_frame_size: usize,
    /// Depth of the command, frame and event queues.
    pub queue_capacity: usize,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "149.154.167.50:443".to_string(),
            dc_id: 2,
            api_id: 0,
            api_hash: String::new(),
            public_keys_pem: Vec::new(),
            max_frame_size: 1024 * 1024, // 1MB
            queue_capacity: 64,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    /// Create a new config with custom server address.
    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self {
            server_addr: addr.into(),
            ..Default::default()
        }
    }

    /// Load from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> MtprotoResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| MtprotoError::Config(format!("invalid client config: {}", e)))
    }

    /// Trust an additional server key.
    pub fn with_public_key(mut self, pem: impl Into<String>) -> Self {
        self.public_keys_pem.push(pem.into());
        self
    }

    /// Set application credentials.
    pub fn with_api(mut self, api_id: i32, api_hash: impl Into<String>) -> Self {
        self.api_id = api_id;
        self.api_hash = api_hash.into();
        self
    }

    pub fn with_dc(mut self, dc_id: i32) -> Self {
        self.dc_id = dc_id;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Parse every configured key.
    pub fn public_keys(&self) -> MtprotoResult<Vec<RsaPublicKey>> {
        self.public_keys_pem
            .iter()
            .map(|pem| RsaPublicKey::from_pem(pem))
            .collect()
    }

    /// The configured server as a datacenter entry, if the address is a
    /// literal socket address.
    pub fn dc_option(&self) -> Option<DcOption> {
        let addr: SocketAddr = self.server_addr.parse().ok()?;
        Some(DcOption::new(self.dc_id, addr.ip().to_string(), addr.port()))
    }

    pub fn validate(&self) -> MtprotoResult<()> {
        if self.server_addr.is_empty() {
            return Err(MtprotoError::Config("server address is empty".to_string()));
        }
        if self.public_keys_pem.is_empty() {
            return Err(MtprotoError::Config("no server public key configured".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(MtprotoError::Config("queue capacity must be positive".to_string()));
        }
        if self.max_frame_size == 0 {
            return Err(MtprotoError::Config("max frame size must be positive".to_string()));
        }
        self.public_keys().map(|_| ())
    }
}
