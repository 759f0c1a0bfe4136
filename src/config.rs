use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Public key of the service's certificate root, as embedded in official clients.
pub const DEFAULT_CERT_ROOT_KEY: &str =
    "142375574d0a587166aae71ebe516437c4a28b73e3695c6ce1f7f9545da8ee6b";

/// How a changed identity key for a known peer is treated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrustMode {
    /// Every identity is accepted; changes are only logged.
    #[default]
    Always,
    /// The first identity seen for an address is pinned; a different one is refused.
    FirstUse,
}

/// Errors while loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid certificate root key")]
    InvalidRootKey,
}

/// Engine-wide tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Websocket endpoint of the chat service.
    pub endpoint: String,
    /// Seconds before a pending request fails.
    pub request_timeout_secs: u64,
    /// Seconds allowed for the whole handshake.
    pub handshake_timeout_secs: u64,
    /// Capacity of the per-session cache of skipped message keys.
    pub max_skipped_message_keys: usize,
    /// Largest forward jump in a chain counter that will be accepted.
    pub max_future_messages: u32,
    /// Previous session states kept per address.
    pub max_archived_sessions: usize,
    /// Receiving chains kept per session.
    pub max_receiver_chains: usize,
    /// Frames buffered ahead of the writer task.
    pub outbound_queue_depth: usize,
    pub identity_trust: TrustMode,
    /// Hex Ed25519 key the server certificate chain must be rooted at.
    pub cert_root_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://web.whatsapp.com/ws/chat".into(),
            request_timeout_secs: 20,
            handshake_timeout_secs: 20,
            max_skipped_message_keys: 2000,
            max_future_messages: 2000,
            max_archived_sessions: 40,
            max_receiver_chains: 5,
            outbound_queue_depth: 64,
            identity_trust: TrustMode::Always,
            cert_root_key: DEFAULT_CERT_ROOT_KEY.into(),
        }
    }
}

impl EngineConfig {
    /// Load a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.cert_root()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Decoded certificate root key.
    pub fn cert_root(&self) -> Result<[u8; 32], ConfigError> {
        let bytes = hex::decode(&self.cert_root_key).map_err(|_| ConfigError::InvalidRootKey)?;
        bytes.try_into().map_err(|_| ConfigError::InvalidRootKey)
    }

    /// Override the websocket endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_max_skipped_message_keys(mut self, max: usize) -> Self {
        self.max_skipped_message_keys = max;
        self
    }

    pub fn with_max_future_messages(mut self, max: u32) -> Self {
        self.max_future_messages = max;
        self
    }

    pub fn with_max_archived_sessions(mut self, max: usize) -> Self {
        self.max_archived_sessions = max;
        self
    }

    pub fn with_outbound_queue_depth(mut self, depth: usize) -> Self {
        self.outbound_queue_depth = depth;
        self
    }

    pub fn with_identity_trust(mut self, mode: TrustMode) -> Self {
        self.identity_trust = mode;
        self
    }

    /// Root the certificate check at a different key; used against test servers.
    pub fn with_cert_root_key(mut self, key: &[u8; 32]) -> Self {
        self.cert_root_key = hex::encode(key);
        self
    }
}
