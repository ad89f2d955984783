use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{SendError, SendResult};

/// Default record size for the streaming cipher (64 KiB)
pub const DEFAULT_RECORD_SIZE: u32 = 64 * 1024;

/// Default slicer chunk size when reading plaintext sources (64 KiB)
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// PBKDF2 rounds used by deployed clients for password-derived auth keys
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100;

/// Top-level client configuration (loaded from csend.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    pub server: ServerConfig,
    pub transfer: TransferConfig,
    pub crypto: CryptoConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the send service (http/https; the upload socket uses ws/wss)
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Record size `rs` of the streaming cipher, in bytes (>= 18)
    pub record_size: u32,
    /// Chunk size used when slicing local files
    pub read_chunk_size: usize,
    /// How long the uploader sleeps while the socket buffer is over its threshold
    pub backpressure_poll_ms: u64,
    /// Download strategy: "stream" or "buffered"
    pub download_strategy: DownloadStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStrategy {
    /// Decrypt records as the response body arrives
    #[default]
    Stream,
    /// Accumulate the body with progress reporting, then decrypt
    Buffered,
}

/// Key-derivation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2-HMAC-SHA256 iterations for password-protected links
    pub pbkdf2_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1443".into(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            record_size: DEFAULT_RECORD_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            backpressure_poll_ms: 10,
            download_strategy: DownloadStrategy::Stream,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl SendConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> SendResult<Self> {
        let config: SendConfig =
            toml::from_str(content).map_err(|e| SendError::Config(format!("parsing config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> SendResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml(&content)
        } else {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> SendResult<()> {
        if self.transfer.record_size < 18 {
            return Err(SendError::Config(format!(
                "transfer.record_size must be at least 18 bytes, got {}",
                self.transfer.record_size
            )));
        }
        if self.crypto.pbkdf2_iterations == 0 {
            return Err(SendError::Config(
                "crypto.pbkdf2_iterations must be at least 1".into(),
            ));
        }
        if !(self.server.base_url.starts_with("http://")
            || self.server.base_url.starts_with("https://"))
        {
            return Err(SendError::Config(format!(
                "server.base_url must be an http(s) URL, got {}",
                self.server.base_url
            )));
        }
        Ok(())
    }
}
