use thiserror::Error;

pub type SendResult<T> = Result<T, SendError>;

#[derive(Debug, Error)]
pub enum SendError {
    /// The server rejected our credential and the one permitted retry did not help.
    #[error("authentication failed")]
    AuthenticationFailure,

    /// A record failed its AEAD check or carried a malformed delimiter/header.
    #[error("stream integrity error: {0}")]
    StreamIntegrity(String),

    /// Whole-blob AES-GCM decryption failed.
    #[error("authentication tag mismatch")]
    TagMismatch,

    /// The caller cancelled the transfer.
    #[error("operation cancelled")]
    Cancelled,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transport error{}: {message}", fmt_status(.status))]
    Transport {
        status: Option<u16>,
        message: String,
    },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

impl SendError {
    pub fn transport(message: impl Into<String>) -> Self {
        SendError::Transport {
            status: None,
            message: message.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        SendError::Transport {
            status: Some(status),
            message: "unexpected response status".into(),
        }
    }

    /// True for caller-initiated cancellation, which UIs usually don't report as an error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SendError::Cancelled)
    }
}
