use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use csend_core::SendError;
use csend_crypto::StreamInfo;

#[derive(Debug, Default)]
struct Outcome {
    first_error: Option<String>,
    stream_info: Option<StreamInfo>,
}

/// State of one transfer: its cancellation token, the first error it hit,
/// and (for uploads) the negotiated stream sizes.
///
/// Create one per `send`/`receive`. Clones observe the same state, so a
/// clone can be handed to another task to cancel the transfer. A cancelled
/// session stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct TransferSession {
    token: CancellationToken,
    outcome: Arc<Mutex<Outcome>>,
}

impl TransferSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call any number of times from any task.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!("transfer cancellation requested");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Message of the first error the transfer settled with, if any.
    pub fn first_error(&self) -> Option<String> {
        self.lock().first_error.clone()
    }

    /// Sizes negotiated by the record cipher, once an upload has started.
    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.lock().stream_info
    }

    /// Keeps only the first error; later ones are usually fallout from it.
    pub(crate) fn record_error(&self, err: &SendError) {
        let mut outcome = self.lock();
        if outcome.first_error.is_none() {
            outcome.first_error = Some(err.to_string());
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub(crate) fn set_stream_info(&self, info: StreamInfo) {
        self.lock().stream_info = Some(info);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Outcome> {
        self.outcome.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
