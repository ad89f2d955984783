//! WebSocket upload of an encrypted record stream
//!
//! Wire sequence:
//! 1. text `{"fileMetadata": <b64>, "authorization": "send-v1 <verifier>"}`
//! 2. one binary frame per header/record chunk
//! 3. binary `[0x00]` terminator
//! 4. server replies with one text frame, `{url, id, owner}` or `{error}`

use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use csend_core::b64;
use csend_core::types::{ProgressFn, UploadedFile};
use csend_core::{ByteStream, SendError, SendResult};
use csend_crypto::{Keychain, StreamInfo, AUTH_SCHEME};

use crate::channel::{Frame, WsChannel, CLOSE_FAILED};
use crate::session::TransferSession;

const CLOSE_NORMAL: u16 = 1000;
const TERMINATOR: &[u8] = &[0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    HandshakeSent,
    Streaming,
    AwaitingServerAck,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadState::Idle => "idle",
            UploadState::HandshakeSent => "handshake-sent",
            UploadState::Streaming => "streaming",
            UploadState::AwaitingServerAck => "awaiting-ack",
            UploadState::Completed => "completed",
            UploadState::Failed => "failed",
            UploadState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServerReply {
    Error { error: serde_json::Value },
    Uploaded(UploadedFile),
}

struct Machine {
    state: UploadState,
}

impl Machine {
    fn enter(&mut self, next: UploadState) {
        debug!(from = %self.state, to = %next, "upload state");
        self.state = next;
    }
}

/// Streams one encrypted payload to the server's upload socket.
#[derive(Debug, Clone)]
pub struct TransferUploader {
    ws_url: String,
    poll_interval: Duration,
}

impl TransferUploader {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Sleep between buffered-amount checks while the socket is backed up.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Upload `records` (the output of the record cipher) together with the
    /// encrypted metadata blob.
    ///
    /// The channel is closed on every exit: normally on success, with code
    /// 4000 on failure or cancellation. `info` and any error are also
    /// recorded on `session`.
    pub async fn upload(
        &self,
        keychain: &Keychain,
        encrypted_metadata: &[u8],
        records: ByteStream,
        info: StreamInfo,
        session: &TransferSession,
        progress: Option<&ProgressFn>,
    ) -> SendResult<UploadedFile> {
        let mut machine = Machine {
            state: UploadState::Idle,
        };
        session.set_stream_info(info);

        let connected = tokio::select! {
            biased;
            _ = session.cancelled() => Err(SendError::Cancelled),
            channel = WsChannel::connect(&self.ws_url) => channel,
        };
        let mut channel = match connected {
            Ok(channel) => channel,
            Err(e) => {
                machine.enter(if e.is_cancelled() {
                    UploadState::Cancelled
                } else {
                    UploadState::Failed
                });
                session.record_error(&e);
                return Err(e);
            }
        };

        let result = self
            .run(
                &mut machine,
                &mut channel,
                keychain,
                encrypted_metadata,
                records,
                info,
                session,
                progress,
            )
            .await;

        match &result {
            Ok(uploaded) => {
                machine.enter(UploadState::Completed);
                channel.close(CLOSE_NORMAL).await;
                info!(id = %uploaded.id, size = ?info.plaintext_size, "upload complete");
            }
            Err(e) => {
                machine.enter(if e.is_cancelled() {
                    UploadState::Cancelled
                } else {
                    UploadState::Failed
                });
                warn!(error = %e, "upload aborted");
                session.record_error(e);
                channel.close(CLOSE_FAILED).await;
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        machine: &mut Machine,
        channel: &mut WsChannel,
        keychain: &Keychain,
        encrypted_metadata: &[u8],
        mut records: ByteStream,
        info: StreamInfo,
        session: &TransferSession,
        progress: Option<&ProgressFn>,
    ) -> SendResult<UploadedFile> {
        let header = serde_json::json!({
            "fileMetadata": b64::encode(encrypted_metadata),
            "authorization": format!("{AUTH_SCHEME} {}", keychain.auth_key_b64()),
        });
        channel.send_text(header.to_string())?;
        machine.enter(UploadState::HandshakeSent);

        let threshold = info.record_size as usize * 2;
        let total = info.encrypted_size.unwrap_or(0);
        let mut sent: u64 = 0;
        let mut count: u64 = 0;

        machine.enter(UploadState::Streaming);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = session.cancelled() => return Err(SendError::Cancelled),
                frame = channel.recv() => return Err(early_reply(frame)),
                chunk = records.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            sent += chunk.len() as u64;
            count += 1;
            channel.send_binary(chunk)?;
            if let Some(progress) = progress {
                progress(sent, total.max(sent));
            }

            while channel.buffered_amount() > threshold {
                tokio::select! {
                    biased;
                    _ = session.cancelled() => return Err(SendError::Cancelled),
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        if session.is_cancelled() {
            return Err(SendError::Cancelled);
        }
        channel.send_binary(Bytes::from_static(TERMINATOR))?;
        debug!(records = count, bytes = sent, "payload sent");
        machine.enter(UploadState::AwaitingServerAck);

        tokio::select! {
            biased;
            _ = session.cancelled() => Err(SendError::Cancelled),
            frame = channel.recv() => parse_reply(frame),
        }
    }
}

fn parse_reply(frame: Option<SendResult<Frame>>) -> SendResult<UploadedFile> {
    match frame {
        Some(Ok(Frame::Text(text))) => match serde_json::from_str::<ServerReply>(&text) {
            Ok(ServerReply::Uploaded(uploaded)) => Ok(uploaded),
            Ok(ServerReply::Error { error }) => {
                Err(SendError::Protocol(format!("server rejected upload: {error}")))
            }
            Err(e) => Err(SendError::Protocol(format!("malformed upload response: {e}"))),
        },
        Some(Ok(Frame::Binary(_))) => Err(SendError::Protocol(
            "unexpected binary frame in place of upload response".into(),
        )),
        Some(Ok(Frame::Close(code))) => Err(SendError::transport(format!(
            "server closed the upload socket (code {})",
            code.map(|c| c.to_string()).unwrap_or_else(|| "none".into())
        ))),
        Some(Err(e)) => Err(e),
        None => Err(SendError::transport(
            "upload socket closed before the server responded",
        )),
    }
}

/// A reply before the terminator has gone out is never a success.
fn early_reply(frame: Option<SendResult<Frame>>) -> SendError {
    match parse_reply(frame) {
        Ok(_) => SendError::Protocol("server acknowledged before the upload finished".into()),
        Err(e) => e,
    }
}
