//! WebSocket channel with a send queue
//!
//! Outgoing frames go through an unbounded queue into a dedicated writer
//! task, so `send_*` never blocks. `buffered_amount` counts payload bytes
//! queued but not yet handed to the socket, which is what the uploader
//! throttles on.

use bytes::Bytes;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use csend_core::{SendError, SendResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code sent when a transfer ends in failure or cancellation.
pub const CLOSE_FAILED: u16 = 4000;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A frame received from the server. Pings and pongs are handled by the
/// socket and never surface here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close(Option<u16>),
}

struct Queued {
    message: Message,
    len: usize,
}

pub struct WsChannel {
    outgoing: mpsc::UnboundedSender<Queued>,
    incoming: SplitStream<WsStream>,
    buffered: Arc<AtomicUsize>,
    writer: JoinHandle<()>,
}

impl WsChannel {
    pub async fn connect(url: &str) -> SendResult<Self> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SendError::transport(format!("websocket connect to {url}: {e}")))?;
        debug!(url, "websocket connected");

        let (sink, incoming) = ws.split();
        let (outgoing, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let writer = tokio::spawn(writer_task(sink, rx, buffered.clone()));

        Ok(Self {
            outgoing,
            incoming,
            buffered,
            writer,
        })
    }

    /// Bytes queued but not yet written to the socket.
    pub fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    pub fn send_text(&self, text: String) -> SendResult<()> {
        let len = text.len();
        self.enqueue(Message::text(text), len)
    }

    pub fn send_binary(&self, data: Bytes) -> SendResult<()> {
        let len = data.len();
        self.enqueue(Message::binary(data), len)
    }

    fn enqueue(&self, message: Message, len: usize) -> SendResult<()> {
        self.buffered.fetch_add(len, Ordering::AcqRel);
        self.outgoing.send(Queued { message, len }).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            SendError::transport("websocket writer has stopped")
        })
    }

    /// Next data or close frame; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<SendResult<Frame>> {
        loop {
            let message = match self.incoming.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(SendError::transport(format!("websocket read: {e}")))),
            };
            let frame = match message {
                Message::Text(text) => Frame::Text(text.as_str().to_owned()),
                Message::Binary(data) => Frame::Binary(data),
                Message::Close(frame) => Frame::Close(frame.map(|f| u16::from(f.code))),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    /// Flush queued frames and close with `code` (1000 for a normal close).
    pub async fn close(self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: if code == u16::from(CloseCode::Normal) {
                "".into()
            } else {
                "transfer aborted".into()
            },
        };
        // a failed send just means the writer is already gone
        let _ = self.outgoing.send(Queued {
            message: Message::Close(Some(frame)),
            len: 0,
        });
        drop(self.outgoing);

        let mut writer = self.writer;
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            warn!(code, "websocket writer did not drain in time");
            writer.abort();
        }
        debug!(code, "websocket closed");
    }
}

async fn writer_task(
    mut sink: futures::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Queued>,
    buffered: Arc<AtomicUsize>,
) {
    while let Some(Queued { message, len }) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        let result = sink.send(message).await;
        buffered.fetch_sub(len, Ordering::AcqRel);
        if let Err(e) = result {
            warn!(error = %e, "websocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    // anything still queued is never written
    rx.close();
    while let Some(Queued { len, .. }) = rx.recv().await {
        buffered.fetch_sub(len, Ordering::AcqRel);
    }
}
