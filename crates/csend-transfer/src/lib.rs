//! csend-transfer: moving encrypted payloads to and from a send server
//!
//! # Overview
//! - `auth`: `send-v1` challenge/response with a single retry on a fresh nonce
//! - `api`: owner and metadata endpoints (`/api/*`)
//! - `channel`: WebSocket with a writer task and a buffered-bytes counter
//! - `upload`: header → records → terminator → acknowledgement
//! - `download`: authenticated fetch, streamed or buffered
//! - `link`: share links (`<url>#<secret>`)
//! - `sender` / `receiver`: end-to-end send and receive of an `Archive`

pub mod api;
pub mod auth;
pub mod channel;
pub mod download;
pub mod link;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod upload;

pub use api::ApiClient;
pub use auth::{check_status, parse_nonce, send_with_auth};
pub use download::TransferDownloader;
pub use link::ShareLink;
pub use receiver::FileReceiver;
pub use sender::{FileSender, SentFile};
pub use session::TransferSession;
pub use upload::{TransferUploader, UploadState};
