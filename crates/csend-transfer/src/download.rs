//! Authenticated download of an encrypted payload

use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};
use reqwest::Response;
use tracing::debug;

use csend_core::config::DownloadStrategy;
use csend_core::types::ProgressFn;
use csend_core::{ByteStream, SendError, SendResult};
use csend_crypto::Keychain;

use crate::api::ApiClient;
use crate::auth::{check_download_status, send_with_auth, transport_error};
use crate::session::TransferSession;

/// Fetches `/api/download/<id>` for one server.
#[derive(Debug, Clone)]
pub struct TransferDownloader {
    api: ApiClient,
}

impl TransferDownloader {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    async fn request(
        &self,
        id: &str,
        keychain: &mut Keychain,
        session: &TransferSession,
    ) -> SendResult<Response> {
        let response = tokio::select! {
            biased;
            _ = session.cancelled() => return Err(SendError::Cancelled),
            response = send_with_auth(keychain, || self.api.download_request(id)) => response?,
        };
        check_download_status(response)
    }

    /// The encrypted body as it arrives.
    ///
    /// Once the session is cancelled the stream yields `Cancelled` and ends.
    pub async fn download_stream(
        &self,
        id: &str,
        keychain: &mut Keychain,
        session: &TransferSession,
    ) -> SendResult<ByteStream> {
        let response = self.request(id, keychain, session).await?;
        debug!(id, length = ?response.content_length(), "download started");

        let body = response.bytes_stream();
        let token = session.token();
        let output = stream::unfold(Some((body, token)), |state| async move {
            let (mut body, token) = state?;
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => Some(Err(SendError::Cancelled)),
                chunk = body.next() => chunk.map(|c| c.map_err(transport_error)),
            }?;
            let next = item.is_ok().then_some((body, token));
            Some((item, next))
        });
        Ok(output.boxed())
    }

    /// The whole encrypted body, with progress.
    ///
    /// Reports `(0, 1)` before the request, then `(loaded, total)` per chunk
    /// when the server sent a length.
    pub async fn download_buffered(
        &self,
        id: &str,
        keychain: &mut Keychain,
        session: &TransferSession,
        progress: Option<&ProgressFn>,
    ) -> SendResult<Bytes> {
        if let Some(progress) = progress {
            progress(0, 1);
        }
        let response = self.request(id, keychain, session).await?;
        let total = response.content_length();
        debug!(id, length = ?total, "buffered download started");

        let mut body = response.bytes_stream();
        let mut buf = BytesMut::with_capacity(total.unwrap_or(0).min(64 << 20) as usize);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = session.cancelled() => return Err(SendError::Cancelled),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            buf.extend_from_slice(&chunk.map_err(transport_error)?);
            if let (Some(progress), Some(total)) = (progress, total) {
                progress(buf.len() as u64, total);
            }
        }
        Ok(buf.freeze())
    }

    /// Encrypted body per `strategy`, always as a stream.
    pub async fn download(
        &self,
        id: &str,
        keychain: &mut Keychain,
        session: &TransferSession,
        strategy: DownloadStrategy,
        progress: Option<&ProgressFn>,
    ) -> SendResult<ByteStream> {
        match strategy {
            DownloadStrategy::Stream => self.download_stream(id, keychain, session).await,
            DownloadStrategy::Buffered => {
                let body = self
                    .download_buffered(id, keychain, session, progress)
                    .await?;
                Ok(stream::once(async move { Ok(body) }).boxed())
            }
        }
    }
}
