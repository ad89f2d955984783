use secrecy::SecretString;
use tracing::info;

use csend_core::config::{
    DownloadStrategy, SendConfig, DEFAULT_PBKDF2_ITERATIONS, DEFAULT_RECORD_SIZE,
};
use csend_core::types::{FileMetadata, ProgressFn};
use csend_core::{ByteStream, SendError, SendResult};
use csend_crypto::Keychain;

use crate::api::ApiClient;
use crate::download::TransferDownloader;
use crate::link::ShareLink;
use crate::session::TransferSession;

/// Downloads and decrypts from share links. The server is whichever host
/// the link points at.
pub struct FileReceiver {
    http: reqwest::Client,
    record_size: u32,
    pbkdf2_iterations: u32,
    progress: Option<ProgressFn>,
}

impl Default for FileReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl FileReceiver {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            record_size: DEFAULT_RECORD_SIZE,
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            progress: None,
        }
    }

    pub fn from_config(config: &SendConfig) -> Self {
        let mut receiver = Self::new();
        receiver.record_size = config.transfer.record_size;
        receiver.pbkdf2_iterations = config.crypto.pbkdf2_iterations;
        receiver
    }

    pub fn with_record_size(mut self, record_size: u32) -> Self {
        self.record_size = record_size;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// API client for the link's server.
    pub fn api_for(&self, link: &ShareLink) -> SendResult<ApiClient> {
        ApiClient::with_client(link.origin(), self.http.clone())
    }

    /// Fetch and decrypt metadata, then return the plaintext stream.
    ///
    /// The stream is lazy: records are authenticated as they are pulled, and
    /// a tampered or truncated payload surfaces as an error from the stream.
    /// Cancelling `session` stops the download, including a stream already
    /// handed back.
    pub async fn receive(
        &self,
        link: &ShareLink,
        password: Option<&SecretString>,
        strategy: DownloadStrategy,
        session: &TransferSession,
    ) -> SendResult<(FileMetadata, ByteStream)> {
        self.receive_inner(link, password, strategy, session)
            .await
            .inspect_err(|e| session.record_error(e))
    }

    async fn receive_inner(
        &self,
        link: &ShareLink,
        password: Option<&SecretString>,
        strategy: DownloadStrategy,
        session: &TransferSession,
    ) -> SendResult<(FileMetadata, ByteStream)> {
        let api = self.api_for(link)?;
        let mut keychain = Keychain::new(Some(&link.secret_b64), None, None)?
            .with_record_size(self.record_size)
            .with_pbkdf2_iterations(self.pbkdf2_iterations);
        if let Some(password) = password {
            keychain.set_password(password, &link.url)?;
        }

        let remote = tokio::select! {
            biased;
            _ = session.cancelled() => return Err(SendError::Cancelled),
            remote = api.metadata(&link.id, &mut keychain) => remote?,
        };
        if !remote.metadata.iv.is_empty() {
            keychain.set_iv(&remote.metadata.iv)?;
        }
        info!(
            id = %link.id,
            name = %remote.metadata.name,
            size = remote.metadata.size,
            ttl_ms = remote.ttl,
            "receiving"
        );

        let downloader = TransferDownloader::new(api);
        let ciphertext = downloader
            .download(
                &link.id,
                &mut keychain,
                session,
                strategy,
                self.progress.as_ref(),
            )
            .await?;

        Ok((remote.metadata, keychain.decrypt_stream(ciphertext)))
    }
}
