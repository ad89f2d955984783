use secrecy::SecretString;
use std::time::Duration;
use tracing::info;

use csend_chunks::Archive;
use csend_core::config::{
    SendConfig, DEFAULT_PBKDF2_ITERATIONS, DEFAULT_READ_CHUNK_SIZE, DEFAULT_RECORD_SIZE,
};
use csend_core::types::ProgressFn;
use csend_core::{SendError, SendResult};
use csend_crypto::Keychain;

use crate::api::ApiClient;
use crate::link::ShareLink;
use crate::session::TransferSession;
use crate::upload::TransferUploader;

/// Everything the sender needs to keep after a successful upload.
#[derive(Debug, Clone)]
pub struct SentFile {
    pub link: ShareLink,
    pub id: String,
    pub owner_token: String,
    /// Root secret, base64 (also the fragment of `link`)
    pub secret_b64: String,
}

/// Encrypts and uploads archives to one server.
pub struct FileSender {
    api: ApiClient,
    record_size: u32,
    read_chunk_size: usize,
    pbkdf2_iterations: u32,
    poll_interval: Duration,
    progress: Option<ProgressFn>,
}

impl FileSender {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            record_size: DEFAULT_RECORD_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            poll_interval: Duration::from_millis(10),
            progress: None,
        }
    }

    pub fn from_config(config: &SendConfig) -> SendResult<Self> {
        let mut sender = Self::new(ApiClient::new(&config.server.base_url)?);
        sender.record_size = config.transfer.record_size;
        sender.read_chunk_size = config.transfer.read_chunk_size;
        sender.pbkdf2_iterations = config.crypto.pbkdf2_iterations;
        sender.poll_interval = Duration::from_millis(config.transfer.backpressure_poll_ms);
        Ok(sender)
    }

    pub fn with_record_size(mut self, record_size: u32) -> Self {
        self.record_size = record_size;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Encrypt `archive` under a fresh keychain, upload it, and optionally
    /// protect the link with `password`.
    ///
    /// `session` belongs to this one transfer: cancel it (or a clone) to stop
    /// the upload. A failure is also recorded on it.
    pub async fn send(
        &self,
        archive: &Archive,
        password: Option<&SecretString>,
        session: &TransferSession,
    ) -> SendResult<SentFile> {
        self.send_inner(archive, password, session)
            .await
            .inspect_err(|e| session.record_error(e))
    }

    async fn send_inner(
        &self,
        archive: &Archive,
        password: Option<&SecretString>,
        session: &TransferSession,
    ) -> SendResult<SentFile> {
        let mut keychain = Keychain::generate()?
            .with_record_size(self.record_size)
            .with_pbkdf2_iterations(self.pbkdf2_iterations);

        let metadata = keychain.encrypt_metadata(&archive.descriptor())?;
        let plaintext = archive.stream(self.read_chunk_size);
        let (records, stream_info) = keychain.encrypt_stream(plaintext, archive.size())?;

        let uploader =
            TransferUploader::new(self.api.ws_url()).with_poll_interval(self.poll_interval);
        let uploaded = uploader
            .upload(
                &keychain,
                &metadata,
                records,
                stream_info,
                session,
                self.progress.as_ref(),
            )
            .await?;

        let link = ShareLink::new(&uploaded.url, &keychain.secret_b64())?;

        if let Some(password) = password {
            keychain.set_password(password, &link.url)?;
            let accepted = self
                .api
                .set_password(&uploaded.id, &uploaded.owner_token, &keychain)
                .await?;
            if !accepted {
                return Err(SendError::transport("server refused the password"));
            }
            info!(id = %uploaded.id, "password set");
        }

        Ok(SentFile {
            link,
            id: uploaded.id,
            owner_token: uploaded.owner_token,
            secret_b64: keychain.secret_b64(),
        })
    }
}
