//! HTTP client for the send server's `/api/*` endpoints

use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use csend_core::b64;
use csend_core::types::{FileInfo, RemoteMetadata};
use csend_core::{SendError, SendResult};
use csend_crypto::Keychain;

use crate::auth::{check_status, send_with_auth, transport_error};

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    metadata: String,
    #[serde(default)]
    ttl: u64,
}

/// Endpoints of one send server.
///
/// Owner operations (`delete`, `set_params`, `file_info`, `set_password`)
/// authenticate with the owner token handed out at upload time; reads of an
/// upload authenticate with the keychain.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> SendResult<Self> {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: &str, http: Client) -> SendResult<Self> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(SendError::Config(format!(
                "server URL must be http(s), got {base_url}"
            )));
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Upload socket: `ws://` for `http://` servers, `wss://` for `https://`.
    pub fn ws_url(&self) -> String {
        let rest = self
            .base_url
            .strip_prefix("https://")
            .map(|host| format!("wss://{host}"))
            .or_else(|| {
                self.base_url
                    .strip_prefix("http://")
                    .map(|host| format!("ws://{host}"))
            })
            .unwrap_or_else(|| self.base_url.clone());
        format!("{rest}/api/ws")
    }

    pub fn download_url(&self, id: &str) -> String {
        format!("{}/api/download/{id}", self.base_url)
    }

    pub(crate) fn download_request(&self, id: &str) -> RequestBuilder {
        self.http.get(self.download_url(id))
    }

    fn endpoint(&self, action: &str, id: &str) -> String {
        format!("{}/api/{action}/{id}", self.base_url)
    }

    async fn post_owner(
        &self,
        action: &str,
        id: &str,
        body: serde_json::Value,
    ) -> SendResult<bool> {
        let response = self
            .http
            .post(self.endpoint(action, id))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        debug!(action, id, status = response.status().as_u16(), "owner request");
        Ok(response.status().is_success())
    }

    /// Remove an upload. Returns whether the server accepted the request.
    pub async fn delete(&self, id: &str, owner_token: &str) -> SendResult<bool> {
        self.post_owner("delete", id, json!({ "owner_token": owner_token }))
            .await
    }

    /// Change the download limit.
    pub async fn set_params(&self, id: &str, owner_token: &str, dlimit: u32) -> SendResult<bool> {
        self.post_owner(
            "params",
            id,
            json!({ "owner_token": owner_token, "dlimit": dlimit }),
        )
        .await
    }

    pub async fn file_info(&self, id: &str, owner_token: &str) -> SendResult<FileInfo> {
        let response = self
            .http
            .post(self.endpoint("info", id))
            .json(&json!({ "owner_token": owner_token }))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response)?;
        response
            .json::<FileInfo>()
            .await
            .map_err(|e| SendError::Protocol(format!("info response: {e}")))
    }

    /// Fetch and decrypt the metadata descriptor of an upload.
    pub async fn metadata(&self, id: &str, keychain: &mut Keychain) -> SendResult<RemoteMetadata> {
        let url = self.endpoint("metadata", id);
        let response = send_with_auth(keychain, || self.http.get(&url)).await?;
        let response = check_status(response)?;
        let body: MetadataResponse = response
            .json()
            .await
            .map_err(|e| SendError::Protocol(format!("metadata response: {e}")))?;

        let ciphertext = b64::decode(&body.metadata)?;
        let metadata = keychain.decrypt_metadata(&ciphertext)?;
        debug!(id, name = %metadata.name, size = metadata.size, "metadata decrypted");
        Ok(RemoteMetadata {
            metadata,
            ttl: body.ttl,
        })
    }

    /// Register the keychain's (password-derived) auth key as the upload's
    /// new verifier.
    pub async fn set_password(
        &self,
        id: &str,
        owner_token: &str,
        keychain: &Keychain,
    ) -> SendResult<bool> {
        self.post_owner(
            "password",
            id,
            json!({ "owner_token": owner_token, "auth": keychain.auth_key_b64() }),
        )
        .await
    }
}
