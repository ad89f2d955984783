use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::SendResult;

/// A lazy, single-pass sequence of byte chunks.
pub type ByteStream = BoxStream<'static, SendResult<Bytes>>;

/// Progress callback type (bytes_done, bytes_total)
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// One entry of a multi-file archive listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime: String,
}

/// Per-file listing carried inside the encrypted metadata (empty for single files)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<ManifestFile>,
}

/// Plaintext metadata descriptor, encrypted under the metadata key.
///
/// Wire form: `{"iv": b64, "name", "size", "type", "manifest"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Keychain IV (base64), needed to decrypt a whole-blob payload
    #[serde(default)]
    pub iv: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default = "default_mime")]
    pub mime: String,
    #[serde(default)]
    pub manifest: Manifest,
}

fn default_mime() -> String {
    DEFAULT_MIME_TYPE.to_string()
}

/// What the sender knows about the payload before encryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub mime: Option<String>,
    pub manifest: Manifest,
}

/// Decrypted metadata plus the server-side time-to-live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub metadata: FileMetadata,
    /// Milliseconds until the server expires the upload
    pub ttl: u64,
}

/// Successful upload acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub url: String,
    pub id: String,
    #[serde(rename = "owner")]
    pub owner_token: String,
}

/// Owner-visible info about an upload (`/api/info/<id>`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(default)]
    pub dlimit: u32,
    #[serde(default)]
    pub dtotal: u32,
    #[serde(default)]
    pub ttl: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_wire_names() {
        let meta = FileMetadata {
            iv: "AAAA".into(),
            name: "a.txt".into(),
            size: 3,
            mime: "text/plain".into(),
            manifest: Manifest::default(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "text/plain");
        assert_eq!(json["manifest"], serde_json::json!({}));
        assert!(json.get("mime").is_none());
    }

    #[test]
    fn test_metadata_defaults_when_fields_missing() {
        let meta: FileMetadata =
            serde_json::from_str(r#"{"name":"x","size":1}"#).unwrap();
        assert_eq!(meta.mime, DEFAULT_MIME_TYPE);
        assert!(meta.manifest.files.is_empty());
    }

    #[test]
    fn test_upload_ack_owner_field() {
        let ack: UploadedFile =
            serde_json::from_str(r#"{"url":"https://x/download/1/","id":"1","owner":"tok"}"#)
                .unwrap();
        assert_eq!(ack.owner_token, "tok");
    }
}
