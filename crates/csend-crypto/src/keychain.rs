//! Per-transfer key material and the operations built on it

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::SecretString;
use sha2::Sha256;
use zeroize::Zeroizing;

use csend_core::b64;
use csend_core::config::{DEFAULT_PBKDF2_ITERATIONS, DEFAULT_RECORD_SIZE};
use csend_core::types::{FileDescriptor, FileMetadata, DEFAULT_MIME_TYPE};
use csend_core::{ByteStream, SendError, SendResult};

use crate::ece::{self, EncodeOptions, StreamInfo};
use crate::kdf::{derive_keys, derive_password_key, AesKey, AuthKey};
use crate::{IV_SIZE, SECRET_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// Challenge value assumed before the server has issued one.
pub const DEFAULT_NONCE: &str = "yRCdyQ1EMSA3mo4rqSkuNQ==";

/// Prefix of every credential we present.
pub const AUTH_SCHEME: &str = "send-v1";

/// Root secret, IV, derived keys and the server's current challenge.
///
/// One per logical transfer. Everything but the nonce is fixed after
/// construction, except that the auth key may be replaced by a
/// password-derived or imported one.
pub struct Keychain {
    secret: Zeroizing<Vec<u8>>,
    iv: [u8; IV_SIZE],
    encrypt_key: AesKey,
    meta_key: AesKey,
    auth_key: AuthKey,
    nonce: String,
    record_size: u32,
    pbkdf2_iterations: u32,
}

impl std::fmt::Debug for Keychain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keychain")
            .field("secret", &"[REDACTED]")
            .field("iv", &b64::encode(&self.iv))
            .field("nonce", &self.nonce)
            .field("record_size", &self.record_size)
            .finish()
    }
}

impl Keychain {
    /// Fresh random secret and IV (sender side).
    pub fn generate() -> SendResult<Self> {
        Self::new(None, None, None)
    }

    /// Rebuild from base64 parts; missing parts are randomized / defaulted.
    pub fn new(
        secret_b64: Option<&str>,
        nonce: Option<&str>,
        iv_b64: Option<&str>,
    ) -> SendResult<Self> {
        let secret = match secret_b64 {
            Some(s) => b64::decode(s)?,
            None => {
                let mut secret = vec![0u8; SECRET_SIZE];
                rand::thread_rng().fill_bytes(&mut secret);
                secret
            }
        };
        if secret.is_empty() {
            return Err(SendError::Crypto("root secret is empty".into()));
        }

        let iv = match iv_b64 {
            Some(s) => decode_iv(s)?,
            None => {
                let mut iv = [0u8; IV_SIZE];
                rand::thread_rng().fill_bytes(&mut iv);
                iv
            }
        };

        Self::from_parts(secret, iv, nonce.unwrap_or(DEFAULT_NONCE))
    }

    pub fn from_parts(secret: Vec<u8>, iv: [u8; IV_SIZE], nonce: &str) -> SendResult<Self> {
        let secret = Zeroizing::new(secret);
        let keys = derive_keys(&secret)?;
        Ok(Self {
            secret,
            iv,
            encrypt_key: keys.encrypt_key,
            meta_key: keys.meta_key,
            auth_key: keys.auth_key,
            nonce: nonce.to_string(),
            record_size: DEFAULT_RECORD_SIZE,
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
        })
    }

    /// Record size used by `encrypt_stream` / `decrypt_stream`.
    pub fn with_record_size(mut self, record_size: u32) -> Self {
        self.record_size = record_size;
        self
    }

    pub fn with_pbkdf2_iterations(mut self, iterations: u32) -> Self {
        self.pbkdf2_iterations = iterations;
        self
    }

    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    pub fn secret_b64(&self) -> String {
        b64::encode(&self.secret)
    }

    pub fn iv_b64(&self) -> String {
        b64::encode(&self.iv)
    }

    pub fn set_iv(&mut self, iv_b64: &str) -> SendResult<()> {
        self.iv = decode_iv(iv_b64)?;
        Ok(())
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Adopt a challenge from the server. Empty or unchanged values are
    /// ignored; returns whether the nonce moved.
    pub fn set_nonce(&mut self, nonce: &str) -> bool {
        if nonce.is_empty() || nonce == self.nonce {
            return false;
        }
        self.nonce = nonce.to_string();
        true
    }

    /// Replace the auth key with one stretched from `password`, salted by
    /// `context` (the share URL).
    pub fn set_password(&mut self, password: &SecretString, context: &str) -> SendResult<()> {
        self.auth_key = derive_password_key(password, context, self.pbkdf2_iterations)?;
        Ok(())
    }

    /// Import a raw auth key, bypassing derivation.
    pub fn set_auth_key(&mut self, raw: Vec<u8>) -> SendResult<()> {
        if raw.is_empty() {
            return Err(SendError::Crypto("auth key is empty".into()));
        }
        self.auth_key = AuthKey::from_bytes(raw);
        Ok(())
    }

    pub fn set_auth_key_b64(&mut self, auth_b64: &str) -> SendResult<()> {
        self.set_auth_key(b64::decode(auth_b64)?)
    }

    /// Raw auth key, base64. Registered with the server as the upload
    /// verifier or a new password.
    pub fn auth_key_b64(&self) -> String {
        b64::encode(self.auth_key.as_bytes())
    }

    /// `send-v1 <b64(HMAC-SHA256(auth_key, nonce))>`
    pub fn auth_header(&self, nonce: &str) -> SendResult<String> {
        let challenge = b64::decode(nonce)?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.auth_key.as_bytes())
            .map_err(|e| SendError::Crypto(format!("HMAC key rejected: {e}")))?;
        mac.update(&challenge);
        let sig = mac.finalize().into_bytes();
        Ok(format!("{AUTH_SCHEME} {}", b64::encode(&sig)))
    }

    /// Credential over the keychain's current nonce.
    pub fn current_auth_header(&self) -> SendResult<String> {
        self.auth_header(&self.nonce)
    }

    /// Whole-blob AES-128-GCM under the encryption key and the keychain IV.
    pub fn encrypt_payload(&self, plaintext: &[u8]) -> SendResult<Vec<u8>> {
        seal(&self.encrypt_key, &self.iv, plaintext)
    }

    pub fn decrypt_payload(&self, ciphertext: &[u8]) -> SendResult<Vec<u8>> {
        open(&self.encrypt_key, &self.iv, ciphertext)
    }

    /// Encrypt the metadata descriptor under the metadata key.
    ///
    /// The IV is all zeros: the metadata key is unique to this transfer and
    /// encrypts exactly one message.
    pub fn encrypt_metadata(&self, descriptor: &FileDescriptor) -> SendResult<Vec<u8>> {
        let metadata = FileMetadata {
            iv: self.iv_b64(),
            name: descriptor.name.clone(),
            size: descriptor.size,
            mime: descriptor
                .mime
                .clone()
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            manifest: descriptor.manifest.clone(),
        };
        let json = serde_json::to_vec(&metadata)?;
        seal(&self.meta_key, &[0u8; IV_SIZE], &json)
    }

    pub fn decrypt_metadata(&self, ciphertext: &[u8]) -> SendResult<FileMetadata> {
        let json = open(&self.meta_key, &[0u8; IV_SIZE], ciphertext)?;
        serde_json::from_slice(&json)
            .map_err(|e| SendError::Protocol(format!("metadata is not valid JSON: {e}")))
    }

    /// Record-encrypt `source` with a fresh salt.
    pub fn encrypt_stream(
        &self,
        source: ByteStream,
        size: u64,
    ) -> SendResult<(ByteStream, StreamInfo)> {
        ece::encode(
            source,
            &self.secret,
            EncodeOptions {
                record_size: self.record_size,
                salt: None,
                total_size: Some(size),
            },
        )
    }

    pub fn decrypt_stream(&self, source: ByteStream) -> ByteStream {
        ece::decode(source, &self.secret, self.record_size)
    }
}

fn decode_iv(iv_b64: &str) -> SendResult<[u8; IV_SIZE]> {
    let bytes = b64::decode(iv_b64)?;
    bytes.as_slice().try_into().map_err(|_| {
        SendError::Crypto(format!(
            "IV must be {IV_SIZE} bytes, got {}",
            bytes.len()
        ))
    })
}

fn seal(key: &AesKey, iv: &[u8; IV_SIZE], plaintext: &[u8]) -> SendResult<Vec<u8>> {
    let cipher = Aes128Gcm::new(key.as_bytes().into());
    cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|e| SendError::Crypto(format!("encryption failed: {e}")))
}

fn open(key: &AesKey, iv: &[u8; IV_SIZE], ciphertext: &[u8]) -> SendResult<Vec<u8>> {
    let cipher = Aes128Gcm::new(key.as_bytes().into());
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| SendError::TagMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use csend_core::types::{Manifest, ManifestFile};
    use futures::{executor::block_on, stream, StreamExt, TryStreamExt};

    const SECRET: &str = "yqdlZ-tYemfogSmv7Ws5PQ";

    fn keychain() -> Keychain {
        Keychain::new(Some(SECRET), None, None).unwrap()
    }

    fn descriptor() -> FileDescriptor {
        FileDescriptor {
            name: "report.pdf".into(),
            size: 1234,
            mime: Some("application/pdf".into()),
            manifest: Manifest::default(),
        }
    }

    #[test]
    fn test_auth_header_known_answer() {
        let kc = keychain();
        assert_eq!(kc.nonce(), DEFAULT_NONCE);
        assert_eq!(
            kc.current_auth_header().unwrap(),
            "send-v1 dtdPDXr9qbDL7pv27IIHWkMUHGZpa6IurZXAbZGKNHM"
        );
    }

    #[test]
    fn test_password_auth_header_known_answer() {
        let mut kc = keychain();
        kc.set_password(
            &SecretString::from("hunter2"),
            "https://send.example/download/abc123/",
        )
        .unwrap();
        assert_eq!(
            kc.auth_header(DEFAULT_NONCE).unwrap(),
            "send-v1 ZuzY5TJOfj7-u4oyYAJ0697tt_GAsxxKzZShIP0tFaU"
        );
    }

    #[test]
    fn test_header_changes_with_nonce() {
        let kc = keychain();
        let a = kc.auth_header(DEFAULT_NONCE).unwrap();
        let b = kc.auth_header("AAAAAAAAAAAAAAAAAAAAAA==").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("send-v1 "));
    }

    #[test]
    fn test_set_nonce_ignores_empty_and_unchanged() {
        let mut kc = keychain();
        assert!(!kc.set_nonce(""));
        assert!(!kc.set_nonce(DEFAULT_NONCE));
        assert!(kc.set_nonce("bmV3bm9uY2U="));
        assert_eq!(kc.nonce(), "bmV3bm9uY2U=");
    }

    #[test]
    fn test_exported_auth_key_imports_to_same_header() {
        let mut sender = Keychain::generate().unwrap();
        sender
            .set_password(&SecretString::from("pw"), "https://x/download/1/")
            .unwrap();

        let mut other = Keychain::generate().unwrap();
        other.set_auth_key_b64(&sender.auth_key_b64()).unwrap();

        assert_eq!(
            sender.auth_header(DEFAULT_NONCE).unwrap(),
            other.auth_header(DEFAULT_NONCE).unwrap()
        );
    }

    #[test]
    fn test_rebuild_from_secret_and_iv() {
        let sender = Keychain::generate().unwrap();
        let receiver =
            Keychain::new(Some(&sender.secret_b64()), None, Some(&sender.iv_b64())).unwrap();

        let ct = sender.encrypt_payload(b"whole blob").unwrap();
        assert_eq!(receiver.decrypt_payload(&ct).unwrap(), b"whole blob");
        assert_eq!(sender.auth_key_b64(), receiver.auth_key_b64());
    }

    #[test]
    fn test_payload_tamper_detected() {
        let kc = keychain();
        let mut ct = kc.encrypt_payload(b"secret data").unwrap();
        ct[0] ^= 0xFF;
        assert!(matches!(kc.decrypt_payload(&ct), Err(SendError::TagMismatch)));
    }

    #[test]
    fn test_payload_needs_matching_iv() {
        let sender = keychain();
        let ct = sender.encrypt_payload(b"secret data").unwrap();

        let mut receiver = keychain();
        receiver.set_iv(&sender.iv_b64()).unwrap();
        assert_eq!(receiver.decrypt_payload(&ct).unwrap(), b"secret data");

        receiver.set_iv("AAAAAAAAAAAAAAAA").unwrap();
        assert!(receiver.decrypt_payload(&ct).is_err());
    }

    #[test]
    fn test_metadata_roundtrip_carries_iv() {
        let sender = keychain();
        let ct = sender.encrypt_metadata(&descriptor()).unwrap();

        // receiver does not know the IV yet; metadata uses a zero IV
        let receiver = keychain();
        let meta = receiver.decrypt_metadata(&ct).unwrap();
        assert_eq!(meta.name, "report.pdf");
        assert_eq!(meta.size, 1234);
        assert_eq!(meta.mime, "application/pdf");
        assert_eq!(meta.iv, sender.iv_b64());
    }

    #[test]
    fn test_metadata_defaults_type_and_keeps_manifest() {
        let kc = keychain();
        let desc = FileDescriptor {
            name: "Send-Archive.zip".into(),
            size: 3,
            mime: None,
            manifest: Manifest {
                files: vec![ManifestFile {
                    name: "a".into(),
                    size: 3,
                    mime: "text/plain".into(),
                }],
            },
        };
        let meta = kc.decrypt_metadata(&kc.encrypt_metadata(&desc).unwrap()).unwrap();
        assert_eq!(meta.mime, DEFAULT_MIME_TYPE);
        assert_eq!(meta.manifest.files.len(), 1);
    }

    #[test]
    fn test_metadata_wrong_secret_fails() {
        let ct = keychain().encrypt_metadata(&descriptor()).unwrap();
        let other = Keychain::generate().unwrap();
        assert!(matches!(other.decrypt_metadata(&ct), Err(SendError::TagMismatch)));
    }

    #[test]
    fn test_stream_roundtrip_through_keychain() {
        let kc = keychain().with_record_size(64);
        let plain: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        let source = stream::iter(vec![Ok(Bytes::from(plain.clone()))]).boxed();

        let (enc, info) = kc.encrypt_stream(source, plain.len() as u64).unwrap();
        assert_eq!(info.record_size, 64);

        let receiver = Keychain::new(Some(SECRET), None, None)
            .unwrap()
            .with_record_size(64);
        let chunks: Vec<Bytes> = block_on(receiver.decrypt_stream(enc).try_collect()).unwrap();
        assert_eq!(chunks.concat(), plain);
    }

    #[test]
    fn test_bad_iv_rejected() {
        assert!(Keychain::new(None, None, Some("AAAA")).is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let dbg = format!("{:?}", keychain());
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains(SECRET));
    }
}
