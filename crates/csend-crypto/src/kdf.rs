//! Key derivation: root secret → working keys, password → auth key

use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroize;

use csend_core::{SendError, SendResult};

use crate::{AUTH_KEY_SIZE, KEY_SIZE};

const ENCRYPTION_INFO: &[u8] = b"encryption";
const METADATA_INFO: &[u8] = b"metadata";
const AUTHENTICATION_INFO: &[u8] = b"authentication";

/// A 128-bit AES-GCM key. Zeroized on drop.
#[derive(Clone)]
pub struct AesKey {
    bytes: [u8; KEY_SIZE],
}

impl AesKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for AesKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Raw HMAC-SHA256 key material. Length is whatever was derived or imported.
#[derive(Clone)]
pub struct AuthKey {
    bytes: Vec<u8>,
}

impl AuthKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for AuthKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthKey")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The three keys derived from one root secret.
#[derive(Debug, Clone)]
pub struct DerivedKeys {
    pub encrypt_key: AesKey,
    pub meta_key: AesKey,
    pub auth_key: AuthKey,
}

/// Derive the encryption, metadata and authentication keys from a root secret.
///
/// HKDF-SHA256 with an empty salt and a fixed info label per key. Pure: the
/// same root secret always yields the same keys, which is what lets a
/// receiver rebuild everything from the secret in a share link.
pub fn derive_keys(root_secret: &[u8]) -> SendResult<DerivedKeys> {
    let mut encrypt = [0u8; KEY_SIZE];
    hkdf_expand(None, root_secret, ENCRYPTION_INFO, &mut encrypt)?;

    let mut meta = [0u8; KEY_SIZE];
    hkdf_expand(None, root_secret, METADATA_INFO, &mut meta)?;

    let mut auth = vec![0u8; AUTH_KEY_SIZE];
    hkdf_expand(None, root_secret, AUTHENTICATION_INFO, &mut auth)?;

    Ok(DerivedKeys {
        encrypt_key: AesKey::from_bytes(encrypt),
        meta_key: AesKey::from_bytes(meta),
        auth_key: AuthKey::from_bytes(auth),
    })
}

/// HKDF-SHA256 extract-and-expand into `out`.
pub fn hkdf_expand(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[u8],
    out: &mut [u8],
) -> SendResult<()> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    hkdf.expand(info, out)
        .map_err(|e| SendError::Crypto(format!("HKDF expand failed: {e}")))
}

/// Stretch a password into an HMAC key with PBKDF2-HMAC-SHA256.
///
/// `context` is the share URL; using it as the salt ties the password to a
/// single upload.
pub fn derive_password_key(
    password: &SecretString,
    context: &str,
    iterations: u32,
) -> SendResult<AuthKey> {
    if iterations == 0 {
        return Err(SendError::Crypto("PBKDF2 iterations must be >= 1".into()));
    }

    let mut key = vec![0u8; AUTH_KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        password.expose_secret().as_bytes(),
        context.as_bytes(),
        iterations,
        &mut key,
    );
    Ok(AuthKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use csend_core::b64;

    #[test]
    fn test_derive_keys_deterministic() {
        let secret = [7u8; 16];
        let a = derive_keys(&secret).unwrap();
        let b = derive_keys(&secret).unwrap();

        assert_eq!(a.encrypt_key.as_bytes(), b.encrypt_key.as_bytes());
        assert_eq!(a.meta_key.as_bytes(), b.meta_key.as_bytes());
        assert_eq!(a.auth_key.as_bytes(), b.auth_key.as_bytes());
    }

    #[test]
    fn test_derived_keys_are_independent() {
        let keys = derive_keys(&[7u8; 16]).unwrap();
        assert_ne!(keys.encrypt_key.as_bytes(), keys.meta_key.as_bytes());
        assert_ne!(&keys.auth_key.as_bytes()[..KEY_SIZE], keys.encrypt_key.as_bytes());
        assert_eq!(keys.auth_key.as_bytes().len(), AUTH_KEY_SIZE);
    }

    #[test]
    fn test_auth_key_known_answer() {
        let secret = b64::decode("yqdlZ-tYemfogSmv7Ws5PQ").unwrap();
        let keys = derive_keys(&secret).unwrap();
        assert_eq!(
            b64::encode(keys.auth_key.as_bytes()),
            "-1xZTbBy3pd0gQXvDr0CiFTWLeWl4-bYYODoDDm35mDLgS4PzFQu_pH-mbgPmG4ecj8lft12z3DT0wO8WVIWmg"
        );
    }

    #[test]
    fn test_password_key_known_answer() {
        let key = derive_password_key(
            &SecretString::from("hunter2"),
            "https://send.example/download/abc123/",
            100,
        )
        .unwrap();
        assert_eq!(
            b64::encode(key.as_bytes()),
            "viEvE2GYU53ByJOdagR7SS4RS9R8Sf7EBRlfxmqfF0z2W8y5K66t8YHxL4bnQtV7ApJS3-8fecqq0fuWIYnKhQ"
        );
    }

    #[test]
    fn test_password_key_depends_on_context() {
        let pw = SecretString::from("same");
        let a = derive_password_key(&pw, "https://x/download/1/", 10).unwrap();
        let b = derive_password_key(&pw, "https://x/download/2/", 10).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let result = derive_password_key(&SecretString::from("pw"), "ctx", 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_redacts() {
        let keys = derive_keys(&[1u8; 16]).unwrap();
        let dbg = format!("{keys:?}");
        assert!(dbg.contains("REDACTED"));
    }
}
