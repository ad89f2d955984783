//! csend-crypto: client-side encryption for ciphersend
//!
//! Key hierarchy:
//! ```text
//! Root secret (128-bit random, travels in the share-link fragment)
//!   ├── Encryption key     (HKDF "encryption")     AES-128-GCM, whole-blob payloads
//!   ├── Metadata key       (HKDF "metadata")       AES-128-GCM, zero IV, one message
//!   ├── Authentication key (HKDF "authentication") HMAC-SHA256 over server nonces
//!   │     └── or PBKDF2(password, share URL) when the link is password protected
//!   └── Record keys        (HKDF salt=random, RFC 8188) streaming file contents
//! ```

pub mod ece;
pub mod kdf;
pub mod keychain;

pub use ece::{decode, encode, encrypted_size, EncodeOptions, StreamInfo};
pub use kdf::{derive_keys, derive_password_key, DerivedKeys};
pub use keychain::{Keychain, AUTH_SCHEME, DEFAULT_NONCE};

/// Size of a root secret in bytes (128-bit)
pub const SECRET_SIZE: usize = 16;

/// Size of an AES-128 key
pub const KEY_SIZE: usize = 16;

/// Size of an HMAC-SHA256 key (one SHA-256 block)
pub const AUTH_KEY_SIZE: usize = 64;

/// Size of an AES-GCM nonce / IV (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Keychain IV size; same as the GCM nonce
pub const IV_SIZE: usize = NONCE_SIZE;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;
