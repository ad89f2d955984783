//! Base64 as spoken on the wire.
//!
//! Everything we emit is URL-safe without padding. Values from the server
//! (challenge nonces in particular) may use the standard alphabet with
//! padding, so decoding accepts either.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::{SendError, SendResult};

pub fn encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn decode(s: &str) -> SendResult<Vec<u8>> {
    let normalized: String = s
        .trim()
        .chars()
        .filter(|c| *c != '=')
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|e| SendError::Protocol(format!("base64 decode: {e}")))
}
