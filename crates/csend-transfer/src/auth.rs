//! `send-v1` challenge/response over HTTP
//!
//! Every authenticated response carries the server's next challenge in
//! `WWW-Authenticate: send-v1 <nonce>`. A 401 whose challenge differs from
//! the nonce we just signed means our nonce was stale, so the request is
//! repeated once. A 401 that repeats the nonce means the key itself is wrong.

use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use csend_core::{SendError, SendResult};
use csend_crypto::Keychain;

/// Second whitespace-separated token of a challenge header.
pub fn parse_nonce(header: &str) -> Option<&str> {
    header.split_whitespace().nth(1)
}

/// Send the request built by `build` with a credential over the keychain's
/// current nonce.
///
/// `build` is called again for the single retry, so it must produce an
/// identical request each time. The keychain nonce follows every challenge
/// the server issues, whatever the status.
pub async fn send_with_auth<F>(keychain: &mut Keychain, build: F) -> SendResult<Response>
where
    F: Fn() -> RequestBuilder,
{
    let mut retried = false;
    loop {
        let header = keychain.current_auth_header()?;
        let response = build()
            .header(AUTHORIZATION, header)
            .send()
            .await
            .map_err(transport_error)?;

        let moved = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_nonce)
            .map(|nonce| keychain.set_nonce(nonce))
            .unwrap_or(false);

        if response.status() == StatusCode::UNAUTHORIZED && moved && !retried {
            warn!(url = %response.url(), "stale challenge nonce, retrying once");
            retried = true;
            continue;
        }

        debug!(
            status = response.status().as_u16(),
            retried,
            "authenticated request done"
        );
        return Ok(response);
    }
}

/// Map a response status onto the error taxonomy.
pub fn check_status(response: Response) -> SendResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status == StatusCode::UNAUTHORIZED {
        Err(SendError::AuthenticationFailure)
    } else {
        Err(SendError::status(status.as_u16()))
    }
}

/// Like `check_status`, but a download body is only valid with `200 OK`.
pub(crate) fn check_download_status(response: Response) -> SendResult<Response> {
    let response = check_status(response)?;
    match response.status() {
        StatusCode::OK => Ok(response),
        other => Err(SendError::status(other.as_u16())),
    }
}

pub(crate) fn transport_error(e: reqwest::Error) -> SendError {
    SendError::Transport {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}
