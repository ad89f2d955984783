use std::fmt;

use csend_core::{SendError, SendResult};

/// `https://host/download/<id>/#<secret>`
///
/// The fragment carries the root secret and is never sent to the server.
/// `url` (everything before `#`) doubles as the password salt.
#[derive(Clone, PartialEq, Eq)]
pub struct ShareLink {
    pub url: String,
    pub id: String,
    pub secret_b64: String,
}

impl ShareLink {
    /// Build from the URL the server returned and the sender's secret.
    pub fn new(url: &str, secret_b64: &str) -> SendResult<Self> {
        Self::parse(&format!("{}#{secret_b64}", url.split('#').next().unwrap_or(url)))
    }

    pub fn parse(link: &str) -> SendResult<Self> {
        let link = link.trim();
        let (url, secret) = link
            .split_once('#')
            .ok_or_else(|| invalid(link, "missing #secret"))?;
        if secret.is_empty() {
            return Err(invalid(link, "empty secret"));
        }
        let path = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(|| invalid(link, "not an http(s) URL"))?;

        let id = path
            .split('/')
            .skip(1)
            .filter(|s| !s.is_empty())
            .skip_while(|s| *s != "download")
            .nth(1)
            .ok_or_else(|| invalid(link, "no /download/<id> path"))?;

        Ok(Self {
            url: url.to_string(),
            id: id.to_string(),
            secret_b64: secret.to_string(),
        })
    }

    /// Scheme and authority, e.g. `https://send.example.com`.
    pub fn origin(&self) -> &str {
        let after_scheme = self.url.find("://").map(|i| i + 3).unwrap_or(0);
        match self.url[after_scheme..].find('/') {
            Some(slash) => &self.url[..after_scheme + slash],
            None => &self.url,
        }
    }
}

fn invalid(link: &str, why: &str) -> SendError {
    // the secret must not end up in logs or error messages
    let shown = link.split('#').next().unwrap_or_default();
    SendError::Config(format!("invalid share link {shown}: {why}"))
}

impl fmt::Display for ShareLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.url, self.secret_b64)
    }
}

impl fmt::Debug for ShareLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareLink")
            .field("url", &self.url)
            .field("id", &self.id)
            .field("secret_b64", &"[REDACTED]")
            .finish()
    }
}
