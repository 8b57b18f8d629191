use std::fmt::{self, Display};

use nostr::types::RelayUrl;
use url::Url;

use crate::Error;

/// A relay url in canonical form. The pool keys its connection directory
/// by this, so `wss://relay.example.com` and `wss://relay.example.com/`
/// are the same relay.
#[derive(Eq, PartialEq, Hash, Clone, Debug, PartialOrd, Ord)]
pub struct NormRelayUrl {
    url: RelayUrl,
}

impl NormRelayUrl {
    pub fn new(url: &str) -> Result<Self, Error> {
        Ok(Self {
            url: RelayUrl::parse(canonicalize_url(url.trim()))
                .map_err(|_| Error::InvalidRelayUrl)?,
        })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// The http(s) endpoint serving this relay's NIP-11 document.
    pub fn http_url(&self) -> String {
        let url = self.as_str().trim_end_matches('/');
        if let Some(rest) = url.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if let Some(rest) = url.strip_prefix("ws://") {
            format!("http://{rest}")
        } else {
            url.to_owned()
        }
    }
}

impl Display for NormRelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

impl From<NormRelayUrl> for RelayUrl {
    fn from(value: NormRelayUrl) -> Self {
        value.url
    }
}

impl From<RelayUrl> for NormRelayUrl {
    fn from(url: RelayUrl) -> Self {
        Self { url }
    }
}

impl TryFrom<&str> for NormRelayUrl {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

// standardize the format (ie, trailing slashes)
fn canonicalize_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed_url) => parsed_url.to_string(),
        Err(_) => url.to_owned(), // If parsing fails, return the original URL.
    }
}
