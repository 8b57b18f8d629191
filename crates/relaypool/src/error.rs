use std::time::Duration;

use thiserror::Error;

use crate::relay::NormRelayUrl;

#[derive(Error, Debug)]
pub enum Error {
    #[error("message is empty")]
    Empty,

    #[error("decoding failed: {0}")]
    DecodeFailed(String),

    #[error("invalid relay url")]
    InvalidRelayUrl,

    #[error("could not connect to {relay}: {source}")]
    Connect {
        relay: NormRelayUrl,
        #[source]
        source: ConnectError,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("the relay pool has no relays")]
    NoRelays,

    #[error("the relay pool was dropped")]
    PoolClosed,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Generic(s)
    }
}

impl From<url::ParseError> for Error {
    fn from(_e: url::ParseError) -> Self {
        Error::InvalidRelayUrl
    }
}

/// Why a single connection attempt to a relay failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ConnectError {
    /// Sort a transport error string into a connect failure kind. ewebsock
    /// only hands us strings, so this is a best-effort classification.
    pub fn classify(err: &str) -> Self {
        let lower = err.to_ascii_lowercase();
        if lower.contains("refused") || lower.contains("unreachable") || lower.contains("dns") {
            ConnectError::Refused(err.to_owned())
        } else if lower.contains("tls") || lower.contains("certificate") || lower.contains("ssl")
        {
            ConnectError::Tls(err.to_owned())
        } else {
            ConnectError::Protocol(err.to_owned())
        }
    }
}

/// Errors reported through a relay's lifecycle hooks. These never fail
/// unrelated operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("connection lost: {0}")]
    Transport(String),

    #[error("relay unavailable after {attempts} reconnect attempts")]
    Unavailable { attempts: u32 },
}
