//! NIP-11 relay information documents.

use http_body_util::{BodyExt, Empty, Limited};
use hyper::{
    body::Bytes,
    header::{self, HeaderValue},
    Request, Uri,
};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::relay::NormRelayUrl;

const MAX_BODY_BYTES: usize = 64 * 1024;

/// What a relay says about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RelayInformationDocument {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pubkey: Option<String>,
    pub contact: Option<String>,
    pub supported_nips: Option<Vec<u32>>,
    pub software: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub limitation: RelayLimitation,
}

impl RelayInformationDocument {
    pub fn supports(&self, nip: u32) -> bool {
        self.supported_nips
            .as_ref()
            .is_some_and(|nips| nips.contains(&nip))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RelayLimitation {
    pub max_message_length: Option<usize>,
    pub max_subscriptions: Option<usize>,
    pub max_filters: Option<usize>,
    pub max_limit: Option<usize>,
    pub max_subid_length: Option<usize>,
    pub max_event_tags: Option<usize>,
    pub max_content_length: Option<usize>,
    pub min_pow_difficulty: Option<u32>,
    pub auth_required: Option<bool>,
    pub payment_required: Option<bool>,
}

#[derive(Error, Debug)]
pub enum RelayInfoError {
    #[error("invalid relay url")]
    InvalidUrl,

    #[error("tls initialization error")]
    Tls,

    #[error("http error: {0}")]
    Http(String),

    #[error("http status: {0}")]
    HttpStatus(u16),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Fetch a relay's information document over http(s). One request, no
/// caching.
pub async fn fetch_relay_info(
    relay: &NormRelayUrl,
) -> Result<RelayInformationDocument, RelayInfoError> {
    let http_url = relay.http_url();
    let uri: Uri = http_url.parse().map_err(|_| RelayInfoError::InvalidUrl)?;
    let authority = uri.authority().ok_or(RelayInfoError::InvalidUrl)?.clone();

    let https = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|_| RelayInfoError::Tls)?
        .https_or_http()
        .enable_http1()
        .build();
    let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build(https);

    let req = Request::builder()
        .uri(&uri)
        .header(header::HOST, authority.as_str())
        .header(
            header::ACCEPT,
            HeaderValue::from_static("application/nostr+json"),
        )
        .body(Empty::<Bytes>::new())
        .map_err(|e| RelayInfoError::Http(e.to_string()))?;

    debug!("fetching relay info from {}", http_url);

    let res = client
        .request(req)
        .await
        .map_err(|e| RelayInfoError::Http(e.to_string()))?;

    if !res.status().is_success() {
        return Err(RelayInfoError::HttpStatus(res.status().as_u16()));
    }

    let content_type = res
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.contains("json") {
        warn!("{} served relay info as '{}'", relay, content_type);
    }

    let body = Limited::new(res.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| RelayInfoError::Http(e.to_string()))?
        .to_bytes();

    parse_relay_info(&body)
}

fn parse_relay_info(body: &[u8]) -> Result<RelayInformationDocument, RelayInfoError> {
    Ok(serde_json::from_slice(body)?)
}
