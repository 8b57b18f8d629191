use std::borrow::Borrow;
use std::fmt;

use uuid::Uuid;

/// A client-chosen subscription id. Fresh ids are random uuids so relays
/// can't correlate subscriptions across connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubId(String);

impl SubId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Use a specific id instead of a random one. Reusing the id of a closed
    /// subscription is fine.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First few characters, for log lines.
    pub fn abbrev(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl Default for SubId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SubId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for SubId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
