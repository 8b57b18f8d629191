use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

mod connection;
mod correlator;
mod identity;
pub mod info;
pub mod message;
mod observer;
mod options;
mod pool;
mod queue;
mod stream;
mod subscription;
mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

pub use connection::RelayConnection;
pub use correlator::{CommandListener, CountResult, PublishAck};
pub use identity::NormRelayUrl;
pub use observer::{NoopObserver, RelayObserver};
pub use options::{OverflowPolicy, PoolOptions, SubscribeOptions};
pub use pool::{InitReport, RelayPool};
pub use queue::EventQueue;
pub use stream::EventStream;
pub use subscription::{ReceivedEvent, RelayOutcome, SubscriptionOutcome};
pub use transport::{Transport, TransportEvents, WebsocketTransport, WsSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    /// Terminal. The connection is discarded.
    Closed,
}

impl RelayStatus {
    /// Still worth waiting on: connected now, or working on it.
    pub fn is_live(self) -> bool {
        !matches!(self, RelayStatus::Closing | RelayStatus::Closed)
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayStatus::Disconnected => "disconnected",
            RelayStatus::Connecting => "connecting",
            RelayStatus::Connected => "connected",
            RelayStatus::Reconnecting => "reconnecting",
            RelayStatus::Closing => "closing",
            RelayStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Lock a shared map. A panic while holding one of these locks leaves
/// the map itself consistent, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
