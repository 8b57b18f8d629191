use crate::relay::message::RelayMessage;
use crate::relay::NormRelayUrl;
use crate::RelayError;

/// Lifecycle hooks for the relays in a pool.
///
/// Every hook for a given relay is called from that relay's connection
/// task, so hooks for one relay never run concurrently with each other.
/// Hooks for different relays can. Keep them quick; a slow hook stalls
/// its relay's read loop.
pub trait RelayObserver: Send + Sync + 'static {
    fn on_connecting(&self, _relay: &NormRelayUrl) {}

    fn on_connected(&self, _relay: &NormRelayUrl) {}

    fn on_error(&self, _relay: &NormRelayUrl, _error: &RelayError) {}

    /// The connection is done: closed on purpose, or lost with no retries left.
    fn on_closed(&self, _relay: &NormRelayUrl) {}

    fn on_notice(&self, _relay: &NormRelayUrl, _message: &str) {}

    fn on_auth(&self, _relay: &NormRelayUrl, _challenge: &str) {}

    /// Every decoded message, before it is routed.
    fn on_message(&self, _relay: &NormRelayUrl, _msg: &RelayMessage) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RelayObserver for NoopObserver {}
