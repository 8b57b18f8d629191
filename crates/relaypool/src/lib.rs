//! Relay connection and subscription engine for nostr clients.
//!
//! A [`RelayPool`] owns one connection per relay, fans requests out to all
//! of them and folds the relays' asynchronous answers back into single
//! results: deduplicated [`EventStream`]s with a caught-up signal, first-ack
//! publishes and first-answer counts.

mod client;
mod error;
mod relay;
mod subid;

pub use client::ClientMessage;
pub use error::{ConnectError, Error, RelayError};
pub use ewebsock;
pub use nostr::{Event, EventId, Filter};
pub use relay::info::{fetch_relay_info, RelayInfoError, RelayInformationDocument, RelayLimitation};
pub use relay::message::{CommandResult, RelayEvent, RelayMessage};
pub use relay::{
    CommandListener, CountResult, EventQueue, EventStream, InitReport, NoopObserver,
    NormRelayUrl, OverflowPolicy, PoolOptions, PublishAck, ReceivedEvent, RelayConnection,
    RelayObserver, RelayOutcome, RelayPool, RelayStatus, SubscribeOptions, SubscriptionOutcome,
    Transport, TransportEvents, WebsocketTransport, WsSink,
};
pub use subid::SubId;

pub type Result<T> = std::result::Result<T, error::Error>;
