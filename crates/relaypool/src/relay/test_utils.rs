#![cfg(test)]
//! Test utilities for relay testing
//!
//! An in-memory transport whose sockets are scripted per url, plus helpers
//! for building relay-side frames.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};

use ewebsock::{WsEvent, WsMessage};
use hashbrown::HashMap;
use nostr::{Event, EventBuilder, Keys};
use serde_json::{json, Value};

use crate::relay::{lock, NormRelayUrl, RelayObserver, Transport, TransportEvents, WsSink};
use crate::{RelayError, Result};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests (only runs once even if called multiple times)
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("relaypool=debug".parse().unwrap()),
            )
            .with_test_writer()
            .init();
    });
}

pub fn text_note(content: &str) -> Event {
    EventBuilder::text_note(content)
        .sign_with_keys(&Keys::generate())
        .expect("sign test note")
}

pub fn relay_url(n: u16) -> NormRelayUrl {
    NormRelayUrl::new(&format!("wss://relay{n}.example.com")).expect("valid relay url")
}

pub fn event_frame(sub_id: &str, event: &Event) -> String {
    json!(["EVENT", sub_id, event]).to_string()
}

pub fn eose_frame(sub_id: &str) -> String {
    json!(["EOSE", sub_id]).to_string()
}

pub fn ok_frame(event: &Event, accepted: bool) -> String {
    json!(["OK", event.id.to_hex(), accepted, ""]).to_string()
}

pub fn count_frame(sub_id: &str, count: u64) -> String {
    json!(["COUNT", sub_id, { "count": count }]).to_string()
}

/// How the mock answers one connection attempt.
#[derive(Debug, Clone)]
pub enum Behavior {
    Accept,
    Refuse(String),
    /// Never finish the handshake.
    Hang,
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<NormRelayUrl, VecDeque<Behavior>>,
    sockets: HashMap<NormRelayUrl, TransportEvents>,
    sent: HashMap<NormRelayUrl, Vec<WsMessage>>,
    opens: HashMap<NormRelayUrl, u32>,
}

/// A transport that never touches the network. Connection attempts follow
/// the per-url script (accepting once the script runs out), and tests
/// play the relay side with [`MockTransport::push`].
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, url: &NormRelayUrl, behaviors: impl IntoIterator<Item = Behavior>) {
        lock(&self.state)
            .scripts
            .entry(url.clone())
            .or_default()
            .extend(behaviors);
    }

    /// Deliver a text frame from the relay at `url`.
    pub fn push(&self, url: &NormRelayUrl, frame: impl Into<String>) {
        self.emit(url, WsEvent::Message(WsMessage::Text(frame.into())));
    }

    pub fn emit(&self, url: &NormRelayUrl, event: WsEvent) {
        let state = lock(&self.state);
        let socket = state
            .sockets
            .get(url)
            .unwrap_or_else(|| panic!("no socket open to {url}"));
        let _ = socket.send(event);
    }

    /// The relay hangs up.
    pub fn drop_connection(&self, url: &NormRelayUrl) {
        self.emit(url, WsEvent::Closed);
    }

    pub fn opens(&self, url: &NormRelayUrl) -> u32 {
        lock(&self.state).opens.get(url).copied().unwrap_or(0)
    }

    /// Every frame the client wrote to `url`, across reconnects.
    pub fn sent(&self, url: &NormRelayUrl) -> Vec<WsMessage> {
        lock(&self.state).sent.get(url).cloned().unwrap_or_default()
    }

    /// Text frames written to `url`, parsed.
    pub fn sent_json(&self, url: &NormRelayUrl) -> Vec<Value> {
        self.sent(url)
            .into_iter()
            .filter_map(|msg| match msg {
                WsMessage::Text(text) => serde_json::from_str(&text).ok(),
                _ => None,
            })
            .collect()
    }

    /// Text frames of one type (`"REQ"`, `"CLOSE"`, ...) written to `url`.
    pub fn sent_of(&self, url: &NormRelayUrl, tag: &str) -> Vec<Value> {
        self.sent_json(url)
            .into_iter()
            .filter(|v| v[0] == tag)
            .collect()
    }
}

impl Transport for MockTransport {
    fn open(&self, url: &NormRelayUrl, events: TransportEvents) -> Result<Box<dyn WsSink>> {
        let mut state = lock(&self.state);
        *state.opens.entry(url.clone()).or_default() += 1;
        let behavior = state
            .scripts
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Behavior::Accept);

        match behavior {
            Behavior::Accept => {
                let _ = events.send(WsEvent::Opened);
            }
            Behavior::Refuse(err) => {
                let _ = events.send(WsEvent::Error(err));
            }
            Behavior::Hang => {}
        }
        state.sockets.insert(url.clone(), events);

        Ok(Box::new(MockSink {
            url: url.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockSink {
    url: NormRelayUrl,
    state: Arc<Mutex<MockState>>,
}

impl WsSink for MockSink {
    fn send(&mut self, msg: WsMessage) {
        lock(&self.state)
            .sent
            .entry(self.url.clone())
            .or_default()
            .push(msg);
    }

    fn close(&mut self) {}
}

/// Records lifecycle hooks per relay as short labels.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    log: Arc<Mutex<Vec<(NormRelayUrl, String)>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self, url: &NormRelayUrl) -> Vec<String> {
        lock(&self.log)
            .iter()
            .filter(|(relay, _)| relay == url)
            .map(|(_, what)| what.clone())
            .collect()
    }

    fn record(&self, url: &NormRelayUrl, what: String) {
        lock(&self.log).push((url.clone(), what));
    }
}

impl RelayObserver for RecordingObserver {
    fn on_connecting(&self, relay: &NormRelayUrl) {
        self.record(relay, "connecting".to_owned());
    }

    fn on_connected(&self, relay: &NormRelayUrl) {
        self.record(relay, "connected".to_owned());
    }

    fn on_error(&self, relay: &NormRelayUrl, error: &RelayError) {
        let what = match error {
            RelayError::Connect(_) => "connect error",
            RelayError::Transport(_) => "transport error",
            RelayError::Unavailable { .. } => "unavailable",
        };
        self.record(relay, what.to_owned());
    }

    fn on_closed(&self, relay: &NormRelayUrl) {
        self.record(relay, "closed".to_owned());
    }

    fn on_notice(&self, relay: &NormRelayUrl, message: &str) {
        self.record(relay, format!("notice {message}"));
    }
}
