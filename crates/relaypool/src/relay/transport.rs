use std::ops::ControlFlow;

use ewebsock::{Options, WsEvent, WsMessage, WsSender};
use tokio::sync::mpsc;
use tracing::debug;

use crate::relay::NormRelayUrl;
use crate::Result;

/// Where a transport pushes the events of one socket: opened, messages,
/// errors and the final close.
pub type TransportEvents = mpsc::UnboundedSender<WsEvent>;

/// Opens sockets to relays. The pool owns one transport and asks it for a
/// fresh socket on every (re)connect.
pub trait Transport: Send + Sync + 'static {
    /// Start connecting to `url`. Must not block; the outcome of the
    /// handshake arrives on `events` as `Opened` or `Error`.
    fn open(&self, url: &NormRelayUrl, events: TransportEvents) -> Result<Box<dyn WsSink>>;
}

/// The writing half of an open socket.
pub trait WsSink: Send {
    fn send(&mut self, msg: WsMessage);
    fn close(&mut self);
}

impl WsSink for WsSender {
    fn send(&mut self, msg: WsMessage) {
        WsSender::send(self, msg);
    }

    fn close(&mut self) {
        WsSender::close(self);
    }
}

/// The default transport: one ewebsock connection per relay, its events
/// forwarded into the connection's tokio channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebsocketTransport;

impl Transport for WebsocketTransport {
    fn open(&self, url: &NormRelayUrl, events: TransportEvents) -> Result<Box<dyn WsSink>> {
        let relay = url.to_string();
        let on_event = Box::new(move |event: WsEvent| {
            if events.send(event).is_err() {
                // nobody is listening anymore, stop the socket thread
                debug!("dropping websocket events for {}", relay);
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });

        let sender = ewebsock::ws_connect(url.as_str().to_owned(), Options::default(), on_event)?;
        Ok(Box::new(sender))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn refused_sockets_report_an_error() {
        // nothing listens on port 1
        let url = NormRelayUrl::new("ws://127.0.0.1:1").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sink = WebsocketTransport.open(&url, tx).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("handshake outcome in time")
            .expect("event");
        assert!(matches!(event, WsEvent::Error(_)));
    }
}
