use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use ewebsock::{WsEvent, WsMessage};
use nostr::Event;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::relay::message::{RelayEvent, RelayMessage};
use crate::relay::subscription::{Delivery, ReceivedEvent};
use crate::relay::{lock, NormRelayUrl, PoolOptions, RelayObserver, RelayStatus, Transport, WsSink};
use crate::{ClientMessage, ConnectError, RelayError, SubId};

/// The pool's side of a connection: where decoded traffic goes.
pub(crate) trait ConnectionHandler: Send + Sync + 'static {
    /// The socket just opened. Returns the commands to replay on it.
    fn connected(&self, relay: &NormRelayUrl) -> Vec<ClientMessage>;

    fn event(&self, sub_id: &SubId, event: ReceivedEvent) -> Option<Delivery>;

    /// EOSE, OK, COUNT and CLOSED.
    fn message(&self, relay: &NormRelayUrl, msg: RelayMessage);

    /// The connection with this id is closed for good.
    fn lost(&self, relay: &NormRelayUrl, connection: u64);
}

enum Outbound {
    Text { json: String, bufferable: bool },
    Attach(Box<dyn WsSink>),
    Detach,
    Ping,
    Pong(Vec<u8>),
    Shutdown,
}

struct ConnectionShared {
    status: watch::Sender<RelayStatus>,
    last_error: Mutex<Option<ConnectError>>,
}

impl ConnectionShared {
    fn set_status(&self, url: &NormRelayUrl, status: RelayStatus) {
        let old = self.status.send_replace(status);
        if old != status {
            debug!("{} {} -> {}", url, old, status);
        }
    }
}

/// One relay's connection. Reading and writing run on their own tasks so a
/// slow or dead relay never holds up the others.
///
/// Dropping the connection closes it.
pub struct RelayConnection {
    id: u64,
    url: NormRelayUrl,
    outbound: mpsc::UnboundedSender<Outbound>,
    status: watch::Receiver<RelayStatus>,
    shared: Arc<ConnectionShared>,
    shutdown: watch::Sender<bool>,
    buffering: bool,
    /// Present until the connection is started.
    idle: Mutex<Option<Idle>>,
}

struct Idle {
    driver: Driver,
    writes: mpsc::UnboundedReceiver<Outbound>,
}

impl RelayConnection {
    pub(crate) fn new(
        id: u64,
        url: NormRelayUrl,
        options: PoolOptions,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn RelayObserver>,
        handler: Weak<dyn ConnectionHandler>,
    ) -> Self {
        let (outbound, writes) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(RelayStatus::Disconnected);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(ConnectionShared {
            status: status_tx,
            last_error: Mutex::new(None),
        });
        let buffering = options.buffer_while_disconnected || options.lazy_listening;

        let driver = Driver {
            id,
            url: url.clone(),
            options,
            transport,
            observer,
            handler,
            outbound: outbound.clone(),
            shared: Arc::clone(&shared),
            shutdown: shutdown_rx,
        };

        Self {
            id,
            url,
            outbound,
            status,
            shared,
            shutdown,
            buffering,
            idle: Mutex::new(Some(Idle { driver, writes })),
        }
    }

    /// Spawn the connection's tasks. Needs a tokio runtime. Returns false
    /// if it was already started.
    pub(crate) fn start(&self) -> bool {
        let Some(Idle { driver, writes }) = lock(&self.idle).take() else {
            return false;
        };

        self.shared.set_status(&self.url, RelayStatus::Connecting);
        tokio::spawn(write_loop(self.url.clone(), writes));
        tokio::spawn(driver.run());
        true
    }

    pub fn is_started(&self) -> bool {
        lock(&self.idle).is_none()
    }

    pub fn url(&self) -> &NormRelayUrl {
        &self.url
    }

    /// Distinguishes successive connections to the same relay.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> RelayStatus {
        *self.status.borrow()
    }

    /// Status updates, for callers that want to wait on a transition.
    pub fn watch_status(&self) -> watch::Receiver<RelayStatus> {
        self.status.clone()
    }

    /// Why the latest connection attempt failed, if it did.
    pub fn last_error(&self) -> Option<ConnectError> {
        lock(&self.shared.last_error).clone()
    }

    /// Queue a command for the relay. Never waits. While disconnected,
    /// commands are dropped unless buffering is enabled; REQ and CLOSE
    /// are always dropped since subscriptions replay on connect.
    pub fn send(&self, msg: &ClientMessage) {
        let bufferable = self.buffering && !msg.is_subscription_control();
        queue_command(&self.outbound, &self.url, msg, bufferable);
    }

    /// Would a command sent now reach the relay, now or after it connects?
    pub(crate) fn accepts(&self, msg: &ClientMessage) -> bool {
        match self.status() {
            RelayStatus::Connected => true,
            RelayStatus::Closing | RelayStatus::Closed => false,
            _ => self.buffering && !msg.is_subscription_control(),
        }
    }

    /// Stop the connection. Nothing queued is flushed. Idempotent.
    ///
    /// Must not be called while holding the pool's directory lock; a
    /// connection that never started reports itself lost right here.
    pub fn close(&self) {
        if let Some(Idle { driver, .. }) = lock(&self.idle).take() {
            driver.finish();
            return;
        }

        if !self.status().is_live() {
            return;
        }

        self.shared.set_status(&self.url, RelayStatus::Closing);
        self.shutdown.send_replace(true);
    }

    pub(crate) fn probe(&self) -> ConnectProbe {
        ConnectProbe {
            status: self.status.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.url)
            .field("status", &self.status())
            .finish()
    }
}

/// Waits out a connection's current attempt without holding on to the
/// connection itself.
pub(crate) struct ConnectProbe {
    status: watch::Receiver<RelayStatus>,
    shared: Arc<ConnectionShared>,
}

impl ConnectProbe {
    /// Resolves once the attempt in flight either connected or failed.
    pub async fn settled(mut self) -> Result<(), ConnectError> {
        loop {
            let status = *self.status.borrow_and_update();
            match status {
                RelayStatus::Connected => return Ok(()),
                RelayStatus::Disconnected | RelayStatus::Connecting => {}
                RelayStatus::Reconnecting | RelayStatus::Closing | RelayStatus::Closed => {
                    return Err(self.failure());
                }
            }

            if self.status.changed().await.is_err() {
                return Err(self.failure());
            }
        }
    }

    fn failure(&self) -> ConnectError {
        lock(&self.shared.last_error)
            .clone()
            .unwrap_or_else(|| ConnectError::Refused("connection closed".to_owned()))
    }
}

fn queue_command(
    outbound: &mpsc::UnboundedSender<Outbound>,
    url: &NormRelayUrl,
    msg: &ClientMessage,
    bufferable: bool,
) {
    let json = match msg.to_json() {
        Ok(json) => json,
        Err(err) => {
            error!("error serializing command for {}: {}", url, err);
            return;
        }
    };

    if outbound.send(Outbound::Text { json, bufferable }).is_err() {
        trace!("{} is closed, dropping command", url);
    }
}

/// Owns the socket's writing half while one is attached, and the commands
/// buffered while none is.
async fn write_loop(url: NormRelayUrl, mut writes: mpsc::UnboundedReceiver<Outbound>) {
    let mut sink: Option<Box<dyn WsSink>> = None;
    let mut pending: VecDeque<String> = VecDeque::new();

    while let Some(cmd) = writes.recv().await {
        match cmd {
            Outbound::Text { json, bufferable } => match sink.as_mut() {
                Some(sink) => {
                    debug!("sending {} to {}", json, url);
                    sink.send(WsMessage::Text(json));
                }
                None if bufferable => {
                    trace!("buffering command for {}", url);
                    pending.push_back(json);
                }
                None => debug!("{} is not connected, dropping {}", url, json),
            },
            Outbound::Attach(mut new_sink) => {
                if !pending.is_empty() {
                    debug!("flushing {} buffered commands to {}", pending.len(), url);
                }
                for json in pending.drain(..) {
                    new_sink.send(WsMessage::Text(json));
                }
                sink = Some(new_sink);
            }
            Outbound::Detach => {
                if let Some(mut old) = sink.take() {
                    old.close();
                }
            }
            Outbound::Ping => {
                if let Some(sink) = sink.as_mut() {
                    trace!("pinging {}", url);
                    sink.send(WsMessage::Ping(Vec::new()));
                }
            }
            Outbound::Pong(payload) => {
                if let Some(sink) = sink.as_mut() {
                    sink.send(WsMessage::Pong(payload));
                }
            }
            Outbound::Shutdown => break,
        }
    }

    if let Some(mut sink) = sink.take() {
        sink.close();
    }
}

enum Attempt {
    Open(Box<dyn WsSink>, mpsc::UnboundedReceiver<WsEvent>),
    Failed(ConnectError),
    Shutdown,
}

enum SessionEnd {
    Closed,
    Error(String),
    Notice,
    Shutdown,
}

/// The read side and the reconnect policy of one connection.
struct Driver {
    id: u64,
    url: NormRelayUrl,
    options: PoolOptions,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn RelayObserver>,
    handler: Weak<dyn ConnectionHandler>,
    outbound: mpsc::UnboundedSender<Outbound>,
    shared: Arc<ConnectionShared>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(self) {
        let mut shutdown = self.shutdown.clone();
        let mut status = RelayStatus::Connecting;
        let mut attempts: u32 = 0;
        let mut delay = self.options.reconnect_delay;
        // NOTICE restarts keep their own backoff
        let mut notice_delay = self.options.reconnect_delay;

        loop {
            self.shared.set_status(&self.url, status);
            status = RelayStatus::Reconnecting;
            self.observer.on_connecting(&self.url);

            let retry = match self.connect(&mut shutdown).await {
                Attempt::Shutdown => break,
                Attempt::Failed(err) => {
                    warn!("could not connect to {}: {}", self.url, err);
                    *lock(&self.shared.last_error) = Some(err.clone());
                    self.observer
                        .on_error(&self.url, &RelayError::Connect(err));
                    self.options.retry_on_error
                }
                Attempt::Open(sink, events) => {
                    attempts = 0;
                    delay = self.options.reconnect_delay;
                    *lock(&self.shared.last_error) = None;

                    // attach before announcing, so nothing sent on seeing
                    // the status can beat the socket to the writer
                    let _ = self.outbound.send(Outbound::Attach(sink));
                    self.shared.set_status(&self.url, RelayStatus::Connected);
                    info!("connected to {}", self.url);
                    self.observer.on_connected(&self.url);

                    if !self.replay() {
                        break;
                    }

                    let started = Instant::now();
                    let end = self.session(events, &mut shutdown).await;
                    let _ = self.outbound.send(Outbound::Detach);
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Notice => {
                            if started.elapsed() >= self.options.ping_interval {
                                notice_delay = self.options.reconnect_delay;
                            }
                            self.shared.set_status(&self.url, RelayStatus::Reconnecting);
                            info!(
                                "reconnecting to {} in {:?} after NOTICE",
                                self.url, notice_delay
                            );
                            if !backoff(notice_delay, &mut shutdown).await {
                                break;
                            }
                            notice_delay = notice_delay.mul_f64(1.5);
                            continue;
                        }
                        SessionEnd::Closed => {
                            info!("{} closed the connection", self.url);
                            self.options.retry_on_close
                        }
                        SessionEnd::Error(err) => {
                            warn!("connection to {} failed: {}", self.url, err);
                            self.observer
                                .on_error(&self.url, &RelayError::Transport(err));
                            self.options.retry_on_error
                        }
                    }
                }
            };

            if !retry {
                break;
            }

            if attempts >= self.options.retry_count {
                warn!("giving up on {} after {} attempts", self.url, attempts);
                self.observer
                    .on_error(&self.url, &RelayError::Unavailable { attempts });
                break;
            }

            attempts += 1;
            self.shared.set_status(&self.url, RelayStatus::Reconnecting);
            debug!(
                "reconnecting to {} in {:?} (attempt {}/{})",
                self.url, delay, attempts, self.options.retry_count
            );
            if !backoff(delay, &mut shutdown).await {
                break;
            }
            delay = delay.mul_f64(1.5);
        }

        self.finish();
    }

    /// One connection attempt, bounded by the connection timeout.
    async fn connect(&self, shutdown: &mut watch::Receiver<bool>) -> Attempt {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let sink = match self.transport.open(&self.url, events_tx) {
            Ok(sink) => sink,
            Err(err) => return Attempt::Failed(ConnectError::classify(&err.to_string())),
        };

        let timeout = self.options.connection_timeout;
        let outcome = tokio::select! {
            res = time::timeout(timeout, handshake(&mut events)) => Some(res),
            _ = wait_shutdown(shutdown) => None,
        };

        match outcome {
            None => Attempt::Shutdown,
            Some(Ok(Ok(()))) => Attempt::Open(sink, events),
            Some(Ok(Err(err))) => Attempt::Failed(err),
            Some(Err(_)) => Attempt::Failed(ConnectError::Timeout(timeout)),
        }
    }

    /// Hand the registry's REQs to the fresh socket. False if the pool is
    /// gone.
    fn replay(&self) -> bool {
        let Some(handler) = self.handler.upgrade() else {
            return false;
        };
        for msg in handler.connected(&self.url) {
            queue_command(&self.outbound, &self.url, &msg, false);
        }
        true
    }

    async fn session(
        &self,
        mut events: mpsc::UnboundedReceiver<WsEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let period = self.options.ping_interval;
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = wait_shutdown(shutdown) => return SessionEnd::Shutdown,
                _ = keepalive.tick() => {
                    let _ = self.outbound.send(Outbound::Ping);
                }
                event = events.recv() => match event {
                    Some(WsEvent::Message(msg)) => {
                        if let Some(end) = self.handle_frame(msg, shutdown).await {
                            return end;
                        }
                    }
                    Some(WsEvent::Opened) => {}
                    Some(WsEvent::Error(err)) => return SessionEnd::Error(err),
                    Some(WsEvent::Closed) | None => return SessionEnd::Closed,
                },
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: WsMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<SessionEnd> {
        let msg = match RelayEvent::from(&frame) {
            RelayEvent::Message(msg) => msg,
            RelayEvent::Error(err) => {
                warn!("dropping malformed message from {}: {}", self.url, err);
                return None;
            }
            RelayEvent::Other(WsMessage::Ping(payload)) => {
                let _ = self.outbound.send(Outbound::Pong(payload.clone()));
                return None;
            }
            RelayEvent::Other(other) => {
                trace!("ignoring {:?} from {}", other, self.url);
                return None;
            }
            RelayEvent::Opened | RelayEvent::Closed => return None,
        };

        self.observer.on_message(&self.url, &msg);

        let Some(handler) = self.handler.upgrade() else {
            return Some(SessionEnd::Shutdown);
        };

        match msg {
            RelayMessage::Event { sub_id, event } => {
                let delivery = handler.event(&sub_id, self.receive(*event));
                drop(handler);
                if let Some(delivery) = delivery {
                    // a full blocking sink must not keep close() waiting
                    tokio::select! {
                        _ = delivery.deliver() => {}
                        _ = wait_shutdown(shutdown) => return Some(SessionEnd::Shutdown),
                    }
                }
            }
            RelayMessage::Notice(notice) => {
                warn!("NOTICE from {}: {}", self.url, notice);
                self.observer.on_notice(&self.url, &notice);
                if self.options.reconnect_on_notice {
                    return Some(SessionEnd::Notice);
                }
            }
            RelayMessage::Auth(challenge) => {
                info!("{} asked for AUTH", self.url);
                self.observer.on_auth(&self.url, &challenge);
            }
            other => handler.message(&self.url, other),
        }

        None
    }

    #[profiling::function]
    fn receive(&self, event: Event) -> ReceivedEvent {
        let verified = !self.options.verify_signatures
            || match event.verify() {
                Ok(()) => true,
                Err(err) => {
                    warn!(
                        "event {} from {} failed verification: {}",
                        event.id, self.url, err
                    );
                    false
                }
            };

        ReceivedEvent {
            relay: self.url.clone(),
            event,
            verified,
        }
    }

    /// Terminal: the connection is discarded.
    fn finish(&self) {
        let _ = self.outbound.send(Outbound::Shutdown);
        self.shared.set_status(&self.url, RelayStatus::Closed);
        if let Some(handler) = self.handler.upgrade() {
            handler.lost(&self.url, self.id);
        }
        info!("connection to {} closed", self.url);
        self.observer.on_closed(&self.url);
    }
}

async fn handshake(events: &mut mpsc::UnboundedReceiver<WsEvent>) -> Result<(), ConnectError> {
    loop {
        match events.recv().await {
            Some(WsEvent::Opened) => return Ok(()),
            Some(WsEvent::Error(err)) => return Err(ConnectError::classify(&err)),
            Some(WsEvent::Closed) | None => {
                return Err(ConnectError::Refused("closed during handshake".to_owned()))
            }
            Some(WsEvent::Message(_)) => {}
        }
    }
}

/// Resolves once the connection is asked to stop, or its owner is gone.
async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep before a reconnect. False if the connection was closed meanwhile.
async fn backoff(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = time::sleep(delay) => true,
        _ = wait_shutdown(shutdown) => false,
    }
}
