use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use hashbrown::HashMap;
use nostr::{Event, EventId, Filter};
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::relay::connection::{ConnectionHandler, RelayConnection};
use crate::relay::correlator::CommandCorrelator;
use crate::relay::message::RelayMessage;
use crate::relay::subscription::{Delivery, Outbox, SubscriptionRegistry};
use crate::relay::{
    lock, CommandListener, CountResult, EventQueue, EventStream, NoopObserver, NormRelayUrl,
    PoolOptions, PublishAck, ReceivedEvent, RelayObserver, RelayStatus, SubscribeOptions,
    SubscriptionOutcome, Transport, WebsocketTransport,
};
use crate::{ClientMessage, ConnectError, Error, Result, SubId};

/// How `init` went, relay by relay.
#[derive(Debug, Default, Clone)]
pub struct InitReport {
    pub connected: Vec<NormRelayUrl>,
    pub failed: Vec<(NormRelayUrl, ConnectError)>,
    /// Added without connecting, because listening is lazy.
    pub pending: Vec<NormRelayUrl>,
}

impl InitReport {
    pub fn all_connected(&self) -> bool {
        self.failed.is_empty() && self.pending.is_empty()
    }
}

pub(crate) struct PoolShared {
    me: Weak<PoolShared>,
    relays: Mutex<HashMap<NormRelayUrl, RelayConnection>>,
    subs: SubscriptionRegistry,
    commands: Arc<CommandCorrelator>,
    options: Mutex<PoolOptions>,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn RelayObserver>,
    next_connection: AtomicU64,
}

impl PoolShared {
    fn options(&self) -> PoolOptions {
        lock(&self.options).clone()
    }

    /// Add a connection for `url`, replacing a dead one. False if a live
    /// connection is already there.
    fn insert(&self, url: &NormRelayUrl, options: &PoolOptions) -> bool {
        let replaced = {
            let mut relays = lock(&self.relays);
            if relays.get(url).is_some_and(|c| c.status().is_live()) {
                return false;
            }
            relays.insert(url.clone(), self.connection(url, options))
        };

        // closed outside the directory lock
        drop(replaced);
        true
    }

    /// Put a fresh connection in place of whatever is there and hand the
    /// old one back. Dropping it afterwards closes it; by then its loss no
    /// longer touches the subscriptions.
    fn replace(&self, url: &NormRelayUrl, options: &PoolOptions) -> Option<RelayConnection> {
        let conn = self.connection(url, options);
        lock(&self.relays).insert(url.clone(), conn)
    }

    fn connection(&self, url: &NormRelayUrl, options: &PoolOptions) -> RelayConnection {
        let handler: Weak<dyn ConnectionHandler> = self.me.clone();
        let conn = RelayConnection::new(
            self.next_connection.fetch_add(1, Ordering::Relaxed),
            url.clone(),
            options.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.observer),
            handler,
        );
        if !options.lazy_listening {
            conn.start();
        }
        conn
    }

    fn remove(&self, url: &NormRelayUrl) -> bool {
        let removed = lock(&self.relays).remove(url);
        match removed {
            Some(conn) => {
                info!("removing relay {}", url);
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Start connections that were added lazily.
    fn ensure_listening(&self) {
        for conn in lock(&self.relays).values() {
            if conn.start() {
                debug!("lazily connecting to {}", conn.url());
            }
        }
    }

    fn urls_where(&self, pred: impl Fn(RelayStatus) -> bool) -> Vec<NormRelayUrl> {
        lock(&self.relays)
            .iter()
            .filter(|(_, conn)| pred(conn.status()))
            .map(|(url, _)| url.clone())
            .collect()
    }

    #[profiling::function]
    fn broadcast(&self, msg: &ClientMessage) -> usize {
        self.ensure_listening();
        let relays = lock(&self.relays);
        let mut sent = 0;
        for conn in relays.values() {
            if conn.accepts(msg) {
                conn.send(msg);
                sent += 1;
            } else {
                trace!("skipping {} ({})", conn.url(), conn.status());
            }
        }
        sent
    }

    fn dispatch(&self, outbox: Outbox) {
        if outbox.is_empty() {
            return;
        }

        let relays = lock(&self.relays);
        for (url, msg) in outbox {
            match relays.get(&url) {
                Some(conn) => conn.send(&msg),
                None => trace!("{} is gone, not sending", url),
            }
        }
    }

    fn arm_timer(&self, id: &SubId, timeout: Duration) {
        let pool = self.me.clone();
        let sub = id.clone();
        let timer = tokio::spawn(async move {
            time::sleep(timeout).await;
            if let Some(pool) = pool.upgrade() {
                let outbox = pool.subs.time_out(&sub);
                pool.dispatch(outbox);
            }
        });
        self.subs.set_timer(id, timer.abort_handle());
    }

    pub(crate) fn close_subscription(&self, id: &SubId) {
        let outbox = self.subs.close(id);
        self.dispatch(outbox);
    }
}

impl ConnectionHandler for PoolShared {
    fn connected(&self, relay: &NormRelayUrl) -> Vec<ClientMessage> {
        self.subs.relay_connected(relay)
    }

    fn event(&self, sub_id: &SubId, event: ReceivedEvent) -> Option<Delivery> {
        self.subs.route_event(sub_id, event)
    }

    #[profiling::function]
    fn message(&self, relay: &NormRelayUrl, msg: RelayMessage) {
        match msg {
            RelayMessage::Eose(sub_id) => {
                debug!("EOSE for {} from {}", sub_id.abbrev(), relay);
                let outbox = self.subs.eose(relay, &sub_id);
                self.dispatch(outbox);
            }
            RelayMessage::Closed { sub_id, message } => {
                let outbox = self.subs.closed_by_relay(relay, &sub_id, &message);
                self.dispatch(outbox);
            }
            RelayMessage::Ok(result) => self.commands.handle_ok(PublishAck {
                relay: relay.clone(),
                event_id: result.event_id,
                accepted: result.accepted,
                message: result.message,
            }),
            RelayMessage::Count {
                sub_id,
                count,
                approximate,
            } => self.commands.handle_count(CountResult {
                relay: relay.clone(),
                sub_id,
                count,
                approximate,
            }),
            other => trace!("unrouted message from {}: {:?}", relay, other),
        }
    }

    fn lost(&self, relay: &NormRelayUrl, connection: u64) {
        let current = lock(&self.relays).get(relay).map(RelayConnection::id);
        if current.is_some_and(|id| id != connection) {
            // a newer connection to the same relay owns its subscriptions
            debug!("ignoring loss of a replaced connection to {}", relay);
            return;
        }

        let outbox = self.subs.relay_lost(relay);
        self.dispatch(outbox);
    }
}

/// The set of relays a client talks to.
///
/// Cloning is cheap; clones share the same connections and subscriptions.
/// Independent pools share nothing.
///
/// ```no_run
/// use std::time::Duration;
/// use relaypool::{Filter, PoolOptions, RelayPool};
///
/// # async fn run() -> relaypool::Result<()> {
/// let pool = RelayPool::new(PoolOptions::default());
/// pool.init(["wss://relay.damus.io", "wss://nos.lol"]).await?;
///
/// let mut stream = pool.subscribe(vec![Filter::new().limit(20)]);
/// let outcome = stream.caught_up().await?;
/// println!("{} stored events", outcome.events.len());
///
/// while let Some(received) = stream.next().await {
///     println!("{}: {}", received.relay, received.event.content);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RelayPool {
    shared: Arc<PoolShared>,
}

impl Default for RelayPool {
    fn default() -> Self {
        RelayPool::new(PoolOptions::default())
    }
}

impl RelayPool {
    pub fn new(options: PoolOptions) -> Self {
        Self::with_transport(options, WebsocketTransport, NoopObserver)
    }

    pub fn with_observer(options: PoolOptions, observer: impl RelayObserver) -> Self {
        Self::with_transport(options, WebsocketTransport, observer)
    }

    pub fn with_transport(
        options: PoolOptions,
        transport: impl Transport,
        observer: impl RelayObserver,
    ) -> Self {
        let shared = Arc::new_cyclic(|me| PoolShared {
            me: me.clone(),
            relays: Mutex::new(HashMap::new()),
            subs: SubscriptionRegistry::new(),
            commands: CommandCorrelator::new(),
            options: Mutex::new(options),
            transport: Arc::new(transport),
            observer: Arc::new(observer),
            next_connection: AtomicU64::new(0),
        });
        Self { shared }
    }

    pub fn options(&self) -> PoolOptions {
        self.shared.options()
    }

    /// Connect to every url concurrently and wait until each attempt has
    /// connected or failed, for at most the connection timeout.
    ///
    /// Failures are reported per relay through the observer and the
    /// returned report. They only fail the call when
    /// `ignore_connection_exception` is off; the relays added by this call
    /// are removed again in that case.
    pub async fn init<I, S>(&self, urls: I) -> Result<InitReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let options = self.options();
        let strict = !options.ignore_connection_exception;
        let mut requested = Vec::new();
        let mut added = Vec::new();

        for url in urls {
            let url = match NormRelayUrl::new(url.as_ref()) {
                Ok(url) => url,
                Err(err) if strict => return Err(err),
                Err(err) => {
                    warn!("skipping relay '{}': {}", url.as_ref(), err);
                    continue;
                }
            };

            if self.shared.insert(&url, &options) {
                added.push(url.clone());
            }
            requested.push(url);
        }

        self.await_connections(requested, &added, &options).await
    }

    /// Wait out the connection attempts of `requested`. In strict mode the
    /// first failure backs out the `added` relays and fails the call.
    async fn await_connections(
        &self,
        requested: Vec<NormRelayUrl>,
        added: &[NormRelayUrl],
        options: &PoolOptions,
    ) -> Result<InitReport> {
        let mut report = InitReport::default();
        if options.lazy_listening {
            report.pending = requested;
            return Ok(report);
        }

        let probes: Vec<_> = {
            let relays = lock(&self.shared.relays);
            requested
                .iter()
                .filter_map(|url| relays.get(url).map(|conn| (url.clone(), conn.probe())))
                .collect()
        };

        let timeout = options.connection_timeout;
        let results = join_all(probes.into_iter().map(|(url, probe)| async move {
            let result = match time::timeout(timeout, probe.settled()).await {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Timeout(timeout)),
            };
            (url, result)
        }))
        .await;

        for (url, result) in results {
            match result {
                Ok(()) => report.connected.push(url),
                Err(err) => report.failed.push((url, err)),
            }
        }

        info!(
            "relay pool init: {} connected, {} failed",
            report.connected.len(),
            report.failed.len()
        );

        if !options.ignore_connection_exception {
            if let Some((relay, source)) = report.failed.first().cloned() {
                for url in added {
                    self.shared.remove(url);
                }
                return Err(Error::Connect { relay, source });
            }
        }

        Ok(report)
    }

    /// Add one relay and start connecting to it (unless listening is lazy).
    /// Open subscriptions are sent to it once it connects.
    pub fn add_relay(&self, url: &str) -> Result<NormRelayUrl> {
        let url = NormRelayUrl::new(url)?;
        if !self.shared.insert(&url, &self.options()) {
            debug!("already connected to {}", url);
        }
        Ok(url)
    }

    pub fn remove_relay(&self, url: &NormRelayUrl) -> bool {
        self.shared.remove(url)
    }

    pub fn has(&self, url: &str) -> bool {
        match NormRelayUrl::new(url) {
            Ok(url) => lock(&self.shared.relays).contains_key(&url),
            Err(_) => false,
        }
    }

    pub fn urls(&self) -> BTreeSet<NormRelayUrl> {
        lock(&self.shared.relays).keys().cloned().collect()
    }

    pub fn status(&self, url: &NormRelayUrl) -> Option<RelayStatus> {
        lock(&self.shared.relays).get(url).map(RelayConnection::status)
    }

    pub fn statuses(&self) -> BTreeMap<NormRelayUrl, RelayStatus> {
        lock(&self.shared.relays)
            .iter()
            .map(|(url, conn)| (url.clone(), conn.status()))
            .collect()
    }

    pub fn connected(&self) -> Vec<NormRelayUrl> {
        self.shared
            .urls_where(|status| status == RelayStatus::Connected)
    }

    /// Send a command to every connected relay. Disconnected relays are
    /// skipped unless buffering is on. Returns how many relays took it.
    pub fn broadcast(&self, msg: &ClientMessage) -> usize {
        self.shared.broadcast(msg)
    }

    /// Send a command to one relay. False if the relay is unknown or
    /// wouldn't take it right now.
    pub fn send_to(&self, msg: &ClientMessage, url: &NormRelayUrl) -> bool {
        self.shared.ensure_listening();
        match lock(&self.shared.relays).get(url) {
            Some(conn) if conn.accepts(msg) => {
                conn.send(msg);
                true
            }
            _ => false,
        }
    }

    pub fn subscribe(&self, filters: Vec<Filter>) -> EventStream {
        let opts = self.options().subscribe_defaults();
        self.subscribe_with(filters, opts)
    }

    /// Subscribe on every relay. Returns right away; relays that aren't
    /// connected yet get the request when they connect. Needs a tokio
    /// runtime for the eose timer.
    pub fn subscribe_with(&self, filters: Vec<Filter>, opts: SubscribeOptions) -> EventStream {
        let shared = &self.shared;
        shared.ensure_listening();

        let id = SubId::new();
        let queue = EventQueue::new(opts.queue_capacity, opts.overflow);
        let live = shared.urls_where(RelayStatus::is_live);
        let (caught_up, outbox) =
            shared
                .subs
                .insert(id.clone(), filters, live, opts.oneshot, queue.clone());
        shared.dispatch(outbox);

        let reqs: Outbox = shared
            .urls_where(|status| status == RelayStatus::Connected)
            .into_iter()
            .filter_map(|url| {
                let req = shared.subs.start(&id, &url)?;
                Some((url, req))
            })
            .collect();
        shared.dispatch(reqs);

        if let Some(timeout) = opts.eose_timeout {
            shared.arm_timer(&id, timeout);
        }

        EventStream::new(id, queue, caught_up, Arc::downgrade(shared))
    }

    pub fn unsubscribe(&self, id: &SubId) {
        self.shared.close_subscription(id);
    }

    /// Open a one-shot subscription and wait for its stored events. Relays
    /// that stay silent past `timeout` are marked timed out in the outcome.
    pub async fn fetch_events(
        &self,
        filters: Vec<Filter>,
        timeout: Duration,
    ) -> Result<SubscriptionOutcome> {
        let opts = self
            .options()
            .subscribe_defaults()
            .oneshot()
            .eose_timeout(Some(timeout));
        let mut stream = self.subscribe_with(filters, opts);
        stream.caught_up().await
    }

    /// Wait for the first `OK` for `event_id` from any relay. Call before
    /// sending the event.
    pub fn await_publish_ack(
        &self,
        event_id: EventId,
        timeout: Duration,
    ) -> impl Future<Output = Result<PublishAck>> + Send + 'static {
        self.shared.commands.await_publish_ack(event_id, timeout)
    }

    /// Publish an event to every relay and wait for the first `OK`.
    pub async fn publish(&self, event: Event, timeout: Duration) -> Result<PublishAck> {
        let ack = self.await_publish_ack(event.id, timeout);
        if self.broadcast(&ClientMessage::event(event)) == 0 {
            return Err(Error::NoRelays);
        }
        ack.await
    }

    /// Wait for the first `COUNT` answer for `sub_id`. Call before sending
    /// the request.
    pub fn await_count(
        &self,
        sub_id: SubId,
        timeout: Duration,
    ) -> impl Future<Output = Result<CountResult>> + Send + 'static {
        self.shared.commands.await_count(sub_id, timeout)
    }

    /// Ask every relay for a count and take the first answer.
    pub async fn count(&self, filters: Vec<Filter>, timeout: Duration) -> Result<CountResult> {
        let id = SubId::new();
        let answer = self.await_count(id.clone(), timeout);
        if self.broadcast(&ClientMessage::count(id, filters)) == 0 {
            return Err(Error::NoRelays);
        }
        answer.await
    }

    /// Call `cb` with every relay's `OK` for `event_id` until the listener
    /// is dropped. Never times out.
    pub fn on_publish_ack(
        &self,
        event_id: EventId,
        cb: impl Fn(&PublishAck) + Send + Sync + 'static,
    ) -> CommandListener {
        self.shared.commands.on_publish_ack(event_id, cb)
    }

    pub fn on_count(
        &self,
        sub_id: SubId,
        cb: impl Fn(&CountResult) + Send + Sync + 'static,
    ) -> CommandListener {
        self.shared.commands.on_count(sub_id, cb)
    }

    /// Tear down every connection and connect again with `options`. Open
    /// subscriptions are replayed as relays come back.
    pub async fn reconnect_all(&self, options: PoolOptions) -> Result<InitReport> {
        *lock(&self.shared.options) = options.clone();
        let urls: Vec<NormRelayUrl> = lock(&self.shared.relays).keys().cloned().collect();
        info!("reconnecting to {} relays", urls.len());

        // every url is owned by its new connection before an old one closes
        let old: Vec<RelayConnection> = urls
            .iter()
            .filter_map(|url| self.shared.replace(url, &options))
            .collect();
        drop(old);

        self.await_connections(urls, &[], &options).await
    }

    /// Close every connection and empty the directory. Subscriptions and
    /// pending commands stay registered; close them separately.
    pub fn disconnect_all(&self) {
        let old: Vec<RelayConnection> = lock(&self.shared.relays)
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        info!("disconnecting from {} relays", old.len());
        for conn in &old {
            conn.close();
        }
    }

    pub fn subscriptions(&self) -> usize {
        self.shared.subs.len()
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.statuses())
            .field("subscriptions", &self.subscriptions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::test_utils::{
        count_frame, eose_frame, event_frame, init_tracing, ok_frame, relay_url, text_note,
        Behavior, MockTransport, RecordingObserver,
    };
    use crate::relay::{OverflowPolicy, RelayOutcome};
    use nostr::Kind;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, Instant};

    fn mock_pool(options: PoolOptions) -> (RelayPool, MockTransport, RecordingObserver) {
        init_tracing();
        let transport = MockTransport::new();
        let observer = RecordingObserver::new();
        let pool = RelayPool::with_transport(options, transport.clone(), observer.clone());
        (pool, transport, observer)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn notes() -> Vec<Event> {
        (0..3).map(|i| text_note(&format!("note {i}"))).collect()
    }

    fn filters() -> Vec<Filter> {
        vec![Filter::new().kind(Kind::TextNote).limit(10)]
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_relays_deliver_each_event_once() {
        let (pool, transport, _) = mock_pool(PoolOptions::default());
        let (a, b) = (relay_url(1), relay_url(2));
        pool.init([a.as_str(), b.as_str()]).await.unwrap();

        let mut stream = pool.subscribe(filters());
        settle().await;
        assert_eq!(transport.sent_of(&a, "REQ").len(), 1);
        assert_eq!(transport.sent_of(&b, "REQ").len(), 1);

        let sub = stream.id().to_string();
        let start = Instant::now();
        {
            let transport = transport.clone();
            let notes = notes();
            tokio::spawn(async move {
                sleep(Duration::from_millis(50)).await;
                for note in &notes {
                    transport.push(&a, event_frame(&sub, note));
                }
                transport.push(&a, eose_frame(&sub));

                sleep(Duration::from_millis(30)).await;
                for note in &notes {
                    transport.push(&b, event_frame(&sub, note));
                }
                transport.push(&b, eose_frame(&sub));
            });
        }

        let outcome = stream.caught_up().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(80));
        assert!(outcome.is_complete());
        assert!(!outcome.timed_out);
        assert_eq!(outcome.events.len(), 3);

        for _ in 0..3 {
            assert!(stream.next().await.unwrap().verified);
        }
        assert_eq!(stream.buffered(), 0);

        // the signal never fires twice
        assert_eq!(stream.caught_up().await.unwrap().events.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_times_out_when_no_relay_answers() {
        let (pool, transport, _) = mock_pool(PoolOptions::default());
        let a = relay_url(1);
        pool.init([a.as_str()]).await.unwrap();

        let start = Instant::now();
        let result = pool
            .publish(text_note("hello"), Duration::from_millis(3000))
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
        assert_eq!(transport.sent_of(&a, "EVENT").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_takes_the_first_ok() {
        let (pool, transport, _) = mock_pool(PoolOptions::default());
        let (a, b) = (relay_url(1), relay_url(2));
        pool.init([a.as_str(), b.as_str()]).await.unwrap();

        let note = text_note("hello");
        let seen = Arc::new(AtomicUsize::new(0));
        let _listener = {
            let seen = Arc::clone(&seen);
            pool.on_publish_ack(note.id, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        };

        let publish = {
            let pool = pool.clone();
            let note = note.clone();
            tokio::spawn(async move { pool.publish(note, Duration::from_secs(5)).await })
        };
        settle().await;

        transport.push(&b, ok_frame(&note, false));
        settle().await;
        transport.push(&a, ok_frame(&note, true));
        settle().await;

        let ack = publish.await.unwrap().unwrap();
        assert_eq!(ack.relay, b);
        assert!(!ack.accepted);
        assert_eq!(seen.load(Ordering::SeqCst), 2, "callbacks see every relay");
    }

    #[tokio::test(start_paused = true)]
    async fn publish_with_no_relays_fails_fast() {
        let (pool, _, _) = mock_pool(PoolOptions::default());
        let result = pool.publish(text_note("void"), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::NoRelays)));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resends_requests_and_keeps_deduplicating() {
        let mut options = PoolOptions::default();
        options
            .retry(2)
            .reconnect_delay(Duration::from_millis(100));
        let (pool, transport, observer) = mock_pool(options);
        let a = relay_url(1);
        transport.script(
            &a,
            [
                Behavior::Accept,
                Behavior::Refuse("Connection refused".to_owned()),
                Behavior::Accept,
            ],
        );
        pool.init([a.as_str()]).await.unwrap();

        let mut stream = pool.subscribe(filters());
        settle().await;
        let sub = stream.id().to_string();
        let [first, second, _] = <[Event; 3]>::try_from(notes()).unwrap();

        transport.push(&a, event_frame(&sub, &first));
        transport.push(&a, eose_frame(&sub));
        assert_eq!(stream.next().await.unwrap().event.id, first.id);

        transport.drop_connection(&a);
        sleep(Duration::from_millis(300)).await;

        assert_eq!(transport.opens(&a), 3);
        assert_eq!(pool.status(&a), Some(RelayStatus::Connected));
        assert_eq!(transport.sent_of(&a, "REQ").len(), 2);
        assert!(!observer.events(&a).contains(&"unavailable".to_owned()));

        transport.push(&a, event_frame(&sub, &first));
        transport.push(&a, event_frame(&sub, &second));
        assert_eq!(stream.next().await.unwrap().event.id, second.id);
        assert_eq!(stream.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn count_takes_the_first_answer() {
        let (pool, transport, _) = mock_pool(PoolOptions::default());
        let (x, y) = (relay_url(1), relay_url(2));
        pool.init([x.as_str(), y.as_str()]).await.unwrap();

        let start = Instant::now();
        let counting = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let result = pool.count(filters(), Duration::from_secs(1)).await;
                (result, start.elapsed())
            })
        };
        settle().await;

        let sent = transport.sent_of(&x, "COUNT");
        let sub = sent[0][1].as_str().unwrap().to_owned();
        assert_eq!(transport.sent_of(&y, "COUNT")[0][1], sent[0][1]);

        sleep(Duration::from_millis(20)).await;
        transport.push(&x, count_frame(&sub, 5));
        sleep(Duration::from_millis(20)).await;
        transport.push(&y, count_frame(&sub, 7));

        let (result, elapsed) = counting.await.unwrap();
        let result = result.unwrap();
        assert_eq!(result.count, 5);
        assert_eq!(result.relay, x);
        assert_eq!(elapsed, Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn init_carries_on_past_an_unreachable_relay() {
        let (pool, transport, observer) = mock_pool(PoolOptions::default());
        let (a, b, c) = (relay_url(1), relay_url(2), relay_url(3));
        transport.script(&c, [Behavior::Refuse("Connection refused".to_owned())]);

        let report = pool
            .init([a.as_str(), b.as_str(), c.as_str()])
            .await
            .unwrap();

        assert_eq!(report.connected.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, c);
        assert!(matches!(report.failed[0].1, ConnectError::Refused(_)));
        assert!(observer.events(&c).contains(&"connect error".to_owned()));
        assert_eq!(pool.connected().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn strict_init_fails_and_backs_out() {
        let mut options = PoolOptions::default();
        options.ignore_connection_exception(false);
        let (pool, transport, _) = mock_pool(options);
        let (a, b) = (relay_url(1), relay_url(2));
        transport.script(&b, [Behavior::Hang]);

        let start = Instant::now();
        let err = pool.init([a.as_str(), b.as_str()]).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Connect { ref relay, source: ConnectError::Timeout(_) } if *relay == b
        ));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(pool.urls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn closing_stops_deliveries() {
        let (pool, transport, _) = mock_pool(PoolOptions::default());
        let a = relay_url(1);
        pool.init([a.as_str()]).await.unwrap();

        let mut stream = pool.subscribe(filters());
        settle().await;
        let sub = stream.id().to_string();
        let notes = notes();

        transport.push(&a, event_frame(&sub, &notes[0]));
        assert!(stream.next().await.is_some());

        stream.close();
        transport.push(&a, event_frame(&sub, &notes[1]));
        settle().await;

        assert!(stream.next().await.is_none());
        assert_eq!(transport.sent_of(&a, "CLOSE").len(), 1);
        assert_eq!(pool.subscriptions(), 0);

        // a partial outcome, not an error
        let outcome = stream.caught_up().await.unwrap();
        assert_eq!(outcome.relays[&a], RelayOutcome::Cancelled);
        assert_eq!(outcome.events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_stream_closes_the_subscription() {
        let (pool, transport, _) = mock_pool(PoolOptions::default());
        let a = relay_url(1);
        pool.init([a.as_str()]).await.unwrap();

        let stream = pool.subscribe(filters());
        let sub = stream.id().clone();
        settle().await;
        drop(stream);
        settle().await;

        let closes = transport.sent_of(&a, "CLOSE");
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0][1], sub.as_str());

        // same filters, fresh id
        let again = pool.subscribe(filters());
        assert_ne!(again.id(), &sub);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_marks_silent_relays_timed_out() {
        let (pool, transport, _) = mock_pool(PoolOptions::default());
        let (a, b) = (relay_url(1), relay_url(2));
        pool.init([a.as_str(), b.as_str()]).await.unwrap();

        let start = Instant::now();
        let fetch = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.fetch_events(filters(), Duration::from_secs(2)).await })
        };
        settle().await;

        let sub = transport.sent_of(&a, "REQ")[0][1]
            .as_str()
            .unwrap()
            .to_owned();
        transport.push(&a, event_frame(&sub, &text_note("stored")));
        transport.push(&a, eose_frame(&sub));

        let outcome = fetch.await.unwrap().unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert!(outcome.timed_out);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.relays[&a], RelayOutcome::Eose);
        assert_eq!(outcome.timed_out_relays().collect::<Vec<_>>(), vec![&b]);

        settle().await;
        assert_eq!(transport.sent_of(&a, "CLOSE").len(), 1);
        assert_eq!(transport.sent_of(&b, "CLOSE").len(), 1);
        assert_eq!(pool.subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn an_unavailable_relay_does_not_hold_up_the_others() {
        let mut options = PoolOptions::default();
        options
            .retry(1)
            .reconnect_delay(Duration::from_millis(100));
        let (pool, transport, observer) = mock_pool(options);
        let (a, b) = (relay_url(1), relay_url(2));
        transport.script(
            &a,
            [
                Behavior::Accept,
                Behavior::Refuse("Connection refused".to_owned()),
            ],
        );
        pool.init([a.as_str(), b.as_str()]).await.unwrap();

        let mut stream = pool.subscribe(filters());
        settle().await;
        let sub = stream.id().to_string();

        transport.push(&b, eose_frame(&sub));
        transport.drop_connection(&a);

        let start = Instant::now();
        let outcome = stream.caught_up().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert_eq!(outcome.relays[&a], RelayOutcome::Failed);
        assert_eq!(outcome.relays[&b], RelayOutcome::Eose);
        assert!(observer.events(&a).contains(&"unavailable".to_owned()));
        assert_eq!(pool.status(&a), Some(RelayStatus::Closed));

        let note = text_note("live");
        transport.push(&b, event_frame(&sub, &note));
        assert_eq!(stream.next().await.unwrap().event.id, note.id);
    }

    #[tokio::test(start_paused = true)]
    async fn lazy_pools_connect_on_first_use() {
        let mut options = PoolOptions::default();
        options.lazy_listening(true);
        let (pool, transport, _) = mock_pool(options);
        let a = relay_url(1);

        let report = pool.init([a.as_str()]).await.unwrap();
        assert_eq!(report.pending, vec![a.clone()]);
        assert_eq!(transport.opens(&a), 0);
        assert_eq!(pool.status(&a), Some(RelayStatus::Disconnected));

        let note = text_note("early");
        assert_eq!(pool.broadcast(&ClientMessage::event(note.clone())), 1);
        settle().await;

        assert_eq!(transport.opens(&a), 1);
        let sent = transport.sent_of(&a, "EVENT");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][1]["id"], note.id.to_hex());
    }

    #[tokio::test(start_paused = true)]
    async fn relays_added_later_pick_up_subscriptions() {
        let (pool, transport, _) = mock_pool(PoolOptions::default());
        let (a, b) = (relay_url(1), relay_url(2));
        pool.init([a.as_str()]).await.unwrap();

        let mut stream = pool.subscribe(filters());
        settle().await;
        let sub = stream.id().to_string();

        pool.add_relay(b.as_str()).unwrap();
        settle().await;
        assert_eq!(transport.sent_of(&b, "REQ").len(), 1);

        // both have to catch up now
        transport.push(&a, eose_frame(&sub));
        settle().await;
        assert!(!stream.is_caught_up());
        transport.push(&b, eose_frame(&sub));
        settle().await;
        assert!(stream.is_caught_up());

        assert!(pool.remove_relay(&b));
        assert!(!pool.has(b.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn notice_can_trigger_a_reconnect() {
        let mut options = PoolOptions::default();
        options.reconnect_on_notice(true);
        let (pool, transport, observer) = mock_pool(options);
        let a = relay_url(1);
        pool.init([a.as_str()]).await.unwrap();
        let _stream = pool.subscribe(filters());
        settle().await;

        transport.push(&a, r#"["NOTICE","restarting"]"#);
        settle().await;
        assert_eq!(transport.opens(&a), 1, "reconnects wait out the delay");
        assert_eq!(pool.status(&a), Some(RelayStatus::Reconnecting));

        sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(transport.opens(&a), 2);
        assert_eq!(transport.sent_of(&a, "REQ").len(), 2);
        assert!(observer
            .events(&a)
            .contains(&"notice restarting".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_all_replays_subscriptions() {
        let (pool, transport, _) = mock_pool(PoolOptions::default());
        let (a, b) = (relay_url(1), relay_url(2));
        pool.init([a.as_str(), b.as_str()]).await.unwrap();
        let _stream = pool.subscribe(filters());
        settle().await;

        let report = pool.reconnect_all(PoolOptions::default()).await.unwrap();
        settle().await;

        assert_eq!(report.connected.len(), 2);
        assert_eq!(transport.opens(&a), 2);
        assert_eq!(transport.sent_of(&a, "REQ").len(), 2);
        assert_eq!(pool.subscriptions(), 1);

        pool.disconnect_all();
        settle().await;
        assert!(pool.urls().is_empty());
        assert_eq!(pool.subscriptions(), 1, "subscriptions outlive the connections");
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_relay_unblocks_a_full_sink() {
        let (pool, transport, observer) = mock_pool(PoolOptions::default());
        let a = relay_url(1);
        pool.init([a.as_str()]).await.unwrap();
        let opts = pool.options().subscribe_defaults().queue(1, OverflowPolicy::Block);
        let stream = pool.subscribe_with(filters(), opts);
        settle().await;

        let sub = stream.id().to_string();
        for note in notes() {
            transport.push(&a, event_frame(&sub, &note));
        }
        settle().await;
        assert_eq!(stream.buffered(), 1);

        assert!(pool.remove_relay(&a));
        settle().await;
        assert!(observer.events(&a).contains(&"closed".to_owned()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reconnect_all_keeps_the_backlog_open() {
        for _ in 0..20 {
            let (pool, transport, _) = mock_pool(PoolOptions::default());
            let a = relay_url(1);
            pool.init([a.as_str()]).await.unwrap();
            let mut stream = pool.subscribe(filters());
            sleep(Duration::from_millis(10)).await;
            assert_eq!(transport.sent_of(&a, "REQ").len(), 1);

            pool.reconnect_all(PoolOptions::default()).await.unwrap();
            sleep(Duration::from_millis(10)).await;

            // the old connection going away must not end the backlog
            assert!(!stream.is_caught_up());
            assert_eq!(transport.sent_of(&a, "REQ").len(), 2);

            transport.push(&a, eose_frame(&stream.id().to_string()));
            let outcome = tokio::time::timeout(Duration::from_secs(1), stream.caught_up())
                .await
                .expect("caught up in time")
                .unwrap();
            assert_eq!(outcome.relays[&a], RelayOutcome::Eose);
        }
    }
}
