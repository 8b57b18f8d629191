use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use hashbrown::HashMap;
use nostr::EventId;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::relay::{lock, NormRelayUrl};
use crate::{Error, Result, SubId};

/// One relay's `OK` for a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub relay: NormRelayUrl,
    pub event_id: EventId,
    pub accepted: bool,
    pub message: String,
}

/// One relay's answer to a `COUNT` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountResult {
    pub relay: NormRelayUrl,
    pub sub_id: SubId,
    pub count: u64,
    pub approximate: bool,
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

enum Waiter<T> {
    /// Resolved by the first response, then dropped.
    Once(oneshot::Sender<T>),
    /// Called for every response until its listener is dropped.
    Every(Callback<T>),
}

struct Pending<K, T> {
    next_token: u64,
    waiters: HashMap<K, Vec<(u64, Waiter<T>)>>,
}

impl<K: Eq + Hash, T: Clone> Pending<K, T> {
    fn new() -> Self {
        Self {
            next_token: 0,
            waiters: HashMap::new(),
        }
    }

    fn register(&mut self, key: K, waiter: Waiter<T>) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.waiters.entry(key).or_default().push((token, waiter));
        token
    }

    fn unregister(&mut self, key: &K, token: u64) {
        let Some(waiters) = self.waiters.get_mut(key) else {
            return;
        };
        waiters.retain(|(t, _)| *t != token);
        if waiters.is_empty() {
            self.waiters.remove(key);
        }
    }

    /// Callbacks listening on `key`, to be run without the lock held.
    fn callbacks(&self, key: &K) -> Vec<Callback<T>> {
        let Some(waiters) = self.waiters.get(key) else {
            return Vec::new();
        };

        waiters
            .iter()
            .filter_map(|(_, waiter)| match waiter {
                Waiter::Every(cb) => Some(Arc::clone(cb)),
                Waiter::Once(_) => None,
            })
            .collect()
    }

    /// Remove and return the one-shot waiters for `key`.
    fn take_once(&mut self, key: &K) -> Vec<oneshot::Sender<T>> {
        let Some(waiters) = self.waiters.get_mut(key) else {
            return Vec::new();
        };

        let mut senders = Vec::new();
        let mut kept = Vec::with_capacity(waiters.len());
        for (token, waiter) in waiters.drain(..) {
            match waiter {
                Waiter::Once(tx) => senders.push(tx),
                every => kept.push((token, every)),
            }
        }

        if kept.is_empty() {
            self.waiters.remove(key);
        } else {
            *waiters = kept;
        }
        senders
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone)]
enum Key {
    Publish(EventId),
    Count(SubId),
}

/// Matches `OK` and `COUNT` responses to the requests waiting on them.
pub(crate) struct CommandCorrelator {
    publish: Mutex<Pending<EventId, PublishAck>>,
    counts: Mutex<Pending<SubId, CountResult>>,
}

impl Default for CommandCorrelator {
    fn default() -> Self {
        Self {
            publish: Mutex::new(Pending::new()),
            counts: Mutex::new(Pending::new()),
        }
    }
}

impl CommandCorrelator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait for the first `OK` for `event_id` from any relay. The entry is
    /// registered before this returns, so send the event after calling it.
    pub fn await_publish_ack(
        self: &Arc<Self>,
        event_id: EventId,
        timeout: Duration,
    ) -> impl Future<Output = Result<PublishAck>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let token = lock(&self.publish).register(event_id, Waiter::Once(tx));
        let guard = Registration::new(self, Key::Publish(event_id), token);
        wait(rx, timeout, guard)
    }

    /// Wait for the first `COUNT` answer for `sub_id` from any relay.
    pub fn await_count(
        self: &Arc<Self>,
        sub_id: SubId,
        timeout: Duration,
    ) -> impl Future<Output = Result<CountResult>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let token = lock(&self.counts).register(sub_id.clone(), Waiter::Once(tx));
        let guard = Registration::new(self, Key::Count(sub_id), token);
        wait(rx, timeout, guard)
    }

    /// Call `cb` with every `OK` for `event_id`, from every relay, until
    /// the returned listener is dropped.
    pub fn on_publish_ack(
        self: &Arc<Self>,
        event_id: EventId,
        cb: impl Fn(&PublishAck) + Send + Sync + 'static,
    ) -> CommandListener {
        let token = lock(&self.publish).register(event_id, Waiter::Every(Arc::new(cb)));
        CommandListener {
            registration: Registration::new(self, Key::Publish(event_id), token),
        }
    }

    pub fn on_count(
        self: &Arc<Self>,
        sub_id: SubId,
        cb: impl Fn(&CountResult) + Send + Sync + 'static,
    ) -> CommandListener {
        let token = lock(&self.counts).register(sub_id.clone(), Waiter::Every(Arc::new(cb)));
        CommandListener {
            registration: Registration::new(self, Key::Count(sub_id), token),
        }
    }

    #[profiling::function]
    pub fn handle_ok(&self, ack: PublishAck) {
        let (senders, callbacks) = {
            let mut pending = lock(&self.publish);
            let senders = pending.take_once(&ack.event_id);
            (senders, pending.callbacks(&ack.event_id))
        };

        if senders.is_empty() && callbacks.is_empty() {
            trace!("unclaimed OK for {} from {}", ack.event_id, ack.relay);
            return;
        }

        debug!(
            "{} {} event {}: {}",
            ack.relay,
            if ack.accepted { "accepted" } else { "rejected" },
            ack.event_id,
            ack.message
        );
        deliver(senders, callbacks, ack);
    }

    #[profiling::function]
    pub fn handle_count(&self, result: CountResult) {
        let (senders, callbacks) = {
            let mut pending = lock(&self.counts);
            let senders = pending.take_once(&result.sub_id);
            (senders, pending.callbacks(&result.sub_id))
        };

        if senders.is_empty() && callbacks.is_empty() {
            trace!("unclaimed COUNT {} from {}", result.sub_id, result.relay);
            return;
        }
        deliver(senders, callbacks, result);
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        lock(&self.publish).len() + lock(&self.counts).len()
    }

    fn unregister(&self, key: &Key, token: u64) {
        match key {
            Key::Publish(id) => lock(&self.publish).unregister(id, token),
            Key::Count(id) => lock(&self.counts).unregister(id, token),
        }
    }
}

fn deliver<T: Clone>(senders: Vec<oneshot::Sender<T>>, callbacks: Vec<Callback<T>>, value: T) {
    for cb in callbacks {
        cb(&value);
    }
    for tx in senders {
        let _ = tx.send(value.clone());
    }
}

async fn wait<T>(rx: oneshot::Receiver<T>, timeout: Duration, _guard: Registration) -> Result<T> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(Error::PoolClosed),
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

/// Removes a correlator entry when dropped. Harmless if the entry was
/// already resolved.
struct Registration {
    correlator: Weak<CommandCorrelator>,
    key: Key,
    token: u64,
}

impl Registration {
    fn new(correlator: &Arc<CommandCorrelator>, key: Key, token: u64) -> Self {
        Self {
            correlator: Arc::downgrade(correlator),
            key,
            token,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(correlator) = self.correlator.upgrade() {
            correlator.unregister(&self.key, self.token);
        }
    }
}

/// Keeps a callback registered with [`crate::RelayPool::on_publish_ack`] or
/// [`crate::RelayPool::on_count`] alive. Drop it to stop the callbacks.
pub struct CommandListener {
    registration: Registration,
}

impl CommandListener {
    pub fn cancel(self) {}
}

impl std::fmt::Debug for CommandListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandListener")
            .field("key", &self.registration.key)
            .finish()
    }
}
