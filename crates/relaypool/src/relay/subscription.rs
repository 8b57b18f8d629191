use std::collections::BTreeMap;
use std::sync::Mutex;

use hashbrown::{HashMap, HashSet};
use nostr::{Event, EventId, Filter};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::relay::{lock, EventQueue, NormRelayUrl};
use crate::{ClientMessage, SubId};

/// One event as a subscription's sink yields it.
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    /// The relay that delivered this copy.
    pub relay: NormRelayUrl,
    pub event: Event,
    /// False when the id or signature didn't check out. Such events are
    /// still delivered so callers can decide what to do with them. With
    /// signature checks turned off this is always true and means unchecked.
    pub verified: bool,
}

/// How a relay finished the backlog phase of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Eose,
    /// The relay refused or ended the subscription with `CLOSED`.
    Closed(String),
    TimedOut,
    /// The connection was lost or closed before the relay caught up.
    Failed,
    /// The subscription was closed before the relay caught up.
    Cancelled,
}

/// What a subscription's caught-up accessor resolves with.
#[derive(Debug, Clone)]
pub struct SubscriptionOutcome {
    pub id: SubId,
    /// Unique events received before the subscription caught up.
    pub events: Vec<ReceivedEvent>,
    pub relays: BTreeMap<NormRelayUrl, RelayOutcome>,
    /// The eose timeout forced completion.
    pub timed_out: bool,
}

impl SubscriptionOutcome {
    pub fn timed_out_relays(&self) -> impl Iterator<Item = &NormRelayUrl> {
        self.relays
            .iter()
            .filter(|(_, outcome)| **outcome == RelayOutcome::TimedOut)
            .map(|(relay, _)| relay)
    }

    /// Every relay sent its end-of-stored-events marker.
    pub fn is_complete(&self) -> bool {
        self.relays.values().all(|o| *o == RelayOutcome::Eose)
    }
}

/// Commands the pool has to send after a registry update.
pub(crate) type Outbox = Vec<(NormRelayUrl, ClientMessage)>;

/// An event that passed routing, ready to be pushed into its sink. Pushing
/// can wait (block policy), so it happens outside the registry lock.
pub(crate) struct Delivery {
    queue: EventQueue<ReceivedEvent>,
    event: ReceivedEvent,
}

impl Delivery {
    pub fn new(queue: EventQueue<ReceivedEvent>, event: ReceivedEvent) -> Self {
        Self { queue, event }
    }

    pub async fn deliver(self) {
        if !self.queue.push(self.event).await {
            trace!("sink closed while delivering");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RelaySubState {
    /// Known relay, REQ not sent yet.
    Pending,
    /// REQ sent, waiting for EOSE.
    Syncing,
    Eose,
    Closed(String),
    Failed,
}

impl RelaySubState {
    fn is_waiting(&self) -> bool {
        matches!(self, RelaySubState::Pending | RelaySubState::Syncing)
    }

    fn has_req(&self) -> bool {
        matches!(self, RelaySubState::Syncing | RelaySubState::Eose)
    }

    fn outcome(&self, timed_out: bool) -> RelayOutcome {
        match self {
            RelaySubState::Eose => RelayOutcome::Eose,
            RelaySubState::Closed(msg) => RelayOutcome::Closed(msg.clone()),
            RelaySubState::Failed => RelayOutcome::Failed,
            RelaySubState::Pending | RelaySubState::Syncing if timed_out => RelayOutcome::TimedOut,
            RelaySubState::Pending | RelaySubState::Syncing => RelayOutcome::Cancelled,
        }
    }
}

struct SubState {
    filters: Vec<Filter>,
    relays: HashMap<NormRelayUrl, RelaySubState>,
    /// Ids of verified events already delivered.
    seen: HashSet<EventId>,
    /// Copies of delivered events until the caught-up signal fires.
    backlog: Vec<ReceivedEvent>,
    queue: EventQueue<ReceivedEvent>,
    /// Taken when the caught-up signal fires, so it fires once.
    caught_up: Option<oneshot::Sender<SubscriptionOutcome>>,
    oneshot: bool,
    timer: Option<AbortHandle>,
}

impl SubState {
    fn req(&self, id: &SubId) -> ClientMessage {
        ClientMessage::req(id.clone(), self.filters.clone())
    }

    fn resolve(&mut self, id: &SubId, timed_out: bool) {
        let Some(tx) = self.caught_up.take() else {
            return;
        };

        if let Some(timer) = self.timer.take() {
            timer.abort();
        }

        let outcome = SubscriptionOutcome {
            id: id.clone(),
            events: std::mem::take(&mut self.backlog),
            relays: self
                .relays
                .iter()
                .map(|(relay, state)| (relay.clone(), state.outcome(timed_out)))
                .collect(),
            timed_out,
        };

        // nobody waiting on the accessor is fine
        let _ = tx.send(outcome);
    }

    fn close_commands(&self, id: &SubId) -> Outbox {
        self.relays
            .iter()
            .filter(|(_, state)| state.has_req())
            .map(|(relay, _)| (relay.clone(), ClientMessage::close(id.clone())))
            .collect()
    }
}

/// Tracks open subscriptions and how far along each relay is with them.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    subs: Mutex<HashMap<SubId, SubState>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription that waits on `relays`. Nothing is sent yet;
    /// relays move to syncing through [`Self::start`] or
    /// [`Self::relay_connected`].
    pub fn insert(
        &self,
        id: SubId,
        filters: Vec<Filter>,
        relays: impl IntoIterator<Item = NormRelayUrl>,
        oneshot: bool,
        queue: EventQueue<ReceivedEvent>,
    ) -> (oneshot::Receiver<SubscriptionOutcome>, Outbox) {
        let (tx, rx) = oneshot::channel();
        let state = SubState {
            filters,
            relays: relays
                .into_iter()
                .map(|relay| (relay, RelaySubState::Pending))
                .collect(),
            seen: HashSet::new(),
            backlog: Vec::new(),
            queue,
            caught_up: Some(tx),
            oneshot,
            timer: None,
        };

        let mut subs = lock(&self.subs);
        debug!(
            "opening subscription {} on {} relays",
            id.abbrev(),
            state.relays.len()
        );
        let mut outbox = Vec::new();
        if let Some(mut old) = subs.insert(id.clone(), state) {
            warn!("subscription id {} reused while open, replacing it", id);
            old.queue.abort();
            old.resolve(&id, false);
            outbox = old.close_commands(&id);
        }

        // with no relays there is nothing to wait for
        outbox.extend(check_caught_up(&mut subs, &id, false));
        (rx, outbox)
    }

    /// The REQ for a relay that is connected now, unless it already got one.
    pub fn start(&self, id: &SubId, relay: &NormRelayUrl) -> Option<ClientMessage> {
        let mut subs = lock(&self.subs);
        let sub = subs.get_mut(id)?;
        let state = sub.relays.get_mut(relay)?;
        if *state != RelaySubState::Pending {
            return None;
        }
        *state = RelaySubState::Syncing;
        Some(sub.req(id))
    }

    pub fn set_timer(&self, id: &SubId, timer: AbortHandle) {
        let mut subs = lock(&self.subs);
        match subs.get_mut(id) {
            Some(sub) if sub.caught_up.is_some() => sub.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// REQs to replay on a freshly (re)connected relay. Relays that refused
    /// a subscription with `CLOSED` are not asked again.
    #[profiling::function]
    pub fn relay_connected(&self, relay: &NormRelayUrl) -> Vec<ClientMessage> {
        let mut subs = lock(&self.subs);
        let mut reqs = Vec::new();
        for (id, sub) in subs.iter_mut() {
            let state = sub
                .relays
                .entry(relay.clone())
                .or_insert(RelaySubState::Pending);
            if matches!(state, RelaySubState::Closed(_)) {
                continue;
            }
            *state = RelaySubState::Syncing;
            reqs.push(sub.req(id));
        }

        if !reqs.is_empty() {
            info!("replaying {} subscriptions on {}", reqs.len(), relay);
        }
        reqs
    }

    /// The connection to `relay` is gone for good. Subscriptions stop
    /// waiting on it.
    pub fn relay_lost(&self, relay: &NormRelayUrl) -> Outbox {
        let mut subs = lock(&self.subs);
        let affected: Vec<SubId> = subs
            .iter_mut()
            .filter_map(|(id, sub)| {
                let state = sub.relays.get_mut(relay)?;
                if !state.is_waiting() {
                    return None;
                }
                *state = RelaySubState::Failed;
                Some(id.clone())
            })
            .collect();

        affected
            .iter()
            .flat_map(|id| check_caught_up(&mut subs, id, false))
            .collect()
    }

    /// Accept one event for a subscription. `None` if the subscription is
    /// gone or the event was already delivered.
    #[profiling::function]
    pub fn route_event(&self, sub_id: &SubId, event: ReceivedEvent) -> Option<Delivery> {
        let mut subs = lock(&self.subs);
        let Some(sub) = subs.get_mut(sub_id) else {
            trace!(
                "dropping event {} for closed subscription {}",
                event.event.id,
                sub_id.abbrev()
            );
            return None;
        };

        // unverified copies can't claim an id, or a forged copy would
        // shadow the real event
        if event.verified && !sub.seen.insert(event.event.id) {
            trace!("duplicate event {} from {}", event.event.id, event.relay);
            return None;
        }

        if sub.caught_up.is_some() {
            sub.backlog.push(event.clone());
        }

        Some(Delivery::new(sub.queue.clone(), event))
    }

    pub fn eose(&self, relay: &NormRelayUrl, sub_id: &SubId) -> Outbox {
        let mut subs = lock(&self.subs);
        let Some(sub) = subs.get_mut(sub_id) else {
            return Vec::new();
        };
        sub.relays.insert(relay.clone(), RelaySubState::Eose);
        check_caught_up(&mut subs, sub_id, false)
    }

    pub fn closed_by_relay(&self, relay: &NormRelayUrl, sub_id: &SubId, message: &str) -> Outbox {
        let mut subs = lock(&self.subs);
        let Some(sub) = subs.get_mut(sub_id) else {
            return Vec::new();
        };
        warn!("{} closed subscription {}: {}", relay, sub_id.abbrev(), message);
        sub.relays
            .insert(relay.clone(), RelaySubState::Closed(message.to_owned()));
        check_caught_up(&mut subs, sub_id, false)
    }

    /// Force the caught-up signal; relays still syncing are reported as
    /// timed out.
    pub fn time_out(&self, id: &SubId) -> Outbox {
        let mut subs = lock(&self.subs);
        let Some(sub) = subs.get_mut(id) else {
            return Vec::new();
        };
        // called from the timer task itself, don't abort it
        sub.timer = None;
        if sub.caught_up.is_some() {
            info!("subscription {} timed out waiting for EOSE", id.abbrev());
        }
        check_caught_up(&mut subs, id, true)
    }

    /// Remove a subscription: its sink ends right away and an unresolved
    /// caught-up accessor gets what was collected so far. Returns the CLOSE
    /// commands for the relays that have the REQ.
    pub fn close(&self, id: &SubId) -> Outbox {
        let Some(mut sub) = lock(&self.subs).remove(id) else {
            return Vec::new();
        };
        debug!("closing subscription {}", id.abbrev());
        sub.queue.abort();
        sub.resolve(id, false);
        sub.close_commands(id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: &SubId) -> bool {
        lock(&self.subs).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.subs).len()
    }
}

/// Fire the caught-up signal when no relay is left waiting, or
/// unconditionally on timeout. One-shot subscriptions end there.
fn check_caught_up(subs: &mut HashMap<SubId, SubState>, id: &SubId, timed_out: bool) -> Outbox {
    let Some(sub) = subs.get_mut(id) else {
        return Vec::new();
    };

    if sub.caught_up.is_none()
        || (!timed_out && sub.relays.values().any(RelaySubState::is_waiting))
    {
        return Vec::new();
    }

    debug!(
        "subscription {} caught up with {} events",
        id.abbrev(),
        sub.backlog.len()
    );
    sub.resolve(id, timed_out);

    if !sub.oneshot {
        return Vec::new();
    }

    match subs.remove(id) {
        Some(sub) => {
            sub.queue.finish();
            sub.close_commands(id)
        }
        None => Vec::new(),
    }
}
