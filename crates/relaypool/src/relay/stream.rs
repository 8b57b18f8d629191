use std::fmt;
use std::sync::Weak;

use futures::Stream;
use tokio::sync::oneshot;

use crate::relay::pool::PoolShared;
use crate::relay::{EventQueue, ReceivedEvent, SubscriptionOutcome};
use crate::{Error, Result, SubId};

enum CaughtUp {
    Waiting(oneshot::Receiver<SubscriptionOutcome>),
    Done(SubscriptionOutcome),
    /// The pool went away before the subscription caught up.
    Lost,
}

/// A live subscription.
///
/// Events arrive through [`EventStream::next`] in the order each relay sent
/// them, deduplicated across relays. [`EventStream::caught_up`] resolves
/// once every relay has sent its stored events (or the eose timeout hit).
/// Dropping the stream closes the subscription on every relay.
pub struct EventStream {
    id: SubId,
    queue: EventQueue<ReceivedEvent>,
    caught_up: CaughtUp,
    pool: Weak<PoolShared>,
}

impl EventStream {
    pub(crate) fn new(
        id: SubId,
        queue: EventQueue<ReceivedEvent>,
        caught_up: oneshot::Receiver<SubscriptionOutcome>,
        pool: Weak<PoolShared>,
    ) -> Self {
        Self {
            id,
            queue,
            caught_up: CaughtUp::Waiting(caught_up),
            pool,
        }
    }

    pub fn id(&self) -> &SubId {
        &self.id
    }

    /// The next event. `None` once the subscription is closed; one-shot
    /// subscriptions end after their backlog is drained.
    pub async fn next(&mut self) -> Option<ReceivedEvent> {
        self.queue.pop().await
    }

    /// Wait until every relay that got the request has caught up, or the
    /// eose timeout forced it. Resolves once; later calls return the same
    /// outcome.
    pub async fn caught_up(&mut self) -> Result<SubscriptionOutcome> {
        if let CaughtUp::Waiting(rx) = &mut self.caught_up {
            self.caught_up = match rx.await {
                Ok(outcome) => CaughtUp::Done(outcome),
                Err(_) => CaughtUp::Lost,
            };
        }

        match &self.caught_up {
            CaughtUp::Done(outcome) => Ok(outcome.clone()),
            _ => Err(Error::PoolClosed),
        }
    }

    /// Has the caught-up signal fired yet? Doesn't wait.
    pub fn is_caught_up(&mut self) -> bool {
        if let CaughtUp::Waiting(rx) = &mut self.caught_up {
            match rx.try_recv() {
                Ok(outcome) => self.caught_up = CaughtUp::Done(outcome),
                Err(oneshot::error::TryRecvError::Empty) => return false,
                Err(oneshot::error::TryRecvError::Closed) => self.caught_up = CaughtUp::Lost,
            }
        }
        matches!(self.caught_up, CaughtUp::Done(_))
    }

    /// Events waiting to be read.
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    /// Events the drop-oldest policy threw away because the reader fell
    /// behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Close the subscription: relays get a CLOSE, nothing more is
    /// delivered and buffered events are discarded. Idempotent.
    pub fn close(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.close_subscription(&self.id);
        }
        self.pool = Weak::new();
        self.queue.abort();
    }

    /// The events as a [`Stream`]. The subscription closes when the stream
    /// is dropped.
    pub fn into_stream(self) -> impl Stream<Item = ReceivedEvent> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            let event = stream.next().await?;
            Some((event, stream))
        })
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.id)
            .field("buffered", &self.buffered())
            .finish()
    }
}
