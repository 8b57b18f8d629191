use std::time::Duration;

/// What a subscription's buffered sink does when the consumer falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest unconsumed event to make room.
    #[default]
    DropOldest,
    /// Hold the producing relay's read loop until there is room. Only the
    /// relay delivering to the full sink waits; other relays keep going.
    Block,
}

/// Pool-wide configuration, threaded through [`crate::RelayPool::new`],
/// `init` and `reconnect_all`.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Per-attempt connect timeout. Also bounds how long `init` waits.
    pub connection_timeout: Duration,
    /// How many reconnect attempts a relay gets before it is reported
    /// unavailable.
    pub retry_count: u32,
    pub retry_on_error: bool,
    pub retry_on_close: bool,
    /// Drop and re-open the socket when a relay sends a NOTICE.
    pub reconnect_on_notice: bool,
    /// When false, `init` fails if any relay fails to connect.
    pub ignore_connection_exception: bool,
    /// Don't open sockets until the pool is first used. Commands sent
    /// before then are buffered.
    pub lazy_listening: bool,
    /// Queue EVENT/COUNT commands for relays that aren't connected yet
    /// instead of dropping them.
    pub buffer_while_disconnected: bool,
    pub verify_signatures: bool,
    /// Delay before the first reconnect attempt; grows 1.5x per attempt.
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    /// Default for [`SubscribeOptions::eose_timeout`].
    pub eose_timeout: Duration,
    /// Default deadline for publish acks and counts.
    pub command_timeout: Duration,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(5),
            retry_count: 3,
            retry_on_error: false,
            retry_on_close: false,
            reconnect_on_notice: false,
            ignore_connection_exception: true,
            lazy_listening: false,
            buffer_while_disconnected: false,
            verify_signatures: true,
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(25),
            eose_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            queue_capacity: 1024,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl PoolOptions {
    pub fn connection_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connection_timeout = timeout;
        self
    }

    /// Reconnect after transport errors and unexpected closes, `count` times.
    pub fn retry(&mut self, count: u32) -> &mut Self {
        self.retry_count = count;
        self.retry_on_error = true;
        self.retry_on_close = true;
        self
    }

    pub fn retry_on_error(&mut self, retry: bool) -> &mut Self {
        self.retry_on_error = retry;
        self
    }

    pub fn retry_on_close(&mut self, retry: bool) -> &mut Self {
        self.retry_on_close = retry;
        self
    }

    pub fn reconnect_on_notice(&mut self, reconnect: bool) -> &mut Self {
        self.reconnect_on_notice = reconnect;
        self
    }

    pub fn ignore_connection_exception(&mut self, ignore: bool) -> &mut Self {
        self.ignore_connection_exception = ignore;
        self
    }

    pub fn lazy_listening(&mut self, lazy: bool) -> &mut Self {
        self.lazy_listening = lazy;
        self
    }

    pub fn buffer_while_disconnected(&mut self, buffer: bool) -> &mut Self {
        self.buffer_while_disconnected = buffer;
        self
    }

    /// Off skips id and signature checks; events then arrive with
    /// `verified` set.
    pub fn verify_signatures(&mut self, verify: bool) -> &mut Self {
        self.verify_signatures = verify;
        self
    }

    pub fn reconnect_delay(&mut self, delay: Duration) -> &mut Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn ping_rate(&mut self, duration: Duration) -> &mut Self {
        self.ping_interval = duration;
        self
    }

    pub fn eose_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.eose_timeout = timeout;
        self
    }

    pub fn command_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.command_timeout = timeout;
        self
    }

    pub fn queue(&mut self, capacity: usize, overflow: OverflowPolicy) -> &mut Self {
        self.queue_capacity = capacity.max(1);
        self.overflow = overflow;
        self
    }

    pub(crate) fn subscribe_defaults(&self) -> SubscribeOptions {
        SubscribeOptions {
            oneshot: false,
            eose_timeout: Some(self.eose_timeout),
            queue_capacity: self.queue_capacity,
            overflow: self.overflow,
        }
    }
}

/// Per-subscription settings for [`crate::RelayPool::subscribe_with`].
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Close the subscription once every relay has caught up.
    pub oneshot: bool,
    /// Force the caught-up signal after this long. `None` waits forever.
    pub eose_timeout: Option<Duration>,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        PoolOptions::default().subscribe_defaults()
    }
}

impl SubscribeOptions {
    pub fn oneshot(mut self) -> Self {
        self.oneshot = true;
        self
    }

    pub fn eose_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.eose_timeout = timeout;
        self
    }

    pub fn queue(mut self, capacity: usize, overflow: OverflowPolicy) -> Self {
        self.queue_capacity = capacity.max(1);
        self.overflow = overflow;
        self
    }
}
