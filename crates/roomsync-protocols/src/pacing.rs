//! Pacing - the suspension primitive protocols wait on.
//!
//! A negotiation polls the room until a write becomes visible. How it waits
//! between polls depends on who is driving it:
//!
//! - [`TaskPacer`]: an independently scheduled tokio task sleeping on
//!   `tokio::time`. Fine-grained (100 ms) polling.
//! - [`TickPacer`]: a cooperative coroutine resumed once per game tick.
//!   Time only advances when the owner calls [`TickPacer::tick`], and
//!   polling is seconds-scale.
//!
//! Protocol code is written once against [`Pacer`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

/// How often to poll and how long to wait before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between polls.
    pub interval: Duration,

    /// Total wait before the operation fails.
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::task()
    }
}

impl PollPolicy {
    /// Policy for task-scheduled negotiations: 100 ms polls, 30 s timeout.
    #[must_use]
    pub const fn task() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
        }
    }

    /// Policy for tick-driven negotiations: 1 s polls, 30 s timeout.
    #[must_use]
    pub const fn cooperative() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the poll interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Abstract clock + sleep a negotiation suspends on.
pub trait Pacer: Clone + Send + Sync + 'static {
    /// Monotonic time on this pacer's clock.
    fn elapsed(&self) -> Duration;

    /// Suspend for at least `interval` on this pacer's clock.
    fn pause(&self, interval: Duration) -> impl Future<Output = ()> + Send;

    /// The poll policy suited to this scheduling discipline.
    fn policy(&self) -> PollPolicy;
}

/// Pacer for negotiations running as tokio tasks.
#[derive(Debug, Clone)]
pub struct TaskPacer {
    origin: tokio::time::Instant,
    policy: PollPolicy,
}

impl Default for TaskPacer {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPacer {
    /// Create a pacer whose clock starts now.
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            policy: PollPolicy::task(),
        }
    }

    /// Override the default poll policy.
    #[must_use]
    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl Pacer for TaskPacer {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    fn pause(&self, interval: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(interval)
    }

    fn policy(&self) -> PollPolicy {
        self.policy
    }
}

/// Pacer for coroutines resumed by a tick loop.
///
/// Clones share one tick counter. `pause` never registers a waker: the
/// driving loop is expected to resume its coroutines every tick (see
/// [`Coroutine`](crate::coroutine::Coroutine)).
#[derive(Debug, Clone)]
pub struct TickPacer {
    ticks: Arc<AtomicU64>,
    tick_len: Duration,
    policy: PollPolicy,
}

impl TickPacer {
    /// Create a pacer where each tick represents `tick_len` of time.
    pub fn new(tick_len: Duration) -> Self {
        Self {
            ticks: Arc::new(AtomicU64::new(0)),
            tick_len,
            policy: PollPolicy::cooperative(),
        }
    }

    /// Override the default poll policy.
    #[must_use]
    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Advance the clock by one tick. Returns the new tick count.
    pub fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Ticks elapsed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Duration of one tick.
    pub fn tick_len(&self) -> Duration {
        self.tick_len
    }

    /// Whole ticks needed to cover `interval` (at least one).
    fn ticks_for(&self, interval: Duration) -> u64 {
        let len = self.tick_len.as_nanos().max(1);
        let ticks = interval.as_nanos().div_ceil(len).max(1);
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }
}

impl Pacer for TickPacer {
    fn elapsed(&self) -> Duration {
        let ticks = u32::try_from(self.ticks()).unwrap_or(u32::MAX);
        self.tick_len.checked_mul(ticks).unwrap_or(Duration::MAX)
    }

    fn pause(&self, interval: Duration) -> impl Future<Output = ()> + Send {
        let ticks = Arc::clone(&self.ticks);
        let wake_at = self.ticks().saturating_add(self.ticks_for(interval));
        std::future::poll_fn(move |_cx| {
            if ticks.load(Ordering::Acquire) >= wake_at {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }

    fn policy(&self) -> PollPolicy {
        self.policy
    }
}
