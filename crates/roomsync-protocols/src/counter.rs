//! CAS Counter - unique increasing IDs over an eventually-consistent room.
//!
//! The master hands out IDs by incrementing one integer property. The room
//! only offers a conditional write that reports *local* acceptance, so a
//! write is not trusted until it has come back:
//!
//! ```text
//! read current ──▶ cas(current+1, expect current) ──▶ poll until local == current+1
//!      │                                                   │            │
//!   absent                                             confirmed     timeout
//!      ▼                                                   ▼            ▼
//! set(default+1) ──▶ poll until local == default+1   Ok(current)   Err(Timeout)
//!                         │
//!                         ▼
//!                    Ok(default)
//! ```
//!
//! A competing writer winning the conditional write shows up as a timeout:
//! the local value converges to something other than what this peer
//! proposed. Callers retry with a fresh read by calling again.
//!
//! The algorithm is written once against [`Pacer`]; two thin adapters run it
//! either as a tokio task or as a tick-driven [`Coroutine`].

use std::sync::Arc;

use roomsync_room::PropertyValue;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::convergence::await_value;
use crate::coroutine::Coroutine;
use crate::error::{Error, Result};
use crate::pacing::{Pacer, PollPolicy, TaskPacer, TickPacer};
use crate::session::RoomSession;

/// Sentinel value reported alongside a failed allocation.
pub const FAILED_ID: i64 = -1;

/// Flattened `(ok, value)` view of a counter result.
///
/// `value` is [`FAILED_ID`] when `ok` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub ok: bool,
    pub value: i64,
}

impl From<Result<i64>> for Outcome {
    fn from(result: Result<i64>) -> Self {
        match result {
            Ok(value) => Self { ok: true, value },
            Err(_) => Self {
                ok: false,
                value: FAILED_ID,
            },
        }
    }
}

/// Compare-and-set counter negotiated through a room session.
#[derive(Debug)]
pub struct CasCounter<P: Pacer = TaskPacer> {
    session: RoomSession,
    pacer: P,
    policy: PollPolicy,
}

impl<P: Pacer> CasCounter<P> {
    /// Create a counter using the pacer's default poll policy.
    pub fn new(session: RoomSession, pacer: P) -> Self {
        let policy = pacer.policy();
        Self {
            session,
            pacer,
            policy,
        }
    }

    /// Override the poll policy.
    #[must_use]
    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The session this counter negotiates through.
    pub fn session(&self) -> &RoomSession {
        &self.session
    }

    /// The pacer this counter waits on.
    pub fn pacer(&self) -> &P {
        &self.pacer
    }

    /// The active poll policy.
    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Read the counter from the local view without negotiating.
    ///
    /// Any attached peer may peek; the value may be stale.
    pub fn peek(&self, key: &str) -> Result<Option<i64>> {
        self.session.ensure_attached()?;
        self.read(key)
    }

    /// Return the counter's value, seeding it with `seed` if it does not
    /// exist yet (master only).
    pub async fn get_or_seed(&self, key: &str, seed: i64) -> Result<i64> {
        self.session.ensure_attached()?;
        if let Some(current) = self.read(key)? {
            return Ok(current);
        }

        self.session.ensure_master()?;
        let _ticket = self.session.guard().try_acquire(key)?;
        self.seed(key, seed).await?;
        Ok(seed)
    }

    /// Conditionally write `new` over `expected` and wait until this peer
    /// observes `new` (master only).
    pub async fn compare_and_set_confirmed(&self, key: &str, new: i64, expected: i64) -> Result<()> {
        self.session.ensure_master()?;
        let _ticket = self.session.guard().try_acquire(key)?;
        self.swap(key, new, expected).await
    }

    /// Allocate the next value of the counter at `key` (master only).
    ///
    /// Returns the pre-increment value. An uninitialized counter is seeded
    /// so that this call gets `default` and the property holds
    /// `default + 1`.
    ///
    /// Precondition failures, guard contention and local rejection fail
    /// without waiting; a write that never becomes visible fails after the
    /// full poll timeout.
    pub async fn get_and_increment(&self, key: &str, default: i64) -> Result<i64> {
        self.session.ensure_master()?;
        let _ticket = self.session.guard().try_acquire(key)?;

        match self.read(key)? {
            None => {
                let next = Self::successor(key, default)?;
                self.seed(key, next).await?;
                info!(key, id = default, next, "Counter seeded");
                Ok(default)
            }
            Some(current) => {
                let next = Self::successor(key, current)?;
                self.swap(key, next, current).await?;
                debug!(key, id = current, next, "Counter incremented");
                Ok(current)
            }
        }
    }

    fn successor(key: &str, value: i64) -> Result<i64> {
        value
            .checked_add(1)
            .ok_or_else(|| Error::Exhausted(key.to_string()))
    }

    fn read(&self, key: &str) -> Result<Option<i64>> {
        self.session
            .store()
            .get(key)
            .map(|value| {
                value.as_int().ok_or_else(|| Error::UnexpectedValue {
                    key: key.to_string(),
                    expected: "an integer",
                })
            })
            .transpose()
    }

    /// Unconditional seed plus confirmation. Caller holds the ticket.
    ///
    /// Confirms that the seeded value is visible, not that this peer's write
    /// is the one that put it there.
    async fn seed(&self, key: &str, value: i64) -> Result<()> {
        if !self.session.store().set(key, PropertyValue::Int(value)) {
            warn!(key, value, "Seed write rejected");
            return Err(Error::Rejected(key.to_string()));
        }
        self.confirm(key, value).await
    }

    /// Conditional write plus confirmation. Caller holds the ticket.
    async fn swap(&self, key: &str, new: i64, expected: i64) -> Result<()> {
        let accepted = self.session.store().compare_and_set(
            key,
            PropertyValue::Int(new),
            PropertyValue::Int(expected),
        );
        if !accepted {
            warn!(key, new, expected, "Conditional write rejected");
            return Err(Error::Rejected(key.to_string()));
        }
        self.confirm(key, new).await
    }

    async fn confirm(&self, key: &str, value: i64) -> Result<()> {
        await_value(
            self.session.store(),
            key,
            |observed| observed.as_int() == Some(value),
            self.policy,
            &self.pacer,
        )
        .await
        .map(|_| ())
    }
}

impl CasCounter<TaskPacer> {
    /// Run [`get_and_increment`](Self::get_and_increment) as a tokio task.
    pub fn spawn_get_and_increment(
        self: Arc<Self>,
        key: impl Into<String>,
        default: i64,
    ) -> JoinHandle<Result<i64>> {
        let key = key.into();
        tokio::spawn(async move { self.get_and_increment(&key, default).await })
    }
}

impl CasCounter<TickPacer> {
    /// Run [`get_and_increment`](Self::get_and_increment) as a coroutine
    /// resumed by the owner's tick loop.
    pub fn start_get_and_increment(
        self: Arc<Self>,
        key: impl Into<String>,
        default: i64,
    ) -> Coroutine<Result<i64>> {
        let key = key.into();
        Coroutine::new(async move { self.get_and_increment(&key, default).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomsync_room::{Fault, PropertyStore, SimConfig, SimPeer, SimRoom};
    use std::collections::BTreeSet;
    use std::future::Future;
    use std::task::Poll;
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_test::task::Spawn;
    use tokio_test::{assert_pending, assert_ready_err};

    const KEY: &str = "bot_spw_id";
    const LATENCY: Duration = Duration::from_millis(40);

    fn room() -> SimRoom {
        SimRoom::new(SimConfig::default().with_latency(LATENCY))
    }

    fn counter(peer: SimPeer) -> CasCounter {
        CasCounter::new(RoomSession::from_peer(peer), TaskPacer::new())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    const STEP: Duration = Duration::from_millis(10);

    /// Poll a mock-task until it completes, advancing virtual time between polls.
    async fn drive<F: Future>(task: &mut Spawn<F>) -> F::Output {
        loop {
            if let Poll::Ready(out) = task.poll() {
                return out;
            }
            tokio::time::advance(STEP).await;
        }
    }

    async fn drive_both<A: Future, B: Future>(
        a: &mut Spawn<A>,
        b: &mut Spawn<B>,
    ) -> (A::Output, B::Output) {
        let (mut a_out, mut b_out) = (None, None);
        loop {
            if a_out.is_none() {
                if let Poll::Ready(out) = a.poll() {
                    a_out = Some(out);
                }
            }
            if b_out.is_none() {
                if let Poll::Ready(out) = b.poll() {
                    b_out = Some(out);
                }
            }
            if let (Some(_), Some(_)) = (&a_out, &b_out) {
                return (a_out.take().unwrap(), b_out.take().unwrap());
            }
            tokio::time::advance(STEP).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_allocation_seeds_default() {
        let room = room();
        let master = counter(room.join());

        assert_eq!(master.get_and_increment(KEY, 1).await.unwrap(), 1);
        assert_eq!(room.room_value(KEY), Some(PropertyValue::Int(2)));

        assert_eq!(master.get_and_increment(KEY, 1).await.unwrap(), 2);
        assert_eq!(master.get_and_increment(KEY, 1).await.unwrap(), 3);
        assert_eq!(master.peek(KEY).unwrap(), Some(4));
        assert!(master.session().guard().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_get_contiguous_unique_ids() {
        const N: usize = 12;
        const DEFAULT: i64 = 100;

        let room = room();
        let master = Arc::new(counter(room.join()));

        let mut handles = Vec::new();
        for _ in 0..N {
            let master = Arc::clone(&master);
            handles.push(tokio::spawn(async move {
                loop {
                    match master.get_and_increment(KEY, DEFAULT).await {
                        Ok(id) => return id,
                        Err(e) if e.is_retryable() => {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                        Err(e) => panic!("unexpected failure: {e}"),
                    }
                }
            }));
        }

        let mut ids = BTreeSet::new();
        for handle in handles {
            assert!(ids.insert(handle.await.unwrap()), "duplicate id");
        }
        let expected: BTreeSet<i64> = (DEFAULT..DEFAULT + N as i64).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn non_master_fails_without_touching_room() {
        let room = room();
        let master = counter(room.join());
        master.get_and_increment(KEY, 1).await.unwrap();

        let follower_peer = room.join();
        let follower_id = follower_peer.id();
        let follower = counter(follower_peer);

        let started = Instant::now();
        let err = follower.get_and_increment(KEY, 1).await.unwrap_err();
        assert!(matches!(err, Error::NotMaster));
        assert!(err.is_immediate());
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(room.network_calls(follower_id), 0);

        // Followers may still observe the counter.
        assert_eq!(follower.peek(KEY).unwrap(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn detached_peer_fails_immediately() {
        let room = room();
        let peer = room.join();
        let handle = peer.clone();
        let master = counter(peer);
        handle.leave();

        let err = master.get_and_increment(KEY, 1).await.unwrap_err();
        assert!(matches!(err, Error::NotInSession));
        assert!(matches!(master.peek(KEY), Err(Error::NotInSession)));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_negotiation_on_same_key_fails_fast() {
        let room = room();
        let peer = room.join();
        let peer_id = peer.id();
        let master = counter(peer);
        master.get_and_increment(KEY, 1).await.unwrap();
        let calls_before = room.network_calls(peer_id);

        let mut first = tokio_test::task::spawn(master.get_and_increment(KEY, 1));
        assert_pending!(first.poll());
        assert!(master.session().guard().is_active(KEY));

        let mut second = tokio_test::task::spawn(master.get_and_increment(KEY, 1));
        let err = assert_ready_err!(second.poll());
        assert!(matches!(err, Error::InFlight(ref k) if k == KEY));
        assert_eq!(room.network_calls(peer_id), calls_before + 1, "only the first wrote");

        drop(second);
        assert_eq!(drive(&mut first).await.unwrap(), 2);
        assert!(!master.session().guard().is_active(KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_write_fails_only_after_full_timeout() {
        let room = room();
        let master = counter(room.join());
        master.get_and_increment(KEY, 1).await.unwrap();

        room.set_fault(Fault::DropWrites);
        let started = Instant::now();
        let err = master.get_and_increment(KEY, 1).await.unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert!(!err.is_immediate());
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));
        assert!(master.session().guard().is_empty(), "guard released on timeout");

        // The counter did not move.
        room.set_fault(Fault::None);
        assert_eq!(master.get_and_increment(KEY, 1).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_write_fails_immediately() {
        let room = room();
        let master = counter(room.join());
        master.get_and_increment(KEY, 1).await.unwrap();

        room.set_fault(Fault::RejectWrites);
        let started = Instant::now();
        let err = master.get_and_increment(KEY, 1).await.unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(master.session().guard().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn losing_a_race_surfaces_as_timeout() {
        let room = room();
        let a_peer = room.join();
        let b_peer = room.join();
        let (a_id, b_id) = (a_peer.id(), b_peer.id());
        let policy = PollPolicy::task().with_timeout(Duration::from_secs(2));
        let a = counter(a_peer).with_policy(policy);
        let b = counter(b_peer).with_policy(policy);
        a.get_and_increment(KEY, 1).await.unwrap();
        settle().await;

        // A role handover leaves two peers acting as master against value 2.
        room.set_master(b_id);
        let mut b_task = tokio_test::task::spawn(b.compare_and_set_confirmed(KEY, 10, 2));
        assert_pending!(b_task.poll());
        room.set_master(a_id);
        let mut a_task = tokio_test::task::spawn(a.get_and_increment(KEY, 1));
        assert_pending!(a_task.poll());

        let (b_result, a_result) = drive_both(&mut b_task, &mut a_task).await;
        assert!(b_result.is_ok(), "first conditional write to arrive wins");
        assert!(matches!(a_result, Err(Error::Timeout { .. })));
        assert_eq!(room.room_value(KEY), Some(PropertyValue::Int(10)));
    }

    /// Confirmation compares values, so two masters proposing the same
    /// successor from the same read cannot be told apart: both confirm.
    /// Single-writer discipline is what rules this out.
    #[tokio::test(start_paused = true)]
    async fn identical_proposals_from_two_masters_both_confirm() {
        let room = room();
        let a_peer = room.join();
        let b_peer = room.join();
        let (a_id, b_id) = (a_peer.id(), b_peer.id());
        let a = counter(a_peer);
        let b = counter(b_peer);
        a.get_and_increment(KEY, 1).await.unwrap();
        settle().await;

        let mut a_task = tokio_test::task::spawn(a.get_and_increment(KEY, 1));
        assert_pending!(a_task.poll());
        room.set_master(b_id);
        let mut b_task = tokio_test::task::spawn(b.get_and_increment(KEY, 1));
        assert_pending!(b_task.poll());
        room.set_master(a_id);

        let (a_result, b_result) = drive_both(&mut a_task, &mut b_task).await;
        assert_eq!(a_result.unwrap(), 2);
        assert_eq!(b_result.unwrap(), 2);
        assert_eq!(room.room_value(KEY), Some(PropertyValue::Int(3)));
    }

    /// The seed path confirms that the seeded value became visible, not that
    /// this peer wrote it. Two masters seeding the same empty counter in the
    /// same window both receive `default`.
    #[tokio::test(start_paused = true)]
    async fn seed_confirms_visibility_not_authorship() {
        let room = room();
        let a_peer = room.join();
        let b_peer = room.join();
        let b_id = b_peer.id();
        let a = counter(a_peer);
        let b = counter(b_peer);

        let mut a_task = tokio_test::task::spawn(a.get_and_increment(KEY, 1));
        assert_pending!(a_task.poll());
        room.set_master(b_id);
        let mut b_task = tokio_test::task::spawn(b.get_and_increment(KEY, 1));
        assert_pending!(b_task.poll());

        let (a_result, b_result) = drive_both(&mut a_task, &mut b_task).await;
        assert_eq!(a_result.unwrap(), 1);
        assert_eq!(b_result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_integer_property_is_reported() {
        let room = room();
        let peer = room.join();
        peer.set(KEY, "seven".into());
        settle().await;

        let master = counter(peer);
        let err = master.get_and_increment(KEY, 1).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedValue { .. }));
        assert!(master.session().guard().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_counter() {
        let room = room();
        let peer = room.join();
        peer.set(KEY, i64::MAX.into());
        settle().await;

        let master = counter(peer);
        assert!(matches!(
            master.get_and_increment(KEY, 1).await,
            Err(Error::Exhausted(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn get_or_seed_and_confirmed_swap() {
        let room = room();
        let master = counter(room.join());

        assert_eq!(master.get_or_seed("round", 10).await.unwrap(), 10);
        assert_eq!(master.get_or_seed("round", 99).await.unwrap(), 10);

        master.compare_and_set_confirmed("round", 11, 10).await.unwrap();
        assert_eq!(master.peek("round").unwrap(), Some(11));

        let policy = PollPolicy::task().with_timeout(Duration::from_secs(1));
        let master = master.with_policy(policy);
        let err = master
            .compare_and_set_confirmed("round", 20, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "stale expectation never converges");
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_allocation() {
        let room = room();
        let master = Arc::new(counter(room.join()));

        let first = Arc::clone(&master).spawn_get_and_increment(KEY, 5);
        assert_eq!(first.await.unwrap().unwrap(), 5);
        let second = Arc::clone(&master).spawn_get_and_increment(KEY, 5);
        assert_eq!(second.await.unwrap().unwrap(), 6);
    }

    #[test]
    fn outcome_flattening() {
        assert_eq!(Outcome::from(Ok(4)), Outcome { ok: true, value: 4 });
        assert_eq!(
            Outcome::from(Err(Error::NotMaster)),
            Outcome {
                ok: false,
                value: FAILED_ID
            }
        );
    }
}
