//! Await convergence of a room property.
//!
//! Writes to the room are fire-and-forget: the store reports local
//! acceptance, nothing more. A write counts as done once the value shows up
//! in this peer's local view. [`await_value`] is the one polling loop every
//! protocol uses to wait for that.

use roomsync_room::{PropertyStore, PropertyValue};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::pacing::{Pacer, PollPolicy};

/// Poll `key` until `accept` holds for its local value, or `policy.timeout`
/// elapses on `pacer`'s clock.
///
/// The check runs before the first pause, so an already-converged value
/// returns without suspending. A timeout is only reported once the full
/// window has elapsed.
pub async fn await_value<P, F>(
    store: &dyn PropertyStore,
    key: &str,
    mut accept: F,
    policy: PollPolicy,
    pacer: &P,
) -> Result<PropertyValue>
where
    P: Pacer,
    F: FnMut(&PropertyValue) -> bool + Send,
{
    let started = pacer.elapsed();
    let mut polls: u32 = 0;

    loop {
        polls += 1;
        if let Some(value) = store.get(key) {
            if accept(&value) {
                trace!(key, %value, polls, "Property converged");
                return Ok(value);
            }
        }

        let waited = pacer.elapsed().saturating_sub(started);
        if waited >= policy.timeout {
            warn!(key, ?waited, polls, "Property did not converge");
            return Err(Error::Timeout {
                key: key.to_string(),
                waited,
            });
        }

        pacer.pause(policy.interval.min(policy.timeout - waited)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::TaskPacer;
    use roomsync_room::{SimConfig, SimRoom};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn returns_immediately_when_already_visible() {
        let room = SimRoom::new(SimConfig::instant());
        let peer = room.join();
        peer.set("k", PropertyValue::Int(1));

        let pacer = TaskPacer::new();
        let value = await_value(&peer, "k", |v| v.as_int() == Some(1), PollPolicy::task(), &pacer)
            .await
            .unwrap();
        assert_eq!(value, PropertyValue::Int(1));
        assert_eq!(pacer.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_round_trip() {
        let room = SimRoom::new(SimConfig::default().with_latency(Duration::from_millis(120)));
        let peer = room.join();
        peer.set("k", PropertyValue::Int(9));

        let pacer = TaskPacer::new();
        await_value(&peer, "k", |v| v.as_int() == Some(9), PollPolicy::task(), &pacer)
            .await
            .unwrap();

        // 240 ms round trip, observed on the next 100 ms poll.
        assert_eq!(pacer.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_full_window() {
        let room = SimRoom::new(SimConfig::instant());
        let peer = room.join();

        let pacer = TaskPacer::new();
        let policy = PollPolicy::task().with_timeout(Duration::from_millis(450));
        let err = await_value(&peer, "missing", |_| true, policy, &pacer)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(pacer.elapsed(), Duration::from_millis(450));
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_filters_values() {
        let room = SimRoom::new(SimConfig::instant());
        let peer = room.join();
        peer.set("k", PropertyValue::Int(1));

        let pacer = TaskPacer::new();
        let policy = PollPolicy::task().with_timeout(Duration::from_secs(1));
        let result = await_value(&peer, "k", |v| v.as_int() == Some(2), policy, &pacer).await;
        assert!(result.is_err());
    }
}
