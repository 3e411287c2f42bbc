//! In-flight negotiation guard.
//!
//! Serializes this peer's own negotiations per property key. It is not a
//! cross-peer lock: other peers are arbitrated by the room's conditional
//! writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct GuardState {
    /// Key → id of the ticket holding it.
    active: HashMap<String, u64>,
    next_ticket: u64,
}

/// Set of keys this peer is currently negotiating on.
///
/// Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct InFlightGuard {
    state: Arc<Mutex<GuardState>>,
}

impl InFlightGuard {
    /// Create an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `key`, or fail with [`Error::InFlight`] if it is already held.
    ///
    /// The returned ticket releases the key when dropped.
    pub fn try_acquire(&self, key: &str) -> Result<InFlightTicket> {
        let mut state = self.lock();
        if state.active.contains_key(key) {
            trace!(key, "Negotiation already in flight");
            return Err(Error::InFlight(key.to_string()));
        }
        state.next_ticket += 1;
        let id = state.next_ticket;
        state.active.insert(key.to_string(), id);

        Ok(InFlightTicket {
            guard: self.clone(),
            key: key.to_string(),
            id,
        })
    }

    /// Whether `key` is currently held.
    pub fn is_active(&self, key: &str) -> bool {
        self.lock().active.contains_key(key)
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    /// Whether no key is held.
    pub fn is_empty(&self) -> bool {
        self.lock().active.is_empty()
    }

    /// Forget every registration (on leaving a session).
    ///
    /// Outstanding tickets become inert: dropping them later will not
    /// release a newer registration of the same key.
    pub fn clear(&self) {
        self.lock().active.clear();
    }
}

/// Proof of registration for one key. Dropping it releases the key.
#[derive(Debug)]
#[must_use = "the key is released as soon as the ticket is dropped"]
pub struct InFlightTicket {
    guard: InFlightGuard,
    key: String,
    id: u64,
}

impl InFlightTicket {
    /// The key this ticket holds.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InFlightTicket {
    fn drop(&mut self) {
        let mut state = self.guard.lock();
        if state.active.get(&self.key) == Some(&self.id) {
            state.active.remove(&self.key);
            trace!(key = %self.key, "Negotiation released");
        }
    }
}
