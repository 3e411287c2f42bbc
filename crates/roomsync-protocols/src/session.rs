//! Room session - the per-peer collaborators every protocol shares.

use std::sync::Arc;

use roomsync_room::{PropertyStore, RoleOracle};
use tracing::debug;

use crate::error::{Error, Result};
use crate::guard::InFlightGuard;

/// One peer's membership in a room: its store view, its role oracle, and
/// the in-flight guard scoped to this membership.
///
/// Cheap to clone; clones share the guard. Each simulated peer gets its own
/// session, so peers never share guard state.
#[derive(Clone)]
pub struct RoomSession {
    store: Arc<dyn PropertyStore>,
    oracle: Arc<dyn RoleOracle>,
    guard: InFlightGuard,
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("attached", &self.is_attached())
            .field("master", &self.is_master())
            .field("in_flight", &self.guard.len())
            .finish()
    }
}

impl RoomSession {
    /// Create a session from separate store and oracle handles.
    pub fn new(store: Arc<dyn PropertyStore>, oracle: Arc<dyn RoleOracle>) -> Self {
        Self {
            store,
            oracle,
            guard: InFlightGuard::new(),
        }
    }

    /// Create a session from a handle that is both store and oracle.
    pub fn from_peer<T>(peer: T) -> Self
    where
        T: PropertyStore + RoleOracle + 'static,
    {
        let peer = Arc::new(peer);
        Self::new(peer.clone(), peer)
    }

    /// The local property view.
    pub fn store(&self) -> &dyn PropertyStore {
        self.store.as_ref()
    }

    /// The role oracle.
    pub fn oracle(&self) -> &dyn RoleOracle {
        self.oracle.as_ref()
    }

    /// The in-flight guard for this membership.
    pub fn guard(&self) -> &InFlightGuard {
        &self.guard
    }

    /// Whether this peer is attached to the room.
    pub fn is_attached(&self) -> bool {
        self.oracle.is_attached()
    }

    /// Whether this peer is attached and holds the master role.
    pub fn is_master(&self) -> bool {
        self.oracle.is_attached() && self.oracle.is_single_writer()
    }

    /// Milliseconds on the shared session clock.
    pub fn clock_now(&self) -> i64 {
        self.oracle.session_clock_now()
    }

    /// Fail with [`Error::NotInSession`] unless attached.
    pub fn ensure_attached(&self) -> Result<()> {
        if self.oracle.is_attached() {
            Ok(())
        } else {
            Err(Error::NotInSession)
        }
    }

    /// Fail unless attached and master.
    pub fn ensure_master(&self) -> Result<()> {
        self.ensure_attached()?;
        if self.oracle.is_single_writer() {
            Ok(())
        } else {
            Err(Error::NotMaster)
        }
    }

    /// Reset membership-scoped state after leaving the room.
    pub fn on_left(&self) {
        debug!(in_flight = self.guard.len(), "Left room, clearing negotiations");
        self.guard.clear();
    }
}
