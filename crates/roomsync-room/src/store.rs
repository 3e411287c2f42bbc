//! The seams a room transport has to provide.
//!
//! A real deployment implements these over its networking layer; the
//! [`sim`](crate::sim) module implements them in memory.

use crate::value::{PropertyChange, PropertyValue};

/// A replicated key/value property table.
///
/// Reads are served from this peer's local view and may be stale. Writes are
/// sent to the room and eventually propagate to every attached peer,
/// including the writer, whose own view only changes once the write comes
/// back.
pub trait PropertyStore: Send + Sync {
    /// Read a property from the local view.
    fn get(&self, key: &str) -> Option<PropertyValue>;

    /// Unconditionally write a property.
    ///
    /// Returns whether the write was accepted locally for sending. Acceptance
    /// says nothing about when (or whether) the value becomes visible.
    fn set(&self, key: &str, value: PropertyValue) -> bool;

    /// Write `value` only if the room's current value equals `expected`.
    ///
    /// Returns local acceptance only. The room arbitrates the condition when
    /// the write arrives; a losing write is dropped silently.
    fn compare_and_set(&self, key: &str, value: PropertyValue, expected: PropertyValue) -> bool;

    /// Drain the changes applied to the local view since the last call.
    fn poll_changes(&self) -> Vec<PropertyChange> {
        Vec::new()
    }
}

/// Reports this peer's role within the room.
pub trait RoleOracle: Send + Sync {
    /// Whether this peer is attached to a room session.
    fn is_attached(&self) -> bool;

    /// Whether this peer currently holds the single-writer (master) role.
    fn is_single_writer(&self) -> bool;

    /// Milliseconds on the shared session clock, agreed by all peers.
    fn session_clock_now(&self) -> i64;
}
