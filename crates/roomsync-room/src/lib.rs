//! Roomsync Room - the replicated property store seam
//!
//! Peers in a room share a flat table of named properties. The table is
//! eventually consistent: reads are local and may be stale, writes travel to
//! the room and come back. One peer at a time holds the single-writer
//! ("master") role.
//!
//! This crate defines the two traits the protocols in `roomsync-protocols`
//! consume, and a simulated in-memory room implementing them.
//!
//! - [`PropertyStore`]: `get` / `set` / `compare_and_set` / `poll_changes`
//! - [`RoleOracle`]: attachment, master role, shared session clock
//! - [`SimRoom`] / [`SimPeer`]: latency, jitter and fault injection
//!
//! # Example
//!
//! ```rust,ignore
//! use roomsync_room::{PropertyStore, SimConfig, SimRoom};
//!
//! let room = SimRoom::new(SimConfig::instant());
//! let alice = room.join();
//! let bob = room.join();
//!
//! alice.set("greeting", "hello".into());
//! assert_eq!(bob.get("greeting"), Some("hello".into()));
//! ```

pub mod sim;
pub mod store;
pub mod value;

pub use sim::{Fault, PeerId, SimConfig, SimPeer, SimRoom};
pub use store::{PropertyStore, RoleOracle};
pub use value::{PropertyChange, PropertyValue};
