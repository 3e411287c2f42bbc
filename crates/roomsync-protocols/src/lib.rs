//! Roomsync Protocols - CAS Counters, Roster Sync and Spawner State
//!
//! Coordination protocols layered on an eventually-consistent room property
//! store with a single writer ("master").
//!
//! # Overview
//!
//! ## CAS Counter
//!
//! The [`CasCounter`] lets the master hand out unique, increasing integer
//! IDs from one room property:
//!
//! - **Confirm by observation**: a conditional write only counts once this
//!   peer sees the proposed value in its own view
//! - **Fail fast**: not master, detached, rejected or already in flight fail
//!   without waiting; only non-convergence waits out the full timeout
//! - **One algorithm, two schedulers**: run as a tokio task or as a
//!   tick-driven [`Coroutine`]
//!
//! ## Roster Sync
//!
//! The [`roster`] module broadcasts the master's entity roster each network
//! tick as six parallel arrays ([`wire`]) and reconciles every peer's roster
//! by full replacement: after a frame is applied the key sets match.
//!
//! ## Spawner State
//!
//! The [`spawner`] module publishes a small JSON record (armed or not, and
//! when) that the master writes and every peer caches.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use roomsync_protocols::{CasCounter, RoomSession, TaskPacer};
//! use roomsync_room::{SimConfig, SimRoom};
//!
//! let room = SimRoom::new(SimConfig::default());
//! let session = RoomSession::from_peer(room.join());
//! let counter = Arc::new(CasCounter::new(session, TaskPacer::new()));
//!
//! let id = counter.get_and_increment("bot_spw_id", 1).await?;
//! ```

pub mod convergence;
pub mod coroutine;
pub mod counter;
pub mod error;
pub mod guard;
pub mod pacing;
pub mod roster;
pub mod session;
pub mod spawner;
pub mod wire;

pub use convergence::await_value;
pub use coroutine::Coroutine;
pub use counter::{CasCounter, Outcome, FAILED_ID};
pub use error::{Error, Result};
pub use guard::{InFlightGuard, InFlightTicket};
pub use pacing::{Pacer, PollPolicy, TaskPacer, TickPacer};
pub use roster::{EntityId, EntityRecord, ReconcileReport, Roster, RosterSync};
pub use session::RoomSession;
pub use spawner::{SpawnerPhase, SpawnerState, SpawnerSync, DEFAULT_SPAWNER_KEY};
pub use wire::{FrameError, RosterArray, RosterField, RosterFrame, RosterStream};
