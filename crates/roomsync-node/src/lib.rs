//! Roomsync Node - multi-peer room simulation
//!
//! Joins a handful of simulated peers to one room and drives every protocol
//! on a network tick loop: the master allocates entity ids through the CAS
//! counter, spawns and moves entities, broadcasts its roster each tick, and
//! arms the spawner. Every other peer reconciles the roster and follows the
//! spawner record.
//!
//! # Example
//!
//! ```rust,ignore
//! use roomsync_node::{NodeConfig, RoomNode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut node = RoomNode::new(NodeConfig::from_env()?)?;
//!     let summary = node.run().await?;
//!     println!("{}", serde_json::to_string_pretty(&summary)?);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod node;

pub use error::{Error, Result};
pub use node::{NodeConfig, RoomNode, RunSummary};
