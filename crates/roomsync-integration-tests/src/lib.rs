//! Shared fixtures for the multi-peer scenarios under `tests/`.

use std::time::Duration;

use roomsync_protocols::RoomSession;
use roomsync_room::{SimConfig, SimPeer, SimRoom};

/// One-way latency used by every scenario.
pub const LATENCY: Duration = Duration::from_millis(30);

/// A room with [`LATENCY`] and no jitter.
pub fn room() -> SimRoom {
    SimRoom::new(SimConfig::default().with_latency(LATENCY))
}

/// Join `room`, returning the raw peer handle and a session over it.
pub fn join(room: &SimRoom) -> (SimPeer, RoomSession) {
    let peer = room.join();
    let session = RoomSession::from_peer(peer.clone());
    (peer, session)
}

/// Wait long enough for every outstanding write to reach every peer.
pub async fn settle() {
    tokio::time::sleep(LATENCY * 4).await;
}
