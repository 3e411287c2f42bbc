//! Room node - a multi-peer simulation running every protocol on a tick loop.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use glam::Vec3;
use roomsync_protocols::{
    CasCounter, EntityId, EntityRecord, Roster, RoomSession, RosterStream, RosterSync,
    SpawnerState, SpawnerSync, TaskPacer, DEFAULT_SPAWNER_KEY,
};
use roomsync_room::{SimConfig, SimPeer, SimRoom};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Health given to a freshly spawned entity.
const SPAWN_HEALTH: i32 = 100;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Number of simulated peers in the room.
    pub peers: usize,

    /// Network tick period.
    pub tick: Duration,

    /// One-way latency of the simulated room.
    pub latency: Duration,

    /// Number of ticks to run.
    pub ticks: u64,

    /// Allocate and spawn one entity every this many ticks.
    pub spawn_every: u64,

    /// Delay before the spawner starts, on the session clock.
    pub start_delay_ms: i64,

    /// Room property holding the entity id counter.
    pub counter_key: String,

    /// Id handed out by an uninitialized counter.
    pub first_id: EntityId,

    /// Room property holding the spawner record.
    pub spawner_key: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peers: 3,
            tick: Duration::from_millis(100),
            latency: Duration::from_millis(25),
            ticks: 100,
            spawn_every: 5,
            start_delay_ms: 1_000,
            counter_key: "bot_spw_id".to_string(),
            first_id: 1,
            spawner_key: DEFAULT_SPAWNER_KEY.to_string(),
        }
    }
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Create config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            peers: parse_var(&lookup, "ROOMSYNC_PEERS", defaults.peers)?,
            tick: Duration::from_millis(parse_var(
                &lookup,
                "ROOMSYNC_TICK_MS",
                millis(defaults.tick),
            )?),
            latency: Duration::from_millis(parse_var(
                &lookup,
                "ROOMSYNC_LATENCY_MS",
                millis(defaults.latency),
            )?),
            ticks: parse_var(&lookup, "ROOMSYNC_TICKS", defaults.ticks)?,
            spawn_every: parse_var(&lookup, "ROOMSYNC_SPAWN_EVERY", defaults.spawn_every)?,
            start_delay_ms: parse_var(&lookup, "ROOMSYNC_START_DELAY_MS", defaults.start_delay_ms)?,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the tick loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.peers == 0 {
            return Err(invalid("ROOMSYNC_PEERS", "0", "a room needs at least one peer"));
        }
        if self.tick.is_zero() {
            return Err(invalid("ROOMSYNC_TICK_MS", "0", "tick period must be positive"));
        }
        if self.spawn_every == 0 {
            return Err(invalid("ROOMSYNC_SPAWN_EVERY", "0", "must be at least one tick"));
        }
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> Error {
    Error::Config {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &raw, e.to_string())),
    }
}

/// What a finished run observed.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub ticks: u64,
    /// Ids handed out by the counter, in completion order.
    pub allocated: Vec<EntityId>,
    pub failed_allocations: usize,
    /// Entities on the master's roster at the end.
    pub roster_len: usize,
    /// Whether every peer ended with the master's roster.
    pub rosters_converged: bool,
    /// The master's spawner record.
    pub spawner: SpawnerState,
    /// Whether every peer cached the master's spawner record.
    pub spawners_agree: bool,
}

struct Participant {
    peer: SimPeer,
    session: RoomSession,
    counter: Arc<CasCounter>,
    roster: RosterSync,
    spawner: SpawnerSync,
}

impl Participant {
    fn join(room: &SimRoom, config: &NodeConfig) -> Self {
        let peer = room.join();
        let session = RoomSession::from_peer(peer.clone());
        Self {
            counter: Arc::new(CasCounter::new(session.clone(), TaskPacer::new())),
            roster: RosterSync::new(session.clone(), Arc::new(Roster::new())),
            spawner: SpawnerSync::new(session.clone(), config.spawner_key.clone()),
            session,
            peer,
        }
    }
}

/// A simulated room and its peers.
pub struct RoomNode {
    config: NodeConfig,
    room: SimRoom,
    participants: Vec<Participant>,
}

impl RoomNode {
    /// Create a room and join the configured number of peers.
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let room = SimRoom::new(SimConfig::default().with_latency(config.latency));
        let participants = (0..config.peers)
            .map(|_| Participant::join(&room, &config))
            .collect();

        info!(peers = config.peers, latency = ?config.latency, "Room created");
        Ok(Self {
            config,
            room,
            participants,
        })
    }

    /// The simulated room.
    pub fn room(&self) -> &SimRoom {
        &self.room
    }

    fn master_index(&self) -> Result<usize> {
        self.participants
            .iter()
            .position(|p| p.session.is_master())
            .ok_or(Error::Protocol(roomsync_protocols::Error::NotMaster))
    }

    /// Run the configured number of ticks, then let the room settle.
    pub async fn run(&mut self) -> Result<RunSummary> {
        for participant in &mut self.participants {
            participant.spawner.on_joined()?;
        }
        let master = self.master_index()?;
        self.participants[master]
            .spawner
            .start(self.config.start_delay_ms)?;

        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pending: Vec<JoinHandle<roomsync_protocols::Result<EntityId>>> = Vec::new();
        let mut allocated = Vec::new();
        let mut failed_allocations = 0;

        for tick in 0..self.config.ticks {
            interval.tick().await;

            let (done, in_flight): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|handle| handle.is_finished());
            pending = in_flight;
            for handle in done {
                match self.spawn_allocated(master, handle.await?) {
                    Some(id) => allocated.push(id),
                    None => failed_allocations += 1,
                }
            }

            if tick % self.config.spawn_every == 0 {
                let counter = Arc::clone(&self.participants[master].counter);
                pending.push(
                    counter.spawn_get_and_increment(self.config.counter_key.clone(), self.config.first_id),
                );
            }

            self.advance_entities(master);
            self.broadcast(master)?;
            self.pump_spawners(tick);
        }

        for handle in pending {
            match self.spawn_allocated(master, handle.await?) {
                Some(id) => allocated.push(id),
                None => failed_allocations += 1,
            }
        }

        // Let the last property writes land before the final broadcast.
        tokio::time::sleep(self.config.latency * 2 + self.config.tick).await;
        self.broadcast(master)?;
        self.pump_spawners(self.config.ticks);

        let summary = self.summarize(master, allocated, failed_allocations);
        info!(
            allocated = summary.allocated.len(),
            failed = summary.failed_allocations,
            converged = summary.rosters_converged,
            "Run finished"
        );
        Ok(summary)
    }

    fn spawn_allocated(
        &self,
        master: usize,
        result: roomsync_protocols::Result<EntityId>,
    ) -> Option<EntityId> {
        match result {
            Ok(id) => {
                let offset = id as f32;
                let record = EntityRecord::new(id)
                    .with_health(SPAWN_HEALTH)
                    .with_position(Vec3::new(offset, 0.0, -offset));
                self.participants[master].roster.roster().spawn(record);
                info!(id, "Entity spawned");
                Some(id)
            }
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "Id allocation failed");
                None
            }
        }
    }

    /// Master-side game logic: entities drift, lose health and chase peers.
    fn advance_entities(&self, master: usize) {
        let roster = self.participants[master].roster.roster();
        let peers = self.participants.len();
        for id in roster.ids() {
            roster.update(id, |record| {
                record.position += Vec3::Z * 0.1;
                record.health -= 1;
                let target = usize::try_from(id).unwrap_or(0) % peers;
                record.target = format!("peer-{}", self.participants[target].peer.id());
            });
            if roster.get(id).is_some_and(|r| r.health <= 0) {
                roster.despawn(id);
                debug!(id, "Entity despawned");
            }
        }
    }

    /// Ship the master's roster to every peer, the master included, as JSON.
    fn broadcast(&self, master: usize) -> Result<()> {
        let mut stream = RosterStream::new();
        self.participants[master].roster.write_tick(&mut stream)?;
        let payload = stream.encode()?;

        for participant in &self.participants {
            let mut incoming = RosterStream::decode(&payload)?;
            if let Err(e) = participant.roster.read_tick(&mut incoming) {
                warn!(peer = participant.peer.id(), error = %e, "Roster tick dropped");
            }
        }
        Ok(())
    }

    fn pump_spawners(&mut self, tick: u64) {
        for participant in &mut self.participants {
            let before = participant.spawner.state();
            participant.spawner.pump_changes();
            let after = participant.spawner.state();
            if before != after {
                let now = participant.session.clock_now();
                info!(
                    peer = participant.peer.id(),
                    tick,
                    starts_in_ms = after.millis_until_start(now),
                    "Spawner state received"
                );
            }
        }
    }

    fn summarize(&self, master: usize, allocated: Vec<EntityId>, failed_allocations: usize) -> RunSummary {
        let leader = &self.participants[master];
        let roster = leader.roster.roster().snapshot();
        let spawner = leader.spawner.state();

        RunSummary {
            ticks: self.config.ticks,
            allocated,
            failed_allocations,
            roster_len: roster.len(),
            rosters_converged: self
                .participants
                .iter()
                .all(|p| p.roster.roster().snapshot() == roster),
            spawner,
            spawners_agree: self.participants.iter().all(|p| p.spawner.state() == spawner),
        }
    }
}
