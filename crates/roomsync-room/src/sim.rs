//! In-memory simulated room.
//!
//! Models an eventually-consistent room: every write travels to the room
//! (one-way latency), the room applies or drops it, then fans the result out
//! to every attached peer (another one-way latency). Peers only ever read
//! their own local view, so a writer sees its own write one round trip
//! later, exactly like a remote peer would.
//!
//! Time is [`tokio::time::Instant`], so tests running on a paused runtime
//! get deterministic, instant virtual-time propagation. Messages are applied
//! lazily whenever any peer touches the room.
//!
//! ```text
//!  peer A ──set/cas──▶ [ uplink queue ] ──arbitrate──▶ room props
//!                                                         │
//!  peer A ◀── local view ◀── [ per-peer inbox, FIFO ] ◀───┘──▶ peer B ...
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::store::{PropertyStore, RoleOracle};
use crate::value::{PropertyChange, PropertyValue};

/// Identifier of a simulated peer (assigned in join order, starting at 1).
pub type PeerId = u32;

/// Configuration for a simulated room.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// One-way latency between a peer and the room.
    pub latency: Duration,

    /// Maximum extra random delay added per message.
    pub jitter: Duration,

    /// Seed for the jitter generator.
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(25),
            jitter: Duration::ZERO,
            seed: 0,
        }
    }
}

impl SimConfig {
    /// A room where writes land as soon as anyone looks.
    #[must_use]
    pub fn instant() -> Self {
        Self {
            latency: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Set the one-way latency.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set the maximum jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the jitter seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Injected misbehavior of the room's write path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Fault {
    /// Writes behave normally.
    #[default]
    None,
    /// Every write is refused locally.
    RejectWrites,
    /// Writes are accepted locally but never reach the room.
    DropWrites,
}

#[derive(Debug, Clone)]
enum WriteOp {
    Set {
        key: String,
        value: PropertyValue,
    },
    CompareAndSet {
        key: String,
        value: PropertyValue,
        expected: PropertyValue,
    },
}

#[derive(Debug)]
struct Uplink {
    arrives_at: Instant,
    seq: u64,
    from: PeerId,
    op: WriteOp,
}

#[derive(Debug)]
struct Downlink {
    arrives_at: Instant,
    seq: u64,
    key: String,
    value: PropertyValue,
}

#[derive(Debug)]
struct PeerView {
    attached: bool,
    props: HashMap<String, PropertyValue>,
    inbox: Vec<Downlink>,
    changes: Vec<PropertyChange>,
    last_delivery: Instant,
    last_uplink: Instant,
    network_calls: u64,
}

#[derive(Debug)]
struct RoomState {
    config: SimConfig,
    props: HashMap<String, PropertyValue>,
    uplinks: Vec<Uplink>,
    peers: BTreeMap<PeerId, PeerView>,
    master: Option<PeerId>,
    next_peer: PeerId,
    next_seq: u64,
    origin: Instant,
    rng: StdRng,
    fault: Fault,
}

impl RoomState {
    fn delay(&mut self) -> Duration {
        let jitter = self.config.jitter.as_micros() as u64;
        let extra = if jitter == 0 {
            0
        } else {
            self.rng.gen_range(0..=jitter)
        };
        self.config.latency + Duration::from_micros(extra)
    }

    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Apply everything that has arrived by `now`.
    fn pump(&mut self, now: Instant) {
        self.uplinks.sort_by_key(|u| (u.arrives_at, u.seq));
        let split = self.uplinks.partition_point(|u| u.arrives_at <= now);
        let arrived: Vec<Uplink> = self.uplinks.drain(..split).collect();
        for uplink in arrived {
            self.arbitrate(uplink);
        }

        for (id, view) in self.peers.iter_mut() {
            if view.inbox.is_empty() {
                continue;
            }
            view.inbox.sort_by_key(|d| (d.arrives_at, d.seq));
            let split = view.inbox.partition_point(|d| d.arrives_at <= now);
            for delivery in view.inbox.drain(..split) {
                trace!(peer = id, key = %delivery.key, value = %delivery.value, "Delivered property");
                view.props.insert(delivery.key.clone(), delivery.value.clone());
                view.changes.push(PropertyChange {
                    key: delivery.key,
                    value: delivery.value,
                });
            }
        }
    }

    fn arbitrate(&mut self, uplink: Uplink) {
        let (key, value) = match uplink.op {
            WriteOp::Set { key, value } => (key, value),
            WriteOp::CompareAndSet {
                key,
                value,
                expected,
            } => {
                if self.props.get(&key) != Some(&expected) {
                    debug!(
                        from = uplink.from,
                        key = %key,
                        expected = %expected,
                        actual = ?self.props.get(&key),
                        "Room dropped conditional write"
                    );
                    return;
                }
                (key, value)
            }
        };

        self.props.insert(key.clone(), value.clone());

        let recipients: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, v)| v.attached)
            .map(|(id, _)| *id)
            .collect();
        for id in recipients {
            let delay = self.delay();
            let seq = self.seq();
            if let Some(view) = self.peers.get_mut(&id) {
                // Per-peer delivery stays FIFO even with jitter.
                let arrives_at = (uplink.arrives_at + delay).max(view.last_delivery);
                view.last_delivery = arrives_at;
                view.inbox.push(Downlink {
                    arrives_at,
                    seq,
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
    }

    fn submit(&mut self, from: PeerId, op: WriteOp) -> bool {
        let attached = match self.peers.get_mut(&from) {
            Some(view) => {
                view.network_calls += 1;
                view.attached
            }
            None => false,
        };
        if !attached {
            return false;
        }

        match self.fault {
            Fault::RejectWrites => false,
            Fault::DropWrites => {
                trace!(from, ?op, "Write swallowed by fault injection");
                true
            }
            Fault::None => {
                let delay = self.delay();
                let seq = self.seq();
                let mut arrives_at = Instant::now() + delay;
                if let Some(view) = self.peers.get_mut(&from) {
                    arrives_at = arrives_at.max(view.last_uplink);
                    view.last_uplink = arrives_at;
                }
                self.uplinks.push(Uplink {
                    arrives_at,
                    seq,
                    from,
                    op,
                });
                true
            }
        }
    }

    fn elect_master(&mut self) {
        self.master = self
            .peers
            .iter()
            .find(|(_, v)| v.attached)
            .map(|(id, _)| *id);
        debug!(master = ?self.master, "Master elected");
    }
}

/// A simulated room shared by any number of [`SimPeer`]s.
#[derive(Debug, Clone)]
pub struct SimRoom {
    state: Arc<Mutex<RoomState>>,
}

impl Default for SimRoom {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimRoom {
    /// Create an empty room.
    pub fn new(config: SimConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            state: Arc::new(Mutex::new(RoomState {
                config,
                props: HashMap::new(),
                uplinks: Vec::new(),
                peers: BTreeMap::new(),
                master: None,
                next_peer: 1,
                next_seq: 0,
                origin: Instant::now(),
                rng,
                fault: Fault::None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join a new peer. The first peer to join an empty room becomes master.
    ///
    /// A joining peer receives a copy of the room's current properties.
    pub fn join(&self) -> SimPeer {
        let mut state = self.lock();
        let now = Instant::now();
        state.pump(now);

        let id = state.next_peer;
        state.next_peer += 1;
        let props = state.props.clone();
        state.peers.insert(
            id,
            PeerView {
                attached: true,
                props,
                inbox: Vec::new(),
                changes: Vec::new(),
                last_delivery: now,
                last_uplink: now,
                network_calls: 0,
            },
        );
        if state.master.is_none() {
            state.master = Some(id);
        }
        debug!(peer = id, master = ?state.master, "Peer joined room");

        SimPeer {
            room: self.clone(),
            id,
        }
    }

    /// Hand the master role to `peer`. Ignored if the peer is not attached.
    pub fn set_master(&self, peer: PeerId) {
        let mut state = self.lock();
        if state.peers.get(&peer).is_some_and(|v| v.attached) {
            state.master = Some(peer);
            debug!(master = peer, "Master switched");
        }
    }

    /// Current master, if any peer is attached.
    pub fn master(&self) -> Option<PeerId> {
        self.lock().master
    }

    /// Set the write-path fault.
    pub fn set_fault(&self, fault: Fault) {
        self.lock().fault = fault;
    }

    /// The room's own (authoritative) value for `key`.
    pub fn room_value(&self, key: &str) -> Option<PropertyValue> {
        let mut state = self.lock();
        state.pump(Instant::now());
        state.props.get(key).cloned()
    }

    /// Number of write calls `peer` has made against the room.
    pub fn network_calls(&self, peer: PeerId) -> u64 {
        self.lock()
            .peers
            .get(&peer)
            .map(|v| v.network_calls)
            .unwrap_or(0)
    }

    /// Number of messages still travelling.
    pub fn in_flight(&self) -> usize {
        let mut state = self.lock();
        state.pump(Instant::now());
        state.uplinks.len() + state.peers.values().map(|v| v.inbox.len()).sum::<usize>()
    }
}

/// One peer's handle onto a [`SimRoom`].
#[derive(Debug, Clone)]
pub struct SimPeer {
    room: SimRoom,
    id: PeerId,
}

impl SimPeer {
    /// This peer's id.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The room this peer belongs to.
    pub fn room(&self) -> &SimRoom {
        &self.room
    }

    /// Detach from the room. The local view is discarded; if this peer was
    /// master, the lowest attached peer takes over.
    pub fn leave(&self) {
        let mut state = self.room.lock();
        if let Some(view) = state.peers.get_mut(&self.id) {
            view.attached = false;
            view.props.clear();
            view.inbox.clear();
            view.changes.clear();
        }
        if state.master == Some(self.id) {
            state.elect_master();
        }
        debug!(peer = self.id, "Peer left room");
    }

    /// Re-attach after [`leave`](Self::leave), receiving the current properties.
    pub fn rejoin(&self) {
        let mut state = self.room.lock();
        let now = Instant::now();
        state.pump(now);
        let props = state.props.clone();
        if let Some(view) = state.peers.get_mut(&self.id) {
            view.attached = true;
            view.props = props;
            view.last_delivery = now;
        }
        if state.master.is_none() {
            state.master = Some(self.id);
        }
    }
}

impl PropertyStore for SimPeer {
    fn get(&self, key: &str) -> Option<PropertyValue> {
        let mut state = self.room.lock();
        state.pump(Instant::now());
        state
            .peers
            .get(&self.id)
            .and_then(|v| v.props.get(key).cloned())
    }

    fn set(&self, key: &str, value: PropertyValue) -> bool {
        let mut state = self.room.lock();
        state.pump(Instant::now());
        state.submit(
            self.id,
            WriteOp::Set {
                key: key.to_string(),
                value,
            },
        )
    }

    fn compare_and_set(&self, key: &str, value: PropertyValue, expected: PropertyValue) -> bool {
        let mut state = self.room.lock();
        state.pump(Instant::now());
        state.submit(
            self.id,
            WriteOp::CompareAndSet {
                key: key.to_string(),
                value,
                expected,
            },
        )
    }

    fn poll_changes(&self) -> Vec<PropertyChange> {
        let mut state = self.room.lock();
        state.pump(Instant::now());
        state
            .peers
            .get_mut(&self.id)
            .map(|v| std::mem::take(&mut v.changes))
            .unwrap_or_default()
    }
}

impl RoleOracle for SimPeer {
    fn is_attached(&self) -> bool {
        self.room
            .lock()
            .peers
            .get(&self.id)
            .is_some_and(|v| v.attached)
    }

    fn is_single_writer(&self) -> bool {
        self.room.lock().master == Some(self.id)
    }

    fn session_clock_now(&self) -> i64 {
        let origin = self.room.lock().origin;
        Instant::now().duration_since(origin).as_millis() as i64
    }
}
