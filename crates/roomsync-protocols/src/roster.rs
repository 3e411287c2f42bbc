//! Roster Synchronization - full-state entity broadcast.
//!
//! The master owns the authoritative roster of spawned entities. Once per
//! network tick it writes the whole roster to a [`RosterStream`]; every peer
//! reads the latest frame and reconciles its own roster against it:
//!
//! 1. remove ids that are not in the frame
//! 2. insert defaulted records for ids it has not seen
//! 3. overwrite every field of every id in the frame
//!
//! After a frame is applied the local key set equals the frame's id set.
//! Reconciliation is idempotent; re-applying a frame changes nothing.
//!
//! One mutex covers the roster. Snapshots, reconciliation and bulk writes
//! from game logic never interleave.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::session::RoomSession;
use crate::wire::{FrameError, RosterFrame, RosterStream};

/// Identifier of a spawned entity, handed out by the CAS counter.
pub type EntityId = i64;

/// Replicated state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub health: i32,
    pub position: Vec3,
    pub orientation: Quat,
    pub scale: Vec3,
    /// Reference to the entity's current target; empty when it has none.
    pub target: String,
}

impl EntityRecord {
    /// A record with defaulted fields, as created for a newly seen id.
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            health: 0,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            scale: Vec3::ONE,
            target: String::new(),
        }
    }

    #[must_use]
    pub fn with_health(mut self, health: i32) -> Self {
        self.health = health;
        self
    }

    #[must_use]
    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    #[must_use]
    pub fn with_orientation(mut self, orientation: Quat) -> Self {
        self.orientation = orientation;
        self
    }

    #[must_use]
    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Whether the entity has a target.
    pub fn has_target(&self) -> bool {
        !self.target.is_empty()
    }
}

/// What one reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Ids created from the frame.
    pub added: Vec<EntityId>,
    /// Existing ids overwritten from the frame.
    pub updated: usize,
    /// Ids dropped because the frame did not list them.
    pub removed: Vec<EntityId>,
}

impl ReconcileReport {
    /// Whether the key set changed.
    pub fn changed_membership(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// A peer's local roster.
#[derive(Debug, Default)]
pub struct Roster {
    entities: Mutex<BTreeMap<EntityId, EntityRecord>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<EntityId, EntityRecord>> {
        self.entities.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consistent copy of every record, in id order.
    pub fn snapshot(&self) -> Vec<EntityRecord> {
        self.lock().values().cloned().collect()
    }

    /// Reconcile against a broadcast frame.
    ///
    /// The frame is validated before the roster is touched; an invalid
    /// frame leaves the roster unchanged.
    pub fn apply(&self, frame: &RosterFrame) -> std::result::Result<ReconcileReport, FrameError> {
        frame.validate()?;
        let listed: BTreeSet<EntityId> = frame.ids.iter().copied().collect();

        let mut report = ReconcileReport::default();
        let mut entities = self.lock();

        entities.retain(|id, _| {
            let keep = listed.contains(id);
            if !keep {
                report.removed.push(*id);
            }
            keep
        });

        for record in frame.records() {
            let slot = entities.entry(record.id).or_insert_with(|| {
                report.added.push(record.id);
                EntityRecord::new(record.id)
            });
            *slot = record;
        }
        report.updated = frame.len() - report.added.len();

        Ok(report)
    }

    /// Upsert records from game logic. With `remove_unlisted`, ids not in
    /// `records` are dropped as well.
    pub fn write_records<I>(&self, records: I, remove_unlisted: bool) -> ReconcileReport
    where
        I: IntoIterator<Item = EntityRecord>,
    {
        let mut report = ReconcileReport::default();
        let mut listed = BTreeSet::new();
        let mut entities = self.lock();

        for record in records {
            listed.insert(record.id);
            if entities.insert(record.id, record.clone()).is_some() {
                report.updated += 1;
            } else {
                report.added.push(record.id);
            }
        }

        if remove_unlisted {
            entities.retain(|id, _| {
                let keep = listed.contains(id);
                if !keep {
                    report.removed.push(*id);
                }
                keep
            });
        }
        report
    }

    /// Insert or replace one record.
    pub fn spawn(&self, record: EntityRecord) {
        trace!(id = record.id, "Entity spawned");
        self.lock().insert(record.id, record);
    }

    /// Remove one record. Returns it if it existed.
    pub fn despawn(&self, id: EntityId) -> Option<EntityRecord> {
        self.lock().remove(&id)
    }

    /// Mutate one record in place. Returns false if `id` is unknown.
    pub fn update<F>(&self, id: EntityId, f: F) -> bool
    where
        F: FnOnce(&mut EntityRecord),
    {
        match self.lock().get_mut(&id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: EntityId) -> Option<EntityRecord> {
        self.lock().get(&id).cloned()
    }

    /// Known ids, ascending.
    pub fn ids(&self) -> Vec<EntityId> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Drives roster broadcast and reconciliation for one peer.
#[derive(Debug, Clone)]
pub struct RosterSync {
    session: RoomSession,
    roster: Arc<Roster>,
}

impl RosterSync {
    pub fn new(session: RoomSession, roster: Arc<Roster>) -> Self {
        Self { session, roster }
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    /// Write this tick's frame (master only). Returns the entity count.
    pub fn write_tick(&self, stream: &mut RosterStream) -> Result<usize> {
        self.session.ensure_master()?;

        let frame = RosterFrame::from_records(&self.roster.snapshot());
        let count = frame.len();
        frame.write_to(stream);

        trace!(count, "Roster frame written");
        Ok(count)
    }

    /// Read the latest frame and reconcile the local roster against it.
    ///
    /// A malformed frame is rejected whole and the previous roster kept.
    pub fn read_tick(&self, stream: &mut RosterStream) -> Result<ReconcileReport> {
        self.session.ensure_attached()?;

        let report = RosterFrame::read_from(stream)
            .and_then(|frame| self.roster.apply(&frame))
            .map_err(|e| {
                warn!(error = %e, "Roster frame rejected, keeping previous roster");
                e
            })?;

        if report.changed_membership() {
            debug!(
                added = ?report.added,
                removed = ?report.removed,
                updated = report.updated,
                "Roster reconciled"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::wire::RosterArray;
    use proptest::prelude::*;
    use roomsync_room::{SimConfig, SimRoom};

    fn record(id: EntityId, health: i32) -> EntityRecord {
        EntityRecord::new(id)
            .with_health(health)
            .with_position(Vec3::new(id as f32, 0.0, 0.0))
            .with_target(format!("t{id}"))
    }

    fn frame(records: &[EntityRecord]) -> RosterFrame {
        RosterFrame::from_records(records)
    }

    #[test]
    fn defaulted_record() {
        let r = EntityRecord::new(9);
        assert_eq!(r.health, 0);
        assert_eq!(r.position, Vec3::ZERO);
        assert_eq!(r.orientation, Quat::IDENTITY);
        assert_eq!(r.scale, Vec3::ONE);
        assert!(!r.has_target());
    }

    #[test]
    fn reconcile_replaces_by_diff() {
        let roster = Roster::new();
        roster.write_records([record(1, 10), record(2, 20), record(3, 30)], false);

        let broadcast = [record(2, 21), record(3, 31), record(4, 41)];
        let report = roster.apply(&frame(&broadcast)).unwrap();

        assert_eq!(roster.ids(), vec![2, 3, 4]);
        assert_eq!(report.removed, vec![1]);
        assert_eq!(report.added, vec![4]);
        assert_eq!(report.updated, 2);
        assert_eq!(roster.get(4), Some(record(4, 41)));
        assert_eq!(roster.get(2).map(|r| r.health), Some(21));
        assert_eq!(roster.get(3).map(|r| r.health), Some(31));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let roster = Roster::new();
        let broadcast = frame(&[record(5, 1), record(6, 2)]);

        roster.apply(&broadcast).unwrap();
        let first = roster.snapshot();
        let report = roster.apply(&broadcast).unwrap();

        assert_eq!(roster.snapshot(), first);
        assert!(!report.changed_membership());
        assert_eq!(report.updated, 2);
    }

    #[test]
    fn empty_frame_clears_roster() {
        let roster = Roster::new();
        roster.spawn(record(1, 1));
        let report = roster.apply(&RosterFrame::default()).unwrap();
        assert!(roster.is_empty());
        assert_eq!(report.removed, vec![1]);
    }

    #[test]
    fn malformed_frame_leaves_roster_unchanged() {
        let roster = Roster::new();
        roster.write_records([record(1, 10), record(2, 20)], false);
        let before = roster.snapshot();

        let mut bad = frame(&[record(7, 70)]);
        bad.healths.clear();
        assert!(matches!(
            roster.apply(&bad),
            Err(FrameError::LengthMismatch { .. })
        ));
        assert_eq!(roster.snapshot(), before);
    }

    #[test]
    fn bulk_write_with_pruning() {
        let roster = Roster::new();
        roster.write_records([record(1, 1), record(2, 2)], false);

        let report = roster.write_records([record(2, 5), record(3, 3)], false);
        assert_eq!(report.added, vec![3]);
        assert_eq!(report.updated, 1);
        assert_eq!(roster.len(), 3);

        let report = roster.write_records([record(3, 4)], true);
        assert_eq!(report.removed, vec![1, 2]);
        assert_eq!(roster.ids(), vec![3]);
    }

    #[test]
    fn spawn_update_despawn() {
        let roster = Roster::new();
        roster.spawn(EntityRecord::new(1));
        assert!(roster.update(1, |r| r.health = 50));
        assert!(!roster.update(2, |r| r.health = 50));
        assert_eq!(roster.get(1).map(|r| r.health), Some(50));
        assert!(roster.despawn(1).is_some());
        assert!(roster.despawn(1).is_none());
    }

    #[test]
    fn master_broadcast_reaches_follower() {
        let room = SimRoom::new(SimConfig::instant());
        let master = RosterSync::new(RoomSession::from_peer(room.join()), Arc::new(Roster::new()));
        let follower = RosterSync::new(RoomSession::from_peer(room.join()), Arc::new(Roster::new()));

        master.roster().write_records([record(1, 10), record(2, 20)], false);
        follower.roster().spawn(record(99, 1));

        let mut stream = RosterStream::new();
        assert_eq!(master.write_tick(&mut stream).unwrap(), 2);
        let report = follower.read_tick(&mut stream).unwrap();

        assert_eq!(report.removed, vec![99]);
        assert_eq!(follower.roster().snapshot(), master.roster().snapshot());
    }

    #[test]
    fn master_reconciles_its_own_frame() {
        let room = SimRoom::new(SimConfig::instant());
        let master = RosterSync::new(RoomSession::from_peer(room.join()), Arc::new(Roster::new()));
        master.roster().write_records([record(1, 10), record(2, 20)], false);
        let before = master.roster().snapshot();

        let mut stream = RosterStream::new();
        master.write_tick(&mut stream).unwrap();
        let report = master.read_tick(&mut stream).unwrap();

        assert!(!report.changed_membership());
        assert_eq!(report.updated, 2);
        assert_eq!(master.roster().snapshot(), before);
    }

    #[test]
    fn trailing_array_keeps_previous_roster() {
        let room = SimRoom::new(SimConfig::instant());
        let master = RosterSync::new(RoomSession::from_peer(room.join()), Arc::new(Roster::new()));
        let follower = RosterSync::new(RoomSession::from_peer(room.join()), Arc::new(Roster::new()));
        master.roster().spawn(record(4, 40));
        follower.roster().spawn(record(1, 1));

        let mut stream = RosterStream::new();
        master.write_tick(&mut stream).unwrap();
        stream.send_next(RosterArray::Ids(vec![5]));
        let err = follower.read_tick(&mut stream).unwrap_err();

        assert!(matches!(
            err,
            Error::Frame(FrameError::Trailing(crate::wire::RosterField::Ids))
        ));
        assert_eq!(follower.roster().ids(), vec![1]);
    }

    #[test]
    fn follower_cannot_broadcast() {
        let room = SimRoom::new(SimConfig::instant());
        let _master = room.join();
        let follower = RosterSync::new(RoomSession::from_peer(room.join()), Arc::new(Roster::new()));

        let mut stream = RosterStream::new();
        assert!(matches!(follower.write_tick(&mut stream), Err(Error::NotMaster)));
        assert!(stream.is_empty());
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let room = SimRoom::new(SimConfig::instant());
        let peer = RosterSync::new(RoomSession::from_peer(room.join()), Arc::new(Roster::new()));
        peer.roster().spawn(record(1, 1));

        let mut stream = RosterStream::new();
        stream.send_next(RosterArray::Ids(vec![2]));
        let err = peer.read_tick(&mut stream).unwrap_err();

        assert!(matches!(err, Error::Frame(FrameError::Missing(_))));
        assert_eq!(peer.roster().ids(), vec![1]);
    }

    proptest! {
        #[test]
        fn key_set_matches_broadcast(
            local in prop::collection::btree_set(0i64..64, 0..24),
            broadcast in prop::collection::btree_set(0i64..64, 0..24),
        ) {
            let roster = Roster::new();
            roster.write_records(local.iter().map(|&id| record(id, 1)), false);

            let records: Vec<_> = broadcast.iter().map(|&id| record(id, 2)).collect();
            let report = roster.apply(&frame(&records)).unwrap();

            prop_assert_eq!(roster.ids(), broadcast.iter().copied().collect::<Vec<_>>());
            prop_assert!(roster.snapshot().iter().all(|r| r.health == 2));
            prop_assert_eq!(report.added.len() + report.updated, broadcast.len());
            prop_assert_eq!(
                report.removed.len(),
                local.difference(&broadcast).count()
            );
        }
    }
}
