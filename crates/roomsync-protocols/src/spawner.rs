//! Spawner State - a master-published room property.
//!
//! The spawner record tells every peer whether spawning is armed and when it
//! starts on the shared session clock. It is stored as JSON text under one
//! key:
//!
//! ```text
//! {"state":"InAction","scheduledStartTimestamp":48210}
//! ```
//!
//! Only the master writes it, unconditionally; there is no compare-and-set
//! on this key. Every peer keeps a cached copy and re-parses the property on
//! join and on each change. A record that fails to parse is logged and the
//! previous cached copy kept.

use roomsync_room::{PropertyChange, PropertyValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::convergence::await_value;
use crate::error::{Error, Result};
use crate::pacing::Pacer;
use crate::session::RoomSession;

/// Default property key of the spawner record.
pub const DEFAULT_SPAWNER_KEY: &str = "bot_spw001";

/// Whether the spawner is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpawnerPhase {
    #[default]
    StandBy,
    InAction,
}

/// The published spawner record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnerState {
    pub state: SpawnerPhase,

    /// Session-clock milliseconds at which spawning starts.
    #[serde(rename = "scheduledStartTimestamp")]
    pub scheduled_start: i64,
}

impl SpawnerState {
    /// An armed record starting at `scheduled_start`.
    pub fn in_action(scheduled_start: i64) -> Self {
        Self {
            state: SpawnerPhase::InAction,
            scheduled_start,
        }
    }

    /// JSON text form stored in the room.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the JSON text form.
    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_active(&self) -> bool {
        self.state == SpawnerPhase::InAction
    }

    /// Milliseconds from `now` until the scheduled start; negative once
    /// started.
    pub fn millis_until_start(&self, now: i64) -> i64 {
        self.scheduled_start.saturating_sub(now)
    }
}

fn parse(key: &str, value: &PropertyValue) -> Option<SpawnerState> {
    let Some(text) = value.as_text() else {
        warn!(key, %value, "Spawner property is not text");
        return None;
    };
    match SpawnerState::from_text(text) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(key, error = %e, "Failed to parse spawner property");
            None
        }
    }
}

/// One peer's view of the spawner record.
#[derive(Debug)]
pub struct SpawnerSync {
    key: String,
    session: RoomSession,
    cached: SpawnerState,
    last_published: Option<SpawnerState>,
}

impl SpawnerSync {
    pub fn new(session: RoomSession, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            session,
            cached: SpawnerState::default(),
            last_published: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The cached record.
    pub fn state(&self) -> SpawnerState {
        self.cached
    }

    /// Call after joining a room.
    ///
    /// A master creates the record if the room has none yet. Every peer
    /// then loads whatever the room holds.
    pub fn on_joined(&mut self) -> Result<()> {
        self.session.ensure_attached()?;
        if self.session.is_master() && self.session.store().get(&self.key).is_none() {
            self.publish(SpawnerState::default())?;
        }
        self.refresh();
        Ok(())
    }

    /// Reload from the local view. Returns whether the cache changed.
    pub fn refresh(&mut self) -> bool {
        match self.session.store().get(&self.key) {
            Some(value) => self.load(&value),
            None => false,
        }
    }

    /// Handle a batch of property changes in arrival order. Returns whether
    /// the cache changed.
    ///
    /// Each change to the key is loaded in turn, so a corrupted record
    /// arriving after a valid one leaves the valid one cached.
    pub fn on_properties_changed(&mut self, changes: &[PropertyChange]) -> bool {
        let mut changed = false;
        for change in changes {
            if change.key != self.key {
                continue;
            }
            changed |= self.load(&change.value);
        }
        changed
    }

    /// Drain pending store changes and handle them.
    ///
    /// The store's change queue is shared per peer; changes to other keys
    /// are returned for the caller to route.
    pub fn pump_changes(&mut self) -> Vec<PropertyChange> {
        let changes = self.session.store().poll_changes();
        self.on_properties_changed(&changes);
        changes
    }

    fn load(&mut self, value: &PropertyValue) -> bool {
        let Some(state) = parse(&self.key, value) else {
            return false;
        };
        if state == self.cached {
            return false;
        }
        debug!(key = %self.key, ?state, "Spawner state updated");
        self.cached = state;
        true
    }

    /// Arm the spawner to start `in_millis` from now on the session clock
    /// (master only).
    pub fn start(&mut self, in_millis: i64) -> Result<SpawnerState> {
        self.session.ensure_master()?;
        let state = SpawnerState::in_action(self.session.clock_now().saturating_add(in_millis));
        self.publish(state)?;
        Ok(state)
    }

    /// Write `state` to the room (master only).
    ///
    /// The local cache takes the new value immediately; the room copy
    /// converges later.
    pub fn publish(&mut self, state: SpawnerState) -> Result<()> {
        self.session.ensure_master()?;
        let text = state.to_text()?;
        if !self.session.store().set(&self.key, PropertyValue::Text(text)) {
            warn!(key = %self.key, "Spawner publish rejected");
            return Err(Error::Rejected(self.key.clone()));
        }

        info!(key = %self.key, ?state, "Spawner state published");
        self.cached = state;
        self.last_published = Some(state);
        Ok(())
    }

    /// Wait until the local view holds a record accepted by `accept`, then
    /// cache and return it.
    pub async fn await_state<P, F>(&mut self, mut accept: F, pacer: &P) -> Result<SpawnerState>
    where
        P: Pacer,
        F: FnMut(&SpawnerState) -> bool + Send,
    {
        let key = self.key.clone();
        let value = await_value(
            self.session.store(),
            &key,
            |value| {
                value
                    .as_text()
                    .and_then(|text| SpawnerState::from_text(text).ok())
                    .is_some_and(|state| accept(&state))
            },
            pacer.policy(),
            pacer,
        )
        .await?;

        self.load(&value);
        Ok(self.cached)
    }

    /// Wait until the last record this peer published is visible locally.
    pub async fn await_published<P: Pacer>(&mut self, pacer: &P) -> Result<SpawnerState> {
        let target = self.last_published.unwrap_or(self.cached);
        self.await_state(|state| *state == target, pacer).await
    }
}
