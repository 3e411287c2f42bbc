//! Roster wire frame - the parallel-array transport boundary.
//!
//! On the wire a roster is six arrays sent in a fixed order:
//!
//! ```text
//! ids │ healths │ positions │ orientations │ scales │ targets
//! ```
//!
//! Index `i` of every array describes the same entity. Everywhere else the
//! roster is handled as typed [`EntityRecord`]s; this module is the only
//! place the columns exist.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;
use crate::roster::{EntityId, EntityRecord};

/// Which column of the frame an array carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RosterField {
    Ids,
    Healths,
    Positions,
    Orientations,
    Scales,
    Targets,
}

impl RosterField {
    /// Transmission order.
    pub const ORDER: [RosterField; 6] = [
        Self::Ids,
        Self::Healths,
        Self::Positions,
        Self::Orientations,
        Self::Scales,
        Self::Targets,
    ];
}

impl fmt::Display for RosterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ids => "ids",
            Self::Healths => "healths",
            Self::Positions => "positions",
            Self::Orientations => "orientations",
            Self::Scales => "scales",
            Self::Targets => "targets",
        };
        f.write_str(name)
    }
}

/// One array on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "values", rename_all = "snake_case")]
pub enum RosterArray {
    Ids(Vec<EntityId>),
    Healths(Vec<i32>),
    Positions(Vec<Vec3>),
    Orientations(Vec<Quat>),
    Scales(Vec<Vec3>),
    Targets(Vec<String>),
}

impl RosterArray {
    /// The column this array carries.
    pub fn field(&self) -> RosterField {
        match self {
            Self::Ids(_) => RosterField::Ids,
            Self::Healths(_) => RosterField::Healths,
            Self::Positions(_) => RosterField::Positions,
            Self::Orientations(_) => RosterField::Orientations,
            Self::Scales(_) => RosterField::Scales,
            Self::Targets(_) => RosterField::Targets,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        match self {
            Self::Ids(v) => v.len(),
            Self::Healths(v) => v.len(),
            Self::Positions(v) => v.len(),
            Self::Orientations(v) => v.len(),
            Self::Scales(v) => v.len(),
            Self::Targets(v) => v.len(),
        }
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ways a received frame can violate the transport contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("stream ended before the {0} array")]
    Missing(RosterField),

    #[error("expected the {expected} array, got {actual}")]
    OutOfOrder {
        expected: RosterField,
        actual: RosterField,
    },

    #[error("{field} has {actual} entries, ids has {expected}")]
    LengthMismatch {
        field: RosterField,
        expected: usize,
        actual: usize,
    },

    #[error("entity {0} appears more than once")]
    DuplicateId(EntityId),

    #[error("unexpected {0} array after the targets array")]
    Trailing(RosterField),
}

/// A whole roster in column form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterFrame {
    pub ids: Vec<EntityId>,
    pub healths: Vec<i32>,
    pub positions: Vec<Vec3>,
    pub orientations: Vec<Quat>,
    pub scales: Vec<Vec3>,
    pub targets: Vec<String>,
}

impl RosterFrame {
    /// Project records into columns, preserving iteration order.
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a EntityRecord>,
    {
        let mut frame = Self::default();
        for record in records {
            frame.ids.push(record.id);
            frame.healths.push(record.health);
            frame.positions.push(record.position);
            frame.orientations.push(record.orientation);
            frame.scales.push(record.scale);
            frame.targets.push(record.target.clone());
        }
        frame
    }

    /// Number of entities (length of the id column).
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Check that every column matches the id column and ids are unique.
    pub fn validate(&self) -> std::result::Result<(), FrameError> {
        let expected = self.ids.len();
        let lengths = [
            (RosterField::Healths, self.healths.len()),
            (RosterField::Positions, self.positions.len()),
            (RosterField::Orientations, self.orientations.len()),
            (RosterField::Scales, self.scales.len()),
            (RosterField::Targets, self.targets.len()),
        ];
        for (field, actual) in lengths {
            if actual != expected {
                return Err(FrameError::LengthMismatch {
                    field,
                    expected,
                    actual,
                });
            }
        }

        let mut seen = HashSet::with_capacity(expected);
        for &id in &self.ids {
            if !seen.insert(id) {
                return Err(FrameError::DuplicateId(id));
            }
        }
        Ok(())
    }

    /// Zip the columns back into records. Call [`validate`](Self::validate)
    /// first; surplus entries in longer columns are ignored.
    pub fn records(&self) -> impl Iterator<Item = EntityRecord> + '_ {
        self.ids
            .iter()
            .zip(&self.healths)
            .zip(&self.positions)
            .zip(&self.orientations)
            .zip(&self.scales)
            .zip(&self.targets)
            .map(
                |(((((&id, &health), &position), &orientation), &scale), target)| EntityRecord {
                    id,
                    health,
                    position,
                    orientation,
                    scale,
                    target: target.clone(),
                },
            )
    }

    /// Send the six arrays in transmission order.
    pub fn write_to(self, stream: &mut RosterStream) {
        stream.send_next(RosterArray::Ids(self.ids));
        stream.send_next(RosterArray::Healths(self.healths));
        stream.send_next(RosterArray::Positions(self.positions));
        stream.send_next(RosterArray::Orientations(self.orientations));
        stream.send_next(RosterArray::Scales(self.scales));
        stream.send_next(RosterArray::Targets(self.targets));
    }

    /// Receive exactly six arrays in transmission order and validate them.
    pub fn read_from(stream: &mut RosterStream) -> std::result::Result<Self, FrameError> {
        macro_rules! take {
            ($variant:ident) => {
                match stream.receive_next() {
                    Some(RosterArray::$variant(values)) => values,
                    Some(other) => {
                        return Err(FrameError::OutOfOrder {
                            expected: RosterField::$variant,
                            actual: other.field(),
                        })
                    }
                    None => return Err(FrameError::Missing(RosterField::$variant)),
                }
            };
        }

        let frame = Self {
            ids: take!(Ids),
            healths: take!(Healths),
            positions: take!(Positions),
            orientations: take!(Orientations),
            scales: take!(Scales),
            targets: take!(Targets),
        };
        if let Some(extra) = stream.receive_next() {
            return Err(FrameError::Trailing(extra.field()));
        }
        frame.validate()?;
        Ok(frame)
    }
}

/// Ordered per-tick stream of roster arrays.
///
/// The writer calls [`send_next`](Self::send_next) and the reader drains
/// with [`receive_next`](Self::receive_next) in the same order. The whole
/// stream serializes as JSON for transports that ship opaque payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RosterStream {
    items: VecDeque<RosterArray>,
}

impl RosterStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an array.
    pub fn send_next(&mut self, array: RosterArray) {
        self.items.push_back(array);
    }

    /// Take the next array, if any.
    pub fn receive_next(&mut self) -> Option<RosterArray> {
        self.items.pop_front()
    }

    /// Arrays not yet received.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Encode as JSON text.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON text.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
