//! Which slot holds a hand-off plate.
//!
//! Plates move between the two robots through an external plate handler.
//! Each robot keeps its own tracker, updated by its pick and drop calls, so
//! the protocol can ask where the shared plate is without replaying history.
//! The tracker never talks to hardware and does not check that two plates
//! share a slot.

use std::fmt;
use tracing::debug;

use crate::error::{AppResult, PipettingError};

/// Where a tracked plate currently is.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PlateLocation {
    /// Not on this robot's deck (in transit or never loaded)
    #[default]
    Unloaded,
    /// Sitting in the named slot
    AtSlot(String),
}

impl fmt::Display for PlateLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlateLocation::Unloaded => f.write_str("unloaded"),
            PlateLocation::AtSlot(slot) => write!(f, "slot {}", slot),
        }
    }
}

/// Location state of one named plate.
#[derive(Clone, Debug)]
pub struct PlateTracker {
    plate_name: String,
    location: PlateLocation,
}

impl PlateTracker {
    /// Tracker for a plate that is not loaded yet
    pub fn new(plate_name: &str) -> Self {
        Self {
            plate_name: plate_name.to_string(),
            location: PlateLocation::Unloaded,
        }
    }

    /// Name of the tracked plate
    pub fn plate_name(&self) -> &str {
        &self.plate_name
    }

    /// Record the plate as dropped in `slot`.
    pub fn set_slot(&mut self, slot: &str) {
        debug!("Plate {} now at slot {}", self.plate_name, slot);
        self.location = PlateLocation::AtSlot(slot.to_string());
    }

    /// Record the plate as picked up.
    pub fn clear_slot(&mut self) {
        debug!("Plate {} unloaded from {}", self.plate_name, self.location);
        self.location = PlateLocation::Unloaded;
    }

    /// The slot holding the plate.
    pub fn slot(&self) -> AppResult<&str> {
        match &self.location {
            PlateLocation::AtSlot(slot) => Ok(slot),
            PlateLocation::Unloaded => Err(PipettingError::PlateNotLoaded(self.plate_name.clone())),
        }
    }

    /// Current location
    pub fn location(&self) -> &PlateLocation {
        &self.location
    }

    /// Whether the plate sits in a slot
    pub fn is_loaded(&self) -> bool {
        matches!(self.location, PlateLocation::AtSlot(_))
    }
}
