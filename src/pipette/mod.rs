//! Pipette capability boundary.
//!
//! The core never drives a robot directly. Motion and liquid primitives are
//! reached through the [`Pipette`] trait, implemented by the host robot layer
//! (or by [`crate::hardware::mock::MockPipette`] in tests). The trait is
//! async and returns `anyhow::Result` so drivers can report whatever went
//! wrong; the core wraps those errors into `PipettingError::Hardware`.

pub mod chooser;

pub use chooser::PipetteChooser;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::labware::Location;

/// Flow-rate multipliers applied by the motion layer for one protocol stage.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowRate {
    /// Aspiration rate multiplier
    pub aspirate: f64,
    /// Dispense rate multiplier
    pub dispense: f64,
    /// Blow-out rate multiplier
    pub blow_out: f64,
}

impl Default for FlowRate {
    fn default() -> Self {
        Self {
            aspirate: 1.0,
            dispense: 1.0,
            blow_out: 1.0,
        }
    }
}

/// Liquid handling primitives of one mounted pipette.
#[async_trait]
pub trait Pipette: Send + Sync {
    /// Display name, unique per robot.
    fn name(&self) -> &str;

    /// Whether a tip is currently mounted.
    async fn has_tip(&self) -> Result<bool>;

    /// Mount a tip from the rack.
    async fn pick_up_tip(&self) -> Result<()>;

    /// Discard the mounted tip.
    async fn drop_tip(&self) -> Result<()>;

    /// Move to `location`; `speed` in mm/s, or the default gantry speed.
    async fn move_to(&self, location: &Location, speed: Option<f64>) -> Result<()>;

    /// Aspirate `volume` ul at the current position.
    async fn aspirate(&self, volume: f64) -> Result<()>;

    /// Dispense `volume` ul at the current position.
    async fn dispense(&self, volume: f64) -> Result<()>;

    /// Draw `volume` ul of air.
    async fn air_gap(&self, volume: f64) -> Result<()>;

    /// Apply flow rate multipliers to the following commands.
    async fn set_flow_rate(&self, flow_rate: FlowRate) -> Result<()>;
}

/// One pipette primitive, as planned by the transfer engine or recorded by a mock.
///
/// Tip commands are idempotent when executed: picking up skips a pipette
/// already holding a tip, dropping skips one without.
#[derive(Clone, Debug, PartialEq)]
pub enum PipetteCommand {
    /// Mount a fresh tip
    PickUpTip,
    /// Discard the mounted tip
    DropTip,
    /// Move the tip end
    MoveTo {
        /// Target position
        location: Location,
        /// Speed in mm/s, or the default gantry speed
        speed: Option<f64>,
    },
    /// Aspirate liquid, in ul
    Aspirate(f64),
    /// Dispense, in ul
    Dispense(f64),
    /// Draw air, in ul
    AirGap(f64),
    /// Apply flow rate multipliers
    SetFlowRate(FlowRate),
}

/// Shared reference to a pipette, compared by identity.
#[derive(Clone)]
pub struct PipetteHandle(Arc<dyn Pipette>);

impl PipetteHandle {
    /// Wrap a shared pipette driver.
    pub fn new(pipette: Arc<dyn Pipette>) -> Self {
        Self(pipette)
    }
}

impl<P: Pipette + 'static> From<Arc<P>> for PipetteHandle {
    fn from(pipette: Arc<P>) -> Self {
        Self(pipette)
    }
}

impl Deref for PipetteHandle {
    type Target = dyn Pipette;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for PipetteHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for PipetteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PipetteHandle").field(&self.0.name()).finish()
    }
}

impl fmt::Display for PipetteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.name())
    }
}
