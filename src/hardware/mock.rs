//! Mock Hardware Implementations
//!
//! Simulated collaborators for running protocols without a robot.
//! All state lives behind `tokio::sync::RwLock` so mocks can be shared
//! between the station and the test through an `Arc`.
//!
//! # Available Mocks
//!
//! - `MockPipette` - Pipette tracking tip, liquid and air, recording every command
//! - `MockPlateHandler` - Plate handling service recording pick/drop requests
//! - `MockOperator` - Operator that resumes immediately and records pause messages
//! - `MockHeaterShaker` - Heater-shaker remembering speed and temperature
//! - `MockThermalCycler` - Thermal cycler recording the programs it ran

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::hardware::{Operator, PlateHandler};
use crate::labware::Location;
use crate::modules::{HeaterShaker, ThermalCycler};
use crate::pipette::{FlowRate, Pipette, PipetteCommand};

const VOLUME_EPSILON: f64 = 1e-6;

// =============================================================================
// MockPipette - Simulated Pipette
// =============================================================================

#[derive(Debug, Default)]
struct PipetteState {
    has_tip: bool,
    liquid: f64,
    air: f64,
    location: Option<Location>,
    flow_rate: FlowRate,
    commands: Vec<PipetteCommand>,
    liquid_dispenses: Vec<(f64, Option<Location>)>,
}

/// Mock pipette enforcing physical limits
///
/// Simulates a single pipette with:
/// - Tip presence (aspirating without a tip fails)
/// - Liquid and air held in the tip, bounded by the maximum volume
/// - Air leaving the tip first when dispensing
/// - A log of every command received
///
/// # Example
///
/// ```rust,ignore
/// let pipette = MockPipette::new("p20", 20.0);
/// pipette.pick_up_tip().await?;
/// pipette.aspirate(15.0).await?;
/// pipette.air_gap(2.0).await?;
/// assert_eq!(pipette.current_volume().await, 17.0);
/// ```
#[derive(Debug)]
pub struct MockPipette {
    name: String,
    max_volume: f64,
    state: Arc<RwLock<PipetteState>>,
}

impl MockPipette {
    /// Create a mock pipette without a tip
    pub fn new(name: &str, max_volume: f64) -> Self {
        Self {
            name: name.to_string(),
            max_volume,
            state: Arc::new(RwLock::new(PipetteState::default())),
        }
    }

    /// Capacity in ul
    pub fn max_volume(&self) -> f64 {
        self.max_volume
    }

    /// Every command received so far
    pub async fn commands(&self) -> Vec<PipetteCommand> {
        self.state.read().await.commands.clone()
    }

    /// Volumes of all aspirations, in order
    pub async fn aspirations(&self) -> Vec<f64> {
        self.state
            .read()
            .await
            .commands
            .iter()
            .filter_map(|c| match c {
                PipetteCommand::Aspirate(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    /// Sum of all aspirated volumes
    pub async fn aspirated_total(&self) -> f64 {
        self.aspirations().await.iter().sum()
    }

    /// Liquid part of every dispense, air gaps excluded
    pub async fn liquid_dispenses(&self) -> Vec<f64> {
        self.state
            .read()
            .await
            .liquid_dispenses
            .iter()
            .map(|(v, _)| *v)
            .collect()
    }

    /// Sum of all liquid dispensed, air gaps excluded
    pub async fn dispensed_liquid_total(&self) -> f64 {
        self.liquid_dispenses().await.iter().sum()
    }

    /// Where the last liquid dispense happened
    pub async fn last_dispense_location(&self) -> Option<Location> {
        self.state
            .read()
            .await
            .liquid_dispenses
            .last()
            .and_then(|(_, location)| location.clone())
    }

    /// Liquid plus air currently in the tip
    pub async fn current_volume(&self) -> f64 {
        let state = self.state.read().await;
        state.liquid + state.air
    }

    /// Flow rate last applied
    pub async fn flow_rate(&self) -> FlowRate {
        self.state.read().await.flow_rate
    }

    /// Forget recorded commands and dispenses
    pub async fn clear_commands(&self) {
        let mut state = self.state.write().await;
        state.commands.clear();
        state.liquid_dispenses.clear();
    }

    fn check_capacity(&self, state: &PipetteState, volume: f64) -> Result<()> {
        if !state.has_tip {
            bail!("MockPipette {}: no tip attached", self.name);
        }
        if state.liquid + state.air + volume > self.max_volume + VOLUME_EPSILON {
            bail!(
                "MockPipette {}: {:.2}ul exceeds capacity ({:.2}ul liquid, {:.2}ul air held)",
                self.name,
                volume,
                state.liquid,
                state.air
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Pipette for MockPipette {
    fn name(&self) -> &str {
        &self.name
    }

    async fn has_tip(&self) -> Result<bool> {
        Ok(self.state.read().await.has_tip)
    }

    async fn pick_up_tip(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.has_tip {
            bail!("MockPipette {}: tip already attached", self.name);
        }
        state.has_tip = true;
        state.commands.push(PipetteCommand::PickUpTip);
        debug!("MockPipette {}: picked up tip", self.name);
        Ok(())
    }

    async fn drop_tip(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.has_tip {
            bail!("MockPipette {}: no tip to drop", self.name);
        }
        state.has_tip = false;
        state.liquid = 0.0;
        state.air = 0.0;
        state.commands.push(PipetteCommand::DropTip);
        debug!("MockPipette {}: dropped tip", self.name);
        Ok(())
    }

    async fn move_to(&self, location: &Location, speed: Option<f64>) -> Result<()> {
        let mut state = self.state.write().await;
        state.location = Some(location.clone());
        state.commands.push(PipetteCommand::MoveTo {
            location: location.clone(),
            speed,
        });
        Ok(())
    }

    async fn aspirate(&self, volume: f64) -> Result<()> {
        let mut state = self.state.write().await;
        self.check_capacity(&state, volume)?;
        state.liquid += volume;
        state.commands.push(PipetteCommand::Aspirate(volume));
        debug!("MockPipette {}: aspirated {:.2}ul", self.name, volume);
        Ok(())
    }

    async fn dispense(&self, volume: f64) -> Result<()> {
        let mut state = self.state.write().await;
        if volume > state.liquid + state.air + VOLUME_EPSILON {
            bail!(
                "MockPipette {}: cannot dispense {:.2}ul, {:.2}ul held",
                self.name,
                volume,
                state.liquid + state.air
            );
        }
        let air_out = state.air.min(volume);
        let liquid_out = volume - air_out;
        state.air -= air_out;
        state.liquid = (state.liquid - liquid_out).max(0.0);
        if liquid_out > VOLUME_EPSILON {
            let location = state.location.clone();
            state.liquid_dispenses.push((liquid_out, location));
        }
        state.commands.push(PipetteCommand::Dispense(volume));
        debug!("MockPipette {}: dispensed {:.2}ul", self.name, volume);
        Ok(())
    }

    async fn air_gap(&self, volume: f64) -> Result<()> {
        let mut state = self.state.write().await;
        self.check_capacity(&state, volume)?;
        state.air += volume;
        state.commands.push(PipetteCommand::AirGap(volume));
        Ok(())
    }

    async fn set_flow_rate(&self, flow_rate: FlowRate) -> Result<()> {
        let mut state = self.state.write().await;
        state.flow_rate = flow_rate;
        state.commands.push(PipetteCommand::SetFlowRate(flow_rate));
        Ok(())
    }
}

// =============================================================================
// MockPlateHandler - Simulated Plate Handling Service
// =============================================================================

/// One request made to the plate handler
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlateRequest {
    /// Take `plate` away from `slot`
    Pick {
        /// Deck slot
        slot: String,
        /// Plate name
        plate: String,
    },
    /// Put `plate` into `slot`
    Drop {
        /// Deck slot
        slot: String,
        /// Plate name
        plate: String,
    },
}

/// Plate handling service that completes every request immediately
#[derive(Debug, Default)]
pub struct MockPlateHandler {
    requests: Arc<RwLock<Vec<PlateRequest>>>,
}

impl MockPlateHandler {
    /// Create a handler with no recorded request
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick and drop requests received, in order
    pub async fn requests(&self) -> Vec<PlateRequest> {
        self.requests.read().await.clone()
    }
}

#[async_trait]
impl PlateHandler for MockPlateHandler {
    async fn pick_plate(&self, slot: &str, plate_name: &str) -> Result<()> {
        debug!("MockPlateHandler: pick {} from {}", plate_name, slot);
        self.requests.write().await.push(PlateRequest::Pick {
            slot: slot.to_string(),
            plate: plate_name.to_string(),
        });
        Ok(())
    }

    async fn drop_plate(&self, slot: &str, plate_name: &str) -> Result<()> {
        debug!("MockPlateHandler: drop {} in {}", plate_name, slot);
        self.requests.write().await.push(PlateRequest::Drop {
            slot: slot.to_string(),
            plate: plate_name.to_string(),
        });
        Ok(())
    }
}

// =============================================================================
// MockOperator - Simulated Operator
// =============================================================================

/// Operator resuming every pause at once
#[derive(Debug, Default)]
pub struct MockOperator {
    messages: Arc<RwLock<Vec<String>>>,
}

impl MockOperator {
    /// Create an operator with no recorded message
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause messages shown so far
    pub async fn messages(&self) -> Vec<String> {
        self.messages.read().await.clone()
    }
}

#[async_trait]
impl Operator for MockOperator {
    async fn pause(&self, message: &str) -> Result<()> {
        debug!("MockOperator: {}", message);
        self.messages.write().await.push(message.to_string());
        Ok(())
    }
}

// =============================================================================
// MockHeaterShaker / MockThermalCycler - Simulated Modules
// =============================================================================

/// Heater-shaker remembering its last settings
#[derive(Debug, Default)]
pub struct MockHeaterShaker {
    speed: Arc<RwLock<Option<f64>>>,
    temperature: Arc<RwLock<Option<f64>>>,
}

impl MockHeaterShaker {
    /// Create an idle heater-shaker
    pub fn new() -> Self {
        Self::default()
    }

    /// Current shaking speed, `None` when idle
    pub async fn speed(&self) -> Option<f64> {
        *self.speed.read().await
    }

    /// Target temperature, if one was set
    pub async fn temperature(&self) -> Option<f64> {
        *self.temperature.read().await
    }
}

#[async_trait]
impl HeaterShaker for MockHeaterShaker {
    async fn set_temperature(&self, celsius: f64) -> Result<()> {
        *self.temperature.write().await = Some(celsius);
        Ok(())
    }

    async fn start_shaking(&self, rpm: f64) -> Result<()> {
        if rpm <= 0.0 {
            bail!("MockHeaterShaker: invalid speed {}", rpm);
        }
        *self.speed.write().await = Some(rpm);
        Ok(())
    }

    async fn stop_shaking(&self) -> Result<()> {
        *self.speed.write().await = None;
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        *self.speed.write().await = None;
        *self.temperature.write().await = None;
        Ok(())
    }
}

/// Thermal cycler recording the programs it ran
#[derive(Debug, Default)]
pub struct MockThermalCycler {
    lid_open: Arc<RwLock<bool>>,
    programs: Arc<RwLock<Vec<String>>>,
}

impl MockThermalCycler {
    /// Create a cycler with the lid closed
    pub fn new() -> Self {
        Self::default()
    }

    /// Programs run so far, in order
    pub async fn programs(&self) -> Vec<String> {
        self.programs.read().await.clone()
    }

    /// Whether the lid is open
    pub async fn is_lid_open(&self) -> bool {
        *self.lid_open.read().await
    }
}

#[async_trait]
impl ThermalCycler for MockThermalCycler {
    async fn open_lid(&self) -> Result<()> {
        *self.lid_open.write().await = true;
        Ok(())
    }

    async fn close_lid(&self) -> Result<()> {
        *self.lid_open.write().await = false;
        Ok(())
    }

    async fn run_program(&self, program: &str) -> Result<()> {
        if *self.lid_open.read().await {
            bail!("MockThermalCycler: lid open while running {}", program);
        }
        self.programs.write().await.push(program.to_string());
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
