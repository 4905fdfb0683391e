//! The protocol, phase by phase.
//!
//! Both robots walk through the same six phases. The reagent robot prepares
//! the recipes of a phase and fills them into the reagent plate, then hands
//! the plate over. The library robot receives the plate, distributes each
//! recipe onto the samples, hands the plate back and runs the incubation or
//! thermal program closing the phase. Which recipes belong to which phase
//! comes from the `[phases]` table of the configuration.

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use super::{DistributeOptions, Station, REAGENT_PLATE};
use crate::error::AppResult;
use crate::labware::layout::first_row_wells;
use crate::labware::{Labware, Well};

/// Thermal program closing the RNA annealing phase.
pub const ANNEAL_PROGRAM: &str = "ANNEAL";
/// Thermal program for first strand synthesis
pub const FIRST_STRAND_PROGRAM: &str = "FSS";
/// Thermal program for cDNA amplification
pub const CDNA_PCR_PROGRAM: &str = "COV PCR";
/// Thermal program for tagmentation
pub const TAGMENTATION_PROGRAM: &str = "TAG";
/// Thermal program stopping tagmentation
pub const POST_TAGMENTATION_PROGRAM: &str = "PTC";
/// Thermal program for amplification of tagmented amplicons
pub const TAGMENTED_PCR_PROGRAM: &str = "TAG PCR";

/// Shaking applied after adding the tagmentation mix.
pub const TAGMENTATION_SHAKE_RPM: f64 = 1600.0;
/// Shaking time after adding the tagmentation mix
pub const TAGMENTATION_SHAKE_TIME: Duration = Duration::from_secs(60);

/// One method per protocol phase; the orchestrator only knows this trait.
#[async_trait]
pub trait ProtocolPhases: Send {
    /// Anneal the RNA.
    async fn anneal_rna(&mut self) -> AppResult<()>;
    /// Synthesize first strand cDNA.
    async fn first_strand_cdna(&mut self) -> AppResult<()>;
    /// Amplify the cDNA.
    async fn amplify_cdna(&mut self) -> AppResult<()>;
    /// Tagment the PCR amplicons.
    async fn tagment_pcr_amplicons(&mut self) -> AppResult<()>;
    /// Clean up after tagmentation.
    async fn post_tagmentation_cleanup(&mut self) -> AppResult<()>;
    /// Amplify the tagmented amplicons.
    async fn amplify_tagmented_amplicons(&mut self) -> AppResult<()>;

    /// Called once after the last phase.
    fn finish(&mut self) {}

    /// Run every phase in protocol order.
    async fn run_protocol(&mut self) -> AppResult<()> {
        self.anneal_rna().await?;
        self.first_strand_cdna().await?;
        self.amplify_cdna().await?;
        self.tagment_pcr_amplicons().await?;
        self.post_tagmentation_cleanup().await?;
        self.amplify_tagmented_amplicons().await?;
        self.finish();
        Ok(())
    }
}

// =============================================================================
// Reagent robot
// =============================================================================

/// Prepares recipes and fills the reagent plate.
pub struct ReagentWorkflow {
    station: Station,
}

impl ReagentWorkflow {
    /// The reagent plate starts on this robot, placed by the operator.
    pub fn new(mut station: Station) -> Self {
        let slot = station.settings().station.reagent_plate_slot.clone();
        station.set_plate_loaded(REAGENT_PLATE, &slot);
        Self { station }
    }

    /// Station driven by the workflow
    pub fn station(&self) -> &Station {
        &self.station
    }

    /// Mutable access to the station
    pub fn station_mut(&mut self) -> &mut Station {
        &mut self.station
    }

    /// Give the station back
    pub fn into_station(self) -> Station {
        self.station
    }

    async fn prepare_phase(&mut self, phase: &str, recipes: Vec<String>) -> AppResult<()> {
        if recipes.is_empty() {
            return Ok(());
        }
        info!("Reagent robot: {} ({:?})", phase, recipes);
        let slot = self.station.settings().station.reagent_plate_slot.clone();
        if self.station.plate_slot(REAGENT_PLATE).is_err() {
            self.station.robot_drop_plate(&slot, REAGENT_PLATE).await?;
        }
        for name in &recipes {
            self.station.prepare_recipe(name).await?;
            if self.station.get_recipe(name)?.use_reagent_plate() {
                self.station.fill_reagent_plate(name).await?;
            }
        }
        self.station.robot_pick_plate(&slot, REAGENT_PLATE).await
    }
}

#[async_trait]
impl ProtocolPhases for ReagentWorkflow {
    async fn anneal_rna(&mut self) -> AppResult<()> {
        let recipes = self.station.settings().phases.anneal_rna.clone();
        self.prepare_phase("anneal RNA", recipes).await
    }

    async fn first_strand_cdna(&mut self) -> AppResult<()> {
        let recipes = self.station.settings().phases.first_strand_cdna.clone();
        self.prepare_phase("first strand cDNA", recipes).await
    }

    async fn amplify_cdna(&mut self) -> AppResult<()> {
        let recipes = self.station.settings().phases.amplify_cdna.clone();
        self.prepare_phase("amplify cDNA", recipes).await
    }

    async fn tagment_pcr_amplicons(&mut self) -> AppResult<()> {
        let recipes = self.station.settings().phases.tagment_pcr_amplicons.clone();
        self.prepare_phase("tagment PCR amplicons", recipes).await
    }

    async fn post_tagmentation_cleanup(&mut self) -> AppResult<()> {
        let recipes = self.station.settings().phases.post_tagmentation_cleanup.clone();
        self.prepare_phase("post tagmentation cleanup", recipes).await
    }

    async fn amplify_tagmented_amplicons(&mut self) -> AppResult<()> {
        let recipes = self.station.settings().phases.amplify_tagmented_amplicons.clone();
        self.prepare_phase("amplify tagmented amplicons", recipes).await
    }

    fn finish(&mut self) {
        self.station.finish_stages();
    }
}

// =============================================================================
// Library robot
// =============================================================================

/// Distributes recipes from the reagent plate onto the samples.
pub struct LibraryWorkflow {
    station: Station,
    sample_plate: Labware,
}

impl LibraryWorkflow {
    /// Workflow distributing into the first-row wells of `sample_plate`
    pub fn new(station: Station, sample_plate: Labware) -> Self {
        Self {
            station,
            sample_plate,
        }
    }

    /// Station driven by the workflow
    pub fn station(&self) -> &Station {
        &self.station
    }

    /// Mutable access to the station
    pub fn station_mut(&mut self) -> &mut Station {
        &mut self.station
    }

    /// Give the station back
    pub fn into_station(self) -> Station {
        self.station
    }

    /// First-row wells of the sample columns.
    pub fn destinations(&self) -> Vec<Well> {
        first_row_wells(&self.sample_plate, self.station.num_samples(), 0)
    }

    async fn distribute_phase(&mut self, phase: &str, recipes: Vec<String>) -> AppResult<()> {
        if recipes.is_empty() {
            return Ok(());
        }
        info!("Library robot: {} ({:?})", phase, recipes);
        let slot = self.station.settings().station.reagent_plate_slot.clone();
        self.station.robot_drop_plate(&slot, REAGENT_PLATE).await?;
        let destinations = self.destinations();
        let options = DistributeOptions {
            change_tip: true,
            ..Default::default()
        };
        for name in &recipes {
            if self.station.get_recipe(name)?.use_reagent_plate() {
                self.station.distribute(name, &destinations, options).await?;
            }
        }
        self.station.robot_pick_plate(&slot, REAGENT_PLATE).await
    }
}

#[async_trait]
impl ProtocolPhases for LibraryWorkflow {
    async fn anneal_rna(&mut self) -> AppResult<()> {
        let recipes = self.station.settings().phases.anneal_rna.clone();
        self.distribute_phase("anneal RNA", recipes).await?;
        self.station.thermal_cycle(ANNEAL_PROGRAM).await
    }

    async fn first_strand_cdna(&mut self) -> AppResult<()> {
        let recipes = self.station.settings().phases.first_strand_cdna.clone();
        self.distribute_phase("first strand cDNA", recipes).await?;
        self.station.thermal_cycle(FIRST_STRAND_PROGRAM).await
    }

    async fn amplify_cdna(&mut self) -> AppResult<()> {
        let recipes = self.station.settings().phases.amplify_cdna.clone();
        self.distribute_phase("amplify cDNA", recipes).await?;
        self.station.thermal_cycle(CDNA_PCR_PROGRAM).await
    }

    async fn tagment_pcr_amplicons(&mut self) -> AppResult<()> {
        let recipes = self.station.settings().phases.tagment_pcr_amplicons.clone();
        self.distribute_phase("tagment PCR amplicons", recipes).await?;
        self.station
            .start_shaking(TAGMENTATION_SHAKE_RPM, TAGMENTATION_SHAKE_TIME)
            .await?;
        self.station.wait_for_shaking().await?;
        self.station.thermal_cycle(TAGMENTATION_PROGRAM).await
    }

    async fn post_tagmentation_cleanup(&mut self) -> AppResult<()> {
        let recipes = self.station.settings().phases.post_tagmentation_cleanup.clone();
        self.distribute_phase("post tagmentation cleanup", recipes).await?;
        self.station.thermal_cycle(POST_TAGMENTATION_PROGRAM).await
    }

    async fn amplify_tagmented_amplicons(&mut self) -> AppResult<()> {
        let recipes = self.station.settings().phases.amplify_tagmented_amplicons.clone();
        self.distribute_phase("amplify tagmented amplicons", recipes).await?;
        self.station.thermal_cycle(TAGMENTED_PCR_PROGRAM).await
    }

    fn finish(&mut self) {
        self.station.finish_stages();
    }
}
