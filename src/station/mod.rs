//! One robot of the two-robot workflow.
//!
//! A [`Station`] owns everything a robot script needs: the recipe book, the
//! pipette chooser, the reagent plate allocation, the transfer engine, the
//! plate trackers and the stage control. Hardware it does not drive itself
//! (plate handler, operator, tips, optional modules) is injected at
//! construction through [`StationHardware`].
//!
//! Every operation is stage aware. Inside a skipped stage hardware is left
//! alone, but volume ledgers and plate trackers are updated as if the stage
//! had run, so a resumed run continues from a consistent state.
//!
//! The protocol itself lives in [`phases`]: the reagent robot and the
//! library robot each implement [`ProtocolPhases`] on top of a station.

pub mod phases;
pub mod stages;

pub use phases::{LibraryWorkflow, ProtocolPhases, ReagentWorkflow};
pub use stages::{StageControl, StageRecord};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{ConfigError, Settings, StationConfig};
use crate::error::{AppResult, PipettingError};
use crate::hardware::{Operator, PlateHandler};
use crate::labware::layout::samples_per_row;
use crate::labware::{Labware, Well, WellWithVolume, CHANNELS};
use crate::modules::{HeaterShaker, HeaterShakerStrategy, ShakeTimer, ThermalCycler, ThermalCyclerStrategy};
use crate::pipette::{Pipette, PipetteChooser, PipetteHandle};
use crate::plate_tracker::{PlateLocation, PlateTracker};
use crate::reagent_plate::ReagentPlateHelper;
use crate::recipe::{Recipe, RecipeBook};
use crate::transfer::{
    OntoBeads, TipHandler, TransferDestination, TransferManager, TransferOptions, TransferSetup,
    TransferSource,
};

/// Name of the plate shuttled between the two robots.
pub const REAGENT_PLATE: &str = "REAGENT_PLATE";

/// Flow rate stage used when a recipe has no entry of its own.
pub const DEFAULT_FLOW_RATE: &str = "default";

/// Collaborators injected into a station.
#[derive(Clone)]
pub struct StationHardware {
    /// Plate handling service
    pub robot: Arc<dyn PlateHandler>,
    /// Person running the protocol
    pub operator: Arc<dyn Operator>,
    /// Tip pick-up and drop policy
    pub tips: Arc<dyn TipHandler>,
    /// Heater-shaker driver, when mounted
    pub heater_shaker: Option<Arc<dyn HeaterShaker>>,
    /// Thermal cycler driver, when mounted
    pub thermal_cycler: Option<Arc<dyn ThermalCycler>>,
}

/// Options for [`Station::distribute`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DistributeOptions {
    /// Fresh tip for every destination
    pub change_tip: bool,
    /// Mix each destination `(times, volume)` after dispensing
    pub mix: Option<(u32, f64)>,
    /// Dispense on the beads side of each destination
    pub onto_beads: Option<OntoBeads>,
    /// Liquid kept in the tip after each dispense, in ul
    pub disposal_volume: f64,
}

/// A robot of the workflow with its ledgers and collaborators.
pub struct Station {
    settings: Settings,
    recipes: RecipeBook,
    chooser: PipetteChooser<PipetteHandle>,
    reagent_plate: ReagentPlateHelper,
    reagent_plate_labware: Labware,
    transfer: TransferManager,
    plates: HashMap<String, PlateTracker>,
    stages: StageControl,
    robot: Arc<dyn PlateHandler>,
    operator: Arc<dyn Operator>,
    heater_shaker: HeaterShakerStrategy,
    thermal_cycler: ThermalCyclerStrategy,
    shake_timer: ShakeTimer,
    reagent_tubes: HashMap<String, WellWithVolume>,
    prepared_tubes: HashMap<String, WellWithVolume>,
}

impl Station {
    /// Build a station from validated settings.
    ///
    /// A module enabled in `settings.capabilities` must be provided in
    /// `hardware`; a disabled one falls back to the manual strategy.
    pub fn new(
        settings: Settings,
        recipes: RecipeBook,
        reagent_plate_labware: Labware,
        hardware: StationHardware,
    ) -> AppResult<Self> {
        let heater_shaker = match (settings.capabilities.heater_shaker, hardware.heater_shaker) {
            (true, Some(module)) => HeaterShakerStrategy::Hardware(module),
            (true, None) => {
                return Err(ConfigError::Validation(
                    "heater_shaker capability enabled but no module provided".to_string(),
                )
                .into())
            }
            (false, _) => HeaterShakerStrategy::Manual,
        };
        let thermal_cycler = match (settings.capabilities.thermal_cycler, hardware.thermal_cycler) {
            (true, Some(module)) => ThermalCyclerStrategy::Hardware(module),
            (true, None) => {
                return Err(ConfigError::Validation(
                    "thermal_cycler capability enabled but no module provided".to_string(),
                )
                .into())
            }
            (false, _) => ThermalCyclerStrategy::Manual,
        };

        let station_config = &settings.station;
        let reagent_plate = ReagentPlateHelper::new(
            samples_per_row(station_config.num_samples),
            station_config.reagent_plate,
        )?;
        info!(
            "Station {} for {} samples: heater-shaker {:?}, thermal cycler {:?}",
            station_config.robot_name, station_config.num_samples, heater_shaker, thermal_cycler
        );

        let plates = HashMap::from([(REAGENT_PLATE.to_string(), PlateTracker::new(REAGENT_PLATE))]);

        Ok(Self {
            chooser: PipetteChooser::new(station_config.unstick_after()),
            stages: StageControl::new(station_config.start_at.clone()),
            shake_timer: ShakeTimer::new(&format!("{} shaker", station_config.robot_name)),
            reagent_plate,
            reagent_plate_labware,
            transfer: TransferManager::new(hardware.tips),
            plates,
            robot: hardware.robot,
            operator: hardware.operator,
            heater_shaker,
            thermal_cycler,
            reagent_tubes: HashMap::new(),
            prepared_tubes: HashMap::new(),
            recipes,
            settings,
        })
    }

    /// Build a station from settings, loading their recipes relative to `base_dir`.
    pub fn from_settings(
        settings: Settings,
        base_dir: &Path,
        reagent_plate_labware: Labware,
        hardware: StationHardware,
    ) -> AppResult<Self> {
        let recipes = settings.recipe_book(base_dir)?;
        Self::new(settings, recipes, reagent_plate_labware, hardware)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Settings the station was built from
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn config(&self) -> &StationConfig {
        &self.settings.station
    }

    /// Samples processed in this run
    pub fn num_samples(&self) -> usize {
        self.settings.station.num_samples
    }

    /// Registered recipes
    pub fn recipes(&self) -> &RecipeBook {
        &self.recipes
    }

    /// Register an extra recipe.
    pub fn add_recipe(&mut self, recipe: Recipe) -> AppResult<()> {
        self.recipes.add_recipe(recipe)
    }

    /// Recipe named `name`.
    pub fn get_recipe(&self, name: &str) -> AppResult<&Recipe> {
        self.recipes.get_recipe(name)
    }

    /// Mutable access to the recipe named `name`.
    pub fn get_recipe_mut(&mut self, name: &str) -> AppResult<&mut Recipe> {
        self.recipes.get_recipe_mut(name)
    }

    /// Registered pipettes
    pub fn chooser(&self) -> &PipetteChooser<PipetteHandle> {
        &self.chooser
    }

    /// Reagent plate allocation
    pub fn reagent_plate(&self) -> &ReagentPlateHelper {
        &self.reagent_plate
    }

    /// Labware the reagent plate allocation is bound to
    pub fn reagent_plate_labware(&self) -> &Labware {
        &self.reagent_plate_labware
    }

    /// Transfer engine and its ledgers
    pub fn transfer_manager(&self) -> &TransferManager {
        &self.transfer
    }

    /// Stage history and resume state
    pub fn stages(&self) -> &StageControl {
        &self.stages
    }

    /// How plates are shaken
    pub fn heater_shaker(&self) -> &HeaterShakerStrategy {
        &self.heater_shaker
    }

    /// How thermal programs are run
    pub fn thermal_cycler(&self) -> &ThermalCyclerStrategy {
        &self.thermal_cycler
    }

    /// Enter a named stage; returns whether it runs.
    pub fn stage(&mut self, name: &str) -> bool {
        self.stages.stage(name)
    }

    /// Close the run.
    pub fn finish_stages(&self) {
        self.stages.finish();
    }

    // =========================================================================
    // Pipettes and tubes
    // =========================================================================

    /// Register `pipette` with the capacity configured under its name.
    pub fn register_pipette(&mut self, pipette: PipetteHandle) -> AppResult<()> {
        let config = self
            .settings
            .pipettes
            .iter()
            .find(|p| p.name == pipette.name())
            .ok_or_else(|| PipettingError::InstrumentNotRegistered(pipette.name().to_string()))?;
        self.chooser.register(pipette, config.max_volume, config.air_gap);
        Ok(())
    }

    /// Source tube holding `reagent`.
    pub fn load_reagent_tube(&mut self, reagent: &str, tube: WellWithVolume) {
        info!("Reagent {} loaded in {} with {}ul", reagent, tube.well(), tube.volume());
        self.reagent_tubes.insert(reagent.to_string(), tube);
    }

    /// Empty tube where the multi-step recipe `recipe` is mixed.
    pub fn load_empty_tube(&mut self, recipe: &str, well: Well) {
        info!("Empty tube for recipe {} at {}", recipe, well);
        self.prepared_tubes
            .insert(recipe.to_string(), WellWithVolume::new(well, 0.0));
    }

    /// Source tube of `reagent`.
    pub fn reagent_tube(&self, reagent: &str) -> AppResult<&WellWithVolume> {
        self.reagent_tubes
            .get(reagent)
            .ok_or_else(|| PipettingError::ReagentTubeNotLoaded(reagent.to_string()))
    }

    /// Tube where recipe `recipe` is prepared.
    pub fn prepared_tube(&self, recipe: &str) -> AppResult<&WellWithVolume> {
        self.prepared_tubes
            .get(recipe)
            .ok_or_else(|| PipettingError::ReagentTubeNotLoaded(recipe.to_string()))
    }

    // =========================================================================
    // Plates, operator and modules
    // =========================================================================

    fn tracker(&mut self, plate_name: &str) -> &mut PlateTracker {
        self.plates
            .entry(plate_name.to_string())
            .or_insert_with(|| PlateTracker::new(plate_name))
    }

    /// Where `plate_name` is; unloaded when never seen.
    pub fn plate_location(&self, plate_name: &str) -> PlateLocation {
        self.plates
            .get(plate_name)
            .map(|t| t.location().clone())
            .unwrap_or_default()
    }

    /// Slot holding `plate_name`.
    pub fn plate_slot(&self, plate_name: &str) -> AppResult<&str> {
        self.plates
            .get(plate_name)
            .ok_or_else(|| PipettingError::PlateNotLoaded(plate_name.to_string()))?
            .slot()
    }

    /// Record a plate placed by hand, without the plate handler.
    pub fn set_plate_loaded(&mut self, plate_name: &str, slot: &str) {
        self.tracker(plate_name).set_slot(slot);
    }

    /// Have the plate handler take `plate_name` away from `slot`.
    pub async fn robot_pick_plate(&mut self, slot: &str, plate_name: &str) -> AppResult<()> {
        if self.stages.is_running() {
            info!("Requesting pick of {} from {}", plate_name, slot);
            self.robot.pick_plate(slot, plate_name).await?;
        } else {
            debug!("Skipped pick of {} from {}", plate_name, slot);
        }
        self.tracker(plate_name).clear_slot();
        Ok(())
    }

    /// Have the plate handler put `plate_name` into `slot`.
    pub async fn robot_drop_plate(&mut self, slot: &str, plate_name: &str) -> AppResult<()> {
        if self.stages.is_running() {
            info!("Requesting drop of {} in {}", plate_name, slot);
            self.robot.drop_plate(slot, plate_name).await?;
        } else {
            debug!("Skipped drop of {} in {}", plate_name, slot);
        }
        self.tracker(plate_name).set_slot(slot);
        Ok(())
    }

    /// Wait for the operator.
    pub async fn pause(&self, message: &str) -> AppResult<()> {
        if self.stages.is_running() {
            info!("Pausing: {}", message);
            self.operator.pause(message).await?;
        }
        Ok(())
    }

    /// Sleep for `duration`.
    pub async fn delay(&self, duration: Duration) -> AppResult<()> {
        if self.stages.is_running() {
            info!("Waiting {:?}", duration);
            tokio::time::sleep(duration).await;
        }
        Ok(())
    }

    /// Start shaking for `duration` without waiting for it.
    pub async fn start_shaking(&mut self, rpm: f64, duration: Duration) -> AppResult<()> {
        if !self.stages.is_running() {
            return Ok(());
        }
        self.heater_shaker
            .start_shaking(rpm, self.operator.as_ref())
            .await?;
        self.shake_timer.start(duration);
        Ok(())
    }

    /// Wait for the remaining shaking time, then stop the shaker.
    pub async fn wait_for_shaking(&mut self) -> AppResult<()> {
        if !self.stages.is_running() {
            return Ok(());
        }
        self.shake_timer.wait_for_finish().await?;
        self.heater_shaker.stop_shaking().await
    }

    /// Run thermal program `program` on the sample plate.
    pub async fn thermal_cycle(&self, program: &str) -> AppResult<()> {
        if !self.stages.is_running() {
            return Ok(());
        }
        self.thermal_cycler.run(program, self.operator.as_ref()).await
    }

    // =========================================================================
    // Reagents
    // =========================================================================

    /// Reagent plate volumes per sample: dispensed, and drawable back.
    fn plate_volumes_per_sample(&self, recipe: &Recipe) -> AppResult<(f64, f64)> {
        let available = recipe.volume_to_distribute()? * f64::from(recipe.number_of_times_needed());
        Ok((available + self.config().reagent_dead_volume_per_sample, available))
    }

    /// Allocate reagent plate columns to every recipe that uses the plate.
    pub fn assign_reagent_plate(&mut self) -> AppResult<Vec<String>> {
        let mut assigned = Vec::new();
        let recipes: Vec<Recipe> = self
            .recipes
            .iter()
            .filter(|r| r.use_reagent_plate())
            .cloned()
            .collect();
        for recipe in recipes {
            let (with_overhead, available) = self.plate_volumes_per_sample(&recipe)?;
            self.reagent_plate
                .assign_reagent(recipe.name(), with_overhead, Some(available), None)?;
            assigned.push(recipe.name().to_string());
        }
        info!("Reagent plate assigned: {:?}", assigned);
        Ok(assigned)
    }

    /// Total volume of `recipe` needed by the run.
    fn volume_needed(&self, recipe: &Recipe) -> AppResult<f64> {
        match self.reagent_plate.get_assignment(recipe.name()) {
            Ok(assignment) => Ok(assignment.total_volume()),
            Err(_) => {
                let (with_overhead, _) = self.plate_volumes_per_sample(recipe)?;
                Ok(with_overhead * self.num_samples() as f64)
            }
        }
    }

    async fn apply_flow_rate(&self, stage: &str, pipette: &PipetteHandle) -> AppResult<()> {
        let rate = self
            .settings
            .flow_rate(stage)
            .or_else(|_| self.settings.flow_rate(DEFAULT_FLOW_RATE));
        if let Ok(rate) = rate {
            pipette.set_flow_rate(rate).await?;
        }
        Ok(())
    }

    fn setup_for(&self, pipette: &PipetteHandle) -> AppResult<TransferSetup> {
        Ok(TransferSetup::new(
            pipette.clone(),
            self.chooser.get_max_volume(pipette, false)?,
            self.chooser.get_air_gap(pipette)?,
            self.config().vertical_speed,
        )
        .with_horizontal_speed(self.config().horizontal_speed))
    }

    /// Mix the steps of a multi-step recipe into its empty tube.
    ///
    /// Single-step recipes are used straight from their reagent tube and
    /// need no preparation.
    pub async fn prepare_recipe(&mut self, name: &str) -> AppResult<()> {
        let recipe = self.recipes.get_recipe(name)?.clone();
        if !recipe.needs_empty_tube() {
            debug!("Recipe {} has a single step, nothing to prepare", name);
            return Ok(());
        }
        if !self.prepared_tubes.contains_key(name) {
            return Err(PipettingError::ReagentTubeNotLoaded(name.to_string()));
        }
        let total = self.volume_needed(&recipe)?;
        let run = self.stages.stage(&format!("Prepare {}", name));
        info!("Preparing {}ul of {}", total, recipe);

        for step in recipe.steps() {
            let volume = total * step.vol / recipe.total_prepared_volume();
            let pipette = self.chooser.get_pipette(volume, true)?;
            let setup = self.setup_for(&pipette)?.with_total_volume(volume);
            self.transfer.setup_transfer(setup);
            if run {
                self.apply_flow_rate(&step.reagent, &pipette).await?;
            }

            let source = self
                .reagent_tubes
                .get_mut(&step.reagent)
                .ok_or_else(|| PipettingError::ReagentTubeNotLoaded(step.reagent.clone()))?;
            let tube = self
                .prepared_tubes
                .get_mut(name)
                .ok_or_else(|| PipettingError::ReagentTubeNotLoaded(name.to_string()))?;
            let options = TransferOptions {
                change_tip: true,
                drop_tip_after: true,
                ..Default::default()
            };
            transfer_or_account(
                &mut self.transfer,
                run,
                TransferSource::Tracked(source),
                TransferDestination::Tracked(tube),
                volume,
                options,
            )
            .await?;
        }

        if run {
            let pipette = self.chooser.get_pipette(total, false)?;
            let setup = self.setup_for(&pipette)?;
            self.transfer.setup_transfer(setup);
            self.transfer
                .setup_mix(self.config().prepare_mix_times, total / 2.0);
            let tube = self
                .prepared_tubes
                .get_mut(name)
                .ok_or_else(|| PipettingError::ReagentTubeNotLoaded(name.to_string()))?;
            self.transfer
                .mix(TransferDestination::Tracked(tube), true)
                .await?;
        }
        Ok(())
    }

    /// Dispense `name` into every reagent plate well assigned to it.
    pub async fn fill_reagent_plate(&mut self, name: &str) -> AppResult<()> {
        let recipe = self.recipes.get_recipe(name)?.clone();
        let wells = self
            .reagent_plate
            .get_wells_with_volume(name, &self.reagent_plate_labware)?;
        let total: f64 = wells.iter().map(|(_, v)| v).sum();
        let largest = wells.iter().map(|(_, v)| *v).fold(0.0, f64::max);

        let pipette = self.chooser.get_pipette(largest, true)?;
        let setup = self.setup_for(&pipette)?.with_total_volume(total);
        self.transfer.setup_transfer(setup);
        let run = self.stages.stage(&format!("Fill {}", name));
        if run {
            self.apply_flow_rate(name, &pipette).await?;
        }
        info!("Filling {} wells with {} ({}ul)", wells.len(), name, total);

        let tube = if recipe.needs_empty_tube() {
            self.prepared_tubes.get_mut(name)
        } else {
            match recipe.steps().first() {
                Some(step) => self.reagent_tubes.get_mut(&step.reagent),
                None => None,
            }
        };
        let source = tube.ok_or_else(|| PipettingError::ReagentTubeNotLoaded(name.to_string()))?;

        let count = wells.len();
        for (i, (well, volume)) in wells.iter().enumerate() {
            let options = TransferOptions {
                drop_tip_after: i + 1 == count,
                ..Default::default()
            };
            transfer_or_account(
                &mut self.transfer,
                run,
                TransferSource::Tracked(&mut *source),
                TransferDestination::Well(well),
                *volume,
                options,
            )
            .await?;
        }
        Ok(())
    }

    /// Distribute the final volume of `name` from the reagent plate to
    /// every destination, one resumable stage per destination.
    ///
    /// Destinations are first-row wells: the multi-channel pipette serves
    /// the whole column at once.
    pub async fn distribute(
        &mut self,
        name: &str,
        destinations: &[Well],
        options: DistributeOptions,
    ) -> AppResult<()> {
        let recipe = self.recipes.get_recipe(name)?;
        let volume = recipe.volume_final()?;
        let pipette = self.chooser.get_pipette(volume, true)?;
        let tips_per_row = if self.reagent_plate.get_rows_count() == 1 {
            CHANNELS
        } else {
            1
        };
        // a fresh tip per destination only ever carries that destination's volume
        let batch_total = if options.change_tip {
            volume
        } else {
            volume * destinations.len() as f64
        };
        let setup = self
            .setup_for(&pipette)?
            .with_total_volume(batch_total)
            .with_source_tips_per_row(tips_per_row);

        let source = self
            .reagent_plate
            .get_mts_8_channel_for_labware(name, &self.reagent_plate_labware)?;
        info!(
            "Distributing {}ul of {} to {} destinations from {:?}",
            volume,
            name,
            destinations.len(),
            source.locations_and_volumes()
        );

        let count = destinations.len();
        for (i, destination) in destinations.iter().enumerate() {
            if i == 0 || options.change_tip {
                self.transfer.setup_transfer(setup.clone());
                if let Some((times, mix_volume)) = options.mix {
                    self.transfer.setup_mix(times, mix_volume);
                }
                if let Some(onto_beads) = options.onto_beads {
                    self.transfer.setup_onto_beads(onto_beads);
                }
            }
            let run = self.stages.stage(&format!("{} {}/{}", name, i + 1, count));
            if run {
                let rate = self
                    .settings
                    .flow_rate(name)
                    .or_else(|_| self.settings.flow_rate(DEFAULT_FLOW_RATE));
                if let Ok(rate) = rate {
                    pipette.set_flow_rate(rate).await?;
                }
            }
            let transfer_options = TransferOptions {
                disposal_volume: options.disposal_volume,
                change_tip: options.change_tip,
                drop_tip_after: options.change_tip || i + 1 == count,
            };
            transfer_or_account(
                &mut self.transfer,
                run,
                TransferSource::MultiTube(&mut *source),
                TransferDestination::Well(destination),
                volume,
                transfer_options,
            )
            .await?;
        }
        Ok(())
    }
}

/// Run a transfer, or replay only its bookkeeping when its stage is skipped.
async fn transfer_or_account(
    manager: &mut TransferManager,
    run: bool,
    source: TransferSource<'_>,
    destination: TransferDestination<'_>,
    volume: f64,
    options: TransferOptions,
) -> AppResult<()> {
    if run {
        manager.transfer(source, destination, volume, options).await
    } else {
        manager.account_skipped_transfer(source, destination, volume, options)
    }
}
