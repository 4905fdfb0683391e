//! Transfer execution engine.
//!
//! A transfer moves an arbitrary volume from one source to one destination
//! as a series of aspirate/dispense cycles bounded by the pipette capacity,
//! its air gap and the disposal volume kept in the tip.
//!
//! Every transfer is computed in two phases. Planning walks the cycle
//! arithmetic against the volume ledgers (source drawdown, destination fill,
//! liquid held in the tip) and produces a list of [`PipetteCommand`]s.
//! Execution then plays the commands on the pipette. A step skipped on a
//! resumed run only plans, which keeps the ledgers exactly where a full run
//! would have left them.
//!
//! ```rust,ignore
//! let mut manager = TransferManager::new(Arc::new(CountingTipHandler::new()));
//! manager.setup_transfer(TransferSetup::new(p300, 200.0, 20.0, 5.0).with_total_volume(160.0));
//! for dest in destinations.iter() {
//!     manager
//!         .transfer(TransferSource::MultiTube(&mut mts), TransferDestination::Well(dest), 20.0, TransferOptions::default())
//!         .await?;
//! }
//! ```

pub mod mix;
pub mod tips;

pub use mix::{get_magnets_direction, get_side_movement, mix_well, MixWell, OntoBeads};
pub use tips::{CountingTipHandler, TipCallbacks, TipHandler};

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{AppResult, PipettingError};
use crate::labware::{Location, MultiTubeSource, Point, Well, WellWithVolume};
use crate::pipette::{Pipette, PipetteCommand, PipetteHandle};

/// Volumes below this are treated as zero.
const VOLUME_EPSILON: f64 = 1e-6;

/// Aspiration height for sources without a volume ledger, in mm.
pub const UNTRACKED_ASPIRATION_HEIGHT: f64 = 0.5;

/// Height above the target from which slow vertical moves start, in mm.
pub const APPROACH_HEIGHT: f64 = 5.0;

/// Default horizontal speed, in mm/s.
pub const DEFAULT_HORIZONTAL_SPEED: f64 = 25.0;

/// Parameters shared by a batch of transfers.
#[derive(Clone, Debug)]
pub struct TransferSetup {
    /// Pipette doing the transfers
    pub pipette: PipetteHandle,
    /// Usable capacity, in ul
    pub max_volume: f64,
    /// Air gap drawn after each aspiration, in ul
    pub air_gap: f64,
    /// Speed for vertical moves close to the liquid, in mm/s
    pub vertical_speed: f64,
    /// Speed for side moves inside the well, in mm/s
    pub horizontal_speed: f64,
    /// Volume expected over the whole batch; sizes each refill
    pub total_volume_to_transfer: Option<f64>,
    /// Tips drawing from each source row at once, for ledger accounting
    pub source_tips_per_row: usize,
}

impl TransferSetup {
    /// Setup without batch total, one tip per source row.
    pub fn new(pipette: PipetteHandle, max_volume: f64, air_gap: f64, vertical_speed: f64) -> Self {
        Self {
            pipette,
            max_volume,
            air_gap,
            vertical_speed,
            horizontal_speed: DEFAULT_HORIZONTAL_SPEED,
            total_volume_to_transfer: None,
            source_tips_per_row: 1,
        }
    }

    /// Size refills for a batch of `total_volume` ul.
    pub fn with_total_volume(mut self, total_volume: f64) -> Self {
        self.total_volume_to_transfer = Some(total_volume);
        self
    }

    /// Tips drawing from each source row at once.
    pub fn with_source_tips_per_row(mut self, tips: usize) -> Self {
        self.source_tips_per_row = tips.max(1);
        self
    }

    /// Speed for side moves inside the well.
    pub fn with_horizontal_speed(mut self, speed: f64) -> Self {
        self.horizontal_speed = speed;
        self
    }
}

/// Per-destination options.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TransferOptions {
    /// Liquid kept in the tip after each dispense
    pub disposal_volume: f64,
    /// Drop any held tip and take a fresh one before starting
    pub change_tip: bool,
    /// Drop the tip once the transfer is done
    pub drop_tip_after: bool,
}

/// Where liquid is drawn from.
pub enum TransferSource<'a> {
    /// Untracked well; aspirated near the bottom
    Well(&'a Well),
    /// Well with a volume ledger; aspirated just below the surface
    Tracked(&'a mut WellWithVolume),
    /// Several wells drained in order
    MultiTube(&'a mut MultiTubeSource),
}

/// Where liquid is dispensed.
pub enum TransferDestination<'a> {
    /// Well assumed empty before this transfer
    Well(&'a Well),
    /// Well with a volume ledger; filled by every dispense
    Tracked(&'a mut WellWithVolume),
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct TipState {
    liquid: f64,
    air_gap_held: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct MixSetup {
    times: u32,
    volume: f64,
}

impl MixSetup {
    fn enabled(&self) -> bool {
        self.times > 0 && self.volume > 0.0
    }
}

/// Executes transfers for one robot.
pub struct TransferManager {
    tip_handler: Arc<dyn TipHandler>,
    setup: Option<TransferSetup>,
    remaining_batch: Option<f64>,
    mix: MixSetup,
    onto_beads: Option<OntoBeads>,
    tips: HashMap<String, TipState>,
}

impl TransferManager {
    /// Engine using `tip_handler` whenever a tip is needed.
    pub fn new(tip_handler: Arc<dyn TipHandler>) -> Self {
        Self {
            tip_handler,
            setup: None,
            remaining_batch: None,
            mix: MixSetup::default(),
            onto_beads: None,
            tips: HashMap::new(),
        }
    }

    /// Start a new batch. Clears mixing and onto-beads options.
    pub fn setup_transfer(&mut self, setup: TransferSetup) {
        info!(
            "Setting up transfers with {}: max volume {}, air gap {}, batch total {:?}",
            setup.pipette, setup.max_volume, setup.air_gap, setup.total_volume_to_transfer
        );
        self.remaining_batch = setup.total_volume_to_transfer;
        self.setup = Some(setup);
        self.clear_setup_mix();
        self.clear_onto_beads();
    }

    /// Mix every destination `times` times with `volume` ul.
    pub fn setup_mix(&mut self, times: u32, volume: f64) {
        self.mix = MixSetup { times, volume };
    }

    /// Stop mixing destinations
    pub fn clear_setup_mix(&mut self) {
        self.mix = MixSetup::default();
    }

    /// Dispense next to the beads instead of at the liquid surface
    pub fn setup_onto_beads(&mut self, onto_beads: OntoBeads) {
        self.onto_beads = Some(onto_beads);
    }

    /// Dispense at the liquid surface again
    pub fn clear_onto_beads(&mut self) {
        self.onto_beads = None;
    }

    /// Volume of the batch not transferred yet, if a total was given.
    pub fn remaining_batch_volume(&self) -> Option<f64> {
        self.remaining_batch
    }

    /// Liquid the engine believes is held by `pipette`'s tip, air excluded.
    pub fn liquid_in_tip(&self, pipette: &PipetteHandle) -> f64 {
        self.tips.get(pipette.name()).map_or(0.0, |t| t.liquid)
    }

    /// Move `volume` from `source` to `destination`.
    pub async fn transfer(
        &mut self,
        source: TransferSource<'_>,
        destination: TransferDestination<'_>,
        volume: f64,
        options: TransferOptions,
    ) -> AppResult<()> {
        let pipette = self.pipette()?;
        info!(
            "Starting transfer of {}ul using pipette {}; batch remaining {:?}",
            volume, pipette, self.remaining_batch
        );
        self.sync_tip_state(&pipette).await?;
        let steps = self.plan_transfer(source, destination, volume, options)?;
        self.execute(&pipette, &steps).await
    }

    /// Account for a transfer already done by a previous run.
    ///
    /// Runs the same cycle arithmetic as [`TransferManager::transfer`]
    /// against the source and destination ledgers and the tip ledger, without
    /// touching the hardware.
    pub fn account_skipped_transfer(
        &mut self,
        source: TransferSource<'_>,
        destination: TransferDestination<'_>,
        volume: f64,
        options: TransferOptions,
    ) -> AppResult<()> {
        info!("Skipping transfer of {}ul, updating volumes only", volume);
        self.plan_transfer(source, destination, volume, options)
            .map(|steps| debug!("Skipped {} pipette commands", steps.len()))
    }

    /// Mix `destination` with the configured mix parameters.
    pub async fn mix(&mut self, destination: TransferDestination<'_>, drop_tip: bool) -> AppResult<()> {
        let setup = self.setup.as_ref().ok_or(PipettingError::TransferNotSetup)?.clone();
        self.sync_tip_state(&setup.pipette).await?;
        let transient;
        let well: &WellWithVolume = match destination {
            TransferDestination::Well(w) => {
                transient = WellWithVolume::new(w.clone(), 0.0).with_headroom_height(0.0);
                &transient
            }
            TransferDestination::Tracked(t) => t,
        };

        let mut steps = vec![PipetteCommand::PickUpTip];
        steps.extend(mix_well(well, &self.mix_parameters(&setup)));
        let over_the_liquid = (well.well().depth() - mix::TOP_CLEARANCE).min(well.height() + APPROACH_HEIGHT);
        steps.push(PipetteCommand::MoveTo {
            location: well.well().bottom(over_the_liquid),
            speed: Some(setup.vertical_speed),
        });

        let tip = self.tips.entry(setup.pipette.name().to_string()).or_default();
        if setup.air_gap > 0.0 && !tip.air_gap_held {
            steps.push(PipetteCommand::AirGap(setup.air_gap));
            tip.air_gap_held = true;
        }
        if drop_tip {
            steps.push(PipetteCommand::DropTip);
            *tip = TipState::default();
        }
        self.execute(&setup.pipette, &steps).await
    }

    /// Forget what the ledger holds for a pipette that has no tip.
    ///
    /// Happens on the first executed transfer of a resumed run: the liquid
    /// the skipped steps left in the tip went away with the aborted run.
    async fn sync_tip_state(&mut self, pipette: &PipetteHandle) -> AppResult<()> {
        if pipette.has_tip().await? {
            return Ok(());
        }
        if let Some(tip) = self.tips.remove(pipette.name()) {
            if tip.liquid > VOLUME_EPSILON {
                warn!(
                    "Pipette {} has no tip, discarding {:.2}ul from the tip ledger",
                    pipette, tip.liquid
                );
            }
        }
        Ok(())
    }

    fn pipette(&self) -> AppResult<PipetteHandle> {
        self.setup
            .as_ref()
            .map(|s| s.pipette.clone())
            .ok_or(PipettingError::TransferNotSetup)
    }

    fn mix_parameters(&self, setup: &TransferSetup) -> MixWell {
        MixWell {
            volume: self.mix.volume.min(setup.max_volume),
            repetitions: self.mix.times,
            travel_speed: setup.horizontal_speed,
            onto_beads: self.onto_beads,
        }
    }

    /// Plan one transfer against copies of the ledgers involved.
    ///
    /// The copies are written back only once the whole transfer is planned,
    /// so a refill found short leaves every ledger as it was.
    fn plan_transfer(
        &mut self,
        mut source: TransferSource<'_>,
        destination: TransferDestination<'_>,
        volume: f64,
        options: TransferOptions,
    ) -> AppResult<Vec<PipetteCommand>> {
        let setup = self.setup.as_ref().ok_or(PipettingError::TransferNotSetup)?.clone();
        if volume < 0.0 {
            return Err(PipettingError::InvalidVolume {
                context: "transfer".to_string(),
                volume,
            });
        }
        let disposal = options.disposal_volume;
        let available = setup.max_volume - setup.air_gap - disposal;
        if available <= 0.0 {
            return Err(PipettingError::InvalidVolume {
                context: format!(
                    "usable capacity of {} after air gap and disposal volume",
                    setup.pipette
                ),
                volume: available,
            });
        }
        debug!(
            "Available volume {}; {} cycles needed",
            available,
            (volume / available).ceil()
        );

        let mut staged = StagedSource::stage(&source);
        let (mut staged_dest, tracked_dest) = match destination {
            TransferDestination::Well(w) => (WellWithVolume::new(w.clone(), 0.0), None),
            TransferDestination::Tracked(t) => ((*t).clone(), Some(t)),
        };
        let dest = &mut staged_dest;
        let mut batch_left = self.remaining_batch;

        let mut tip = self
            .tips
            .get(setup.pipette.name())
            .copied()
            .unwrap_or_default();
        let mut steps = Vec::new();
        if options.change_tip {
            steps.push(PipetteCommand::DropTip);
            tip = TipState::default();
        }
        steps.push(PipetteCommand::PickUpTip);

        let mut remaining = volume;
        while remaining > VOLUME_EPSILON {
            let cycle_volume = remaining.min(available);
            debug!(
                "Transferring {:.2}ul to {}, {:.2}ul remaining",
                cycle_volume,
                dest.well(),
                remaining
            );

            if tip.liquid - disposal < cycle_volume - VOLUME_EPSILON {
                if tip.air_gap_held {
                    steps.push(PipetteCommand::MoveTo {
                        location: source_well(&staged)?.top(0.0),
                        speed: None,
                    });
                    steps.push(PipetteCommand::Dispense(setup.air_gap));
                    tip.air_gap_held = false;
                }
                let batch = batch_left.unwrap_or(cycle_volume);
                let refill = available.min(batch.max(cycle_volume)) - (tip.liquid - disposal);
                debug!("Volume not enough, aspirating {:.2}ul", refill);
                aspirate_from(&mut staged, refill, &setup, &mut steps)?;
                tip.liquid += refill;
                if setup.air_gap > 0.0 {
                    steps.push(PipetteCommand::AirGap(setup.air_gap));
                    tip.air_gap_held = true;
                }
            }

            dest.fill(cycle_volume);
            let target = dest.well();
            let (height, side) = match &self.onto_beads {
                Some(beads) => {
                    let h = beads.beads_height.min(target.depth() - mix::TOP_CLEARANCE);
                    let side = get_side_movement(target, h, beads.side_top_ratio, beads.side_bottom_ratio)
                        * get_magnets_direction(target);
                    (h, side)
                }
                None => (dest.height(), 0.0),
            };
            debug!("Dispensing at height {:.2}", height);
            let central = target.bottom(height);
            let above = target.bottom(height + APPROACH_HEIGHT);

            if tip.air_gap_held {
                steps.push(PipetteCommand::MoveTo {
                    location: target.top(0.0),
                    speed: None,
                });
                steps.push(PipetteCommand::Dispense(setup.air_gap));
                tip.air_gap_held = false;
            }
            steps.extend([
                PipetteCommand::MoveTo {
                    location: above.clone(),
                    speed: None,
                },
                PipetteCommand::MoveTo {
                    location: central.clone(),
                    speed: Some(setup.vertical_speed),
                },
                PipetteCommand::MoveTo {
                    location: central.moved(Point::new(side, 0.0, 0.0)),
                    speed: Some(setup.horizontal_speed),
                },
                PipetteCommand::Dispense(cycle_volume),
                PipetteCommand::MoveTo {
                    location: central,
                    speed: Some(setup.horizontal_speed),
                },
                PipetteCommand::MoveTo {
                    location: above,
                    speed: Some(setup.vertical_speed),
                },
            ]);
            tip.liquid = (tip.liquid - cycle_volume).max(0.0);

            remaining -= cycle_volume;
            if let Some(batch) = batch_left.as_mut() {
                *batch = (*batch - cycle_volume).max(0.0);
            }
            if remaining > VOLUME_EPSILON && setup.air_gap > 0.0 {
                steps.push(PipetteCommand::AirGap(setup.air_gap));
                tip.air_gap_held = true;
            }
        }

        if self.mix.enabled() {
            debug!("Mixing {}", dest.well());
            steps.extend(mix_well(dest, &self.mix_parameters(&setup)));
            steps.push(PipetteCommand::MoveTo {
                location: dest.well().top(0.0),
                speed: Some(setup.vertical_speed),
            });
        }

        if setup.air_gap > 0.0 && !tip.air_gap_held {
            steps.push(PipetteCommand::AirGap(setup.air_gap));
            tip.air_gap_held = true;
        }
        if options.drop_tip_after {
            steps.push(PipetteCommand::DropTip);
            tip = TipState::default();
        }

        staged.commit(&mut source);
        if let Some(tracked) = tracked_dest {
            *tracked = staged_dest;
        }
        self.remaining_batch = batch_left;
        self.tips.insert(setup.pipette.name().to_string(), tip);
        Ok(steps)
    }

    async fn execute(&self, pipette: &PipetteHandle, steps: &[PipetteCommand]) -> AppResult<()> {
        for step in steps {
            match step {
                PipetteCommand::PickUpTip => {
                    if !pipette.has_tip().await? {
                        self.tip_handler.pick_up(pipette).await?;
                    }
                }
                PipetteCommand::DropTip => {
                    if pipette.has_tip().await? {
                        self.tip_handler.drop_tip(pipette).await?;
                    }
                }
                PipetteCommand::MoveTo { location, speed } => pipette.move_to(location, *speed).await?,
                PipetteCommand::Aspirate(volume) => pipette.aspirate(*volume).await?,
                PipetteCommand::Dispense(volume) => pipette.dispense(*volume).await?,
                PipetteCommand::AirGap(volume) => pipette.air_gap(*volume).await?,
                PipetteCommand::SetFlowRate(rate) => pipette.set_flow_rate(*rate).await?,
            }
        }
        Ok(())
    }
}

/// Copy of a source ledger drawn down while a transfer is planned.
enum StagedSource {
    Well(Well),
    Tracked(WellWithVolume),
    MultiTube(MultiTubeSource),
}

impl StagedSource {
    fn stage(source: &TransferSource<'_>) -> Self {
        match source {
            TransferSource::Well(w) => StagedSource::Well((**w).clone()),
            TransferSource::Tracked(t) => StagedSource::Tracked((**t).clone()),
            TransferSource::MultiTube(m) => StagedSource::MultiTube((**m).clone()),
        }
    }

    /// Write the planned drawdown back into the caller's ledger.
    fn commit(self, source: &mut TransferSource<'_>) {
        match (self, source) {
            (StagedSource::Tracked(staged), TransferSource::Tracked(t)) => **t = staged,
            (StagedSource::MultiTube(staged), TransferSource::MultiTube(m)) => **m = staged,
            _ => {}
        }
    }
}

/// The well the next aspiration from `source` happens in.
fn source_well(source: &StagedSource) -> AppResult<&Well> {
    match source {
        StagedSource::Well(w) => Ok(w),
        StagedSource::Tracked(t) => Ok(t.well()),
        StagedSource::MultiTube(m) => m.current_well().ok_or_else(|| {
            PipettingError::InvalidLayout(format!("source {} has no well bound", m.name()))
        }),
    }
}

fn approach_and_aspirate(location: Location, volume: f64, speed: f64, steps: &mut Vec<PipetteCommand>) {
    let above = location.moved(Point::new(0.0, 0.0, APPROACH_HEIGHT));
    steps.extend([
        PipetteCommand::MoveTo {
            location: above.clone(),
            speed: None,
        },
        PipetteCommand::MoveTo {
            location,
            speed: Some(speed),
        },
        PipetteCommand::Aspirate(volume),
        PipetteCommand::MoveTo {
            location: above,
            speed: Some(speed),
        },
    ]);
}

/// Draw `volume` from `source`, updating its ledger and planning the motion.
fn aspirate_from(
    source: &mut StagedSource,
    volume: f64,
    setup: &TransferSetup,
    steps: &mut Vec<PipetteCommand>,
) -> AppResult<()> {
    let tips = setup.source_tips_per_row.max(1);
    match source {
        StagedSource::Well(well) => {
            info!("Aspirating from {} {:.2}ul", well, volume);
            approach_and_aspirate(
                well.bottom(UNTRACKED_ASPIRATION_HEIGHT),
                volume,
                setup.vertical_speed,
                steps,
            );
        }
        StagedSource::Tracked(tracked) => {
            info!("Aspirating from {} {:.2}ul", tracked.well(), volume);
            let height = tracked.extract_vol_and_get_height(volume * tips as f64);
            approach_and_aspirate(tracked.well().bottom(height), volume, setup.vertical_speed, steps);
        }
        StagedSource::MultiTube(mts) => {
            info!("Aspirating from multi tube source {} {:.2}ul", mts.name(), volume);
            let needed = volume * tips as f64;
            let available = mts.total_available_volume();
            if needed > available + VOLUME_EPSILON {
                return Err(PipettingError::InsufficientVolume {
                    source_name: mts.name().to_string(),
                    requested: needed,
                    available,
                });
            }
            mts.use_volume_only(volume * (tips - 1) as f64)?;
            let speed = mts.vertical_speed().unwrap_or(setup.vertical_speed);
            for step in mts.prepare_aspiration(volume)? {
                approach_and_aspirate(step.location, step.volume, speed, steps);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockPipette;
    use crate::labware::{Labware, WellGeometry};

    fn plate() -> Labware {
        Labware::grid("plate", 8, 12, WellGeometry::circular(14.0, 5.0, 200.0))
    }

    fn manager() -> TransferManager {
        TransferManager::new(Arc::new(CountingTipHandler::new()))
    }

    fn p20() -> (Arc<MockPipette>, PipetteHandle) {
        let mock = Arc::new(MockPipette::new("p20", 20.0));
        let handle = PipetteHandle::from(mock.clone());
        (mock, handle)
    }

    #[tokio::test]
    async fn test_transfer_requires_setup() {
        let plate = plate();
        let mut tm = manager();
        let result = tm
            .transfer(
                TransferSource::Well(&plate.columns()[0][0]),
                TransferDestination::Well(&plate.columns()[1][0]),
                10.0,
                TransferOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(PipettingError::TransferNotSetup)));
    }

    #[tokio::test]
    async fn test_single_cycle_transfer() {
        let plate = plate();
        let (mock, pipette) = p20();
        let mut tm = manager();
        tm.setup_transfer(TransferSetup::new(pipette, 20.0, 2.0, 5.0));

        let mut source = WellWithVolume::new(plate.columns()[0][0].clone(), 150.0);
        let mut dest = WellWithVolume::new(plate.columns()[1][0].clone(), 0.0);
        tm.transfer(
            TransferSource::Tracked(&mut source),
            TransferDestination::Tracked(&mut dest),
            10.0,
            TransferOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(source.volume(), 140.0);
        assert_eq!(dest.volume(), 10.0);
        assert_eq!(mock.aspirated_total().await, 10.0);
        assert_eq!(mock.dispensed_liquid_total().await, 10.0);
        assert!(mock.has_tip().await.unwrap());
    }

    #[tokio::test]
    async fn test_large_volume_is_split_in_cycles() {
        let plate = plate();
        let (mock, pipette) = p20();
        let mut tm = manager();
        tm.setup_transfer(TransferSetup::new(pipette, 20.0, 2.0, 5.0));

        let mut source = WellWithVolume::new(plate.columns()[0][0].clone(), 150.0);
        let mut dest = WellWithVolume::new(plate.columns()[1][0].clone(), 0.0);
        tm.transfer(
            TransferSource::Tracked(&mut source),
            TransferDestination::Tracked(&mut dest),
            50.0,
            TransferOptions {
                drop_tip_after: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // 18ul usable per cycle: 18 + 18 + 14
        let dispenses = mock.liquid_dispenses().await;
        assert_eq!(dispenses, vec![18.0, 18.0, 14.0]);
        assert_eq!(dest.volume(), 50.0);
        assert_eq!(source.volume(), 100.0);
        assert!(!mock.has_tip().await.unwrap());
        assert_eq!(tm.liquid_in_tip(&tm.pipette().unwrap()), 0.0);
    }

    #[tokio::test]
    async fn test_batch_total_sizes_refills() {
        let plate = plate();
        let (mock, pipette) = p20();
        let mut tm = manager();
        tm.setup_transfer(TransferSetup::new(pipette, 20.0, 2.0, 5.0).with_total_volume(24.0));

        let mut source = WellWithVolume::new(plate.columns()[0][0].clone(), 150.0);
        for dest in plate.columns()[1].iter().take(4) {
            tm.transfer(
                TransferSource::Tracked(&mut source),
                TransferDestination::Well(dest),
                6.0,
                TransferOptions::default(),
            )
            .await
            .unwrap();
        }
        // one 18ul refill serves three wells, the last refill takes the remaining 6ul
        assert_eq!(mock.aspirations().await, vec![18.0, 6.0]);
        assert_eq!(source.volume(), 126.0);
        assert_eq!(tm.remaining_batch_volume(), Some(0.0));
    }

    #[tokio::test]
    async fn test_disposal_volume_stays_in_tip() {
        let plate = plate();
        let (mock, pipette) = p20();
        let mut tm = manager();
        tm.setup_transfer(TransferSetup::new(pipette.clone(), 20.0, 0.0, 5.0).with_total_volume(10.0));
        let options = TransferOptions {
            disposal_volume: 2.0,
            ..Default::default()
        };
        let source = plate.columns()[0][0].clone();
        tm.transfer(
            TransferSource::Well(&source),
            TransferDestination::Well(&plate.columns()[1][0]),
            5.0,
            options,
        )
        .await
        .unwrap();
        tm.transfer(
            TransferSource::Well(&source),
            TransferDestination::Well(&plate.columns()[1][1]),
            5.0,
            options,
        )
        .await
        .unwrap();
        assert_eq!(mock.aspirations().await, vec![12.0]);
        assert_eq!(tm.liquid_in_tip(&pipette), 2.0);
    }

    #[tokio::test]
    async fn test_change_tip_replaces_tip() {
        let plate = plate();
        let (mock, pipette) = p20();
        let tips = Arc::new(CountingTipHandler::new());
        let mut tm = TransferManager::new(tips.clone());
        tm.setup_transfer(TransferSetup::new(pipette, 20.0, 2.0, 5.0));
        let source = plate.columns()[0][0].clone();
        for (i, dest) in plate.columns()[1].iter().take(3).enumerate() {
            tm.transfer(
                TransferSource::Well(&source),
                TransferDestination::Well(dest),
                5.0,
                TransferOptions {
                    change_tip: i > 0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        assert_eq!(tips.tips_used(), 3);
        assert!(mock.has_tip().await.unwrap());
    }

    #[tokio::test]
    async fn test_multi_tube_source_drains_across_wells() {
        let plate = plate();
        let (mock, pipette) = p20();
        let mut tm = manager();
        tm.setup_transfer(TransferSetup::new(pipette, 20.0, 0.0, 5.0).with_total_volume(30.0));

        let mut mts = MultiTubeSource::new("EPH3", Some(2.0));
        mts.append_tube_with_vol(None, 12.0);
        mts.append_tube_with_vol(None, 20.0);
        mts.update_wells(vec![plate.columns()[0][0].clone(), plate.columns()[1][0].clone()])
            .unwrap();

        for dest in plate.columns()[2].iter().take(3) {
            tm.transfer(
                TransferSource::MultiTube(&mut mts),
                TransferDestination::Well(dest),
                10.0,
                TransferOptions::default(),
            )
            .await
            .unwrap();
        }
        // first refill spans both tubes
        assert_eq!(mock.aspirations().await, vec![12.0, 8.0, 10.0]);
        assert!((mts.total_available_volume() - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_multi_tube_insufficient_volume_before_motion() {
        let plate = plate();
        let (mock, pipette) = p20();
        let mut tm = manager();
        tm.setup_transfer(TransferSetup::new(pipette, 20.0, 0.0, 5.0).with_source_tips_per_row(8));

        let mut mts = MultiTubeSource::new("EPH3", None);
        mts.append_tube_with_vol(Some(plate.columns()[0][0].clone()), 50.0);
        let result = tm
            .transfer(
                TransferSource::MultiTube(&mut mts),
                TransferDestination::Well(&plate.columns()[2][0]),
                10.0,
                TransferOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(PipettingError::InsufficientVolume { .. })));
        assert!(mock.commands().await.is_empty());
        assert_eq!(mts.total_available_volume(), 50.0);
    }

    #[tokio::test]
    async fn test_short_refill_leaves_ledgers_untouched() {
        let plate = plate();
        let (mock, pipette) = p20();
        let mut tm = manager();
        tm.setup_transfer(TransferSetup::new(pipette.clone(), 20.0, 0.0, 5.0).with_total_volume(50.0));

        let mut mts = MultiTubeSource::new("EPH3", None);
        mts.append_tube_with_vol(Some(plate.columns()[0][0].clone()), 30.0);
        let mut dest = WellWithVolume::new(plate.columns()[2][0].clone(), 0.0);
        // the first 20ul refill fits, the second one does not
        let result = tm
            .transfer(
                TransferSource::MultiTube(&mut mts),
                TransferDestination::Tracked(&mut dest),
                50.0,
                TransferOptions::default(),
            )
            .await;

        assert!(matches!(result, Err(PipettingError::InsufficientVolume { .. })));
        assert!(mock.commands().await.is_empty());
        assert_eq!(mts.total_available_volume(), 30.0);
        assert_eq!(dest.volume(), 0.0);
        assert_eq!(tm.remaining_batch_volume(), Some(50.0));
        assert_eq!(tm.liquid_in_tip(&pipette), 0.0);
    }

    #[tokio::test]
    async fn test_skipped_transfer_matches_full_run() {
        let plate = plate();
        let (mock, pipette) = p20();

        let mut full_source = WellWithVolume::new(plate.columns()[0][0].clone(), 190.0);
        let mut full = manager();
        full.setup_transfer(TransferSetup::new(pipette.clone(), 20.0, 2.0, 5.0).with_total_volume(75.0));
        for dest in plate.columns()[1].iter().take(5) {
            full.transfer(
                TransferSource::Tracked(&mut full_source),
                TransferDestination::Well(dest),
                15.0,
                TransferOptions::default(),
            )
            .await
            .unwrap();
        }
        let commands_after_full = mock.commands().await.len();

        let mut skipped_source = WellWithVolume::new(plate.columns()[0][0].clone(), 190.0);
        let mut skipped = manager();
        skipped.setup_transfer(TransferSetup::new(pipette, 20.0, 2.0, 5.0).with_total_volume(75.0));
        for dest in plate.columns()[1].iter().take(5) {
            skipped
                .account_skipped_transfer(
                    TransferSource::Tracked(&mut skipped_source),
                    TransferDestination::Well(dest),
                    15.0,
                    TransferOptions::default(),
                )
                .unwrap();
        }

        assert_eq!(full_source.volume(), skipped_source.volume());
        assert_eq!(full.remaining_batch_volume(), skipped.remaining_batch_volume());
        assert_eq!(mock.commands().await.len(), commands_after_full);
    }

    #[tokio::test]
    async fn test_onto_beads_dispenses_on_magnet_side() {
        let plate = plate();
        let (mock, pipette) = p20();
        let mut tm = manager();
        tm.setup_transfer(TransferSetup::new(pipette, 20.0, 0.0, 5.0));
        tm.setup_onto_beads(OntoBeads::default());

        let source = plate.columns()[0][0].clone();
        tm.transfer(
            TransferSource::Well(&source),
            TransferDestination::Well(&plate.columns()[3][0]),
            10.0,
            TransferOptions::default(),
        )
        .await
        .unwrap();

        let dispense_location = mock.last_dispense_location().await.unwrap();
        assert_eq!(dispense_location.point.z, 8.0);
        assert!(dispense_location.point.x < 0.0);
    }

    #[tokio::test]
    async fn test_mix_after_transfer() {
        let plate = plate();
        let (mock, pipette) = p20();
        let mut tm = manager();
        tm.setup_transfer(TransferSetup::new(pipette, 20.0, 0.0, 5.0));
        tm.setup_mix(4, 15.0);

        let source = plate.columns()[0][0].clone();
        let mut dest = WellWithVolume::new(plate.columns()[1][0].clone(), 20.0);
        tm.transfer(
            TransferSource::Well(&source),
            TransferDestination::Tracked(&mut dest),
            10.0,
            TransferOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(mock.aspirations().await, vec![10.0, 15.0, 15.0, 15.0, 15.0]);
        assert_eq!(dest.volume(), 30.0);
    }

    #[tokio::test]
    async fn test_standalone_mix() {
        let plate = plate();
        let (mock, pipette) = p20();
        let mut tm = manager();
        tm.setup_transfer(TransferSetup::new(pipette, 20.0, 2.0, 5.0));
        tm.setup_mix(2, 50.0);
        let mut well = WellWithVolume::new(plate.columns()[1][0].clone(), 60.0);
        tm.mix(TransferDestination::Tracked(&mut well), true).await.unwrap();

        // mix volume capped at the pipette capacity
        assert_eq!(mock.aspirations().await, vec![20.0, 20.0]);
        assert_eq!(well.volume(), 60.0);
        assert!(!mock.has_tip().await.unwrap());
    }
}
