//! Several wells acting as one logical liquid source.
//!
//! A reagent spread over consecutive columns of the reagent plate is drawn
//! as if it were a single tube: aspirations drain the first well with liquid
//! left and continue into the next one when it runs dry. The ledger holds the
//! *usable* volume of each well (dead volume excluded).
//!
//! The allocator creates the source before the plate is bound to a physical
//! labware, so wells are optional until [`MultiTubeSource::update_wells`] is
//! called.

use tracing::{debug, info};

use super::{Location, Well, WellWithVolume};
use crate::error::{AppResult, PipettingError};

/// Volumes below this are treated as zero when draining.
const VOLUME_EPSILON: f64 = 1e-6;

#[derive(Clone, Debug)]
struct SourceTube {
    well: Option<Well>,
    volume: f64,
}

/// One aspiration in a drain plan.
#[derive(Clone, Debug, PartialEq)]
pub struct AspirationStep {
    /// Where to aspirate
    pub location: Location,
    /// How much to aspirate there
    pub volume: f64,
}

/// Ordered set of wells used as one reagent source.
#[derive(Clone, Debug)]
pub struct MultiTubeSource {
    name: String,
    tubes: Vec<SourceTube>,
    vertical_speed: Option<f64>,
}

impl MultiTubeSource {
    /// Empty source.
    pub fn new(name: &str, vertical_speed: Option<f64>) -> Self {
        Self {
            name: name.to_string(),
            tubes: Vec::new(),
            vertical_speed,
        }
    }

    /// Source name (the reagent).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Vertical speed requested for approaching the liquid, if any.
    pub fn vertical_speed(&self) -> Option<f64> {
        self.vertical_speed
    }

    /// Append a tube holding `volume` usable ul.
    pub fn append_tube_with_vol(&mut self, well: Option<Well>, volume: f64) {
        self.tubes.push(SourceTube { well, volume });
    }

    /// Bind physical wells to the tubes, in order.
    pub fn update_wells(&mut self, wells: Vec<Well>) -> AppResult<()> {
        if wells.len() != self.tubes.len() {
            return Err(PipettingError::InvalidLayout(format!(
                "source {} has {} tubes, {} wells given",
                self.name,
                self.tubes.len(),
                wells.len()
            )));
        }
        for (i, (tube, well)) in self.tubes.iter_mut().zip(wells).enumerate() {
            info!("MTS {}: updating source {} with {}", self.name, i, well);
            tube.well = Some(well);
        }
        Ok(())
    }

    /// Wells and remaining volumes, in drain order.
    pub fn locations_and_volumes(&self) -> Vec<(Option<&Well>, f64)> {
        self.tubes.iter().map(|t| (t.well.as_ref(), t.volume)).collect()
    }

    /// Usable volume left across all tubes.
    pub fn total_available_volume(&self) -> f64 {
        self.tubes.iter().map(|t| t.volume).sum()
    }

    /// The well the next aspiration starts from.
    pub fn current_well(&self) -> Option<&Well> {
        self.tubes
            .iter()
            .find(|t| t.volume > VOLUME_EPSILON)
            .or(self.tubes.last())
            .and_then(|t| t.well.as_ref())
    }

    /// Deplete the ledger by `volume` without producing any motion.
    ///
    /// Used for liquid drawn by tips that are not tracked individually and for
    /// skipped steps on a resumed run.
    pub fn use_volume_only(&mut self, volume: f64) -> AppResult<()> {
        self.drain(volume).map(|_| ())
    }

    /// Deplete the ledger by `volume` and return where to aspirate it.
    ///
    /// Fails with `InsufficientVolume` before touching the ledger when the
    /// tubes cannot cover the request, and with `InvalidLayout` when a tube
    /// involved has no well bound to it.
    pub fn prepare_aspiration(&mut self, volume: f64) -> AppResult<Vec<AspirationStep>> {
        if self
            .tubes
            .iter()
            .any(|t| t.volume > VOLUME_EPSILON && t.well.is_none())
        {
            return Err(PipettingError::InvalidLayout(format!(
                "source {} has no well bound for aspiration",
                self.name
            )));
        }
        let plan = self.drain(volume)?;
        plan.into_iter()
            .map(|(well, height, volume)| {
                let well = well.ok_or_else(|| {
                    PipettingError::InvalidLayout(format!(
                        "source {} has no well bound for aspiration",
                        self.name
                    ))
                })?;
                Ok(AspirationStep {
                    location: well.bottom(height),
                    volume,
                })
            })
            .collect()
    }

    fn drain(&mut self, volume: f64) -> AppResult<Vec<(Option<Well>, f64, f64)>> {
        let available = self.total_available_volume();
        if volume > available + VOLUME_EPSILON {
            return Err(PipettingError::InsufficientVolume {
                source_name: self.name.clone(),
                requested: volume,
                available,
            });
        }

        let mut remaining = volume;
        let mut plan = Vec::new();
        for tube in self.tubes.iter_mut() {
            if remaining <= VOLUME_EPSILON {
                break;
            }
            if tube.volume <= VOLUME_EPSILON {
                continue;
            }
            let drawn = remaining.min(tube.volume);
            let height = match &tube.well {
                Some(well) => {
                    WellWithVolume::new(well.clone(), tube.volume).extract_vol_and_get_height(drawn)
                }
                None => 0.0,
            };
            tube.volume -= drawn;
            remaining -= drawn;
            debug!(
                "MTS {}: drawing {:.2}ul, {:.2}ul left in tube",
                self.name, drawn, tube.volume
            );
            plan.push((tube.well.clone(), height, drawn));
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labware::{Labware, WellGeometry};

    fn plate() -> Labware {
        Labware::grid("reagents", 8, 4, WellGeometry::circular(14.0, 5.0, 200.0))
    }

    #[test]
    fn test_drain_continues_into_next_tube() {
        let mut mts = MultiTubeSource::new("EPH4", None);
        mts.append_tube_with_vol(None, 50.0);
        mts.append_tube_with_vol(None, 50.0);
        mts.use_volume_only(70.0).unwrap();
        let volumes: Vec<f64> = mts.locations_and_volumes().iter().map(|(_, v)| *v).collect();
        assert_eq!(volumes, vec![0.0, 30.0]);
    }

    #[test]
    fn test_insufficient_volume_leaves_ledger_untouched() {
        let mut mts = MultiTubeSource::new("EPH4", None);
        mts.append_tube_with_vol(None, 10.0);
        assert!(matches!(
            mts.use_volume_only(11.0),
            Err(PipettingError::InsufficientVolume { .. })
        ));
        assert_eq!(mts.total_available_volume(), 10.0);
    }

    #[test]
    fn test_prepare_aspiration_splits_over_wells() {
        let plate = plate();
        let mut mts = MultiTubeSource::new("EPH4", Some(5.0));
        mts.append_tube_with_vol(None, 20.0);
        mts.append_tube_with_vol(None, 20.0);
        mts.update_wells(vec![plate.columns()[0][0].clone(), plate.columns()[1][0].clone()])
            .unwrap();

        let plan = mts.prepare_aspiration(30.0).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].location.well.name, "A1");
        assert_eq!(plan[0].volume, 20.0);
        assert_eq!(plan[1].location.well.name, "A2");
        assert_eq!(plan[1].volume, 10.0);
        assert_eq!(mts.current_well().unwrap().name, "A2");
    }

    #[test]
    fn test_unbound_wells_cannot_be_aspirated() {
        let mut mts = MultiTubeSource::new("EPH3", None);
        mts.append_tube_with_vol(None, 20.0);
        assert!(matches!(
            mts.prepare_aspiration(5.0),
            Err(PipettingError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_update_wells_length_mismatch() {
        let plate = plate();
        let mut mts = MultiTubeSource::new("EPH3", None);
        mts.append_tube_with_vol(None, 20.0);
        assert!(mts.update_wells(plate.columns()[0].clone()).is_err());
    }
}
