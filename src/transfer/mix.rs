//! Mixing and side-touch positioning.
//!
//! Mixing aspirates from the middle of the liquid column and dispenses at
//! varying heights and lateral positions, so repeated cycles do not always
//! hit the same spot. In onto-beads mode every dispense lands at the bead
//! height on the magnet side of the well, to resuspend the pellet without
//! splashing.

use tracing::info;

use crate::labware::{Point, Well, WellWithVolume};
use crate::pipette::PipetteCommand;

/// Minimum vertical span between aspiration and top dispense height, in mm.
pub const MIN_Z_DIFFERENCE: f64 = 1.0;

/// Dispense heights are kept this far below the top of the well, in mm.
pub const TOP_CLEARANCE: f64 = 2.0;

const MIX_DIRECTIONS: [(f64, f64); 8] = [
    (1.0, 0.0),
    (0.0, 1.0),
    (-1.0, 0.0),
    (0.0, -1.0),
    (1.0, -1.0),
    (1.0, 1.0),
    (-1.0, 1.0),
    (-1.0, -1.0),
];

/// Where and how a dispense touches the side of the well.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OntoBeads {
    /// Height of the bead pellet above the bottom, in mm
    pub beads_height: f64,
    /// Lateral offset at the top, as a fraction of the half well length
    pub side_top_ratio: f64,
    /// Lateral offset at the bottom, as a fraction of the half well length
    pub side_bottom_ratio: f64,
}

impl Default for OntoBeads {
    fn default() -> Self {
        Self {
            beads_height: 8.0,
            side_top_ratio: 1.0,
            side_bottom_ratio: 0.4,
        }
    }
}

/// Mixing parameters for one well.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MixWell {
    /// Volume per mix cycle, in ul
    pub volume: f64,
    /// Number of aspirate and dispense cycles
    pub repetitions: u32,
    /// Speed of the side moves, in mm/s
    pub travel_speed: f64,
    /// Mix against the beads
    pub onto_beads: Option<OntoBeads>,
}

/// Lateral offset from the well center at `height`.
///
/// Interpolates linearly between the bottom and top offsets and never
/// exceeds half the well length.
pub fn get_side_movement(well: &Well, height: f64, side_top_ratio: f64, side_bottom_ratio: f64) -> f64 {
    let length = well.geometry.length();
    let side_top = side_top_ratio * length / 2.0;
    let side_bottom = side_bottom_ratio * length / 2.0;
    let depth = well.depth();
    let interpolated = if depth > 0.0 {
        side_bottom + (side_top - side_bottom) * height / depth
    } else {
        side_bottom
    };
    interpolated.min(length / 2.0)
}

/// Sign of the x offset pointing at the magnets.
///
/// Magnets sit between columns 1-2, 3-4 and so on, so even-indexed columns
/// have them on the right and odd-indexed ones on the left.
pub fn get_magnets_direction(well: &Well) -> f64 {
    if well.column % 2 == 0 {
        1.0
    } else {
        -1.0
    }
}

/// Plan the mixing of `well`.
///
/// The ledger of `well` is only read: mixing takes liquid out and puts it
/// back in the same well.
pub fn mix_well(well: &WellWithVolume, mix: &MixWell) -> Vec<PipetteCommand> {
    info!(
        "Requested mix for well {}; repetitions {}, volume {}",
        well.well(),
        mix.repetitions,
        mix.volume
    );
    let target = well.well();
    let height_min = well.aspiration_height();
    let height_max = well.height().max(height_min + MIN_Z_DIFFERENCE);
    let height_mid = (height_min + height_max) / 2.0;

    let (heights, directions): (Vec<f64>, Vec<(f64, f64)>) = match &mix.onto_beads {
        Some(beads) => {
            let d = get_magnets_direction(target);
            (vec![beads.beads_height], vec![(d, 0.0), (d, 1.0), (d, -1.0)])
        }
        None => (vec![height_max, height_mid, height_min], MIX_DIRECTIONS.to_vec()),
    };
    let (side_top, side_bottom) = mix
        .onto_beads
        .map_or((1.0, 0.4), |b| (b.side_top_ratio, b.side_bottom_ratio));
    let limit = target.depth() - TOP_CLEARANCE;
    let heights: Vec<f64> = heights.into_iter().map(|h| h.min(limit)).collect();
    info!("Dispensing at height: {:?}", heights);

    let speed = Some(mix.travel_speed);
    let aspirate_at = target.bottom(height_mid);
    let mut steps = vec![PipetteCommand::MoveTo {
        location: target.bottom(height_max),
        speed: None,
    }];
    for (&h, &(dx, dy)) in heights
        .iter()
        .cycle()
        .zip(directions.iter().cycle())
        .take(mix.repetitions as usize)
    {
        let side = get_side_movement(target, h, side_top, side_bottom);
        let center = target.bottom(h);
        let side_location = center.moved(Point::new(dx * side, dy * side, 0.0));
        steps.extend([
            PipetteCommand::MoveTo {
                location: aspirate_at.clone(),
                speed,
            },
            PipetteCommand::Aspirate(mix.volume),
            PipetteCommand::MoveTo {
                location: center.clone(),
                speed,
            },
            PipetteCommand::MoveTo {
                location: side_location,
                speed,
            },
            PipetteCommand::Dispense(mix.volume),
            PipetteCommand::MoveTo {
                location: center,
                speed,
            },
        ]);
    }
    steps.push(PipetteCommand::MoveTo {
        location: target.bottom(height_max),
        speed,
    });
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labware::{Labware, WellGeometry};

    fn plate() -> Labware {
        Labware::grid("mag plate", 8, 12, WellGeometry::circular(10.0, 6.0, 200.0))
    }

    #[test]
    fn test_side_movement_interpolates() {
        let plate = plate();
        let well = &plate.columns()[0][0];
        // half length is 3mm: bottom 1.2, top 3.0
        assert!((get_side_movement(well, 0.0, 1.0, 0.4) - 1.2).abs() < 1e-9);
        assert!((get_side_movement(well, 5.0, 1.0, 0.4) - 2.1).abs() < 1e-9);
        assert!((get_side_movement(well, 10.0, 1.0, 0.4) - 3.0).abs() < 1e-9);
        // never past the wall
        assert!((get_side_movement(well, 20.0, 1.0, 0.4) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_magnets_direction_alternates() {
        let plate = plate();
        assert_eq!(get_magnets_direction(&plate.columns()[0][0]), 1.0);
        assert_eq!(get_magnets_direction(&plate.columns()[1][3]), -1.0);
        assert_eq!(get_magnets_direction(&plate.columns()[10][0]), 1.0);
    }

    #[test]
    fn test_mix_cycles() {
        let plate = plate();
        let well = WellWithVolume::new(plate.columns()[0][0].clone(), 100.0);
        let mix = MixWell {
            volume: 20.0,
            repetitions: 5,
            travel_speed: 25.0,
            onto_beads: None,
        };
        let steps = mix_well(&well, &mix);
        // approach, 6 commands per cycle, retreat
        assert_eq!(steps.len(), 2 + 5 * 6);
        let aspirated: f64 = steps
            .iter()
            .filter_map(|s| match s {
                PipetteCommand::Aspirate(v) => Some(*v),
                _ => None,
            })
            .sum();
        assert_eq!(aspirated, 100.0);
        assert_eq!(well.volume(), 100.0);
    }

    #[test]
    fn test_mix_onto_beads_uses_bead_height() {
        let plate = plate();
        let well = WellWithVolume::new(plate.columns()[1][0].clone(), 50.0);
        let mix = MixWell {
            volume: 20.0,
            repetitions: 3,
            travel_speed: 25.0,
            onto_beads: Some(OntoBeads {
                beads_height: 9.0,
                ..Default::default()
            }),
        };
        let steps = mix_well(&well, &mix);
        let dispense_sides: Vec<Point> = steps
            .windows(2)
            .filter_map(|w| match (&w[0], &w[1]) {
                (PipetteCommand::MoveTo { location, .. }, PipetteCommand::Dispense(_)) => {
                    Some(location.point)
                }
                _ => None,
            })
            .collect();
        assert_eq!(dispense_sides.len(), 3);
        for point in dispense_sides {
            // clamped to depth minus clearance
            assert_eq!(point.z, 8.0);
            // odd column: magnets on the left
            assert!(point.x < 0.0);
        }
    }
}
