//! Labware geometry, well identity and tip positions.
//!
//! Labware definitions are loaded by the host (offset files, custom JSON
//! definitions). The core only needs the resolved result: a named grid of
//! wells, each carrying the geometry used to turn a liquid volume into a
//! height, and the column it sits in.
//!
//! # Coordinates
//!
//! A [`Location`] is always expressed relative to the bottom center of a
//! well: `z` is the height above the bottom, `x`/`y` the lateral offset.

pub mod container;
pub mod layout;
pub mod multi_tube_source;
pub mod vertical_mapper;

pub use container::WellWithVolume;
pub use multi_tube_source::{AspirationStep, MultiTubeSource};
pub use vertical_mapper::VerticalMapper;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of channels of a multi-channel pipette, and rows of a standard plate.
pub const CHANNELS: usize = 8;

/// Cross-section of a well.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum WellShape {
    /// Round well or tube
    Circular { diameter: f64 },
    /// Square or rectangular well (reservoirs)
    Rectangular { x_dimension: f64, y_dimension: f64 },
}

/// Physical dimensions of a well, all in mm / ul.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WellGeometry {
    /// Depth from bottom to top
    pub depth: f64,
    /// Maximum volume the well holds
    pub max_volume: f64,
    /// Cross-section
    #[serde(flatten)]
    pub shape: WellShape,
}

impl WellGeometry {
    /// Round well of the given diameter.
    pub fn circular(depth: f64, diameter: f64, max_volume: f64) -> Self {
        Self {
            depth,
            max_volume,
            shape: WellShape::Circular { diameter },
        }
    }

    /// Rectangular well.
    pub fn rectangular(depth: f64, x_dimension: f64, y_dimension: f64, max_volume: f64) -> Self {
        Self {
            depth,
            max_volume,
            shape: WellShape::Rectangular {
                x_dimension,
                y_dimension,
            },
        }
    }

    /// Area of the horizontal cross-section in mm².
    pub fn cross_section_area(&self) -> f64 {
        match self.shape {
            WellShape::Circular { diameter } => std::f64::consts::PI * (diameter / 2.0).powi(2),
            WellShape::Rectangular {
                x_dimension,
                y_dimension,
            } => x_dimension * y_dimension,
        }
    }

    /// Lateral length used for side movements: the diameter, or the x length.
    pub fn length(&self) -> f64 {
        match self.shape {
            WellShape::Circular { diameter } => diameter,
            WellShape::Rectangular { x_dimension, .. } => x_dimension,
        }
    }

    /// Liquid height for `volume`, clamped to `[0, depth]`.
    pub fn height_for_volume(&self, volume: f64) -> f64 {
        let area = self.cross_section_area();
        if area <= 0.0 {
            return 0.0;
        }
        (volume / area).clamp(0.0, self.depth)
    }
}

/// A single well of a labware. Cheap to clone; equality is by labware and name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Well {
    /// Display name of the labware the well belongs to
    pub labware: String,
    /// Well name, e.g. "A1"
    pub name: String,
    /// Index of the column holding the well
    pub column: usize,
    /// Index of the row holding the well
    pub row: usize,
    /// Physical dimensions
    pub geometry: WellGeometry,
}

impl Well {
    /// Depth of the well in mm.
    pub fn depth(&self) -> f64 {
        self.geometry.depth
    }

    /// Position `z` mm above the bottom.
    pub fn bottom(&self, z: f64) -> Location {
        Location {
            well: self.clone(),
            point: Point::new(0.0, 0.0, z),
        }
    }

    /// Position `dz` mm relative to the top (negative goes inside the well).
    pub fn top(&self, dz: f64) -> Location {
        self.bottom(self.geometry.depth + dz)
    }
}

impl PartialEq for Well {
    fn eq(&self, other: &Self) -> bool {
        self.labware == other.labware && self.name == other.name
    }
}

impl fmt::Display for Well {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.name, self.labware)
    }
}

/// Offset in mm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Deck x coordinate, in mm
    pub x: f64,
    /// Deck y coordinate, in mm
    pub y: f64,
    /// Deck z coordinate, in mm
    pub z: f64,
}

impl Point {
    /// New point.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// A target position for the pipette, relative to the bottom center of a well.
#[derive(Clone, Debug, PartialEq)]
pub struct Location {
    /// Reference well
    pub well: Well,
    /// Offset from the bottom center of the well
    pub point: Point,
}

impl Location {
    /// Same location shifted by `offset`.
    pub fn moved(&self, offset: Point) -> Self {
        Self {
            well: self.well.clone(),
            point: Point::new(
                self.point.x + offset.x,
                self.point.y + offset.y,
                self.point.z + offset.z,
            ),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:.1}, {:.1}, {:.1})",
            self.well, self.point.x, self.point.y, self.point.z
        )
    }
}

/// A grid of wells as resolved by the host, stored column by column.
#[derive(Clone, Debug)]
pub struct Labware {
    name: String,
    columns: Vec<Vec<Well>>,
}

impl Labware {
    /// Standard plate or reservoir: rows named A.., columns numbered from 1.
    pub fn grid(name: &str, rows: usize, columns: usize, geometry: WellGeometry) -> Self {
        let columns = (0..columns)
            .map(|c| {
                (0..rows)
                    .map(|r| Well {
                        labware: name.to_string(),
                        name: format!("{}{}", row_letter(r), c + 1),
                        column: c,
                        row: r,
                        geometry,
                    })
                    .collect()
            })
            .collect();
        Self {
            name: name.to_string(),
            columns,
        }
    }

    /// Labware whose columns are given explicitly by name (rotated or custom plates).
    pub fn from_column_names(name: &str, columns: &[Vec<String>], geometry: WellGeometry) -> Self {
        let columns = columns
            .iter()
            .enumerate()
            .map(|(c, names)| {
                names
                    .iter()
                    .enumerate()
                    .map(|(r, well_name)| Well {
                        labware: name.to_string(),
                        name: well_name.clone(),
                        column: c,
                        row: r,
                        geometry,
                    })
                    .collect()
            })
            .collect();
        Self {
            name: name.to_string(),
            columns,
        }
    }

    /// Labware display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wells grouped by column.
    pub fn columns(&self) -> &[Vec<Well>] {
        &self.columns
    }

    /// Number of rows (length of the first column).
    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    /// Wells grouped by row.
    pub fn rows(&self) -> Vec<Vec<Well>> {
        (0..self.row_count())
            .map(|r| {
                self.columns
                    .iter()
                    .filter_map(|column| column.get(r).cloned())
                    .collect()
            })
            .collect()
    }

    /// All wells, column by column.
    pub fn wells(&self) -> Vec<Well> {
        self.columns.iter().flatten().cloned().collect()
    }

    /// Lookup by well name.
    pub fn well(&self, name: &str) -> Option<&Well> {
        self.columns.iter().flatten().find(|w| w.name == name)
    }
}

fn row_letter(row: usize) -> String {
    let mut index = row;
    let mut letters = Vec::new();
    loop {
        letters.push((b'A' + (index % 26) as u8) as char);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.iter().rev().collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn pcr_geometry() -> WellGeometry {
        WellGeometry::circular(14.78, 5.34, 200.0)
    }

    #[test]
    fn test_grid_naming() {
        let plate = Labware::grid("plate", 8, 12, pcr_geometry());
        assert_eq!(plate.columns().len(), 12);
        assert_eq!(plate.columns()[0][0].name, "A1");
        assert_eq!(plate.columns()[0][7].name, "H1");
        assert_eq!(plate.columns()[11][7].name, "H12");
        assert_eq!(plate.rows()[1][2].name, "B3");
        assert_eq!(plate.wells().len(), 96);
    }

    #[test]
    fn test_height_is_clamped() {
        let geometry = WellGeometry::rectangular(10.0, 2.0, 5.0, 100.0);
        assert_eq!(geometry.height_for_volume(50.0), 5.0);
        assert_eq!(geometry.height_for_volume(500.0), 10.0);
        assert_eq!(geometry.height_for_volume(-1.0), 0.0);
    }

    #[test]
    fn test_top_and_bottom() {
        let plate = Labware::grid("plate", 8, 12, pcr_geometry());
        let well = &plate.columns()[0][0];
        assert_eq!(well.bottom(2.0).point.z, 2.0);
        assert!((well.top(-2.0).point.z - 12.78).abs() < 1e-9);
        assert_eq!(well.bottom(1.0).moved(Point::new(1.5, 0.0, 0.0)).point.x, 1.5);
    }
}
