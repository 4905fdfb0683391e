//! Packing reagents into the shared reagent plate.
//!
//! The reagent plate travels between the two robots: the reagent robot fills
//! it, the library robot draws from it with an 8-channel pipette. Every
//! reagent therefore gets a run of whole columns, so one multi-channel
//! aspiration serves eight rows at once, and no well may exceed the
//! configured volume limit.
//!
//! Allocation is append-only. Reagents are assigned during setup, in order,
//! each one taking the next free columns. Afterwards the only thing that
//! changes is the first-row [`MultiTubeSource`] of each reagent, drained by
//! the transfer engine.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AppResult, PipettingError};
use crate::labware::{Labware, MultiTubeSource, Well, CHANNELS};

/// Geometry and limits of the reagent plate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReagentPlateLayout {
    /// Rows per column; 1 for single-well reservoirs
    #[serde(default = "default_num_rows")]
    pub num_rows: usize,
    /// Columns available on the plate
    #[serde(default = "default_num_cols")]
    pub num_cols: usize,
    /// Maximum volume allowed in a well, in ul
    #[serde(default = "default_well_volume_limit")]
    pub well_volume_limit: f64,
}

fn default_num_rows() -> usize {
    CHANNELS
}

fn default_num_cols() -> usize {
    12
}

fn default_well_volume_limit() -> f64 {
    100.0
}

impl Default for ReagentPlateLayout {
    fn default() -> Self {
        Self {
            num_rows: default_num_rows(),
            num_cols: default_num_cols(),
            well_volume_limit: default_well_volume_limit(),
        }
    }
}

/// Where one reagent lives on the plate.
#[derive(Clone, Debug)]
pub struct ReagentAssignment {
    name: String,
    columns: Vec<usize>,
    /// Dispensed volume per column, per row
    column_volumes: Vec<Vec<f64>>,
    volume_per_sample: f64,
    volume_available_per_sample: f64,
    mts_8_channel: MultiTubeSource,
}

impl ReagentAssignment {
    /// Reagent name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column indexes, contiguous and increasing.
    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    /// Dispensed volume of every well, column by column, row by row.
    pub fn column_volumes(&self) -> &[Vec<f64>] {
        &self.column_volumes
    }

    /// Non-zero dispensed volumes, column-major.
    pub fn dispensed_volumes(&self) -> Vec<f64> {
        self.column_volumes
            .iter()
            .flatten()
            .copied()
            .filter(|v| *v > 0.0)
            .collect()
    }

    /// Usable share of each non-zero dispensed volume.
    pub fn available_volumes(&self) -> Vec<f64> {
        self.dispensed_volumes()
            .into_iter()
            .map(|v| self.usable(v))
            .collect()
    }

    /// Usable part of a dispensed volume.
    pub fn usable(&self, dispensed: f64) -> f64 {
        dispensed * self.volume_available_per_sample / self.volume_per_sample
    }

    /// Dispensed volume of the first-row well of each column.
    pub fn first_row_volumes(&self) -> Vec<f64> {
        self.column_volumes
            .iter()
            .map(|c| c.first().copied().unwrap_or(0.0))
            .collect()
    }

    /// Total volume placed on the plate for this reagent.
    pub fn total_volume(&self) -> f64 {
        self.column_volumes.iter().flatten().sum()
    }

    /// Usable volume still drawable from the first row.
    pub fn remaining_volume(&self) -> f64 {
        self.mts_8_channel.total_available_volume()
    }
}

/// Column allocator for the shared reagent plate.
#[derive(Clone, Debug)]
pub struct ReagentPlateHelper {
    samples_per_row: Vec<usize>,
    layout: ReagentPlateLayout,
    assignments: Vec<ReagentAssignment>,
}

impl ReagentPlateHelper {
    /// Allocator for a run with `samples_per_row[r]` samples in row `r`.
    pub fn new(samples_per_row: Vec<usize>, layout: ReagentPlateLayout) -> AppResult<Self> {
        if samples_per_row.len() != CHANNELS {
            return Err(PipettingError::InvalidLayout(format!(
                "samples per row passed {} values; expected {}",
                samples_per_row.len(),
                CHANNELS
            )));
        }
        if samples_per_row.iter().all(|s| *s == 0) {
            return Err(PipettingError::InvalidLayout(
                "samples per row holds no samples".to_string(),
            ));
        }
        if layout.num_rows == 0 || layout.num_cols == 0 || layout.well_volume_limit <= 0.0 {
            return Err(PipettingError::InvalidLayout(format!(
                "reagent plate layout {:?} cannot hold liquid",
                layout
            )));
        }
        info!(
            "Reagent plate with {} rows, {} columns, {}ul per well",
            layout.num_rows, layout.num_cols, layout.well_volume_limit
        );
        Ok(Self {
            samples_per_row,
            layout,
            assignments: Vec::new(),
        })
    }

    /// Plate geometry
    pub fn layout(&self) -> &ReagentPlateLayout {
        &self.layout
    }

    /// Rows per column: 1 for a reservoir, 8 for a plate
    pub fn get_rows_count(&self) -> usize {
        self.layout.num_rows
    }

    /// Index of the first column not assigned to any reagent.
    pub fn next_free_column_index(&self) -> usize {
        self.assignments.iter().map(|a| a.columns.len()).sum()
    }

    /// Reagent names in assignment order.
    pub fn assigned_reagents(&self) -> impl Iterator<Item = &str> {
        self.assignments.iter().map(|a| a.name.as_str())
    }

    /// Reserve columns for `name` and compute how much goes into each well.
    ///
    /// `volume_with_overhead_per_sample` is what gets dispensed on the plate
    /// for every sample; `volume_available_per_sample` (default: the same) is
    /// the share of it that can actually be drawn back.
    pub fn assign_reagent(
        &mut self,
        name: &str,
        volume_with_overhead_per_sample: f64,
        volume_available_per_sample: Option<f64>,
        vertical_speed: Option<f64>,
    ) -> AppResult<&ReagentAssignment> {
        info!(
            "Assigning reagent {} with volume {}",
            name, volume_with_overhead_per_sample
        );
        if self.assignments.iter().any(|a| a.name == name) {
            return Err(PipettingError::DuplicateReagent(name.to_string()));
        }
        if volume_with_overhead_per_sample <= 0.0 {
            return Err(PipettingError::InvalidVolume {
                context: format!("reagent {} volume per sample", name),
                volume: volume_with_overhead_per_sample,
            });
        }
        let volume_available = volume_available_per_sample.unwrap_or(volume_with_overhead_per_sample);
        if volume_available < 0.0 || volume_available > volume_with_overhead_per_sample {
            return Err(PipettingError::InvalidVolume {
                context: format!("reagent {} available volume per sample", name),
                volume: volume_available,
            });
        }

        let total_volumes: Vec<f64> = if self.layout.num_rows == 1 {
            let samples: usize = self.samples_per_row.iter().sum();
            vec![samples as f64 * volume_with_overhead_per_sample]
        } else {
            self.samples_per_row
                .iter()
                .map(|s| *s as f64 * volume_with_overhead_per_sample)
                .collect()
        };
        debug!("Total volumes: {:?}", total_volumes);

        let limit = self.layout.well_volume_limit;
        let num_columns = total_volumes
            .iter()
            .map(|t| (t / limit).ceil() as usize)
            .max()
            .unwrap_or(0)
            .max(1);

        let start = self.next_free_column_index();
        if start + num_columns > self.layout.num_cols {
            return Err(PipettingError::ColumnsExhausted {
                available: self.layout.num_cols,
                requested: start + num_columns,
            });
        }

        let max_total = total_volumes.iter().copied().fold(0.0, f64::max);
        let base_volume = max_total / num_columns as f64;
        debug!("Base volume is: {}", base_volume);

        let mut column_volumes = vec![Vec::with_capacity(total_volumes.len()); num_columns];
        for total in &total_volumes {
            let mut remaining = *total;
            for (j, column) in column_volumes.iter_mut().enumerate() {
                let dispensed = if j + 1 == num_columns {
                    remaining
                } else {
                    base_volume.min(remaining)
                };
                column.push(dispensed);
                remaining -= dispensed;
            }
        }
        for (j, column) in column_volumes.iter().enumerate() {
            debug!("Column {}: {:?}", start + j, column);
        }

        info!(
            "Volume fraction is {}",
            volume_available / volume_with_overhead_per_sample
        );

        let mut assignment = ReagentAssignment {
            name: name.to_string(),
            columns: (start..start + num_columns).collect(),
            column_volumes,
            volume_per_sample: volume_with_overhead_per_sample,
            volume_available_per_sample: volume_available,
            mts_8_channel: MultiTubeSource::new(name, vertical_speed),
        };
        for first_row in assignment.first_row_volumes() {
            let usable = assignment.usable(first_row);
            assignment.mts_8_channel.append_tube_with_vol(None, usable);
        }
        self.assignments.push(assignment);
        let assignment = &self.assignments[self.assignments.len() - 1];
        info!("Assigned {} to columns {:?}", name, assignment.columns);
        Ok(assignment)
    }

    /// Assignment made for reagent `name`.
    pub fn get_assignment(&self, name: &str) -> AppResult<&ReagentAssignment> {
        self.assignments
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| PipettingError::ReagentNotAssigned(name.to_string()))
    }

    fn get_assignment_mut(&mut self, name: &str) -> AppResult<&mut ReagentAssignment> {
        self.assignments
            .iter_mut()
            .find(|a| a.name == name)
            .ok_or_else(|| PipettingError::ReagentNotAssigned(name.to_string()))
    }

    /// Columns assigned to reagent `name`, in order.
    pub fn get_assigned_columns(&self, name: &str) -> AppResult<Vec<usize>> {
        self.get_assignment(name).map(|a| a.columns.clone())
    }

    /// The labware columns assigned to `name`.
    pub fn get_columns_for_reagent(&self, name: &str, labware: &Labware) -> AppResult<Vec<Vec<Well>>> {
        let assignment = self.get_assignment(name)?;
        assignment
            .columns
            .iter()
            .map(|c| {
                labware.columns().get(*c).cloned().ok_or_else(|| {
                    PipettingError::InvalidLayout(format!(
                        "{} has no column {} for reagent {}",
                        labware.name(),
                        c,
                        name
                    ))
                })
            })
            .collect()
    }

    /// Every well receiving `name`, with its dispensed volume. Empty wells are left out.
    pub fn get_wells_with_volume(&self, name: &str, labware: &Labware) -> AppResult<Vec<(Well, f64)>> {
        let assignment = self.get_assignment(name)?;
        let columns = self.get_columns_for_reagent(name, labware)?;
        Ok(columns
            .into_iter()
            .zip(&assignment.column_volumes)
            .flat_map(|(wells, volumes)| wells.into_iter().zip(volumes.iter().copied()))
            .filter(|(_, v)| *v > 0.0)
            .collect())
    }

    /// Usable volume of the first-row well of each assigned column.
    pub fn get_first_row_available_volume(&self, name: &str) -> AppResult<Vec<f64>> {
        let assignment = self.get_assignment(name)?;
        Ok(assignment
            .first_row_volumes()
            .into_iter()
            .map(|v| assignment.usable(v))
            .collect())
    }

    /// The first-row source of `name`, bound to the wells of `labware`.
    pub fn get_mts_8_channel_for_labware(
        &mut self,
        name: &str,
        labware: &Labware,
    ) -> AppResult<&mut MultiTubeSource> {
        let first_row_wells: Vec<Well> = self
            .get_columns_for_reagent(name, labware)?
            .into_iter()
            .filter_map(|column| column.into_iter().next())
            .collect();
        let assignment = self.get_assignment_mut(name)?;
        assignment.mts_8_channel.update_wells(first_row_wells)?;
        Ok(&mut assignment.mts_8_channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labware::WellGeometry;

    fn plate(rows: usize, cols: usize) -> Labware {
        Labware::grid("reagent plate", rows, cols, WellGeometry::circular(14.0, 5.0, 200.0))
    }

    fn layout(num_rows: usize, num_cols: usize) -> ReagentPlateLayout {
        ReagentPlateLayout {
            num_rows,
            num_cols,
            well_volume_limit: 100.0,
        }
    }

    fn volumes(helper: &ReagentPlateHelper, name: &str, labware: &Labware) -> Vec<f64> {
        helper
            .get_wells_with_volume(name, labware)
            .unwrap()
            .into_iter()
            .map(|(_, v)| v)
            .collect()
    }

    #[test]
    fn test_samples_per_row_must_have_eight_entries() {
        assert!(matches!(
            ReagentPlateHelper::new(vec![1; 7], layout(8, 12)),
            Err(PipettingError::InvalidLayout(_))
        ));
        assert!(ReagentPlateHelper::new(vec![1; 9], layout(8, 12)).is_err());
    }

    #[test]
    fn test_small_volume_uses_one_column() {
        let plate = plate(8, 4);
        let mut rp = ReagentPlateHelper::new(vec![1; 8], layout(8, 4)).unwrap();
        assert_eq!(rp.next_free_column_index(), 0);
        rp.assign_reagent("EPH3", 10.0, None, None).unwrap();

        let columns = rp.get_columns_for_reagent("EPH3", &plate).unwrap();
        assert_eq!(columns, vec![plate.columns()[0].clone()]);
        assert_eq!(volumes(&rp, "EPH3", &plate), vec![10.0; 8]);
        assert_eq!(rp.get_first_row_available_volume("EPH3").unwrap(), vec![10.0]);
        assert_eq!(rp.get_rows_count(), 8);
    }

    #[test]
    fn test_large_volume_is_split_evenly() {
        let plate = plate(8, 4);
        let mut rp = ReagentPlateHelper::new(vec![1; 8], layout(8, 4)).unwrap();
        rp.assign_reagent("EPH4", 120.0, Some(100.0), None).unwrap();

        assert_eq!(rp.get_assigned_columns("EPH4").unwrap(), vec![0, 1]);
        assert_eq!(volumes(&rp, "EPH4", &plate), vec![60.0; 16]);
        assert_eq!(
            rp.get_first_row_available_volume("EPH4").unwrap(),
            vec![50.0, 50.0]
        );

        let mts = rp.get_mts_8_channel_for_labware("EPH4", &plate).unwrap();
        let bound: Vec<(String, f64)> = mts
            .locations_and_volumes()
            .into_iter()
            .map(|(w, v)| (w.map(|w| w.name.clone()).unwrap_or_default(), v))
            .collect();
        assert_eq!(
            bound,
            vec![("A1".to_string(), 50.0), ("A2".to_string(), 50.0)]
        );
    }

    #[test]
    fn test_second_reagent_takes_next_columns() {
        let plate = plate(8, 4);
        let mut rp = ReagentPlateHelper::new(vec![1; 8], layout(8, 4)).unwrap();
        rp.assign_reagent("EPH3", 10.0, None, None).unwrap();
        rp.assign_reagent("EPH4", 120.0, Some(100.0), None).unwrap();

        let columns = rp.get_columns_for_reagent("EPH4", &plate).unwrap();
        assert_eq!(columns, plate.columns()[1..3].to_vec());
        let mts = rp.get_mts_8_channel_for_labware("EPH4", &plate).unwrap();
        assert_eq!(mts.current_well().unwrap().name, "A2");
        assert_eq!(rp.next_free_column_index(), 3);
    }

    #[test]
    fn test_uneven_rows() {
        let plate = plate(8, 4);
        let mut rp = ReagentPlateHelper::new(vec![2, 2, 2, 1, 1, 1, 1, 1], layout(8, 4)).unwrap();
        rp.assign_reagent("EPH3", 10.0, None, None).unwrap();
        assert_eq!(
            volumes(&rp, "EPH3", &plate),
            vec![20.0, 20.0, 20.0, 10.0, 10.0, 10.0, 10.0, 10.0]
        );

        rp.assign_reagent("EPH4", 120.0, None, None).unwrap();
        let mut expected = vec![80.0; 8];
        expected.extend([80.0, 80.0, 80.0, 40.0, 40.0, 40.0, 40.0, 40.0]);
        expected.extend([80.0, 80.0, 80.0]);
        assert_eq!(volumes(&rp, "EPH4", &plate), expected);
        let wells: Vec<String> = rp
            .get_wells_with_volume("EPH4", &plate)
            .unwrap()
            .into_iter()
            .map(|(w, _)| w.name)
            .collect();
        assert_eq!(wells.last().map(String::as_str), Some("C4"));
    }

    #[test]
    fn test_single_row_reservoir() {
        let reservoir = plate(1, 12);
        let mut rp = ReagentPlateHelper::new(vec![1; 8], layout(1, 12)).unwrap();
        rp.assign_reagent("EPH3", 10.0, None, None).unwrap();
        let wells = rp.get_wells_with_volume("EPH3", &reservoir).unwrap();
        assert_eq!(wells.len(), 1);
        assert_eq!(wells[0].0.name, "A1");
        assert_eq!(wells[0].1, 80.0);
        assert_eq!(rp.get_rows_count(), 1);
    }

    #[test]
    fn test_columns_exhausted() {
        let mut rp = ReagentPlateHelper::new(vec![4; 8], layout(8, 4)).unwrap();
        assert!(matches!(
            rp.assign_reagent("EPH4", 120.0, None, None),
            Err(PipettingError::ColumnsExhausted {
                available: 4,
                requested: 5
            })
        ));
        assert_eq!(rp.next_free_column_index(), 0);
    }

    #[test]
    fn test_last_column_can_be_used() {
        let plate = plate(8, 4);
        let mut rp = ReagentPlateHelper::new(vec![1; 8], layout(8, 4)).unwrap();
        rp.assign_reagent("A", 300.0, None, None).unwrap();
        rp.assign_reagent("B", 10.0, None, None).unwrap();
        assert_eq!(rp.get_assigned_columns("B").unwrap(), vec![3]);
        assert!(rp.get_columns_for_reagent("B", &plate).is_ok());
        assert!(rp.assign_reagent("C", 10.0, None, None).is_err());
    }

    #[test]
    fn test_reagent_errors() {
        let plate = plate(8, 4);
        let mut rp = ReagentPlateHelper::new(vec![1; 8], layout(8, 4)).unwrap();
        assert!(matches!(
            rp.get_columns_for_reagent("EPH3", &plate),
            Err(PipettingError::ReagentNotAssigned(_))
        ));
        assert!(rp.get_first_row_available_volume("EPH3").is_err());
        rp.assign_reagent("EPH3", 10.0, None, None).unwrap();
        assert!(matches!(
            rp.assign_reagent("EPH3", 10.0, None, None),
            Err(PipettingError::DuplicateReagent(_))
        ));
        assert!(matches!(
            rp.assign_reagent("zero", 0.0, None, None),
            Err(PipettingError::InvalidVolume { .. })
        ));
    }
}
