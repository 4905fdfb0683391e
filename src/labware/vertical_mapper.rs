//! Sample mapping for plates mounted rotated by 90 degrees.
//!
//! On a rotated plate the eight-row axis of the pipette runs along the
//! plate's long side. Samples are centered: the mapper skips the outer
//! columns and rows so the occupied block sits in the middle of the plate.

use tracing::info;

use super::{Labware, Well, CHANNELS};

/// Maps sample indexes onto a rotated plate.
#[derive(Clone, Debug)]
pub struct VerticalMapper {
    columns: Vec<Vec<Well>>,
    row_offset: usize,
}

impl VerticalMapper {
    /// Mapper over the columns of `labware` as the pipette sees them.
    pub fn new(labware: &Labware) -> Self {
        let columns = labware.columns().to_vec();
        let column_length = columns.first().map_or(0, Vec::len);
        let row_offset = column_length.saturating_sub(CHANNELS) / 2;
        info!(
            "Vertical mapper column length {}; row length: {}",
            column_length,
            columns.len()
        );
        Self {
            columns,
            row_offset,
        }
    }

    /// Wells for `num_samples`, centered on the plate.
    pub fn get_map_for_samples(&self, num_samples: usize) -> Vec<Well> {
        let sample_columns = num_samples.div_ceil(CHANNELS);
        let column_offset = self.columns.len().saturating_sub(sample_columns) / 2;
        self.columns
            .iter()
            .skip(column_offset)
            .flat_map(|column| {
                column
                    .iter()
                    .skip(self.row_offset)
                    .take(CHANNELS)
                    .cloned()
            })
            .take(num_samples)
            .collect()
    }
}
