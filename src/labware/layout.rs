//! Where samples sit on a plate.
//!
//! Samples fill a plate column by column, eight to a column, so a
//! multi-channel pipette serves a whole column with one motion. These helpers
//! answer the recurring questions: how many samples land in each row, which
//! wells and columns hold them, and which first-row wells a multi-channel
//! pipette targets.

use super::{Labware, Well, CHANNELS};

/// Samples held by each of the eight rows when `num_samples` fill a plate
/// column by column.
pub fn samples_per_row(num_samples: usize) -> Vec<usize> {
    let full_columns = num_samples / CHANNELS;
    let remainder = num_samples % CHANNELS;
    (0..CHANNELS)
        .map(|row| full_columns + usize::from(row < remainder))
        .collect()
}

/// Number of columns touched by `num_samples`.
pub fn columns_for_samples(num_samples: usize) -> usize {
    num_samples.div_ceil(CHANNELS)
}

/// The first `num_samples` wells, column by column, starting at well index `offset`.
pub fn sample_wells(labware: &Labware, num_samples: usize, offset: usize) -> Vec<Well> {
    labware
        .wells()
        .into_iter()
        .skip(offset)
        .take(num_samples)
        .collect()
}

/// Columns holding `num_samples`, starting at column `column_offset`.
pub fn sample_columns(labware: &Labware, num_samples: usize, column_offset: usize) -> Vec<Vec<Well>> {
    labware
        .columns()
        .iter()
        .skip(column_offset)
        .take(columns_for_samples(num_samples))
        .cloned()
        .collect()
}

/// First-row well of every column holding samples: the multi-channel targets.
pub fn first_row_wells(labware: &Labware, num_samples: usize, column_offset: usize) -> Vec<Well> {
    sample_columns(labware, num_samples, column_offset)
        .into_iter()
        .filter_map(|column| column.into_iter().next())
        .collect()
}
