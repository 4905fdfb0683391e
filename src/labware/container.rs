//! Volume-tracked wells.
//!
//! `WellWithVolume` is the liquid ledger of one physical well or tube. It is a
//! pure function of the fill/extract calls made against it: nothing here
//! talks to hardware. Heights are derived from the well geometry.
//!
//! Over-draws and over-fills do not fail. The ledger is clamped to
//! `[0, max_volume]` and a warning records the discrepancy, so a protocol run
//! keeps going while the log shows where the bookkeeping went out of range.

use tracing::warn;

use super::Well;

/// Default distance kept below the liquid surface while aspirating, in mm.
pub const DEFAULT_HEADROOM_HEIGHT: f64 = 2.0;
/// Lowest aspiration height, in mm above the bottom.
pub const DEFAULT_MIN_HEIGHT: f64 = 0.5;

/// A well with a running volume ledger.
#[derive(Clone, Debug)]
pub struct WellWithVolume {
    well: Well,
    volume: f64,
    headroom_height: f64,
    min_height: f64,
}

impl WellWithVolume {
    /// Track `well`, initially holding `volume`.
    pub fn new(well: Well, volume: f64) -> Self {
        Self {
            well,
            volume: 0.0,
            headroom_height: DEFAULT_HEADROOM_HEIGHT,
            min_height: DEFAULT_MIN_HEIGHT,
        }
        .with_initial_volume(volume)
    }

    fn with_initial_volume(mut self, volume: f64) -> Self {
        self.volume = self.clamped(volume, "initial volume");
        self
    }

    /// Set how far below the surface aspiration happens.
    pub fn with_headroom_height(mut self, headroom_height: f64) -> Self {
        self.headroom_height = headroom_height;
        self
    }

    /// Set the lowest aspiration height.
    pub fn with_min_height(mut self, min_height: f64) -> Self {
        self.min_height = min_height;
        self
    }

    /// The tracked well.
    pub fn well(&self) -> &Well {
        &self.well
    }

    /// Current volume in ul.
    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Maximum volume of the well.
    pub fn capacity(&self) -> f64 {
        self.well.geometry.max_volume
    }

    /// Current liquid height in mm above the bottom.
    pub fn height(&self) -> f64 {
        self.well.geometry.height_for_volume(self.volume)
    }

    /// Add `volume` and return the new liquid height.
    pub fn fill(&mut self, volume: f64) -> f64 {
        self.volume = self.clamped(self.volume + volume, "fill");
        self.height()
    }

    /// Remove `volume` and return the aspiration height for it.
    ///
    /// The height is computed from the level *before* extraction, so the tip
    /// enters just below the surface and follows it down while aspirating.
    pub fn extract_vol_and_get_height(&mut self, volume: f64) -> f64 {
        let height = self.aspiration_height();
        self.volume = self.clamped(self.volume - volume, "extract");
        height
    }

    /// Aspiration height for the current level, without touching the ledger.
    pub fn aspiration_height(&self) -> f64 {
        (self.height() - self.headroom_height)
            .max(self.min_height)
            .min(self.well.depth())
    }

    fn clamped(&self, volume: f64, operation: &str) -> f64 {
        if volume < 0.0 {
            warn!(
                well = %self.well,
                deficit = -volume,
                "{} over-draw: ledger would go negative, clamping to 0",
                operation
            );
            0.0
        } else if volume > self.capacity() {
            warn!(
                well = %self.well,
                excess = volume - self.capacity(),
                "{} over-fill: ledger exceeds well capacity, clamping",
                operation
            );
            self.capacity()
        } else {
            volume
        }
    }
}
