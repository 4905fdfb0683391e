//! Capacity-aware pipette selection.
//!
//! Registered pipettes are kept sorted by maximum volume. A request for a
//! volume gets the smallest pipette able to move it in one go, optionally
//! leaving room for the air gap. When nothing is large enough the largest
//! pipette is returned and a warning is logged: the transfer engine will
//! then split the volume over several cycles.
//!
//! Each selection refreshes the pipette's last-used instant, which drives
//! [`PipetteChooser::needs_unstick`]: plungers left idle too long stick and
//! must be cycled before the next precise aspiration.

use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AppResult, PipettingError};

/// Air gap as a fraction of the maximum volume, when none is given.
pub const DEFAULT_AIR_GAP_FRACTION: f64 = 0.1;

/// Idle time after which a pipette needs unsticking, by default.
pub const DEFAULT_UNSTICK_AFTER: Duration = Duration::from_secs(600);

#[derive(Clone, Debug)]
struct Registration<P> {
    pipette: P,
    max_volume: f64,
    air_gap: f64,
    last_used: Instant,
}

impl<P> Registration<P> {
    fn capacity(&self, consider_air_gap: bool) -> f64 {
        if consider_air_gap {
            self.max_volume - self.air_gap
        } else {
            self.max_volume
        }
    }
}

/// Registry of pipettes sorted by ascending maximum volume.
#[derive(Debug)]
pub struct PipetteChooser<P> {
    pipettes: Vec<Registration<P>>,
    unstick_after: Duration,
}

impl<P> Default for PipetteChooser<P> {
    fn default() -> Self {
        Self::new(DEFAULT_UNSTICK_AFTER)
    }
}

impl<P> PipetteChooser<P> {
    /// Empty chooser; pipettes idle for `unstick_after` need unsticking.
    pub fn new(unstick_after: Duration) -> Self {
        Self {
            pipettes: Vec::new(),
            unstick_after,
        }
    }

    /// Number of registered pipettes
    pub fn len(&self) -> usize {
        self.pipettes.len()
    }

    /// Whether no pipette is registered
    pub fn is_empty(&self) -> bool {
        self.pipettes.is_empty()
    }
}

impl<P: Clone + PartialEq + Debug> PipetteChooser<P> {
    /// Register `pipette`. The air gap defaults to a tenth of `max_volume`.
    ///
    /// Pipettes with the same maximum volume keep their registration order.
    pub fn register(&mut self, pipette: P, max_volume: f64, air_gap: Option<f64>) {
        let air_gap = air_gap.unwrap_or(max_volume * DEFAULT_AIR_GAP_FRACTION);
        info!(
            "Registering pipette {:?} with max volume {} and air gap {}",
            pipette, max_volume, air_gap
        );
        let index = self
            .pipettes
            .partition_point(|p| p.max_volume <= max_volume);
        self.pipettes.insert(
            index,
            Registration {
                pipette,
                max_volume,
                air_gap,
                last_used: Instant::now(),
            },
        );
    }

    /// Smallest pipette able to move `volume`, or the largest one if none can.
    pub fn get_pipette(&mut self, volume: f64, consider_air_gap: bool) -> AppResult<P> {
        let index = match self
            .pipettes
            .iter()
            .position(|p| p.capacity(consider_air_gap) >= volume)
        {
            Some(index) => index,
            None => {
                let last = self
                    .pipettes
                    .len()
                    .checked_sub(1)
                    .ok_or(PipettingError::NoPipetteRegistered)?;
                warn!(
                    volume,
                    max_volume = self.pipettes[last].max_volume,
                    "No pipette can move the requested volume in one cycle, using the largest"
                );
                last
            }
        };
        let selected = &mut self.pipettes[index];
        selected.last_used = Instant::now();
        info!(
            "Selected pipette {:?} for volume {}",
            selected.pipette, volume
        );
        Ok(selected.pipette.clone())
    }

    /// Maximum volume of `pipette`, less its air gap if requested.
    pub fn get_max_volume(&self, pipette: &P, consider_air_gap: bool) -> AppResult<f64> {
        self.registration(pipette)
            .map(|p| p.capacity(consider_air_gap))
    }

    /// Air gap configured for `pipette`, in ul.
    pub fn get_air_gap(&self, pipette: &P) -> AppResult<f64> {
        self.registration(pipette).map(|p| p.air_gap)
    }

    /// Whether `pipette` has been idle longer than the unstick threshold.
    pub fn needs_unstick(&self, pipette: &P) -> AppResult<bool> {
        let registration = self.registration(pipette)?;
        let idle = registration.last_used.elapsed();
        debug!("Pipette {:?} idle for {:?}", pipette, idle);
        Ok(idle > self.unstick_after)
    }

    /// Record that `pipette` was just used.
    pub fn mark_used(&mut self, pipette: &P) -> AppResult<()> {
        let index = self.index_of(pipette)?;
        self.pipettes[index].last_used = Instant::now();
        Ok(())
    }

    fn index_of(&self, pipette: &P) -> AppResult<usize> {
        self.pipettes
            .iter()
            .position(|p| &p.pipette == pipette)
            .ok_or_else(|| PipettingError::InstrumentNotRegistered(format!("{:?}", pipette)))
    }

    fn registration(&self, pipette: &P) -> AppResult<&Registration<P>> {
        self.index_of(pipette).map(|i| &self.pipettes[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[derive(Clone, Debug, PartialEq)]
    struct P(&'static str);

    fn chooser() -> PipetteChooser<P> {
        let mut c = PipetteChooser::default();
        c.register(P("p20"), 20.0, Some(2.0));
        c.register(P("p10"), 10.0, Some(1.0));
        c
    }

    #[tokio::test]
    async fn test_smallest_pipette_is_selected() {
        let mut c = chooser();
        assert_eq!(c.get_pipette(5.0, false).unwrap(), P("p10"));
        assert_eq!(c.get_pipette(10.0, false).unwrap(), P("p10"));
        assert_eq!(c.get_pipette(10.1, false).unwrap(), P("p20"));
    }

    #[tokio::test]
    async fn test_air_gap_is_considered() {
        let mut c = chooser();
        assert_eq!(c.get_pipette(8.0, true).unwrap(), P("p10"));
        assert_eq!(c.get_pipette(9.9, true).unwrap(), P("p20"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_fallback_to_largest() {
        let mut c = chooser();
        assert_eq!(c.get_pipette(50.0, false).unwrap(), P("p20"));
        assert!(logs_contain("using the largest"));
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let mut c: PipetteChooser<P> = PipetteChooser::default();
        assert!(matches!(
            c.get_pipette(1.0, false),
            Err(PipettingError::NoPipetteRegistered)
        ));
    }

    #[tokio::test]
    async fn test_ties_keep_registration_order() {
        let mut c = PipetteChooser::default();
        c.register(P("left"), 200.0, None);
        c.register(P("right"), 200.0, None);
        c.register(P("small"), 20.0, None);
        assert_eq!(c.get_pipette(100.0, false).unwrap(), P("left"));
        assert_eq!(c.get_pipette(15.0, false).unwrap(), P("small"));
    }

    #[tokio::test]
    async fn test_lookups() {
        let c = chooser();
        assert_eq!(c.get_max_volume(&P("p20"), false).unwrap(), 20.0);
        assert_eq!(c.get_max_volume(&P("p20"), true).unwrap(), 18.0);
        assert_eq!(c.get_air_gap(&P("p10")).unwrap(), 1.0);
        assert!(matches!(
            c.get_air_gap(&P("p1000")),
            Err(PipettingError::InstrumentNotRegistered(_))
        ));
        assert!(c.needs_unstick(&P("p1000")).is_err());
    }

    #[tokio::test]
    async fn test_default_air_gap() {
        let mut c = PipetteChooser::default();
        c.register(P("p300"), 200.0, None);
        assert_eq!(c.get_air_gap(&P("p300")).unwrap(), 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_needs_unstick_after_idle_time() {
        let mut c = PipetteChooser::new(Duration::from_secs(60));
        c.register(P("p20"), 20.0, None);
        assert!(!c.needs_unstick(&P("p20")).unwrap());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(c.needs_unstick(&P("p20")).unwrap());

        c.get_pipette(10.0, false).unwrap();
        assert!(!c.needs_unstick(&P("p20")).unwrap());
    }
}
