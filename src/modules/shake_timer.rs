//! Start now, join later.
//!
//! Shaking and incubation steps record when they started and how long they
//! last without blocking. The protocol carries on with unrelated work and
//! later waits only for whatever time is left.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{AppResult, PipettingError};

/// Monotonic countdown for one timed step.
#[derive(Clone, Debug)]
pub struct ShakeTimer {
    name: String,
    running: Option<(Instant, Duration)>,
}

impl ShakeTimer {
    /// Timer named after the step it counts down
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            running: None,
        }
    }

    /// Start counting `duration` from now. Restarting replaces the previous countdown.
    pub fn start(&mut self, duration: Duration) {
        info!("{}: starting timer for {:?}", self.name, duration);
        self.running = Some((Instant::now(), duration));
    }

    /// Whether a countdown is running
    pub fn is_started(&self) -> bool {
        self.running.is_some()
    }

    /// Time left before the step is over; zero once it has elapsed.
    pub fn remaining(&self) -> AppResult<Duration> {
        let (started, duration) = self
            .running
            .ok_or_else(|| PipettingError::NotStarted(self.name.clone()))?;
        Ok(duration.saturating_sub(started.elapsed()))
    }

    /// Sleep for the remaining time, then clear the timer.
    pub async fn wait_for_finish(&mut self) -> AppResult<()> {
        let remaining = self.remaining()?;
        debug!("{}: waiting {:?} to finish", self.name, remaining);
        tokio::time::sleep(remaining).await;
        self.running = None;
        info!("{}: finished", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_without_start() {
        let mut timer = ShakeTimer::new("shaker");
        assert!(matches!(
            timer.wait_for_finish().await,
            Err(PipettingError::NotStarted(_))
        ));
        assert!(timer.remaining().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_only_remaining_time() {
        let mut timer = ShakeTimer::new("shaker");
        timer.start(Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(timer.remaining().unwrap(), Duration::from_secs(15));

        let before = Instant::now();
        timer.wait_for_finish().await.unwrap();
        assert_eq!(before.elapsed(), Duration::from_secs(15));
        assert!(!timer.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_timer_returns_immediately() {
        let mut timer = ShakeTimer::new("shaker");
        timer.start(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(timer.remaining().unwrap(), Duration::ZERO);
        let before = Instant::now();
        timer.wait_for_finish().await.unwrap();
        assert_eq!(before.elapsed(), Duration::ZERO);
    }
}
