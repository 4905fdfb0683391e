//! Optional hardware modules.
//!
//! A station may or may not have a heater-shaker and a thermal cycler. Each
//! one is a strategy chosen at construction: either a driver implementing
//! the capability trait, or the manual fallback that asks the operator to do
//! the step by hand.

pub mod shake_timer;

pub use shake_timer::ShakeTimer;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::error::AppResult;
use crate::hardware::Operator;

/// Heating and orbital shaking of a plate.
#[async_trait]
pub trait HeaterShaker: Send + Sync {
    /// Heat or cool to `celsius`.
    async fn set_temperature(&self, celsius: f64) -> Result<()>;
    /// Start shaking at `rpm` and return without waiting.
    async fn start_shaking(&self, rpm: f64) -> Result<()>;
    /// Stop shaking.
    async fn stop_shaking(&self) -> Result<()>;
    /// Stop shaking and temperature control.
    async fn deactivate(&self) -> Result<()>;
}

/// Thermal cycling of a plate under a heated lid.
#[async_trait]
pub trait ThermalCycler: Send + Sync {
    /// Open the lid.
    async fn open_lid(&self) -> Result<()>;
    /// Close the lid.
    async fn close_lid(&self) -> Result<()>;
    /// Run a named cycling program to completion.
    async fn run_program(&self, program: &str) -> Result<()>;
}

/// How the station shakes plates.
#[derive(Clone)]
pub enum HeaterShakerStrategy {
    /// A mounted module does the shaking
    Hardware(Arc<dyn HeaterShaker>),
    /// The operator shakes the plate off-deck
    Manual,
}

impl HeaterShakerStrategy {
    /// Whether the operator does the shaking
    pub fn is_manual(&self) -> bool {
        matches!(self, HeaterShakerStrategy::Manual)
    }

    /// Start shaking at `rpm`.
    pub async fn start_shaking(&self, rpm: f64, operator: &dyn Operator) -> AppResult<()> {
        match self {
            HeaterShakerStrategy::Hardware(module) => {
                info!("Shaking at {} rpm", rpm);
                module.start_shaking(rpm).await?;
            }
            HeaterShakerStrategy::Manual => {
                operator
                    .pause(&format!("Shake the plate at {} rpm, then resume", rpm))
                    .await?;
            }
        }
        Ok(())
    }

    /// Stop shaking; nothing to do when manual.
    pub async fn stop_shaking(&self) -> AppResult<()> {
        if let HeaterShakerStrategy::Hardware(module) = self {
            module.stop_shaking().await?;
        }
        Ok(())
    }

    /// Bring the plate to `celsius`.
    pub async fn set_temperature(&self, celsius: f64, operator: &dyn Operator) -> AppResult<()> {
        match self {
            HeaterShakerStrategy::Hardware(module) => module.set_temperature(celsius).await?,
            HeaterShakerStrategy::Manual => {
                operator
                    .pause(&format!("Bring the plate to {} °C, then resume", celsius))
                    .await?
            }
        }
        Ok(())
    }
}

impl fmt::Debug for HeaterShakerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaterShakerStrategy::Hardware(_) => f.write_str("HeaterShakerStrategy::Hardware"),
            HeaterShakerStrategy::Manual => f.write_str("HeaterShakerStrategy::Manual"),
        }
    }
}

/// How the station runs thermal programs.
#[derive(Clone)]
pub enum ThermalCyclerStrategy {
    /// A mounted module runs the programs
    Hardware(Arc<dyn ThermalCycler>),
    /// The operator moves the plate to an external cycler
    Manual,
}

impl ThermalCyclerStrategy {
    /// Whether the operator runs the programs
    pub fn is_manual(&self) -> bool {
        matches!(self, ThermalCyclerStrategy::Manual)
    }

    /// Run `program` on the plate.
    pub async fn run(&self, program: &str, operator: &dyn Operator) -> AppResult<()> {
        match self {
            ThermalCyclerStrategy::Hardware(cycler) => {
                info!("Running thermal program {}", program);
                cycler.close_lid().await?;
                cycler.run_program(program).await?;
                cycler.open_lid().await?;
            }
            ThermalCyclerStrategy::Manual => {
                operator
                    .pause(&format!(
                        "Run program {} on the external thermal cycler, then put the plate back and resume",
                        program
                    ))
                    .await?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ThermalCyclerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThermalCyclerStrategy::Hardware(_) => f.write_str("ThermalCyclerStrategy::Hardware"),
            ThermalCyclerStrategy::Manual => f.write_str("ThermalCyclerStrategy::Manual"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockHeaterShaker, MockOperator, MockThermalCycler};

    #[tokio::test]
    async fn test_manual_strategies_pause() {
        let operator = MockOperator::new();
        HeaterShakerStrategy::Manual
            .start_shaking(1600.0, &operator)
            .await
            .unwrap();
        ThermalCyclerStrategy::Manual
            .run("FSS", &operator)
            .await
            .unwrap();
        let messages = operator.messages().await;
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("1600 rpm"));
        assert!(messages[1].contains("FSS"));
    }

    #[tokio::test]
    async fn test_hardware_strategies_drive_modules() {
        let operator = MockOperator::new();
        let shaker = Arc::new(MockHeaterShaker::new());
        let cycler = Arc::new(MockThermalCycler::new());
        let hs = HeaterShakerStrategy::Hardware(shaker.clone());
        hs.start_shaking(1000.0, &operator).await.unwrap();
        assert_eq!(shaker.speed().await, Some(1000.0));
        hs.stop_shaking().await.unwrap();
        assert_eq!(shaker.speed().await, None);

        ThermalCyclerStrategy::Hardware(cycler.clone())
            .run("ANNEAL", &operator)
            .await
            .unwrap();
        assert_eq!(cycler.programs().await, vec!["ANNEAL".to_string()]);
        assert!(operator.messages().await.is_empty());
    }
}
