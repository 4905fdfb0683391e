//! Station configuration using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (base configuration)
//! 2. Environment variables prefixed with `PIPETTING_`
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! PIPETTING_APPLICATION__LOG_LEVEL=debug
//! PIPETTING_STATION__NUM_SAMPLES=48
//! PIPETTING_CAPABILITIES__HEATER_SHAKER=false
//! ```
//!
//! Unknown keys are rejected at every level, so a typo in the file fails the
//! load instead of being silently ignored.
//!
//! # Example
//!
//! ```no_run
//! use rust_pipetting::config::Settings;
//!
//! let settings = Settings::load_from("config/pipetting.toml")?;
//! let rates = settings.flow_rate("default")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::error::{AppResult, PipettingError};
use crate::labware::CHANNELS;
use crate::pipette::FlowRate;
use crate::reagent_plate::ReagentPlateLayout;
use crate::recipe::{RecipeBook, RecipeDefinition};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or the environment could not be parsed
    #[error("Configuration load error: {0}")]
    Load(#[from] figment::Error),
    /// Values parsed but out of range or inconsistent
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Top-level station configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Application name and logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Station layout and run parameters
    #[serde(default)]
    pub station: StationConfig,
    /// Optional modules present on the deck
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Pipettes mounted on the robot
    #[serde(default)]
    pub pipettes: Vec<PipetteConfig>,
    /// Flow rate multipliers by stage name
    #[serde(default)]
    pub flow_rates: BTreeMap<String, FlowRate>,
    /// Recipes defined inline, added after those of `station.recipes_file`
    #[serde(default)]
    pub recipes: Vec<RecipeDefinition>,
    /// Recipes handled in each protocol phase
    #[serde(default)]
    pub phases: PhaseRecipes,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationConfig {
    /// Name reported in log messages
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// What the station works on and where things sit on its deck
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StationConfig {
    /// Robot name, used in log messages and plate hand-off requests
    #[serde(default = "default_robot_name")]
    pub robot_name: String,
    /// Samples processed in this run, 1 to 96
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
    /// Slot the reagent plate is exchanged through
    #[serde(default = "default_reagent_plate_slot")]
    pub reagent_plate_slot: String,
    /// Reagent plate geometry used by the allocator
    #[serde(default)]
    pub reagent_plate: ReagentPlateLayout,
    /// Reagent volume that cannot be drawn back from a reagent plate well, in ul per sample
    #[serde(default)]
    pub reagent_dead_volume_per_sample: f64,
    /// Slow vertical speed close to the liquid, in mm/s
    #[serde(default = "default_vertical_speed")]
    pub vertical_speed: f64,
    /// Horizontal speed for side moves in the well, in mm/s
    #[serde(default = "default_horizontal_speed")]
    pub horizontal_speed: f64,
    /// Idle time after which a pipette needs unsticking, in seconds
    #[serde(default = "default_unstick_after_secs")]
    pub unstick_after_secs: u64,
    /// Mixes applied after preparing a multi-step recipe
    #[serde(default = "default_prepare_mix_times")]
    pub prepare_mix_times: u32,
    /// JSON recipe list loaded before the inline recipes
    #[serde(default)]
    pub recipes_file: Option<PathBuf>,
    /// Resume the run from this stage
    #[serde(default)]
    pub start_at: Option<String>,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            robot_name: default_robot_name(),
            num_samples: default_num_samples(),
            reagent_plate_slot: default_reagent_plate_slot(),
            reagent_plate: ReagentPlateLayout::default(),
            reagent_dead_volume_per_sample: 0.0,
            vertical_speed: default_vertical_speed(),
            horizontal_speed: default_horizontal_speed(),
            unstick_after_secs: default_unstick_after_secs(),
            prepare_mix_times: default_prepare_mix_times(),
            recipes_file: None,
            start_at: None,
        }
    }
}

impl StationConfig {
    /// Idle time after which a pipette needs unsticking.
    pub fn unstick_after(&self) -> Duration {
        Duration::from_secs(self.unstick_after_secs)
    }
}

/// Optional hardware modules present on the deck
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Capabilities {
    /// A heater-shaker module is mounted
    #[serde(default = "default_true")]
    pub heater_shaker: bool,
    /// A thermal cycler module is mounted
    #[serde(default = "default_true")]
    pub thermal_cycler: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            heater_shaker: true,
            thermal_cycler: true,
        }
    }
}

/// A pipette and its capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipetteConfig {
    /// Name matched against the mounted pipette
    pub name: String,
    /// Capacity in ul
    pub max_volume: f64,
    /// Air gap in ul; a tenth of `max_volume` when absent
    #[serde(default)]
    pub air_gap: Option<f64>,
}

/// Recipe names handled in each protocol phase, in order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseRecipes {
    /// Recipes distributed before annealing
    #[serde(default)]
    pub anneal_rna: Vec<String>,
    /// Recipes for first strand synthesis
    #[serde(default)]
    pub first_strand_cdna: Vec<String>,
    /// Recipes for cDNA amplification
    #[serde(default)]
    pub amplify_cdna: Vec<String>,
    /// Recipes for tagmentation
    #[serde(default)]
    pub tagment_pcr_amplicons: Vec<String>,
    /// Recipes for the post-tagmentation cleanup
    #[serde(default)]
    pub post_tagmentation_cleanup: Vec<String>,
    /// Recipes for amplification of tagmented amplicons
    #[serde(default)]
    pub amplify_tagmented_amplicons: Vec<String>,
}

impl PhaseRecipes {
    /// Every recipe name referenced by any phase.
    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.anneal_rna
            .iter()
            .chain(&self.first_strand_cdna)
            .chain(&self.amplify_cdna)
            .chain(&self.tagment_pcr_amplicons)
            .chain(&self.post_tagmentation_cleanup)
            .chain(&self.amplify_tagmented_amplicons)
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "pipetting station".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_robot_name() -> String {
    "OT".to_string()
}

fn default_num_samples() -> usize {
    96
}

fn default_reagent_plate_slot() -> String {
    "SLOT1".to_string()
}

fn default_vertical_speed() -> f64 {
    5.0
}

fn default_horizontal_speed() -> f64 {
    25.0
}

fn default_unstick_after_secs() -> u64 {
    600
}

fn default_prepare_mix_times() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from `config/pipetting.toml` and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/pipetting.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Precedence, highest first: `PIPETTING_` environment variables, the
    /// file, the serde defaults. The result is validated before returning.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PIPETTING_").split("__"))
            .extract()
            .map_err(ConfigError::Load)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Sample count fits one 96-well plate
    /// - Reagent plate layout is usable by an 8-channel pipette or is a reservoir
    /// - Pipette names are unique and capacities positive
    /// - Flow rates are positive
    /// - Phases reference known recipes when all recipes are inline
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let station = &self.station;
        if station.num_samples == 0 || station.num_samples > CHANNELS * 12 {
            return Err(ConfigError::Validation(format!(
                "Invalid num_samples {}. Must be 1-96",
                station.num_samples
            )));
        }
        let layout = &station.reagent_plate;
        if layout.num_rows != 1 && layout.num_rows != CHANNELS {
            return Err(ConfigError::Validation(format!(
                "Invalid reagent plate num_rows {}. Must be 1 or {}",
                layout.num_rows, CHANNELS
            )));
        }
        if layout.num_cols == 0 || layout.well_volume_limit <= 0.0 {
            return Err(ConfigError::Validation(
                "Reagent plate needs at least one column and a positive well volume limit".to_string(),
            ));
        }
        if station.reagent_dead_volume_per_sample < 0.0 {
            return Err(ConfigError::Validation(format!(
                "Invalid reagent_dead_volume_per_sample {}",
                station.reagent_dead_volume_per_sample
            )));
        }
        if station.vertical_speed <= 0.0 || station.horizontal_speed <= 0.0 {
            return Err(ConfigError::Validation("Speeds must be positive".to_string()));
        }

        let mut names = HashSet::new();
        for pipette in &self.pipettes {
            if !names.insert(&pipette.name) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate pipette name: '{}'",
                    pipette.name
                )));
            }
            if pipette.max_volume <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "Pipette '{}': max_volume must be > 0",
                    pipette.name
                )));
            }
            if let Some(air_gap) = pipette.air_gap {
                if air_gap < 0.0 || air_gap >= pipette.max_volume {
                    return Err(ConfigError::Validation(format!(
                        "Pipette '{}': air_gap {} must be within [0, {})",
                        pipette.name, air_gap, pipette.max_volume
                    )));
                }
            }
        }

        for (stage, rate) in &self.flow_rates {
            if rate.aspirate <= 0.0 || rate.dispense <= 0.0 || rate.blow_out <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "Flow rate '{}': multipliers must be > 0",
                    stage
                )));
            }
        }

        if station.recipes_file.is_none() {
            let known: HashSet<&String> = self.recipes.iter().map(|r| &r.name).collect();
            if let Some(missing) = self.phases.all().find(|name| !known.contains(name)) {
                return Err(ConfigError::Validation(format!(
                    "Phase references unknown recipe '{}'",
                    missing
                )));
            }
        }

        Ok(())
    }

    /// Flow rate multipliers for `stage`.
    pub fn flow_rate(&self, stage: &str) -> AppResult<FlowRate> {
        self.flow_rates
            .get(stage)
            .copied()
            .ok_or_else(|| PipettingError::UnknownFlowRate(stage.to_string()))
    }

    /// Recipes from `station.recipes_file` followed by the inline ones.
    ///
    /// A relative recipe file path is resolved against `base_dir`.
    pub fn recipe_book(&self, base_dir: &Path) -> AppResult<RecipeBook> {
        let mut book = match &self.station.recipes_file {
            Some(file) => RecipeBook::load_from(&base_dir.join(file))?,
            None => RecipeBook::new(),
        };
        for definition in &self.recipes {
            book.add_recipe(definition.clone().try_into()?)?;
        }
        Ok(book)
    }

    /// Serialize the settings back to TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Settings {
        Settings {
            pipettes: vec![
                PipetteConfig {
                    name: "p20".to_string(),
                    max_volume: 20.0,
                    air_gap: Some(2.0),
                },
                PipetteConfig {
                    name: "p300".to_string(),
                    max_volume: 200.0,
                    air_gap: None,
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut settings = valid();
        settings.application.log_level = "verbose".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_config_validation_duplicate_pipette() {
        let mut settings = valid();
        settings.pipettes[1].name = "p20".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate pipette name"));
    }

    #[test]
    fn test_config_validation_reagent_rows() {
        let mut settings = valid();
        settings.station.reagent_plate.num_rows = 4;
        assert!(settings.validate().is_err());
        settings.station.reagent_plate.num_rows = 1;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_config_validation_unknown_phase_recipe() {
        let mut settings = valid();
        settings.phases.anneal_rna.push("EPH3".to_string());
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("EPH3"));
    }

    #[test]
    fn test_wash_plate_slot_is_not_a_setting() {
        let result: Result<Settings, _> = toml::from_str(
            r#"
[station]
wash_plate_slot = "SLOT2"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_flow_rate_lookup() {
        let mut settings = valid();
        settings.flow_rates.insert(
            "viscous".to_string(),
            FlowRate {
                aspirate: 0.5,
                dispense: 0.5,
                blow_out: 1.0,
            },
        );
        assert_eq!(settings.flow_rate("viscous").unwrap().aspirate, 0.5);
        assert!(matches!(
            settings.flow_rate("water"),
            Err(PipettingError::UnknownFlowRate(_))
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let settings = valid();
        let text = settings.to_toml().unwrap();
        let parsed: Settings = toml::from_str(&text).unwrap();
        assert_eq!(parsed, settings);
    }
}
