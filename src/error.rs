//! Custom error types for the application.
//!
//! This module defines the primary error type, `PipettingError`, for the whole crate.
//! Using the `thiserror` crate, it gives every component one consistent way to report
//! a misconfiguration or a physically unsatisfiable request.
//!
//! ## Error Hierarchy
//!
//! `PipettingError` groups its variants by the component that raises them:
//!
//! - **Allocator**: `DuplicateReagent`, `ReagentNotAssigned`, `ColumnsExhausted`,
//!   `InvalidLayout`.
//! - **Recipes**: `VolumeNotSet`, `VolumeExceeded`, `HeadroomOutOfRange`,
//!   `DuplicateRecipe`, `RecipeNotFound`.
//! - **Pipette selection**: `InstrumentNotRegistered`, `NoPipetteRegistered`.
//! - **Transfers**: `TransferNotSetup`, `InsufficientVolume`, `InvalidVolume`,
//!   `ReagentTubeNotLoaded`.
//! - **Station**: `PlateNotLoaded`, `NotStarted`, `UnknownFlowRate`.
//! - **Infrastructure**: `Config`, `Json`, `Io`, and `Hardware`, the last one wrapping
//!   whatever an injected hardware collaborator returned.
//!
//! None of these errors is retried. Each one means the operator or the configuration
//! has to change something before the run can continue, and the volume ledgers are
//! never rolled back because liquid already moved cannot be un-moved.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, PipettingError>;

/// Every failure the allocation and transfer core can raise.
#[derive(Error, Debug)]
pub enum PipettingError {
    /// A reagent was assigned to the plate twice.
    #[error("Reagent {0} already assigned")]
    DuplicateReagent(String),

    /// No plate columns were assigned to the reagent.
    #[error("Reagent {0} not assigned to the reagent plate")]
    ReagentNotAssigned(String),

    /// The plate has too few free columns left for an assignment.
    #[error("Columns not available: plate has {available} columns, {requested} needed")]
    ColumnsExhausted {
        /// Columns still free
        available: usize,
        /// Columns the assignment needs
        requested: usize,
    },

    /// The plate layout or a source binding is unusable.
    #[error("Invalid plate layout: {0}")]
    InvalidLayout(String),

    /// The recipe's final volume was read before it was set.
    #[error("Final volume not set for recipe {0}")]
    VolumeNotSet(String),

    /// A final volume larger than what the recipe prepares.
    #[error("Requested volume {requested} exceeds the {available} prepared by recipe {recipe}")]
    VolumeExceeded {
        /// Recipe name
        recipe: String,
        /// Final volume asked for, in ul
        requested: f64,
        /// Volume the recipe prepares, in ul
        available: f64,
    },

    /// A headroom fraction outside `[0, 1]`.
    #[error("Headroom fraction {0} must be between 0 and 1")]
    HeadroomOutOfRange(f64),

    /// A recipe name registered twice.
    #[error("Recipe {0} already registered")]
    DuplicateRecipe(String),

    /// No recipe with this name.
    #[error("Recipe {0} not found")]
    RecipeNotFound(String),

    /// The pipette is unknown to the chooser or the configuration.
    #[error("Pipette {0} not registered")]
    InstrumentNotRegistered(String),

    /// Pipette selection with an empty registry.
    #[error("No pipette registered")]
    NoPipetteRegistered,

    /// Transfer or mix before `setup_transfer`.
    #[error("Transfer requested before setup_transfer was called")]
    TransferNotSetup,

    /// A source holds less than a refill needs.
    #[error("Source {source_name} holds {available:.2}ul, {requested:.2}ul requested")]
    InsufficientVolume {
        /// Name of the source
        source_name: String,
        /// Volume needed, in ul
        requested: f64,
        /// Volume left in the source, in ul
        available: f64,
    },

    /// A negative volume, or no usable pipette capacity left.
    #[error("Invalid volume {volume} for {context}")]
    InvalidVolume {
        /// What the volume was for
        context: String,
        /// Offending volume, in ul
        volume: f64,
    },

    /// No tube loaded for the reagent or recipe.
    #[error("No tube loaded for reagent {0}")]
    ReagentTubeNotLoaded(String),

    /// The plate is not in any slot.
    #[error("Plate {0} is not loaded in any slot")]
    PlateNotLoaded(String),

    /// Waiting on a timer that was never started.
    #[error("Timer {0} was never started")]
    NotStarted(String),

    /// No flow rate configured for the stage.
    #[error("No flow rate defined for stage {0}")]
    UnknownFlowRate(String),

    /// Configuration failed to load or validate.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The recipe file is not a valid recipe list.
    #[error("Recipe file error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading a file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An injected hardware collaborator failed.
    #[error("Hardware error: {0}")]
    Hardware(#[from] anyhow::Error),
}
