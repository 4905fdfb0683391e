//! Reagent mixes and their volume accounting.
//!
//! A [`Recipe`] describes what goes into one reagent mix (its steps) and how
//! much of it is dispensed per destination (`volume_final`). The difference
//! between the prepared total and the final volume is overhead: part of it
//! travels with the first hand-off transfer, the rest stays in the source
//! tube as headroom. `headroom_fraction` controls the split.
//!
//! Recipes are loaded once at startup from a JSON list into a
//! [`RecipeBook`] and are read-only afterwards, except for the one-time
//! assignment of the final volume.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{AppResult, PipettingError};

/// Default share of the final volume kept as headroom in the source.
pub const DEFAULT_HEADROOM_FRACTION: f64 = 0.5;

/// One component of a mix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecipeStep {
    /// Human readable step description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Reagent to add
    pub reagent: String,
    /// Volume added per single use, in ul
    pub vol: f64,
}

impl RecipeStep {
    /// Step adding `vol` ul of `reagent`.
    pub fn new(reagent: &str, vol: f64) -> Self {
        Self {
            name: None,
            reagent: reagent.to_string(),
            vol,
        }
    }
}

/// A recipe as written in the recipe list file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecipeDefinition {
    /// Unique recipe name
    pub name: String,
    /// Free text shown in logs
    #[serde(default)]
    pub description: String,
    /// Reagents mixed to prepare the recipe
    #[serde(default)]
    pub steps: Vec<RecipeStep>,
    /// Volume dispensed per sample, in ul
    #[serde(default)]
    pub volume_final: Option<f64>,
    /// Distributed from the reagent plate; defaults to true
    #[serde(default)]
    pub use_reagent_plate: Option<bool>,
    /// Distributed from the wash plate; defaults to false
    #[serde(default)]
    pub use_wash_plate: Option<bool>,
    /// Share of the overhead kept in the source tube as headroom
    #[serde(default)]
    pub headroom_fraction: Option<f64>,
    /// Times the recipe is distributed to each sample
    #[serde(default)]
    pub number_of_times_needed: Option<u32>,
}

/// A named reagent mix.
#[derive(Clone, Debug, PartialEq)]
pub struct Recipe {
    name: String,
    description: String,
    steps: Vec<RecipeStep>,
    volume_final: Option<f64>,
    headroom_fraction: f64,
    use_reagent_plate: bool,
    use_wash_plate: bool,
    number_of_times_needed: u32,
}

impl Recipe {
    /// Empty recipe with default options.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            steps: Vec::new(),
            volume_final: None,
            headroom_fraction: DEFAULT_HEADROOM_FRACTION,
            use_reagent_plate: true,
            use_wash_plate: false,
            number_of_times_needed: 1,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Append steps and return the recipe.
    pub fn with_steps(mut self, steps: Vec<RecipeStep>) -> Self {
        self.add_steps(steps);
        self
    }

    /// Whether the mix is placed on the shared reagent plate.
    pub fn with_reagent_plate(mut self, use_reagent_plate: bool) -> Self {
        self.use_reagent_plate = use_reagent_plate && !self.use_wash_plate;
        self
    }

    /// Whether the mix is placed on the wash plate. Implies no reagent plate.
    pub fn with_wash_plate(mut self, use_wash_plate: bool) -> Self {
        self.use_wash_plate = use_wash_plate;
        if use_wash_plate {
            self.use_reagent_plate = false;
        }
        self
    }

    /// How many destinations draw from this recipe's allocation.
    pub fn with_times_needed(mut self, number_of_times_needed: u32) -> Self {
        self.number_of_times_needed = number_of_times_needed;
        self
    }

    /// Recipe name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free text description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Steps in preparation order
    pub fn steps(&self) -> &[RecipeStep] {
        &self.steps
    }

    /// Whether the recipe is allocated on the reagent plate
    pub fn use_reagent_plate(&self) -> bool {
        self.use_reagent_plate
    }

    /// Whether the recipe goes on the wash plate
    pub fn use_wash_plate(&self) -> bool {
        self.use_wash_plate
    }

    /// Times the recipe is distributed to each sample
    pub fn number_of_times_needed(&self) -> u32 {
        self.number_of_times_needed
    }

    /// Share of the overhead kept in the source tube as headroom
    pub fn headroom_fraction(&self) -> f64 {
        self.headroom_fraction
    }

    /// Append composition steps. Duplicate reagents are kept and their volumes add up.
    pub fn add_steps(&mut self, steps: Vec<RecipeStep>) {
        self.steps.extend(steps);
    }

    /// Sum of all step volumes.
    pub fn total_prepared_volume(&self) -> f64 {
        self.steps.iter().map(|s| s.vol).sum()
    }

    /// Multi-reagent mixes are prepared in an empty tube before distribution.
    pub fn needs_empty_tube(&self) -> bool {
        self.steps.len() > 1
    }

    /// Volume dispensed per destination, excluding overhead.
    pub fn volume_final(&self) -> AppResult<f64> {
        self.volume_final
            .ok_or_else(|| PipettingError::VolumeNotSet(self.name.clone()))
    }

    /// Assign the final volume. It cannot exceed what the recipe prepares.
    pub fn set_volume_final(&mut self, volume: f64) -> AppResult<()> {
        if volume <= 0.0 {
            return Err(PipettingError::InvalidVolume {
                context: format!("final volume of recipe {}", self.name),
                volume,
            });
        }
        let available = self.total_prepared_volume();
        if volume > available {
            return Err(PipettingError::VolumeExceeded {
                recipe: self.name.clone(),
                requested: volume,
                available,
            });
        }
        self.volume_final = Some(volume);
        Ok(())
    }

    /// Set the headroom fraction, within `[0, 1]`.
    pub fn set_headroom_fraction(&mut self, fraction: f64) -> AppResult<()> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(PipettingError::HeadroomOutOfRange(fraction));
        }
        self.headroom_fraction = fraction;
        Ok(())
    }

    /// Volume moved by the first transfer out of the prepared tube, overhead included.
    ///
    /// Single-reagent recipes are used straight from their tube, so the whole
    /// prepared volume is distributed.
    pub fn volume_to_distribute(&self) -> AppResult<f64> {
        let volume_final = self.volume_final()?;
        let total = self.total_prepared_volume();
        if self.needs_empty_tube() {
            let h = self.headroom_fraction;
            Ok(total * (1.0 - h) + volume_final * h)
        } else {
            Ok(total)
        }
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<String> = self
            .steps
            .iter()
            .map(|s| format!("({}, {})", s.reagent, s.vol))
            .collect();
        write!(
            f,
            "Recipe name: {}; vol: {}; steps: {}",
            self.name,
            self.volume_final.unwrap_or(0.0),
            steps.join(", ")
        )
    }
}

impl TryFrom<RecipeDefinition> for Recipe {
    type Error = PipettingError;

    fn try_from(def: RecipeDefinition) -> AppResult<Self> {
        let mut recipe = Recipe::new(&def.name)
            .with_description(&def.description)
            .with_steps(def.steps)
            .with_reagent_plate(def.use_reagent_plate.unwrap_or(true))
            .with_wash_plate(def.use_wash_plate.unwrap_or(false))
            .with_times_needed(def.number_of_times_needed.unwrap_or(1));
        if let Some(fraction) = def.headroom_fraction {
            recipe.set_headroom_fraction(fraction)?;
        }
        if let Some(volume) = def.volume_final {
            recipe.set_volume_final(volume)?;
        }
        Ok(recipe)
    }
}

/// Name-keyed recipe registry, iterated in insertion order.
#[derive(Clone, Debug, Default)]
pub struct RecipeBook {
    recipes: Vec<Recipe>,
}

impl RecipeBook {
    /// Empty book
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON recipe list.
    pub fn from_json(json: &str) -> AppResult<Self> {
        let definitions: Vec<RecipeDefinition> = serde_json::from_str(json)?;
        let mut book = Self::new();
        for def in definitions {
            book.add_recipe(Recipe::try_from(def)?)?;
        }
        info!("Loaded {} recipes", book.len());
        Ok(book)
    }

    /// Load a JSON recipe list from disk.
    pub fn load_from(path: &Path) -> AppResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Register a recipe; names are unique.
    pub fn add_recipe(&mut self, recipe: Recipe) -> AppResult<()> {
        if self.recipes.iter().any(|r| r.name == recipe.name) {
            return Err(PipettingError::DuplicateRecipe(recipe.name));
        }
        debug!("Adding recipe {}", recipe);
        self.recipes.push(recipe);
        Ok(())
    }

    /// Recipe named `name`.
    pub fn get_recipe(&self, name: &str) -> AppResult<&Recipe> {
        self.recipes
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| PipettingError::RecipeNotFound(name.to_string()))
    }

    /// Mutable access to the recipe named `name`.
    pub fn get_recipe_mut(&mut self, name: &str) -> AppResult<&mut Recipe> {
        self.recipes
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| PipettingError::RecipeNotFound(name.to_string()))
    }

    /// Recipes in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Recipe> {
        self.recipes.iter()
    }

    /// Number of recipes
    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    /// Whether the book holds no recipe
    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }
}
