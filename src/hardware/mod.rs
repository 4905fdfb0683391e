//! Collaborators outside the robot deck.
//!
//! Plates travel between the two robots through an external plate handling
//! service, and some steps need a human. Both are reached through the traits
//! below; the station never knows how they are implemented.

pub mod mock;

use anyhow::Result;
use async_trait::async_trait;

/// External service moving plates between robots.
#[async_trait]
pub trait PlateHandler: Send + Sync {
    /// Take `plate_name` away from `slot`. Returns once the plate is gone.
    async fn pick_plate(&self, slot: &str, plate_name: &str) -> Result<()>;
    /// Put `plate_name` into `slot`.
    async fn drop_plate(&self, slot: &str, plate_name: &str) -> Result<()>;
}

/// The person running the protocol.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Block until the operator resumes the run.
    async fn pause(&self, message: &str) -> Result<()>;
}
