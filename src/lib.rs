//! Core library for the rust_pipetting engine.
//!
//! This library holds the reagent plate allocator, the recipe model, the
//! volume-tracked labware, the pipette chooser and the transfer engine used
//! by both robots of the library preparation workflow. A robot script builds
//! a [`station::Station`] from [`config::Settings`], injects its hardware and
//! drives one of the [`station::ProtocolPhases`] implementations.

pub mod config;
pub mod error;
pub mod hardware;
pub mod labware;
pub mod logging;
pub mod modules;
pub mod pipette;
pub mod plate_tracker;
pub mod reagent_plate;
pub mod recipe;
pub mod station;
pub mod transfer;
