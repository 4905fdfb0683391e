//! Configuration loading: file, environment overrides and validation.
//!
//! Tests touching `PIPETTING_` variables run serially since the process
//! environment is shared.

use rust_pipetting::config::{ConfigError, Settings};
use rust_pipetting::hardware::mock::{
    MockHeaterShaker, MockOperator, MockPipette, MockPlateHandler, MockThermalCycler,
};
use rust_pipetting::labware::{Labware, WellGeometry};
use rust_pipetting::pipette::PipetteHandle;
use rust_pipetting::station::{Station, StationHardware};
use rust_pipetting::transfer::CountingTipHandler;
use serial_test::serial;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;

fn config_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config")
}

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
#[serial]
fn test_load_shipped_config() {
    let settings = Settings::load_from(config_dir().join("pipetting.toml")).unwrap();
    assert_eq!(settings.station.robot_name, "OT-LIB");
    assert_eq!(settings.station.num_samples, 24);
    assert_eq!(settings.pipettes.len(), 2);
    assert_eq!(settings.pipettes[1].air_gap, None);
    assert_eq!(settings.flow_rate("TAG").unwrap().aspirate, 0.5);
    assert!(settings.flow_rate("EPH3").is_err());
    assert_eq!(settings.phases.all().count(), 8);
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let file = write_config(
        r#"
[station]
num_samples = 16
"#,
    );
    std::env::set_var("PIPETTING_STATION__NUM_SAMPLES", "48");
    std::env::set_var("PIPETTING_CAPABILITIES__HEATER_SHAKER", "false");
    let result = Settings::load_from(file.path());
    std::env::remove_var("PIPETTING_STATION__NUM_SAMPLES");
    std::env::remove_var("PIPETTING_CAPABILITIES__HEATER_SHAKER");

    let settings = result.unwrap();
    assert_eq!(settings.station.num_samples, 48);
    assert!(!settings.capabilities.heater_shaker);
    assert!(settings.capabilities.thermal_cycler);
}

#[test]
#[serial]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(settings, Settings::default());
}

#[test]
#[serial]
fn test_unknown_key_is_rejected() {
    let file = write_config(
        r#"
[station]
num_sample = 16
"#,
    );
    assert!(matches!(
        Settings::load_from(file.path()),
        Err(ConfigError::Load(_))
    ));
}

#[test]
#[serial]
fn test_invalid_values_fail_validation() {
    let file = write_config(
        r#"
[station]
num_samples = 97
"#,
    );
    assert!(matches!(
        Settings::load_from(file.path()),
        Err(ConfigError::Validation(_))
    ));

    let file = write_config(
        r#"
[[pipettes]]
name = "p20"
max_volume = 20.0
air_gap = 20.0
"#,
    );
    assert!(matches!(
        Settings::load_from(file.path()),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
#[serial]
fn test_written_settings_load_back() {
    let original = Settings::load_from(config_dir().join("pipetting.toml")).unwrap();
    let file = write_config(&original.to_toml().unwrap());
    let loaded = Settings::load_from(file.path()).unwrap();
    assert_eq!(loaded, original);
}

#[tokio::test]
#[serial]
async fn test_station_from_shipped_config() {
    let settings = Settings::load_from(config_dir().join("pipetting.toml")).unwrap();
    let hardware = StationHardware {
        robot: Arc::new(MockPlateHandler::new()),
        operator: Arc::new(MockOperator::new()),
        tips: Arc::new(CountingTipHandler::new()),
        heater_shaker: Some(Arc::new(MockHeaterShaker::new())),
        thermal_cycler: Some(Arc::new(MockThermalCycler::new())),
    };
    let labware = Labware::grid("reagent plate", 8, 12, WellGeometry::circular(14.78, 5.34, 200.0));
    let mut station = Station::from_settings(settings, &config_dir(), labware, hardware).unwrap();
    assert_eq!(station.recipes().len(), 8);

    station
        .register_pipette(PipetteHandle::from(Arc::new(MockPipette::new("p20_multi", 20.0))))
        .unwrap();
    station
        .register_pipette(PipetteHandle::from(Arc::new(MockPipette::new("p300_multi", 200.0))))
        .unwrap();
    assert_eq!(station.chooser().len(), 2);

    let assigned = station.assign_reagent_plate().unwrap();
    assert_eq!(assigned.len(), 7);
    assert!(!assigned.contains(&"TWB".to_string()));
    // 3 samples per row with 0.5ul dead volume each: EPH3 fits one column
    let eph3 = station.reagent_plate().get_assignment("EPH3").unwrap();
    assert_eq!(eph3.columns(), &[0]);
    assert!((eph3.total_volume() - 24.0 * 9.0).abs() < 1e-9);
    assert!((eph3.remaining_volume() - 3.0 * 8.5).abs() < 1e-9);
}
