//! # Machine configuration
//!
//! The motion host is configured from a single TOML file.
//!
//! ## Example
//!
//! ```toml
//! [printer]
//! kinematics = "corexy"
//! max_velocity = 300.0
//! max_accel = 3000.0
//! square_corner_velocity = 5.0
//!
//! [rails.x]
//! position_max = 235.0
//! homing_speed = 50.0
//!
//! [rails.y]
//! position_max = 235.0
//! homing_speed = 50.0
//!
//! [rails.z]
//! rotation_distance = 8.0
//! position_min = -2.0
//! position_max = 250.0
//! homing_speed = 10.0
//!
//! [extruder]
//! nozzle_diameter = 0.4
//!
//! [simulation]
//! start_position = [57.0, 91.0, 12.0]
//! ```
//!
//! Missing fields fall back to the `default_*` functions below. Call
//! [`Config::validate`] before building a machine from the result.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Kinematic rail names, in axis order.
pub const RAIL_NAMES: [&str; 3] = ["x", "y", "z"];

/// Main configuration struct.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub rails: HashMap<String, RailConfig>,
    #[serde(default)]
    pub extruder: Option<ExtruderConfig>,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Toolhead and kinematics limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default = "default_kinematics")]
    pub kinematics: String,
    #[serde(default = "default_max_velocity")]
    pub max_velocity: f64,
    #[serde(default = "default_max_accel")]
    pub max_accel: f64,
    #[serde(default = "default_minimum_cruise_ratio")]
    pub minimum_cruise_ratio: f64,
    #[serde(default = "default_square_corner_velocity")]
    pub square_corner_velocity: f64,
    #[serde(default = "default_max_z_velocity")]
    pub max_z_velocity: f64,
    #[serde(default = "default_max_z_accel")]
    pub max_z_accel: f64,
    #[serde(default)]
    pub printer_name: Option<String>,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            kinematics: default_kinematics(),
            max_velocity: default_max_velocity(),
            max_accel: default_max_accel(),
            minimum_cruise_ratio: default_minimum_cruise_ratio(),
            square_corner_velocity: default_square_corner_velocity(),
            max_z_velocity: default_max_z_velocity(),
            max_z_accel: default_max_z_accel(),
            printer_name: None,
        }
    }
}

/// One kinematic rail: its stepper geometry, travel range and homing setup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RailConfig {
    #[serde(default = "default_rotation_distance")]
    pub rotation_distance: f64,
    #[serde(default = "default_microsteps")]
    pub microsteps: u32,
    #[serde(default = "default_full_steps_per_rotation")]
    pub full_steps_per_rotation: u32,
    #[serde(default)]
    pub position_min: f64,
    #[serde(default = "default_position_max")]
    pub position_max: f64,
    #[serde(default)]
    pub position_endstop: f64,
    #[serde(default = "default_homing_speed")]
    pub homing_speed: f64,
    #[serde(default)]
    pub second_homing_speed: Option<f64>,
    #[serde(default)]
    pub homing_retract_speed: Option<f64>,
    #[serde(default = "default_homing_retract_dist")]
    pub homing_retract_dist: f64,
    #[serde(default)]
    pub homing_positive_dir: Option<bool>,
}

impl Default for RailConfig {
    fn default() -> Self {
        Self {
            rotation_distance: default_rotation_distance(),
            microsteps: default_microsteps(),
            full_steps_per_rotation: default_full_steps_per_rotation(),
            position_min: 0.0,
            position_max: default_position_max(),
            position_endstop: 0.0,
            homing_speed: default_homing_speed(),
            second_homing_speed: None,
            homing_retract_speed: None,
            homing_retract_dist: default_homing_retract_dist(),
            homing_positive_dir: None,
        }
    }
}

impl RailConfig {
    pub fn step_distance(&self) -> f64 {
        self.rotation_distance / (self.full_steps_per_rotation as f64 * self.microsteps as f64)
    }
}

/// Extruder configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtruderConfig {
    #[serde(default = "default_extruder_rotation_distance")]
    pub rotation_distance: f64,
    #[serde(default = "default_microsteps")]
    pub microsteps: u32,
    #[serde(default = "default_full_steps_per_rotation")]
    pub full_steps_per_rotation: u32,
    #[serde(default = "default_nozzle_diameter")]
    pub nozzle_diameter: f64,
    #[serde(default = "default_filament_diameter")]
    pub filament_diameter: f64,
    #[serde(default)]
    pub max_extrude_cross_section: Option<f64>,
    #[serde(default)]
    pub max_extrude_only_velocity: Option<f64>,
    #[serde(default)]
    pub max_extrude_only_accel: Option<f64>,
    #[serde(default = "default_max_extrude_only_distance")]
    pub max_extrude_only_distance: f64,
    #[serde(default = "default_instantaneous_corner_velocity")]
    pub instantaneous_corner_velocity: f64,
}

impl Default for ExtruderConfig {
    fn default() -> Self {
        Self {
            rotation_distance: default_extruder_rotation_distance(),
            microsteps: default_microsteps(),
            full_steps_per_rotation: default_full_steps_per_rotation(),
            nozzle_diameter: default_nozzle_diameter(),
            filament_diameter: default_filament_diameter(),
            max_extrude_cross_section: None,
            max_extrude_only_velocity: None,
            max_extrude_only_accel: None,
            max_extrude_only_distance: default_max_extrude_only_distance(),
            instantaneous_corner_velocity: default_instantaneous_corner_velocity(),
        }
    }
}

impl ExtruderConfig {
    pub fn step_distance(&self) -> f64 {
        self.rotation_distance / (self.full_steps_per_rotation as f64 * self.microsteps as f64)
    }
}

/// Simulated machine setup. Positions are physical machine coordinates.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub start_position: [f64; 3],
    /// Delay between an endstop trigger and the steppers halting.
    #[serde(default)]
    pub halt_delay: f64,
    /// Height at which the simulated probe triggers.
    #[serde(default)]
    pub probe_trigger_z: Option<f64>,
    #[serde(default = "default_mcu_name")]
    pub mcu_name: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start_position: [0.0; 3],
            halt_delay: 0.0,
            probe_trigger_z: None,
            mcu_name: default_mcu_name(),
        }
    }
}

impl Config {
    pub fn rail(&self, name: &str) -> Result<&RailConfig, ConfigError> {
        self.rails
            .get(name)
            .ok_or_else(|| ConfigError::Invalid(format!("missing [rails.{}] section", name)))
    }

    /// Check limits and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.printer;
        if p.max_velocity <= 0.0 || p.max_accel <= 0.0 {
            return Err(ConfigError::Invalid("max_velocity and max_accel must be > 0".to_string()));
        }
        if p.max_z_velocity <= 0.0 || p.max_z_accel <= 0.0 {
            return Err(ConfigError::Invalid("max_z_velocity and max_z_accel must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&p.minimum_cruise_ratio) {
            return Err(ConfigError::Invalid("minimum_cruise_ratio must be in [0, 1)".to_string()));
        }
        if p.square_corner_velocity < 0.0 {
            return Err(ConfigError::Invalid("square_corner_velocity must be >= 0".to_string()));
        }
        for name in RAIL_NAMES {
            let rail = self.rail(name)?;
            if rail.rotation_distance <= 0.0 || rail.microsteps == 0 || rail.full_steps_per_rotation == 0 {
                return Err(ConfigError::Invalid(format!("rail '{}' has an invalid step distance", name)));
            }
            if rail.position_max <= rail.position_min {
                return Err(ConfigError::Invalid(format!("rail '{}' position_max must exceed position_min", name)));
            }
            if rail.position_endstop < rail.position_min || rail.position_endstop > rail.position_max {
                return Err(ConfigError::Invalid(format!(
                    "rail '{}' position_endstop must be within position_min and position_max",
                    name
                )));
            }
            if rail.homing_speed <= 0.0 || rail.homing_retract_dist < 0.0 {
                return Err(ConfigError::Invalid(format!("rail '{}' has invalid homing speeds", name)));
            }
        }
        if let Some(extruder) = &self.extruder {
            if extruder.nozzle_diameter <= 0.0 || extruder.filament_diameter < extruder.nozzle_diameter {
                return Err(ConfigError::Invalid(
                    "extruder filament_diameter must be >= nozzle_diameter > 0".to_string(),
                ));
            }
            if extruder.rotation_distance <= 0.0 || extruder.microsteps == 0 {
                return Err(ConfigError::Invalid("extruder has an invalid step distance".to_string()));
            }
        }
        if self.simulation.halt_delay < 0.0 {
            return Err(ConfigError::Invalid("simulation halt_delay must be >= 0".to_string()));
        }
        Ok(())
    }
}

// Default value functions
fn default_kinematics() -> String { "cartesian".to_string() }
fn default_max_velocity() -> f64 { 300.0 }
fn default_max_accel() -> f64 { 3000.0 }
fn default_minimum_cruise_ratio() -> f64 { 0.5 }
fn default_square_corner_velocity() -> f64 { 5.0 }
fn default_max_z_velocity() -> f64 { 25.0 }
fn default_max_z_accel() -> f64 { 100.0 }
fn default_rotation_distance() -> f64 { 40.0 }
fn default_extruder_rotation_distance() -> f64 { 22.67895 }
fn default_microsteps() -> u32 { 16 }
fn default_full_steps_per_rotation() -> u32 { 200 }
fn default_position_max() -> f64 { 200.0 }
fn default_homing_speed() -> f64 { 5.0 }
fn default_homing_retract_dist() -> f64 { 5.0 }
fn default_nozzle_diameter() -> f64 { 0.4 }
fn default_filament_diameter() -> f64 { 1.75 }
fn default_max_extrude_only_distance() -> f64 { 50.0 }
fn default_instantaneous_corner_velocity() -> f64 { 1.0 }
fn default_mcu_name() -> String { "mcu".to_string() }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}
