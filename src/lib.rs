// src/lib.rs - Host side motion control: look-ahead planning, toolhead scheduling and homing
pub mod config;
pub mod hardware;
pub mod homing;
pub mod motion;
pub mod scheduler;
pub mod script;
pub mod simulator;
pub mod trapq;

pub use config::{Config, ConfigError, load_config};
pub use homing::{HomingError, PrinterHoming};
pub use motion::{Coord, MotionError, NUM_AXES, ToolHead};
