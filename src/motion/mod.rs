// src/motion/mod.rs - Look-ahead planning and toolhead scheduling
pub mod extruder;
pub mod kinematics;
pub mod lookahead;
pub mod moves;
pub mod toolhead;

pub use extruder::{ExtraAxis, Extruder};
pub use kinematics::{Kinematics, KinematicsType, create_kinematics};
pub use lookahead::LookAheadQueue;
pub use moves::{Move, MoveLimits};
pub use toolhead::{QueuingState, ToolHead, ToolHeadStatus, VelocityLimits};

use thiserror::Error;

use crate::hardware::McuError;

/// Number of toolhead coordinates: x, y, z and one extra axis.
pub const NUM_AXES: usize = 4;

/// Toolhead coordinate. Indices 0..3 are kinematic, 3.. are extra axes.
pub type Coord = [f64; NUM_AXES];

#[derive(Debug, Error)]
pub enum MotionError {
    #[error("{0}")]
    OutOfRange(String),
    #[error("{0}")]
    Unhomed(String),
    #[error("{0}")]
    Extrude(String),
    #[error("Printer is shutdown: {0}")]
    Shutdown(String),
    #[error("MCU error: {0}")]
    Mcu(#[from] McuError),
    #[error("{0}")]
    Other(String),
}
