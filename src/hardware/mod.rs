// src/hardware/mod.rs - Collaborator interfaces for MCU, steppers and endstops
pub mod rail;

pub use rail::{HomingInfo, Rail};

use std::rc::Rc;

use async_trait::async_trait;
use thiserror::Error;

use crate::homing::HomingError;
use crate::scheduler::Completion;
use crate::trapq::SharedTrapQ;

/// Failures reported by the MCU side of the pipeline.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum McuError {
    #[error("MCU '{mcu}' shutdown: {reason}")]
    Shutdown { mcu: String, reason: String },
    #[error("Timer too close")]
    TimerTooClose,
    #[error("Communication timeout with MCU '{0}'")]
    Timeout(String),
    #[error("Step generation failed for '{stepper}': {reason}")]
    StepGeneration { stepper: String, reason: String },
}

/// The print-time clock and move transport of a microcontroller.
pub trait Mcu {
    fn name(&self) -> &str;

    /// Print time the MCU has reached at host time `eventtime`.
    fn estimated_print_time(&self, eventtime: f64) -> f64;

    /// Transmit everything generated up to `flush_time`.
    fn flush_moves(&self, flush_time: f64, clear_history_time: f64) -> Result<(), McuError>;
}

/// Linear map from toolhead coordinates to a stepper's axis position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AxisMapping {
    Axis(usize),
    Sum(usize, usize),
    Difference(usize, usize),
}

impl AxisMapping {
    pub fn position(&self, coord: &[f64; 3]) -> f64 {
        match *self {
            AxisMapping::Axis(a) => coord[a],
            AxisMapping::Sum(a, b) => coord[a] + coord[b],
            AxisMapping::Difference(a, b) => coord[a] - coord[b],
        }
    }
}

/// A stepper motor as seen by the host.
///
/// The commanded position is the host's idea of where the stepper is in axis
/// units. The MCU position is the step counter on the microcontroller; the
/// two are related by a per-stepper offset that homing adjusts.
pub trait Stepper {
    fn name(&self) -> &str;
    fn step_dist(&self) -> f64;
    fn calc_position_from_coord(&self, coord: &[f64; 3]) -> f64;
    fn commanded_position(&self) -> f64;

    /// Step counter value corresponding to commanded position `cmd_pos`.
    fn mcu_position_for(&self, cmd_pos: f64) -> i64;

    fn mcu_position(&self) -> i64 {
        self.mcu_position_for(self.commanded_position())
    }

    /// Step counter value at a past print time.
    fn past_mcu_position(&self, print_time: f64) -> i64;
    fn mcu_to_commanded_position(&self, mcu_pos: i64) -> f64;

    /// Set the commanded position from a toolhead coordinate, keeping the
    /// step counter unchanged.
    fn set_position(&self, coord: &[f64; 3]);

    /// Generate steps for all queued motion up to `flush_time`.
    fn generate_steps(&self, flush_time: f64) -> Result<(), McuError>;

    /// Resynchronise after the MCU halted this stepper during homing.
    fn note_homing_end(&self);

    fn motor_enable(&self, enable: bool);
    fn is_enabled(&self) -> bool;
}

/// An endstop or probe that can halt its steppers when triggered.
#[async_trait(?Send)]
pub trait Endstop {
    fn name(&self) -> &str;
    fn get_steppers(&self) -> Vec<Rc<dyn Stepper>>;

    /// Arm the endstop. The returned completion finishes when the endstop
    /// triggers or the homing attempt otherwise ends.
    fn home_start(
        &self,
        print_time: f64,
        sample_time: f64,
        sample_count: u32,
        rest_time: f64,
        triggered: bool,
    ) -> Completion;

    /// Disarm the endstop once motion up to `home_end_time` is done. Returns
    /// the trigger print time, or 0.0 if it never triggered.
    async fn home_wait(&self, home_end_time: f64) -> Result<f64, HomingError>;

    fn query_endstop(&self, print_time: f64) -> bool;
}

/// How a rail's endstop is described to a hardware backend.
#[derive(Debug, Clone, PartialEq)]
pub struct EndstopSpec {
    pub name: String,
    /// Stepper names and weights whose weighted sum is the sensed position.
    pub sensed: Vec<(String, f64)>,
    pub position_endstop: f64,
    pub positive_dir: bool,
}

/// Creates concrete steppers and endstops for the kinematics at startup.
pub trait HardwareFactory {
    fn stepper(&self, name: &str, mapping: AxisMapping, step_dist: f64, trapq: SharedTrapQ) -> Rc<dyn Stepper>;
    fn endstop(&self, spec: &EndstopSpec, steppers: Vec<Rc<dyn Stepper>>) -> Rc<dyn Endstop>;
}
