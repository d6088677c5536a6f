// src/simulator/stepper.rs - Simulated stepper with a physical position
use std::cell::Cell;

use crate::hardware::{AxisMapping, McuError, Stepper};
use crate::trapq::SharedTrapQ;

/// A stepper that follows its trapezoid queue until an endstop halts it.
///
/// Two offsets relate the host's view to the physical axis: `offset` maps
/// the commanded position to the step counter, `motion_offset` maps queued
/// trapq coordinates to the physical position. They only differ after a
/// homing halt until the next `set_position`.
#[derive(Debug)]
pub struct SimStepper {
    name: String,
    mapping: AxisMapping,
    step_dist: f64,
    trapq: SharedTrapQ,
    commanded: Cell<f64>,
    offset: Cell<f64>,
    motion_offset: Cell<f64>,
    halt_time: Cell<Option<f64>>,
    enabled: Cell<bool>,
}

impl SimStepper {
    /// `start` is the physical axis position at power on; the commanded
    /// position starts at zero.
    pub fn new(name: &str, mapping: AxisMapping, step_dist: f64, trapq: SharedTrapQ, start: f64) -> Self {
        Self {
            name: name.to_string(),
            mapping,
            step_dist,
            trapq,
            commanded: Cell::new(0.0),
            offset: Cell::new(start),
            motion_offset: Cell::new(start),
            halt_time: Cell::new(None),
            enabled: Cell::new(false),
        }
    }

    pub fn mapping(&self) -> AxisMapping {
        self.mapping
    }

    pub fn trapq(&self) -> SharedTrapQ {
        self.trapq.clone()
    }

    /// Physical axis position of a trapq coordinate.
    pub fn physical_from_coord(&self, coord: &[f64; 3]) -> f64 {
        self.mapping.position(coord) + self.motion_offset.get()
    }

    /// Physical axis position at `print_time`.
    pub fn physical_position(&self, print_time: f64) -> f64 {
        let t = match self.halt_time.get() {
            Some(halt) => print_time.min(halt),
            None => print_time,
        };
        match self.trapq.borrow().position_at(t) {
            Some(coord) => self.physical_from_coord(&coord),
            None => self.commanded.get() + self.offset.get(),
        }
    }

    /// Stop following the queue from `print_time` on.
    pub fn halt_at(&self, print_time: f64) {
        if self.halt_time.get().is_none() {
            tracing::debug!("{} halted at {:.6}", self.name, print_time);
            self.halt_time.set(Some(print_time));
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halt_time.get().is_some()
    }

    fn steps(&self, pos: f64) -> i64 {
        (pos / self.step_dist).round() as i64
    }
}

impl Stepper for SimStepper {
    fn name(&self) -> &str {
        &self.name
    }

    fn step_dist(&self) -> f64 {
        self.step_dist
    }

    fn calc_position_from_coord(&self, coord: &[f64; 3]) -> f64 {
        self.mapping.position(coord)
    }

    fn commanded_position(&self) -> f64 {
        self.commanded.get()
    }

    fn mcu_position_for(&self, cmd_pos: f64) -> i64 {
        self.steps(cmd_pos + self.offset.get())
    }

    fn past_mcu_position(&self, print_time: f64) -> i64 {
        self.steps(self.physical_position(print_time))
    }

    fn mcu_to_commanded_position(&self, mcu_pos: i64) -> f64 {
        mcu_pos as f64 * self.step_dist - self.offset.get()
    }

    fn set_position(&self, coord: &[f64; 3]) {
        let counter_pos = self.commanded.get() + self.offset.get();
        let new_cmd = self.mapping.position(coord);
        self.offset.set(counter_pos - new_cmd);
        self.motion_offset.set(counter_pos - new_cmd);
        self.commanded.set(new_cmd);
        self.halt_time.set(None);
    }

    fn generate_steps(&self, flush_time: f64) -> Result<(), McuError> {
        if self.is_halted() {
            return Ok(());
        }
        let Some(coord) = self.trapq.borrow().position_at(flush_time) else {
            return Ok(());
        };
        let new_cmd = self.mapping.position(&coord);
        if new_cmd != self.commanded.get() {
            self.enabled.set(true);
            self.commanded.set(new_cmd);
        }
        Ok(())
    }

    fn note_homing_end(&self) {
        if let Some(halt) = self.halt_time.get() {
            // Resync the step counter with where the MCU actually stopped
            let halted = self.physical_position(halt);
            self.offset.set(halted - self.commanded.get());
        }
    }

    fn motor_enable(&self, enable: bool) {
        self.enabled.set(enable);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.get()
    }
}
