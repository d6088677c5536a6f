// src/motion/extruder.rs - Extra (non-kinematic) axes and the extruder
use std::f64::consts::PI;
use std::rc::Rc;

use super::MotionError;
use super::moves::Move;
use crate::config::ExtruderConfig;
use crate::hardware::Stepper;
use crate::trapq::{SharedTrapQ, TrapProfile};

/// An axis moved alongside the toolhead that is not part of the kinematics.
///
/// `ea_index` is the axis' index into the toolhead coordinate.
pub trait ExtraAxis {
    fn name(&self) -> &str;

    /// Validate a move and tighten its limits for this axis.
    fn check_move(&self, mv: &mut Move, ea_index: usize) -> Result<(), MotionError>;

    /// Maximum squared junction velocity this axis allows between two moves.
    fn calc_junction(&self, prev_move: &Move, mv: &Move, ea_index: usize) -> f64;

    /// Queue the axis motion of a committed move starting at `print_time`.
    fn process_move(&mut self, print_time: f64, mv: &Move, ea_index: usize);

    fn set_position(&mut self, pos: f64, print_time: f64);

    fn trapq(&self) -> Option<SharedTrapQ> {
        None
    }

    fn steppers(&self) -> Vec<Rc<dyn Stepper>> {
        Vec::new()
    }
}

/// Filament extruder driven as extra axis `e`.
pub struct Extruder {
    name: String,
    trapq: SharedTrapQ,
    stepper: Option<Rc<dyn Stepper>>,
    nozzle_diameter: f64,
    filament_area: f64,
    max_extrude_ratio: f64,
    max_e_velocity: f64,
    max_e_accel: f64,
    max_e_dist: f64,
    instant_corner_v: f64,
    last_position: f64,
}

impl Extruder {
    pub fn new(
        name: &str,
        cfg: &ExtruderConfig,
        max_velocity: f64,
        max_accel: f64,
        trapq: SharedTrapQ,
        stepper: Option<Rc<dyn Stepper>>,
    ) -> Self {
        let filament_area = PI * (cfg.filament_diameter * 0.5).powi(2);
        let def_max_cross_section = 4.0 * cfg.nozzle_diameter * cfg.nozzle_diameter;
        let def_max_extrude_ratio = def_max_cross_section / filament_area;
        let max_cross_section = cfg.max_extrude_cross_section.unwrap_or(def_max_cross_section);
        Self {
            name: name.to_string(),
            trapq,
            stepper,
            nozzle_diameter: cfg.nozzle_diameter,
            filament_area,
            max_extrude_ratio: max_cross_section / filament_area,
            max_e_velocity: cfg
                .max_extrude_only_velocity
                .unwrap_or(max_velocity * def_max_extrude_ratio),
            max_e_accel: cfg.max_extrude_only_accel.unwrap_or(max_accel * def_max_extrude_ratio),
            max_e_dist: cfg.max_extrude_only_distance,
            instant_corner_v: cfg.instantaneous_corner_velocity,
            last_position: 0.0,
        }
    }

    pub fn last_position(&self) -> f64 {
        self.last_position
    }

    pub fn max_extrude_ratio(&self) -> f64 {
        self.max_extrude_ratio
    }
}

impl ExtraAxis for Extruder {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_move(&self, mv: &mut Move, ea_index: usize) -> Result<(), MotionError> {
        let axis_r = mv.axes_r[ea_index];
        if (mv.axes_d[0] == 0.0 && mv.axes_d[1] == 0.0) || axis_r < 0.0 {
            // Extrude only move or retraction
            if mv.axes_d[ea_index].abs() > self.max_e_dist {
                return Err(MotionError::Extrude(format!(
                    "Extrude only move too long ({:.3}mm vs {:.3}mm)\n\
                     See the 'max_extrude_only_distance' config option for details",
                    mv.axes_d[ea_index], self.max_e_dist
                )));
            }
            let inv_extrude_r = 1.0 / axis_r.abs();
            mv.limit_speed(self.max_e_velocity * inv_extrude_r, self.max_e_accel * inv_extrude_r);
        } else if axis_r > self.max_extrude_ratio {
            if mv.axes_d[ea_index] <= self.nozzle_diameter * self.max_extrude_ratio {
                // Tiny extrusions are always allowed
                return Ok(());
            }
            let area = axis_r * self.filament_area;
            tracing::debug!(
                "Overextrude: {} vs {} (area={:.3} dist={:.3})",
                axis_r,
                self.max_extrude_ratio,
                area,
                mv.move_d
            );
            return Err(MotionError::Extrude(format!(
                "Move exceeds maximum extrusion ({:.3}mm^2 vs {:.3}mm^2)\n\
                 See the 'max_extrude_cross_section' config option for details",
                area,
                self.max_extrude_ratio * self.filament_area
            )));
        }
        Ok(())
    }

    fn calc_junction(&self, prev_move: &Move, mv: &Move, ea_index: usize) -> f64 {
        let diff_r = mv.axes_r[ea_index] - prev_move.axes_r[ea_index];
        if diff_r != 0.0 {
            return (self.instant_corner_v / diff_r.abs()).powi(2);
        }
        mv.max_cruise_v2
    }

    fn process_move(&mut self, print_time: f64, mv: &Move, ea_index: usize) {
        let axis_r = mv.axes_r[ea_index];
        let profile = TrapProfile {
            accel_t: mv.accel_t,
            cruise_t: mv.cruise_t,
            decel_t: mv.decel_t,
            start_v: mv.start_v * axis_r,
            cruise_v: mv.cruise_v * axis_r,
            accel: mv.accel * axis_r,
        };
        // Pressure advance is flagged on the y coordinate for printing moves
        let can_pressure_advance = axis_r > 0.0 && (mv.axes_d[0] != 0.0 || mv.axes_d[1] != 0.0);
        let flag = if can_pressure_advance { 1.0 } else { 0.0 };
        self.trapq
            .borrow_mut()
            .append(print_time, [mv.start_pos[ea_index], 0.0, 0.0], [1.0, flag, 0.0], &profile);
        self.last_position = mv.end_pos[ea_index];
    }

    fn set_position(&mut self, pos: f64, print_time: f64) {
        self.trapq.borrow_mut().set_position(print_time, [pos, 0.0, 0.0]);
        if let Some(stepper) = &self.stepper {
            stepper.set_position(&[pos, 0.0, 0.0]);
        }
        self.last_position = pos;
    }

    fn trapq(&self) -> Option<SharedTrapQ> {
        Some(self.trapq.clone())
    }

    fn steppers(&self) -> Vec<Rc<dyn Stepper>> {
        self.stepper.iter().cloned().collect()
    }
}
