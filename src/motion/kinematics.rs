// src/motion/kinematics.rs
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::str::FromStr;

use async_trait::async_trait;

use super::MotionError;
use super::moves::Move;
use crate::config::{Config, ConfigError, RAIL_NAMES};
use crate::hardware::{AxisMapping, EndstopSpec, HardwareFactory, HomingInfo, Rail, Stepper};
use crate::homing::{Homing, HomingError};
use crate::trapq::SharedTrapQ;

/// Different types of printer kinematics
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KinematicsType {
    Cartesian,
    CoreXY,
}

impl FromStr for KinematicsType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cartesian" => Ok(KinematicsType::Cartesian),
            "corexy" => Ok(KinematicsType::CoreXY),
            other => Err(ConfigError::Invalid(format!("Unknown kinematics '{}'", other))),
        }
    }
}

/// Geometry between toolhead coordinates and the steppers.
///
/// Implementations keep their mutable state (homed limits) behind `Cell` /
/// `RefCell` so the toolhead and homing can share them through an `Rc`.
#[async_trait(?Send)]
pub trait Kinematics {
    fn kinematics_type(&self) -> KinematicsType;
    fn get_steppers(&self) -> Vec<Rc<dyn Stepper>>;
    fn get_rails(&self) -> &[Rail];

    /// Toolhead position from stepper commanded positions keyed by stepper name.
    fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> [f64; 3];

    fn set_position(&self, newpos: &[f64; 3], homing_axes: &[usize]);
    fn clear_homing_state(&self, axes: &[usize]);

    /// Reject out-of-range or unhomed moves and apply axis speed limits.
    fn check_move(&self, mv: &mut Move) -> Result<(), MotionError>;

    /// Homed axes as a string such as "xz".
    fn homed_axes(&self) -> String;
    fn axis_limits(&self) -> [(f64, f64); 3];

    /// De-energise every stepper and forget the homed state.
    fn motor_off(&self);

    fn update_limits(&self, max_z_velocity: f64, max_z_accel: f64);

    async fn home(&self, homing: &mut Homing<'_>) -> Result<(), HomingError>;
}

/// Rails plus the homed travel limits shared by the cartesian style kinematics.
#[derive(Debug)]
struct AxisRails {
    rails: Vec<Rail>,
    limits: RefCell<[(f64, f64); 3]>,
    max_z_velocity: Cell<f64>,
    max_z_accel: Cell<f64>,
}

const UNHOMED: (f64, f64) = (1.0, -1.0);

impl AxisRails {
    fn new(rails: Vec<Rail>, max_z_velocity: f64, max_z_accel: f64) -> Self {
        Self {
            rails,
            limits: RefCell::new([UNHOMED; 3]),
            max_z_velocity: Cell::new(max_z_velocity),
            max_z_accel: Cell::new(max_z_accel),
        }
    }

    fn steppers(&self) -> Vec<Rc<dyn Stepper>> {
        self.rails.iter().flat_map(|r| r.get_steppers().iter().cloned()).collect()
    }

    fn set_position(&self, newpos: &[f64; 3], homing_axes: &[usize]) {
        let mut limits = self.limits.borrow_mut();
        for (i, rail) in self.rails.iter().enumerate() {
            rail.set_position(newpos);
            if homing_axes.contains(&i) {
                limits[i] = rail.get_range();
            }
        }
    }

    fn clear_homing_state(&self, axes: &[usize]) {
        let mut limits = self.limits.borrow_mut();
        for &axis in axes {
            if axis < 3 {
                limits[axis] = UNHOMED;
            }
        }
    }

    fn check_endstops(&self, mv: &Move) -> Result<(), MotionError> {
        let limits = self.limits.borrow();
        for i in 0..3 {
            if mv.axes_d[i] != 0.0 && (mv.end_pos[i] < limits[i].0 || mv.end_pos[i] > limits[i].1) {
                if limits[i].0 > limits[i].1 {
                    return Err(mv.unhomed_error());
                }
                return Err(mv.move_error("Move out of range"));
            }
        }
        Ok(())
    }

    fn check_move(&self, mv: &mut Move) -> Result<(), MotionError> {
        let (xpos, ypos) = (mv.end_pos[0], mv.end_pos[1]);
        let out_of_xy = {
            let limits = self.limits.borrow();
            xpos < limits[0].0 || xpos > limits[0].1 || ypos < limits[1].0 || ypos > limits[1].1
        };
        if out_of_xy {
            self.check_endstops(mv)?;
        }
        if mv.axes_d[2] == 0.0 {
            // Normal XY move
            return Ok(());
        }
        // Moves with Z are limited by the slower Z axis
        self.check_endstops(mv)?;
        let z_ratio = mv.move_d / mv.axes_d[2].abs();
        mv.limit_speed(self.max_z_velocity.get() * z_ratio, self.max_z_accel.get() * z_ratio);
        Ok(())
    }

    fn homed_axes(&self) -> String {
        let limits = self.limits.borrow();
        RAIL_NAMES
            .iter()
            .zip(limits.iter())
            .filter(|(_, l)| l.0 <= l.1)
            .map(|(name, _)| *name)
            .collect()
    }

    fn motor_off(&self) {
        for rail in &self.rails {
            rail.motor_enable(false);
        }
        *self.limits.borrow_mut() = [UNHOMED; 3];
    }

    async fn home_axis(&self, homing: &mut Homing<'_>, axis: usize) -> Result<(), HomingError> {
        let rail = self.rails.get(axis).ok_or(HomingError::InvalidAxis(axis))?;
        let (position_min, position_max) = rail.get_range();
        let hi = rail.get_homing_info();
        let mut homepos = [None; 4];
        homepos[axis] = Some(hi.position_endstop);
        let mut forcepos = homepos;
        forcepos[axis] = Some(if hi.positive_dir {
            hi.position_endstop - 1.5 * (hi.position_endstop - position_min)
        } else {
            hi.position_endstop + 1.5 * (position_max - hi.position_endstop)
        });
        homing.home_rails(std::slice::from_ref(rail), forcepos, homepos).await
    }

    async fn home(&self, homing: &mut Homing<'_>) -> Result<(), HomingError> {
        // Each axis is homed independently and in order
        let axes = homing.get_axes().to_vec();
        for axis in axes {
            self.home_axis(homing, axis).await?;
        }
        Ok(())
    }
}

fn stepper_position(stepper_positions: &HashMap<String, f64>, name: &str) -> f64 {
    stepper_positions.get(name).copied().unwrap_or_default()
}

/// Cartesian kinematics (most common 3D printer type)
#[derive(Debug)]
pub struct CartesianKinematics {
    axes: AxisRails,
}

impl CartesianKinematics {
    pub fn new(rails: Vec<Rail>, max_z_velocity: f64, max_z_accel: f64) -> Self {
        Self {
            axes: AxisRails::new(rails, max_z_velocity, max_z_accel),
        }
    }
}

#[async_trait(?Send)]
impl Kinematics for CartesianKinematics {
    fn kinematics_type(&self) -> KinematicsType {
        KinematicsType::Cartesian
    }

    fn get_steppers(&self) -> Vec<Rc<dyn Stepper>> {
        self.axes.steppers()
    }

    fn get_rails(&self) -> &[Rail] {
        &self.axes.rails
    }

    fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> [f64; 3] {
        let mut pos = [0.0; 3];
        for (p, rail) in pos.iter_mut().zip(self.axes.rails.iter()) {
            if let Some(stepper) = rail.get_steppers().first() {
                *p = stepper_position(stepper_positions, stepper.name());
            }
        }
        pos
    }

    fn set_position(&self, newpos: &[f64; 3], homing_axes: &[usize]) {
        self.axes.set_position(newpos, homing_axes);
    }

    fn clear_homing_state(&self, axes: &[usize]) {
        self.axes.clear_homing_state(axes);
    }

    fn check_move(&self, mv: &mut Move) -> Result<(), MotionError> {
        self.axes.check_move(mv)
    }

    fn homed_axes(&self) -> String {
        self.axes.homed_axes()
    }

    fn axis_limits(&self) -> [(f64, f64); 3] {
        *self.axes.limits.borrow()
    }

    fn motor_off(&self) {
        self.axes.motor_off();
    }

    fn update_limits(&self, max_z_velocity: f64, max_z_accel: f64) {
        self.axes.max_z_velocity.set(max_z_velocity);
        self.axes.max_z_accel.set(max_z_accel);
    }

    async fn home(&self, homing: &mut Homing<'_>) -> Result<(), HomingError> {
        self.axes.home(homing).await
    }
}

/// CoreXY kinematics
///
/// Motor A = X + Y, motor B = X - Y, Z is direct.
#[derive(Debug)]
pub struct CoreXYKinematics {
    axes: AxisRails,
}

impl CoreXYKinematics {
    pub fn new(rails: Vec<Rail>, max_z_velocity: f64, max_z_accel: f64) -> Self {
        Self {
            axes: AxisRails::new(rails, max_z_velocity, max_z_accel),
        }
    }

    fn rail_stepper_position(&self, stepper_positions: &HashMap<String, f64>, axis: usize) -> f64 {
        self.axes.rails[axis]
            .get_steppers()
            .first()
            .map(|s| stepper_position(stepper_positions, s.name()))
            .unwrap_or_default()
    }
}

#[async_trait(?Send)]
impl Kinematics for CoreXYKinematics {
    fn kinematics_type(&self) -> KinematicsType {
        KinematicsType::CoreXY
    }

    fn get_steppers(&self) -> Vec<Rc<dyn Stepper>> {
        self.axes.steppers()
    }

    fn get_rails(&self) -> &[Rail] {
        &self.axes.rails
    }

    fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> [f64; 3] {
        let a = self.rail_stepper_position(stepper_positions, 0);
        let b = self.rail_stepper_position(stepper_positions, 1);
        let z = self.rail_stepper_position(stepper_positions, 2);
        [0.5 * (a + b), 0.5 * (a - b), z]
    }

    fn set_position(&self, newpos: &[f64; 3], homing_axes: &[usize]) {
        self.axes.set_position(newpos, homing_axes);
    }

    fn clear_homing_state(&self, axes: &[usize]) {
        self.axes.clear_homing_state(axes);
    }

    fn check_move(&self, mv: &mut Move) -> Result<(), MotionError> {
        self.axes.check_move(mv)
    }

    fn homed_axes(&self) -> String {
        self.axes.homed_axes()
    }

    fn axis_limits(&self) -> [(f64, f64); 3] {
        *self.axes.limits.borrow()
    }

    fn motor_off(&self) {
        self.axes.motor_off();
    }

    fn update_limits(&self, max_z_velocity: f64, max_z_accel: f64) {
        self.axes.max_z_velocity.set(max_z_velocity);
        self.axes.max_z_accel.set(max_z_accel);
    }

    async fn home(&self, homing: &mut Homing<'_>) -> Result<(), HomingError> {
        self.axes.home(homing).await
    }
}

/// Stepper layout of one kinematics type: per axis, the stepper mapping and
/// the weighted stepper positions the axis endstop senses.
fn stepper_layout(kin_type: KinematicsType) -> [(AxisMapping, Vec<(usize, f64)>); 3] {
    match kin_type {
        KinematicsType::Cartesian => [
            (AxisMapping::Axis(0), vec![(0, 1.0)]),
            (AxisMapping::Axis(1), vec![(1, 1.0)]),
            (AxisMapping::Axis(2), vec![(2, 1.0)]),
        ],
        KinematicsType::CoreXY => [
            (AxisMapping::Sum(0, 1), vec![(0, 0.5), (1, 0.5)]),
            (AxisMapping::Difference(0, 1), vec![(0, 0.5), (1, -0.5)]),
            (AxisMapping::Axis(2), vec![(2, 1.0)]),
        ],
    }
}

/// Factory for creating kinematics handlers
pub fn create_kinematics(
    config: &Config,
    factory: &dyn HardwareFactory,
    trapq: &SharedTrapQ,
) -> Result<Rc<dyn Kinematics>, ConfigError> {
    let kin_type: KinematicsType = config.printer.kinematics.parse()?;
    let layout = stepper_layout(kin_type);

    let mut steppers: Vec<Rc<dyn Stepper>> = Vec::with_capacity(3);
    for (name, (mapping, _)) in RAIL_NAMES.iter().zip(layout.iter()) {
        let rail_cfg = config.rail(name)?;
        steppers.push(factory.stepper(
            &format!("stepper_{}", name),
            *mapping,
            rail_cfg.step_distance(),
            trapq.clone(),
        ));
    }

    let mut rails = Vec::with_capacity(3);
    for (axis, (name, (_, sensed))) in RAIL_NAMES.iter().zip(layout.iter()).enumerate() {
        let rail_cfg = config.rail(name)?;
        let homing_info = HomingInfo::from_config(name, rail_cfg)?;
        let endstop_steppers: Vec<Rc<dyn Stepper>> = sensed.iter().map(|(i, _)| steppers[*i].clone()).collect();
        let spec = EndstopSpec {
            name: name.to_string(),
            sensed: sensed
                .iter()
                .map(|(i, w)| (steppers[*i].name().to_string(), *w))
                .collect(),
            position_endstop: homing_info.position_endstop,
            positive_dir: homing_info.positive_dir,
        };
        let endstop = factory.endstop(&spec, endstop_steppers);
        rails.push(Rail::new(
            name,
            vec![steppers[axis].clone()],
            vec![(endstop, name.to_string())],
            homing_info,
            (rail_cfg.position_min, rail_cfg.position_max),
        ));
    }

    tracing::info!("Created {:?} kinematics", kin_type);
    let (max_z_velocity, max_z_accel) = (config.printer.max_z_velocity, config.printer.max_z_accel);
    Ok(match kin_type {
        KinematicsType::Cartesian => Rc::new(CartesianKinematics::new(rails, max_z_velocity, max_z_accel)),
        KinematicsType::CoreXY => Rc::new(CoreXYKinematics::new(rails, max_z_velocity, max_z_accel)),
    })
}
