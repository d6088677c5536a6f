// src/hardware/rail.rs - A kinematic rail: steppers, endstops and homing setup
use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use super::{Endstop, Stepper};
use crate::config::{ConfigError, RailConfig};

/// Homing parameters of a rail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HomingInfo {
    pub speed: f64,
    pub position_endstop: f64,
    pub retract_speed: f64,
    pub retract_dist: f64,
    pub positive_dir: bool,
    pub second_homing_speed: f64,
}

impl HomingInfo {
    pub fn from_config(name: &str, cfg: &RailConfig) -> Result<Self, ConfigError> {
        let positive_dir = match cfg.homing_positive_dir {
            Some(dir) => dir,
            None => {
                let axis_len = cfg.position_max - cfg.position_min;
                if cfg.position_endstop <= cfg.position_min + axis_len / 4.0 {
                    false
                } else if cfg.position_endstop >= cfg.position_max - axis_len / 4.0 {
                    true
                } else {
                    return Err(ConfigError::Invalid(format!(
                        "Unable to infer homing_positive_dir for rail '{}'",
                        name
                    )));
                }
            }
        };
        Ok(Self {
            speed: cfg.homing_speed,
            position_endstop: cfg.position_endstop,
            retract_speed: cfg.homing_retract_speed.unwrap_or(cfg.homing_speed),
            retract_dist: cfg.homing_retract_dist,
            positive_dir,
            second_homing_speed: cfg.second_homing_speed.unwrap_or(cfg.homing_speed / 2.0),
        })
    }
}

#[derive(Clone)]
pub struct Rail {
    name: String,
    steppers: Vec<Rc<dyn Stepper>>,
    endstops: Vec<(Rc<dyn Endstop>, String)>,
    homing_info: HomingInfo,
    position_min: f64,
    position_max: f64,
}

impl fmt::Debug for Rail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rail")
            .field("name", &self.name)
            .field("steppers", &self.steppers.iter().map(|s| s.name().to_string()).collect::<Vec<_>>())
            .field("endstops", &self.endstops.iter().map(|(_, n)| n.clone()).collect::<Vec<_>>())
            .field("homing_info", &self.homing_info)
            .field("range", &(self.position_min, self.position_max))
            .finish()
    }
}

impl Rail {
    pub fn new(
        name: &str,
        steppers: Vec<Rc<dyn Stepper>>,
        endstops: Vec<(Rc<dyn Endstop>, String)>,
        homing_info: HomingInfo,
        range: (f64, f64),
    ) -> Self {
        Self {
            name: name.to_string(),
            steppers,
            endstops,
            homing_info,
            position_min: range.0,
            position_max: range.1,
        }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_steppers(&self) -> &[Rc<dyn Stepper>] {
        &self.steppers
    }

    pub fn get_endstops(&self) -> &[(Rc<dyn Endstop>, String)] {
        &self.endstops
    }

    pub fn get_homing_info(&self) -> HomingInfo {
        self.homing_info
    }

    pub fn get_range(&self) -> (f64, f64) {
        (self.position_min, self.position_max)
    }

    pub fn set_position(&self, coord: &[f64; 3]) {
        for stepper in &self.steppers {
            stepper.set_position(coord);
        }
    }

    pub fn motor_enable(&self, enable: bool) {
        for stepper in &self.steppers {
            stepper.motor_enable(enable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_homing_direction_inferred() {
        let cfg = RailConfig::default();
        let hi = HomingInfo::from_config("x", &cfg).unwrap();
        assert!(!hi.positive_dir);
        assert_eq!(hi.retract_speed, cfg.homing_speed);
        assert_eq!(hi.second_homing_speed, cfg.homing_speed / 2.0);

        let cfg = RailConfig {
            position_endstop: 200.0,
            ..RailConfig::default()
        };
        assert!(HomingInfo::from_config("x", &cfg).unwrap().positive_dir);
    }

    #[test]
    fn test_homing_direction_ambiguous() {
        let cfg = RailConfig {
            position_endstop: 100.0,
            ..RailConfig::default()
        };
        assert!(matches!(
            HomingInfo::from_config("x", &cfg),
            Err(ConfigError::Invalid(_))
        ));
        let cfg = RailConfig {
            position_endstop: 100.0,
            homing_positive_dir: Some(true),
            ..RailConfig::default()
        };
        assert!(HomingInfo::from_config("x", &cfg).unwrap().positive_dir);
    }
}
