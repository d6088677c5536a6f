// src/homing/mod.rs - Endstop homing and probing
pub mod homing_move;
pub mod rails;

pub use homing_move::{HomingMove, StepperPosition};
pub use rails::{HomeRailsHook, Homing};

use std::rc::Rc;

use thiserror::Error;

use crate::hardware::Endstop;
use crate::motion::{Coord, MotionError, ToolHead};

/// Delay between arming the endstops and starting the homing move.
pub const HOMING_START_DELAY: f64 = 0.001;
pub const ENDSTOP_SAMPLE_TIME: f64 = 0.000015;
pub const ENDSTOP_SAMPLE_COUNT: u32 = 4;

/// Settling time before and after the steppers are disabled.
const DISABLE_STALL_TIME: f64 = 0.100;

#[derive(Debug, Error)]
pub enum HomingError {
    #[error("No trigger on {0} after full movement")]
    NoTrigger(String),
    #[error("{0} triggered prior to movement")]
    TriggeredPriorToMovement(String),
    #[error("Endstop {0} still triggered after retract")]
    StillTriggered(String),
    #[error("Communication timeout during homing {0}")]
    CommunicationTimeout(String),
    #[error("{0}")]
    Shutdown(String),
    #[error("Invalid homing axis {0}")]
    InvalidAxis(usize),
    #[error(transparent)]
    Motion(#[from] MotionError),
}

/// Entry points for homing axes and probing.
#[derive(Default)]
pub struct PrinterHoming {
    hooks: Vec<Rc<dyn HomeRailsHook>>,
}

impl PrinterHoming {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer run at the end of every `home_rails`.
    pub fn register_hook(&mut self, hook: Rc<dyn HomeRailsHook>) {
        self.hooks.push(hook);
    }

    /// Home the given axes (0 = x, 1 = y, 2 = z); an empty list homes all three.
    pub async fn home_axes(&self, toolhead: &mut ToolHead, axes: &[usize]) -> Result<(), HomingError> {
        let axes = if axes.is_empty() { vec![0, 1, 2] } else { axes.to_vec() };
        if let Some(&axis) = axes.iter().find(|&&axis| axis >= 3) {
            return Err(HomingError::InvalidAxis(axis));
        }
        tracing::info!("Homing axes {:?}", axes);
        let kin = toolhead.kinematics();
        let result = {
            let mut homing = Homing::new(toolhead);
            homing.set_axes(axes);
            for hook in &self.hooks {
                homing.add_hook(hook.clone());
            }
            kin.home(&mut homing).await
        };
        if let Err(err) = result {
            if toolhead.is_shutdown() {
                return Err(HomingError::Shutdown("Homing failed due to printer shutdown".to_string()));
            }
            tracing::error!("Homing failed: {}", err);
            motor_off(toolhead).await;
            return Err(err);
        }
        tracing::info!("Homed axes: {}", kin.homed_axes());
        Ok(())
    }

    /// Single homing move against explicit endstops, without rail bookkeeping.
    pub async fn manual_home(
        &self,
        toolhead: &mut ToolHead,
        endstops: Vec<(Rc<dyn Endstop>, String)>,
        pos: &Coord,
        speed: f64,
        triggered: bool,
        check_triggered: bool,
    ) -> Result<Coord, HomingError> {
        let mut hmove = HomingMove::new(endstops);
        match hmove
            .homing_move(toolhead, pos, speed, false, triggered, check_triggered)
            .await
        {
            Err(_) if toolhead.is_shutdown() => {
                Err(HomingError::Shutdown("Homing failed due to printer shutdown".to_string()))
            }
            other => other,
        }
    }

    /// Move toward `pos` until `probe` triggers. Returns the toolhead
    /// position at the trigger.
    pub async fn probing_move(
        &self,
        toolhead: &mut ToolHead,
        probe: Rc<dyn Endstop>,
        pos: &Coord,
        speed: f64,
    ) -> Result<Coord, HomingError> {
        let mut hmove = HomingMove::new(vec![(probe, "probe".to_string())]);
        let epos = match hmove.homing_move(toolhead, pos, speed, true, true, true).await {
            Ok(epos) => epos,
            Err(_) if toolhead.is_shutdown() => {
                return Err(HomingError::Shutdown("Probing failed due to printer shutdown".to_string()));
            }
            Err(err) => return Err(err),
        };
        if hmove.check_no_movement().is_some() {
            return Err(HomingError::TriggeredPriorToMovement("Probe".to_string()));
        }
        tracing::info!("Probe triggered at {:.6},{:.6},{:.6}", epos[0], epos[1], epos[2]);
        Ok(epos)
    }
}

/// De-energise every stepper after a failed homing attempt.
async fn motor_off(toolhead: &mut ToolHead) {
    if toolhead.dwell(DISABLE_STALL_TIME).await.is_err() {
        tracing::warn!("Unable to settle toolhead before disabling steppers");
    }
    toolhead.kinematics().motor_off();
    for ea in toolhead.extra_axes() {
        for stepper in ea.steppers() {
            stepper.motor_enable(false);
        }
    }
    tracing::info!("Steppers disabled");
}
