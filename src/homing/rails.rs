// src/homing/rails.rs - Per-request homing state and the rail homing sequence
use std::array;
use std::collections::HashMap;
use std::rc::Rc;

use super::{HomingError, HomingMove};
use crate::hardware::Rail;
use crate::motion::{Coord, NUM_AXES, ToolHead};

/// Observer run after the rails of a `home_rails` call are homed. It may
/// call [`Homing::set_stepper_adjustment`] to refine the homed position.
pub trait HomeRailsHook {
    fn home_rails_end(&self, homing: &mut Homing<'_>, rails: &[Rail]);
}

/// State of one homing request, borrowed by the kinematics while it homes.
pub struct Homing<'a> {
    toolhead: &'a mut ToolHead,
    changed_axes: Vec<usize>,
    trigger_mcu_pos: HashMap<String, i64>,
    adjust_pos: HashMap<String, f64>,
    hooks: Vec<Rc<dyn HomeRailsHook>>,
}

impl<'a> Homing<'a> {
    pub fn new(toolhead: &'a mut ToolHead) -> Self {
        Self {
            toolhead,
            changed_axes: Vec::new(),
            trigger_mcu_pos: HashMap::new(),
            adjust_pos: HashMap::new(),
            hooks: Vec::new(),
        }
    }

    pub fn add_hook(&mut self, hook: Rc<dyn HomeRailsHook>) {
        self.hooks.push(hook);
    }

    pub fn set_axes(&mut self, axes: Vec<usize>) {
        self.changed_axes = axes;
    }

    pub fn get_axes(&self) -> &[usize] {
        &self.changed_axes
    }

    pub fn toolhead(&mut self) -> &mut ToolHead {
        self.toolhead
    }

    /// Step counter of `stepper_name` when its endstop triggered on the last pass.
    pub fn get_trigger_position(&self, stepper_name: &str) -> Option<i64> {
        self.trigger_mcu_pos.get(stepper_name).copied()
    }

    /// Shift the homed position of a stepper by `adjustment` (axis units).
    pub fn set_stepper_adjustment(&mut self, stepper_name: &str, adjustment: f64) {
        self.adjust_pos.insert(stepper_name.to_string(), adjustment);
    }

    fn fill_coord(&self, coord: &[Option<f64>; NUM_AXES]) -> Coord {
        let mut thcoord = self.toolhead.get_position();
        for (pos, c) in thcoord.iter_mut().zip(coord.iter()) {
            if let Some(c) = c {
                *pos = *c;
            }
        }
        thcoord
    }

    pub fn set_homed_position(&mut self, pos: &[Option<f64>; NUM_AXES]) -> Result<(), HomingError> {
        let newpos = self.fill_coord(pos);
        self.toolhead.set_position(&newpos, &[])?;
        Ok(())
    }

    /// Home `rails` together: pretend the toolhead is at `forcepos`, move to
    /// `movepos` until the endstops trigger, then optionally retract and
    /// repeat at the slower second homing speed.
    pub async fn home_rails(
        &mut self,
        rails: &[Rail],
        forcepos: [Option<f64>; NUM_AXES],
        movepos: [Option<f64>; NUM_AXES],
    ) -> Result<(), HomingError> {
        let Some(first) = rails.first() else {
            return Ok(());
        };
        let names: Vec<&str> = rails.iter().map(|r| r.get_name()).collect();
        tracing::info!("Homing rails {:?}", names);
        // Alter kinematics to think the toolhead is at forcepos
        let force_axes: Vec<usize> = (0..3).filter(|&axis| forcepos[axis].is_some()).collect();
        let startpos = self.fill_coord(&forcepos);
        let homepos = self.fill_coord(&movepos);
        self.toolhead.set_position(&startpos, &force_axes)?;
        // First home
        let endstops: Vec<_> = rails.iter().flat_map(|r| r.get_endstops().iter().cloned()).collect();
        let hi = first.get_homing_info();
        let mut hmove = HomingMove::new(endstops.clone());
        hmove
            .homing_move(self.toolhead, &homepos, hi.speed, false, true, true)
            .await?;
        // Second home
        if hi.retract_dist > 0.0 {
            let startpos = self.fill_coord(&forcepos);
            let homepos = self.fill_coord(&movepos);
            let axes_d: Coord = array::from_fn(|i| homepos[i] - startpos[i]);
            let move_d = axes_d[..3].iter().map(|d| d * d).sum::<f64>().sqrt();
            let retract_r = (hi.retract_dist / move_d).min(1.0);
            let retractpos: Coord = array::from_fn(|i| homepos[i] - axes_d[i] * retract_r);
            self.toolhead.move_to(&retractpos, hi.retract_speed).await?;
            let startpos: Coord = array::from_fn(|i| retractpos[i] - axes_d[i] * retract_r);
            self.toolhead.set_position(&startpos, &[])?;
            hmove = HomingMove::new(endstops);
            hmove
                .homing_move(self.toolhead, &homepos, hi.second_homing_speed, false, true, true)
                .await?;
            if let Some(name) = hmove.check_no_movement() {
                return Err(HomingError::StillTriggered(name));
            }
        }
        self.toolhead.flush_step_generation()?;
        self.trigger_mcu_pos = hmove
            .stepper_positions()
            .iter()
            .map(|sp| (sp.stepper_name.clone(), sp.trig_pos))
            .collect();
        self.adjust_pos.clear();
        for hook in self.hooks.clone() {
            hook.home_rails_end(self, rails);
        }
        if self.adjust_pos.values().any(|adj| *adj != 0.0) {
            // Apply homing offsets
            let kin = self.toolhead.kinematics();
            let mut homepos = self.toolhead.get_position();
            let kin_spos: HashMap<String, f64> = kin
                .get_steppers()
                .iter()
                .map(|s| {
                    let adj = self.adjust_pos.get(s.name()).copied().unwrap_or(0.0);
                    (s.name().to_string(), s.commanded_position() + adj)
                })
                .collect();
            let newpos = kin.calc_position(&kin_spos);
            for &axis in &force_axes {
                homepos[axis] = newpos[axis];
            }
            tracing::debug!("Applying homing adjustments {:?}", self.adjust_pos);
            self.toolhead.set_position(&homepos, &[])?;
        }
        Ok(())
    }
}
