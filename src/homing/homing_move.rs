// src/homing/homing_move.rs - One endstop-bounded move and position reconciliation
use std::collections::HashMap;
use std::rc::Rc;

use super::{ENDSTOP_SAMPLE_COUNT, ENDSTOP_SAMPLE_TIME, HOMING_START_DELAY, HomingError};
use crate::hardware::{Endstop, Stepper};
use crate::motion::{Coord, Kinematics, ToolHead};
use crate::scheduler::Completion;

/// Step counter snapshot of one stepper watched by one endstop.
pub struct StepperPosition {
    stepper: Rc<dyn Stepper>,
    pub endstop_name: String,
    pub stepper_name: String,
    pub start_pos: i64,
    pub start_cmd_pos: f64,
    pub halt_pos: i64,
    pub trig_pos: i64,
}

impl StepperPosition {
    pub fn new(stepper: Rc<dyn Stepper>, endstop_name: &str) -> Self {
        let start_pos = stepper.mcu_position();
        Self {
            endstop_name: endstop_name.to_string(),
            stepper_name: stepper.name().to_string(),
            start_cmd_pos: stepper.mcu_to_commanded_position(start_pos),
            start_pos,
            halt_pos: start_pos,
            trig_pos: start_pos,
            stepper,
        }
    }

    pub fn note_home_end(&mut self, trigger_time: f64) {
        self.halt_pos = self.stepper.mcu_position();
        self.trig_pos = self.stepper.past_mcu_position(trigger_time);
    }

    /// After a probe has redeclared the toolhead position, map the start
    /// position back to a step count. Returns false and warns if it no longer
    /// lands on the step counter the move started from.
    pub fn verify_no_probe_skew(&self) -> bool {
        let new_start_pos = self.stepper.mcu_position_for(self.start_cmd_pos);
        if new_start_pos != self.start_pos {
            tracing::warn!(
                "Stepper '{}' position skew after probe: pos {} now {}",
                self.stepper_name,
                self.start_pos,
                new_start_pos
            );
            return false;
        }
        true
    }
}

/// A single homing or probing move.
pub struct HomingMove {
    endstops: Vec<(Rc<dyn Endstop>, String)>,
    stepper_positions: Vec<StepperPosition>,
}

impl HomingMove {
    pub fn new(endstops: Vec<(Rc<dyn Endstop>, String)>) -> Self {
        Self {
            endstops,
            stepper_positions: Vec::new(),
        }
    }

    pub fn get_mcu_endstops(&self) -> Vec<Rc<dyn Endstop>> {
        self.endstops.iter().map(|(es, _)| es.clone()).collect()
    }

    pub fn stepper_positions(&self) -> &[StepperPosition] {
        &self.stepper_positions
    }

    /// Time per step of the fastest stepper the endstop watches.
    fn calc_endstop_rate(endstop: &dyn Endstop, startpos: &Coord, movepos: &Coord, speed: f64) -> f64 {
        let start = [startpos[0], startpos[1], startpos[2]];
        let end = [movepos[0], movepos[1], movepos[2]];
        let move_d = (0..3).map(|i| (end[i] - start[i]).powi(2)).sum::<f64>().sqrt();
        let move_t = move_d / speed;
        let max_steps = endstop
            .get_steppers()
            .iter()
            .map(|s| (s.calc_position_from_coord(&start) - s.calc_position_from_coord(&end)).abs() / s.step_dist())
            .fold(0.0, f64::max);
        if max_steps <= 0.0 {
            return 0.001;
        }
        move_t / max_steps
    }

    /// Toolhead position from stepper positions `kin_spos` shifted by `offsets` steps.
    fn calc_toolhead_pos(
        toolhead: &ToolHead,
        kin: &dyn Kinematics,
        kin_spos: &HashMap<String, f64>,
        offsets: &HashMap<String, i64>,
    ) -> Coord {
        let mut kin_spos = kin_spos.clone();
        for stepper in kin.get_steppers() {
            let offset = offsets.get(stepper.name()).copied().unwrap_or(0);
            if let Some(pos) = kin_spos.get_mut(stepper.name()) {
                *pos += offset as f64 * stepper.step_dist();
            }
        }
        let xyz = kin.calc_position(&kin_spos);
        let mut thpos = toolhead.get_position();
        thpos[..3].copy_from_slice(&xyz);
        thpos
    }

    fn commanded_positions(kin: &dyn Kinematics) -> HashMap<String, f64> {
        kin.get_steppers()
            .iter()
            .map(|s| (s.name().to_string(), s.commanded_position()))
            .collect()
    }

    /// Move toward `movepos` until an endstop triggers.
    ///
    /// With `probe_pos` the toolhead position is recomputed from where the
    /// steppers actually were at the trigger. Otherwise the toolhead is
    /// declared to be at `movepos`, corrected for any overshoot between the
    /// trigger and the halt. Endstops are always disarmed and the position
    /// always reconciled before an error is returned.
    pub async fn homing_move(
        &mut self,
        toolhead: &mut ToolHead,
        movepos: &Coord,
        speed: f64,
        probe_pos: bool,
        triggered: bool,
        check_triggered: bool,
    ) -> Result<Coord, HomingError> {
        tracing::debug!("Homing move to {:?} at {:.3}mm/s (probe={})", movepos, speed, probe_pos);
        // Note start location
        toolhead.flush_step_generation()?;
        let kin = toolhead.kinematics();
        let kin_spos = Self::commanded_positions(kin.as_ref());
        self.stepper_positions = self
            .endstops
            .iter()
            .flat_map(|(es, name)| {
                es.get_steppers()
                    .into_iter()
                    .map(move |s| StepperPosition::new(s, name))
            })
            .collect();
        // Arm endstops
        let print_time = toolhead.get_last_move_time()?;
        let startpos = toolhead.get_position();
        let triggers: Vec<Completion> = self
            .endstops
            .iter()
            .map(|(es, _)| {
                let rest_time = Self::calc_endstop_rate(es.as_ref(), &startpos, movepos, speed);
                es.home_start(print_time, ENDSTOP_SAMPLE_TIME, ENDSTOP_SAMPLE_COUNT, rest_time, triggered)
            })
            .collect();
        let all_endstop_trigger = Completion::all(triggers);
        // Issue move
        let mut error: Option<HomingError> = None;
        let moved = match toolhead.dwell(HOMING_START_DELAY).await {
            Ok(()) => toolhead.drip_move(movepos, speed, all_endstop_trigger).await,
            Err(err) => Err(err),
        };
        if let Err(err) = moved {
            error = Some(err.into());
        }
        // Wait for endstops to trigger
        let mut trigger_times = HashMap::new();
        let move_end_print_time = toolhead.get_last_move_time().unwrap_or_else(|_| toolhead.print_time());
        for (es, name) in &self.endstops {
            match es.home_wait(move_end_print_time).await {
                Ok(trigger_time) if trigger_time > 0.0 => {
                    trigger_times.insert(name.clone(), trigger_time);
                }
                Ok(_) => {
                    if check_triggered && error.is_none() {
                        error = Some(HomingError::NoTrigger(name.clone()));
                    }
                }
                Err(err) => {
                    error.get_or_insert(err);
                }
            }
        }
        // Determine stepper halt positions
        if let Err(err) = toolhead.flush_step_generation() {
            error.get_or_insert(err.into());
        }
        for sp in &mut self.stepper_positions {
            let tt = trigger_times
                .get(&sp.endstop_name)
                .copied()
                .unwrap_or(move_end_print_time);
            sp.note_home_end(tt);
        }
        let reconciled = self.reconcile(toolhead, kin.as_ref(), &kin_spos, movepos, probe_pos);
        match error {
            Some(err) => Err(err),
            None => reconciled,
        }
    }

    fn reconcile(
        &self,
        toolhead: &mut ToolHead,
        kin: &dyn Kinematics,
        kin_spos: &HashMap<String, f64>,
        movepos: &Coord,
        probe_pos: bool,
    ) -> Result<Coord, HomingError> {
        if probe_pos {
            let halt_steps: HashMap<String, i64> = self
                .stepper_positions
                .iter()
                .map(|sp| (sp.stepper_name.clone(), sp.halt_pos - sp.start_pos))
                .collect();
            let trig_steps: HashMap<String, i64> = self
                .stepper_positions
                .iter()
                .map(|sp| (sp.stepper_name.clone(), sp.trig_pos - sp.start_pos))
                .collect();
            let trigpos = Self::calc_toolhead_pos(toolhead, kin, kin_spos, &trig_steps);
            let haltpos = if trig_steps != halt_steps {
                Self::calc_toolhead_pos(toolhead, kin, kin_spos, &halt_steps)
            } else {
                trigpos
            };
            toolhead.set_position(&haltpos, &[])?;
            for sp in &self.stepper_positions {
                sp.verify_no_probe_skew();
            }
            return Ok(trigpos);
        }
        let over_steps: HashMap<String, i64> = self
            .stepper_positions
            .iter()
            .map(|sp| (sp.stepper_name.clone(), sp.halt_pos - sp.trig_pos))
            .collect();
        let mut haltpos = *movepos;
        if over_steps.values().any(|steps| *steps != 0) {
            toolhead.set_position(movepos, &[])?;
            let halt_kin_spos = Self::commanded_positions(kin);
            haltpos = Self::calc_toolhead_pos(toolhead, kin, &halt_kin_spos, &over_steps);
        }
        toolhead.set_position(&haltpos, &[])?;
        Ok(*movepos)
    }

    /// Name of an endstop whose steppers did not move before it triggered.
    pub fn check_no_movement(&self) -> Option<String> {
        self.stepper_positions
            .iter()
            .find(|sp| sp.start_pos == sp.trig_pos)
            .map(|sp| sp.endstop_name.clone())
    }
}
