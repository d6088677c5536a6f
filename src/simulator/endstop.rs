// src/simulator/endstop.rs - Simulated endstop switch and probe
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use async_trait::async_trait;

use super::reactor::SimReactor;
use super::stepper::SimStepper;
use crate::hardware::{Endstop, Stepper};
use crate::homing::HomingError;
use crate::scheduler::{Completion, CompletionHandle, Reactor, TriggerState, completion};
use crate::trapq::TrapSegment;

/// Injected switch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndstopFault {
    /// Always reads pressed.
    Stuck,
    /// Never reads pressed.
    Disconnected,
    /// The MCU stops answering while the endstop is armed.
    Unresponsive,
}

struct ArmedState {
    handle: Rc<CompletionHandle>,
    triggered: bool,
    scanned_to: f64,
    trigger_time: Option<f64>,
}

/// A switch at a fixed physical position of a weighted sum of stepper positions.
pub struct SimEndstop {
    name: String,
    sensed: Vec<(Rc<SimStepper>, f64)>,
    position: f64,
    positive_dir: bool,
    halt_delay: f64,
    reactor: Rc<SimReactor>,
    fault: Cell<Option<EndstopFault>>,
    armed: RefCell<Option<ArmedState>>,
}

impl SimEndstop {
    pub fn new(
        name: &str,
        sensed: Vec<(Rc<SimStepper>, f64)>,
        position: f64,
        positive_dir: bool,
        halt_delay: f64,
        reactor: Rc<SimReactor>,
    ) -> Self {
        Self {
            name: name.to_string(),
            sensed,
            position,
            positive_dir,
            halt_delay,
            reactor,
            fault: Cell::new(None),
            armed: RefCell::new(None),
        }
    }

    pub fn set_fault(&self, fault: Option<EndstopFault>) {
        self.fault.set(fault);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.borrow().is_some()
    }

    fn sensed_from_coord(&self, coord: &[f64; 3]) -> f64 {
        self.sensed.iter().map(|(s, w)| w * s.physical_from_coord(coord)).sum()
    }

    /// Physical position of the sensed coordinate at `print_time`.
    pub fn sensed_position(&self, print_time: f64) -> f64 {
        self.sensed.iter().map(|(s, w)| w * s.physical_position(print_time)).sum()
    }

    fn is_pressed(&self, sensed: f64) -> bool {
        match self.fault.get() {
            Some(EndstopFault::Stuck) => true,
            Some(EndstopFault::Disconnected | EndstopFault::Unresponsive) => false,
            None if self.positive_dir => sensed >= self.position,
            None => sensed <= self.position,
        }
    }

    /// First time within `[t0, t1]` of `seg` at which the switch state
    /// becomes `want`.
    fn find_crossing(&self, seg: &TrapSegment, t0: f64, t1: f64, want: bool) -> Option<f64> {
        let (mt0, mt1) = (t0 - seg.print_time, t1 - seg.print_time);
        let (d0, d1) = (seg.distance_at(mt0), seg.distance_at(mt1));
        let s0 = self.sensed_from_coord(&seg.coord_at(mt0));
        let s1 = self.sensed_from_coord(&seg.coord_at(mt1));
        if self.is_pressed(s1) != want {
            return None;
        }
        if self.fault.get().is_some() || (s1 - s0).abs() < 1e-12 {
            return Some(t0);
        }
        // Sensed position is linear in distance along the segment
        let d = d0 + (self.position - s0) / (s1 - s0) * (d1 - d0);
        let disc = (seg.start_v * seg.start_v + 4.0 * seg.half_accel * d).max(0.0);
        let denom = seg.start_v + disc.sqrt();
        let move_t = if denom > 0.0 { 2.0 * d / denom } else { mt1 };
        Some((seg.print_time + move_t).clamp(t0, t1))
    }

    fn fire(&self, state: &mut ArmedState, trigger_time: f64) {
        state.trigger_time = Some(trigger_time);
        for (stepper, _) in &self.sensed {
            stepper.halt_at(trigger_time + self.halt_delay);
        }
        tracing::debug!("Endstop {} triggered at {:.6}", self.name, trigger_time);
        let handle = state.handle.clone();
        self.reactor.schedule(trigger_time, "endstop trigger", move || {
            handle.complete(TriggerState::Complete {
                trigger_time: Some(trigger_time),
            });
        });
    }

    /// Check the queued motion up to `flush_time` for a trigger.
    pub fn scan(&self, flush_time: f64) {
        let mut armed = self.armed.borrow_mut();
        let Some(state) = armed.as_mut() else {
            return;
        };
        if state.trigger_time.is_some() || flush_time <= state.scanned_to {
            return;
        }
        let Some((first, _)) = self.sensed.first() else {
            return;
        };
        let segments = first.trapq().borrow().extract(state.scanned_to, flush_time);
        for seg in &segments {
            let t0 = seg.print_time.max(state.scanned_to);
            let t1 = seg.end_time().min(flush_time);
            if t1 < t0 {
                continue;
            }
            if let Some(trigger_time) = self.find_crossing(seg, t0, t1, state.triggered) {
                self.fire(state, trigger_time);
                break;
            }
        }
        state.scanned_to = flush_time;
    }
}

#[async_trait(?Send)]
impl Endstop for SimEndstop {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_steppers(&self) -> Vec<Rc<dyn Stepper>> {
        self.sensed.iter().map(|(s, _)| s.clone() as Rc<dyn Stepper>).collect()
    }

    fn home_start(
        &self,
        print_time: f64,
        sample_time: f64,
        sample_count: u32,
        rest_time: f64,
        triggered: bool,
    ) -> Completion {
        tracing::debug!(
            "Arming endstop {} at {:.6} (sample_time={} sample_count={} rest_time={:.6})",
            self.name,
            print_time,
            sample_time,
            sample_count,
            rest_time
        );
        let (handle, done) = completion();
        let mut state = ArmedState {
            handle: Rc::new(handle),
            triggered,
            scanned_to: print_time,
            trigger_time: None,
        };
        if self.is_pressed(self.sensed_position(print_time)) == triggered {
            self.fire(&mut state, print_time);
        }
        *self.armed.borrow_mut() = Some(state);
        done
    }

    async fn home_wait(&self, home_end_time: f64) -> Result<f64, HomingError> {
        self.reactor.pause(home_end_time).await;
        let Some(state) = self.armed.borrow_mut().take() else {
            return Ok(0.0);
        };
        for (stepper, _) in &self.sensed {
            stepper.note_homing_end();
        }
        if self.fault.get() == Some(EndstopFault::Unresponsive) {
            state.handle.complete(TriggerState::Failed);
            return Err(HomingError::CommunicationTimeout(self.name.clone()));
        }
        match state.trigger_time {
            Some(trigger_time) => Ok(trigger_time),
            None => {
                state.handle.complete(TriggerState::Complete { trigger_time: None });
                Ok(0.0)
            }
        }
    }

    fn query_endstop(&self, print_time: f64) -> bool {
        self.is_pressed(self.sensed_position(print_time))
    }
}
