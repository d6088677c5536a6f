// src/motion/toolhead.rs - Move scheduling against the MCU print clock
use std::rc::Rc;

use serde::Serialize;

use super::extruder::ExtraAxis;
use super::kinematics::Kinematics;
use super::lookahead::LookAheadQueue;
use super::moves::{Move, MoveLimits};
use super::{Coord, MotionError, NUM_AXES};
use crate::config::{ConfigError, PrinterConfig};
use crate::hardware::{Mcu, McuError, Stepper};
use crate::scheduler::{Completion, NEVER, Reactor};
use crate::trapq::{SharedTrapQ, TrapProfile};

pub const BUFFER_TIME_LOW: f64 = 1.0;
pub const BUFFER_TIME_HIGH: f64 = 2.0;
pub const BUFFER_TIME_START: f64 = 0.250;
pub const BGFLUSH_LOW_TIME: f64 = 0.200;
pub const BGFLUSH_BATCH_TIME: f64 = 0.200;
pub const BGFLUSH_EXTRA_TIME: f64 = 0.250;
pub const MIN_KIN_TIME: f64 = 0.100;
pub const MOVE_BATCH_TIME: f64 = 0.500;
pub const STEPCOMPRESS_FLUSH_TIME: f64 = 0.050;
pub const SDS_CHECK_TIME: f64 = 0.001;
pub const MOVE_HISTORY_EXPIRE: f64 = 30.0;
pub const DRIP_SEGMENT_TIME: f64 = 0.050;
pub const DRIP_TIME: f64 = 0.100;

/// Largest negative phase time accepted from the planner as rounding noise.
const TIMING_EPSILON: f64 = 0.000001;

/// Where the toolhead is in its buffering cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueuingState {
    /// Idle; the next move restarts the print clock.
    NeedPrime,
    /// Moves are arriving; a priming deadline will force a flush.
    Priming,
    /// Homing owns the queue and feeds it in small segments.
    Drip,
    /// Streaming with a healthy buffer.
    Running,
}

impl QueuingState {
    pub fn is_special(&self) -> bool {
        !matches!(self, QueuingState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VelocityLimits {
    pub max_velocity: f64,
    pub max_accel: f64,
    pub square_corner_velocity: f64,
    pub minimum_cruise_ratio: f64,
}

impl VelocityLimits {
    pub fn from_config(cfg: &PrinterConfig) -> Self {
        Self {
            max_velocity: cfg.max_velocity,
            max_accel: cfg.max_accel,
            square_corner_velocity: cfg.square_corner_velocity,
            minimum_cruise_ratio: cfg.minimum_cruise_ratio,
        }
    }

    pub fn junction_deviation(&self) -> f64 {
        let scv2 = self.square_corner_velocity * self.square_corner_velocity;
        scv2 * (2.0_f64.sqrt() - 1.0) / self.max_accel
    }

    pub fn mcr_pseudo_accel(&self) -> f64 {
        self.max_accel * (1.0 - self.minimum_cruise_ratio)
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_velocity <= 0.0 || self.max_accel <= 0.0 {
            return Err("max_velocity and max_accel must be > 0".to_string());
        }
        if self.square_corner_velocity < 0.0 {
            return Err("square_corner_velocity must be >= 0".to_string());
        }
        if !(0.0..1.0).contains(&self.minimum_cruise_ratio) {
            return Err("minimum_cruise_ratio must be in [0, 1)".to_string());
        }
        Ok(())
    }
}

/// Snapshot reported by [`ToolHead::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolHeadStatus {
    pub position: Coord,
    pub print_time: f64,
    pub estimated_print_time: f64,
    pub stalls: u64,
    pub queuing_state: QueuingState,
    pub homed_axes: String,
    pub axis_minimum: [f64; 3],
    pub axis_maximum: [f64; 3],
    pub limits: VelocityLimits,
    pub shutdown: Option<String>,
}

/// The toolhead scheduler.
///
/// Moves enter through [`ToolHead::move_to`], are velocity planned by the
/// look-ahead queue and committed to the trapezoid queue at monotonically
/// increasing print times. All methods run on the single motion task; the
/// async ones are the only points where that task yields.
pub struct ToolHead {
    reactor: Rc<dyn Reactor>,
    mcu: Rc<dyn Mcu>,
    kin: Rc<dyn Kinematics>,
    extra_axes: Vec<Box<dyn ExtraAxis>>,
    step_generators: Vec<Rc<dyn Stepper>>,
    trapq: SharedTrapQ,
    lookahead: LookAheadQueue,
    commanded_pos: Coord,
    limits: VelocityLimits,
    junction_deviation: f64,
    mcr_pseudo_accel: f64,
    // Print time tracking
    print_time: f64,
    queuing_state: QueuingState,
    need_check_pause: f64,
    check_stall_time: f64,
    print_stall: u64,
    pause_count: u64,
    can_pause: bool,
    // Timer deadlines serviced by `service_timers`
    priming_deadline: Option<f64>,
    flush_deadline: Option<f64>,
    do_kick_flush_timer: bool,
    // Flush tracking
    last_flush_time: f64,
    min_restart_time: f64,
    need_flush_time: f64,
    step_gen_time: f64,
    kin_flush_delay: f64,
    shutdown: Option<String>,
}

impl ToolHead {
    pub fn new(
        limits: VelocityLimits,
        reactor: Rc<dyn Reactor>,
        mcu: Rc<dyn Mcu>,
        kin: Rc<dyn Kinematics>,
        trapq: SharedTrapQ,
        extra_axes: Vec<Box<dyn ExtraAxis>>,
    ) -> Result<Self, ConfigError> {
        limits.validate().map_err(ConfigError::Invalid)?;
        if extra_axes.len() > NUM_AXES - 3 {
            return Err(ConfigError::Invalid(format!(
                "at most {} extra axes are supported",
                NUM_AXES - 3
            )));
        }
        let mut step_generators = kin.get_steppers();
        for ea in &extra_axes {
            step_generators.extend(ea.steppers());
        }
        let mut lookahead = LookAheadQueue::new();
        lookahead.set_flush_time(BUFFER_TIME_HIGH);
        tracing::info!(
            "Toolhead ready: max_velocity={} max_accel={} square_corner_velocity={} minimum_cruise_ratio={}",
            limits.max_velocity,
            limits.max_accel,
            limits.square_corner_velocity,
            limits.minimum_cruise_ratio
        );
        Ok(Self {
            reactor,
            mcu,
            kin,
            extra_axes,
            step_generators,
            trapq,
            lookahead,
            commanded_pos: [0.0; NUM_AXES],
            junction_deviation: limits.junction_deviation(),
            mcr_pseudo_accel: limits.mcr_pseudo_accel(),
            limits,
            print_time: 0.0,
            queuing_state: QueuingState::NeedPrime,
            need_check_pause: -1.0,
            check_stall_time: 0.0,
            print_stall: 0,
            pause_count: 0,
            can_pause: true,
            priming_deadline: None,
            flush_deadline: None,
            do_kick_flush_timer: true,
            last_flush_time: 0.0,
            min_restart_time: 0.0,
            need_flush_time: 0.0,
            step_gen_time: 0.0,
            kin_flush_delay: SDS_CHECK_TIME,
            shutdown: None,
        })
    }

    fn move_limits(&self) -> MoveLimits {
        MoveLimits {
            max_velocity: self.limits.max_velocity,
            max_accel: self.limits.max_accel,
            junction_deviation: self.junction_deviation,
            mcr_pseudo_accel: self.mcr_pseudo_accel,
        }
    }

    // Shutdown handling

    /// Latch a fatal fault. Every later motion request fails with
    /// [`MotionError::Shutdown`].
    pub fn invoke_shutdown(&mut self, reason: String) {
        if self.shutdown.is_some() {
            return;
        }
        tracing::error!("Motion shutdown: {}", reason);
        self.shutdown = Some(reason);
        self.can_pause = false;
        self.lookahead.reset();
        self.priming_deadline = None;
        self.flush_deadline = None;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_some()
    }

    pub fn shutdown_reason(&self) -> Option<&str> {
        self.shutdown.as_deref()
    }

    fn check_shutdown(&self) -> Result<(), MotionError> {
        match &self.shutdown {
            Some(reason) => Err(MotionError::Shutdown(reason.clone())),
            None => Ok(()),
        }
    }

    // Print time tracking

    fn advance_flush_time(&mut self, flush_time: f64) -> Result<(), McuError> {
        let flush_time = flush_time.max(self.last_flush_time);
        // Generate steps
        let sg_flush_want = (flush_time + STEPCOMPRESS_FLUSH_TIME).min(self.print_time - self.kin_flush_delay);
        let sg_flush_time = sg_flush_want.max(flush_time);
        for sg in &self.step_generators {
            sg.generate_steps(sg_flush_time)?;
        }
        self.min_restart_time = self.min_restart_time.max(sg_flush_time);
        // Free trapq entries that are no longer needed
        let clear_history_time = flush_time - MOVE_HISTORY_EXPIRE;
        let free_time = sg_flush_time - self.kin_flush_delay;
        self.trapq.borrow_mut().finalize_moves(free_time, clear_history_time);
        for ea in &self.extra_axes {
            if let Some(trapq) = ea.trapq() {
                trapq.borrow_mut().finalize_moves(free_time, clear_history_time);
            }
        }
        self.mcu.flush_moves(flush_time, clear_history_time)?;
        self.last_flush_time = flush_time;
        Ok(())
    }

    fn advance_move_time(&mut self, next_print_time: f64) -> Result<(), McuError> {
        let pt_delay = self.kin_flush_delay + STEPCOMPRESS_FLUSH_TIME;
        let mut flush_time = self.last_flush_time.max(self.print_time - pt_delay);
        self.print_time = self.print_time.max(next_print_time);
        let want_flush_time = flush_time.max(self.print_time - pt_delay);
        loop {
            flush_time = (flush_time + MOVE_BATCH_TIME).min(want_flush_time);
            self.advance_flush_time(flush_time)?;
            if flush_time >= want_flush_time {
                break;
            }
        }
        Ok(())
    }

    fn calc_print_time(&mut self) {
        let curtime = self.reactor.monotonic();
        let est_print_time = self.mcu.estimated_print_time(curtime);
        let kin_time = (est_print_time + MIN_KIN_TIME).max(self.min_restart_time) + self.kin_flush_delay;
        let min_print_time = (est_print_time + BUFFER_TIME_START).max(kin_time);
        if min_print_time > self.print_time {
            tracing::debug!(
                "Resync print time {:.6} -> {:.6} (est {:.6})",
                self.print_time,
                min_print_time,
                est_print_time
            );
            self.print_time = min_print_time;
        }
    }

    /// Hand planned moves to the trapezoid queue and extra axes. Returns the
    /// print time at which the last move ends.
    fn queue_moves(&mut self, moves: Vec<Move>) -> Result<f64, MotionError> {
        if self.queuing_state.is_special() {
            if self.queuing_state != QueuingState::Drip {
                // NeedPrime / Priming -> Running
                self.queuing_state = QueuingState::Running;
                self.need_check_pause = -1.0;
            }
            self.calc_print_time();
        }
        let mut next_move_time = self.print_time;
        for mut mv in moves {
            let phases = [mv.accel_t, mv.cruise_t, mv.decel_t];
            if phases.iter().any(|t| !t.is_finite() || *t < -TIMING_EPSILON) {
                return Err(MotionError::Other(format!(
                    "Invalid move timing accel_t={} cruise_t={} decel_t={} for {:?}",
                    mv.accel_t, mv.cruise_t, mv.decel_t, mv.end_pos
                )));
            }
            if mv.is_kinematic_move {
                let profile = TrapProfile {
                    accel_t: mv.accel_t,
                    cruise_t: mv.cruise_t,
                    decel_t: mv.decel_t,
                    start_v: mv.start_v,
                    cruise_v: mv.cruise_v,
                    accel: mv.accel,
                };
                self.trapq
                    .borrow_mut()
                    .append(next_move_time, mv.kinematic_start(), mv.kinematic_axes_r(), &profile);
            }
            for (i, ea) in self.extra_axes.iter_mut().enumerate() {
                if mv.axes_d[i + 3] != 0.0 {
                    ea.process_move(next_move_time, &mv, i + 3);
                }
            }
            next_move_time += mv.total_time();
            for cb in mv.timing_callbacks.drain(..) {
                cb(next_move_time);
            }
        }
        Ok(next_move_time)
    }

    fn generate_queued_steps(&mut self, next_move_time: f64) -> Result<(), McuError> {
        self.note_mcu_movequeue_activity(next_move_time + self.kin_flush_delay, true);
        self.advance_move_time(next_move_time)
    }

    /// Flush planned moves out of the look-ahead queue. Never yields; any
    /// failure here is fatal.
    fn process_lookahead(&mut self, lazy: bool) {
        if self.shutdown.is_some() {
            return;
        }
        let moves = self.lookahead.flush(lazy);
        if moves.is_empty() {
            return;
        }
        let result = self
            .queue_moves(moves)
            .and_then(|next_move_time| Ok(self.generate_queued_steps(next_move_time)?));
        if let Err(err) = result {
            self.invoke_shutdown(format!("Exception in lookahead processing: {}", err));
        }
    }

    fn flush_lookahead(&mut self) {
        self.process_lookahead(false);
        self.queuing_state = QueuingState::NeedPrime;
        self.need_check_pause = -1.0;
        self.lookahead.set_flush_time(BUFFER_TIME_HIGH);
        self.check_stall_time = 0.0;
    }

    /// Commit everything queued and generate all of its steps.
    pub fn flush_step_generation(&mut self) -> Result<(), MotionError> {
        self.check_shutdown()?;
        self.flush_lookahead();
        if let Err(err) = self.advance_flush_time(self.step_gen_time) {
            self.invoke_shutdown(format!("Exception in step generation flush: {}", err));
        }
        self.min_restart_time = self.min_restart_time.max(self.print_time);
        self.check_shutdown()
    }

    /// Print time at which the last queued move ends.
    pub fn get_last_move_time(&mut self) -> Result<f64, MotionError> {
        self.check_shutdown()?;
        if self.queuing_state.is_special() {
            self.flush_lookahead();
            self.calc_print_time();
        } else {
            self.process_lookahead(false);
        }
        self.check_shutdown()?;
        Ok(self.print_time)
    }

    async fn check_pause(&mut self) {
        let mut eventtime = self.reactor.monotonic();
        let mut est_print_time = self.mcu.estimated_print_time(eventtime);
        let mut buffer_time = self.print_time - est_print_time;
        if self.queuing_state.is_special() {
            if self.check_stall_time > 0.0 {
                // Came out of NeedPrime from an idle period
                if est_print_time < self.check_stall_time {
                    self.print_stall += 1;
                    tracing::warn!("Print stall detected (total {})", self.print_stall);
                }
                self.check_stall_time = 0.0;
            }
            self.queuing_state = QueuingState::Priming;
            self.need_check_pause = -1.0;
            self.priming_deadline = Some(eventtime + (buffer_time - BUFFER_TIME_LOW).max(0.100));
        }
        // Pause while too much is buffered
        loop {
            let pause_time = buffer_time - BUFFER_TIME_HIGH;
            if pause_time <= 0.0 {
                break;
            }
            if !self.can_pause {
                self.need_check_pause = NEVER;
                return;
            }
            self.pause_count += 1;
            eventtime = self.reactor.pause(eventtime + pause_time.min(1.0)).await;
            self.service_timers(eventtime);
            est_print_time = self.mcu.estimated_print_time(eventtime);
            buffer_time = self.print_time - est_print_time;
        }
        if !self.queuing_state.is_special() {
            // Defer pause checking until the buffer could be full again
            self.need_check_pause = est_print_time + BUFFER_TIME_HIGH + 0.100;
        }
    }

    // Timers

    /// Run the priming and background flush handlers whose deadlines have
    /// passed. Returns the next time this should be called.
    pub fn service_timers(&mut self, eventtime: f64) -> f64 {
        if let Some(deadline) = self.priming_deadline {
            if eventtime >= deadline {
                self.priming_deadline = None;
                self.priming_handler();
            }
        }
        if let Some(deadline) = self.flush_deadline {
            if eventtime >= deadline {
                self.flush_deadline = None;
                let next = self.flush_handler(eventtime);
                if next < NEVER {
                    self.flush_deadline = Some(next);
                }
            }
        }
        let priming = self.priming_deadline.unwrap_or(NEVER);
        let flush = self.flush_deadline.unwrap_or(NEVER);
        priming.min(flush)
    }

    fn priming_handler(&mut self) {
        if self.queuing_state == QueuingState::Priming {
            self.flush_lookahead();
            self.check_stall_time = self.print_time;
        }
    }

    fn flush_handler(&mut self, eventtime: f64) -> f64 {
        match self.try_flush_handler(eventtime) {
            Ok(next) => next,
            Err(err) => {
                self.invoke_shutdown(format!("Exception in flush_handler: {}", err));
                NEVER
            }
        }
    }

    fn try_flush_handler(&mut self, eventtime: f64) -> Result<f64, McuError> {
        let est_print_time = self.mcu.estimated_print_time(eventtime);
        if !self.queuing_state.is_special() {
            // Running: flush the look-ahead queue if the buffer runs low
            let print_time = self.print_time;
            let buffer_time = print_time - est_print_time;
            if buffer_time > BUFFER_TIME_LOW {
                return Ok(eventtime + buffer_time - BUFFER_TIME_LOW);
            }
            self.flush_lookahead();
            if print_time != self.print_time {
                self.check_stall_time = self.print_time;
            }
        }
        // Idle: push out remaining step generation in batches
        loop {
            let end_flush = self.need_flush_time + BGFLUSH_EXTRA_TIME;
            if self.last_flush_time >= end_flush {
                self.do_kick_flush_timer = true;
                return Ok(NEVER);
            }
            let buffer_time = self.last_flush_time - est_print_time;
            if buffer_time > BGFLUSH_LOW_TIME {
                return Ok(eventtime + buffer_time - BGFLUSH_LOW_TIME);
            }
            let ftime = est_print_time + BGFLUSH_LOW_TIME + BGFLUSH_BATCH_TIME;
            self.advance_flush_time(end_flush.min(ftime))?;
        }
    }

    /// Record that the MCU move queue has work up to `mq_time`.
    pub fn note_mcu_movequeue_activity(&mut self, mq_time: f64, set_step_gen_time: bool) {
        self.need_flush_time = self.need_flush_time.max(mq_time);
        if set_step_gen_time {
            self.step_gen_time = self.step_gen_time.max(mq_time);
        }
        if self.do_kick_flush_timer {
            self.do_kick_flush_timer = false;
            self.flush_deadline = Some(self.reactor.monotonic());
        }
    }

    /// Keep servicing timers until `waketime`.
    pub async fn idle_until(&mut self, waketime: f64) {
        loop {
            let now = self.reactor.monotonic();
            let next = self.service_timers(now);
            if now >= waketime {
                break;
            }
            self.reactor.pause(next.min(waketime)).await;
        }
    }

    // Movement commands

    pub fn get_position(&self) -> Coord {
        self.commanded_pos
    }

    /// Declare the current position without moving. Axes listed in
    /// `homing_axes` become homed.
    pub fn set_position(&mut self, newpos: &Coord, homing_axes: &[usize]) -> Result<(), MotionError> {
        self.flush_step_generation()?;
        let xyz = [newpos[0], newpos[1], newpos[2]];
        self.trapq.borrow_mut().set_position(self.print_time, xyz);
        self.commanded_pos[..3].copy_from_slice(&xyz);
        self.kin.set_position(&xyz, homing_axes);
        tracing::debug!("Toolhead position set to {:?} (homing axes {:?})", xyz, homing_axes);
        Ok(())
    }

    /// Declare the position of extra axis `ea_index` (3 and up).
    pub fn set_extra_position(&mut self, ea_index: usize, pos: f64) -> Result<(), MotionError> {
        if ea_index < 3 || ea_index - 3 >= self.extra_axes.len() {
            return Err(MotionError::Other(format!("No extra axis at index {}", ea_index)));
        }
        self.flush_step_generation()?;
        let print_time = self.print_time;
        self.extra_axes[ea_index - 3].set_position(pos, print_time);
        self.commanded_pos[ea_index] = pos;
        Ok(())
    }

    /// Validate and queue one move. Returns without queueing for zero length moves.
    fn queue_move(&mut self, newpos: &Coord, speed: f64) -> Result<(), MotionError> {
        if speed.is_nan() || speed <= 0.0 {
            return Err(MotionError::Other(format!("Invalid speed {:.3}", speed)));
        }
        let mut mv = Move::new(&self.move_limits(), self.commanded_pos, *newpos, speed);
        if mv.move_d == 0.0 {
            return Ok(());
        }
        if mv.is_kinematic_move {
            self.kin.check_move(&mut mv)?;
        }
        for (i, ea) in self.extra_axes.iter().enumerate() {
            if mv.axes_d[i + 3] != 0.0 {
                ea.check_move(&mut mv, i + 3)?;
            }
        }
        self.commanded_pos = mv.end_pos;
        if self.lookahead.add_move(mv, &self.extra_axes) {
            self.process_lookahead(true);
        }
        Ok(())
    }

    /// Queue a move to `newpos` at up to `speed` mm/s.
    pub async fn move_to(&mut self, newpos: &Coord, speed: f64) -> Result<(), MotionError> {
        self.check_shutdown()?;
        self.service_timers(self.reactor.monotonic());
        self.queue_move(newpos, speed)?;
        self.check_shutdown()?;
        if self.print_time > self.need_check_pause {
            self.check_pause().await;
        }
        self.check_shutdown()
    }

    /// Move only the given coordinates; `None` keeps the current value.
    pub async fn manual_move(&mut self, coord: &[Option<f64>; NUM_AXES], speed: f64) -> Result<(), MotionError> {
        let mut curpos = self.commanded_pos;
        for (pos, c) in curpos.iter_mut().zip(coord.iter()) {
            if let Some(c) = c {
                *pos = *c;
            }
        }
        self.move_to(&curpos, speed).await
    }

    pub async fn dwell(&mut self, delay: f64) -> Result<(), MotionError> {
        let next_print_time = self.get_last_move_time()? + delay.max(0.0);
        if let Err(err) = self.advance_move_time(next_print_time) {
            self.invoke_shutdown(format!("Exception during dwell: {}", err));
        }
        self.check_shutdown()?;
        self.check_pause().await;
        self.check_shutdown()
    }

    /// Wait until every queued move has been executed.
    pub async fn wait_moves(&mut self) -> Result<(), MotionError> {
        self.check_shutdown()?;
        self.flush_lookahead();
        let mut eventtime = self.reactor.monotonic();
        while !self.queuing_state.is_special() || self.print_time >= self.mcu.estimated_print_time(eventtime) {
            if !self.can_pause {
                break;
            }
            eventtime = self.reactor.pause(eventtime + 0.100).await;
            self.service_timers(eventtime);
        }
        self.check_shutdown()
    }

    // Homing "drip move" support

    async fn update_drip_move_time(
        &mut self,
        next_print_time: f64,
        completion: &mut Completion,
    ) -> Result<bool, MotionError> {
        let reactor = self.reactor.clone();
        let flush_delay = DRIP_TIME + STEPCOMPRESS_FLUSH_TIME + self.kin_flush_delay;
        while self.print_time < next_print_time {
            if completion.test() {
                return Ok(true);
            }
            let curtime = reactor.monotonic();
            let est_print_time = self.mcu.estimated_print_time(curtime);
            let wait_time = self.print_time - est_print_time - flush_delay;
            if wait_time > 0.0 && self.can_pause {
                // Pause before sending more steps
                completion.wait(reactor.as_ref(), curtime + wait_time).await;
                continue;
            }
            let npt = (self.print_time + DRIP_SEGMENT_TIME).min(next_print_time);
            self.note_mcu_movequeue_activity(npt + self.kin_flush_delay, true);
            if let Err(err) = self.advance_move_time(npt) {
                self.invoke_shutdown(format!("Exception during drip move: {}", err));
            }
            self.check_shutdown()?;
        }
        Ok(false)
    }

    /// Commit the queued drip move, feeding it out in small segments. Returns
    /// true if `completion` fired before the move finished.
    async fn process_drip_lookahead(&mut self, completion: &mut Completion) -> Result<bool, MotionError> {
        let moves = self.lookahead.flush(false);
        if moves.is_empty() {
            return Ok(false);
        }
        let next_move_time = match self.queue_moves(moves) {
            Ok(t) => t,
            Err(err) => {
                self.invoke_shutdown(format!("Exception in drip processing: {}", err));
                return Err(err);
            }
        };
        if self.update_drip_move_time(next_move_time, completion).await? {
            return Ok(true);
        }
        if let Err(err) = self.generate_queued_steps(next_move_time) {
            self.invoke_shutdown(format!("Exception in drip processing: {}", err));
        }
        self.check_shutdown()?;
        Ok(false)
    }

    fn exit_drip(&mut self) -> Result<(), MotionError> {
        self.flush_deadline = Some(self.reactor.monotonic());
        self.flush_step_generation()
    }

    /// Move toward `newpos` while watching `completion`, stopping early when
    /// it fires. Used by homing and probing.
    pub async fn drip_move(&mut self, newpos: &Coord, speed: f64, completion: Completion) -> Result<(), MotionError> {
        let mut completion = completion;
        self.dwell(self.kin_flush_delay).await?;
        // NeedPrime / Priming / Running -> Drip
        self.queuing_state = QueuingState::Drip;
        self.need_check_pause = NEVER;
        self.flush_deadline = None;
        self.do_kick_flush_timer = false;
        self.lookahead.set_flush_time(BUFFER_TIME_HIGH);
        self.check_stall_time = 0.0;
        if let Err(err) = self.queue_move(newpos, speed) {
            self.exit_drip()?;
            return Err(err);
        }
        match self.process_drip_lookahead(&mut completion).await {
            Ok(true) => {
                tracing::debug!("Drip move ended early at print time {:.6}", self.print_time);
                self.lookahead.reset();
                self.trapq.borrow_mut().finalize_moves(NEVER, 0.0);
                for ea in &self.extra_axes {
                    if let Some(trapq) = ea.trapq() {
                        trapq.borrow_mut().finalize_moves(NEVER, 0.0);
                    }
                }
            }
            Ok(false) => {}
            Err(err) => {
                if let Err(exit_err) = self.exit_drip() {
                    tracing::warn!("Unable to leave drip mode after failed drip move: {}", exit_err);
                }
                return Err(err);
            }
        }
        // Drip -> NeedPrime
        self.exit_drip()
    }

    // Misc commands

    /// Run `callback` with the end time of the last queued move once that
    /// move is committed (immediately if nothing is queued).
    pub fn register_lookahead_callback(&mut self, callback: impl FnOnce(f64) + 'static) -> Result<(), MotionError> {
        match self.lookahead.get_last_mut() {
            Some(last_move) => {
                last_move.timing_callbacks.push(Box::new(callback));
            }
            None => {
                let last_move_time = self.get_last_move_time()?;
                callback(last_move_time);
            }
        }
        Ok(())
    }

    pub fn limit_next_junction_speed(&mut self, speed: f64) {
        if let Some(last_move) = self.lookahead.get_last_mut() {
            last_move.limit_next_junction_speed(speed);
        }
    }

    pub fn set_velocity_limits(&mut self, limits: VelocityLimits) -> Result<(), MotionError> {
        limits.validate().map_err(MotionError::Other)?;
        self.limits = limits;
        self.junction_deviation = limits.junction_deviation();
        self.mcr_pseudo_accel = limits.mcr_pseudo_accel();
        tracing::info!(
            "Velocity limits: max_velocity={} max_accel={} square_corner_velocity={} minimum_cruise_ratio={}",
            limits.max_velocity,
            limits.max_accel,
            limits.square_corner_velocity,
            limits.minimum_cruise_ratio
        );
        Ok(())
    }

    pub fn get_status(&self, eventtime: f64) -> ToolHeadStatus {
        let axis_limits = self.kin.axis_limits();
        ToolHeadStatus {
            position: self.commanded_pos,
            print_time: self.print_time,
            estimated_print_time: self.mcu.estimated_print_time(eventtime),
            stalls: self.print_stall,
            queuing_state: self.queuing_state,
            homed_axes: self.kin.homed_axes(),
            axis_minimum: axis_limits.map(|l| l.0),
            axis_maximum: axis_limits.map(|l| l.1),
            limits: self.limits,
            shutdown: self.shutdown.clone(),
        }
    }

    /// Periodic activity summary: whether the toolhead is busy and a one line report.
    pub fn stats(&self, eventtime: f64) -> (bool, String) {
        let est_print_time = self.mcu.estimated_print_time(eventtime);
        let mut buffer_time = self.print_time - est_print_time;
        let is_active = buffer_time > -60.0 || !self.queuing_state.is_special();
        if self.queuing_state == QueuingState::Drip {
            buffer_time = 0.0;
        }
        (
            is_active,
            format!(
                "print_time={:.3} buffer_time={:.3} print_stall={}",
                self.print_time,
                buffer_time.max(0.0),
                self.print_stall
            ),
        )
    }

    // Accessors

    pub fn kinematics(&self) -> Rc<dyn Kinematics> {
        self.kin.clone()
    }

    pub fn mcu(&self) -> Rc<dyn Mcu> {
        self.mcu.clone()
    }

    pub fn reactor(&self) -> Rc<dyn Reactor> {
        self.reactor.clone()
    }

    pub fn trapq(&self) -> SharedTrapQ {
        self.trapq.clone()
    }

    pub fn extra_axes(&self) -> &[Box<dyn ExtraAxis>] {
        &self.extra_axes
    }

    pub fn print_time(&self) -> f64 {
        self.print_time
    }

    pub fn queuing_state(&self) -> QueuingState {
        self.queuing_state
    }

    pub fn pause_count(&self) -> u64 {
        self.pause_count
    }

    pub fn print_stall(&self) -> u64 {
        self.print_stall
    }

    pub fn lookahead_len(&self) -> usize {
        self.lookahead.len()
    }

    pub fn limits(&self) -> VelocityLimits {
        self.limits
    }

    pub fn set_can_pause(&mut self, can_pause: bool) {
        self.can_pause = can_pause;
    }
}
