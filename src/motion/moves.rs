// src/motion/moves.rs - Trapezoidal move and junction velocity model
use std::fmt;

use super::extruder::ExtraAxis;
use super::{Coord, MotionError};

/// Acceleration assigned to extrude-only moves; the extra axes limit it later.
pub const EXTRUDE_ONLY_ACCEL: f64 = 99_999_999.9;
/// Placeholder for "no junction limit requested yet".
pub const UNLIMITED_JUNCTION_V2: f64 = 999_999_999.9;

/// Toolhead limits a move is built against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveLimits {
    pub max_velocity: f64,
    pub max_accel: f64,
    pub junction_deviation: f64,
    pub mcr_pseudo_accel: f64,
}

/// Callback run with the print time at which its move ends.
pub type TimingCallback = Box<dyn FnOnce(f64)>;

/// A single straight-line move with a trapezoidal velocity profile.
///
/// The `max_*` and `*_delta_v2` fields are planning bounds filled in while the
/// move sits in the look-ahead queue. The final velocities and phase times are
/// written once by [`Move::set_junction`].
pub struct Move {
    pub start_pos: Coord,
    pub end_pos: Coord,
    pub accel: f64,
    pub junction_deviation: f64,
    pub is_kinematic_move: bool,
    pub axes_d: Coord,
    pub axes_r: Coord,
    pub move_d: f64,
    pub min_move_t: f64,
    pub max_start_v2: f64,
    pub max_cruise_v2: f64,
    pub delta_v2: f64,
    pub next_junction_v2: f64,
    pub max_mcr_start_v2: f64,
    pub mcr_delta_v2: f64,
    pub start_v: f64,
    pub cruise_v: f64,
    pub end_v: f64,
    pub accel_t: f64,
    pub cruise_t: f64,
    pub decel_t: f64,
    pub timing_callbacks: Vec<TimingCallback>,
}

impl fmt::Debug for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Move")
            .field("start_pos", &self.start_pos)
            .field("end_pos", &self.end_pos)
            .field("accel", &self.accel)
            .field("move_d", &self.move_d)
            .field("is_kinematic_move", &self.is_kinematic_move)
            .field("max_start_v2", &self.max_start_v2)
            .field("max_cruise_v2", &self.max_cruise_v2)
            .field("start_v", &self.start_v)
            .field("cruise_v", &self.cruise_v)
            .field("end_v", &self.end_v)
            .field("accel_t", &self.accel_t)
            .field("cruise_t", &self.cruise_t)
            .field("decel_t", &self.decel_t)
            .field("timing_callbacks", &self.timing_callbacks.len())
            .finish()
    }
}

impl Move {
    pub fn new(limits: &MoveLimits, start_pos: Coord, end_pos: Coord, speed: f64) -> Self {
        let mut end_pos = end_pos;
        let mut velocity = speed.min(limits.max_velocity);
        let mut accel = limits.max_accel;
        let mut is_kinematic_move = true;

        let mut axes_d = [0.0; 4];
        for (d, (e, s)) in axes_d.iter_mut().zip(end_pos.iter().zip(start_pos.iter())) {
            *d = e - s;
        }
        let mut move_d = (axes_d[0] * axes_d[0] + axes_d[1] * axes_d[1] + axes_d[2] * axes_d[2]).sqrt();
        if move_d < 0.000000001 {
            // Extrude only move
            end_pos[..3].copy_from_slice(&start_pos[..3]);
            axes_d[..3].fill(0.0);
            move_d = axes_d[3..].iter().fold(0.0_f64, |acc, d| acc.max(d.abs()));
            velocity = speed;
            accel = EXTRUDE_ONLY_ACCEL;
            is_kinematic_move = false;
        }

        let inv_move_d = if move_d > 0.0 { 1.0 / move_d } else { 0.0 };
        let mut axes_r = [0.0; 4];
        for (r, d) in axes_r.iter_mut().zip(axes_d.iter()) {
            *r = inv_move_d * d;
        }

        Self {
            start_pos,
            end_pos,
            accel,
            junction_deviation: limits.junction_deviation,
            is_kinematic_move,
            axes_d,
            axes_r,
            move_d,
            min_move_t: move_d / velocity,
            max_start_v2: 0.0,
            max_cruise_v2: velocity * velocity,
            delta_v2: 2.0 * move_d * accel,
            next_junction_v2: UNLIMITED_JUNCTION_V2,
            max_mcr_start_v2: 0.0,
            mcr_delta_v2: 2.0 * move_d * limits.mcr_pseudo_accel,
            start_v: 0.0,
            cruise_v: 0.0,
            end_v: 0.0,
            accel_t: 0.0,
            cruise_t: 0.0,
            decel_t: 0.0,
            timing_callbacks: Vec::new(),
        }
    }

    /// Lower the cruise speed and acceleration of this move. Never raises either.
    pub fn limit_speed(&mut self, speed: f64, accel: f64) {
        let speed2 = speed * speed;
        if speed2 < self.max_cruise_v2 {
            self.max_cruise_v2 = speed2;
            self.min_move_t = self.move_d / speed;
        }
        self.accel = self.accel.min(accel);
        self.delta_v2 = 2.0 * self.move_d * self.accel;
        self.mcr_delta_v2 = self.mcr_delta_v2.min(self.delta_v2);
    }

    /// Cap the velocity at the junction following this move.
    pub fn limit_next_junction_speed(&mut self, speed: f64) {
        self.next_junction_v2 = self.next_junction_v2.min(speed * speed);
    }

    pub fn move_error(&self, msg: &str) -> MotionError {
        MotionError::OutOfRange(self.describe_end(msg))
    }

    pub fn unhomed_error(&self) -> MotionError {
        MotionError::Unhomed(self.describe_end("Must home axis first"))
    }

    fn describe_end(&self, msg: &str) -> String {
        let ep = &self.end_pos;
        format!("{}: {:.3} {:.3} {:.3} [{:.3}]", msg, ep[0], ep[1], ep[2], ep[3])
    }

    /// Bound the start velocity of this move by the corner it makes with `prev_move`.
    pub fn calc_junction(&mut self, prev_move: &Move, extra_axes: &[Box<dyn ExtraAxis>]) {
        if !self.is_kinematic_move || !prev_move.is_kinematic_move {
            return;
        }
        let mut max_start_v2 = self
            .max_cruise_v2
            .min(prev_move.max_cruise_v2)
            .min(prev_move.next_junction_v2)
            .min(prev_move.max_start_v2 + prev_move.delta_v2);
        for (i, ea) in extra_axes.iter().enumerate() {
            max_start_v2 = max_start_v2.min(ea.calc_junction(prev_move, self, i + 3));
        }

        // Approximated centripetal velocity through the corner
        let axes_r = &self.axes_r;
        let prev_axes_r = &prev_move.axes_r;
        let junction_cos_theta = -(axes_r[0] * prev_axes_r[0]
            + axes_r[1] * prev_axes_r[1]
            + axes_r[2] * prev_axes_r[2]);
        let sin_theta_d2 = (0.5 * (1.0 - junction_cos_theta)).max(0.0).sqrt();
        let cos_theta_d2 = (0.5 * (1.0 + junction_cos_theta)).max(0.0).sqrt();
        let one_minus_sin_theta_d2 = 1.0 - sin_theta_d2;
        if one_minus_sin_theta_d2 > 0.0 && cos_theta_d2 > 0.0 {
            let r_jd = sin_theta_d2 / one_minus_sin_theta_d2;
            let move_jd_v2 = r_jd * self.junction_deviation * self.accel;
            let pmove_jd_v2 = r_jd * prev_move.junction_deviation * prev_move.accel;
            // The approximated circle must touch both moves no further than mid-move
            let quarter_tan_theta_d2 = 0.25 * sin_theta_d2 / cos_theta_d2;
            let move_centripetal_v2 = self.delta_v2 * quarter_tan_theta_d2;
            let pmove_centripetal_v2 = prev_move.delta_v2 * quarter_tan_theta_d2;
            max_start_v2 = max_start_v2
                .min(move_jd_v2)
                .min(pmove_jd_v2)
                .min(move_centripetal_v2)
                .min(pmove_centripetal_v2);
        }

        self.max_start_v2 = max_start_v2;
        self.max_mcr_start_v2 = max_start_v2.min(prev_move.max_mcr_start_v2 + prev_move.mcr_delta_v2);
    }

    /// Finalize the velocity profile. Inputs are squared velocities.
    pub fn set_junction(&mut self, start_v2: f64, cruise_v2: f64, end_v2: f64) {
        let half_inv_accel = 0.5 / self.accel;
        let accel_d = (cruise_v2 - start_v2) * half_inv_accel;
        let decel_d = (cruise_v2 - end_v2) * half_inv_accel;
        let cruise_d = self.move_d - accel_d - decel_d;

        let start_v = start_v2.sqrt();
        let cruise_v = cruise_v2.sqrt();
        let end_v = end_v2.sqrt();
        self.start_v = start_v;
        self.cruise_v = cruise_v;
        self.end_v = end_v;

        // Distance over average velocity
        self.accel_t = accel_d / ((start_v + cruise_v) * 0.5);
        self.cruise_t = cruise_d / cruise_v;
        self.decel_t = decel_d / ((end_v + cruise_v) * 0.5);
    }

    pub fn total_time(&self) -> f64 {
        self.accel_t + self.cruise_t + self.decel_t
    }

    pub(crate) fn kinematic_start(&self) -> [f64; 3] {
        [self.start_pos[0], self.start_pos[1], self.start_pos[2]]
    }

    pub(crate) fn kinematic_axes_r(&self) -> [f64; 3] {
        [self.axes_r[0], self.axes_r[1], self.axes_r[2]]
    }
}
