// src/trapq.rs - Timed trapezoid segment queue consumed by step generation
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde::Serialize;

use crate::scheduler::NEVER;

/// One constant-acceleration piece of a committed move.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TrapSegment {
    pub print_time: f64,
    pub move_t: f64,
    pub start_v: f64,
    pub half_accel: f64,
    pub start_pos: [f64; 3],
    pub axes_r: [f64; 3],
}

impl TrapSegment {
    pub fn end_time(&self) -> f64 {
        self.print_time + self.move_t
    }

    /// Distance travelled `move_time` seconds into the segment.
    pub fn distance_at(&self, move_time: f64) -> f64 {
        (self.start_v + self.half_accel * move_time) * move_time
    }

    pub fn coord_at(&self, move_time: f64) -> [f64; 3] {
        let move_dist = self.distance_at(move_time);
        [
            self.start_pos[0] + self.axes_r[0] * move_dist,
            self.start_pos[1] + self.axes_r[1] * move_dist,
            self.start_pos[2] + self.axes_r[2] * move_dist,
        ]
    }

    pub fn end_coord(&self) -> [f64; 3] {
        self.coord_at(self.move_t)
    }
}

/// Velocity profile of a move as handed to [`TrapQ::append`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrapProfile {
    pub accel_t: f64,
    pub cruise_t: f64,
    pub decel_t: f64,
    pub start_v: f64,
    pub cruise_v: f64,
    pub accel: f64,
}

/// Pending segments plus a bounded history of segments already handed to
/// step generation. History is kept newest first.
#[derive(Debug, Default)]
pub struct TrapQ {
    moves: VecDeque<TrapSegment>,
    history: VecDeque<TrapSegment>,
}

pub type SharedTrapQ = Rc<RefCell<TrapQ>>;

impl TrapQ {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedTrapQ {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Split a move into its accel, cruise and decel segments and queue them.
    pub fn append(&mut self, print_time: f64, start_pos: [f64; 3], axes_r: [f64; 3], profile: &TrapProfile) {
        let mut print_time = print_time;
        let mut start_pos = start_pos;
        if profile.accel_t != 0.0 {
            let seg = TrapSegment {
                print_time,
                move_t: profile.accel_t,
                start_v: profile.start_v,
                half_accel: 0.5 * profile.accel,
                start_pos,
                axes_r,
            };
            self.moves.push_back(seg);
            print_time += profile.accel_t;
            start_pos = seg.end_coord();
        }
        if profile.cruise_t != 0.0 {
            let seg = TrapSegment {
                print_time,
                move_t: profile.cruise_t,
                start_v: profile.cruise_v,
                half_accel: 0.0,
                start_pos,
                axes_r,
            };
            self.moves.push_back(seg);
            print_time += profile.cruise_t;
            start_pos = seg.end_coord();
        }
        if profile.decel_t != 0.0 {
            self.moves.push_back(TrapSegment {
                print_time,
                move_t: profile.decel_t,
                start_v: profile.cruise_v,
                half_accel: -0.5 * profile.accel,
                start_pos,
                axes_r,
            });
        }
    }

    /// Move segments ending at or before `print_time` into history and expire
    /// history older than `clear_history_time`. The newest history entry is
    /// always retained.
    pub fn finalize_moves(&mut self, print_time: f64, clear_history_time: f64) {
        while let Some(seg) = self.moves.front() {
            if seg.end_time() > print_time {
                break;
            }
            if let Some(seg) = self.moves.pop_front() {
                self.history.push_front(seg);
            }
        }
        while self.history.len() > 1 {
            match self.history.back() {
                Some(oldest) if oldest.end_time() <= clear_history_time => {
                    self.history.pop_back();
                }
                _ => break,
            }
        }
    }

    /// Reset the position at `print_time`: everything pending is finalized,
    /// history at or after `print_time` is discarded and a stationary marker
    /// is recorded.
    pub fn set_position(&mut self, print_time: f64, pos: [f64; 3]) {
        self.finalize_moves(NEVER, 0.0);
        while let Some(seg) = self.history.front_mut() {
            if seg.print_time < print_time {
                if seg.end_time() > print_time {
                    seg.move_t = print_time - seg.print_time;
                }
                break;
            }
            self.history.pop_front();
        }
        self.history.push_front(TrapSegment {
            print_time,
            start_pos: pos,
            ..TrapSegment::default()
        });
    }

    /// Position at `print_time`, or `None` if nothing is known that early.
    /// Times past the last segment report its end position.
    pub fn position_at(&self, print_time: f64) -> Option<[f64; 3]> {
        let newest_first = self.moves.iter().rev().chain(self.history.iter());
        for seg in newest_first {
            if seg.print_time <= print_time {
                let move_time = (print_time - seg.print_time).min(seg.move_t);
                return Some(seg.coord_at(move_time));
            }
        }
        None
    }

    pub fn last_position(&self) -> Option<[f64; 3]> {
        self.moves
            .back()
            .or_else(|| self.history.front())
            .map(TrapSegment::end_coord)
    }

    /// Segments overlapping `[start_time, end_time]`, oldest first.
    pub fn extract(&self, start_time: f64, end_time: f64) -> Vec<TrapSegment> {
        self.history
            .iter()
            .rev()
            .chain(self.moves.iter())
            .filter(|seg| seg.end_time() >= start_time && seg.print_time <= end_time)
            .copied()
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.moves.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}
