// src/motion/lookahead.rs - Look-ahead queue for junction velocity planning
use std::collections::VecDeque;

use super::extruder::ExtraAxis;
use super::moves::Move;

/// Seconds of queued moves that trigger a lazy flush.
pub const LOOKAHEAD_FLUSH_TIME: f64 = 0.250;

/// Planning state for one move during the backward pass.
#[derive(Debug, Clone, Copy)]
struct JunctionInfo {
    start_v2: f64,
    cruise_v2: Option<f64>,
    end_v2: f64,
}

/// Queue of moves whose velocities are not final yet.
///
/// Moves are planned assuming the machine comes to rest after the last queued
/// move. A lazy flush only releases the prefix whose velocities can no longer
/// change when more moves arrive.
#[derive(Debug)]
pub struct LookAheadQueue {
    queue: VecDeque<Move>,
    junction_flush: f64,
}

impl Default for LookAheadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LookAheadQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            junction_flush: LOOKAHEAD_FLUSH_TIME,
        }
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.junction_flush = LOOKAHEAD_FLUSH_TIME;
    }

    pub fn set_flush_time(&mut self, flush_time: f64) {
        self.junction_flush = flush_time;
    }

    pub fn get_last(&self) -> Option<&Move> {
        self.queue.back()
    }

    pub fn get_last_mut(&mut self) -> Option<&mut Move> {
        self.queue.back_mut()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue a move. Returns true when enough move time is buffered that the
    /// caller should run a lazy flush.
    pub fn add_move(&mut self, mut mv: Move, extra_axes: &[Box<dyn ExtraAxis>]) -> bool {
        let Some(prev_move) = self.queue.back() else {
            self.queue.push_back(mv);
            return false;
        };
        mv.calc_junction(prev_move, extra_axes);
        self.junction_flush -= mv.min_move_t;
        self.queue.push_back(mv);
        self.junction_flush <= 0.0
    }

    /// Finalize velocities and release moves.
    ///
    /// With `lazy == false` every queued move is released. With `lazy == true`
    /// only the moves before the last full cruise plateau are released, and an
    /// empty vector is returned if no such plateau exists yet.
    pub fn flush(&mut self, lazy: bool) -> Vec<Move> {
        self.junction_flush = LOOKAHEAD_FLUSH_TIME;
        let mut update_flush_count = lazy;
        let queue_len = self.queue.len();
        let mut flush_count = queue_len;

        // Backward pass: assume the machine stops after the last move
        let mut junction_info: Vec<Option<JunctionInfo>> = vec![None; queue_len];
        let mut next_end_v2: f64 = 0.0;
        let mut next_mcr_start_v2: f64 = 0.0;
        let mut peak_cruise_v2: f64 = 0.0;
        let mut pending_cv2_assign = 0usize;
        for i in (0..queue_len).rev() {
            let mv = &self.queue[i];
            let reachable_start_v2 = next_end_v2 + mv.delta_v2;
            let start_v2 = mv.max_start_v2.min(reachable_start_v2);
            let mut cruise_v2 = None;
            pending_cv2_assign += 1;

            let reach_mcr_start_v2 = next_mcr_start_v2 + mv.mcr_delta_v2;
            let mcr_start_v2 = mv.max_mcr_start_v2.min(reach_mcr_start_v2);
            if mcr_start_v2 < reach_mcr_start_v2 {
                // This move can accelerate. A cruise plateau starts here when it
                // can also decelerate, or when it follows fully decelerating moves.
                if mcr_start_v2 + mv.mcr_delta_v2 > next_mcr_start_v2 || pending_cv2_assign > 1 {
                    if update_flush_count && peak_cruise_v2 != 0.0 {
                        flush_count = i + pending_cv2_assign;
                        update_flush_count = false;
                    }
                    peak_cruise_v2 = (mcr_start_v2 + reach_mcr_start_v2) * 0.5;
                }
                cruise_v2 = Some(
                    ((start_v2 + reachable_start_v2) * 0.5)
                        .min(mv.max_cruise_v2)
                        .min(peak_cruise_v2),
                );
                pending_cv2_assign = 0;
            }
            junction_info[i] = Some(JunctionInfo {
                start_v2,
                cruise_v2,
                end_v2: next_end_v2,
            });
            next_end_v2 = start_v2;
            next_mcr_start_v2 = mcr_start_v2;
        }
        if update_flush_count || flush_count == 0 {
            return Vec::new();
        }

        // Forward pass: moves without a plateau inherit the previous cruise speed
        let mut prev_cruise_v2: f64 = 0.0;
        let mut flushed = Vec::with_capacity(flush_count);
        for info in junction_info.into_iter().take(flush_count) {
            let Some(mut mv) = self.queue.pop_front() else {
                break;
            };
            let Some(info) = info else {
                flushed.push(mv);
                continue;
            };
            let cruise_v2 = info.cruise_v2.unwrap_or_else(|| prev_cruise_v2.min(info.start_v2));
            mv.set_junction(
                info.start_v2.min(cruise_v2),
                cruise_v2,
                info.end_v2.min(cruise_v2),
            );
            prev_cruise_v2 = cruise_v2;
            flushed.push(mv);
        }
        tracing::debug!(
            "lookahead flush released {} of {} moves (lazy={})",
            flushed.len(),
            queue_len,
            lazy
        );
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::moves::MoveLimits;

    fn limits() -> MoveLimits {
        MoveLimits {
            max_velocity: 300.0,
            max_accel: 3000.0,
            junction_deviation: 0.013,
            mcr_pseudo_accel: 1500.0,
        }
    }

    fn queue_path(q: &mut LookAheadQueue, points: &[[f64; 2]], speed: f64) -> bool {
        let mut want_flush = false;
        for pair in points.windows(2) {
            let start = [pair[0][0], pair[0][1], 0.0, 0.0];
            let end = [pair[1][0], pair[1][1], 0.0, 0.0];
            want_flush = q.add_move(Move::new(&limits(), start, end, speed), &[]);
        }
        want_flush
    }

    #[test]
    fn test_first_move_never_requests_flush() {
        let mut q = LookAheadQueue::new();
        let long = Move::new(&limits(), [0.0; 4], [200.0, 0.0, 0.0, 0.0], 10.0);
        assert!(!q.add_move(long, &[]));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_flush_budget_requests_flush() {
        let mut q = LookAheadQueue::new();
        // Each 10mm move at 100mm/s takes 0.1s minimum
        assert!(!q.add_move(Move::new(&limits(), [0.0; 4], [10.0, 0.0, 0.0, 0.0], 100.0), &[]));
        assert!(!q.add_move(Move::new(&limits(), [10.0, 0.0, 0.0, 0.0], [20.0, 0.0, 0.0, 0.0], 100.0), &[]));
        assert!(!q.add_move(Move::new(&limits(), [20.0, 0.0, 0.0, 0.0], [30.0, 0.0, 0.0, 0.0], 100.0), &[]));
        assert!(q.add_move(Move::new(&limits(), [30.0, 0.0, 0.0, 0.0], [40.0, 0.0, 0.0, 0.0], 100.0), &[]));
    }

    #[test]
    fn test_empty_flush_resets_budget() {
        let mut q = LookAheadQueue::new();
        q.set_flush_time(2.0);
        assert!(q.flush(false).is_empty());
        assert!(q.flush(true).is_empty());
        assert_eq!(q.junction_flush, LOOKAHEAD_FLUSH_TIME);
    }

    #[test]
    fn test_full_flush_single_move_starts_and_ends_at_rest() {
        let mut q = LookAheadQueue::new();
        q.add_move(Move::new(&limits(), [0.0; 4], [100.0, 0.0, 0.0, 0.0], 100.0), &[]);
        let moves = q.flush(false);
        assert_eq!(moves.len(), 1);
        let m = &moves[0];
        assert_eq!(m.start_v, 0.0);
        assert_eq!(m.end_v, 0.0);
        assert!((m.cruise_v - 100.0).abs() < 1e-9);
        assert!(q.is_empty());
    }

    #[test]
    fn test_short_move_never_reaches_cruise() {
        let mut q = LookAheadQueue::new();
        q.add_move(Move::new(&limits(), [0.0; 4], [1.0, 0.0, 0.0, 0.0], 300.0), &[]);
        let m = q.flush(false).remove(0);
        // Peak limited by the minimum cruise ratio: half of the move accelerates
        // with mcr pseudo accel
        assert!(m.cruise_v < 300.0);
        assert!(m.cruise_t >= -1e-9);
        let accel_d = m.cruise_v * m.cruise_v / (2.0 * m.accel);
        assert!(2.0 * accel_d <= m.move_d + 1e-9);
    }

    #[test]
    fn test_right_angle_corner_velocity() {
        let mut q = LookAheadQueue::new();
        queue_path(&mut q, &[[0.0, 0.0], [10.0, 0.0], [10.0, 10.0]], 100.0);
        let moves = q.flush(false);
        assert_eq!(moves.len(), 2);
        let corner_v2 = moves[1].max_start_v2;
        assert!((moves[0].end_v - moves[1].start_v).abs() < 1e-9);
        assert!(moves[0].end_v * moves[0].end_v <= corner_v2 + 1e-9);
        assert_eq!(moves[1].end_v, 0.0);
    }

    #[test]
    fn test_lazy_flush_without_plateau_keeps_queue() {
        let mut q = LookAheadQueue::new();
        queue_path(&mut q, &[[0.0, 0.0], [0.5, 0.0], [1.0, 0.0]], 300.0);
        let moves = q.flush(true);
        assert!(moves.is_empty());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_lazy_flush_releases_prefix_only() {
        let mut q = LookAheadQueue::new();
        let mut points = Vec::new();
        for i in 0..20 {
            let x = if i % 2 == 0 { 0.0 } else { 50.0 };
            points.push([x, i as f64 * 5.0]);
        }
        queue_path(&mut q, &points, 150.0);
        let total = q.len();
        let moves = q.flush(true);
        assert!(!moves.is_empty());
        assert!(moves.len() < total);
        assert_eq!(moves.len() + q.len(), total);
        assert_eq!(moves[0].start_v, 0.0);
    }

    #[test]
    fn test_flushed_moves_are_continuous_and_bounded() {
        let mut q = LookAheadQueue::new();
        let points: Vec<[f64; 2]> = (0..40)
            .map(|i| {
                let a = i as f64 * 0.7;
                [100.0 + 40.0 * a.cos() + i as f64, 100.0 + 25.0 * a.sin()]
            })
            .collect();
        queue_path(&mut q, &points, 200.0);
        let moves = q.flush(false);
        assert_eq!(moves.len(), points.len() - 1);
        assert_eq!(moves[0].start_v, 0.0);
        assert_eq!(moves[moves.len() - 1].end_v, 0.0);
        for pair in moves.windows(2) {
            assert!((pair[0].end_v - pair[1].start_v).abs() < 1e-6);
        }
        for m in &moves {
            assert!(m.start_v * m.start_v <= m.max_start_v2 + 1e-6);
            assert!(m.cruise_v * m.cruise_v <= m.max_cruise_v2 + 1e-6);
            assert!(m.start_v <= m.cruise_v + 1e-9);
            assert!(m.end_v <= m.cruise_v + 1e-9);
            // Reachable within the move length at the move's acceleration
            assert!((m.end_v * m.end_v - m.start_v * m.start_v).abs() <= m.delta_v2 + 1e-6);
            assert!(m.accel_t >= -1e-9 && m.cruise_t >= -1e-9 && m.decel_t >= -1e-9);
        }
    }

    #[test]
    fn test_lazy_then_full_flush_covers_every_move() {
        let mut q = LookAheadQueue::new();
        let points: Vec<[f64; 2]> = (0..60).map(|i| [(i % 7) as f64 * 12.0, i as f64 * 3.0]).collect();
        queue_path(&mut q, &points, 250.0);
        let mut released = q.flush(true);
        released.extend(q.flush(false));
        assert_eq!(released.len(), points.len() - 1);
        for pair in released.windows(2) {
            assert!((pair[0].end_v - pair[1].start_v).abs() < 1e-6);
            assert_eq!(pair[0].end_pos, pair[1].start_pos);
        }
    }

    #[test]
    fn test_reset_discards_moves() {
        let mut q = LookAheadQueue::new();
        queue_path(&mut q, &[[0.0, 0.0], [10.0, 0.0], [20.0, 0.0]], 100.0);
        q.reset();
        assert!(q.is_empty());
        assert!(q.get_last().is_none());
    }
}
