// tests/lookahead.rs
use krusty_motion::motion::{LookAheadQueue, Move, MoveLimits};

fn limits(square_corner_velocity: f64) -> MoveLimits {
    let max_accel = 3000.0;
    MoveLimits {
        max_velocity: 300.0,
        max_accel,
        junction_deviation: square_corner_velocity * square_corner_velocity * (2.0_f64.sqrt() - 1.0) / max_accel,
        mcr_pseudo_accel: max_accel * 0.5,
    }
}

fn plan(points: &[[f64; 2]], speed: f64, limits: &MoveLimits) -> Vec<Move> {
    let mut queue = LookAheadQueue::new();
    for pair in points.windows(2) {
        let start = [pair[0][0], pair[0][1], 0.0, 0.0];
        let end = [pair[1][0], pair[1][1], 0.0, 0.0];
        queue.add_move(Move::new(limits, start, end, speed), &[]);
    }
    queue.flush(false)
}

#[test]
fn test_colinear_moves_keep_full_speed() {
    let points: Vec<[f64; 2]> = (0..=10).map(|i| [i as f64 * 10.0, 0.0]).collect();
    let moves = plan(&points, 100.0, &limits(5.0));
    assert_eq!(moves.len(), 10);
    assert_eq!(moves[0].start_v, 0.0);
    assert!((moves[0].accel_t - 100.0 / 3000.0).abs() < 1e-9);
    for m in &moves[1..] {
        assert!((m.start_v - 100.0).abs() < 1e-6, "junction slowed to {}", m.start_v);
    }
    assert_eq!(moves[9].end_v, 0.0);
}

#[test]
fn test_square_corner_velocity_sets_right_angle_speed() {
    let points = [[0.0, 0.0], [50.0, 0.0], [50.0, 50.0]];
    for scv in [1.0, 5.0, 10.0] {
        let moves = plan(&points, 100.0, &limits(scv));
        assert!((moves[0].end_v - scv).abs() < 1e-6, "scv {} gave {}", scv, moves[0].end_v);
        assert!((moves[1].start_v - scv).abs() < 1e-6);
    }
}

#[test]
fn test_reversal_stops() {
    let points = [[0.0, 0.0], [50.0, 0.0], [0.0, 0.0]];
    let moves = plan(&points, 100.0, &limits(5.0));
    assert!(moves[0].end_v.abs() < 1e-6);
    assert!(moves[1].start_v.abs() < 1e-6);
}

#[test]
fn test_move_times_match_distance() {
    let points: Vec<[f64; 2]> = (0..30)
        .map(|i| {
            let a = i as f64 * 0.4;
            [60.0 + 30.0 * a.cos(), 60.0 + 30.0 * a.sin()]
        })
        .collect();
    let moves = plan(&points, 150.0, &limits(5.0));
    for m in &moves {
        // Distance covered by the three phases equals the move length
        let accel_d = (m.start_v + m.cruise_v) * 0.5 * m.accel_t;
        let cruise_d = m.cruise_v * m.cruise_t;
        let decel_d = (m.end_v + m.cruise_v) * 0.5 * m.decel_t;
        assert!((accel_d + cruise_d + decel_d - m.move_d).abs() < 1e-6);
        assert!(m.total_time() >= m.move_d / 150.0 - 1e-9);
    }
}
