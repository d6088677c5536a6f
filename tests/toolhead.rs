// Integration tests for the toolhead scheduler on the simulated machine
use std::cell::Cell;
use std::io::Write;
use std::rc::Rc;

use krusty_motion::config::{ExtruderConfig, RAIL_NAMES, RailConfig};
use krusty_motion::hardware::{McuError, Stepper};
use krusty_motion::motion::toolhead::BUFFER_TIME_HIGH;
use krusty_motion::motion::QueuingState;
use krusty_motion::scheduler::{Reactor, TriggerState, completion};
use krusty_motion::simulator::SimMachine;
use krusty_motion::{Config, MotionError, ToolHead, load_config};

fn create_test_config() -> Config {
    let mut config = Config::default();
    for name in RAIL_NAMES {
        config.rails.insert(name.to_string(), RailConfig::default());
    }
    config
}

fn homed_toolhead(config: &Config) -> (SimMachine, ToolHead) {
    let machine = SimMachine::new(&config.simulation);
    let mut toolhead = machine.build_toolhead(config).unwrap();
    toolhead.set_position(&[0.0, 0.0, 0.0, 0.0], &[0, 1, 2]).unwrap();
    (machine, toolhead)
}

#[tokio::test]
async fn test_config_file_builds_toolhead() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[printer]
kinematics = "corexy"
max_velocity = 200.0
max_accel = 2000.0

[rails.x]
position_max = 150.0
[rails.y]
position_max = 150.0
[rails.z]
position_max = 100.0
"#
    )
    .unwrap();
    let config = load_config(file.path().to_str().unwrap()).unwrap();
    config.validate().unwrap();
    let (_machine, toolhead) = homed_toolhead(&config);
    let status = toolhead.get_status(0.0);
    assert_eq!(status.homed_axes, "xyz");
    assert_eq!(status.axis_maximum, [150.0, 150.0, 100.0]);
    assert_eq!(status.limits.max_velocity, 200.0);
    assert_eq!(status.queuing_state, QueuingState::NeedPrime);
}

#[tokio::test]
async fn test_moves_are_contiguous_and_finish() {
    let config = create_test_config();
    let (machine, mut toolhead) = homed_toolhead(&config);
    let square = [[50.0, 0.0], [50.0, 50.0], [0.0, 50.0], [0.0, 0.0]];
    for [x, y] in square {
        toolhead.move_to(&[x, y, 0.0, 0.0], 100.0).await.unwrap();
    }
    toolhead.wait_moves().await.unwrap();

    assert!(toolhead.queuing_state().is_special());
    assert!(machine.reactor().monotonic() >= toolhead.print_time());
    let segments: Vec<_> = machine
        .trapq()
        .borrow()
        .extract(0.0, f64::MAX)
        .into_iter()
        .filter(|s| s.move_t > 0.0)
        .collect();
    for pair in segments.windows(2) {
        assert!((pair[0].end_time() - pair[1].print_time).abs() < 1e-9);
        let end = pair[0].end_coord();
        for axis in 0..3 {
            assert!((end[axis] - pair[1].start_pos[axis]).abs() < 1e-9);
        }
    }
    let last = machine.trapq().borrow().last_position().unwrap();
    assert!(last.iter().all(|p| p.abs() < 1e-9));
    let stepper_y = machine.sim_stepper("stepper_y").unwrap();
    assert!(stepper_y.commanded_position().abs() < 1e-9);
}

#[tokio::test]
async fn test_right_angle_corner_speed() {
    let config = create_test_config();
    let (machine, mut toolhead) = homed_toolhead(&config);
    toolhead.move_to(&[50.0, 0.0, 0.0, 0.0], 100.0).await.unwrap();
    toolhead.move_to(&[50.0, 50.0, 0.0, 0.0], 100.0).await.unwrap();
    toolhead.wait_moves().await.unwrap();

    let segments = machine.trapq().borrow().extract(0.0, f64::MAX);
    let first_y = segments
        .iter()
        .find(|s| s.move_t > 0.0 && s.axes_r[1] > 0.5)
        .unwrap();
    let last_x = segments
        .iter()
        .filter(|s| s.move_t > 0.0 && s.axes_r[0] > 0.5)
        .next_back()
        .unwrap();
    let corner_v = last_x.start_v + 2.0 * last_x.half_accel * last_x.move_t;
    assert!((corner_v - 5.0).abs() < 1e-6);
    assert!((first_y.start_v - 5.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_backpressure_bounds_buffered_time() {
    let config = create_test_config();
    let (machine, mut toolhead) = homed_toolhead(&config);
    let reactor = machine.reactor();
    for i in 0..30 {
        let x = if i % 2 == 0 { 100.0 } else { 0.0 };
        toolhead.move_to(&[x, 0.0, 0.0, 0.0], 100.0).await.unwrap();
        // Never more than the high watermark plus one lazily flushed batch ahead
        assert!(toolhead.print_time() - reactor.monotonic() < BUFFER_TIME_HIGH + 4.0);
    }
    assert!(toolhead.pause_count() > 0);
    assert!(reactor.monotonic() > 20.0);
    toolhead.wait_moves().await.unwrap();
    assert_eq!(toolhead.print_stall(), 0);
}

#[tokio::test]
async fn test_idle_priming_flushes_and_counts_stall() {
    let config = create_test_config();
    let (machine, mut toolhead) = homed_toolhead(&config);
    let reactor = machine.reactor();
    toolhead.move_to(&[10.0, 0.0, 0.0, 0.0], 100.0).await.unwrap();
    assert_eq!(toolhead.queuing_state(), QueuingState::Priming);
    assert_eq!(toolhead.lookahead_len(), 1);

    // The priming timer commits the lone move
    toolhead.idle_until(reactor.monotonic() + 0.2).await;
    assert_eq!(toolhead.lookahead_len(), 0);
    assert_eq!(toolhead.queuing_state(), QueuingState::NeedPrime);
    assert!(machine.trapq().borrow().last_position().unwrap()[0] > 9.999);

    // A new move while the flushed one is still running is a stall
    toolhead.move_to(&[20.0, 0.0, 0.0, 0.0], 100.0).await.unwrap();
    assert_eq!(toolhead.print_stall(), 1);
    toolhead.wait_moves().await.unwrap();
}

#[tokio::test]
async fn test_lookahead_callback_gets_move_end_time() {
    let config = create_test_config();
    let (_machine, mut toolhead) = homed_toolhead(&config);
    let fired = Rc::new(Cell::new(None));

    // Nothing queued: runs right away
    let now = fired.clone();
    toolhead.register_lookahead_callback(move |t| now.set(Some(t))).unwrap();
    let immediate = fired.take().unwrap();
    assert!(immediate >= 0.25);

    toolhead.move_to(&[30.0, 0.0, 0.0, 0.0], 100.0).await.unwrap();
    let later = fired.clone();
    toolhead.register_lookahead_callback(move |t| later.set(Some(t))).unwrap();
    assert!(fired.get().is_none());
    toolhead.wait_moves().await.unwrap();
    let end_time = fired.get().unwrap();
    assert!((end_time - toolhead.print_time()).abs() < 1e-9);
    assert!(end_time > immediate);
}

#[tokio::test]
async fn test_unhomed_and_invalid_moves_rejected() {
    let config = create_test_config();
    let machine = SimMachine::new(&config.simulation);
    let mut toolhead = machine.build_toolhead(&config).unwrap();
    let err = toolhead.move_to(&[10.0, 0.0, 0.0, 0.0], 100.0).await.unwrap_err();
    assert!(matches!(err, MotionError::Unhomed(_)));
    assert!(err.to_string().starts_with("Must home axis first"));

    toolhead.set_position(&[0.0, 0.0, 0.0, 0.0], &[0, 1, 2]).unwrap();
    let err = toolhead.move_to(&[250.0, 0.0, 0.0, 0.0], 100.0).await.unwrap_err();
    assert!(matches!(err, MotionError::OutOfRange(_)));
    assert!(toolhead.move_to(&[10.0, 0.0, 0.0, 0.0], 0.0).await.is_err());
    // Rejected moves leave the position untouched
    assert_eq!(toolhead.get_position(), [0.0; 4]);
    assert!(!toolhead.is_shutdown());
}

#[tokio::test]
async fn test_extrude_only_moves_skip_kinematic_checks() {
    let mut config = create_test_config();
    config.extruder = Some(ExtruderConfig::default());
    let machine = SimMachine::new(&config.simulation);
    let mut toolhead = machine.build_toolhead(&config).unwrap();
    assert_eq!(toolhead.kinematics().homed_axes(), "");

    // Unhomed: extrusion alone is accepted, any xyz motion is not
    let mut pos = toolhead.get_position();
    pos[3] += 5.0;
    toolhead.move_to(&pos, 10.0).await.unwrap();
    let mut bad = pos;
    bad[0] += 10.0;
    let err = toolhead.move_to(&bad, 100.0).await.unwrap_err();
    assert!(matches!(err, MotionError::Unhomed(_)));
    toolhead.wait_moves().await.unwrap();
    let extruder = machine.sim_stepper("extruder").unwrap();
    assert!((extruder.commanded_position() - pos[3]).abs() < 1e-9);

    // Parked outside the xy range, extrusion still runs
    toolhead.set_position(&[250.0, 0.0, 0.0, pos[3]], &[0, 1, 2]).unwrap();
    toolhead.move_to(&[250.0, 0.0, 0.0, pos[3] - 2.0], 10.0).await.unwrap();
    let err = toolhead.move_to(&[251.0, 0.0, 0.0, pos[3] - 2.0], 10.0).await.unwrap_err();
    assert!(matches!(err, MotionError::OutOfRange(_)));
    toolhead.wait_moves().await.unwrap();
    assert!((extruder.commanded_position() - (pos[3] - 2.0)).abs() < 1e-9);
    assert!(!toolhead.is_shutdown());
}

#[tokio::test]
async fn test_mcu_failure_latches_shutdown() {
    let config = create_test_config();
    let (machine, mut toolhead) = homed_toolhead(&config);
    toolhead.move_to(&[10.0, 0.0, 0.0, 0.0], 100.0).await.unwrap();
    machine.mcu().inject_failure(McuError::TimerTooClose);

    let err = toolhead.wait_moves().await.unwrap_err();
    match err {
        MotionError::Shutdown(reason) => {
            assert!(reason.contains("Exception in lookahead processing"));
            assert!(reason.contains("Timer too close"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(toolhead.is_shutdown());
    // Every later request fails with the same reason
    let again = toolhead.move_to(&[20.0, 0.0, 0.0, 0.0], 100.0).await.unwrap_err();
    assert!(matches!(again, MotionError::Shutdown(_)));
    assert!(toolhead.set_position(&[0.0; 4], &[]).is_err());
    assert!(toolhead.get_status(0.0).shutdown.is_some());
}

#[tokio::test]
async fn test_manual_move_with_junction_limit() {
    let config = create_test_config();
    let (machine, mut toolhead) = homed_toolhead(&config);
    toolhead.manual_move(&[Some(30.0), None, None, None], 100.0).await.unwrap();
    toolhead.limit_next_junction_speed(2.0);
    toolhead.manual_move(&[Some(60.0), None, None, None], 100.0).await.unwrap();
    assert_eq!(toolhead.get_position(), [60.0, 0.0, 0.0, 0.0]);
    toolhead.wait_moves().await.unwrap();

    let segments = machine.trapq().borrow().extract(0.0, f64::MAX);
    let second = segments
        .iter()
        .find(|s| s.move_t > 0.0 && s.start_pos[0] >= 30.0 - 1e-9)
        .unwrap();
    assert!((second.start_v - 2.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_dwell_advances_print_time() {
    let config = create_test_config();
    let (_machine, mut toolhead) = homed_toolhead(&config);
    toolhead.move_to(&[10.0, 0.0, 0.0, 0.0], 100.0).await.unwrap();
    let before = toolhead.get_last_move_time().unwrap();
    toolhead.dwell(0.5).await.unwrap();
    assert!((toolhead.print_time() - (before + 0.5)).abs() < 1e-9);
}

#[tokio::test]
async fn test_drip_move_stops_on_completion() {
    let config = create_test_config();
    let (machine, mut toolhead) = homed_toolhead(&config);
    let reactor = machine.reactor();
    let (handle, done) = completion();
    reactor.schedule(0.5, "stop", move || {
        handle.complete(TriggerState::Complete { trigger_time: Some(0.5) });
    });
    toolhead.drip_move(&[100.0, 0.0, 0.0, 0.0], 10.0, done).await.unwrap();

    // Ten seconds of motion cut short shortly after the trigger
    assert!(reactor.monotonic() >= 0.5);
    assert!(toolhead.print_time() < 1.5);
    assert_eq!(toolhead.queuing_state(), QueuingState::NeedPrime);
    assert_eq!(toolhead.lookahead_len(), 0);
}

#[tokio::test]
async fn test_drip_move_runs_to_end_without_trigger() {
    let config = create_test_config();
    let (machine, mut toolhead) = homed_toolhead(&config);
    let (_handle, done) = completion();
    toolhead.drip_move(&[10.0, 0.0, 0.0, 0.0], 10.0, done).await.unwrap();
    assert!(toolhead.print_time() > 1.2);
    assert_eq!(toolhead.queuing_state(), QueuingState::NeedPrime);
    let stepper_x = machine.sim_stepper("stepper_x").unwrap();
    assert!((stepper_x.commanded_position() - 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_drip_move_failure_reports_first_error() {
    let config = create_test_config();
    let (machine, mut toolhead) = homed_toolhead(&config);
    let mcu = machine.mcu();
    machine.reactor().schedule(0.3, "fail", move || {
        mcu.inject_failure(McuError::TimerTooClose);
    });
    let (_handle, done) = completion();
    let err = toolhead.drip_move(&[10.0, 0.0, 0.0, 0.0], 10.0, done).await.unwrap_err();
    match err {
        MotionError::Shutdown(reason) => {
            assert!(reason.contains("drip"), "{}", reason);
            assert!(reason.contains("Timer too close"), "{}", reason);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(toolhead.is_shutdown());
}

#[tokio::test]
async fn test_extruder_follows_extrusion() {
    let mut config = create_test_config();
    config.extruder = Some(ExtruderConfig::default());
    let (machine, mut toolhead) = homed_toolhead(&config);
    toolhead.move_to(&[20.0, 0.0, 0.0, 0.5], 50.0).await.unwrap();
    toolhead.move_to(&[20.0, 20.0, 0.0, 1.0], 50.0).await.unwrap();
    // Retract
    toolhead.move_to(&[20.0, 20.0, 0.0, 0.2], 25.0).await.unwrap();
    toolhead.wait_moves().await.unwrap();
    let extruder = machine.sim_stepper("extruder").unwrap();
    assert!((extruder.commanded_position() - 0.2).abs() < 1e-9);

    toolhead.set_extra_position(3, 0.0).unwrap();
    assert_eq!(toolhead.get_position()[3], 0.0);
    assert!(toolhead.set_extra_position(4, 0.0).is_err());
}

#[tokio::test]
async fn test_velocity_limits_update() {
    let config = create_test_config();
    let (_machine, mut toolhead) = homed_toolhead(&config);
    let mut limits = toolhead.limits();
    limits.max_accel = 500.0;
    limits.minimum_cruise_ratio = 0.0;
    toolhead.set_velocity_limits(limits).unwrap();
    assert_eq!(toolhead.get_status(0.0).limits.max_accel, 500.0);
    limits.max_velocity = -1.0;
    assert!(toolhead.set_velocity_limits(limits).is_err());
    assert_eq!(toolhead.limits().max_velocity, 300.0);
}
