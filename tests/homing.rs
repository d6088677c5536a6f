// Integration tests for homing and probing on the simulated machine
use std::cell::Cell;
use std::rc::Rc;

use krusty_motion::config::{RAIL_NAMES, RailConfig};
use krusty_motion::hardware::{Endstop, Rail, Stepper};
use krusty_motion::homing::{HomeRailsHook, Homing};
use krusty_motion::simulator::{EndstopFault, SimMachine};
use krusty_motion::{Config, HomingError, PrinterHoming, ToolHead};

const STEP_DIST: f64 = 40.0 / (200.0 * 16.0);

fn create_test_config(kinematics: &str, start: [f64; 3]) -> Config {
    let mut config = Config::default();
    config.printer.kinematics = kinematics.to_string();
    for name in RAIL_NAMES {
        config.rails.insert(name.to_string(), RailConfig::default());
    }
    config.simulation.start_position = start;
    config
}

fn build(config: &Config) -> (SimMachine, ToolHead) {
    config.validate().unwrap();
    let machine = SimMachine::new(&config.simulation);
    let toolhead = machine.build_toolhead(config).unwrap();
    (machine, toolhead)
}

fn assert_near(actual: f64, expected: f64, tolerance: f64) {
    assert!(
        (actual - expected).abs() <= tolerance,
        "expected {} within {} of {}",
        actual,
        tolerance,
        expected
    );
}

async fn home_and_check(kinematics: &str) {
    let config = create_test_config(kinematics, [50.0, 60.0, 70.0]);
    let (machine, mut toolhead) = build(&config);
    let homing = PrinterHoming::new();
    homing.home_axes(&mut toolhead, &[]).await.unwrap();

    assert_eq!(toolhead.kinematics().homed_axes(), "xyz");
    let pos = toolhead.get_position();
    let physical = machine.physical_position(toolhead.print_time());
    for axis in 0..3 {
        assert_near(pos[axis], 0.0, 1e-9);
        assert_near(physical[axis], 0.0, STEP_DIST);
    }
    // Homed axes accept moves inside their range
    toolhead.move_to(&[100.0, 100.0, 10.0, 0.0], 100.0).await.unwrap();
    toolhead.wait_moves().await.unwrap();
    let physical = machine.physical_position(toolhead.print_time());
    assert_near(physical[0], 100.0, STEP_DIST);
    assert_near(physical[1], 100.0, STEP_DIST);
    assert_near(physical[2], 10.0, STEP_DIST);
}

#[tokio::test]
async fn test_cartesian_home_all() {
    home_and_check("cartesian").await;
}

#[tokio::test]
async fn test_corexy_home_all() {
    home_and_check("corexy").await;
}

#[tokio::test]
async fn test_home_single_axis() {
    let config = create_test_config("cartesian", [50.0, 60.0, 70.0]);
    let (machine, mut toolhead) = build(&config);
    PrinterHoming::new().home_axes(&mut toolhead, &[1]).await.unwrap();
    assert_eq!(toolhead.kinematics().homed_axes(), "y");
    let physical = machine.physical_position(toolhead.print_time());
    assert_near(physical[0], 50.0, 1e-9);
    assert_near(physical[1], 0.0, STEP_DIST);
}

#[tokio::test]
async fn test_halt_overshoot_is_reconciled() {
    let mut config = create_test_config("cartesian", [50.0, 60.0, 70.0]);
    config.simulation.halt_delay = 0.010;
    let (machine, mut toolhead) = build(&config);
    PrinterHoming::new().home_axes(&mut toolhead, &[0]).await.unwrap();

    // Second pass runs at 2.5mm/s, so the stepper stops 0.025mm past the switch
    let x = toolhead.get_position()[0];
    let physical = machine.physical_position(toolhead.print_time())[0];
    assert!(x < 0.0);
    assert_near(x, physical, STEP_DIST);
    assert_near(x, -0.025, STEP_DIST);
}

#[tokio::test]
async fn test_no_trigger_disables_motors() {
    let mut config = create_test_config("cartesian", [50.0, 60.0, 70.0]);
    config.rails.get_mut("x").unwrap().homing_speed = 50.0;
    let (machine, mut toolhead) = build(&config);
    machine
        .sim_endstop("x")
        .unwrap()
        .set_fault(Some(EndstopFault::Disconnected));

    let err = PrinterHoming::new().home_axes(&mut toolhead, &[0]).await.unwrap_err();
    assert!(matches!(err, HomingError::NoTrigger(ref name) if name == "x"));
    assert_eq!(err.to_string(), "No trigger on x after full movement");
    assert_eq!(toolhead.kinematics().homed_axes(), "");
    assert!(!machine.sim_stepper("stepper_x").unwrap().is_enabled());
    assert!(!machine.sim_endstop("x").unwrap().is_armed());
    assert!(!toolhead.is_shutdown());
}

#[tokio::test]
async fn test_stuck_endstop_still_triggered_after_retract() {
    let config = create_test_config("cartesian", [50.0, 60.0, 70.0]);
    let (machine, mut toolhead) = build(&config);
    let endstop = machine.sim_endstop("x").unwrap();
    assert!(!endstop.query_endstop(0.0));
    endstop.set_fault(Some(EndstopFault::Stuck));
    assert!(endstop.query_endstop(0.0));

    let err = PrinterHoming::new().home_axes(&mut toolhead, &[0]).await.unwrap_err();
    assert!(matches!(err, HomingError::StillTriggered(ref name) if name == "x"));
    assert_eq!(err.to_string(), "Endstop x still triggered after retract");
    assert_eq!(toolhead.kinematics().homed_axes(), "");
}

#[tokio::test]
async fn test_unresponsive_endstop_times_out() {
    let mut config = create_test_config("cartesian", [50.0, 60.0, 70.0]);
    config.rails.get_mut("x").unwrap().homing_speed = 50.0;
    let (machine, mut toolhead) = build(&config);
    machine
        .sim_endstop("x")
        .unwrap()
        .set_fault(Some(EndstopFault::Unresponsive));

    let err = PrinterHoming::new().home_axes(&mut toolhead, &[0]).await.unwrap_err();
    assert!(matches!(err, HomingError::CommunicationTimeout(_)));
    assert_eq!(err.to_string(), "Communication timeout during homing x");
    assert_eq!(toolhead.kinematics().homed_axes(), "");
}

#[tokio::test]
async fn test_invalid_axis_rejected_before_moving() {
    let config = create_test_config("cartesian", [50.0, 60.0, 70.0]);
    let (machine, mut toolhead) = build(&config);
    let err = PrinterHoming::new().home_axes(&mut toolhead, &[0, 3]).await.unwrap_err();
    assert!(matches!(err, HomingError::InvalidAxis(3)));
    assert_eq!(err.to_string(), "Invalid homing axis 3");
    assert_eq!(toolhead.kinematics().homed_axes(), "");
    assert_eq!(toolhead.print_time(), 0.0);
    let physical = machine.physical_position(toolhead.print_time());
    assert_near(physical[0], 50.0, 1e-9);
}

struct OffsetHook {
    calls: Cell<u32>,
}

impl HomeRailsHook for OffsetHook {
    fn home_rails_end(&self, homing: &mut Homing<'_>, rails: &[Rail]) {
        self.calls.set(self.calls.get() + 1);
        if rails.iter().any(|r| r.get_name() == "x") {
            assert!(homing.get_trigger_position("stepper_x").is_some());
            homing.set_stepper_adjustment("stepper_x", 1.0);
        }
        if rails.iter().any(|r| r.get_name() == "y") {
            // Re-declaring the homed position leaves it unchanged
            homing.set_homed_position(&[None, Some(0.0), None, None]).unwrap();
        }
    }
}

#[tokio::test]
async fn test_home_rails_hook_adjusts_position() {
    let config = create_test_config("cartesian", [50.0, 60.0, 70.0]);
    let (machine, mut toolhead) = build(&config);
    let hook = Rc::new(OffsetHook { calls: Cell::new(0) });
    let mut homing = PrinterHoming::new();
    homing.register_hook(hook.clone());
    homing.home_axes(&mut toolhead, &[0, 1]).await.unwrap();

    assert_eq!(hook.calls.get(), 2);
    let pos = toolhead.get_position();
    assert_near(pos[0], 1.0, 1e-9);
    assert_near(pos[1], 0.0, 1e-9);
    // Only the declared position moved, not the carriage
    assert_near(machine.physical_position(toolhead.print_time())[0], 0.0, STEP_DIST);
}

fn probe_config(start_z: f64) -> Config {
    let mut config = create_test_config("cartesian", [0.0, 0.0, start_z]);
    config.rails.get_mut("z").unwrap().position_min = -10.0;
    config.simulation.probe_trigger_z = Some(2.0);
    config
}

#[tokio::test]
async fn test_probe_reports_trigger_height() {
    let config = probe_config(10.0);
    let (machine, mut toolhead) = build(&config);
    let probe = machine.probe_endstop().unwrap() as Rc<dyn Endstop>;
    toolhead.set_position(&[0.0, 0.0, 10.0, 0.0], &[0, 1, 2]).unwrap();
    let homing = PrinterHoming::new();

    let first = homing
        .probing_move(&mut toolhead, probe.clone(), &[0.0, 0.0, -5.0, 0.0], 5.0)
        .await
        .unwrap();
    assert_near(first[2], 2.0, STEP_DIST);
    assert_near(toolhead.get_position()[2], first[2], 1e-9);

    // Lift and probe again
    toolhead.move_to(&[0.0, 0.0, 10.0, 0.0], 10.0).await.unwrap();
    let second = homing
        .probing_move(&mut toolhead, probe, &[0.0, 0.0, -5.0, 0.0], 2.0)
        .await
        .unwrap();
    assert_near(second[2], first[2], STEP_DIST);
}

#[tokio::test]
async fn test_probe_triggered_prior_to_movement() {
    let config = probe_config(1.0);
    let (machine, mut toolhead) = build(&config);
    let probe = machine.probe_endstop().unwrap() as Rc<dyn Endstop>;
    toolhead.set_position(&[0.0, 0.0, 1.0, 0.0], &[0, 1, 2]).unwrap();

    let err = PrinterHoming::new()
        .probing_move(&mut toolhead, probe, &[0.0, 0.0, -5.0, 0.0], 5.0)
        .await
        .unwrap_err();
    assert!(matches!(err, HomingError::TriggeredPriorToMovement(_)));
    assert_eq!(err.to_string(), "Probe triggered prior to movement");
}

#[tokio::test]
async fn test_manual_home_declares_target_position() {
    let mut config = create_test_config("cartesian", [20.0, 0.0, 0.0]);
    config.rails.get_mut("x").unwrap().position_min = -5.0;
    let (machine, mut toolhead) = build(&config);
    toolhead.set_position(&[20.0, 0.0, 0.0, 0.0], &[0, 1, 2]).unwrap();
    let endstops = toolhead.kinematics().get_rails()[0].get_endstops().to_vec();

    let target = [-5.0, 0.0, 0.0, 0.0];
    let pos = PrinterHoming::new()
        .manual_home(&mut toolhead, endstops, &target, 10.0, true, true)
        .await
        .unwrap();
    assert_eq!(pos, target);
    assert_eq!(toolhead.get_position(), target);
    assert_near(machine.physical_position(toolhead.print_time())[0], 0.0, STEP_DIST);
}
