// src/simulator/mod.rs - Simulated MCU, steppers and endstops on a virtual clock
pub mod endstop;
pub mod event_queue;
pub mod reactor;
pub mod stepper;

pub use endstop::{EndstopFault, SimEndstop};
pub use event_queue::{SimClock, SimEventQueue};
pub use reactor::SimReactor;
pub use stepper::SimStepper;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::config::{Config, ConfigError, SimulationConfig};
use crate::hardware::{AxisMapping, Endstop, EndstopSpec, HardwareFactory, Mcu, McuError, Stepper};
use crate::motion::{ExtraAxis, Extruder, ToolHead, VelocityLimits, create_kinematics};
use crate::trapq::{SharedTrapQ, TrapQ};

/// MCU whose print clock equals the virtual host clock.
pub struct SimMcu {
    name: String,
    endstops: RefCell<Vec<Rc<SimEndstop>>>,
    pending_failure: RefCell<Option<McuError>>,
    flushed_until: Cell<f64>,
    flush_count: Cell<u64>,
}

impl SimMcu {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            endstops: RefCell::new(Vec::new()),
            pending_failure: RefCell::new(None),
            flushed_until: Cell::new(0.0),
            flush_count: Cell::new(0),
        }
    }

    pub fn register_endstop(&self, endstop: Rc<SimEndstop>) {
        self.endstops.borrow_mut().push(endstop);
    }

    /// Fail the next `flush_moves` call with `err`.
    pub fn inject_failure(&self, err: McuError) {
        *self.pending_failure.borrow_mut() = Some(err);
    }

    pub fn flushed_until(&self) -> f64 {
        self.flushed_until.get()
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count.get()
    }
}

impl Mcu for SimMcu {
    fn name(&self) -> &str {
        &self.name
    }

    fn estimated_print_time(&self, eventtime: f64) -> f64 {
        eventtime
    }

    fn flush_moves(&self, flush_time: f64, clear_history_time: f64) -> Result<(), McuError> {
        if let Some(err) = self.pending_failure.borrow_mut().take() {
            return Err(err);
        }
        for endstop in self.endstops.borrow().iter() {
            endstop.scan(flush_time);
        }
        tracing::trace!(
            "{} flush to {:.6} (history from {:.6})",
            self.name,
            flush_time,
            clear_history_time
        );
        self.flushed_until.set(self.flushed_until.get().max(flush_time));
        self.flush_count.set(self.flush_count.get() + 1);
        Ok(())
    }
}

/// A complete simulated machine: virtual clock, MCU, steppers and switches.
pub struct SimMachine {
    config: SimulationConfig,
    reactor: Rc<SimReactor>,
    mcu: Rc<SimMcu>,
    trapq: SharedTrapQ,
    steppers: RefCell<HashMap<String, Rc<SimStepper>>>,
    endstops: RefCell<HashMap<String, Rc<SimEndstop>>>,
}

impl SimMachine {
    pub fn new(config: &SimulationConfig) -> Self {
        tracing::info!("Simulated machine starting at {:?}", config.start_position);
        Self {
            config: config.clone(),
            reactor: Rc::new(SimReactor::new()),
            mcu: Rc::new(SimMcu::new(&config.mcu_name)),
            trapq: TrapQ::shared(),
            steppers: RefCell::new(HashMap::new()),
            endstops: RefCell::new(HashMap::new()),
        }
    }

    pub fn reactor(&self) -> Rc<SimReactor> {
        self.reactor.clone()
    }

    pub fn mcu(&self) -> Rc<SimMcu> {
        self.mcu.clone()
    }

    /// The kinematic trapezoid queue.
    pub fn trapq(&self) -> SharedTrapQ {
        self.trapq.clone()
    }

    pub fn sim_stepper(&self, name: &str) -> Option<Rc<SimStepper>> {
        self.steppers.borrow().get(name).cloned()
    }

    pub fn sim_endstop(&self, name: &str) -> Option<Rc<SimEndstop>> {
        self.endstops.borrow().get(name).cloned()
    }

    fn add_stepper(&self, name: &str, mapping: AxisMapping, step_dist: f64, trapq: SharedTrapQ, start: f64) -> Rc<SimStepper> {
        let stepper = Rc::new(SimStepper::new(name, mapping, step_dist, trapq, start));
        self.steppers.borrow_mut().insert(name.to_string(), stepper.clone());
        stepper
    }

    fn add_endstop(&self, name: &str, sensed: Vec<(Rc<SimStepper>, f64)>, position: f64, positive_dir: bool) -> Rc<SimEndstop> {
        let endstop = Rc::new(SimEndstop::new(
            name,
            sensed,
            position,
            positive_dir,
            self.config.halt_delay,
            self.reactor.clone(),
        ));
        self.mcu.register_endstop(endstop.clone());
        self.endstops.borrow_mut().insert(name.to_string(), endstop.clone());
        endstop
    }

    /// Probe that triggers when the physical z position reaches `probe_trigger_z`.
    pub fn probe_endstop(&self) -> Option<Rc<SimEndstop>> {
        let trigger_z = self.config.probe_trigger_z?;
        if let Some(probe) = self.sim_endstop("probe") {
            return Some(probe);
        }
        let stepper_z = self.sim_stepper("stepper_z")?;
        Some(self.add_endstop("probe", vec![(stepper_z, 1.0)], trigger_z, false))
    }

    /// Physical toolhead position at `print_time`, from the x, y and z steppers.
    pub fn physical_position(&self, print_time: f64) -> [f64; 3] {
        let mut pos = [0.0; 3];
        for (axis, name) in ["x", "y", "z"].iter().enumerate() {
            if let Some(endstop) = self.sim_endstop(name) {
                // Axis endstops sense exactly the axis coordinate
                pos[axis] = endstop.sensed_position(print_time);
            }
        }
        pos
    }

    /// Build the toolhead, kinematics and extruder for `config` on this machine.
    pub fn build_toolhead(&self, config: &Config) -> Result<ToolHead, ConfigError> {
        let kin = create_kinematics(config, self, &self.trapq)?;
        let mut extra_axes: Vec<Box<dyn ExtraAxis>> = Vec::new();
        if let Some(ext_cfg) = &config.extruder {
            let trapq = TrapQ::shared();
            let stepper = self.add_stepper("extruder", AxisMapping::Axis(0), ext_cfg.step_distance(), trapq.clone(), 0.0);
            extra_axes.push(Box::new(Extruder::new(
                "extruder",
                ext_cfg,
                config.printer.max_velocity,
                config.printer.max_accel,
                trapq,
                Some(stepper as Rc<dyn Stepper>),
            )));
        }
        ToolHead::new(
            VelocityLimits::from_config(&config.printer),
            self.reactor.clone(),
            self.mcu.clone(),
            kin,
            self.trapq.clone(),
            extra_axes,
        )
    }
}

impl HardwareFactory for SimMachine {
    fn stepper(&self, name: &str, mapping: AxisMapping, step_dist: f64, trapq: SharedTrapQ) -> Rc<dyn Stepper> {
        let start = mapping.position(&self.config.start_position);
        self.add_stepper(name, mapping, step_dist, trapq, start)
    }

    fn endstop(&self, spec: &EndstopSpec, _steppers: Vec<Rc<dyn Stepper>>) -> Rc<dyn Endstop> {
        let sensed: Vec<(Rc<SimStepper>, f64)> = spec
            .sensed
            .iter()
            .filter_map(|(name, weight)| match self.sim_stepper(name) {
                Some(stepper) => Some((stepper, *weight)),
                None => {
                    tracing::warn!("Endstop {} senses unknown stepper {}", spec.name, name);
                    None
                }
            })
            .collect();
        self.add_endstop(&spec.name, sensed, spec.position_endstop, spec.positive_dir)
    }
}
