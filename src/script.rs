// src/script.rs - TOML move scripts executed against a toolhead
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::hardware::Endstop;
use crate::homing::{HomingError, PrinterHoming};
use crate::motion::{Coord, MotionError, NUM_AXES, ToolHead, ToolHeadStatus};
use crate::trapq::TrapSegment;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Script error: {0}")]
    Config(#[from] ConfigError),
    #[error("Motion error: {0}")]
    Motion(#[from] MotionError),
    #[error("Homing error: {0}")]
    Homing(#[from] HomingError),
    #[error("Step {step}: {reason}")]
    Invalid { step: usize, reason: String },
}

/// One script step.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Absolute move; omitted coordinates keep their value.
    Move {
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        e: Option<f64>,
        speed: f64,
    },
    /// Home the listed axes ("x", "y", "z"); empty homes all.
    Home {
        #[serde(default)]
        axes: Vec<String>,
    },
    Dwell { seconds: f64 },
    /// Declare the current position, optionally marking x, y and z homed.
    SetPosition {
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        e: Option<f64>,
        #[serde(default)]
        homed: bool,
    },
    /// Probe toward the given position.
    Probe {
        x: Option<f64>,
        y: Option<f64>,
        z: f64,
        speed: f64,
    },
    SetVelocityLimit {
        velocity: Option<f64>,
        accel: Option<f64>,
        square_corner_velocity: Option<f64>,
        minimum_cruise_ratio: Option<f64>,
    },
    WaitMoves,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MoveScript {
    #[serde(default, rename = "step")]
    pub steps: Vec<ScriptStep>,
}

impl MoveScript {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }
}

pub fn load_script(path: &str) -> Result<MoveScript, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read script '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    MoveScript::from_toml(&contents)
}

/// Result of running a script.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptReport {
    pub steps: usize,
    pub probe_results: Vec<Coord>,
    pub status: ToolHeadStatus,
    /// Kinematic segments in the order they were queued.
    pub segments: Vec<TrapSegment>,
}

fn merge(current: Coord, coords: [Option<f64>; NUM_AXES]) -> Coord {
    let mut pos = current;
    for (p, c) in pos.iter_mut().zip(coords) {
        if let Some(c) = c {
            *p = c;
        }
    }
    pos
}

fn parse_axes(step: usize, axes: &[String]) -> Result<Vec<usize>, ScriptError> {
    axes.iter()
        .map(|axis| match axis.to_ascii_lowercase().as_str() {
            "x" => Ok(0),
            "y" => Ok(1),
            "z" => Ok(2),
            other => Err(ScriptError::Invalid {
                step,
                reason: format!("unknown axis '{}'", other),
            }),
        })
        .collect()
}

/// Collects newly queued kinematic segments from the toolhead's trapq.
#[derive(Debug, Default)]
struct SegmentRecorder {
    segments: Vec<TrapSegment>,
    recorded_until: f64,
}

impl SegmentRecorder {
    fn record(&mut self, toolhead: &ToolHead) {
        let trapq = toolhead.trapq();
        let new_segments = trapq.borrow().extract(self.recorded_until, f64::MAX);
        for seg in new_segments {
            if seg.print_time < self.recorded_until - 1e-9 || seg.move_t <= 0.0 {
                continue;
            }
            self.recorded_until = seg.end_time();
            self.segments.push(seg);
        }
    }
}

/// Execute `script` step by step, then wait for all motion to finish.
pub async fn run_script(
    toolhead: &mut ToolHead,
    homing: &PrinterHoming,
    probe: Option<Rc<dyn Endstop>>,
    script: &MoveScript,
) -> Result<ScriptReport, ScriptError> {
    let mut recorder = SegmentRecorder::default();
    let mut probe_results = Vec::new();
    for (index, step) in script.steps.iter().enumerate() {
        tracing::debug!("Script step {}: {:?}", index, step);
        match step {
            ScriptStep::Move { x, y, z, e, speed } => {
                let pos = merge(toolhead.get_position(), [*x, *y, *z, *e]);
                toolhead.move_to(&pos, *speed).await?;
            }
            ScriptStep::Home { axes } => {
                let axes = parse_axes(index, axes)?;
                homing.home_axes(toolhead, &axes).await?;
            }
            ScriptStep::Dwell { seconds } => toolhead.dwell(*seconds).await?,
            ScriptStep::SetPosition { x, y, z, e, homed } => {
                let pos = merge(toolhead.get_position(), [*x, *y, *z, None]);
                let homing_axes: &[usize] = if *homed { &[0, 1, 2] } else { &[] };
                toolhead.set_position(&pos, homing_axes)?;
                if let Some(e) = e {
                    toolhead.set_extra_position(3, *e)?;
                }
            }
            ScriptStep::Probe { x, y, z, speed } => {
                let Some(probe) = probe.clone() else {
                    return Err(ScriptError::Invalid {
                        step: index,
                        reason: "no probe configured".to_string(),
                    });
                };
                let pos = merge(toolhead.get_position(), [*x, *y, Some(*z), None]);
                probe_results.push(homing.probing_move(toolhead, probe, &pos, *speed).await?);
            }
            ScriptStep::SetVelocityLimit {
                velocity,
                accel,
                square_corner_velocity,
                minimum_cruise_ratio,
            } => {
                let mut limits = toolhead.limits();
                limits.max_velocity = velocity.unwrap_or(limits.max_velocity);
                limits.max_accel = accel.unwrap_or(limits.max_accel);
                limits.square_corner_velocity = square_corner_velocity.unwrap_or(limits.square_corner_velocity);
                limits.minimum_cruise_ratio = minimum_cruise_ratio.unwrap_or(limits.minimum_cruise_ratio);
                toolhead.set_velocity_limits(limits)?;
            }
            ScriptStep::WaitMoves => toolhead.wait_moves().await?,
        }
        recorder.record(toolhead);
    }
    toolhead.wait_moves().await?;
    recorder.record(toolhead);
    let eventtime = toolhead.reactor().monotonic();
    tracing::info!("Script finished: {}", toolhead.stats(eventtime).1);
    Ok(ScriptReport {
        steps: script.steps.len(),
        probe_results,
        status: toolhead.get_status(eventtime),
        segments: recorder.segments,
    })
}
