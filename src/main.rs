// src/main.rs - motion-host: run a move script against the simulated machine
use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use krusty_motion::hardware::Endstop;
use krusty_motion::script::{ScriptReport, load_script, run_script};
use krusty_motion::simulator::SimMachine;
use krusty_motion::{PrinterHoming, load_config};
use tokio::task::LocalSet;

/// Host motion controller driven by a TOML move script.
#[derive(Parser, Debug)]
#[command(name = "motion-host", about = "Plan and execute a move script on a simulated printer.")]
struct Cli {
    /// Printer configuration (TOML)
    #[arg(short, long, default_value = "printer.toml")]
    config: PathBuf,

    /// Move script (TOML list of [[step]] tables)
    #[arg(short, long)]
    script: PathBuf,

    /// Log filter level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Write the JSON report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pretty-print the JSON report
    #[arg(long)]
    pretty: bool,
}

async fn run(cli: &Cli) -> Result<ScriptReport, Box<dyn std::error::Error>> {
    let config_path = cli.config.to_string_lossy();
    tracing::info!("Loading configuration from: {}", config_path);
    let config = load_config(&config_path)?;
    config.validate()?;
    tracing::info!(
        "Printer: {} ({})",
        config.printer.printer_name.as_deref().unwrap_or("Unknown"),
        config.printer.kinematics
    );
    tracing::info!("Max velocity: {} mm/s", config.printer.max_velocity);
    tracing::info!("Max acceleration: {} mm/s²", config.printer.max_accel);

    let script = load_script(&cli.script.to_string_lossy())?;
    tracing::info!("Loaded {} script steps", script.steps.len());

    let machine = SimMachine::new(&config.simulation);
    let mut toolhead = machine.build_toolhead(&config)?;
    let homing = PrinterHoming::default();
    let probe = machine.probe_endstop().map(|p| p as Rc<dyn Endstop>);
    let report = run_script(&mut toolhead, &homing, probe, &script).await?;
    Ok(report)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    let local = LocalSet::new();
    let report = match local.run_until(run(&cli)).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("motion-host failed: {}", e);
            return Err(e);
        }
    };
    tracing::info!(
        "Executed {} steps, {} segments, final position {:?}",
        report.steps,
        report.segments.len(),
        report.status.position
    );

    let json = if cli.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    match &cli.output {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{}", json),
    }
    Ok(())
}
