mod cli;

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use sdddst_core::generator::{configuration_file_name, generate_configuration};
use sdddst_core::{io as dconf, Simulation, SimulationState};

use crate::cli::{Cli, Command, InitConfigArgs, SimulateArgs};

fn simulate(args: &SimulateArgs) -> Result<()> {
    let settings = args.to_settings()?;
    let mut state =
        SimulationState::from_settings(settings).context("Failed to set up the stress field")?;
    state
        .load_dislocations(&args.dislocation_configuration)
        .with_context(|| {
            format!(
                "Failed to load dislocations from {}",
                args.dislocation_configuration.display()
            )
        })?;
    if let Some(path) = &args.point_defect_configuration {
        state
            .load_point_defects(path)
            .with_context(|| format!("Failed to load point defects from {}", path.display()))?;
    }

    let log: Box<dyn Write> = match &args.logfile_path {
        Some(path) => Box::new(BufWriter::new(File::create(path).with_context(|| {
            format!("Failed to create log file {}", path.display())
        })?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let mut simulation = Simulation::new(&mut state, log).context("Failed to start simulation")?;
    let reason = simulation.run().context("Simulation aborted")?;
    info!(
        "Done ({reason}), result written to {}",
        args.result_dislocation_configuration.display()
    );
    Ok(())
}

fn init_config(args: &InitConfigArgs) -> Result<()> {
    let seeds = args.seeds()?;
    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;
    for seed in seeds {
        info!("Generating configuration with seed value {seed}");
        let dislocations = generate_configuration(args.count, seed, !args.unsorted)?;
        let path = args
            .output_dir
            .join(configuration_file_name(seed, args.count, args.bare));
        dconf::write_dislocations(&path, &dislocations)
            .with_context(|| format!("Cannot write {}", path.display()))?;
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Simulate(args) => simulate(args),
        Command::InitConfig(args) => init_config(args),
    }
}
