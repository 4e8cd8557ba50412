//! Command line options and their mapping onto [`SimulationSettings`].

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use sdddst_core::generator::DEFAULT_SEED;
use sdddst_core::kernel::DEFAULT_TABLE_SIZE;
use sdddst_core::settings::{FieldSettings, SimulationSettings, StressProtocolSettings};

#[derive(Parser, Debug)]
#[command(name = "sdddst", version, about = "Simple discrete dislocation dynamics toolkit")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a simulation from an initial dislocation configuration.
    Simulate(SimulateArgs),
    /// Generate random initial configurations.
    InitConfig(InitConfigArgs),
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// YAML settings used as the base layer; explicit flags override it.
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub dislocation_configuration: PathBuf,

    #[arg(long, value_name = "FILE")]
    pub result_dislocation_configuration: PathBuf,

    #[arg(long, value_name = "FILE")]
    pub point_defect_configuration: Option<PathBuf>,

    /// Step log destination, stdout when omitted.
    #[arg(long, value_name = "FILE")]
    pub logfile_path: Option<PathBuf>,

    #[arg(long)]
    pub time_limit: Option<f64>,

    #[arg(long)]
    pub step_count_limit: Option<u64>,

    #[arg(long)]
    pub strain_increase_limit: Option<f64>,

    /// Stop after this many avalanches; enables avalanche counting.
    #[arg(long)]
    pub avalanche_detection_limit: Option<u64>,

    #[arg(long)]
    pub avalanche_speed_threshold: Option<f64>,

    #[arg(long)]
    pub speed_limit: Option<f64>,

    #[arg(long)]
    pub external_stress_limit: Option<f64>,

    #[arg(long)]
    pub initial_stepsize: Option<f64>,

    #[arg(long)]
    pub max_stepsize: Option<f64>,

    #[arg(long)]
    pub cutoff_multiplier: Option<f64>,

    #[arg(long)]
    pub cutoff_revert_speed_threshold: Option<f64>,

    #[arg(long)]
    pub position_precision: Option<f64>,

    #[arg(long)]
    pub calculate_strain: bool,

    #[arg(long)]
    pub calculate_order_parameter: bool,

    /// Directory for periodic snapshots of the configuration.
    #[arg(long, value_name = "DIR")]
    pub save_sub_configurations: Option<PathBuf>,

    #[arg(long, requires = "save_sub_configurations")]
    pub sub_configuration_delay: Option<u64>,

    #[arg(long, requires = "save_sub_configurations")]
    pub sub_configuration_delay_during_avalanche: Option<u64>,

    /// Directory of the tabulated stress field.
    #[arg(long, value_name = "DIR", conflicts_with = "periodic_stress_field_analytic")]
    pub periodic_stress_field_elte: Option<PathBuf>,

    #[arg(long)]
    pub periodic_stress_field_analytic: bool,

    #[arg(long, conflicts_with = "fixed_rate_external_stress")]
    pub no_external_stress: bool,

    #[arg(long, value_name = "RATE", allow_negative_numbers = true)]
    pub fixed_rate_external_stress: Option<f64>,

    #[arg(long, value_name = "K", requires = "fixed_rate_external_stress")]
    pub spring_constant: Option<f64>,
}

#[derive(Args, Debug)]
pub struct InitConfigArgs {
    /// Number of dislocations, must be even.
    #[arg(short = 'N', long = "count")]
    pub count: usize,

    #[arg(short = 'S', long, default_value_t = DEFAULT_SEED)]
    pub seed_start: u64,

    /// Last seed, inclusive; must exceed the first one.
    #[arg(short = 'E', long)]
    pub seed_end: Option<u64>,

    /// Keep the generation order instead of sorting by `y + b`.
    #[arg(short = 'U', long)]
    pub unsorted: bool,

    /// Leave the dislocation count out of the file names.
    #[arg(short = 'B', long)]
    pub bare: bool,

    #[arg(long, default_value = "dislocation-configurations")]
    pub output_dir: PathBuf,
}

impl InitConfigArgs {
    pub fn seeds(&self) -> Result<std::ops::RangeInclusive<u64>> {
        match self.seed_end {
            Some(end) if end <= self.seed_start => {
                bail!("seed-end ({end}) must be larger than seed-start ({})", self.seed_start)
            }
            Some(end) => Ok(self.seed_start..=end),
            None => Ok(self.seed_start..=self.seed_start),
        }
    }
}

fn read_settings_file(path: &Path) -> Result<SimulationSettings> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open settings file {}", path.display()))?;
    serde_yaml::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse settings file {}", path.display()))
}

impl SimulateArgs {
    /// Settings from the YAML base layer with every explicit flag applied.
    pub fn to_settings(&self) -> Result<SimulationSettings> {
        let mut settings = match &self.settings {
            Some(path) => read_settings_file(path)?,
            None => SimulationSettings::default(),
        };

        let limits = &mut settings.limits;
        limits.time = self.time_limit.or(limits.time);
        limits.step_count = self.step_count_limit.or(limits.step_count);
        limits.strain_increase = self.strain_increase_limit.or(limits.strain_increase);
        limits.average_speed = self.speed_limit.or(limits.average_speed);
        limits.external_stress = self.external_stress_limit.or(limits.external_stress);
        if let Some(limit) = self.avalanche_detection_limit {
            limits.avalanche_count = Some(limit);
            settings.count_avalanches = true;
        }

        if let Some(value) = self.avalanche_speed_threshold {
            settings.avalanche_speed_threshold = value;
        }
        if let Some(value) = self.initial_stepsize {
            settings.initial_step_size = value;
        }
        settings.max_step_size = self.max_stepsize.or(settings.max_step_size);
        if let Some(value) = self.cutoff_multiplier {
            settings.cutoff_multiplier = value;
        }
        settings.cutoff_revert_speed_threshold = self
            .cutoff_revert_speed_threshold
            .or(settings.cutoff_revert_speed_threshold);
        if let Some(value) = self.position_precision {
            settings.position_precision = value;
        }
        settings.calculate_strain |= self.calculate_strain;
        settings.calculate_order_parameter |= self.calculate_order_parameter;

        if let Some(directory) = &self.save_sub_configurations {
            let mut sub = settings.sub_configurations.take().unwrap_or_default();
            sub.directory = directory.clone();
            sub.delay = self.sub_configuration_delay.unwrap_or(sub.delay);
            sub.delay_during_avalanche = self
                .sub_configuration_delay_during_avalanche
                .unwrap_or(sub.delay_during_avalanche);
            settings.sub_configurations = Some(sub);
        }

        if self.periodic_stress_field_analytic {
            settings.field = FieldSettings::Analytic;
        } else if let Some(directory) = &self.periodic_stress_field_elte {
            let (size, r0) = match settings.field {
                FieldSettings::Table { size, r0, .. } => (size, r0),
                FieldSettings::Analytic => (DEFAULT_TABLE_SIZE, 0.0),
            };
            settings.field = FieldSettings::Table {
                directory: directory.clone(),
                size,
                r0,
            };
        }

        if self.no_external_stress {
            settings.stress_protocol = StressProtocolSettings::Zero;
        } else if let Some(rate) = self.fixed_rate_external_stress {
            settings.stress_protocol = match self.spring_constant {
                Some(spring_constant) => StressProtocolSettings::Spring {
                    rate,
                    spring_constant,
                },
                None => StressProtocolSettings::FixedRate { rate },
            };
        }
        if matches!(settings.stress_protocol, StressProtocolSettings::Spring { .. }) {
            settings.calculate_strain = true;
        }

        settings.result_path = Some(self.result_dislocation_configuration.clone());
        settings
            .validate()
            .context("Invalid simulation settings")?;
        Ok(settings)
    }
}
