use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};
use crate::interaction::Pinning;
use crate::jacobian::INFINITE_CUTOFF_MULTIPLIER;
use crate::kernel::{AnalyticKernel, Kernel, TableKernel, DEFAULT_TABLE_SIZE};
use crate::protocol::{ExternalStress, FixedRateProtocol, SpringProtocol};

/// Conditions that end a run. A run stops as soon as any of them holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopLimits {
    pub time: Option<f64>,
    pub step_count: Option<u64>,
    pub strain_increase: Option<f64>,
    pub avalanche_count: Option<u64>,
    pub average_speed: Option<f64>,
    pub external_stress: Option<f64>,
}

impl StopLimits {
    pub fn is_empty(&self) -> bool {
        self.time.is_none()
            && self.step_count.is_none()
            && self.strain_increase.is_none()
            && self.avalanche_count.is_none()
            && self.average_speed.is_none()
            && self.external_stress.is_none()
    }
}

/// Periodic snapshots of the dislocation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubConfigurationSettings {
    pub directory: PathBuf,
    /// Accepted steps between two snapshots.
    pub delay: u64,
    pub delay_during_avalanche: u64,
}

impl Default for SubConfigurationSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            delay: 5,
            delay_during_avalanche: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FieldSettings {
    Analytic,
    Table {
        directory: PathBuf,
        #[serde(default = "default_table_size")]
        size: usize,
        #[serde(default)]
        r0: f64,
    },
}

fn default_table_size() -> usize {
    DEFAULT_TABLE_SIZE
}

impl Default for FieldSettings {
    fn default() -> Self {
        FieldSettings::Table {
            directory: PathBuf::from("."),
            size: DEFAULT_TABLE_SIZE,
            r0: 0.0,
        }
    }
}

impl FieldSettings {
    pub fn build(&self) -> Result<Kernel> {
        match self {
            FieldSettings::Analytic => Ok(Kernel::Analytic(AnalyticKernel::default())),
            FieldSettings::Table {
                directory,
                size,
                r0,
            } => Ok(Kernel::Table(TableKernel::load(directory, *size, *r0)?)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StressProtocolSettings {
    #[default]
    Zero,
    FixedRate {
        rate: f64,
    },
    Spring {
        rate: f64,
        spring_constant: f64,
    },
}

impl StressProtocolSettings {
    pub fn build(&self) -> ExternalStress {
        match *self {
            StressProtocolSettings::Zero => ExternalStress::Zero,
            StressProtocolSettings::FixedRate { rate } => {
                ExternalStress::FixedRate(FixedRateProtocol::new(rate))
            }
            StressProtocolSettings::Spring {
                rate,
                spring_constant,
            } => ExternalStress::Spring(SpringProtocol::new(rate, spring_constant)),
        }
    }
}

/// Every knob of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub position_precision: f64,
    pub initial_step_size: f64,
    pub max_step_size: Option<f64>,
    pub cutoff_multiplier: f64,
    /// Newton iterations per sub-step.
    pub iterations: usize,
    pub pinning: Pinning,
    pub field: FieldSettings,
    pub stress_protocol: StressProtocolSettings,
    pub calculate_strain: bool,
    pub calculate_order_parameter: bool,
    pub count_avalanches: bool,
    pub avalanche_speed_threshold: f64,
    /// Below this average speed the cutoff is reverted to infinite.
    pub cutoff_revert_speed_threshold: Option<f64>,
    pub limits: StopLimits,
    pub sub_configurations: Option<SubConfigurationSettings>,
    pub result_path: Option<PathBuf>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            position_precision: 1e-5,
            initial_step_size: 1e-6,
            max_step_size: None,
            cutoff_multiplier: INFINITE_CUTOFF_MULTIPLIER,
            iterations: 2,
            pinning: Pinning::default(),
            field: FieldSettings::default(),
            stress_protocol: StressProtocolSettings::default(),
            calculate_strain: false,
            calculate_order_parameter: false,
            count_avalanches: false,
            avalanche_speed_threshold: 1e-3,
            cutoff_revert_speed_threshold: None,
            limits: StopLimits::default(),
            sub_configurations: None,
            result_path: None,
        }
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SimulationError::InvalidSettings(format!(
            "{name} must be positive, got {value}"
        )))
    }
}

impl SimulationSettings {
    pub fn validate(&self) -> Result<()> {
        positive("position precision", self.position_precision)?;
        positive("initial step size", self.initial_step_size)?;
        positive("cutoff multiplier", self.cutoff_multiplier)?;
        if let Some(max) = self.max_step_size {
            positive("max step size", max)?;
        }
        if self.iterations == 0 {
            return Err(SimulationError::InvalidSettings(
                "at least one corrector iteration is required".into(),
            ));
        }
        if let FieldSettings::Table { size, .. } = self.field {
            if size < 2 {
                return Err(SimulationError::InvalidSettings(format!(
                    "stress table size {size} is too small"
                )));
            }
        }
        if matches!(self.stress_protocol, StressProtocolSettings::Spring { .. })
            && !self.calculate_strain
        {
            return Err(SimulationError::InvalidSettings(
                "the spring protocol needs strain calculation".into(),
            ));
        }
        if self.limits.avalanche_count.is_some() && !self.count_avalanches {
            return Err(SimulationError::InvalidSettings(
                "an avalanche limit needs avalanche counting".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_toolkit() {
        let settings = SimulationSettings::default();
        assert_eq!(settings.position_precision, 1e-5);
        assert_eq!(settings.initial_step_size, 1e-6);
        assert_eq!(settings.cutoff_multiplier, 1e20);
        assert_eq!(settings.iterations, 2);
        assert_eq!(settings.pinning.strength, 16e-4);
        assert!((settings.pinning.screening - 10634.765625).abs() < 1e-9);
        assert_eq!(settings.avalanche_speed_threshold, 1e-3);
        assert!(settings.limits.is_empty());
        assert!(settings.validate().is_ok());

        let sub = SubConfigurationSettings::default();
        assert_eq!((sub.delay, sub.delay_during_avalanche), (5, 1));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut settings = SimulationSettings {
            position_precision: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SimulationError::InvalidSettings(_))
        ));

        settings.position_precision = 1e-5;
        settings.iterations = 0;
        assert!(settings.validate().is_err());

        settings.iterations = 2;
        settings.initial_step_size = f64::NAN;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn spring_protocol_requires_strain() {
        let mut settings = SimulationSettings {
            stress_protocol: StressProtocolSettings::Spring {
                rate: 1.0,
                spring_constant: 2.0,
            },
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        settings.calculate_strain = true;
        assert!(settings.validate().is_ok());
        assert_eq!(settings.stress_protocol.build().kind(), "spring-stress");
    }

    #[test]
    fn analytic_field_builds_without_files() {
        let kernel = FieldSettings::Analytic.build().expect("analytic kernel");
        assert_eq!(kernel.name(), "analytic");
    }

    #[test]
    fn missing_table_directory_fails_to_build() {
        let field = FieldSettings::Table {
            directory: std::env::temp_dir().join("sdddst-no-such-table-dir"),
            size: 16,
            r0: 0.0,
        };
        assert!(matches!(field.build(), Err(SimulationError::Io { .. })));
    }
}
