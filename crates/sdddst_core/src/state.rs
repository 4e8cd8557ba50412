use std::path::Path;

use log::debug;

use crate::dislocation::{Dislocation, PointDefect};
use crate::error::{Result, SimulationError};
use crate::interaction::Pinning;
use crate::io;
use crate::jacobian::{Cutoff, SparseJacobian};
use crate::kernel::Kernel;
use crate::protocol::ExternalStress;
use crate::settings::SimulationSettings;

/// Positions produced by the three sub-steps of one adaptive step.
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshots {
    pub big_step: Vec<Dislocation>,
    pub first_small: Vec<Dislocation>,
    pub second_small: Vec<Dislocation>,
}

/// Per-dislocation work arrays of the corrector.
#[derive(Debug, Clone, Default)]
pub(crate) struct SpeedBuffers {
    pub initial_speed: Vec<f64>,
    pub speed: Vec<f64>,
    pub initial_speed2: Vec<f64>,
    pub speed2: Vec<f64>,
    pub residual: Vec<f64>,
    pub correction: Vec<f64>,
}

impl SpeedBuffers {
    fn resize(&mut self, n: usize) {
        for buffer in [
            &mut self.initial_speed,
            &mut self.speed,
            &mut self.initial_speed2,
            &mut self.speed2,
            &mut self.residual,
            &mut self.correction,
        ] {
            buffer.resize(n, 0.0);
        }
    }
}

/// Run statistics updated on every accepted step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunCounters {
    pub successful_steps: u64,
    pub failed_steps: u64,
    pub avalanche_count: u64,
    pub in_avalanche: bool,
    pub accumulated_strain: f64,
    /// Mean absolute speed at the last accepted state.
    pub average_speed: f64,
    pub speed_square_sum: f64,
    pub energy: f64,
    pub order_parameter: f64,
    pub(crate) sub_configuration_counter: u64,
}

/// Everything a run mutates.
///
/// Every per-dislocation array has the length of the dislocation sequence;
/// they are only resized together, when the dislocations are set.
pub struct SimulationState {
    pub(crate) dislocations: Vec<Dislocation>,
    pub(crate) points: Vec<PointDefect>,
    pub kernel: Kernel,
    pub external_stress: ExternalStress,
    pub settings: SimulationSettings,
    pub sim_time: f64,
    pub step_size: f64,
    pub counters: RunCounters,
    pub(crate) cutoff_multiplier: f64,
    pub(crate) cutoff: Cutoff,
    pub(crate) snapshots: Snapshots,
    pub(crate) buffers: SpeedBuffers,
    pub(crate) jacobian: SparseJacobian,
    dislocations_loaded: bool,
    points_loaded: bool,
}

impl SimulationState {
    pub fn new(settings: SimulationSettings, kernel: Kernel, external_stress: ExternalStress) -> Self {
        Self {
            dislocations: Vec::new(),
            points: Vec::new(),
            kernel,
            external_stress,
            sim_time: 0.0,
            step_size: settings.initial_step_size,
            counters: RunCounters::default(),
            cutoff_multiplier: settings.cutoff_multiplier,
            cutoff: Cutoff::new(settings.cutoff_multiplier, 1),
            settings,
            snapshots: Snapshots::default(),
            buffers: SpeedBuffers::default(),
            jacobian: SparseJacobian::default(),
            dislocations_loaded: false,
            points_loaded: false,
        }
    }

    /// Validates `settings` and builds the configured kernel and protocol.
    pub fn from_settings(settings: SimulationSettings) -> Result<Self> {
        settings.validate()?;
        let kernel = settings.field.build()?;
        let external_stress = settings.stress_protocol.build();
        Ok(Self::new(settings, kernel, external_stress))
    }

    pub fn set_dislocations(&mut self, dislocations: Vec<Dislocation>) -> Result<()> {
        if self.dislocations_loaded {
            return Err(SimulationError::DislocationsAlreadyLoaded);
        }
        if dislocations.is_empty() {
            return Err(SimulationError::NoDislocations);
        }
        self.resize_buffers(dislocations.len())?;
        self.dislocations = dislocations;
        self.dislocations_loaded = true;
        Ok(())
    }

    pub fn load_dislocations(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if self.dislocations_loaded {
            return Err(SimulationError::DislocationsAlreadyLoaded);
        }
        let dislocations = io::read_dislocations(path)?;
        self.set_dislocations(dislocations)
    }

    pub fn set_point_defects(&mut self, points: Vec<PointDefect>) -> Result<()> {
        if self.points_loaded {
            return Err(SimulationError::PointDefectsAlreadyLoaded);
        }
        self.points = points;
        self.points_loaded = true;
        Ok(())
    }

    pub fn load_point_defects(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if self.points_loaded {
            return Err(SimulationError::PointDefectsAlreadyLoaded);
        }
        let points = io::read_point_defects(path)?;
        self.set_point_defects(points)
    }

    pub fn dislocations(&self) -> &[Dislocation] {
        &self.dislocations
    }

    pub fn points(&self) -> &[PointDefect] {
        &self.points
    }

    pub fn dislocation_count(&self) -> usize {
        self.dislocations.len()
    }

    pub fn cutoff(&self) -> &Cutoff {
        &self.cutoff
    }

    /// Pinning constants for the current density; unscaled without point defects.
    pub fn pinning(&self) -> Pinning {
        if self.points.is_empty() {
            self.settings.pinning
        } else {
            self.settings.pinning.scaled(self.dislocations.len())
        }
    }

    /// Switches the Jacobian neighbourhood to unlimited.
    pub(crate) fn revert_cutoff(&mut self, multiplier: f64) {
        self.cutoff_multiplier = multiplier;
        self.update_cutoff();
    }

    fn update_cutoff(&mut self) {
        self.cutoff = Cutoff::new(self.cutoff_multiplier, self.dislocations.len());
        debug!(
            "Cutoff set to {:e} (multiplier {:e})",
            self.cutoff.radius(),
            self.cutoff.multiplier()
        );
    }

    fn resize_buffers(&mut self, n: usize) -> Result<()> {
        self.jacobian.resize(n)?;
        for snapshot in [
            &mut self.snapshots.big_step,
            &mut self.snapshots.first_small,
            &mut self.snapshots.second_small,
        ] {
            snapshot.resize(n, Dislocation::new(0.0, 0.0, 0.0));
        }
        self.buffers.resize(n);
        self.cutoff = Cutoff::new(self.cutoff_multiplier, n);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SimulationState {
        SimulationState::new(
            SimulationSettings::default(),
            Kernel::default(),
            ExternalStress::Zero,
        )
    }

    fn pair() -> Vec<Dislocation> {
        vec![
            Dislocation::new(-0.1, 0.0, 1.0),
            Dislocation::new(0.1, 0.0, -1.0),
        ]
    }

    #[test]
    fn setting_dislocations_resizes_every_buffer() {
        let mut state = state();
        state.set_dislocations(pair()).expect("first load");
        assert_eq!(state.dislocation_count(), 2);
        assert_eq!(state.snapshots.second_small.len(), 2);
        assert_eq!(state.buffers.initial_speed2.len(), 2);
        assert_eq!(state.buffers.correction.len(), 2);
        assert_eq!(state.jacobian.dim(), 2);
        assert_eq!(state.step_size, 1e-6);
    }

    #[test]
    fn dislocations_cannot_be_loaded_twice() {
        let mut state = state();
        state.set_dislocations(pair()).expect("first load");
        assert!(matches!(
            state.set_dislocations(pair()),
            Err(SimulationError::DislocationsAlreadyLoaded)
        ));
        state.set_point_defects(vec![]).expect("first load");
        assert!(matches!(
            state.set_point_defects(vec![]),
            Err(SimulationError::PointDefectsAlreadyLoaded)
        ));
    }

    #[test]
    fn empty_configuration_is_rejected() {
        let mut state = state();
        assert!(matches!(
            state.set_dislocations(Vec::new()),
            Err(SimulationError::NoDislocations)
        ));
    }

    #[test]
    fn pinning_is_scaled_only_with_point_defects() {
        let mut state = state();
        state.set_dislocations(pair()).expect("load");
        assert_eq!(state.pinning(), Pinning::default());
        state
            .set_point_defects(vec![PointDefect::new(0.0, 0.25)])
            .expect("load");
        assert_eq!(state.pinning(), Pinning::default().scaled(2));
    }

    #[test]
    fn cutoff_follows_dislocation_count() {
        let settings = SimulationSettings {
            cutoff_multiplier: 0.1,
            ..Default::default()
        };
        let mut state = SimulationState::new(settings, Kernel::default(), ExternalStress::Zero);
        state.set_dislocations(pair()).expect("load");
        assert!((state.cutoff().radius() - 0.1 / 2f64.sqrt()).abs() < 1e-15);
        state.revert_cutoff(1e20);
        assert_eq!(state.cutoff().multiplier(), 1e20);
    }
}
