//! Core of a two-dimensional discrete dislocation dynamics simulator.
//!
//! Key components:
//! - **Kernels**: periodic pairwise shear stress, closed form or tabulated.
//! - **Protocols**: externally applied stress as a function of time and strain.
//! - **Precision**: per-dislocation tolerances and the step size controller.
//! - **Jacobian / linear solver**: sparse linearization of the implicit update.
//! - **Simulation**: the adaptive step (one full step against two half steps)
//!   and the run loop.
pub mod dislocation;
pub mod error;
pub mod format;
pub mod generator;
pub mod interaction;
pub mod io;
pub mod jacobian;
pub mod kernel;
pub mod linear_solver;
pub mod precision;
pub mod protocol;
pub mod report;
pub mod settings;
pub mod simulation;
pub mod state;

pub use dislocation::{Dislocation, PointDefect};
pub use error::{Result, SimulationError};
pub use kernel::{Kernel, StressKernel};
pub use protocol::{ExternalStress, StressSlot};
pub use settings::{
    FieldSettings, SimulationSettings, StopLimits, StressProtocolSettings,
    SubConfigurationSettings,
};
pub use simulation::{Simulation, StepOutcome, StopReason};
pub use state::SimulationState;
