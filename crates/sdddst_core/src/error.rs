use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimulationError>;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed entry in {path} at line {line}: {reason}")]
    MalformedConfiguration {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Stress table {path} is malformed: {reason}")]
    MalformedTable { path: PathBuf, reason: String },

    #[error("Stress table r0 mismatch: loaded with {loaded:e}, requested {requested:e}")]
    TableRadiusMismatch { loaded: f64, requested: f64 },

    #[error("The xy stress table must be loaded before deriving xy_diff_x")]
    MissingBaseTable,

    #[error("Unknown stress table quantity '{0}'")]
    UnknownTableQuantity(String),

    #[error("Dislocation data has already been loaded")]
    DislocationsAlreadyLoaded,

    #[error("Point defect data has already been loaded")]
    PointDefectsAlreadyLoaded,

    #[error("The simulation has no dislocations")]
    NoDislocations,

    #[error("Stress kernel evaluated at coincident positions")]
    CoincidentPositions,

    #[error("Failed to grow sparse storage by {requested} entries")]
    OutOfMemory { requested: usize },

    #[error("Invalid sparse matrix structure: {0}")]
    SparseStructure(String),

    #[error("Linear system is singular or ill-conditioned")]
    SingularSystem,

    #[error("Step size {0:e} is not a positive finite number")]
    StepSizeCollapsed(f64),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Failed to write the step log: {0}")]
    Log(#[source] std::io::Error),
}

impl SimulationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
