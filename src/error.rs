// src/error.rs
//
// =============================================================================
// ATOMFLOW: ERROR KINDS (v 0.1)
// =============================================================================
//
// The named error kinds from the error-handling design. These are the only
// errors a caller needs to pattern-match on; everything else travels as
// `anyhow::Error` with context attached at each I/O boundary and is only
// narrowed to one of these variants at the Worker/CLI surface.
//
// `EngineNonConvergence` is deliberately absent: it is not an error, it is
// surfaced via `Driver::read_convergence() == false`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed DriverSetting, unknown task, unknown engine.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Submission refused by the scheduler; the batch stays un-queued.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Engine binary/environment missing.
    #[error("driver startup error: {0}")]
    DriverStartup(String),

    /// Engine produced no readable frames.
    #[error("trajectory is empty")]
    TrajectoryEmpty,

    /// Two Workers (or two calls) contending for the same directory/batch.
    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
