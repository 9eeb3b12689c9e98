use std::io;

use thiserror::Error;

/// Errors a trace session can surface to the caller.
///
/// Illegal state-machine transitions are deliberately absent: they are a
/// programming/usage error, logged and ignored, never reported as a failure.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Empty or blank target string. Recoverable; the session stays Idle.
    #[error("no target specified")]
    InvalidTarget,

    /// Address lookup failed before the session could start.
    #[error("unable to resolve target: {0}")]
    Resolution(String),

    /// The probe engine never came up; no session may start.
    #[error("probe engine failed to initialize")]
    InitializationFailure,

    /// Directory or file I/O failed during a history flush. The buffered
    /// lines are retained and the flush is retried on the next tick.
    #[error("history flush failed: {0}")]
    Persistence(#[from] io::Error),

    /// The OS refused to spawn the probe worker thread.
    #[error("failed to spawn probe worker: {0}")]
    WorkerSpawn(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, TraceError>;
