use std::path::PathBuf;
use thiserror::Error;

/// Everything that can stop a run.
///
/// None of these are recoverable mid-run: the driver propagates them and the
/// binaries report them before exiting.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed catalog or configuration, detected before simulation starts
    #[error("configuration error in {origin}: {message}")]
    Configuration { origin: String, message: String },

    /// The checkpoint needs more resources than the target machine has
    #[error(
        "checkpoint {path} is incompatible: recorded {checkpoint_cores} cores and {checkpoint_memory} bytes of memory, target has {target_cores} cores and {target_memory} bytes"
    )]
    IncompatibleCheckpoint {
        path: PathBuf,
        checkpoint_memory: u64,
        checkpoint_cores: usize,
        target_memory: u64,
        target_cores: usize,
    },

    /// Disk failure (or unreadable content) while saving or restoring
    #[error("checkpoint I/O failed at {path}: {source}")]
    CheckpointIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The statistics sink could not be written
    #[error("statistics output failed at {path}: {source}")]
    StatsIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A handler or target produced something the driver cannot act on
    #[error("event protocol error: {0}")]
    EventProtocol(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn configuration(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Configuration {
            origin: origin.into(),
            message: message.into(),
        }
    }

    pub fn checkpoint_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::CheckpointIo {
            path: path.into(),
            source,
        }
    }
}
