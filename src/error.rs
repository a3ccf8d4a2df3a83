//! Error types for resolving, launching and supervising services.

use std::io;
use std::process::ExitStatus;

use thiserror::Error;

use crate::output::StreamKind;
use crate::shutdown::ProcessSignal;

/// Unified error type for a stackup run.
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration declares a newer format than this build understands.
    #[error("config version {found} is newer than the supported version {supported}, stackup needs to be updated")]
    ConfigVersionUnsupported {
        /// Version declared by the configuration.
        found: u32,
        /// Highest version this build supports.
        supported: u32,
    },

    /// A requested service or a dependency has no definition.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The requested services cannot be ordered.
    #[error("circular service dependency detected between: {}", .remaining.join(", "))]
    CircularDependency {
        /// Services left unresolved when ordering stalled.
        remaining: Vec<String>,
    },

    /// The service has no command to run.
    #[error("service {0}: command required")]
    EmptyCommand(String),

    /// The service process could not be started.
    #[error("error starting service {name}: {source}")]
    Spawn {
        /// Service name.
        name: String,
        /// Underlying spawn failure.
        #[source]
        source: io::Error,
    },

    /// A shutdown signal could not be delivered to a process group.
    #[error("error sending {signal} to service {name} (process group {pgid}): {source}")]
    SignalDelivery {
        /// Service name.
        name: String,
        /// Signal that failed.
        signal: ProcessSignal,
        /// Target process group.
        pgid: u32,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Waiting for the service process failed.
    #[error("error waiting for service {name} to exit: {source}")]
    ProcessReap {
        /// Service name.
        name: String,
        /// Underlying wait failure.
        #[source]
        source: io::Error,
    },

    /// Reading a service's output stream failed before end of input.
    #[error("error reading {stream} of service {name}: {source}")]
    OutputRead {
        /// Service name.
        name: String,
        /// Stream being read.
        stream: StreamKind,
        /// Underlying read failure.
        #[source]
        source: io::Error,
    },

    /// Adjusting process resource limits failed.
    #[error("error setting system limits: {0}")]
    ResourceLimit(#[source] io::Error),

    /// The run was interrupted by the user or by a signal.
    #[error("interrupted by user")]
    Interrupted,

    /// A service process exited unsuccessfully.
    #[error("service {name} exited with {status}")]
    ServiceExited {
        /// Service name.
        name: String,
        /// Exit status reported by the OS.
        status: ExitStatus,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
