//! Error taxonomy for the Ephemera harness.

use miette::Diagnostic;
use thiserror::Error;

use crate::resource::ResourceKind;

/// Result type alias using [`EphemeraError`].
pub type EphemeraResult<T> = Result<T, EphemeraError>;

/// Errors surfaced by the harness, the runtime backends and the reaper.
#[derive(Error, Diagnostic, Debug)]
pub enum EphemeraError {
    /// The container spec was rejected before anything was created.
    #[error("Invalid container spec: {reason}")]
    #[diagnostic(code(ephemera::spec::invalid))]
    InvalidSpec {
        /// Why the container spec was rejected.
        reason: String,
    },

    /// Attaching a freshly created container to a network failed.
    #[error("Failed to attach container to network {network}")]
    #[diagnostic(code(ephemera::lifecycle::attach_failed))]
    AttachFailed {
        /// The network the attach targeted.
        network: String,
        /// The underlying failure.
        source: Box<EphemeraError>,
    },

    /// The runtime refused to start the container.
    #[error("Failed to start container {container}")]
    #[diagnostic(code(ephemera::lifecycle::start_failed))]
    StartFailed {
        /// The container that failed to start.
        container: String,
        /// The underlying failure.
        source: Box<EphemeraError>,
    },

    /// The container started but never satisfied its wait strategy.
    #[error("Container {container} did not become ready: {diagnostic}")]
    #[diagnostic(code(ephemera::lifecycle::not_ready))]
    NotReady {
        /// The container that was being awaited.
        container: String,
        /// The last diagnostic reported by the failing probe.
        diagnostic: String,
        /// The timeout, cancellation or probe failure.
        source: Box<EphemeraError>,
    },

    /// A probe did not succeed before its deadline.
    #[error("Timed out waiting for {probe} (last: {last})")]
    #[diagnostic(
        code(ephemera::wait::timeout),
        help("Raise the startup timeout or check the container logs")
    )]
    Timeout {
        /// Description of the probe.
        probe: String,
        /// The last pending diagnostic observed.
        last: String,
    },

    /// Waiting was cancelled by the caller.
    #[error("Cancelled while waiting for {probe}")]
    #[diagnostic(code(ephemera::wait::cancelled))]
    Cancelled {
        /// Description of the probe.
        probe: String,
    },

    /// A probe itself errored (as opposed to "not ready yet").
    #[error("Probe {probe} failed: {message}")]
    #[diagnostic(code(ephemera::wait::probe_failed))]
    ProbeFailed {
        /// Description of the probe.
        probe: String,
        /// What went wrong.
        message: String,
    },

    /// A network still has attached containers.
    #[error("Network {network} still has attached containers")]
    #[diagnostic(
        code(ephemera::network::busy),
        help("Stop or detach containers before removing their network")
    )]
    NetworkBusy {
        /// The network that could not be removed.
        network: String,
    },

    /// An alias is already taken by another container on the network.
    #[error("Alias {alias} is already in use on network {network}")]
    #[diagnostic(code(ephemera::network::alias_conflict))]
    AliasConflict {
        /// The network.
        network: String,
        /// The conflicting alias.
        alias: String,
    },

    /// No snapshot with this name exists for the container.
    #[error("Snapshot {name} not found for container {container}")]
    #[diagnostic(code(ephemera::snapshot::not_found))]
    SnapshotNotFound {
        /// The container.
        container: String,
        /// The requested snapshot name.
        name: String,
    },

    /// The runtime does not know the resource.
    #[error("{kind} not found: {id}")]
    #[diagnostic(code(ephemera::runtime::not_found))]
    NotFound {
        /// Kind of resource.
        kind: ResourceKind,
        /// The resource identifier.
        id: String,
    },

    /// The container runtime reported an error.
    #[error("Runtime error during {operation}: {message}")]
    #[diagnostic(code(ephemera::runtime))]
    Runtime {
        /// The runtime operation.
        operation: String,
        /// The runtime's message.
        message: String,
    },

    /// The reaper channel failed.
    #[error("Reaper error: {message}")]
    #[diagnostic(
        code(ephemera::reaper),
        help("Start ephemera-reaper, point EPHEMERA_REAPER_ADDR at it, or set EPHEMERA_REAPER_DISABLED=1")
    )]
    Reaper {
        /// The error message.
        message: String,
    },

    /// Nothing accepted a connection at the reaper endpoint.
    #[error("No reaper listening at {endpoint}")]
    #[diagnostic(
        code(ephemera::reaper::unreachable),
        help("Put ephemera-reaper on PATH or set EPHEMERA_REAPER_BINARY so it can be launched")
    )]
    ReaperUnreachable {
        /// The endpoint that refused.
        endpoint: String,
        /// The connect error.
        #[source]
        source: std::io::Error,
    },

    /// Session teardown left resources behind.
    #[error("Teardown incomplete: {}", .failures.join("; "))]
    #[diagnostic(
        code(ephemera::session::teardown),
        help("Leftover resources are still labeled and will be swept by the reaper")
    )]
    Teardown {
        /// One entry per resource that could not be removed.
        failures: Vec<String>,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(ephemera::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(ephemera::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(ephemera::serialization))]
    Serialization(String),
}

impl EphemeraError {
    /// Shorthand for a [`EphemeraError::Runtime`] error.
    pub fn runtime(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Runtime {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for a [`EphemeraError::InvalidSpec`] error.
    pub fn invalid_spec(reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            reason: reason.into(),
        }
    }

    /// The innermost cause, looking through lifecycle wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::AttachFailed { source, .. }
            | Self::StartFailed { source, .. }
            | Self::NotReady { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether waiting ran out of time.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), Self::Timeout { .. })
    }

    /// Whether waiting was cancelled by the caller.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Self::Cancelled { .. })
    }

    /// Whether the runtime reported the resource as missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for EphemeraError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
