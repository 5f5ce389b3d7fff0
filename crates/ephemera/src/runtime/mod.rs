//! Container runtime contract.
//!
//! Everything the harness does to containers, networks and volumes goes
//! through [`RuntimeClient`]. Two backends ship with the crate:
//!
//! - [`MemoryRuntime`]: an in-process runtime used by the test suite
//! - `DockerRuntime` (feature `docker`): the Docker Engine API via `bollard`
//!
//! Backends report missing resources as [`EphemeraError::NotFound`] so callers
//! can treat them as already removed, and a network that still has endpoints
//! as [`EphemeraError::NetworkBusy`].

#[cfg(feature = "docker")]
mod docker;
mod memory;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ephemera_common::{EphemeraError, EphemeraResult, ResourceId, ResourceKind};
use futures::stream::BoxStream;

use crate::spec::{ContainerPort, ContainerSpec, Mount};

#[cfg(feature = "docker")]
pub use docker::DockerRuntime;
pub use memory::{FaultPoint, ImageBehavior, MemoryRuntime};

/// Container output, stdout and stderr interleaved.
pub type LogStream = BoxStream<'static, EphemeraResult<Bytes>>;

/// What the runtime needs to create a container.
#[derive(Debug, Clone, Default)]
pub struct CreateConfig {
    /// Container name.
    pub name: Option<String>,
    /// Fully resolved image reference.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Command override.
    pub cmd: Vec<String>,
    /// Ports to publish on random host ports.
    pub exposed_ports: Vec<ContainerPort>,
    /// Mounts.
    pub mounts: Vec<Mount>,
    /// tmpfs mounts.
    pub tmpfs: BTreeMap<String, String>,
    /// All labels, reserved ones included.
    pub labels: BTreeMap<String, String>,
}

impl CreateConfig {
    /// Build the runtime request for a spec.
    #[must_use]
    pub fn from_spec(spec: &ContainerSpec, image: String, labels: BTreeMap<String, String>) -> Self {
        Self {
            name: spec.name.clone(),
            image,
            env: spec.env.clone(),
            cmd: spec.cmd.clone(),
            exposed_ports: spec.exposed_ports.clone(),
            mounts: spec.mounts.clone(),
            tmpfs: spec.tmpfs.clone(),
            labels,
        }
    }
}

/// Container state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Created, never started.
    Created,
    /// Running.
    Running,
    /// Exited with a code.
    Exited(i64),
    /// Anything else the runtime reports.
    Unknown,
}

impl ContainerStatus {
    /// Whether the container is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Result of an inspect.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Runtime identifier.
    pub id: ResourceId,
    /// Container name, if any.
    pub name: Option<String>,
    /// Image the container runs.
    pub image: String,
    /// Current state.
    pub status: ContainerStatus,
    /// Host addresses of published ports.
    pub ports: HashMap<ContainerPort, SocketAddr>,
    /// Container labels.
    pub labels: HashMap<String, String>,
}

/// Result of an exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, `-1` if the runtime did not report one.
    pub exit_code: i64,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command exited with code 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A resource found by label.
#[derive(Debug, Clone)]
pub struct LabeledResource {
    /// Runtime identifier.
    pub id: ResourceId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Labels on the resource.
    pub labels: HashMap<String, String>,
    /// Creation time, when the runtime reports it.
    pub created_at: Option<DateTime<Utc>>,
}

/// Operations the harness needs from a container runtime.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Create a container and return its id.
    async fn create(&self, config: &CreateConfig) -> EphemeraResult<ResourceId>;

    /// Start a created container.
    async fn start(&self, id: &ResourceId) -> EphemeraResult<()>;

    /// Stop a container, killing it after the grace period.
    async fn stop(&self, id: &ResourceId, timeout: Duration) -> EphemeraResult<()>;

    /// Force-remove a container and its anonymous volumes.
    async fn remove(&self, id: &ResourceId) -> EphemeraResult<()>;

    /// Inspect a container.
    async fn inspect(&self, id: &ResourceId) -> EphemeraResult<ContainerInfo>;

    /// Write a file into a container, creating missing parent directories.
    async fn copy_to(
        &self,
        id: &ResourceId,
        path: &str,
        content: &Bytes,
        mode: u32,
    ) -> EphemeraResult<()>;

    /// Run a command in a running container.
    async fn exec(&self, id: &ResourceId, cmd: &[String]) -> EphemeraResult<ExecOutput>;

    /// Follow the container output from the beginning.
    async fn logs(&self, id: &ResourceId) -> EphemeraResult<LogStream>;

    /// List resources carrying `key`, optionally with a specific value.
    async fn list_by_label(
        &self,
        kind: ResourceKind,
        key: &str,
        value: Option<&str>,
    ) -> EphemeraResult<Vec<LabeledResource>>;

    /// Create a network.
    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> EphemeraResult<ResourceId>;

    /// Remove a network.
    async fn remove_network(&self, id: &ResourceId) -> EphemeraResult<()>;

    /// Connect a container to a network under aliases.
    async fn connect(
        &self,
        network: &ResourceId,
        container: &ResourceId,
        aliases: &[String],
    ) -> EphemeraResult<()>;

    /// Disconnect a container from a network.
    async fn disconnect(&self, network: &ResourceId, container: &ResourceId) -> EphemeraResult<()>;

    /// Create a named volume.
    async fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> EphemeraResult<ResourceId>;

    /// Remove a named volume.
    async fn remove_volume(&self, id: &ResourceId) -> EphemeraResult<()>;

    /// Remove any kind of resource.
    async fn remove_resource(&self, kind: ResourceKind, id: &ResourceId) -> EphemeraResult<()> {
        match kind {
            ResourceKind::Container => self.remove(id).await,
            ResourceKind::Network => self.remove_network(id).await,
            ResourceKind::Volume => self.remove_volume(id).await,
        }
    }
}

/// Treat a missing resource as success.
pub(crate) fn ignore_not_found(result: EphemeraResult<()>) -> EphemeraResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

pub(crate) fn not_found(kind: ResourceKind, id: impl ToString) -> EphemeraError {
    EphemeraError::NotFound {
        kind,
        id: id.to_string(),
    }
}
