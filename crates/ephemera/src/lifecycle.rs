//! Bringing containers up and down.
//!
//! [`LifecycleCoordinator::start`] runs the pipeline
//! validate -> label -> create -> register -> copy files -> attach -> start
//! -> wait.
//! Each step that creates something pushes its undo onto a compensation
//! stack; when a later step fails the stack is unwound in reverse, so a
//! failed start leaves nothing behind. Compensation failures are logged and
//! never mask the original error; whatever could not be removed still
//! carries the session labels and is left to the session teardown or the
//! reaper.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ephemera_common::{EphemeraError, EphemeraResult, ResourceHandle, ResourceId, ResourceKind};
use parking_lot::Mutex;

use crate::network::NetworkFabric;
use crate::runtime::{
    ContainerInfo, CreateConfig, ExecOutput, LogStream, RuntimeClient, ignore_not_found,
};
use crate::session::Session;
use crate::snapshot::SnapshotManager;
use crate::spec::{ContainerPort, ContainerSpec, MountSource};
use crate::wait::{ProbeTarget, WaitContext, WaitEvaluator};

/// Grace period before a stopped container is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum Compensation {
    RemoveVolume(ResourceId),
    RemoveContainer(ResourceId),
    Detach {
        network: ResourceId,
        container: ResourceId,
    },
}

struct ContainerTarget {
    runtime: Arc<dyn RuntimeClient>,
    id: ResourceId,
    ports: HashMap<ContainerPort, SocketAddr>,
}

#[async_trait]
impl ProbeTarget for ContainerTarget {
    fn endpoint(&self, port: ContainerPort) -> Option<SocketAddr> {
        self.ports.get(&port).copied()
    }

    async fn logs(&self) -> EphemeraResult<LogStream> {
        self.runtime.logs(&self.id).await
    }
}

/// Starts, stops and tracks the containers of one session.
#[derive(Debug)]
pub struct LifecycleCoordinator {
    session: Arc<Session>,
    fabric: NetworkFabric,
    snapshots: SnapshotManager,
    ports: Mutex<HashMap<ResourceId, HashMap<ContainerPort, SocketAddr>>>,
}

impl LifecycleCoordinator {
    /// Create a coordinator for a session.
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            fabric: NetworkFabric::new(Arc::clone(&session)),
            snapshots: SnapshotManager::new(Arc::clone(&session)),
            session,
            ports: Mutex::new(HashMap::new()),
        }
    }

    /// The session.
    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The network fabric.
    #[must_use]
    pub const fn networks(&self) -> &NetworkFabric {
        &self.fabric
    }

    /// The snapshot manager.
    #[must_use]
    pub const fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// Start a container and wait until it is ready.
    ///
    /// # Errors
    ///
    /// - [`EphemeraError::InvalidSpec`] before anything is created
    /// - [`EphemeraError::AttachFailed`], [`EphemeraError::StartFailed`] or
    ///   [`EphemeraError::NotReady`] after rolling back
    /// - the runtime or reaper error if creation itself failed
    pub async fn start(&self, spec: &ContainerSpec) -> EphemeraResult<ResourceHandle> {
        self.start_with(spec, &WaitContext::new()).await
    }

    /// [`start`](Self::start) under a caller-controlled deadline and
    /// cancellation token.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub async fn start_with(
        &self,
        spec: &ContainerSpec,
        ctx: &WaitContext,
    ) -> EphemeraResult<ResourceHandle> {
        spec.validate()?;
        let mut labels = spec.labels.clone();
        labels.extend(self.session.labels().await?);
        let image = self.session.settings().resolve_image(&spec.image);
        let runtime = self.session.runtime();
        let mut undo = Vec::new();

        for mount in &spec.mounts {
            let MountSource::Volume(name) = &mount.source else {
                continue;
            };
            if self.session.registry().get(&ResourceId::new(name.as_str())).is_some() {
                continue;
            }
            match runtime.create_volume(name, &labels).await {
                Ok(id) => {
                    self.session.register(id.clone(), ResourceKind::Volume, labels.clone());
                    undo.push(Compensation::RemoveVolume(id));
                }
                Err(e) => return Err(self.rollback(undo, e).await),
            }
        }

        let config = CreateConfig::from_spec(spec, image, labels.clone());
        let id = match runtime.create(&config).await {
            Ok(id) => id,
            Err(e) => return Err(self.rollback(undo, e).await),
        };
        let handle = self.session.register(id.clone(), ResourceKind::Container, labels);
        undo.push(Compensation::RemoveContainer(id.clone()));
        tracing::debug!(container = %id.short(), image = %config.image, "Container created");

        for file in &spec.files {
            if let Err(e) = runtime.copy_to(&id, &file.path, &file.content, file.mode).await {
                return Err(self.rollback(undo, e).await);
            }
        }

        for attachment in &spec.networks {
            if let Err(e) = self
                .fabric
                .attach(&id, &attachment.network, &attachment.aliases)
                .await
            {
                let err = EphemeraError::AttachFailed {
                    network: attachment.network.to_string(),
                    source: Box::new(e),
                };
                return Err(self.rollback(undo, err).await);
            }
            undo.push(Compensation::Detach {
                network: attachment.network.clone(),
                container: id.clone(),
            });
        }

        if let Err(e) = runtime.start(&id).await {
            let err = EphemeraError::StartFailed {
                container: id.to_string(),
                source: Box::new(e),
            };
            return Err(self.rollback(undo, err).await);
        }

        let ports = match runtime.inspect(&id).await {
            Ok(info) => info.ports,
            Err(e) => {
                let err = EphemeraError::NotReady {
                    container: id.to_string(),
                    diagnostic: format!("inspect failed: {e}"),
                    source: Box::new(e),
                };
                return Err(self.rollback(undo, err).await);
            }
        };

        let target = ContainerTarget {
            runtime: Arc::clone(runtime),
            id: id.clone(),
            ports,
        };
        if let Err(e) = WaitEvaluator::wait(ctx, &spec.wait, &target).await {
            let diagnostic = match &e {
                EphemeraError::Timeout { last, .. } => last.clone(),
                EphemeraError::ProbeFailed { message, .. } => message.clone(),
                EphemeraError::Cancelled { .. } => "cancelled".to_string(),
                other => other.to_string(),
            };
            let err = EphemeraError::NotReady {
                container: id.to_string(),
                diagnostic,
                source: Box::new(e),
            };
            return Err(self.rollback(undo, err).await);
        }

        self.ports.lock().insert(id.clone(), target.ports);
        tracing::info!(
            container = %id.short(),
            image = %config.image,
            session = %self.session.id().short(),
            "Container ready"
        );
        Ok(handle)
    }

    /// Stop and remove a container. Stopping a container that is already
    /// gone succeeds, so calling this twice is harmless.
    ///
    /// The container is forgotten by the session whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`EphemeraError::InvalidSpec`] for a non-container handle, or
    /// the runtime error if removal failed.
    pub async fn stop(&self, handle: &ResourceHandle, timeout: Duration) -> EphemeraResult<()> {
        if !handle.is_container() {
            return Err(EphemeraError::invalid_spec(format!(
                "cannot stop {handle}: not a container"
            )));
        }
        let id = &handle.id;
        let runtime = self.session.runtime();
        if let Err(e) = ignore_not_found(runtime.stop(id, timeout).await) {
            tracing::warn!(container = %id.short(), error = %e, "Graceful stop failed, removing anyway");
        }
        let removed = ignore_not_found(runtime.remove(id).await);
        self.forget(id);
        if let Err(e) = &removed {
            tracing::warn!(container = %id.short(), error = %e, "Failed to remove container");
        } else {
            tracing::info!(container = %id.short(), "Container stopped");
        }
        removed
    }

    /// Run a command inside a running container.
    ///
    /// # Errors
    ///
    /// Returns the runtime error if the exec could not run.
    pub async fn exec(&self, handle: &ResourceHandle, cmd: &[String]) -> EphemeraResult<ExecOutput> {
        self.session.runtime().exec(&handle.id, cmd).await
    }

    /// Follow the container output from the beginning.
    ///
    /// # Errors
    ///
    /// Returns the runtime error if the container is unknown.
    pub async fn logs(&self, handle: &ResourceHandle) -> EphemeraResult<LogStream> {
        self.session.runtime().logs(&handle.id).await
    }

    /// Current runtime view of a container.
    ///
    /// # Errors
    ///
    /// Returns the runtime error if the container is unknown.
    pub async fn inspect(&self, handle: &ResourceHandle) -> EphemeraResult<ContainerInfo> {
        self.session.runtime().inspect(&handle.id).await
    }

    /// Host address of a published port of a ready container.
    ///
    /// # Errors
    ///
    /// Returns [`EphemeraError::NotFound`] for a container this coordinator
    /// did not start, or [`EphemeraError::Runtime`] for an unpublished port.
    pub fn endpoint(
        &self,
        handle: &ResourceHandle,
        port: impl Into<ContainerPort>,
    ) -> EphemeraResult<SocketAddr> {
        let port = port.into();
        let ports = self.ports.lock();
        let published = ports.get(&handle.id).ok_or_else(|| EphemeraError::NotFound {
            kind: ResourceKind::Container,
            id: handle.id.to_string(),
        })?;
        published.get(&port).copied().ok_or_else(|| {
            EphemeraError::runtime(
                "mapped_port",
                format!("port {port} of {} is not published", handle.id.short()),
            )
        })
    }

    /// Host port of a published port of a ready container.
    ///
    /// # Errors
    ///
    /// See [`endpoint`](Self::endpoint).
    pub fn mapped_port(
        &self,
        handle: &ResourceHandle,
        port: impl Into<ContainerPort>,
    ) -> EphemeraResult<u16> {
        self.endpoint(handle, port).map(|addr| addr.port())
    }

    /// Tear the whole session down.
    ///
    /// # Errors
    ///
    /// See [`Session::terminate`].
    pub async fn terminate(&self) -> EphemeraResult<()> {
        let result = self.session.terminate().await;
        for id in self.ports.lock().drain().map(|(id, _)| id) {
            self.fabric.forget_container(&id);
            self.snapshots.forget_container(&id);
        }
        result
    }

    fn forget(&self, id: &ResourceId) {
        self.session.registry().deregister(id);
        self.fabric.forget_container(id);
        self.snapshots.forget_container(id);
        self.ports.lock().remove(id);
    }

    async fn rollback(&self, undo: Vec<Compensation>, err: EphemeraError) -> EphemeraError {
        tracing::warn!(error = %err, steps = undo.len(), "Start failed, rolling back");
        let runtime = self.session.runtime();
        for step in undo.into_iter().rev() {
            let result = match &step {
                Compensation::Detach { network, container } => {
                    self.fabric.detach(container, network).await
                }
                Compensation::RemoveContainer(id) => {
                    let removed = ignore_not_found(runtime.remove(id).await);
                    if removed.is_ok() {
                        self.forget(id);
                    }
                    removed
                }
                Compensation::RemoveVolume(id) => {
                    let removed = ignore_not_found(runtime.remove_volume(id).await);
                    if removed.is_ok() {
                        self.session.registry().deregister(id);
                    }
                    removed
                }
            };
            if let Err(e) = result {
                tracing::warn!(?step, error = %e, "Rollback step failed");
            }
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FaultPoint, ImageBehavior, MemoryRuntime};
    use crate::spec::Mount;
    use crate::wait::Probe;
    use ephemera_common::{Settings, labels};

    fn coordinator(runtime: &MemoryRuntime) -> LifecycleCoordinator {
        let session = Session::new(
            Arc::new(runtime.clone()),
            Settings::default().with_reaper_disabled(true),
        );
        LifecycleCoordinator::new(Arc::new(session))
    }

    fn leftovers(runtime: &MemoryRuntime, coordinator: &LifecycleCoordinator) -> usize {
        runtime.count_labeled(labels::SESSION_ID, coordinator.session().id().as_str())
    }

    #[tokio::test]
    async fn started_container_is_registered_and_labeled() {
        let runtime = MemoryRuntime::new();
        let coordinator = coordinator(&runtime);
        let spec = ContainerSpec::new("redis:7")
            .with_exposed_port(6379)
            .with_label("team", "storage")
            .waiting_for(Probe::port(6379));

        let handle = coordinator.start(&spec).await.unwrap();
        assert!(coordinator.session().registry().get(&handle.id).is_some());
        assert_eq!(handle.labels.get("team").map(String::as_str), Some("storage"));
        assert_eq!(
            handle.labels.get(labels::SESSION_ID),
            Some(&coordinator.session().id().to_string())
        );
        assert_ne!(coordinator.mapped_port(&handle, 6379).unwrap(), 0);
        assert!(coordinator.mapped_port(&handle, 6380).is_err());
    }

    #[tokio::test]
    async fn invalid_spec_creates_nothing() {
        let runtime = MemoryRuntime::new();
        let coordinator = coordinator(&runtime);
        let spec = ContainerSpec::new("").with_exposed_port(80);
        let err = coordinator.start(&spec).await.unwrap_err();
        assert!(matches!(err, EphemeraError::InvalidSpec { .. }));
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn start_failure_rolls_back_volumes_and_container() {
        let runtime = MemoryRuntime::new();
        let coordinator = coordinator(&runtime);
        let spec = ContainerSpec::new("postgres:16")
            .with_mount(Mount::volume("pgdata", "/var/lib/postgresql/data"));
        runtime.fail_next(FaultPoint::Start, 1);

        let err = coordinator.start(&spec).await.unwrap_err();
        assert!(matches!(err, EphemeraError::StartFailed { .. }));
        assert_eq!(leftovers(&runtime, &coordinator), 0);
        assert_eq!(runtime.volume_count(), 0);
        assert!(coordinator.session().registry().is_empty());
    }

    #[tokio::test]
    async fn attach_failure_is_wrapped() {
        let runtime = MemoryRuntime::new();
        let coordinator = coordinator(&runtime);
        let network = coordinator.networks().create_network().await.unwrap();
        let spec = ContainerSpec::new("nginx").with_network(network.id.clone(), ["web"]);
        runtime.fail_next(FaultPoint::Connect, 1);

        let err = coordinator.start(&spec).await.unwrap_err();
        assert!(matches!(err, EphemeraError::AttachFailed { .. }));
        assert_eq!(runtime.container_count(), 0);
        assert!(coordinator.networks().aliases(&network.id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exited_container_is_not_ready() {
        let runtime = MemoryRuntime::new();
        runtime.set_image(
            "broken",
            ImageBehavior::default()
                .log_after(Duration::from_millis(10), "fatal: bad config")
                .exit(1),
        );
        let coordinator = coordinator(&runtime);
        let spec = ContainerSpec::new("broken").waiting_for(Probe::log("ready").unwrap());

        let err = coordinator.start(&spec).await.unwrap_err();
        let EphemeraError::NotReady { diagnostic, .. } = &err else {
            panic!("expected NotReady, got {err:?}");
        };
        assert!(diagnostic.contains("0/1"), "{diagnostic}");
        assert_eq!(leftovers(&runtime, &coordinator), 0);
    }

    #[tokio::test]
    async fn failed_rollback_keeps_the_registration() {
        let runtime = MemoryRuntime::new();
        let coordinator = coordinator(&runtime);
        runtime.fail_next(FaultPoint::Start, 1);
        runtime.fail_next(FaultPoint::RemoveContainer, 1);

        let err = coordinator.start(&ContainerSpec::new("nginx")).await.unwrap_err();
        assert!(matches!(err, EphemeraError::StartFailed { .. }));
        assert_eq!(coordinator.session().registry().len(), 1);

        coordinator.terminate().await.unwrap();
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let runtime = MemoryRuntime::new();
        let coordinator = coordinator(&runtime);
        let handle = coordinator.start(&ContainerSpec::new("nginx")).await.unwrap();

        coordinator.stop(&handle, DEFAULT_STOP_TIMEOUT).await.unwrap();
        coordinator.stop(&handle, DEFAULT_STOP_TIMEOUT).await.unwrap();
        assert!(coordinator.session().registry().is_empty());
        assert!(matches!(
            coordinator.endpoint(&handle, 80),
            Err(EphemeraError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stop_rejects_networks() {
        let runtime = MemoryRuntime::new();
        let coordinator = coordinator(&runtime);
        let network = coordinator.networks().create_network().await.unwrap();
        assert!(coordinator.stop(&network, DEFAULT_STOP_TIMEOUT).await.is_err());
    }
}
