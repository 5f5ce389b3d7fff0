//! Test sessions and their resource registry.
//!
//! A [`Session`] is an explicit value shared by everything one test run
//! creates. It owns the session id, the registry of created resources and the
//! liveness channel to the reaper. There is no process-wide singleton: share
//! the session through an `Arc` (or a `OnceLock` in test code) to get one
//! session per process.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use ephemera_common::labels;
use ephemera_common::{
    EphemeraError, EphemeraResult, ResourceHandle, ResourceId, ResourceKind, SessionId, Settings,
};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::reaper::{ProcessLauncher, ReaperConnection, ReaperLauncher};
use crate::runtime::{RuntimeClient, ignore_not_found};

/// Every resource a session created and has not removed yet.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    resources: Mutex<HashMap<ResourceId, ResourceHandle>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resource. Registering an id again replaces the handle.
    pub fn register(&self, handle: ResourceHandle) {
        tracing::debug!(kind = %handle.kind, id = %handle.id.short(), "Registered");
        self.resources.lock().insert(handle.id.clone(), handle);
    }

    /// Forget a resource, returning its handle if it was registered.
    pub fn deregister(&self, id: &ResourceId) -> Option<ResourceHandle> {
        let removed = self.resources.lock().remove(id);
        if removed.is_some() {
            tracing::debug!(id = %id.short(), "Deregistered");
        }
        removed
    }

    /// Look up a resource.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<ResourceHandle> {
        self.resources.lock().get(id).cloned()
    }

    /// All handles of a kind, oldest first.
    #[must_use]
    pub fn handles(&self, kind: ResourceKind) -> Vec<ResourceHandle> {
        let mut handles: Vec<_> = self
            .resources
            .lock()
            .values()
            .filter(|h| h.kind == kind)
            .cloned()
            .collect();
        handles.sort_by_key(|h| h.created_at);
        handles
    }

    /// Number of registered resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.lock().is_empty()
    }
}

/// One test session.
pub struct Session {
    id: SessionId,
    settings: Settings,
    runtime: Arc<dyn RuntimeClient>,
    registry: SessionRegistry,
    reaper: tokio::sync::Mutex<Option<Arc<ReaperConnection>>>,
    launcher: Arc<dyn ReaperLauncher>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("resources", &self.registry.len())
            .field("reaper", &self.reaper.try_lock().ok().and_then(|r| (*r).clone()))
            .field("launcher", &self.launcher)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session with a fresh id. The reaper is contacted lazily, on
    /// the first resource request.
    #[must_use]
    pub fn new(runtime: Arc<dyn RuntimeClient>, settings: Settings) -> Self {
        let id = SessionId::generate();
        tracing::info!(session = %id.short(), reaper_disabled = settings.reaper_disabled, "Session created");
        Self {
            id,
            settings,
            runtime,
            registry: SessionRegistry::new(),
            reaper: tokio::sync::Mutex::new(None),
            launcher: Arc::new(ProcessLauncher),
        }
    }

    /// Use a different way of starting a reaper when none is listening.
    #[must_use]
    pub fn with_reaper_launcher(mut self, launcher: Arc<dyn ReaperLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// The session id.
    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// The settings.
    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The runtime.
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn RuntimeClient> {
        &self.runtime
    }

    /// The registry.
    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Hold a reaper connection, registering the session if it holds none.
    ///
    /// Concurrent callers share one attempt. A channel closed by
    /// [`terminate`](Self::terminate) is replaced by a fresh registration, so
    /// resources created afterwards are watched again. When nothing listens
    /// at the reaper endpoint, a reaper is launched and the handshake retried
    /// until the connection timeout.
    ///
    /// Returns `None` when the reaper is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`EphemeraError::Reaper`] or
    /// [`EphemeraError::ReaperUnreachable`] if no reaper could be reached;
    /// the next call tries again.
    pub async fn ensure_reaper(&self) -> EphemeraResult<Option<Arc<ReaperConnection>>> {
        if self.settings.reaper_disabled {
            tracing::debug!(session = %self.id.short(), "Reaper disabled");
            return Ok(None);
        }
        let mut slot = self.reaper.lock().await;
        if let Some(connection) = slot.as_ref() {
            if connection.is_open().await {
                return Ok(Some(Arc::clone(connection)));
            }
            tracing::info!(session = %self.id.short(), "Reaper channel closed, registering again");
        }
        let connection = Arc::new(self.connect_reaper().await?);
        *slot = Some(Arc::clone(&connection));
        Ok(Some(connection))
    }

    async fn connect_reaper(&self) -> EphemeraResult<ReaperConnection> {
        let addr = self.settings.reaper_addr;
        let timeout = self.settings.reaper_connection_timeout;
        let grace = self.settings.reaper_reconnection_timeout;
        match ReaperConnection::connect_with_grace(addr, &self.id, timeout, grace).await {
            Err(EphemeraError::ReaperUnreachable { .. }) => {}
            other => return other,
        }

        tracing::info!(session = %self.id.short(), reaper = %addr, "No reaper listening, launching one");
        let deadline = Instant::now() + timeout;
        self.launcher.launch(addr, &self.settings).await?;
        let mut backoff = Duration::from_millis(50);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match ReaperConnection::connect_with_grace(addr, &self.id, remaining, grace).await {
                Err(EphemeraError::ReaperUnreachable { .. }) if Instant::now() + backoff < deadline => {
                    tracing::debug!(reaper = %addr, backoff = ?backoff, "Launched reaper not listening yet");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
                other => return other,
            }
        }
    }

    /// Labels every resource of this session must carry.
    ///
    /// Connects to the reaper first so its instance and endpoint can be
    /// recorded.
    ///
    /// # Errors
    ///
    /// Returns [`EphemeraError::Reaper`] if the reaper cannot be reached.
    pub async fn labels(&self) -> EphemeraResult<BTreeMap<String, String>> {
        let mut labels = labels::session_labels(&self.id);
        if let Some(reaper) = self.ensure_reaper().await? {
            labels.insert(labels::REAPER_INSTANCE.to_string(), reaper.instance().to_string());
            labels.insert(labels::REAPER_ENDPOINT.to_string(), reaper.endpoint().to_string());
        }
        Ok(labels)
    }

    /// Record a created resource.
    pub fn register(
        &self,
        id: ResourceId,
        kind: ResourceKind,
        labels: BTreeMap<String, String>,
    ) -> ResourceHandle {
        let handle = ResourceHandle::new(id, kind, self.id.clone(), labels);
        self.registry.register(handle.clone());
        handle
    }

    /// Remove everything the session still holds, then tell the reaper the
    /// session ended.
    ///
    /// The session stays usable: the next resource request registers with
    /// the reaper again.
    ///
    /// Containers go first, then networks, then volumes. Safe to call
    /// repeatedly and concurrently: resources already gone count as removed.
    ///
    /// # Errors
    ///
    /// Returns [`EphemeraError::Teardown`] listing every resource that could
    /// not be removed; those stay labeled for the reaper.
    pub async fn terminate(&self) -> EphemeraResult<()> {
        let mut failures = Vec::new();
        for kind in ResourceKind::TEARDOWN_ORDER {
            for handle in self.registry.handles(kind) {
                match ignore_not_found(self.runtime.remove_resource(kind, &handle.id).await) {
                    Ok(()) => {
                        self.registry.deregister(&handle.id);
                    }
                    Err(e) => {
                        tracing::warn!(session = %self.id.short(), %kind, id = %handle.id.short(), error = %e, "Failed to remove");
                        failures.push(format!("{kind} {}: {e}", handle.id.short()));
                    }
                }
            }
        }

        let reaper = self.reaper.lock().await.clone();
        if let Some(reaper) = reaper {
            match reaper.close(self.settings.reaper_connection_timeout).await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(session = %self.id.short(), removed, "Reaper removed leftovers");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(session = %self.id.short(), error = %e, "Reaper did not confirm the end of the session");
                }
            }
        }

        if failures.is_empty() {
            tracing::info!(session = %self.id.short(), "Session terminated");
            Ok(())
        } else {
            Err(EphemeraError::Teardown { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CreateConfig, FaultPoint, MemoryRuntime};

    fn session(runtime: &MemoryRuntime) -> Session {
        Session::new(
            Arc::new(runtime.clone()),
            Settings::default().with_reaper_disabled(true),
        )
    }

    #[test]
    fn registry_tracks_handles_by_kind() {
        let registry = SessionRegistry::new();
        let session = SessionId::generate();
        for (id, kind) in [
            ("c1", ResourceKind::Container),
            ("n1", ResourceKind::Network),
            ("c2", ResourceKind::Container),
        ] {
            registry.register(ResourceHandle::new(id, kind, session.clone(), BTreeMap::new()));
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.handles(ResourceKind::Container).len(), 2);
        assert!(registry.deregister(&ResourceId::new("c1")).is_some());
        assert!(registry.deregister(&ResourceId::new("c1")).is_none());
        assert!(registry.get(&ResourceId::new("n1")).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn concurrent_registration_loses_nothing() {
        let registry = Arc::new(SessionRegistry::new());
        let session = SessionId::generate();
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                let session = session.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        registry.register(ResourceHandle::new(
                            format!("{t}-{i}"),
                            ResourceKind::Container,
                            session.clone(),
                            BTreeMap::new(),
                        ));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(registry.len(), 800);
    }

    #[tokio::test]
    async fn disabled_reaper_adds_no_reaper_labels() {
        let runtime = MemoryRuntime::new();
        let session = session(&runtime);
        assert!(session.ensure_reaper().await.unwrap().is_none());
        let labels = session.labels().await.unwrap();
        assert_eq!(labels.get(labels::SESSION_ID), Some(&session.id().to_string()));
        assert!(!labels.contains_key(labels::REAPER_INSTANCE));
    }

    #[tokio::test]
    async fn terminate_removes_in_order_and_is_idempotent() {
        let runtime = MemoryRuntime::new();
        let session = session(&runtime);
        let labels = session.labels().await.unwrap();

        let network = runtime.create_network("n", &labels).await.unwrap();
        session.register(network.clone(), ResourceKind::Network, labels.clone());
        let container = runtime
            .create(&CreateConfig {
                labels: labels.clone(),
                ..CreateConfig::default()
            })
            .await
            .unwrap();
        session.register(container.clone(), ResourceKind::Container, labels.clone());
        runtime.connect(&network, &container, &[]).await.unwrap();

        session.terminate().await.unwrap();
        assert!(session.registry().is_empty());
        assert_eq!(runtime.container_count() + runtime.network_count(), 0);
        session.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn terminate_reports_leftovers() {
        let runtime = MemoryRuntime::new();
        let session = session(&runtime);
        let labels = session.labels().await.unwrap();
        let network = runtime.create_network("n", &labels).await.unwrap();
        session.register(network, ResourceKind::Network, labels);
        runtime.fail_next(FaultPoint::RemoveNetwork, 1);

        let err = session.terminate().await.unwrap_err();
        assert!(matches!(err, EphemeraError::Teardown { ref failures } if failures.len() == 1));
        assert_eq!(session.registry().len(), 1);

        session.terminate().await.unwrap();
        assert!(session.registry().is_empty());
    }

    #[tokio::test]
    async fn unreachable_reaper_without_launcher_fails_resource_requests() {
        let runtime = MemoryRuntime::new();
        let addr = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let settings = Settings::default()
            .with_reaper_addr(addr)
            .with_reaper_binary("/nonexistent/ephemera-reaper");
        let session = Session::new(Arc::new(runtime), settings);
        let err = session.labels().await.unwrap_err();
        assert!(matches!(err, EphemeraError::Reaper { ref message } if message.contains("cannot launch")));
        assert!(session.labels().await.is_err());
    }
}
