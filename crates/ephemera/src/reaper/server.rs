//! The reaper daemon.
//!
//! Two tiers of cleanup:
//!
//! 1. Fast path: every session holds a connection. When the last connection
//!    of a session drops, the session gets a grace period to reconnect and is
//!    then swept. An explicit `end` sweeps immediately.
//! 2. Slow path: a periodic scan groups labeled resources by session and
//!    sweeps sessions whose reaper is gone, so a crashed reaper's sessions are
//!    cleaned up by its successor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ephemera_common::{EphemeraResult, ResourceKind, SessionId, labels};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::client;
use super::protocol::{self, ClientMessage, ReaperMessage};
use super::sweep::Sweeper;
use crate::runtime::RuntimeClient;

/// Reaper settings.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// Grace period for a dropped session to reconnect.
    pub reconnection_timeout: Duration,
    /// Interval of the orphan scan.
    pub sweep_interval: Duration,
    /// Orphans younger than this are left alone.
    pub orphan_min_age: Duration,
    /// Timeout when asking another reaper about a session.
    pub query_timeout: Duration,
    /// Sweep rounds spent on one orphaned session per scan. Whatever is
    /// left is retried by the next scan.
    pub orphan_sweep_attempts: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8770)),
            reconnection_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
            orphan_min_age: Duration::from_secs(30),
            query_timeout: Duration::from_secs(5),
            orphan_sweep_attempts: 5,
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    connections: usize,
    generation: u64,
    grace: Option<Duration>,
}

struct Shared {
    instance: String,
    config: ReaperConfig,
    runtime: Arc<dyn RuntimeClient>,
    sweeper: Sweeper,
    orphan_sweeper: Sweeper,
    sessions: DashMap<SessionId, SessionState>,
    scanning: AtomicBool,
    shutdown: CancellationToken,
}

/// Clears the in-flight flag when a scan ends, however it ends.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The reaper service.
#[derive(Clone)]
pub struct ReaperServer {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ReaperServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaperServer")
            .field("instance", &self.shared.instance)
            .field("config", &self.shared.config)
            .field("sessions", &self.shared.sessions.len())
            .finish()
    }
}

impl ReaperServer {
    /// Create a reaper over a runtime with a fresh instance id.
    #[must_use]
    pub fn new(runtime: Arc<dyn RuntimeClient>, config: ReaperConfig) -> Self {
        Self::with_sweeper(Sweeper::new(Arc::clone(&runtime)), runtime, config)
    }

    /// Create a reaper with a custom sweeper.
    #[must_use]
    pub fn with_sweeper(sweeper: Sweeper, runtime: Arc<dyn RuntimeClient>, config: ReaperConfig) -> Self {
        let orphan_sweeper = sweeper
            .clone()
            .with_max_attempts(config.orphan_sweep_attempts.max(1));
        Self {
            shared: Arc::new(Shared {
                instance: uuid::Uuid::new_v4().simple().to_string(),
                config,
                runtime,
                sweeper,
                orphan_sweeper,
                sessions: DashMap::new(),
                scanning: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Instance id, stamped on the resources of every session it watches.
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.shared.instance
    }

    /// Token that stops [`serve`](Self::serve) when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Number of live connections of a session.
    #[must_use]
    pub fn connections(&self, session: &SessionId) -> usize {
        self.shared
            .sessions
            .get(session)
            .map_or(0, |s| s.connections)
    }

    /// Whether an orphan scan is running.
    #[must_use]
    pub fn scan_in_flight(&self) -> bool {
        self.shared.scanning.load(Ordering::Acquire)
    }

    /// Bind the configured address and serve until shut down.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be bound.
    pub async fn run(&self) -> EphemeraResult<()> {
        let listener = TcpListener::bind(self.shared.config.listen).await?;
        self.serve(listener).await
    }

    /// Serve connections and run the orphan scan until shut down.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> EphemeraResult<()> {
        let local = listener.local_addr()?;
        tracing::info!(listen = %local, instance = %self.shared.instance, "Reaper listening");

        let mut scan = tokio::time::interval(self.shared.config.sweep_interval);
        scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; orphans of a previous reaper are
        // picked up on startup.
        loop {
            tokio::select! {
                () = self.shared.shutdown.cancelled() => {
                    tracing::info!("Reaper shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle(stream).await {
                            tracing::debug!(%peer, error = %e, "Connection ended with error");
                        }
                    });
                }
                _ = scan.tick() => {
                    if self.scan_in_flight() {
                        tracing::debug!("Previous orphan scan still running, skipping");
                    } else {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.sweep_orphans().await {
                                tracing::warn!(error = %e, "Orphan scan failed");
                            }
                        });
                    }
                }
            }
        }
    }

    async fn handle(&self, stream: TcpStream) -> EphemeraResult<()> {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let Some(first) = lines.next_line().await? else {
            return Ok(());
        };
        let (session, grace) = match protocol::decode::<ClientMessage>(&first) {
            Ok(ClientMessage::Register {
                session_id,
                grace_ms,
            }) => (session_id, grace_ms.map(Duration::from_millis)),
            Ok(ClientMessage::Query { session_id }) => {
                let reply = ReaperMessage::Status {
                    instance: self.shared.instance.clone(),
                    connected: self.connections(&session_id) > 0,
                };
                write.write_all(protocol::encode(&reply)?.as_bytes()).await?;
                return Ok(());
            }
            Ok(ClientMessage::End) => {
                let reply = ReaperMessage::Error {
                    message: "register before ending a session".to_string(),
                };
                write.write_all(protocol::encode(&reply)?.as_bytes()).await?;
                return Ok(());
            }
            Err(e) => {
                let reply = ReaperMessage::Error {
                    message: e.to_string(),
                };
                write.write_all(protocol::encode(&reply)?.as_bytes()).await?;
                return Ok(());
            }
        };

        self.attach(&session, grace);
        let ack = ReaperMessage::Ack {
            instance: self.shared.instance.clone(),
        };
        if let Err(e) = write.write_all(protocol::encode(&ack)?.as_bytes()).await {
            self.detach(&session);
            return Err(e.into());
        }

        // Hold the connection until it drops or the session ends.
        loop {
            let line = tokio::select! {
                () = self.shared.shutdown.cancelled() => return Ok(()),
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => match protocol::decode::<ClientMessage>(&line) {
                    Ok(ClientMessage::End) => {
                        let removed = self.end(&session).await;
                        let reply = ReaperMessage::Swept { removed };
                        // The client may already be gone.
                        let _ = write.write_all(protocol::encode(&reply)?.as_bytes()).await;
                        return Ok(());
                    }
                    Ok(other) => {
                        tracing::debug!(session = %session.short(), message = ?other, "Ignoring message");
                    }
                    Err(e) => {
                        tracing::debug!(session = %session.short(), error = %e, "Ignoring malformed message");
                    }
                },
                Ok(None) | Err(_) => {
                    self.detach(&session);
                    return Ok(());
                }
            }
        }
    }

    fn attach(&self, session: &SessionId, grace: Option<Duration>) {
        let mut state = self.shared.sessions.entry(session.clone()).or_default();
        state.connections += 1;
        state.generation += 1;
        if grace.is_some() {
            state.grace = grace;
        }
        tracing::info!(session = %session.short(), connections = state.connections, "Session registered");
    }

    fn detach(&self, session: &SessionId) {
        let (generation, grace) = {
            let Some(mut state) = self.shared.sessions.get_mut(session) else {
                return;
            };
            state.connections = state.connections.saturating_sub(1);
            if state.connections > 0 {
                return;
            }
            (
                state.generation,
                state.grace.unwrap_or(self.shared.config.reconnection_timeout),
            )
        };
        tracing::info!(session = %session.short(), grace = ?grace, "Session dropped, sweeping after grace period");

        let server = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = server.shared.shutdown.cancelled() => return,
                () = tokio::time::sleep(grace) => {}
            }
            let expired = server
                .shared
                .sessions
                .remove_if(&session, |_, s| s.connections == 0 && s.generation == generation)
                .is_some();
            if !expired {
                tracing::debug!(session = %session.short(), "Session reconnected, sweep cancelled");
                return;
            }
            if let Err(e) = server.shared.sweeper.sweep(&session).await {
                tracing::error!(session = %session.short(), error = %e, "Sweep of dropped session failed");
            }
        });
    }

    async fn end(&self, session: &SessionId) -> usize {
        self.shared.sessions.remove(session);
        tracing::info!(session = %session.short(), "Session ended");
        match self.shared.sweeper.sweep(session).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!(session = %session.short(), error = %e, "Sweep of ended session failed");
                0
            }
        }
    }

    /// Scan for labeled resources whose session nobody watches and sweep them.
    ///
    /// A session is left alone while it is connected here, while its resources
    /// carry no reaper labels (the reaper was disabled for it), while its
    /// newest resource is younger than the minimum orphan age, or while the
    /// reaper that registered it still answers with the same instance id and
    /// reports it connected.
    ///
    /// Orphaned sessions are swept concurrently, each with a bounded number
    /// of attempts, so one resource that cannot be removed holds up neither
    /// the other sessions nor the next scan. Only one scan runs at a time; a
    /// call while another scan is in flight returns `0` without scanning.
    ///
    /// Returns the number of removed resources.
    ///
    /// # Errors
    ///
    /// Returns a runtime error if resources cannot be listed.
    pub async fn sweep_orphans(&self) -> EphemeraResult<usize> {
        if self.shared.scanning.swap(true, Ordering::AcqRel) {
            tracing::debug!("Orphan scan already in flight");
            return Ok(0);
        }
        let _guard = ScanGuard(&self.shared.scanning);

        #[derive(Default)]
        struct Owner {
            instance: Option<String>,
            endpoint: Option<String>,
            newest: Option<DateTime<Utc>>,
        }

        let mut owners: HashMap<SessionId, Owner> = HashMap::new();
        for kind in ResourceKind::TEARDOWN_ORDER {
            for resource in self
                .shared
                .runtime
                .list_by_label(kind, labels::SESSION_ID, None)
                .await?
            {
                let Some(session) = labels::owner(&resource.labels) else {
                    continue;
                };
                let owner = owners.entry(session).or_default();
                if owner.instance.is_none() {
                    owner.instance = resource.labels.get(labels::REAPER_INSTANCE).cloned();
                    owner.endpoint = resource.labels.get(labels::REAPER_ENDPOINT).cloned();
                }
                owner.newest = owner.newest.max(resource.created_at);
            }
        }

        let min_age = chrono::Duration::from_std(self.shared.config.orphan_min_age)
            .unwrap_or(chrono::Duration::MAX);
        let mut orphans = Vec::new();
        for (session, owner) in owners {
            if self.shared.sessions.contains_key(&session) {
                continue;
            }
            let Some(instance) = owner.instance else {
                continue;
            };
            if owner.newest.is_some_and(|t| Utc::now() - t < min_age) {
                continue;
            }
            if instance != self.shared.instance && self.owner_alive(&session, &instance, owner.endpoint.as_deref()).await {
                continue;
            }
            tracing::info!(session = %session.short(), owner = %instance, "Sweeping orphaned session");
            orphans.push(session);
        }

        let sweeps = orphans.iter().map(|session| async move {
            match self.shared.orphan_sweeper.sweep(session).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(session = %session.short(), error = %e, "Orphan sweep failed, retrying next scan");
                    0
                }
            }
        });
        Ok(futures::future::join_all(sweeps).await.into_iter().sum())
    }

    async fn owner_alive(&self, session: &SessionId, instance: &str, endpoint: Option<&str>) -> bool {
        let Some(addr) = endpoint.and_then(|e| e.parse::<SocketAddr>().ok()) else {
            return false;
        };
        match client::query(addr, session, self.shared.config.query_timeout).await {
            Ok((answered, connected)) => answered == instance && connected,
            Err(e) => {
                tracing::debug!(session = %session.short(), reaper = %addr, error = %e, "Owning reaper unreachable");
                false
            }
        }
    }
}
