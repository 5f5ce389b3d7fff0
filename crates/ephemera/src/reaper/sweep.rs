//! Label-driven removal of a session's resources.

use std::sync::Arc;
use std::time::Duration;

use ephemera_common::{EphemeraError, EphemeraResult, ResourceKind, SessionId, labels};

use crate::runtime::RuntimeClient;

/// Removes every resource labeled with a session, retrying until none remain.
#[derive(Clone)]
pub struct Sweeper {
    runtime: Arc<dyn RuntimeClient>,
    initial_backoff: Duration,
    max_backoff: Duration,
    max_attempts: Option<usize>,
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Sweeper {
    /// Create a sweeper that retries without limit.
    #[must_use]
    pub fn new(runtime: Arc<dyn RuntimeClient>) -> Self {
        Self {
            runtime,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            max_attempts: None,
        }
    }

    /// Give up after `attempts` rounds.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the first and the largest delay between rounds.
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Remove containers, then networks, then volumes of `session`.
    ///
    /// Returns how many resources were removed.
    ///
    /// # Errors
    ///
    /// Returns [`EphemeraError::Teardown`] once `max_attempts` rounds left
    /// resources behind.
    pub async fn sweep(&self, session: &SessionId) -> EphemeraResult<usize> {
        let mut removed = 0;
        let mut backoff = self.initial_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (count, failures) = self.sweep_once(session).await;
            removed += count;
            if failures.is_empty() {
                if removed > 0 {
                    tracing::info!(session = %session.short(), removed, "Swept session");
                }
                return Ok(removed);
            }
            if self.max_attempts.is_some_and(|max| attempt >= max) {
                tracing::error!(
                    session = %session.short(),
                    attempt,
                    failures = failures.len(),
                    "Giving up on sweeping session"
                );
                return Err(EphemeraError::Teardown { failures });
            }
            tracing::warn!(
                session = %session.short(),
                attempt,
                failures = failures.len(),
                backoff = ?backoff,
                "Sweep incomplete, retrying"
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    async fn sweep_once(&self, session: &SessionId) -> (usize, Vec<String>) {
        let mut removed = 0;
        let mut failures = Vec::new();
        for kind in ResourceKind::TEARDOWN_ORDER {
            let found = match self
                .runtime
                .list_by_label(kind, labels::SESSION_ID, Some(session.as_str()))
                .await
            {
                Ok(found) => found,
                Err(e) => {
                    failures.push(format!("list {kind}s: {e}"));
                    continue;
                }
            };
            for resource in found {
                match self.runtime.remove_resource(kind, &resource.id).await {
                    Ok(()) => {
                        tracing::debug!(session = %session.short(), %kind, id = %resource.id.short(), "Removed");
                        removed += 1;
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => failures.push(format!("{kind} {}: {e}", resource.id.short())),
                }
            }
        }
        (removed, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CreateConfig, FaultPoint, MemoryRuntime};
    use std::collections::BTreeMap;

    async fn seed(runtime: &MemoryRuntime, session: &SessionId) {
        let labels = labels::session_labels(session);
        let config = CreateConfig {
            labels: labels.clone(),
            ..CreateConfig::default()
        };
        let network = runtime.create_network("n", &labels).await.unwrap();
        let container = runtime.create(&config).await.unwrap();
        runtime.connect(&network, &container, &[]).await.unwrap();
        runtime.create(&config).await.unwrap();
        runtime.create_volume("v", &labels).await.unwrap();
    }

    #[tokio::test]
    async fn sweeps_only_the_session() {
        let runtime = MemoryRuntime::new();
        let ours = SessionId::generate();
        let theirs = SessionId::generate();
        seed(&runtime, &ours).await;
        runtime
            .create(&CreateConfig {
                labels: labels::session_labels(&theirs),
                ..CreateConfig::default()
            })
            .await
            .unwrap();
        runtime.create_network("unlabeled", &BTreeMap::new()).await.unwrap();

        let removed = Sweeper::new(Arc::new(runtime.clone())).sweep(&ours).await.unwrap();
        assert_eq!(removed, 4);
        assert_eq!(runtime.count_labeled(labels::SESSION_ID, ours.as_str()), 0);
        assert_eq!(runtime.count_labeled(labels::SESSION_ID, theirs.as_str()), 1);
        assert_eq!(runtime.network_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff() {
        let runtime = MemoryRuntime::new();
        let session = SessionId::generate();
        seed(&runtime, &session).await;
        runtime.fail_next(FaultPoint::RemoveContainer, 3);

        let removed = Sweeper::new(Arc::new(runtime.clone())).sweep(&session).await.unwrap();
        assert_eq!(removed, 4);
        assert_eq!(runtime.count_labeled(labels::SESSION_ID, session.as_str()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let runtime = MemoryRuntime::new();
        let session = SessionId::generate();
        seed(&runtime, &session).await;
        runtime.fail_next(FaultPoint::RemoveNetwork, 10);

        let err = Sweeper::new(Arc::new(runtime.clone()))
            .with_max_attempts(2)
            .sweep(&session)
            .await
            .unwrap_err();
        assert!(matches!(err, EphemeraError::Teardown { ref failures } if failures.len() == 1));
        assert_eq!(runtime.container_count(), 0);
        assert_eq!(runtime.network_count(), 1);
    }

    #[tokio::test]
    async fn empty_session_is_a_no_op() {
        let runtime = MemoryRuntime::new();
        let removed = Sweeper::new(Arc::new(runtime))
            .sweep(&SessionId::generate())
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }
}
