//! Named point-in-time snapshots of a service's persisted data.
//!
//! A [`SnapshotStrategy`] turns "snapshot as `name`" and "restore `name`"
//! into commands executed inside the container. The default
//! [`DirectoryCopy`] copies the data directory aside with `cp -a` and back.
//!
//! Restoring replaces the data underneath the running service, so the caller
//! must make sure nothing is connected to it (close pools, terminate backend
//! connections) before calling [`SnapshotManager::restore`]. This is not
//! checked.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ephemera_common::{EphemeraError, EphemeraResult, ResourceId, SessionId};
use parking_lot::Mutex;
use serde::Serialize;

use crate::session::Session;

/// Where [`DirectoryCopy`] keeps snapshots inside the container.
pub const DEFAULT_SNAPSHOT_ROOT: &str = "/.ephemera/snapshots";

/// Commands that take and restore a snapshot.
pub trait SnapshotStrategy: Send + Sync + fmt::Debug {
    /// Commands that store the current state as `name`.
    fn snapshot_commands(&self, name: &str) -> Vec<Vec<String>>;

    /// Commands that bring back the state stored as `name`.
    fn restore_commands(&self, name: &str) -> Vec<Vec<String>>;
}

/// Copies a data directory to and from a per-name snapshot directory.
#[derive(Debug, Clone)]
pub struct DirectoryCopy {
    data_dir: String,
    snapshot_root: String,
}

impl DirectoryCopy {
    /// Snapshot `data_dir`.
    pub fn new(data_dir: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into().trim_end_matches('/').to_string(),
            snapshot_root: DEFAULT_SNAPSHOT_ROOT.to_string(),
        }
    }

    /// Keep snapshots somewhere else.
    #[must_use]
    pub fn with_snapshot_root(mut self, root: impl Into<String>) -> Self {
        self.snapshot_root = root.into().trim_end_matches('/').to_string();
        self
    }

    fn snapshot_dir(&self, name: &str) -> String {
        format!("{}/{name}", self.snapshot_root)
    }
}

fn command(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

impl SnapshotStrategy for DirectoryCopy {
    fn snapshot_commands(&self, name: &str) -> Vec<Vec<String>> {
        let dir = self.snapshot_dir(name);
        vec![
            command(&["rm", "-rf", &dir]),
            command(&["mkdir", "-p", &dir]),
            command(&["cp", "-a", &format!("{}/.", self.data_dir), &dir]),
        ]
    }

    fn restore_commands(&self, name: &str) -> Vec<Vec<String>> {
        let dir = self.snapshot_dir(name);
        vec![
            command(&["rm", "-rf", &self.data_dir]),
            command(&["mkdir", "-p", &self.data_dir]),
            command(&["cp", "-a", &format!("{dir}/."), &self.data_dir]),
        ]
    }
}

/// A stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    /// Snapshot name, unique per container.
    pub name: String,
    /// Session that took it.
    pub session_id: SessionId,
    /// Container it belongs to.
    pub container_id: ResourceId,
    /// When it was taken.
    pub created_at: DateTime<Utc>,
}

struct Entry {
    record: SnapshotRecord,
    strategy: Arc<dyn SnapshotStrategy>,
}

/// Takes and restores snapshots, keeping one record per container and name.
pub struct SnapshotManager {
    session: Arc<Session>,
    entries: Mutex<HashMap<(ResourceId, String), Entry>>,
}

impl fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("snapshots", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl SnapshotManager {
    /// Create a manager for a session.
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store the container's current state as `name`, replacing any earlier
    /// snapshot with that name.
    ///
    /// # Errors
    ///
    /// - [`EphemeraError::InvalidSpec`] for an unusable name
    /// - [`EphemeraError::Runtime`] if a command fails; the name is then unset
    pub async fn snapshot(
        &self,
        container: &ResourceId,
        name: &str,
        strategy: Arc<dyn SnapshotStrategy>,
    ) -> EphemeraResult<SnapshotRecord> {
        validate_name(name)?;
        let key = (container.clone(), name.to_string());
        if let Err(e) = self.run(container, "snapshot", strategy.snapshot_commands(name)).await {
            self.entries.lock().remove(&key);
            return Err(e);
        }

        let record = SnapshotRecord {
            name: name.to_string(),
            session_id: self.session.id().clone(),
            container_id: container.clone(),
            created_at: Utc::now(),
        };
        self.entries.lock().insert(
            key,
            Entry {
                record: record.clone(),
                strategy,
            },
        );
        tracing::info!(container = %container.short(), snapshot = %name, "Snapshot taken");
        Ok(record)
    }

    /// Bring back the state stored as `name`.
    ///
    /// # Errors
    ///
    /// - [`EphemeraError::SnapshotNotFound`] if no such snapshot exists
    /// - [`EphemeraError::Runtime`] if a command fails
    pub async fn restore(&self, container: &ResourceId, name: &str) -> EphemeraResult<()> {
        let strategy = self
            .entries
            .lock()
            .get(&(container.clone(), name.to_string()))
            .map(|e| Arc::clone(&e.strategy))
            .ok_or_else(|| EphemeraError::SnapshotNotFound {
                container: container.to_string(),
                name: name.to_string(),
            })?;
        self.run(container, "restore", strategy.restore_commands(name))
            .await?;
        tracing::info!(container = %container.short(), snapshot = %name, "Snapshot restored");
        Ok(())
    }

    /// Snapshots of a container, ordered by name.
    #[must_use]
    pub fn records(&self, container: &ResourceId) -> Vec<SnapshotRecord> {
        let mut records: Vec<_> = self
            .entries
            .lock()
            .values()
            .filter(|e| &e.record.container_id == container)
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Drop the records of a removed container.
    pub fn forget_container(&self, container: &ResourceId) {
        self.entries.lock().retain(|(id, _), _| id != container);
    }

    async fn run(&self, container: &ResourceId, operation: &str, commands: Vec<Vec<String>>) -> EphemeraResult<()> {
        for cmd in commands {
            let output = self.session.runtime().exec(container, &cmd).await?;
            if !output.success() {
                return Err(EphemeraError::runtime(
                    operation,
                    format!(
                        "`{}` exited with code {}: {}",
                        cmd.join(" "),
                        output.exit_code,
                        output.stderr.trim()
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> EphemeraResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains(char::is_whitespace) {
        return Err(EphemeraError::invalid_spec(format!(
            "invalid snapshot name: {name:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CreateConfig, FaultPoint, MemoryRuntime, RuntimeClient};
    use ephemera_common::Settings;

    const DATA: &str = "/var/lib/data";

    async fn setup() -> (MemoryRuntime, SnapshotManager, ResourceId) {
        let runtime = MemoryRuntime::new();
        let session = Session::new(
            Arc::new(runtime.clone()),
            Settings::default().with_reaper_disabled(true),
        );
        let id = runtime.create(&CreateConfig::default()).await.unwrap();
        runtime.start(&id).await.unwrap();
        runtime.write_file(&id, &format!("{DATA}/count"), "1").unwrap();
        (runtime, SnapshotManager::new(Arc::new(session)), id)
    }

    fn strategy() -> Arc<dyn SnapshotStrategy> {
        Arc::new(DirectoryCopy::new(DATA))
    }

    fn count(runtime: &MemoryRuntime, id: &ResourceId) -> Option<String> {
        runtime
            .read_file(id, &format!("{DATA}/count"))
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    #[test]
    fn directory_copy_commands() {
        let copy = DirectoryCopy::new("/data/");
        assert_eq!(
            copy.snapshot_commands("clean"),
            vec![
                command(&["rm", "-rf", "/.ephemera/snapshots/clean"]),
                command(&["mkdir", "-p", "/.ephemera/snapshots/clean"]),
                command(&["cp", "-a", "/data/.", "/.ephemera/snapshots/clean"]),
            ]
        );
        assert_eq!(
            copy.restore_commands("clean")[2],
            command(&["cp", "-a", "/.ephemera/snapshots/clean/.", "/data"])
        );
    }

    #[tokio::test]
    async fn round_trip() {
        let (runtime, manager, id) = setup().await;
        manager.snapshot(&id, "base", strategy()).await.unwrap();
        runtime.write_file(&id, &format!("{DATA}/count"), "2").unwrap();
        runtime.write_file(&id, &format!("{DATA}/extra"), "x").unwrap();

        manager.restore(&id, "base").await.unwrap();
        assert_eq!(count(&runtime, &id).as_deref(), Some("1"));
        assert_eq!(runtime.read_file(&id, &format!("{DATA}/extra")), None);
    }

    #[tokio::test]
    async fn names_are_last_write_wins() {
        let (runtime, manager, id) = setup().await;
        manager.snapshot(&id, "s", strategy()).await.unwrap();
        runtime.write_file(&id, &format!("{DATA}/count"), "2").unwrap();
        manager.snapshot(&id, "s", strategy()).await.unwrap();
        manager.snapshot(&id, "other", strategy()).await.unwrap();
        runtime.write_file(&id, &format!("{DATA}/count"), "3").unwrap();

        manager.restore(&id, "s").await.unwrap();
        assert_eq!(count(&runtime, &id).as_deref(), Some("2"));
        let names: Vec<_> = manager.records(&id).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["other", "s"]);
    }

    #[tokio::test]
    async fn unknown_snapshot() {
        let (_runtime, manager, id) = setup().await;
        let err = manager.restore(&id, "missing").await.unwrap_err();
        assert!(matches!(err, EphemeraError::SnapshotNotFound { .. }));
    }

    #[tokio::test]
    async fn failed_snapshot_unsets_the_name() {
        let (runtime, manager, id) = setup().await;
        manager.snapshot(&id, "s", strategy()).await.unwrap();
        runtime.fail_next(FaultPoint::Exec, 1);
        assert!(manager.snapshot(&id, "s", strategy()).await.is_err());
        assert!(matches!(
            manager.restore(&id, "s").await,
            Err(EphemeraError::SnapshotNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_runtime_error() {
        let (_runtime, manager, id) = setup().await;
        let missing = Arc::new(DirectoryCopy::new("/nowhere"));
        let err = manager.snapshot(&id, "s", missing).await.unwrap_err();
        assert!(matches!(err, EphemeraError::Runtime { ref message, .. } if message.contains("exited with code 1")));
    }

    #[tokio::test]
    async fn rejects_path_like_names() {
        let (_runtime, manager, id) = setup().await;
        for name in ["", "..", "a/b", "with space"] {
            assert!(matches!(
                manager.snapshot(&id, name, strategy()).await,
                Err(EphemeraError::InvalidSpec { .. })
            ));
        }
        manager.forget_container(&id);
        assert!(manager.records(&id).is_empty());
    }
}
