//! In-process runtime.
//!
//! `MemoryRuntime` keeps containers, networks and volumes in a map and acts
//! them out just far enough for the harness to be exercised end to end:
//!
//! - exposed TCP ports are real loopback listeners, optionally answering HTTP
//! - container output is scripted (`sh -c "sleep 1; echo ready"` or a
//!   per-image [`ImageBehavior`]) and replayed to log followers
//! - `exec` understands a handful of shell builtins over an in-memory
//!   filesystem, enough for directory snapshots and alias pings
//! - failures can be injected at any [`FaultPoint`]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use ephemera_common::{EphemeraError, EphemeraResult, ResourceId, ResourceKind};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use super::{
    ContainerInfo, ContainerStatus, CreateConfig, ExecOutput, LabeledResource, LogStream,
    RuntimeClient, not_found,
};
use crate::spec::{ContainerPort, MountSource, Protocol};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `create`.
    Create,
    /// `start`.
    Start,
    /// `connect`.
    Connect,
    /// `remove`.
    RemoveContainer,
    /// `remove_network`.
    RemoveNetwork,
    /// `exec`.
    Exec,
    /// `copy_to`.
    Copy,
}

/// One step of a container's scripted main process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Wait.
    Sleep(Duration),
    /// Print a line.
    Log(String),
    /// Exit with a code.
    Exit(i64),
}

/// How containers of an image behave when no command is given.
#[derive(Debug, Clone, Default)]
pub struct ImageBehavior {
    /// Main process script. Containers keep running after the last step
    /// unless it is [`Step::Exit`].
    pub script: Vec<Step>,
    /// HTTP statuses answered on every exposed TCP port, one per request;
    /// the last one repeats. Empty means connections are accepted and closed.
    pub http_statuses: Vec<u16>,
}

impl ImageBehavior {
    /// Print a line after a delay.
    #[must_use]
    pub fn log_after(mut self, delay: Duration, line: impl Into<String>) -> Self {
        if !delay.is_zero() {
            self.script.push(Step::Sleep(delay));
        }
        self.script.push(Step::Log(line.into()));
        self
    }

    /// Exit after the preceding steps.
    #[must_use]
    pub fn exit(mut self, code: i64) -> Self {
        self.script.push(Step::Exit(code));
        self
    }

    /// Answer HTTP requests with these statuses in turn.
    #[must_use]
    pub fn http<I: IntoIterator<Item = u16>>(mut self, statuses: I) -> Self {
        self.http_statuses = statuses.into_iter().collect();
        self
    }
}

struct ContainerEntry {
    config: CreateConfig,
    status: ContainerStatus,
    ports: HashMap<ContainerPort, SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    history: Vec<Bytes>,
    log_tx: Option<broadcast::Sender<Bytes>>,
    files: BTreeMap<String, Bytes>,
    modes: BTreeMap<String, u32>,
    dirs: BTreeSet<String>,
    created_at: chrono::DateTime<Utc>,
}

impl ContainerEntry {
    fn halt(&mut self, status: ContainerStatus) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.ports.clear();
        self.log_tx = None;
        self.status = status;
    }
}

struct NetworkEntry {
    name: String,
    labels: BTreeMap<String, String>,
    endpoints: HashMap<ResourceId, Vec<String>>,
    created_at: chrono::DateTime<Utc>,
}

struct VolumeEntry {
    labels: BTreeMap<String, String>,
    created_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct State {
    containers: HashMap<ResourceId, ContainerEntry>,
    networks: HashMap<ResourceId, NetworkEntry>,
    volumes: HashMap<ResourceId, VolumeEntry>,
    images: HashMap<String, ImageBehavior>,
    faults: HashMap<FaultPoint, usize>,
}

impl State {
    fn take_fault(&mut self, point: FaultPoint) -> EphemeraResult<()> {
        match self.faults.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(EphemeraError::runtime(
                    format!("{point:?}"),
                    "injected failure",
                ))
            }
            _ => Ok(()),
        }
    }

    fn container(&mut self, id: &ResourceId) -> EphemeraResult<&mut ContainerEntry> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| not_found(ResourceKind::Container, id))
    }

    fn behavior(&self, image: &str) -> ImageBehavior {
        let repository = image.rsplit_once(':').map_or(image, |(repo, _)| repo);
        self.images
            .get(image)
            .or_else(|| self.images.get(repository))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `from` shares a network with a container known as `host`.
    fn reachable(&self, from: &ResourceId, host: &str) -> bool {
        self.networks.values().any(|net| {
            net.endpoints.contains_key(from)
                && net.endpoints.iter().any(|(peer, aliases)| {
                    aliases.iter().any(|a| a == host)
                        || self
                            .containers
                            .get(peer)
                            .and_then(|c| c.config.name.as_deref())
                            == Some(host)
                })
        })
    }
}

/// An in-process [`RuntimeClient`].
#[derive(Clone, Default)]
pub struct MemoryRuntime {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MemoryRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryRuntime")
            .field("containers", &state.containers.len())
            .field("networks", &state.networks.len())
            .field("volumes", &state.volumes.len())
            .finish()
    }
}

impl MemoryRuntime {
    /// Create an empty runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register how containers of an image behave.
    ///
    /// `image` matches either the full reference or the repository without tag.
    pub fn set_image(&self, image: impl Into<String>, behavior: ImageBehavior) {
        self.state.lock().images.insert(image.into(), behavior);
    }

    /// Make the next `times` calls at `point` fail.
    pub fn fail_next(&self, point: FaultPoint, times: usize) {
        self.state.lock().faults.insert(point, times);
    }

    /// Number of containers.
    #[must_use]
    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    /// Number of networks.
    #[must_use]
    pub fn network_count(&self) -> usize {
        self.state.lock().networks.len()
    }

    /// Number of volumes.
    #[must_use]
    pub fn volume_count(&self) -> usize {
        self.state.lock().volumes.len()
    }

    /// Number of resources of any kind carrying `key=value`.
    #[must_use]
    pub fn count_labeled(&self, key: &str, value: &str) -> usize {
        let state = self.state.lock();
        let has = |labels: &BTreeMap<String, String>| labels.get(key).is_some_and(|v| v == value);
        state.containers.values().filter(|c| has(&c.config.labels)).count()
            + state.networks.values().filter(|n| has(&n.labels)).count()
            + state.volumes.values().filter(|v| has(&v.labels)).count()
    }

    /// Aliases of a container on a network, if it is attached.
    #[must_use]
    pub fn endpoint_aliases(&self, network: &ResourceId, container: &ResourceId) -> Option<Vec<String>> {
        self.state
            .lock()
            .networks
            .get(network)
            .and_then(|n| n.endpoints.get(container).cloned())
    }

    /// Append output to a container's log.
    pub fn emit_log(&self, id: &ResourceId, chunk: impl Into<Bytes>) {
        let mut state = self.state.lock();
        if let Some(container) = state.containers.get_mut(id) {
            let chunk = chunk.into();
            container.history.push(chunk.clone());
            if let Some(tx) = &container.log_tx {
                // No followers is fine.
                let _ = tx.send(chunk);
            }
        }
    }

    /// Write a file inside a container, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the container does not exist.
    pub fn write_file(&self, id: &ResourceId, path: &str, content: impl Into<Bytes>) -> EphemeraResult<()> {
        let mut state = self.state.lock();
        let container = state.container(id)?;
        let path = normalize(path);
        add_parents(&mut container.dirs, &path);
        container.files.insert(path, content.into());
        Ok(())
    }

    /// Permission bits of a file copied in with `copy_to`.
    #[must_use]
    pub fn file_mode(&self, id: &ResourceId, path: &str) -> Option<u32> {
        self.state
            .lock()
            .containers
            .get(id)
            .and_then(|c| c.modes.get(&normalize(path)).copied())
    }

    /// Read a file inside a container.
    #[must_use]
    pub fn read_file(&self, id: &ResourceId, path: &str) -> Option<Bytes> {
        self.state
            .lock()
            .containers
            .get(id)
            .and_then(|c| c.files.get(&normalize(path)).cloned())
    }

    fn mark_exited(&self, id: &ResourceId, code: i64) {
        let mut state = self.state.lock();
        if let Some(container) = state.containers.get_mut(id) {
            tracing::debug!(container = %id.short(), code, "Main process exited");
            container.halt(ContainerStatus::Exited(code));
        }
    }

    async fn run_script(self, id: ResourceId, steps: Vec<Step>) {
        for step in steps {
            match step {
                Step::Sleep(delay) => tokio::time::sleep(delay).await,
                Step::Log(line) => self.emit_log(&id, format!("{line}\n")),
                Step::Exit(code) => {
                    self.mark_exited(&id, code);
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl RuntimeClient for MemoryRuntime {
    async fn create(&self, config: &CreateConfig) -> EphemeraResult<ResourceId> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::Create)?;

        if let Some(name) = &config.name {
            if state
                .containers
                .values()
                .any(|c| c.config.name.as_ref() == Some(name))
            {
                return Err(EphemeraError::runtime(
                    "create",
                    format!("container name {name:?} is already in use"),
                ));
            }
        }
        for mount in &config.mounts {
            if let MountSource::Volume(name) = &mount.source {
                state
                    .volumes
                    .entry(ResourceId::new(name.as_str()))
                    .or_insert_with(|| VolumeEntry {
                        labels: BTreeMap::new(),
                        created_at: Utc::now(),
                    });
            }
        }

        let id = ResourceId::new(uuid::Uuid::new_v4().simple().to_string());
        let (log_tx, _) = broadcast::channel(1024);
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        for target in config.tmpfs.keys() {
            add_parents(&mut dirs, &normalize(target));
            dirs.insert(normalize(target));
        }
        state.containers.insert(
            id.clone(),
            ContainerEntry {
                config: config.clone(),
                status: ContainerStatus::Created,
                ports: HashMap::new(),
                tasks: Vec::new(),
                history: Vec::new(),
                log_tx: Some(log_tx),
                files: BTreeMap::new(),
                modes: BTreeMap::new(),
                dirs,
                created_at: Utc::now(),
            },
        );
        tracing::debug!(container = %id.short(), image = %config.image, "Created container");
        Ok(id)
    }

    async fn start(&self, id: &ResourceId) -> EphemeraResult<()> {
        let (ports, behavior, steps) = {
            let mut state = self.state.lock();
            state.take_fault(FaultPoint::Start)?;
            let behavior = {
                let container = state.container(id)?;
                if container.status.is_running() {
                    return Ok(());
                }
                container.config.image.clone()
            };
            let behavior = state.behavior(&behavior);
            let container = state.container(id)?;
            let steps = script_for(&container.config.cmd).unwrap_or_else(|| behavior.script.clone());
            (container.config.exposed_ports.clone(), behavior, steps)
        };

        let mut bound = Vec::new();
        for port in ports.into_iter().filter(|p| p.protocol == Protocol::Tcp) {
            let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
            bound.push((port, listener.local_addr()?, listener));
        }

        let mut state = self.state.lock();
        let container = state.container(id)?;
        if container.log_tx.is_none() {
            container.log_tx = Some(broadcast::channel(1024).0);
        }
        let counter = Arc::new(AtomicUsize::new(0));
        for (port, addr, listener) in bound {
            container.ports.insert(port, addr);
            let statuses = behavior.http_statuses.clone();
            container
                .tasks
                .push(tokio::spawn(serve(listener, statuses, Arc::clone(&counter))));
        }
        container.status = ContainerStatus::Running;
        container
            .tasks
            .push(tokio::spawn(self.clone().run_script(id.clone(), steps)));
        tracing::debug!(container = %id.short(), "Started container");
        Ok(())
    }

    async fn stop(&self, id: &ResourceId, _timeout: Duration) -> EphemeraResult<()> {
        let mut state = self.state.lock();
        let container = state.container(id)?;
        if container.status.is_running() {
            container.halt(ContainerStatus::Exited(0));
        }
        Ok(())
    }

    async fn remove(&self, id: &ResourceId) -> EphemeraResult<()> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::RemoveContainer)?;
        let mut container = state
            .containers
            .remove(id)
            .ok_or_else(|| not_found(ResourceKind::Container, id))?;
        container.halt(ContainerStatus::Exited(137));
        for network in state.networks.values_mut() {
            network.endpoints.remove(id);
        }
        tracing::debug!(container = %id.short(), "Removed container");
        Ok(())
    }

    async fn inspect(&self, id: &ResourceId) -> EphemeraResult<ContainerInfo> {
        let mut state = self.state.lock();
        let container = state.container(id)?;
        Ok(ContainerInfo {
            id: id.clone(),
            name: container.config.name.clone(),
            image: container.config.image.clone(),
            status: container.status,
            ports: container.ports.clone(),
            labels: container.config.labels.clone().into_iter().collect(),
        })
    }

    async fn copy_to(
        &self,
        id: &ResourceId,
        path: &str,
        content: &Bytes,
        mode: u32,
    ) -> EphemeraResult<()> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::Copy)?;
        let container = state.container(id)?;
        let path = normalize(path);
        add_parents(&mut container.dirs, &path);
        container.files.insert(path.clone(), content.clone());
        container.modes.insert(path, mode);
        Ok(())
    }

    async fn exec(&self, id: &ResourceId, cmd: &[String]) -> EphemeraResult<ExecOutput> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::Exec)?;
        if !state.container(id)?.status.is_running() {
            return Err(EphemeraError::runtime(
                "exec",
                format!("container {} is not running", id.short()),
            ));
        }
        let reachable = |host: &str| state.reachable(id, host);
        let hosts: Vec<String> = cmd
            .iter()
            .filter(|arg| reachable(arg.as_str()))
            .cloned()
            .collect();
        let container = state.container(id)?;
        Ok(run_command(container, cmd, &hosts))
    }

    async fn logs(&self, id: &ResourceId) -> EphemeraResult<LogStream> {
        let mut state = self.state.lock();
        let container = state.container(id)?;
        let history = futures::stream::iter(container.history.clone().into_iter().map(Ok));
        let Some(tx) = &container.log_tx else {
            return Ok(history.boxed());
        };
        let live = BroadcastStream::new(tx.subscribe())
            .map(|item| item.map_err(|e| EphemeraError::runtime("logs", e)));
        Ok(history.chain(live).boxed())
    }

    async fn list_by_label(
        &self,
        kind: ResourceKind,
        key: &str,
        value: Option<&str>,
    ) -> EphemeraResult<Vec<LabeledResource>> {
        let state = self.state.lock();
        let matches = |labels: &BTreeMap<String, String>| {
            labels
                .get(key)
                .is_some_and(|v| value.is_none_or(|want| v == want))
        };
        let found = |id: &ResourceId, labels: &BTreeMap<String, String>, created_at| LabeledResource {
            id: id.clone(),
            kind,
            labels: labels.clone().into_iter().collect(),
            created_at: Some(created_at),
        };
        Ok(match kind {
            ResourceKind::Container => state
                .containers
                .iter()
                .filter(|(_, c)| matches(&c.config.labels))
                .map(|(id, c)| found(id, &c.config.labels, c.created_at))
                .collect(),
            ResourceKind::Network => state
                .networks
                .iter()
                .filter(|(_, n)| matches(&n.labels))
                .map(|(id, n)| found(id, &n.labels, n.created_at))
                .collect(),
            ResourceKind::Volume => state
                .volumes
                .iter()
                .filter(|(_, v)| matches(&v.labels))
                .map(|(id, v)| found(id, &v.labels, v.created_at))
                .collect(),
        })
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> EphemeraResult<ResourceId> {
        let id = ResourceId::new(uuid::Uuid::new_v4().simple().to_string());
        self.state.lock().networks.insert(
            id.clone(),
            NetworkEntry {
                name: name.to_string(),
                labels: labels.clone(),
                endpoints: HashMap::new(),
                created_at: Utc::now(),
            },
        );
        tracing::debug!(network = %name, id = %id.short(), "Created network");
        Ok(id)
    }

    async fn remove_network(&self, id: &ResourceId) -> EphemeraResult<()> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::RemoveNetwork)?;
        let network = state
            .networks
            .get(id)
            .ok_or_else(|| not_found(ResourceKind::Network, id))?;
        if !network.endpoints.is_empty() {
            return Err(EphemeraError::NetworkBusy {
                network: network.name.clone(),
            });
        }
        state.networks.remove(id);
        Ok(())
    }

    async fn connect(
        &self,
        network: &ResourceId,
        container: &ResourceId,
        aliases: &[String],
    ) -> EphemeraResult<()> {
        let mut state = self.state.lock();
        state.take_fault(FaultPoint::Connect)?;
        state.container(container)?;
        let entry = state
            .networks
            .get_mut(network)
            .ok_or_else(|| not_found(ResourceKind::Network, network))?;
        if entry.endpoints.contains_key(container) {
            return Err(EphemeraError::runtime(
                "connect",
                format!("endpoint already exists in network {}", entry.name),
            ));
        }
        entry.endpoints.insert(container.clone(), aliases.to_vec());
        Ok(())
    }

    async fn disconnect(&self, network: &ResourceId, container: &ResourceId) -> EphemeraResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .networks
            .get_mut(network)
            .ok_or_else(|| not_found(ResourceKind::Network, network))?;
        if entry.endpoints.remove(container).is_none() {
            return Err(EphemeraError::runtime(
                "disconnect",
                format!("container {} is not connected to {}", container.short(), entry.name),
            ));
        }
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> EphemeraResult<ResourceId> {
        let id = ResourceId::new(name);
        self.state.lock().volumes.insert(
            id.clone(),
            VolumeEntry {
                labels: labels.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn remove_volume(&self, id: &ResourceId) -> EphemeraResult<()> {
        let mut state = self.state.lock();
        if !state.volumes.contains_key(id) {
            return Err(not_found(ResourceKind::Volume, id));
        }
        let in_use = state.containers.values().any(|c| {
            c.config
                .mounts
                .iter()
                .any(|m| matches!(&m.source, MountSource::Volume(name) if name == id.as_str()))
        });
        if in_use {
            return Err(EphemeraError::runtime(
                "remove_volume",
                format!("volume {id} is in use"),
            ));
        }
        state.volumes.remove(id);
        Ok(())
    }
}

async fn serve(listener: TcpListener, statuses: Vec<u16>, counter: Arc<AtomicUsize>) {
    while let Ok((mut stream, _)) = listener.accept().await {
        if statuses.is_empty() {
            continue;
        }
        let n = counter.fetch_add(1, Ordering::SeqCst);
        let status = statuses[n.min(statuses.len() - 1)];
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status} Status\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

/// Turn `sh -c "sleep 1; echo ready"` into a script. Other commands run
/// forever without output.
fn script_for(cmd: &[String]) -> Option<Vec<Step>> {
    let script = match cmd {
        [] => return None,
        [shell, flag, script] if is_shell(shell) && flag == "-c" => script,
        _ => return Some(Vec::new()),
    };
    let mut steps = Vec::new();
    for statement in statements(script) {
        match statement.as_slice() {
            [sleep, arg] if sleep == "sleep" && arg == "infinity" => return Some(steps),
            [sleep, arg] if sleep == "sleep" => {
                let secs: f64 = arg.parse().unwrap_or(0.0);
                steps.push(Step::Sleep(Duration::from_secs_f64(secs.max(0.0))));
            }
            [echo, rest @ ..] if echo == "echo" => steps.push(Step::Log(rest.join(" "))),
            _ => {}
        }
    }
    steps.push(Step::Exit(0));
    Some(steps)
}

fn is_shell(program: &str) -> bool {
    matches!(program, "sh" | "/bin/sh" | "bash" | "/bin/bash")
}

fn statements(script: &str) -> Vec<Vec<String>> {
    script
        .split(';')
        .flat_map(|s| s.split("&&"))
        .map(|s| {
            s.split_whitespace()
                .map(|w| w.trim_matches(|c| c == '"' || c == '\'').to_string())
                .collect::<Vec<_>>()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn run_command(container: &mut ContainerEntry, cmd: &[String], reachable: &[String]) -> ExecOutput {
    match cmd {
        [shell, flag, script] if is_shell(shell) && flag == "-c" => {
            let mut out = ExecOutput::default();
            for statement in statements(script) {
                let step = run_command(container, &statement, reachable);
                out.stdout.push_str(&step.stdout);
                out.stderr.push_str(&step.stderr);
                out.exit_code = step.exit_code;
                if !step.success() {
                    break;
                }
            }
            out
        }
        [program, args @ ..] => builtin(container, program, args, reachable),
        [] => failure(126, "empty command"),
    }
}

fn builtin(container: &mut ContainerEntry, program: &str, args: &[String], reachable: &[String]) -> ExecOutput {
    match (program, args) {
        ("true", _) => ExecOutput::default(),
        ("false", _) => failure(1, ""),
        ("echo", args) => {
            if let Some(pos) = args.iter().position(|a| a == ">") {
                let Some(target) = args.get(pos + 1) else {
                    return failure(2, "syntax error near unexpected token `newline'");
                };
                let path = normalize(target);
                add_parents(&mut container.dirs, &path);
                container
                    .files
                    .insert(path, Bytes::from(format!("{}\n", args[..pos].join(" "))));
                ExecOutput::default()
            } else {
                ExecOutput {
                    stdout: format!("{}\n", args.join(" ")),
                    ..ExecOutput::default()
                }
            }
        }
        ("cat", [path]) => match container.files.get(&normalize(path)) {
            Some(content) => ExecOutput {
                stdout: String::from_utf8_lossy(content).into_owned(),
                ..ExecOutput::default()
            },
            None => failure(1, &format!("cat: {path}: No such file or directory")),
        },
        ("mkdir", [flag, path]) if flag == "-p" => {
            let path = normalize(path);
            add_parents(&mut container.dirs, &path);
            container.dirs.insert(path);
            ExecOutput::default()
        }
        ("rm", [flag, path]) if flag == "-rf" => {
            let path = normalize(path);
            container.files.retain(|f, _| !is_under(f, &path));
            container.modes.retain(|f, _| !is_under(f, &path));
            container.dirs.retain(|d| d == "/" || !is_under(d, &path));
            ExecOutput::default()
        }
        ("cp", [flag, src, dst]) if flag == "-a" => copy(container, src, dst),
        ("ping", [.., host]) => {
            if reachable.contains(host) {
                ExecOutput {
                    stdout: format!("1 packets transmitted, 1 packets received ({host})\n"),
                    ..ExecOutput::default()
                }
            } else {
                failure(1, &format!("ping: bad address '{host}'"))
            }
        }
        _ => failure(127, &format!("{program}: command not found")),
    }
}

fn copy(container: &mut ContainerEntry, src: &str, dst: &str) -> ExecOutput {
    let dst = normalize(dst);
    let (src, target) = match src.strip_suffix("/.") {
        Some(dir) => (normalize(dir), dst),
        None => {
            let src = normalize(src);
            let target = if container.dirs.contains(&dst) {
                let name = src.rsplit('/').next().unwrap_or_default();
                format!("{}/{name}", dst.trim_end_matches('/'))
            } else {
                dst
            };
            (src, target)
        }
    };
    if !container.dirs.contains(&src) && !container.files.contains_key(&src) {
        return failure(1, &format!("cp: cannot stat '{src}': No such file or directory"));
    }
    let rebase = |path: &str| format!("{target}{}", &path[src.len()..]);
    let files: Vec<_> = container
        .files
        .iter()
        .filter(|(f, _)| is_under(f, &src))
        .map(|(f, c)| (rebase(f), c.clone()))
        .collect();
    let dirs: Vec<_> = container
        .dirs
        .iter()
        .filter(|d| is_under(d, &src))
        .map(|d| rebase(d))
        .collect();
    add_parents(&mut container.dirs, &target);
    container.dirs.extend(dirs);
    container.files.extend(files);
    ExecOutput::default()
}

fn failure(code: i64, stderr: &str) -> ExecOutput {
    ExecOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: if stderr.is_empty() {
            String::new()
        } else {
            format!("{stderr}\n")
        },
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn is_under(path: &str, root: &str) -> bool {
    root == "/" || path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}

fn add_parents(dirs: &mut BTreeSet<String>, path: &str) {
    let mut current = String::new();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    dirs.insert("/".to_string());
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(segment);
        dirs.insert(current.clone());
    }
}
