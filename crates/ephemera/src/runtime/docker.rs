//! Docker Engine backend.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bytes::Bytes;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, ListNetworksOptions,
};
use bollard::models::{ContainerStateStatusEnum, EndpointSettings, HostConfig, PortBinding};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use chrono::{DateTime, Utc};
use ephemera_common::{EphemeraError, EphemeraResult, ResourceId, ResourceKind, Settings};
use futures::StreamExt;

use super::{
    ContainerInfo, ContainerStatus, CreateConfig, ExecOutput, LabeledResource, LogStream,
    RuntimeClient,
};
use crate::spec::{ContainerPort, MountMode, MountSource};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// [`RuntimeClient`] backed by the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the default socket).
    ///
    /// # Errors
    ///
    /// Returns a runtime error if the client cannot be configured.
    pub fn connect() -> EphemeraResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| map_err("connect", e))?;
        Ok(Self { docker })
    }

    /// Connect to an explicit Unix socket.
    ///
    /// # Errors
    ///
    /// Returns a runtime error if the client cannot be configured.
    pub fn connect_socket(path: &Path) -> EphemeraResult<Self> {
        let docker = Docker::connect_with_socket(
            &path.to_string_lossy(),
            CONNECT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| map_err("connect", e))?;
        Ok(Self { docker })
    }

    /// Connect honoring the runtime socket override in `settings`.
    ///
    /// # Errors
    ///
    /// Returns a runtime error if the client cannot be configured.
    pub fn from_settings(settings: &Settings) -> EphemeraResult<Self> {
        match &settings.runtime_socket {
            Some(path) => Self::connect_socket(path),
            None => Self::connect(),
        }
    }

    /// Check the daemon answers.
    ///
    /// # Errors
    ///
    /// Returns a runtime error if the daemon is unreachable.
    pub async fn ping(&self) -> EphemeraResult<()> {
        self.docker.ping().await.map_err(|e| map_err("ping", e))?;
        Ok(())
    }
}

fn map_err(operation: &str, err: bollard::errors::Error) -> EphemeraError {
    EphemeraError::runtime(operation, err)
}

fn map_missing(kind: ResourceKind, id: &ResourceId, operation: &str, err: bollard::errors::Error) -> EphemeraError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => EphemeraError::NotFound {
            kind,
            id: id.to_string(),
        },
        bollard::errors::Error::DockerResponseServerError { message, .. }
            if kind == ResourceKind::Network && message.contains("active endpoints") =>
        {
            EphemeraError::NetworkBusy {
                network: id.to_string(),
            }
        }
        other => map_err(operation, other),
    }
}

fn filters(key: &str, value: Option<&str>) -> HashMap<String, Vec<String>> {
    let filter = value.map_or_else(|| key.to_string(), |v| format!("{key}={v}"));
    HashMap::from([("label".to_string(), vec![filter])])
}

fn host_config(config: &CreateConfig) -> HostConfig {
    let port_bindings = config
        .exposed_ports
        .iter()
        .map(|port| {
            let binding = PortBinding {
                host_ip: None,
                host_port: Some(String::new()),
            };
            (port.to_string(), Some(vec![binding]))
        })
        .collect();
    let binds = config
        .mounts
        .iter()
        .map(|mount| {
            let source = match &mount.source {
                MountSource::Bind(path) => path.to_string_lossy().into_owned(),
                MountSource::Volume(name) => name.clone(),
            };
            let mode = match mount.mode {
                MountMode::ReadOnly => "ro",
                MountMode::ReadWrite => "rw",
            };
            format!("{source}:{}:{mode}", mount.target)
        })
        .collect();
    HostConfig {
        port_bindings: Some(port_bindings),
        binds: Some(binds),
        tmpfs: Some(config.tmpfs.clone().into_iter().collect()),
        ..Default::default()
    }
}

fn published_ports(
    ports: Option<HashMap<String, Option<Vec<PortBinding>>>>,
) -> HashMap<ContainerPort, SocketAddr> {
    let mut mapped = HashMap::new();
    for (key, bindings) in ports.unwrap_or_default() {
        let Ok(port) = key.parse::<ContainerPort>() else {
            continue;
        };
        // Prefer the IPv4 binding when the daemon publishes on both stacks.
        let addr = bindings.unwrap_or_default().into_iter().find_map(|b| {
            let host_port = b.host_port?.parse::<u16>().ok()?;
            let ip = match b.host_ip.as_deref() {
                None | Some("" | "0.0.0.0") => IpAddr::V4(Ipv4Addr::LOCALHOST),
                Some(ip) => ip.parse().ok().filter(IpAddr::is_ipv4)?,
            };
            Some(SocketAddr::new(ip, host_port))
        });
        if let Some(addr) = addr {
            mapped.insert(port, addr);
        }
    }
    mapped
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn create(&self, config: &CreateConfig) -> EphemeraResult<ResourceId> {
        let exposed_ports = config
            .exposed_ports
            .iter()
            .map(|p| (p.to_string(), HashMap::new()))
            .collect();
        let body = Config {
            image: Some(config.image.clone()),
            env: Some(config.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            cmd: (!config.cmd.is_empty()).then(|| config.cmd.clone()),
            labels: Some(config.labels.clone().into_iter().collect()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config(config)),
            ..Default::default()
        };
        let options = config.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });
        let response = self
            .docker
            .create_container(options, body)
            .await
            .map_err(|e| map_err("create", e))?;
        for warning in &response.warnings {
            tracing::warn!(container = %response.id, warning = %warning, "Runtime warning");
        }
        Ok(ResourceId::new(response.id))
    }

    async fn start(&self, id: &ResourceId) -> EphemeraResult<()> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_missing(ResourceKind::Container, id, "start", e))
    }

    async fn stop(&self, id: &ResourceId, timeout: Duration) -> EphemeraResult<()> {
        let options = StopContainerOptions {
            t: i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX),
        };
        match self.docker.stop_container(id.as_str(), Some(options)).await {
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            other => other.map_err(|e| map_missing(ResourceKind::Container, id, "stop", e)),
        }
    }

    async fn remove(&self, id: &ResourceId) -> EphemeraResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id.as_str(), Some(options))
            .await
            .map_err(|e| map_missing(ResourceKind::Container, id, "remove", e))
    }

    async fn inspect(&self, id: &ResourceId) -> EphemeraResult<ContainerInfo> {
        let response = self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_missing(ResourceKind::Container, id, "inspect", e))?;

        let status = response.state.as_ref().map_or(ContainerStatus::Unknown, |state| {
            match state.status {
                Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
                Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
                Some(ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD) => {
                    ContainerStatus::Exited(state.exit_code.unwrap_or(-1))
                }
                _ => ContainerStatus::Unknown,
            }
        });
        let (image, labels) = response
            .config
            .map(|c| (c.image.unwrap_or_default(), c.labels.unwrap_or_default()))
            .unwrap_or_default();
        Ok(ContainerInfo {
            id: id.clone(),
            name: response.name.map(|n| n.trim_start_matches('/').to_string()),
            image,
            status,
            ports: published_ports(response.network_settings.and_then(|n| n.ports)),
            labels,
        })
    }

    async fn exec(&self, id: &ResourceId, cmd: &[String]) -> EphemeraResult<ExecOutput> {
        let options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(id.as_str(), options)
            .await
            .map_err(|e| map_missing(ResourceKind::Container, id, "exec", e))?;

        let mut out = ExecOutput::default();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_err("exec", e))?
        {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(|e| map_err("exec", e))? {
                    bollard::container::LogOutput::StdOut { message } => {
                        out.stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        out.stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_err("exec", e))?;
        out.exit_code = inspect.exit_code.unwrap_or(-1);
        Ok(out)
    }

    async fn copy_to(
        &self,
        id: &ResourceId,
        path: &str,
        content: &Bytes,
        mode: u32,
    ) -> EphemeraResult<()> {
        let archive = file_archive(path, content, mode)?;
        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id.as_str(), Some(options), archive)
            .await
            .map_err(|e| map_missing(ResourceKind::Container, id, "copy", e))?;
        tracing::debug!(container = %id.short(), %path, mode = format_args!("{mode:o}"), "Copied file");
        Ok(())
    }

    async fn logs(&self, id: &ResourceId) -> EphemeraResult<LogStream> {
        // Fail fast on unknown containers instead of on the first poll.
        self.inspect(id).await?;
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let stream = self
            .docker
            .logs(id.as_str(), Some(options))
            .map(|chunk| chunk.map(bollard::container::LogOutput::into_bytes).map_err(|e| map_err("logs", e)));
        Ok(stream.boxed())
    }

    async fn list_by_label(
        &self,
        kind: ResourceKind,
        key: &str,
        value: Option<&str>,
    ) -> EphemeraResult<Vec<LabeledResource>> {
        let filters = filters(key, value);
        match kind {
            ResourceKind::Container => {
                let options = ListContainersOptions {
                    all: true,
                    filters,
                    ..Default::default()
                };
                let containers = self
                    .docker
                    .list_containers(Some(options))
                    .await
                    .map_err(|e| map_err("list containers", e))?;
                Ok(containers
                    .into_iter()
                    .filter_map(|c| {
                        Some(LabeledResource {
                            id: ResourceId::new(c.id?),
                            kind,
                            labels: c.labels.unwrap_or_default(),
                            created_at: c.created.and_then(|t| DateTime::from_timestamp(t, 0)),
                        })
                    })
                    .collect())
            }
            ResourceKind::Network => {
                let networks = self
                    .docker
                    .list_networks(Some(ListNetworksOptions { filters }))
                    .await
                    .map_err(|e| map_err("list networks", e))?;
                Ok(networks
                    .into_iter()
                    .filter_map(|n| {
                        Some(LabeledResource {
                            id: ResourceId::new(n.id?),
                            kind,
                            labels: n.labels.unwrap_or_default(),
                            created_at: n.created.as_deref().and_then(parse_time),
                        })
                    })
                    .collect())
            }
            ResourceKind::Volume => {
                let response = self
                    .docker
                    .list_volumes(Some(ListVolumesOptions { filters }))
                    .await
                    .map_err(|e| map_err("list volumes", e))?;
                Ok(response
                    .volumes
                    .unwrap_or_default()
                    .into_iter()
                    .map(|v| LabeledResource {
                        id: ResourceId::new(v.name),
                        kind,
                        labels: v.labels,
                        created_at: v.created_at.as_deref().and_then(parse_time),
                    })
                    .collect())
            }
        }
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> EphemeraResult<ResourceId> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            check_duplicate: true,
            labels: labels.clone().into_iter().collect(),
            ..Default::default()
        };
        let response = self
            .docker
            .create_network(options)
            .await
            .map_err(|e| map_err("create network", e))?;
        if response.id.is_empty() {
            return Err(EphemeraError::runtime("create network", "no ID returned"));
        }
        Ok(ResourceId::new(response.id))
    }

    async fn remove_network(&self, id: &ResourceId) -> EphemeraResult<()> {
        self.docker
            .remove_network(id.as_str())
            .await
            .map_err(|e| map_missing(ResourceKind::Network, id, "remove network", e))
    }

    async fn connect(
        &self,
        network: &ResourceId,
        container: &ResourceId,
        aliases: &[String],
    ) -> EphemeraResult<()> {
        let options = ConnectNetworkOptions {
            container: container.to_string(),
            endpoint_config: EndpointSettings {
                aliases: (!aliases.is_empty()).then(|| aliases.to_vec()),
                ..Default::default()
            },
        };
        self.docker
            .connect_network(network.as_str(), options)
            .await
            .map_err(|e| map_missing(ResourceKind::Network, network, "connect", e))
    }

    async fn disconnect(&self, network: &ResourceId, container: &ResourceId) -> EphemeraResult<()> {
        let options = DisconnectNetworkOptions {
            container: container.to_string(),
            force: true,
        };
        self.docker
            .disconnect_network(network.as_str(), options)
            .await
            .map_err(|e| map_missing(ResourceKind::Network, network, "disconnect", e))
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> EphemeraResult<ResourceId> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            labels: labels.clone().into_iter().collect(),
            ..Default::default()
        };
        let volume = self
            .docker
            .create_volume(options)
            .await
            .map_err(|e| map_err("create volume", e))?;
        Ok(ResourceId::new(volume.name))
    }

    async fn remove_volume(&self, id: &ResourceId) -> EphemeraResult<()> {
        self.docker
            .remove_volume(id.as_str(), None::<RemoveVolumeOptions>)
            .await
            .map_err(|e| map_missing(ResourceKind::Volume, id, "remove volume", e))
    }
}

/// Pack one file into a tar archive rooted at `/`.
fn file_archive(path: &str, content: &[u8], mode: u32) -> EphemeraResult<Bytes> {
    let relative = path.trim_start_matches('/');
    let mut header = tar::Header::new_gnu();
    header
        .set_path(relative)
        .map_err(|e| EphemeraError::runtime("copy", format!("{path}: {e}")))?;
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_mtime(Utc::now().timestamp().try_into().unwrap_or_default());
    header.set_cksum();

    let mut archive = tar::Builder::new(Vec::new());
    archive.append(&header, content)?;
    Ok(Bytes::from(archive.into_inner()?))
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
