//! Container specifications.
//!
//! A [`ContainerSpec`] describes one disposable service instance: the image,
//! exposed ports, environment, command, mounts, labels, network attachments
//! and the wait strategy that defines "ready". Specs are built with `with_*`
//! methods and handed to the coordinator by reference; the coordinator never
//! mutates them.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use bytes::Bytes;
use ephemera_common::labels;
use ephemera_common::{EphemeraError, EphemeraResult, ResourceId};
use serde::{Deserialize, Serialize};

use crate::wait::{Probe, ProbeKind, WaitStrategy};

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP protocol.
    #[default]
    Tcp,
    /// UDP protocol.
    Udp,
}

impl Protocol {
    /// Get the protocol string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A port inside the container, e.g. `5432/tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerPort {
    /// Port number.
    pub port: u16,
    /// Protocol.
    pub protocol: Protocol,
}

impl ContainerPort {
    /// A TCP port.
    #[must_use]
    pub const fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    /// A UDP port.
    #[must_use]
    pub const fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for ContainerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl From<u16> for ContainerPort {
    fn from(port: u16) -> Self {
        Self::tcp(port)
    }
}

impl FromStr for ContainerPort {
    type Err = EphemeraError;

    /// Parse `80`, `80/tcp` or `53/udp`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, protocol) = s.split_once('/').unwrap_or((s, "tcp"));
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| EphemeraError::invalid_spec(format!("invalid port: {s:?}")))?;
        let protocol = match protocol.to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => {
                return Err(EphemeraError::invalid_spec(format!(
                    "unsupported protocol: {other:?}"
                )));
            }
        };
        Ok(Self { port, protocol })
    }
}

/// Where a mount comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountSource {
    /// A host path.
    Bind(PathBuf),
    /// A named volume, created and labeled by the session if needed.
    Volume(String),
}

/// Access mode of a mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountMode {
    /// Read-only.
    ReadOnly,
    /// Read-write.
    #[default]
    ReadWrite,
}

/// A mount into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Source of the mount.
    pub source: MountSource,
    /// Absolute path inside the container.
    pub target: String,
    /// Access mode.
    pub mode: MountMode,
}

impl Mount {
    /// Bind-mount a host path.
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: MountSource::Bind(source.into()),
            target: target.into(),
            mode: MountMode::ReadWrite,
        }
    }

    /// Mount a named volume.
    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: MountSource::Volume(name.into()),
            target: target.into(),
            mode: MountMode::ReadWrite,
        }
    }

    /// Make the mount read-only.
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.mode = MountMode::ReadOnly;
        self
    }
}

/// A network the container joins before it is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Network identifier.
    pub network: ResourceId,
    /// Aliases other containers on the network can use.
    pub aliases: Vec<String>,
}

/// A file copied into the container before it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerFile {
    /// File content.
    pub content: Bytes,
    /// Absolute path inside the container.
    pub path: String,
    /// Unix permission bits.
    pub mode: u32,
}

/// Everything needed to start one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Optional container name.
    pub name: Option<String>,
    /// Exposed ports, published to random host ports.
    pub exposed_ports: Vec<ContainerPort>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Command override.
    pub cmd: Vec<String>,
    /// Mounts.
    pub mounts: Vec<Mount>,
    /// tmpfs mounts (target to mount options).
    pub tmpfs: BTreeMap<String, String>,
    /// User labels. Keys under the reserved prefix are rejected.
    pub labels: BTreeMap<String, String>,
    /// Networks to attach before start.
    pub networks: Vec<NetworkAttachment>,
    /// Files copied in before start.
    pub files: Vec<ContainerFile>,
    /// What "ready" means.
    pub wait: WaitStrategy,
}

impl ContainerSpec {
    /// Start a spec for an image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: None,
            exposed_ports: Vec::new(),
            env: BTreeMap::new(),
            cmd: Vec::new(),
            mounts: Vec::new(),
            tmpfs: BTreeMap::new(),
            labels: BTreeMap::new(),
            networks: Vec::new(),
            files: Vec::new(),
            wait: WaitStrategy::default(),
        }
    }

    /// Set the container name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Expose a port.
    #[must_use]
    pub fn with_exposed_port(mut self, port: impl Into<ContainerPort>) -> Self {
        self.exposed_ports.push(port.into());
        self
    }

    /// Set an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Override the command.
    #[must_use]
    pub fn with_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    /// Add a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a mount.
    #[must_use]
    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Add a tmpfs mount.
    #[must_use]
    pub fn with_tmpfs(mut self, target: impl Into<String>, options: impl Into<String>) -> Self {
        self.tmpfs.insert(target.into(), options.into());
        self
    }

    /// Attach to a network under the given aliases.
    #[must_use]
    pub fn with_network<I, S>(mut self, network: impl Into<ResourceId>, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.networks.push(NetworkAttachment {
            network: network.into(),
            aliases: aliases.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Copy a file to `path` before the container starts.
    #[must_use]
    pub fn with_file(mut self, content: impl Into<Bytes>, path: impl Into<String>, mode: u32) -> Self {
        self.files.push(ContainerFile {
            content: content.into(),
            path: path.into(),
            mode,
        });
        self
    }

    /// Set the wait strategy.
    #[must_use]
    pub fn with_wait(mut self, wait: WaitStrategy) -> Self {
        self.wait = wait;
        self
    }

    /// Add one readiness probe to the wait strategy.
    #[must_use]
    pub fn waiting_for(mut self, probe: Probe) -> Self {
        self.wait = self.wait.and(probe);
        self
    }

    /// Check the spec before anything is created.
    ///
    /// # Errors
    ///
    /// Returns [`EphemeraError::InvalidSpec`] describing the first problem found.
    pub fn validate(&self) -> EphemeraResult<()> {
        if self.image.trim().is_empty() {
            return Err(EphemeraError::invalid_spec("image must not be empty"));
        }

        let mut seen = HashSet::new();
        for port in &self.exposed_ports {
            if !seen.insert(*port) {
                return Err(EphemeraError::invalid_spec(format!(
                    "port {port} is exposed more than once"
                )));
            }
        }

        if let Some(key) = self.labels.keys().find(|k| labels::is_reserved(k)) {
            return Err(EphemeraError::invalid_spec(format!(
                "label {key} uses the reserved prefix {}",
                labels::PREFIX
            )));
        }

        for mount in &self.mounts {
            if mount.target.is_empty() {
                return Err(EphemeraError::invalid_spec("mount target must not be empty"));
            }
            if let MountSource::Volume(name) = &mount.source {
                if name.is_empty() {
                    return Err(EphemeraError::invalid_spec("volume name must not be empty"));
                }
            }
        }
        if self.tmpfs.keys().any(String::is_empty) {
            return Err(EphemeraError::invalid_spec("tmpfs target must not be empty"));
        }

        for attachment in &self.networks {
            if attachment.aliases.iter().any(|a| a.trim().is_empty()) {
                return Err(EphemeraError::invalid_spec(format!(
                    "empty alias on network {}",
                    attachment.network
                )));
            }
        }

        for file in &self.files {
            if !file.path.starts_with('/') || file.path.ends_with('/') {
                return Err(EphemeraError::invalid_spec(format!(
                    "file path {:?} must be an absolute file path",
                    file.path
                )));
            }
            if file.mode > 0o7777 {
                return Err(EphemeraError::invalid_spec(format!(
                    "file mode {:o} of {} is out of range",
                    file.mode, file.path
                )));
            }
        }

        for probe in self.wait.probes() {
            self.validate_probe(probe, &seen)?;
        }
        Ok(())
    }

    fn validate_probe(&self, probe: &Probe, exposed: &HashSet<ContainerPort>) -> EphemeraResult<()> {
        if probe.poll_interval.is_zero() {
            return Err(EphemeraError::invalid_spec(format!(
                "{probe}: poll interval must be positive"
            )));
        }
        match &probe.kind {
            ProbeKind::LogMatches { occurrences, .. } if *occurrences == 0 => Err(
                EphemeraError::invalid_spec(format!("{probe}: occurrences must be at least 1")),
            ),
            ProbeKind::PortOpen(port) if port.protocol == Protocol::Udp => Err(
                EphemeraError::invalid_spec(format!("{probe}: only TCP ports can be probed")),
            ),
            ProbeKind::PortOpen(port)
            | ProbeKind::Http { port, .. }
            | ProbeKind::Connection { port, .. }
                if !exposed.contains(port) =>
            {
                Err(EphemeraError::invalid_spec(format!(
                    "{probe}: port {port} is not exposed by {}",
                    self.image
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn assert_invalid(spec: &ContainerSpec, needle: &str) {
        match spec.validate() {
            Err(EphemeraError::InvalidSpec { reason }) => {
                assert!(reason.contains(needle), "{reason:?} does not mention {needle:?}");
            }
            other => panic!("expected InvalidSpec, got {other:?}"),
        }
    }

    #[test]
    fn parse_ports() {
        assert_eq!("80".parse::<ContainerPort>().unwrap(), ContainerPort::tcp(80));
        assert_eq!("53/udp".parse::<ContainerPort>().unwrap(), ContainerPort::udp(53));
        assert_eq!("8080/TCP".parse::<ContainerPort>().unwrap().to_string(), "8080/tcp");
        assert!("0".parse::<ContainerPort>().is_err());
        assert!("80/sctp".parse::<ContainerPort>().is_err());
        assert!("http".parse::<ContainerPort>().is_err());
    }

    #[test]
    fn file_paths_must_be_absolute() {
        assert_invalid(&ContainerSpec::new("nginx").with_file("x", "etc/x", 0o644), "etc/x");
        assert_invalid(&ContainerSpec::new("nginx").with_file("x", "/etc/", 0o644), "/etc/");
        assert_invalid(&ContainerSpec::new("nginx").with_file("x", "/x", 0o17777), "mode");
        ContainerSpec::new("nginx")
            .with_file("<h1>hi</h1>", "/usr/share/nginx/html/index.html", 0o644)
            .validate()
            .unwrap();
    }

    #[test]
    fn minimal_spec_is_valid() {
        ContainerSpec::new("alpine:3.19").validate().unwrap();
    }

    #[test]
    fn empty_image() {
        assert_invalid(&ContainerSpec::new("  "), "image");
    }

    #[test]
    fn duplicate_ports() {
        let spec = ContainerSpec::new("nginx")
            .with_exposed_port(80)
            .with_exposed_port(ContainerPort::udp(80))
            .with_exposed_port(80);
        assert_invalid(&spec, "80/tcp");
    }

    #[test]
    fn reserved_labels() {
        let spec = ContainerSpec::new("nginx").with_label(labels::SESSION_ID, "x");
        assert_invalid(&spec, "reserved");
    }

    #[test]
    fn probes_must_target_exposed_ports() {
        let spec = ContainerSpec::new("nginx").waiting_for(Probe::port(80));
        assert_invalid(&spec, "not exposed");

        let spec = ContainerSpec::new("nginx")
            .with_exposed_port(80)
            .waiting_for(Probe::http("/", 80));
        spec.validate().unwrap();
    }

    #[test]
    fn log_probe_needs_an_occurrence() {
        let spec = ContainerSpec::new("alpine")
            .waiting_for(Probe::log("ready").unwrap().with_occurrences(0));
        assert_invalid(&spec, "occurrences");
    }

    #[test]
    fn zero_poll_interval() {
        let spec = ContainerSpec::new("alpine")
            .waiting_for(Probe::log("ready").unwrap().with_poll_interval(Duration::ZERO));
        assert_invalid(&spec, "poll interval");
    }

    #[test]
    fn empty_alias_and_mount_target() {
        let spec = ContainerSpec::new("alpine").with_network("net1", ["a", ""]);
        assert_invalid(&spec, "alias");

        let spec = ContainerSpec::new("alpine").with_mount(Mount::volume("data", ""));
        assert_invalid(&spec, "mount target");
    }
}
