//! Readiness probes and the wait evaluator.
//!
//! A [`WaitStrategy`] is a set of [`Probe`]s that must all succeed once. Each
//! probe is polled on its own interval; a probe that succeeded stays
//! succeeded. A probe answers every poll with a [`ProbePoll`]:
//!
//! - `Ready`: the signal was observed
//! - `Pending`: not yet, with a diagnostic kept for timeout reports
//! - `Failed`: the probe itself broke and waiting longer cannot help

mod evaluator;
mod log;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ephemera_common::{EphemeraError, EphemeraResult};
use futures::future::BoxFuture;
use regex::Regex;

use crate::spec::ContainerPort;

pub use evaluator::{ProbeTarget, WaitContext, WaitEvaluator};
pub use log::LogScanner;

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default time a container gets to become ready.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbePoll {
    /// The probe succeeded.
    Ready,
    /// Not ready yet.
    Pending(String),
    /// The probe errored.
    Failed(String),
}

/// Predicate over HTTP status codes.
#[derive(Clone)]
pub struct StatusMatcher(Arc<dyn Fn(u16) -> bool + Send + Sync>);

impl StatusMatcher {
    /// Match with an arbitrary predicate.
    pub fn new(f: impl Fn(u16) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Match exactly one status.
    #[must_use]
    pub fn exactly(status: u16) -> Self {
        Self::new(move |s| s == status)
    }

    /// Whether `status` is accepted.
    #[must_use]
    pub fn matches(&self, status: u16) -> bool {
        (self.0)(status)
    }
}

impl Default for StatusMatcher {
    fn default() -> Self {
        Self::exactly(200)
    }
}

impl fmt::Debug for StatusMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StatusMatcher(..)")
    }
}

/// Dials a published endpoint and reports whether the service accepts work.
pub type DialFn = Arc<dyn Fn(SocketAddr) -> BoxFuture<'static, ProbePoll> + Send + Sync>;

/// What a probe checks.
#[derive(Clone)]
pub enum ProbeKind {
    /// A TCP connection to the published port succeeds.
    PortOpen(ContainerPort),
    /// The container output matched `pattern` at least `occurrences` times.
    LogMatches {
        /// Pattern matched against each output line.
        pattern: Regex,
        /// Required number of matches.
        occurrences: usize,
    },
    /// An HTTP GET returns an accepted status.
    Http {
        /// Request path.
        path: String,
        /// Container port serving HTTP.
        port: ContainerPort,
        /// Accepted statuses.
        status: StatusMatcher,
    },
    /// A caller-supplied dial function, e.g. a SQL `SELECT 1`.
    Connection {
        /// Container port to dial.
        port: ContainerPort,
        /// Name used in diagnostics.
        label: String,
        /// The dial function.
        dial: DialFn,
    },
}

/// One readiness probe.
#[derive(Clone)]
pub struct Probe {
    /// What to check.
    pub kind: ProbeKind,
    /// Interval between polls.
    pub poll_interval: Duration,
    /// Overrides the strategy's startup timeout.
    pub startup_timeout: Option<Duration>,
}

impl Probe {
    fn from_kind(kind: ProbeKind) -> Self {
        Self {
            kind,
            poll_interval: DEFAULT_POLL_INTERVAL,
            startup_timeout: None,
        }
    }

    /// Wait until a TCP port accepts connections.
    pub fn port(port: impl Into<ContainerPort>) -> Self {
        Self::from_kind(ProbeKind::PortOpen(port.into()))
    }

    /// Wait until a regular expression matched the output once.
    ///
    /// # Errors
    ///
    /// Returns [`EphemeraError::InvalidSpec`] if the pattern does not compile.
    pub fn log(pattern: &str) -> EphemeraResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| EphemeraError::invalid_spec(format!("invalid log pattern: {e}")))?;
        Ok(Self::log_regex(pattern))
    }

    /// Wait until a compiled expression matched the output once.
    #[must_use]
    pub fn log_regex(pattern: Regex) -> Self {
        Self::from_kind(ProbeKind::LogMatches {
            pattern,
            occurrences: 1,
        })
    }

    /// Wait until `GET path` on a port returns 200.
    pub fn http(path: impl Into<String>, port: impl Into<ContainerPort>) -> Self {
        Self::from_kind(ProbeKind::Http {
            path: path.into(),
            port: port.into(),
            status: StatusMatcher::default(),
        })
    }

    /// Wait until a dial function reports the service ready.
    pub fn connection<F>(port: impl Into<ContainerPort>, label: impl Into<String>, dial: F) -> Self
    where
        F: Fn(SocketAddr) -> BoxFuture<'static, ProbePoll> + Send + Sync + 'static,
    {
        Self::from_kind(ProbeKind::Connection {
            port: port.into(),
            label: label.into(),
            dial: Arc::new(dial),
        })
    }

    /// Require several log matches. No effect on other probes.
    #[must_use]
    pub fn with_occurrences(mut self, n: usize) -> Self {
        if let ProbeKind::LogMatches { occurrences, .. } = &mut self.kind {
            *occurrences = n;
        }
        self
    }

    /// Accept other HTTP statuses. No effect on other probes.
    #[must_use]
    pub fn with_status(mut self, matcher: StatusMatcher) -> Self {
        if let ProbeKind::Http { status, .. } = &mut self.kind {
            *status = matcher;
        }
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set a startup timeout for this probe only.
    #[must_use]
    pub const fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ProbeKind::PortOpen(port) => write!(f, "port {port}"),
            ProbeKind::LogMatches {
                pattern,
                occurrences,
            } => write!(f, "log /{pattern}/ x{occurrences}"),
            ProbeKind::Http { path, port, .. } => write!(f, "http GET {path} on {port}"),
            ProbeKind::Connection { port, label, .. } => write!(f, "{label} on {port}"),
        }
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("probe", &self.to_string())
            .field("poll_interval", &self.poll_interval)
            .field("startup_timeout", &self.startup_timeout)
            .finish()
    }
}

/// All-of composition of probes.
#[derive(Debug, Clone)]
pub struct WaitStrategy {
    probes: Vec<Probe>,
    startup_timeout: Duration,
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self {
            probes: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }
}

impl WaitStrategy {
    /// A strategy with no probes: ready as soon as the container started.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Ready once every probe succeeded.
    #[must_use]
    pub fn for_all(probes: impl IntoIterator<Item = Probe>) -> Self {
        Self {
            probes: probes.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Add a probe.
    #[must_use]
    pub fn and(mut self, probe: Probe) -> Self {
        self.probes.push(probe);
        self
    }

    /// Set the timeout for probes that do not set their own.
    #[must_use]
    pub const fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// The probes.
    #[must_use]
    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    /// The default startup timeout.
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    /// Whether there is nothing to wait for.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

impl From<Probe> for WaitStrategy {
    fn from(probe: Probe) -> Self {
        Self::for_all([probe])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_descriptions() {
        assert_eq!(Probe::port(5432).to_string(), "port 5432/tcp");
        assert_eq!(
            Probe::log("ready").unwrap().with_occurrences(2).to_string(),
            "log /ready/ x2"
        );
        assert_eq!(Probe::http("/health", 8080).to_string(), "http GET /health on 8080/tcp");
    }

    #[test]
    fn invalid_log_pattern() {
        assert!(matches!(
            Probe::log("(unclosed"),
            Err(EphemeraError::InvalidSpec { .. })
        ));
    }

    #[test]
    fn status_matchers() {
        assert!(StatusMatcher::default().matches(200));
        assert!(!StatusMatcher::default().matches(204));
        let ok = StatusMatcher::new(|s| (200..300).contains(&s));
        assert!(ok.matches(204));
        assert!(!ok.matches(503));
    }

    #[test]
    fn builders_only_touch_their_kind() {
        let probe = Probe::port(80).with_occurrences(3);
        assert!(matches!(probe.kind, ProbeKind::PortOpen(_)));

        let strategy = WaitStrategy::for_all([Probe::port(80)])
            .and(Probe::http("/", 80))
            .with_startup_timeout(Duration::from_secs(5));
        assert_eq!(strategy.probes().len(), 2);
        assert_eq!(strategy.startup_timeout(), Duration::from_secs(5));
        assert!(WaitStrategy::none().is_empty());
    }
}
