//! Polling probes until ready, timed out or cancelled.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use ephemera_common::{EphemeraError, EphemeraResult};
use futures::{FutureExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::log::LogScanner;
use super::{Probe, ProbeKind, ProbePoll, WaitStrategy};
use crate::runtime::LogStream;
use crate::spec::ContainerPort;

const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// What probes look at: published endpoints and the output stream.
#[async_trait]
pub trait ProbeTarget: Send + Sync {
    /// Host address of a published container port, if mapped.
    fn endpoint(&self, port: ContainerPort) -> Option<SocketAddr>;

    /// Follow the container output from the beginning.
    async fn logs(&self) -> EphemeraResult<LogStream>;
}

/// Deadline and cancellation shared by every probe of one wait.
#[derive(Debug, Clone, Default)]
pub struct WaitContext {
    /// Hard deadline on top of the per-probe startup timeouts.
    pub deadline: Option<Instant>,
    /// Cancels the wait.
    pub cancel: CancellationToken,
}

impl WaitContext {
    /// A context with no deadline and a fresh token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Use an existing cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Drives a [`WaitStrategy`] against a [`ProbeTarget`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitEvaluator;

impl WaitEvaluator {
    /// Block until every probe has succeeded once.
    ///
    /// # Errors
    ///
    /// - [`EphemeraError::Timeout`] when a probe is still pending at its deadline
    /// - [`EphemeraError::Cancelled`] when the context is cancelled
    /// - [`EphemeraError::ProbeFailed`] when a probe errored
    pub async fn wait(
        ctx: &WaitContext,
        strategy: &WaitStrategy,
        target: &dyn ProbeTarget,
    ) -> EphemeraResult<()> {
        let started = Instant::now();
        let runs = strategy.probes().iter().map(|probe| {
            let timeout = probe.startup_timeout.unwrap_or(strategy.startup_timeout());
            let mut deadline = started + timeout;
            if let Some(hard) = ctx.deadline {
                deadline = deadline.min(hard);
            }
            run_probe(probe, deadline, &ctx.cancel, target)
        });
        futures::future::try_join_all(runs).await?;
        Ok(())
    }
}

async fn run_probe(
    probe: &Probe,
    deadline: Instant,
    cancel: &CancellationToken,
    target: &dyn ProbeTarget,
) -> EphemeraResult<()> {
    let mut state = ProbeState::new(probe);
    let mut last = "not polled yet".to_string();
    let cancelled = || EphemeraError::Cancelled {
        probe: probe.to_string(),
    };

    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(cancelled()),
            outcome = tokio::time::timeout_at(deadline, state.poll(target)) => outcome,
        };
        match outcome {
            Ok(ProbePoll::Ready) => {
                tracing::debug!(probe = %probe, "Probe ready");
                return Ok(());
            }
            Ok(ProbePoll::Failed(message)) => {
                tracing::debug!(probe = %probe, %message, "Probe failed");
                return Err(EphemeraError::ProbeFailed {
                    probe: probe.to_string(),
                    message,
                });
            }
            Ok(ProbePoll::Pending(diagnostic)) => {
                tracing::trace!(probe = %probe, %diagnostic, "Probe pending");
                last = diagnostic;
            }
            // The poll itself ran into the deadline.
            Err(_) => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(EphemeraError::Timeout {
                probe: probe.to_string(),
                last,
            });
        }
        let next = (now + probe.poll_interval).min(deadline);
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(cancelled()),
            () = tokio::time::sleep_until(next) => {}
        }
    }
}

/// Per-probe state kept between polls.
enum ProbeState<'a> {
    Port(ContainerPort),
    Log {
        scanner: LogScanner,
        occurrences: usize,
        stream: Option<LogStream>,
    },
    Http {
        probe: &'a Probe,
        client: Option<reqwest::Client>,
    },
    Connection(&'a Probe),
}

impl<'a> ProbeState<'a> {
    fn new(probe: &'a Probe) -> Self {
        match &probe.kind {
            ProbeKind::PortOpen(port) => Self::Port(*port),
            ProbeKind::LogMatches {
                pattern,
                occurrences,
            } => Self::Log {
                scanner: LogScanner::new(pattern.clone()),
                occurrences: *occurrences,
                stream: None,
            },
            ProbeKind::Http { .. } => Self::Http {
                probe,
                client: None,
            },
            ProbeKind::Connection { .. } => Self::Connection(probe),
        }
    }

    async fn poll(&mut self, target: &dyn ProbeTarget) -> ProbePoll {
        match self {
            Self::Port(port) => poll_port(*port, target).await,
            Self::Log {
                scanner,
                occurrences,
                stream,
            } => poll_log(scanner, *occurrences, stream, target).await,
            Self::Http { probe, client } => poll_http(probe, client, target).await,
            Self::Connection(probe) => {
                let ProbeKind::Connection { port, dial, .. } = &probe.kind else {
                    return ProbePoll::Failed("probe kind changed".to_string());
                };
                match target.endpoint(*port) {
                    Some(addr) => dial(addr).await,
                    None => ProbePoll::Pending(format!("port {port} is not mapped yet")),
                }
            }
        }
    }
}

async fn poll_port(port: ContainerPort, target: &dyn ProbeTarget) -> ProbePoll {
    let Some(addr) = target.endpoint(port) else {
        return ProbePoll::Pending(format!("port {port} is not mapped yet"));
    };
    match TcpStream::connect(addr).await {
        Ok(_) => ProbePoll::Ready,
        Err(e) => ProbePoll::Pending(format!("{addr}: {e}")),
    }
}

async fn poll_log(
    scanner: &mut LogScanner,
    occurrences: usize,
    stream: &mut Option<LogStream>,
    target: &dyn ProbeTarget,
) -> ProbePoll {
    if stream.is_none() {
        match target.logs().await {
            Ok(s) => *stream = Some(s),
            Err(e) if e.is_not_found() => return ProbePoll::Failed(e.to_string()),
            Err(e) => return ProbePoll::Pending(format!("logs unavailable: {e}")),
        }
    }
    let Some(logs) = stream.as_mut() else {
        return ProbePoll::Pending("logs unavailable".to_string());
    };

    let mut ended = false;
    // Drain what is buffered without blocking the poll.
    while let Some(next) = logs.next().now_or_never() {
        match next {
            Some(Ok(chunk)) => scanner.feed(&chunk),
            Some(Err(e)) => return ProbePoll::Failed(format!("log stream broke: {e}")),
            None => {
                scanner.finish();
                ended = true;
                break;
            }
        }
        if scanner.matches() >= occurrences {
            return ProbePoll::Ready;
        }
    }

    let seen = scanner.matches();
    if seen >= occurrences {
        ProbePoll::Ready
    } else if ended {
        ProbePoll::Failed(format!(
            "output ended after {seen}/{occurrences} occurrences"
        ))
    } else {
        ProbePoll::Pending(format!("{seen}/{occurrences} occurrences"))
    }
}

async fn poll_http(
    probe: &Probe,
    client: &mut Option<reqwest::Client>,
    target: &dyn ProbeTarget,
) -> ProbePoll {
    let ProbeKind::Http { path, port, status } = &probe.kind else {
        return ProbePoll::Failed("probe kind changed".to_string());
    };
    let Some(addr) = target.endpoint(*port) else {
        return ProbePoll::Pending(format!("port {port} is not mapped yet"));
    };
    if client.is_none() {
        match reqwest::Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
        {
            Ok(c) => *client = Some(c),
            Err(e) => return ProbePoll::Failed(format!("http client: {e}")),
        }
    }
    let Some(client) = client.as_ref() else {
        return ProbePoll::Failed("http client unavailable".to_string());
    };

    let path = if path.starts_with('/') {
        path.clone()
    } else {
        format!("/{path}")
    };
    let url = format!("http://{addr}{path}");
    match client.get(&url).send().await {
        Ok(response) => {
            let code = response.status().as_u16();
            if status.matches(code) {
                ProbePoll::Ready
            } else {
                ProbePoll::Pending(format!("{url} returned {code}"))
            }
        }
        Err(e) if e.is_builder() || e.is_decode() || is_malformed(&e) => {
            ProbePoll::Failed(format!("{url}: {}", error_chain(&e)))
        }
        Err(e) => ProbePoll::Pending(format!("{url}: {}", error_chain(&e))),
    }
}

/// The server answered, but not with HTTP.
fn is_malformed(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if cause
            .downcast_ref::<hyper::Error>()
            .is_some_and(hyper::Error::is_parse)
        {
            return true;
        }
        source = cause.source();
    }
    false
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::{Probe, StatusMatcher};
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    /// Ports come from a map; logs from a channel fed by the test.
    #[derive(Default)]
    struct FakeTarget {
        ports: HashMap<ContainerPort, SocketAddr>,
        logs: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<EphemeraResult<Bytes>>>>,
    }

    impl FakeTarget {
        fn with_logs() -> (Self, mpsc::UnboundedSender<EphemeraResult<Bytes>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let target = Self {
                logs: parking_lot::Mutex::new(Some(rx)),
                ..Self::default()
            };
            (target, tx)
        }
    }

    #[async_trait]
    impl ProbeTarget for FakeTarget {
        fn endpoint(&self, port: ContainerPort) -> Option<SocketAddr> {
            self.ports.get(&port).copied()
        }

        async fn logs(&self) -> EphemeraResult<LogStream> {
            let rx = self.logs.lock().take().ok_or_else(|| EphemeraError::runtime("logs", "already taken"))?;
            Ok(UnboundedReceiverStream::new(rx).boxed())
        }
    }

    fn log_probe(pattern: &str, n: usize) -> Probe {
        Probe::log(pattern).unwrap().with_occurrences(n)
    }

    #[tokio::test(start_paused = true)]
    async fn log_probe_waits_for_every_occurrence() {
        let (target, tx) = FakeTarget::with_logs();
        let strategy = WaitStrategy::from(log_probe("ready", 2));
        tokio::spawn(async move {
            tx.send(Ok(Bytes::from("ready\n"))).unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            tx.send(Ok(Bytes::from("still starting\nre"))).unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(Ok(Bytes::from("ady\n"))).unwrap();
            // Keep the stream open.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(tx);
        });

        let started = Instant::now();
        WaitEvaluator::wait(&WaitContext::new(), &strategy, &target)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_times_out_with_last_diagnostic() {
        let (target, _tx) = FakeTarget::with_logs();
        let strategy = WaitStrategy::from(log_probe("ready", 1))
            .with_startup_timeout(Duration::from_secs(2));
        let err = WaitEvaluator::wait(&WaitContext::new(), &strategy, &target)
            .await
            .unwrap_err();
        match err {
            EphemeraError::Timeout { probe, last } => {
                assert_eq!(probe, "log /ready/ x1");
                assert_eq!(last, "0/1 occurrences");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_times_out_immediately() {
        let (target, _tx) = FakeTarget::with_logs();
        let strategy = WaitStrategy::from(log_probe("ready", 1)).with_startup_timeout(Duration::ZERO);
        let err = WaitEvaluator::wait(&WaitContext::new(), &strategy, &target)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_output_without_match_is_a_probe_failure() {
        let (target, tx) = FakeTarget::with_logs();
        tx.send(Ok(Bytes::from("fatal: no config\n"))).unwrap();
        drop(tx);
        let err = WaitEvaluator::wait(&WaitContext::new(), &WaitStrategy::from(log_probe("ready", 1)), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, EphemeraError::ProbeFailed { .. }), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_distinct_from_timeout() {
        let (target, _tx) = FakeTarget::with_logs();
        let cancel = CancellationToken::new();
        let ctx = WaitContext::new().with_cancel(cancel.clone());
        let strategy = WaitStrategy::from(log_probe("ready", 1).with_poll_interval(Duration::from_secs(1)));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            cancel.cancel();
        });
        let started = Instant::now();
        let err = WaitEvaluator::wait(&ctx, &strategy, &target).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(!err.is_timeout());
        // Stopped mid-interval, not at the next poll.
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn context_deadline_caps_probe_timeouts() {
        let (target, _tx) = FakeTarget::with_logs();
        let ctx = WaitContext::new().with_deadline(Instant::now() + Duration::from_secs(1));
        let started = Instant::now();
        let err = WaitEvaluator::wait(&ctx, &WaitStrategy::from(log_probe("ready", 1)), &target)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn composite_needs_every_probe_and_latches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        // Ready from the second poll on; only ever polled until then.
        let flaky = Probe::connection(5432, "sql", move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n >= 1 {
                    ProbePoll::Ready
                } else {
                    ProbePoll::Pending("connection refused".to_string())
                }
            }
            .boxed()
        });
        let (mut target, tx) = FakeTarget::with_logs();
        target
            .ports
            .insert(ContainerPort::tcp(5432), "127.0.0.1:1".parse().unwrap());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            tx.send(Ok(Bytes::from("ready\n"))).unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let strategy = WaitStrategy::for_all([flaky, log_probe("ready", 1)]);
        let started = Instant::now();
        WaitEvaluator::wait(&WaitContext::new(), &strategy, &target)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_probe_is_not_a_timeout() {
        let broken = Probe::connection(5432, "sql", |_| {
            async { ProbePoll::Failed("authentication failed".to_string()) }.boxed()
        });
        let mut target = FakeTarget::default();
        target
            .ports
            .insert(ContainerPort::tcp(5432), "127.0.0.1:1".parse().unwrap());
        let err = WaitEvaluator::wait(&WaitContext::new(), &WaitStrategy::from(broken), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, EphemeraError::ProbeFailed { ref message, .. } if message == "authentication failed"));
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn port_probe_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut target = FakeTarget::default();
        target
            .ports
            .insert(ContainerPort::tcp(6379), listener.local_addr().unwrap());
        WaitEvaluator::wait(&WaitContext::new(), &WaitStrategy::from(Probe::port(6379)), &target)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unmapped_port_stays_pending() {
        let target = FakeTarget::default();
        let strategy = WaitStrategy::from(Probe::port(6379)).with_startup_timeout(Duration::from_millis(300));
        let err = WaitEvaluator::wait(&WaitContext::new(), &strategy, &target)
            .await
            .unwrap_err();
        assert!(matches!(err, EphemeraError::Timeout { ref last, .. } if last.contains("not mapped")));
    }

    async fn http_server(responses: Vec<&'static str>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut served = 0;
            while let Ok((mut stream, _)) = listener.accept().await {
                let response = responses[served.min(responses.len() - 1)];
                served += 1;
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn http_probe_waits_for_accepted_status() {
        let addr = http_server(vec![
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            "HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n",
        ])
        .await;
        let mut target = FakeTarget::default();
        target.ports.insert(ContainerPort::tcp(80), addr);
        let probe = Probe::http("health", 80)
            .with_status(StatusMatcher::new(|s| s == 204))
            .with_poll_interval(Duration::from_millis(20));
        WaitEvaluator::wait(&WaitContext::new(), &WaitStrategy::from(probe), &target)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn http_probe_rejects_non_http_answers() {
        let addr = http_server(vec!["SSH-2.0-OpenSSH_9.6\r\n\r\n"]).await;
        let mut target = FakeTarget::default();
        target.ports.insert(ContainerPort::tcp(80), addr);
        let err = WaitEvaluator::wait(
            &WaitContext::new(),
            &WaitStrategy::from(Probe::http("/", 80)),
            &target,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EphemeraError::ProbeFailed { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn only_parse_errors_count_as_malformed() {
        let garbage = http_server(vec!["220 smtp.example.com ESMTP\r\n"]).await;
        let err = reqwest::get(format!("http://{garbage}/")).await.unwrap_err();
        assert!(is_malformed(&err), "{}", error_chain(&err));

        let refused = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let err = reqwest::get(format!("http://{refused}/")).await.unwrap_err();
        assert!(!is_malformed(&err), "{}", error_chain(&err));
    }
}
