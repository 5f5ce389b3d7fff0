//! # Ephemera
//!
//! Disposable, self-cleaning containers for integration tests.
//!
//! ## Features
//!
//! - **Lifecycle**: start a container from a [`ContainerSpec`], wait until it
//!   is ready, stop it; failed starts roll back everything they created
//! - **Readiness**: port, log, HTTP and custom connection probes with
//!   per-probe deadlines and cancellation
//! - **Networks**: per-session networks with unique aliases
//! - **Snapshots**: named copies of a service's data directory
//! - **Reaper**: an out-of-process daemon that removes whatever a crashed
//!   test run left behind, found by label
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ephemera::{ContainerSpec, LifecycleCoordinator, Probe, Session};
//! use ephemera::runtime::MemoryRuntime;
//! use ephemera_common::Settings;
//!
//! # async fn example() -> ephemera_common::EphemeraResult<()> {
//! let settings = Settings::from_env()?;
//! let session = Session::new(Arc::new(MemoryRuntime::new()), settings);
//! let coordinator = LifecycleCoordinator::new(Arc::new(session));
//!
//! let spec = ContainerSpec::new("postgres:16")
//!     .with_exposed_port(5432)
//!     .with_env("POSTGRES_PASSWORD", "secret")
//!     .waiting_for(Probe::log("ready to accept connections")?.with_occurrences(2));
//! let postgres = coordinator.start(&spec).await?;
//! let addr = coordinator.endpoint(&postgres, 5432)?;
//! # let _ = addr;
//!
//! coordinator.terminate().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod lifecycle;
pub mod network;
pub mod reaper;
pub mod runtime;
pub mod session;
pub mod snapshot;
pub mod spec;
pub mod wait;

pub use ephemera_common::{
    EphemeraError, EphemeraResult, ResourceHandle, ResourceId, ResourceKind, SessionId, Settings,
};
pub use lifecycle::LifecycleCoordinator;
pub use network::NetworkFabric;
pub use runtime::RuntimeClient;
pub use session::{Session, SessionRegistry};
pub use snapshot::{DirectoryCopy, SnapshotManager, SnapshotRecord, SnapshotStrategy};
pub use spec::{ContainerFile, ContainerPort, ContainerSpec, Mount, Protocol};
pub use wait::{Probe, StatusMatcher, WaitContext, WaitEvaluator, WaitStrategy};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install a `tracing` subscriber for test output.
///
/// `RUST_LOG` wins when set; otherwise `ephemera` logs at `info`, or `debug`
/// when [`Settings::verbose`] is on. Does nothing if a subscriber is already
/// installed.
pub fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(settings)));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_test_writer())
        .with(filter)
        .try_init();
}

const fn default_directive(settings: &Settings) -> &'static str {
    if settings.verbose {
        "ephemera=debug"
    } else {
        "ephemera=info"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_switches_to_debug() {
        let settings = Settings::from_vars([("EPHEMERA_VERBOSE", "1")]).unwrap();
        assert_eq!(default_directive(&settings), "ephemera=debug");
        assert_eq!(default_directive(&Settings::default()), "ephemera=info");
    }

    #[test]
    fn init_tracing_twice_is_harmless() {
        let settings = Settings::default();
        init_tracing(&settings);
        init_tracing(&settings.with_reaper_disabled(true));
        tracing::info!("still logging");
    }
}
