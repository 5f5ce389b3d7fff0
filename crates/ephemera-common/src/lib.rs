//! # ephemera-common
//!
//! Shared types for the Ephemera test-container harness.
//!
//! This crate is used by both the harness library and the reaper daemon:
//! - Session and resource identifiers
//! - The reserved label layout stamped on every created resource
//! - Resource handles
//! - Settings read from the environment
//! - The error taxonomy

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod id;
pub mod labels;
pub mod resource;

pub use config::Settings;
pub use error::{EphemeraError, EphemeraResult};
pub use id::{ResourceId, SessionId};
pub use resource::{ResourceHandle, ResourceKind};
