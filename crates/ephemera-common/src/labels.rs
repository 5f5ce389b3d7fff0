//! Reserved label layout.
//!
//! Labels are the only state the harness persists in the runtime. Every
//! container, network and volume a session creates carries [`SESSION_ID`], and
//! when a reaper is in use also [`REAPER_INSTANCE`] and [`REAPER_ENDPOINT`] so
//! a later reaper can tell whether the owner of an orphan is still alive.

use std::collections::{BTreeMap, HashMap};

use crate::id::SessionId;

/// Prefix reserved for harness labels.
pub const PREFIX: &str = "org.ephemera.";

/// Session that owns the resource.
pub const SESSION_ID: &str = "org.ephemera.session-id";

/// Instance id of the reaper that was watching the session.
pub const REAPER_INSTANCE: &str = "org.ephemera.reaper-instance";

/// Address of the reaper that was watching the session.
pub const REAPER_ENDPOINT: &str = "org.ephemera.reaper-endpoint";

/// Harness version that created the resource.
pub const VERSION: &str = "org.ephemera.version";

/// Whether a label key lives under the reserved prefix.
#[must_use]
pub fn is_reserved(key: &str) -> bool {
    key.starts_with(PREFIX)
}

/// Base labels for a session, without reaper information.
#[must_use]
pub fn session_labels(session_id: &SessionId) -> BTreeMap<String, String> {
    BTreeMap::from([
        (SESSION_ID.to_string(), session_id.to_string()),
        (VERSION.to_string(), env!("CARGO_PKG_VERSION").to_string()),
    ])
}

/// Read the owning session from a label set.
#[must_use]
pub fn owner(labels: &HashMap<String, String>) -> Option<SessionId> {
    labels.get(SESSION_ID).and_then(|v| v.parse().ok())
}
