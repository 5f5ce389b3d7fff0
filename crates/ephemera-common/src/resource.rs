//! Handles to runtime resources owned by a session.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ResourceId, SessionId};

/// The type of resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A container.
    Container,
    /// A virtual network.
    Network,
    /// A named volume.
    Volume,
}

impl ResourceKind {
    /// All kinds, in the order teardown removes them.
    pub const TEARDOWN_ORDER: [Self; 3] = [Self::Container, Self::Network, Self::Volume];

    /// Get the kind as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Network => "network",
            Self::Volume => "volume",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-owning reference to a resource registered with a session.
///
/// The session registry owns the authoritative copy; callers hold clones and
/// pass them back to request operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Runtime identifier.
    pub id: ResourceId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Owning session.
    pub session_id: SessionId,
    /// Labels the resource was created with.
    pub labels: BTreeMap<String, String>,
    /// When the harness created it.
    pub created_at: DateTime<Utc>,
}

impl ResourceHandle {
    /// Create a handle stamped with the current time.
    #[must_use]
    pub fn new(
        id: impl Into<ResourceId>,
        kind: ResourceKind,
        session_id: SessionId,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            session_id,
            labels,
            created_at: Utc::now(),
        }
    }

    /// Whether this is a container handle.
    #[must_use]
    pub fn is_container(&self) -> bool {
        self.kind == ResourceKind::Container
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id.short())
    }
}
