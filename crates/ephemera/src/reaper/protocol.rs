//! Reaper wire protocol.
//!
//! One JSON object per line over TCP. A session opens a connection, sends
//! `register`, receives `ack` and then simply holds the connection: the
//! connection closing is the death signal. `end` asks for an immediate sweep
//! and is answered with `swept`. `query` is used between reapers to find out
//! whether a session's original reaper still watches it.

use ephemera_common::{EphemeraError, EphemeraResult, SessionId};
use serde::{Deserialize, Serialize};

/// Messages sent to the reaper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start watching a session over this connection.
    Register {
        /// The session.
        session_id: SessionId,
        /// Reconnection grace in milliseconds, overriding the reaper's.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        grace_ms: Option<u64>,
    },
    /// The session ended normally; sweep now.
    End,
    /// Ask whether a session is connected here.
    Query {
        /// The session.
        session_id: SessionId,
    },
}

/// Messages sent by the reaper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReaperMessage {
    /// Registration accepted.
    Ack {
        /// Instance id of the reaper process.
        instance: String,
    },
    /// Sweep finished.
    Swept {
        /// Number of resources removed.
        removed: usize,
    },
    /// Answer to a query.
    Status {
        /// Instance id of the reaper process.
        instance: String,
        /// Whether the session holds a connection to this reaper.
        connected: bool,
    },
    /// The request could not be served.
    Error {
        /// What went wrong.
        message: String,
    },
}

/// Serialize a message as one line, newline included.
///
/// # Errors
///
/// Returns a serialization error if the message cannot be encoded.
pub fn encode<T: Serialize>(message: &T) -> EphemeraResult<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line.
///
/// # Errors
///
/// Returns a reaper error naming the offending line.
pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> EphemeraResult<T> {
    serde_json::from_str(line.trim()).map_err(|e| EphemeraError::Reaper {
        message: format!("malformed message {line:?}: {e}"),
    })
}
