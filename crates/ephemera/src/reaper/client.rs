//! Session side of the reaper channel.

use std::net::SocketAddr;
use std::time::Duration;

use ephemera_common::{EphemeraError, EphemeraResult, SessionId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use super::protocol::{self, ClientMessage, ReaperMessage};

fn reaper_error(message: impl Into<String>) -> EphemeraError {
    EphemeraError::Reaper {
        message: message.into(),
    }
}

/// A line-oriented connection to a reaper.
struct Channel {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Channel {
    async fn open(addr: SocketAddr) -> EphemeraResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| EphemeraError::ReaperUnreachable {
                endpoint: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read).lines(),
            writer,
        })
    }

    async fn send(&mut self, message: &ClientMessage) -> EphemeraResult<()> {
        self.writer
            .write_all(protocol::encode(message)?.as_bytes())
            .await?;
        Ok(())
    }

    async fn recv(&mut self) -> EphemeraResult<ReaperMessage> {
        let line = self
            .reader
            .next_line()
            .await?
            .ok_or_else(|| reaper_error("reaper closed the connection"))?;
        match protocol::decode(&line)? {
            ReaperMessage::Error { message } => Err(reaper_error(message)),
            other => Ok(other),
        }
    }
}

/// The liveness channel of one session.
///
/// Holding the connection keeps the session's resources alive; when the
/// process dies the operating system closes the socket and the reaper sweeps.
pub struct ReaperConnection {
    instance: String,
    endpoint: SocketAddr,
    channel: Mutex<Option<Channel>>,
}

impl std::fmt::Debug for ReaperConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaperConnection")
            .field("instance", &self.instance)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl ReaperConnection {
    /// Connect and register `session_id`, all within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`EphemeraError::ReaperUnreachable`] if nothing accepts the
    /// connection, and [`EphemeraError::Reaper`] if the reaper does not
    /// acknowledge in time or rejects the registration.
    pub async fn connect(
        addr: SocketAddr,
        session_id: &SessionId,
        timeout: Duration,
    ) -> EphemeraResult<Self> {
        Self::connect_with_grace(addr, session_id, timeout, None).await
    }

    /// Like [`connect`](Self::connect), asking the reaper to wait `grace`
    /// for a reconnect after the connection drops instead of its default.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn connect_with_grace(
        addr: SocketAddr,
        session_id: &SessionId,
        timeout: Duration,
        grace: Option<Duration>,
    ) -> EphemeraResult<Self> {
        let grace_ms = grace.map(|g| u64::try_from(g.as_millis()).unwrap_or(u64::MAX));
        let handshake = async {
            let mut channel = Channel::open(addr).await?;
            channel
                .send(&ClientMessage::Register {
                    session_id: session_id.clone(),
                    grace_ms,
                })
                .await?;
            match channel.recv().await? {
                ReaperMessage::Ack { instance } => Ok((channel, instance)),
                other => Err(reaper_error(format!("unexpected reply to register: {other:?}"))),
            }
        };
        let (channel, instance) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| reaper_error(format!("no answer from reaper at {addr} within {timeout:?}")))??;

        tracing::info!(session = %session_id.short(), reaper = %addr, %instance, "Connected to reaper");
        Ok(Self {
            instance,
            endpoint: addr,
            channel: Mutex::new(Some(channel)),
        })
    }

    /// Instance id of the reaper.
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Address of the reaper.
    #[must_use]
    pub const fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// End the session: ask for an immediate sweep and wait for it.
    ///
    /// Returns the number of resources the reaper removed. Calling it again
    /// after the channel is closed returns `0`.
    ///
    /// # Errors
    ///
    /// Returns [`EphemeraError::Reaper`] if the reaper does not confirm the
    /// sweep within `timeout`.
    pub async fn close(&self, timeout: Duration) -> EphemeraResult<usize> {
        let mut guard = self.channel.lock().await;
        let Some(mut channel) = guard.take() else {
            return Ok(0);
        };
        let exchange = async {
            channel.send(&ClientMessage::End).await?;
            match channel.recv().await? {
                ReaperMessage::Swept { removed } => Ok(removed),
                other => Err(reaper_error(format!("unexpected reply to end: {other:?}"))),
            }
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| reaper_error(format!("reaper did not confirm the sweep within {timeout:?}")))?
    }

    /// Whether the channel is still held.
    pub async fn is_open(&self) -> bool {
        self.channel.lock().await.is_some()
    }
}

/// Ask the reaper at `addr` about a session.
///
/// Returns the reaper's instance id and whether the session is connected to it.
///
/// # Errors
///
/// Returns [`EphemeraError::Reaper`] if the reaper cannot be asked.
pub async fn query(
    addr: SocketAddr,
    session_id: &SessionId,
    timeout: Duration,
) -> EphemeraResult<(String, bool)> {
    let exchange = async {
        let mut channel = Channel::open(addr).await?;
        channel
            .send(&ClientMessage::Query {
                session_id: session_id.clone(),
            })
            .await?;
        match channel.recv().await? {
            ReaperMessage::Status {
                instance,
                connected,
            } => Ok((instance, connected)),
            other => Err(reaper_error(format!("unexpected reply to query: {other:?}"))),
        }
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| reaper_error(format!("no answer from reaper at {addr} within {timeout:?}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn unreachable_reaper_is_reported_as_such() {
        // Bind then drop to get a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let err = ReaperConnection::connect(addr, &SessionId::generate(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EphemeraError::ReaperUnreachable { .. }), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_reaper_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let err = ReaperConnection::connect(addr, &SessionId::generate(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no answer"), "{err}");
    }
}
