use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

use crate::controller::FrameSink;
use crate::error::{AgentError, Result};
use crate::protocol::WireMessage;

struct ActiveLink {
    sink: FrameSink,
    /// Cancelled when a write on this connection fails.
    closed: CancellationToken,
}

/// Serialized write access to the current WebSocket, shared by the read loop,
/// the heartbeat scheduler and the result reporter.
///
/// A failed or stalled write detaches the sink and cancels that connection's
/// token, which the read loop of the same connection observes. A newer
/// connection has its own token and is unaffected.
#[derive(Clone)]
pub struct Link {
    inner: Arc<Mutex<Option<ActiveLink>>>,
    write_timeout: Duration,
}

impl Default for Link {
    fn default() -> Self {
        Self::with_write_timeout(DEFAULT_WRITE_TIMEOUT)
    }
}

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
            write_timeout,
        }
    }

    /// Install the write half of a fresh connection, replacing any previous one.
    pub(crate) async fn attach(&self, sink: FrameSink, closed: CancellationToken) {
        let previous = self.inner.lock().await.replace(ActiveLink { sink, closed });
        if let Some(mut old) = previous {
            old.closed.cancel();
            let _ = old.sink.close().await;
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    pub async fn send(&self, message: &WireMessage) -> Result<()> {
        self.send_frame(Message::text(message.to_text()?)).await
    }

    pub(crate) async fn send_frame(&self, frame: Message) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let active = guard.as_mut().ok_or(AgentError::NotConnected)?;

        let err = match tokio::time::timeout(self.write_timeout, active.sink.send(frame)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => AgentError::from(e),
            Err(_) => AgentError::Transport(format!(
                "write did not complete within {:?}",
                self.write_timeout
            )),
        };

        tracing::warn!(error = %err, "Write to controller failed, dropping connection");
        active.closed.cancel();
        *guard = None;
        Err(err)
    }

    /// Drop the current sink, sending a close frame on a best-effort basis.
    pub(crate) async fn close(&self) {
        let active = self.inner.lock().await.take();
        if let Some(mut active) = active {
            if let Err(e) = active.sink.close().await {
                tracing::debug!(error = %e, "Error closing WebSocket");
            }
        }
    }
}
