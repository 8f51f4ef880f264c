use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;

use crate::protocol::{InboundFrame, WireMessage};
use crate::session::link::Link;
use crate::session::reporter::{Reporter, Route};
use crate::tasks::Dispatcher;

/// Why a read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    Shutdown,
    /// Controller closed the connection cleanly
    Closed,
    /// Read error or abnormal close
    Failed(String),
    /// A write on this connection failed elsewhere
    WriteFailed,
    /// Too many consecutive read timeouts
    Stale,
}

/// Inbound side of the persistent channel.
pub struct PushReader {
    agent_id: String,
    link: Link,
    dispatcher: Dispatcher,
    reporter: Reporter,
    read_timeout: Duration,
    max_missed_reads: u32,
}

impl PushReader {
    pub fn new(
        agent_id: impl Into<String>,
        link: Link,
        dispatcher: Dispatcher,
        reporter: Reporter,
        read_timeout: Duration,
        max_missed_reads: u32,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            link,
            dispatcher,
            reporter,
            read_timeout,
            max_missed_reads,
        }
    }

    /// Read frames until the connection ends or shutdown is requested.
    ///
    /// `closed` is the connection's own token, cancelled by the link when a
    /// write fails.
    pub async fn run<S>(
        &self,
        mut stream: S,
        closed: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Disconnect
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let mut missed: u32 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Disconnect::Shutdown,
                _ = closed.cancelled() => return Disconnect::WriteFailed,
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    missed += 1;
                    if self.max_missed_reads > 0 && missed >= self.max_missed_reads {
                        return Disconnect::Stale;
                    }
                    tracing::trace!(missed, "No frame within read timeout");
                    continue;
                }
                Ok(None) => return Disconnect::Closed,
                Ok(Some(Err(e))) => return Disconnect::Failed(e.to_string()),
                Ok(Some(Ok(message))) => message,
            };
            missed = 0;

            match message {
                Message::Text(text) => self.handle_text(text.as_str()).await,
                Message::Close(frame) => {
                    tracing::debug!(frame = ?frame, "Controller closed WebSocket");
                    return Disconnect::Closed;
                }
                Message::Binary(data) => {
                    tracing::debug!(len = data.len(), "Ignoring binary frame");
                }
                // Protocol-level ping/pong is answered by tungstenite itself.
                _ => {}
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed frame");
                return;
            }
        };

        match frame {
            InboundFrame::Task(task) => {
                tracing::info!(task_id = %task.id, task_type = %task.task_type, "Task received over WebSocket");
                let reporter = self.reporter.clone();
                self.dispatcher.spawn(task, move |outcome| async move {
                    reporter.report(outcome, Route::Push).await;
                });
            }
            InboundFrame::Ping => {
                // Answered before the next frame is read.
                if let Err(e) = self.link.send(&WireMessage::pong(&self.agent_id)).await {
                    tracing::warn!(error = %e, "Failed to answer ping");
                }
            }
            InboundFrame::HeartbeatAck => {
                tracing::trace!("Heartbeat acknowledged");
            }
            InboundFrame::Unknown(kind) => {
                tracing::debug!(kind = %kind, "Ignoring unknown frame type");
            }
        }
    }
}
