//! Transport session with the controller.
//!
//! # State Machine
//!
//! ```text
//!   Disconnected --> Connecting --handshake--> Connected
//!        ^               |                        |
//!        |          N+1 failures            clean close -> Connecting
//!        |               v                  error/stale -> Disconnected
//!        +---http fail-- Degraded --upgrade ok--> Connected
//! ```
//!
//! Exactly one transport is active at a time. The session loop is the only
//! writer of [`SessionState`]; the heartbeat scheduler and the reporter read it
//! or go through the shared [`Link`].

pub mod heartbeat;
pub mod link;
pub mod poll;
pub mod push;
pub mod reporter;
pub mod state;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::controller::{self, ControllerClient, PushChannel};
use crate::error::Result;
use crate::identity::AgentIdentity;
use crate::tasks::Dispatcher;

pub use heartbeat::HeartbeatScheduler;
pub use link::Link;
pub use poll::{PollExit, Poller, TransportFault};
pub use push::{Disconnect, PushReader};
pub use reporter::{Reporter, Route};
pub use state::{ConnectionState, SessionState, Transition};

enum Step {
    Connect,
    /// Single WebSocket attempt from the degraded state
    Upgrade,
    Poll,
}

/// Owns the connection lifecycle: connect, read, fall back, reconnect.
pub struct Session {
    config: Arc<AgentConfig>,
    identity: Arc<AgentIdentity>,
    state: SessionState,
    link: Link,
    reader: PushReader,
    poller: Poller,
}

impl Session {
    pub fn new(
        config: Arc<AgentConfig>,
        identity: Arc<AgentIdentity>,
        client: ControllerClient,
        state: SessionState,
        link: Link,
        dispatcher: Dispatcher,
        fault: TransportFault,
    ) -> Self {
        let transport = &config.transport;
        let reporter = Reporter::new(link.clone(), client.clone());
        let reader = PushReader::new(
            identity.agent_id.clone(),
            link.clone(),
            dispatcher.clone(),
            reporter.clone(),
            transport.read_timeout(),
            transport.max_missed_reads,
        );
        let poller = Poller::new(
            client,
            dispatcher,
            reporter,
            transport.poll_interval(),
            fault,
        );

        Self {
            config,
            identity,
            state,
            link,
            reader,
            poller,
        }
    }

    /// Drive the session until `shutdown` is cancelled. The state ends pinned
    /// to `Disconnected`.
    pub async fn run(&self, shutdown: CancellationToken) {
        let transport = &self.config.transport;
        let mut failures: u32 = 0;
        let mut step = if transport.use_websocket {
            Step::Connect
        } else {
            tracing::info!("WebSocket disabled, using HTTP polling");
            Step::Poll
        };

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            step = match step {
                Step::Connect => {
                    self.state.transition(ConnectionState::Connecting).await;
                    let attempt = match self.connect(&shutdown).await {
                        Some(attempt) => attempt,
                        None => break,
                    };

                    match attempt {
                        Ok(channel) => {
                            failures = 0;
                            if !self.attached(channel, &shutdown).await {
                                break;
                            }
                            Step::Connect
                        }
                        Err(e) => {
                            failures += 1;
                            tracing::warn!(attempt = failures, error = %e, "WebSocket connect failed");

                            let threshold = transport.fallback_after_failures;
                            if threshold > 0 && failures > threshold {
                                tracing::warn!(failures, "Falling back to HTTP polling");
                                failures = 0;
                                Step::Poll
                            } else {
                                self.state.transition(ConnectionState::Disconnected).await;
                                if !self.pause(&shutdown).await {
                                    break;
                                }
                                Step::Connect
                            }
                        }
                    }
                }
                Step::Upgrade => match self.connect(&shutdown).await {
                    None => break,
                    Some(Ok(channel)) => {
                        tracing::info!("WebSocket restored, leaving polling mode");
                        if !self.attached(channel, &shutdown).await {
                            break;
                        }
                        Step::Connect
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Upgrade attempt failed, staying on polling");
                        Step::Poll
                    }
                },
                Step::Poll => {
                    self.state.transition(ConnectionState::Degraded).await;
                    let upgrade_after = if transport.use_websocket {
                        transport.upgrade_interval()
                    } else {
                        None
                    };

                    match self.poller.run(&shutdown, upgrade_after).await {
                        PollExit::Shutdown => break,
                        PollExit::Upgrade => Step::Upgrade,
                        PollExit::TransportFailed(e) => {
                            tracing::warn!(error = %e, "Polling failed");
                            self.state.transition(ConnectionState::Disconnected).await;
                            if !self.pause(&shutdown).await {
                                break;
                            }
                            Step::Poll
                        }
                    }
                }
            };
        }

        self.state.terminate().await;
        tracing::info!("Session stopped");
    }

    /// One handshake attempt. `None` when shutdown interrupted it.
    async fn connect(&self, shutdown: &CancellationToken) -> Option<Result<PushChannel>> {
        let url = self.config.controller.ws_url();
        tracing::debug!(url = %url, "Connecting WebSocket");

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            attempt = controller::ws::connect(&url, &self.identity, self.config.transport.request_timeout()) => Some(attempt),
        }
    }

    /// Run one connection to its end and apply the resulting transition.
    /// Returns false if the session should stop.
    async fn attached(&self, channel: PushChannel, shutdown: &CancellationToken) -> bool {
        let closed = shutdown.child_token();
        self.link.attach(channel.sink, closed.clone()).await;
        self.state.transition(ConnectionState::Connected).await;
        tracing::info!(agent_id = %self.identity.agent_id, "WebSocket connected");

        let end = self.reader.run(channel.stream, &closed, shutdown).await;
        match &end {
            // The link stays up so in-flight results can still go out.
            Disconnect::Shutdown => return false,
            Disconnect::Closed => {
                tracing::info!("Controller closed the connection");
                self.link.close().await;
                self.state.transition(ConnectionState::Connecting).await;
            }
            Disconnect::Failed(reason) => {
                tracing::warn!(error = %reason, "WebSocket read failed");
                self.link.close().await;
                self.state.transition(ConnectionState::Disconnected).await;
            }
            Disconnect::WriteFailed => {
                tracing::warn!("WebSocket write failed");
                self.link.close().await;
                self.state.transition(ConnectionState::Disconnected).await;
            }
            Disconnect::Stale => {
                tracing::warn!(
                    missed = self.config.transport.max_missed_reads,
                    "No frames from controller, treating connection as dead"
                );
                self.link.close().await;
                self.state.transition(ConnectionState::Disconnected).await;
            }
        }

        self.pause(shutdown).await
    }

    /// Fixed reconnect delay. Returns false if shutdown arrived first.
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.transport.reconnect_delay()) => true,
        }
    }
}
