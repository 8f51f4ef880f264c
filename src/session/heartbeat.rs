use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::controller::ControllerClient;
use crate::protocol::{AgentMetrics, DockerInfo, HeartbeatSnapshot, Payload, WireMessage};
use crate::session::link::Link;
use crate::session::poll::TransportFault;
use crate::session::state::{ConnectionState, SessionState, Transition};
use crate::tasks::Dispatcher;

/// Periodic liveness report.
///
/// Sends over the WebSocket while connected and over HTTP while degraded;
/// skips ticks in any other state. Also fires once right after every
/// successful WebSocket handshake.
///
/// An HTTP heartbeat that cannot reach the controller raises the
/// [`TransportFault`] so the poll loop gives up its transport.
pub struct HeartbeatScheduler {
    interval: Duration,
    state: SessionState,
    link: Link,
    client: ControllerClient,
    dispatcher: Dispatcher,
    fault: TransportFault,
    transitions: broadcast::Receiver<Transition>,
}

impl HeartbeatScheduler {
    pub fn new(
        interval: Duration,
        state: SessionState,
        link: Link,
        client: ControllerClient,
        dispatcher: Dispatcher,
        fault: TransportFault,
    ) -> Self {
        // Must exist before the session's first handshake.
        let transitions = state.subscribe();
        Self {
            interval,
            state,
            link,
            client,
            dispatcher,
            fault,
            transitions,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.beat_until(&shutdown).await {
                        break;
                    }
                }
                event = self.transitions.recv() => match event {
                    Ok(t) if t.to == ConnectionState::Connected => {
                        if !self.beat_until(&shutdown).await {
                            break;
                        }
                        ticker.reset();
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }

        tracing::debug!("Heartbeat scheduler stopped");
    }

    /// [`beat`](Self::beat), abandoned when shutdown arrives first. Returns
    /// false on shutdown.
    async fn beat_until(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            _ = self.beat() => true,
        }
    }

    /// Send one heartbeat if the current state allows it. Returns whether a
    /// send was attempted.
    pub async fn beat(&self) -> bool {
        match self.state.current().await {
            ConnectionState::Connected => {
                let snapshot = self.snapshot().await;
                let agent_id = &self.client.identity().agent_id;
                let sent = match WireMessage::heartbeat(agent_id, &snapshot) {
                    Ok(frame) => self.link.send(&frame).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    tracing::warn!(error = %e, "Heartbeat over WebSocket failed");
                }
                true
            }
            ConnectionState::Degraded => {
                let snapshot = self.snapshot().await;
                if let Err(e) = self.client.heartbeat(&snapshot).await {
                    tracing::warn!(error = %e, "Heartbeat over HTTP failed");
                    if e.is_connection_level() {
                        self.fault.raise();
                    }
                }
                true
            }
            state => {
                tracing::trace!(state = %state, "Skipping heartbeat");
                false
            }
        }
    }

    /// Fresh snapshot, collected through the registry on every call. Each
    /// handler gets at most one interval; a slow one leaves its field out.
    pub async fn snapshot(&self) -> HeartbeatSnapshot {
        let metrics = self
            .collect("metrics")
            .await
            .map(|payload| AgentMetrics::from_payload(&payload));
        let docker = self
            .collect("docker_info")
            .await
            .map(|payload| DockerInfo::from_payload(&payload));

        HeartbeatSnapshot::online(self.client.identity(), metrics, docker)
    }

    async fn collect(&self, task_type: &str) -> Option<Payload> {
        let run = self.dispatcher.execute(task_type, Payload::new());
        match tokio::time::timeout(self.interval, run).await {
            Ok(Ok(payload)) => Some(payload),
            Ok(Err(e)) => {
                tracing::debug!(task_type, error = %e, "Heartbeat field unavailable");
                None
            }
            Err(_) => {
                tracing::debug!(task_type, "Heartbeat field timed out");
                None
            }
        }
    }
}
