use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::controller::ControllerClient;
use crate::error::Result;
use crate::identity::AgentIdentity;
use crate::session::{HeartbeatScheduler, Link, Session, SessionState, TransportFault};
use crate::tasks::{Dispatcher, HandlerRegistry};

/// A remote execution agent.
///
/// Wires the components together:
/// 1. Resolves the agent identity
/// 2. Registers with the controller (fatal on failure)
/// 3. Spawns the heartbeat scheduler
/// 4. Runs the transport session until shutdown
/// 5. Drains in-flight tasks and closes the connection
pub struct Agent {
    config: Arc<AgentConfig>,
    dispatcher: Dispatcher,
    state: SessionState,
    link: Link,
    fault: TransportFault,
}

impl Agent {
    pub fn new(config: AgentConfig, registry: HandlerRegistry) -> Self {
        let link = Link::with_write_timeout(config.transport.request_timeout());
        Self {
            config: Arc::new(config),
            dispatcher: Dispatcher::new(registry),
            state: SessionState::new(),
            link,
            fault: TransportFault::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Connection state, for observers.
    pub fn state(&self) -> SessionState {
        self.state.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run until `shutdown` is cancelled. Returns an error only if the agent
    /// could not start; once registered it keeps going through any transport
    /// failure.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;

        let identity = Arc::new(AgentIdentity::resolve(&self.config)?);
        tracing::info!(
            agent_id = %identity.agent_id,
            hostname = %identity.hostname,
            platform = %identity.platform,
            version = %identity.version,
            controller = %self.config.controller.base_url(),
            task_types = ?self.dispatcher.registry().task_types(),
            "Starting agent"
        );

        let client = ControllerClient::new(
            &self.config.controller,
            identity.clone(),
            self.config.transport.request_timeout(),
        )?;
        client.register().await?;

        let heartbeat = HeartbeatScheduler::new(
            self.config.heartbeat_interval(),
            self.state.clone(),
            self.link.clone(),
            client.clone(),
            self.dispatcher.clone(),
            self.fault.clone(),
        );
        let heartbeat_handle = tokio::spawn(heartbeat.run(shutdown.clone()));

        let session = Session::new(
            self.config.clone(),
            identity,
            client,
            self.state.clone(),
            self.link.clone(),
            self.dispatcher.clone(),
            self.fault.clone(),
        );
        session.run(shutdown.clone()).await;

        if let Err(e) = heartbeat_handle.await {
            tracing::error!(error = %e, "Heartbeat task failed");
        }

        let in_flight = self.dispatcher.in_flight();
        if in_flight > 0 {
            tracing::info!(in_flight, "Waiting for in-flight tasks");
        }
        if !self.dispatcher.drain(self.config.drain_timeout()).await {
            tracing::warn!(
                abandoned = self.dispatcher.in_flight(),
                "Drain timeout elapsed with tasks still running"
            );
        }

        self.link.close().await;
        tracing::info!("Agent stopped");
        Ok(())
    }
}
