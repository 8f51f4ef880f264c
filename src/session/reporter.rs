use crate::controller::ControllerClient;
use crate::error::AgentError;
use crate::protocol::{TaskOutcome, WireMessage};
use crate::session::link::Link;

/// Transport a task arrived on. Its outcome goes back the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Push,
    Poll,
}

/// Delivers task outcomes to the controller. One attempt per outcome; a
/// failed delivery is logged and the outcome dropped.
#[derive(Debug, Clone)]
pub struct Reporter {
    link: Link,
    client: ControllerClient,
}

impl Reporter {
    pub fn new(link: Link, client: ControllerClient) -> Self {
        Self { link, client }
    }

    pub async fn report(&self, outcome: TaskOutcome, route: Route) {
        if route == Route::Push {
            match self.send_frame(&outcome).await {
                Ok(()) => {
                    tracing::debug!(task_id = %outcome.task_id, status = %outcome.status, "Result sent over WebSocket");
                    return;
                }
                // Link went away while the task ran; fall back to HTTP.
                Err(AgentError::NotConnected) => {
                    tracing::debug!(task_id = %outcome.task_id, "No WebSocket, reporting result over HTTP");
                }
                Err(e) => {
                    tracing::warn!(task_id = %outcome.task_id, error = %e, "Failed to send task result");
                    return;
                }
            }
        }

        match self.client.submit_result(&outcome).await {
            Ok(()) => {
                tracing::debug!(task_id = %outcome.task_id, status = %outcome.status, "Result posted over HTTP")
            }
            Err(e) => {
                tracing::warn!(task_id = %outcome.task_id, error = %e, "Failed to post task result")
            }
        }
    }

    async fn send_frame(&self, outcome: &TaskOutcome) -> crate::error::Result<()> {
        let frame = WireMessage::task_result(&self.client.identity().agent_id, outcome)?;
        self.link.send(&frame).await
    }
}
