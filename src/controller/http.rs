use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response, Url};

use crate::config::ControllerConfig;
use crate::error::{AgentError, Result};
use crate::identity::AgentIdentity;
use crate::protocol::{HeartbeatSnapshot, PendingTasks, Registration, TaskOutcome};

/// HTTP client for the controller's agent API.
///
/// Every request carries the bearer token and the agent User-Agent, and is
/// bounded by the configured request timeout.
#[derive(Debug, Clone)]
pub struct ControllerClient {
    http: Client,
    base_url: Url,
    identity: Arc<AgentIdentity>,
}

impl ControllerClient {
    pub fn new(
        controller: &ControllerConfig,
        identity: Arc<AgentIdentity>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&identity.bearer())
            .map_err(|e| AgentError::Config(format!("invalid controller token: {}", e)))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = Client::builder()
            .timeout(request_timeout)
            .user_agent(identity.user_agent())
            .default_headers(headers)
            .build()?;

        let base_url = Url::parse(&controller.base_url())
            .map_err(|e| AgentError::Config(format!("invalid controller URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AgentError::Config(format!(
                "controller URL {} cannot carry a path",
                base_url
            )));
        }

        Ok(Self {
            http,
            base_url,
            identity,
        })
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    /// `{base}/<segments...>`, each segment percent-encoded on its own so ids
    /// cannot change the route.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn agent_url(&self, rest: &[&str]) -> Url {
        let mut segments = vec!["agents", self.identity.agent_id.as_str()];
        segments.extend_from_slice(rest);
        self.endpoint(&segments)
    }

    /// Announce this agent. Any failure, including a non-2xx answer, is a
    /// registration error.
    pub async fn register(&self) -> Result<()> {
        let url = self.endpoint(&["agents", "register"]);
        let body = Registration::from(self.identity.as_ref());

        let response = self
            .http
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Registration(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::Registration(format!(
                "controller answered {}: {}",
                status,
                detail.trim()
            )));
        }

        tracing::info!(
            agent_id = %self.identity.agent_id,
            url = %url,
            "Registered with controller"
        );
        Ok(())
    }

    pub async fn heartbeat(&self, snapshot: &HeartbeatSnapshot) -> Result<()> {
        let response = self
            .http
            .post(self.agent_url(&["heartbeat"]))
            .json(snapshot)
            .send()
            .await?;
        ensure_success(response, "heartbeat").await
    }

    /// Ask for queued work. A non-2xx answer or an unreachable controller is a
    /// transport failure; the body itself is interpreted leniently.
    pub async fn pending_tasks(&self) -> Result<PendingTasks> {
        let response = self
            .http
            .get(self.agent_url(&["tasks", "pending"]))
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("pending tasks request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Transport(format!(
                "pending tasks request returned {}",
                status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AgentError::Transport(format!("pending tasks body: {}", e)))?;
        Ok(PendingTasks::from_body(&body))
    }

    pub async fn submit_result(&self, outcome: &TaskOutcome) -> Result<()> {
        let response = self
            .http
            .post(self.agent_url(&["tasks", outcome.task_id.as_str(), "result"]))
            .json(&outcome.result_body())
            .send()
            .await?;
        ensure_success(response, "task result").await
    }
}

async fn ensure_success(response: Response, what: &str) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let detail = response.text().await.unwrap_or_default();
    Err(AgentError::Rejected(format!(
        "{} rejected with {}: {}",
        what,
        status,
        detail.trim()
    )))
}
