use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::{AgentError, Result};

/// Where the controller lives and how to reach it.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Controller host name or IP
    pub host: String,
    /// Controller port (HTTP and WebSocket share it)
    pub port: u16,
    /// Use https:// and wss:// instead of http:// and ws://
    pub tls_enabled: bool,
    /// Path prefix of the controller's agent API, e.g. "/api"
    pub api_prefix: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            tls_enabled: false,
            api_prefix: "/api".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Base URL for HTTP requests, including the API prefix.
    pub fn base_url(&self) -> String {
        let scheme = if self.tls_enabled { "https" } else { "http" };
        format!(
            "{}://{}:{}{}",
            scheme,
            self.host,
            self.port,
            self.api_prefix.trim_end_matches('/')
        )
    }

    /// URL of the persistent WebSocket endpoint.
    pub fn ws_url(&self) -> String {
        let scheme = if self.tls_enabled { "wss" } else { "ws" };
        format!("{}://{}:{}/ws/agents", scheme, self.host, self.port)
    }
}

/// Timing and fallback behaviour of the transport session.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Try the persistent WebSocket first. When false the agent only polls.
    pub use_websocket: bool,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay_ms: u64,
    /// Failed reconnects after an initial failed connect before falling back
    /// to polling (0 = never)
    pub fallback_after_failures: u32,
    /// While degraded, retry the WebSocket this often (None = stay on polling)
    pub upgrade_interval_ms: Option<u64>,
    /// Interval between "pending tasks" requests while degraded
    pub poll_interval_ms: u64,
    /// Upper bound on a single WebSocket read before the loop re-checks state
    pub read_timeout_ms: u64,
    /// Consecutive read timeouts treated as a dead connection (0 = never)
    pub max_missed_reads: u32,
    /// Timeout for every HTTP request to the controller
    pub request_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            use_websocket: true,
            reconnect_delay_ms: 5_000,
            fallback_after_failures: 3,
            upgrade_interval_ms: Some(60_000),
            poll_interval_ms: 5_000,
            read_timeout_ms: 30_000,
            max_missed_reads: 0,
            request_timeout_ms: 15_000,
        }
    }
}

impl TransportConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn upgrade_interval(&self) -> Option<Duration> {
        self.upgrade_interval_ms.map(Duration::from_millis)
    }
}

/// Complete agent configuration, built once at startup and shared read-only.
#[derive(Debug)]
pub struct AgentConfig {
    pub controller: ControllerConfig,
    pub transport: TransportConfig,
    pub heartbeat_interval_ms: u64,
    /// How long shutdown waits for in-flight tasks
    pub drain_timeout_ms: u64,
    /// Explicit agent id. When unset the identity file is consulted.
    pub agent_id: Option<String>,
    /// Override for the persisted identity file location
    pub identity_file: Option<PathBuf>,
    /// Capability tags announced at registration
    pub capabilities: Vec<String>,
    /// Address the controller can reach this agent at, announced at registration
    pub callback_url: Option<String>,
    /// Bearer token sent with every request
    pub token: SecretString,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            transport: TransportConfig::default(),
            heartbeat_interval_ms: 30_000,
            drain_timeout_ms: 10_000,
            agent_id: None,
            identity_file: None,
            capabilities: vec!["docker".to_string(), "compose".to_string()],
            callback_url: None,
            token: SecretString::from(String::new()),
        }
    }
}

impl AgentConfig {
    pub fn new(controller: ControllerConfig, token: impl Into<String>) -> Self {
        Self {
            controller,
            token: SecretString::from(token.into()),
            ..Default::default()
        }
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Reject configurations the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.token.expose_secret().trim().is_empty() {
            return Err(AgentError::Config("controller token is required".to_string()));
        }
        if self.controller.host.is_empty() {
            return Err(AgentError::Config("controller host is required".to_string()));
        }

        let intervals = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("reconnect_delay_ms", self.transport.reconnect_delay_ms),
            ("poll_interval_ms", self.transport.poll_interval_ms),
            ("read_timeout_ms", self.transport.read_timeout_ms),
            ("request_timeout_ms", self.transport.request_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(AgentError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.transport.upgrade_interval_ms == Some(0) {
            return Err(AgentError::Config(
                "upgrade_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
