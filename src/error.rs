use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Not connected to controller")]
    NotConnected,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Identity error: {0}")]
    Identity(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether the error means the active transport itself is gone, as opposed
    /// to a single request being rejected.
    pub fn is_connection_level(&self) -> bool {
        match self {
            AgentError::Transport(_) | AgentError::WebSocket(_) | AgentError::NotConnected => true,
            AgentError::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}


pub type Result<T> = std::result::Result<T, AgentError>;
