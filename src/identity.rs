//! Agent identity: who this agent claims to be when it registers.
//!
//! The id is stable across restarts. It is taken from configuration when set,
//! otherwise read from the identity file, otherwise generated from the host
//! name and persisted there.

use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};

use crate::config::AgentConfig;
use crate::error::Result;

/// Version announced to the controller and sent as part of the User-Agent.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const IDENTITY_DIR: &str = ".remote-agent";
const IDENTITY_FILE: &str = "agent_id";

#[derive(Debug)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub hostname: String,
    pub platform: String,
    pub arch: String,
    pub version: String,
    pub capabilities: Vec<String>,
    /// Callback address announced at registration, if any
    pub callback_url: Option<String>,
    token: SecretString,
}

impl AgentIdentity {
    pub fn new(agent_id: impl Into<String>, capabilities: Vec<String>, token: &str) -> Self {
        Self {
            agent_id: agent_id.into(),
            hostname: hostname(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: AGENT_VERSION.to_string(),
            capabilities,
            callback_url: None,
            token: SecretString::from(token.to_owned()),
        }
    }

    /// Build the identity for this process from configuration, touching the
    /// identity file only when no id was configured.
    pub fn resolve(config: &AgentConfig) -> Result<Self> {
        let agent_id = match &config.agent_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                let path = config
                    .identity_file
                    .clone()
                    .unwrap_or_else(default_identity_path);
                load_or_create_agent_id(&path)?
            }
        };

        let mut identity = Self::new(
            agent_id,
            config.capabilities.clone(),
            config.token.expose_secret(),
        );
        identity.callback_url = config
            .callback_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);
        Ok(identity)
    }

    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }

    pub fn user_agent(&self) -> String {
        format!("remote-agent/{}", self.version)
    }
}

/// `~/.remote-agent/agent_id`, or `.agent_id` when there is no home directory.
pub fn default_identity_path() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(IDENTITY_DIR).join(IDENTITY_FILE),
        None => PathBuf::from(".agent_id"),
    }
}

/// Read the persisted agent id, generating and saving a new one if the file is
/// missing or empty.
pub fn load_or_create_agent_id(path: &Path) -> Result<String> {
    if let Ok(contents) = std::fs::read_to_string(path) {
        let id = contents.trim();
        if !id.is_empty() {
            tracing::debug!(path = %path.display(), agent_id = id, "Loaded persisted agent id");
            return Ok(id.to_string());
        }
    }

    let id = generate_agent_id();
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    std::fs::write(path, &id)?;
    tracing::info!(path = %path.display(), agent_id = %id, "Generated new agent id");
    Ok(id)
}

fn generate_agent_id() -> String {
    format!("agent-{}-{}", hostname(), chrono::Utc::now().timestamp())
}

/// Best-effort host name lookup.
pub fn hostname() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}
