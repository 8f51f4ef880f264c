pub mod agent;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod shutdown;
pub mod tasks;

pub use agent::Agent;
pub use config::{AgentConfig, ControllerConfig, TransportConfig};
pub use error::{AgentError, Result};
