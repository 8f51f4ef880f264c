use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use remote_agent::config::{AgentConfig, ControllerConfig, TransportConfig};
use remote_agent::shutdown::install_shutdown_handler;
use remote_agent::tasks::{builtin_handlers, DockerCli};
use remote_agent::Agent;

#[derive(Parser, Debug)]
#[command(name = "remote-agent")]
#[command(version)]
#[command(about = "Remote execution agent for a Docker host")]
struct Args {
    /// Controller host name or IP
    #[arg(long, env = "ARCANE_HOST", default_value = "localhost")]
    host: String,

    /// Controller port
    #[arg(long, env = "ARCANE_PORT", default_value = "3000")]
    port: u16,

    /// Bearer token for the controller
    #[arg(long, env = "ARCANE_TOKEN", hide_env_values = true)]
    token: String,

    /// Use https:// and wss:// when talking to the controller
    #[arg(long, env = "TLS_ENABLED")]
    tls: bool,

    /// Path prefix of the controller API
    #[arg(long, env = "API_PREFIX", default_value = "/api")]
    api_prefix: String,

    /// Try the persistent WebSocket before falling back to HTTP polling
    #[arg(long, env = "USE_WEBSOCKET", default_value = "true", action = clap::ArgAction::Set)]
    use_websocket: bool,

    /// Delay between reconnect attempts in milliseconds
    #[arg(long, env = "RECONNECT_DELAY_MS", default_value = "5000")]
    reconnect_delay_ms: u64,

    /// Failed reconnects before falling back to polling (0 = never)
    #[arg(long, env = "FALLBACK_AFTER_FAILURES", default_value = "3")]
    fallback_after_failures: u32,

    /// While polling, retry the WebSocket this often in milliseconds (0 = never)
    #[arg(long, env = "UPGRADE_INTERVAL_MS", default_value = "60000")]
    upgrade_interval_ms: u64,

    /// Interval between pending task requests while polling, in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "5000")]
    poll_interval_ms: u64,

    /// Heartbeat interval in milliseconds
    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value = "30000")]
    heartbeat_interval_ms: u64,

    /// How long shutdown waits for running tasks, in milliseconds
    #[arg(long, env = "DRAIN_TIMEOUT_MS", default_value = "10000")]
    drain_timeout_ms: u64,

    /// Agent id. When unset it is read from (or generated into) the identity file
    #[arg(long, env = "AGENT_ID")]
    agent_id: Option<String>,

    /// Location of the persisted agent id
    #[arg(long, env = "AGENT_ID_FILE")]
    identity_file: Option<PathBuf>,

    /// Address the controller can call this agent back on
    #[arg(long, env = "AGENT_CALLBACK_URL")]
    callback_url: Option<String>,

    /// Docker CLI binary used by the built-in handlers
    #[arg(long, env = "DOCKER_BIN", default_value = "docker")]
    docker_bin: String,

    /// Upper bound for one docker CLI invocation, in milliseconds
    #[arg(long, env = "DOCKER_TIMEOUT_MS", default_value = "300000")]
    docker_timeout_ms: u64,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Default to debug logging when RUST_LOG is unset
    #[arg(long, env = "DEBUG")]
    debug: bool,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Args {
    fn into_config(self) -> AgentConfig {
        let controller = ControllerConfig {
            host: self.host,
            port: self.port,
            tls_enabled: self.tls,
            api_prefix: self.api_prefix,
        };
        let transport = TransportConfig {
            use_websocket: self.use_websocket,
            reconnect_delay_ms: self.reconnect_delay_ms,
            fallback_after_failures: self.fallback_after_failures,
            upgrade_interval_ms: (self.upgrade_interval_ms > 0).then_some(self.upgrade_interval_ms),
            poll_interval_ms: self.poll_interval_ms,
            ..TransportConfig::default()
        };

        let mut config = AgentConfig::new(controller, self.token).with_transport(transport);
        config.heartbeat_interval_ms = self.heartbeat_interval_ms;
        config.drain_timeout_ms = self.drain_timeout_ms;
        config.agent_id = self.agent_id;
        config.identity_file = self.identity_file;
        config.callback_url = self.callback_url;
        config
    }
}

fn init_logging(format: &LogFormat, debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_logging(&args.log_format, args.debug);

    let docker = DockerCli::new(args.docker_bin.clone())
        .with_timeout(Duration::from_millis(args.docker_timeout_ms));
    let config = args.into_config();
    config.validate().context("invalid configuration")?;

    let registry = builtin_handlers(docker).build();
    let agent = Agent::new(config, registry);

    let shutdown = install_shutdown_handler().context("failed to install signal handlers")?;
    agent
        .start(shutdown)
        .await
        .context("agent failed to start")?;

    Ok(())
}
