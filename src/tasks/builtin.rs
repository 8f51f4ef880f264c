//! Handlers shipped with the agent.
//!
//! The Docker-backed handlers shell out to the `docker` CLI rather than talking
//! to the engine API:
//! - `docker_command`: run `docker <command> <args...>` and return its output
//! - `metrics`: container/image/stack/network/volume counts for heartbeats
//! - `docker_info`: engine version and basic counts
//!
//! `echo` and `system_info` need nothing from the host.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::identity::{hostname, AGENT_VERSION};
use crate::protocol::Payload;
use crate::tasks::registry::{HandlerError, HandlerRegistryBuilder, HandlerResult, TaskHandler};

/// Upper bound for one docker CLI invocation unless configured otherwise.
pub const DEFAULT_DOCKER_TIMEOUT: Duration = Duration::from_secs(300);

/// Thin wrapper around the docker binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_DOCKER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the binary with `args`, returning stdout on success and stderr (or
    /// the exit code) as the error otherwise. The child is killed if it outlives
    /// the timeout.
    pub async fn run(&self, args: &[String]) -> Result<String, HandlerError> {
        tracing::debug!(binary = %self.binary, args = ?args, "Running docker CLI");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, output).await {
            Ok(result) => Self::process_output(&self.binary, result),
            Err(_) => Err(HandlerError::failed(format!(
                "{} timed out after {:?}",
                self.binary, self.timeout
            ))),
        }
    }

    fn process_output(
        binary: &str,
        result: Result<std::process::Output, std::io::Error>,
    ) -> Result<String, HandlerError> {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();

                if output.status.success() {
                    Ok(stdout)
                } else if stderr.trim().is_empty() {
                    Err(HandlerError::failed(format!(
                        "{} exited with code {:?}",
                        binary,
                        output.status.code()
                    )))
                } else {
                    Err(HandlerError::failed(stderr.trim().to_string()))
                }
            }
            Err(e) => Err(HandlerError::failed(format!("failed to run {}: {}", binary, e))),
        }
    }

    /// Number of non-empty output lines, e.g. for `docker ps -aq`.
    async fn count(&self, args: &[&str]) -> Result<u64, HandlerError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = self.run(&args).await?;
        Ok(output.lines().filter(|l| !l.trim().is_empty()).count() as u64)
    }
}

/// Returns its payload unchanged.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, payload: Payload) -> HandlerResult {
        Ok(Value::Object(payload))
    }
}

pub struct SystemInfoHandler;

#[async_trait]
impl TaskHandler for SystemInfoHandler {
    async fn handle(&self, _payload: Payload) -> HandlerResult {
        let num_cpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Ok(json!({
            "platform": std::env::consts::OS,
            "architecture": std::env::consts::ARCH,
            "hostname": hostname(),
            "num_cpu": num_cpu,
            "agent_version": AGENT_VERSION,
        }))
    }
}

/// `{"command": "ps", "args": ["-a"]}` runs `docker ps -a`.
pub struct DockerCommandHandler {
    docker: DockerCli,
}

impl DockerCommandHandler {
    pub fn new(docker: DockerCli) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl TaskHandler for DockerCommandHandler {
    async fn handle(&self, payload: Payload) -> HandlerResult {
        let command = payload
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| HandlerError::MissingField("command".to_string()))?;

        let extra: Vec<String> = match payload.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|a| a.as_str().map(str::to_string))
                .collect(),
            Some(_) => {
                return Err(HandlerError::InvalidField {
                    field: "args".to_string(),
                    reason: "expected a list of strings".to_string(),
                })
            }
        };

        let mut args: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        args.extend(extra);

        let output = self.docker.run(&args).await?;
        Ok(json!({
            "output": output,
            "command": format!("docker {}", args.join(" ")),
        }))
    }
}

/// Resource counts reported in every heartbeat.
pub struct MetricsHandler {
    docker: DockerCli,
}

impl MetricsHandler {
    pub fn new(docker: DockerCli) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl TaskHandler for MetricsHandler {
    async fn handle(&self, _payload: Payload) -> HandlerResult {
        let containers = self.docker.count(&["ps", "-aq"]).await?;
        let images = self.docker.count(&["images", "-q"]).await?;
        let networks = self.docker.count(&["network", "ls", "-q"]).await?;
        let volumes = self.docker.count(&["volume", "ls", "-q"]).await?;
        // Older engines lack the compose plugin; report zero stacks there.
        let stacks = self
            .docker
            .count(&["compose", "ls", "-q"])
            .await
            .unwrap_or(0);

        Ok(json!({
            "containerCount": containers,
            "imageCount": images,
            "stackCount": stacks,
            "networkCount": networks,
            "volumeCount": volumes,
        }))
    }
}

pub struct DockerInfoHandler {
    docker: DockerCli,
}

impl DockerInfoHandler {
    pub fn new(docker: DockerCli) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl TaskHandler for DockerInfoHandler {
    async fn handle(&self, _payload: Payload) -> HandlerResult {
        let version = self
            .docker
            .run(&[
                "version".to_string(),
                "--format".to_string(),
                "{{.Server.Version}}".to_string(),
            ])
            .await?;
        let containers = self.docker.count(&["ps", "-aq"]).await?;
        let images = self.docker.count(&["images", "-q"]).await?;

        Ok(json!({
            "version": version.trim(),
            "containers": containers,
            "images": images,
        }))
    }
}

/// Registry builder pre-loaded with every built-in handler. Callers may add
/// their own handlers before building.
pub fn builtin_handlers(docker: DockerCli) -> HandlerRegistryBuilder {
    crate::tasks::HandlerRegistry::builder()
        .handler("echo", EchoHandler)
        .handler("system_info", SystemInfoHandler)
        .handler("docker_command", DockerCommandHandler::new(docker.clone()))
        .handler("metrics", MetricsHandler::new(docker.clone()))
        .handler("docker_info", DockerInfoHandler::new(docker))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(value: Value) -> Payload {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn echo_returns_payload() {
        let result = EchoHandler
            .handle(payload(json!({"output": "hi"})))
            .await
            .unwrap();
        assert_eq!(result, json!({"output": "hi"}));
    }

    #[tokio::test]
    async fn system_info_fields() {
        let result = SystemInfoHandler.handle(Payload::new()).await.unwrap();
        assert_eq!(result["platform"], std::env::consts::OS);
        assert_eq!(result["architecture"], std::env::consts::ARCH);
        assert!(result["num_cpu"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn docker_command_builds_arguments() {
        // `echo` stands in for the docker binary and prints its arguments.
        let handler = DockerCommandHandler::new(DockerCli::new("echo"));

        let result = handler
            .handle(payload(json!({"command": "ps", "args": ["-a", "--no-trunc"]})))
            .await
            .unwrap();

        assert_eq!(result["output"], "ps -a --no-trunc\n");
        assert_eq!(result["command"], "docker ps -a --no-trunc");
    }

    #[tokio::test]
    async fn hung_cli_times_out() {
        let cli = DockerCli::new("sleep").with_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();

        let err = cli.run(&["5".to_string()]).await.unwrap_err();

        assert!(err.to_string().contains("timed out"), "got {}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn docker_command_requires_command() {
        let handler = DockerCommandHandler::new(DockerCli::new("echo"));

        let err = handler.handle(Payload::new()).await.unwrap_err();
        assert_eq!(err, HandlerError::MissingField("command".to_string()));

        let err = handler
            .handle(payload(json!({"command": "ps", "args": "-a"})))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidField { .. }));
    }

    #[tokio::test]
    async fn failing_binary_reports_exit_code() {
        let docker = DockerCli::new("false");
        let err = docker.run(&["ps".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("exited with code"));
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_error() {
        let docker = DockerCli::new("nonexistent_docker_binary_12345");
        let err = docker.run(&[]).await.unwrap_err();
        assert!(err.to_string().contains("failed to run"));
    }

    #[tokio::test]
    async fn metrics_counts_output_lines() {
        let handler = MetricsHandler::new(DockerCli::new("echo"));

        let result = handler.handle(Payload::new()).await.unwrap();

        assert_eq!(result["containerCount"], 1);
        assert_eq!(result["imageCount"], 1);
        assert_eq!(result["stackCount"], 1);
        assert_eq!(result["networkCount"], 1);
        assert_eq!(result["volumeCount"], 1);
    }

    #[test]
    fn builtin_registry_contents() {
        let registry = builtin_handlers(DockerCli::default()).build();
        assert_eq!(
            registry.task_types(),
            vec!["docker_command", "docker_info", "echo", "metrics", "system_info"]
        );
    }
}
