//! Messages exchanged with the controller.
//!
//! The persistent channel carries JSON frames of the form
//! `{"type": ..., "agent_id": ..., "data": {...}}`. The HTTP endpoints reuse the
//! same task, outcome and heartbeat shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::identity::AgentIdentity;

/// Untyped key/value payload carried by tasks and results.
pub type Payload = serde_json::Map<String, Value>;

/// Key a non-object handler result is stored under.
pub const DEFAULT_RESULT_KEY: &str = "data";

pub mod frame {
    pub const TASK: &str = "task";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const HEARTBEAT_ACK: &str = "heartbeat_ack";
    pub const TASK_RESULT: &str = "task_result";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work delivered by the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Task as it appears on the wire. Push frames name the fields `task_id` and
/// `command`, the polling endpoint uses `id` and `type`.
#[derive(Debug, Deserialize)]
struct TaskRecord {
    #[serde(alias = "task_id")]
    id: String,
    #[serde(rename = "type", alias = "command")]
    task_type: String,
    #[serde(default)]
    payload: Option<Payload>,
}

impl From<TaskRecord> for Task {
    fn from(record: TaskRecord) -> Self {
        Task::new(
            record.id,
            record.task_type,
            record.payload.unwrap_or_default(),
        )
    }
}

/// Result of executing one task. `result` is set iff completed, `error` iff failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn completed(task_id: impl Into<String>, result: Payload) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Body for `POST /agents/{id}/tasks/{task_id}/result`, which carries the
    /// task id in the path instead.
    pub fn result_body(&self) -> Value {
        let mut body = json!({ "status": self.status });
        if let Some(result) = &self.result {
            body["result"] = Value::Object(result.clone());
        }
        if let Some(error) = &self.error {
            body["error"] = Value::String(error.clone());
        }
        body
    }
}

/// Counts reported by the `metrics` task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub container_count: u64,
    pub image_count: u64,
    pub stack_count: u64,
    pub network_count: u64,
    pub volume_count: u64,
}

impl AgentMetrics {
    pub fn from_payload(payload: &Payload) -> Self {
        Self {
            container_count: count_field(payload, "containerCount"),
            image_count: count_field(payload, "imageCount"),
            stack_count: count_field(payload, "stackCount"),
            network_count: count_field(payload, "networkCount"),
            volume_count: count_field(payload, "volumeCount"),
        }
    }
}

/// Docker engine summary reported by the `docker_info` task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerInfo {
    pub version: String,
    pub containers: u64,
    pub images: u64,
}

impl DockerInfo {
    pub fn from_payload(payload: &Payload) -> Self {
        Self {
            version: payload
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            containers: count_field(payload, "containers"),
            images: count_field(payload, "images"),
        }
    }
}

/// Missing or non-numeric values read as zero; floats are truncated.
fn count_field(payload: &Payload, key: &str) -> u64 {
    match payload.get(key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        _ => 0,
    }
}

/// Liveness report. Built fresh on every heartbeat tick.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatSnapshot {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<AgentMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerInfo>,
    pub hostname: String,
    pub platform: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

impl HeartbeatSnapshot {
    pub fn online(
        identity: &AgentIdentity,
        metrics: Option<AgentMetrics>,
        docker: Option<DockerInfo>,
    ) -> Self {
        Self {
            status: "online".to_string(),
            metrics,
            docker,
            hostname: identity.hostname.clone(),
            platform: identity.platform.clone(),
            version: identity.version.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Body of `POST /agents/register`.
#[derive(Debug, Serialize)]
pub struct Registration<'a> {
    pub id: &'a str,
    pub hostname: &'a str,
    pub platform: &'a str,
    pub arch: &'a str,
    pub version: &'a str,
    pub capabilities: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<&'a str>,
}

impl<'a> From<&'a AgentIdentity> for Registration<'a> {
    fn from(identity: &'a AgentIdentity) -> Self {
        Self {
            id: &identity.agent_id,
            hostname: &identity.hostname,
            platform: &identity.platform,
            arch: &identity.arch,
            version: &identity.version,
            capabilities: &identity.capabilities,
            url: identity.callback_url.as_deref(),
        }
    }
}

/// Outbound frame on the persistent channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub data: Value,
}

impl WireMessage {
    pub fn new(kind: &str, agent_id: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            agent_id: agent_id.to_string(),
            data,
        }
    }

    pub fn pong(agent_id: &str) -> Self {
        Self::new(frame::PONG, agent_id, json!({}))
    }

    pub fn heartbeat(agent_id: &str, snapshot: &HeartbeatSnapshot) -> Result<Self> {
        Ok(Self::new(frame::HEARTBEAT, agent_id, serde_json::to_value(snapshot)?))
    }

    pub fn task_result(agent_id: &str, outcome: &TaskOutcome) -> Result<Self> {
        Ok(Self::new(frame::TASK_RESULT, agent_id, serde_json::to_value(outcome)?))
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Inbound frame after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Task(Task),
    Ping,
    HeartbeatAck,
    Unknown(String),
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match kind {
            frame::TASK => {
                // Task fields normally live under "data"; older controllers put
                // them at the top level.
                let body = match value.get("data") {
                    Some(data) if data.get("task_id").is_some() || data.get("id").is_some() => {
                        data.clone()
                    }
                    _ => value.clone(),
                };
                let record: TaskRecord = serde_json::from_value(body)?;
                Ok(InboundFrame::Task(record.into()))
            }
            frame::PING => Ok(InboundFrame::Ping),
            frame::HEARTBEAT_ACK | frame::HEARTBEAT => Ok(InboundFrame::HeartbeatAck),
            other => Ok(InboundFrame::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PendingBody {
    List(Vec<TaskRecord>),
    Envelope {
        #[serde(default = "default_success")]
        success: bool,
        #[serde(default)]
        tasks: Option<Vec<TaskRecord>>,
        #[serde(default)]
        error: Option<String>,
    },
}

fn default_success() -> bool {
    true
}

/// Interpretation of a `GET /agents/{id}/tasks/pending` response body.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingTasks {
    Tasks(Vec<Task>),
    /// The controller answered but flagged the request as failed.
    Rejected(String),
}

impl PendingTasks {
    /// Empty and non-JSON bodies mean "nothing to do", not an error.
    pub fn from_body(body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        if text.trim().is_empty() {
            return PendingTasks::Tasks(Vec::new());
        }

        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => {
                tracing::debug!("Non-JSON pending tasks response, treating as no tasks");
                return PendingTasks::Tasks(Vec::new());
            }
        };

        match serde_json::from_value::<PendingBody>(value) {
            Ok(PendingBody::List(records)) => {
                PendingTasks::Tasks(records.into_iter().map(Task::from).collect())
            }
            Ok(PendingBody::Envelope {
                success: false,
                error,
                ..
            }) => PendingTasks::Rejected(error.unwrap_or_else(|| "unspecified error".to_string())),
            Ok(PendingBody::Envelope { tasks, .. }) => PendingTasks::Tasks(
                tasks
                    .unwrap_or_default()
                    .into_iter()
                    .map(Task::from)
                    .collect(),
            ),
            Err(e) => {
                tracing::warn!(error = %e, "Unrecognized pending tasks response");
                PendingTasks::Tasks(Vec::new())
            }
        }
    }
}
