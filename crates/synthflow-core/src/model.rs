use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Paused,
    Completed,
    Failed,
    #[serde(alias = "cancelled", alias = "canceled")]
    Aborted,
}

impl Default for WorkflowStatus {
    fn default() -> Self {
        Self::Running
    }
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Aborted => "aborted",
        }
    }

    /// No further progress is expected once a workflow reaches one of these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Aborted
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "running" => Ok(WorkflowStatus::Running),
            "paused" => Ok(WorkflowStatus::Paused),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "aborted" | "cancelled" | "canceled" => Ok(WorkflowStatus::Aborted),
            other => Err(format!("Unknown workflow status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Paused,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical view of one workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkflowState {
    pub id: String,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    /// Insertion order is completion order.
    #[serde(default)]
    pub stages_completed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cost_accrued: f64,
}

impl WorkflowState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn has_completed(&self, stage: &str) -> bool {
        self.stages_completed.iter().any(|existing| existing == stage)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(value) => write!(f, "{value}"),
            MetricValue::Text(value) => f.write_str(value),
        }
    }
}

impl Serialize for MetricValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            MetricValue::Number(value) => serializer.serialize_f64(*value),
            MetricValue::Text(value) => serializer.serialize_str(value),
        }
    }
}

impl<'de> Deserialize<'de> for MetricValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::Number(number) => match number.as_f64() {
                Some(value) => MetricValue::Number(value),
                None => MetricValue::Text(number.to_string()),
            },
            Value::String(text) => MetricValue::Text(text),
            other => MetricValue::Text(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentState {
    pub id: String,
    #[serde(default, rename = "type")]
    pub agent_type: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "deserialize_log_lines")]
    pub logs: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<Value>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricValue>,
}

impl AgentState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// Partial agent state as delivered by `agent_update` events and status polls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentUpdate {
    #[serde(alias = "id")]
    pub agent_id: String,
    #[serde(
        default,
        rename = "type",
        alias = "agent_type",
        skip_serializing_if = "Option::is_none"
    )]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "deserialize_log_lines")]
    pub logs: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<Value>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricValue>,
}

impl AgentUpdate {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }

    /// True when the update carries nothing beyond the agent id.
    pub fn is_empty(&self) -> bool {
        self.agent_type.is_none()
            && self.status.is_none()
            && self.progress.is_none()
            && self.current_operation.is_none()
            && self.message.is_none()
            && self.logs.is_empty()
            && self.decisions.is_empty()
            && self.metrics.is_empty()
    }
}

impl From<AgentState> for AgentUpdate {
    fn from(state: AgentState) -> Self {
        Self {
            agent_id: state.id,
            agent_type: if state.agent_type.is_empty() {
                None
            } else {
                Some(state.agent_type)
            },
            status: Some(state.status),
            progress: Some(state.progress),
            current_operation: state.current_operation,
            message: state.message,
            logs: state.logs,
            decisions: state.decisions,
            metrics: state.metrics,
        }
    }
}

pub type FieldMap = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TransformationRecord {
    #[serde(default)]
    pub before: Vec<FieldMap>,
    #[serde(default)]
    pub after: Vec<FieldMap>,
    #[serde(default)]
    pub changed_fields: BTreeSet<String>,
    #[serde(default)]
    pub transformation_type: String,
}

impl TransformationRecord {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty()
            && self.after.is_empty()
            && self.changed_fields.is_empty()
            && self.transformation_type.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct ActivityLogEntry {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl ActivityLogEntry {
    pub fn new(timestamp: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            level,
            message: message.into(),
            agent_id: None,
        }
    }
}

/// Partial workflow state carried by `workflow_status` events and polls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkflowStatusUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages_completed: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, alias = "cost", skip_serializing_if = "Option::is_none")]
    pub cost_accrued: Option<f64>,
}

impl WorkflowStatusUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.progress.is_none()
            && self.current_stage.is_none()
            && self.stages_completed.is_none()
            && self.error.is_none()
            && self.cost_accrued.is_none()
    }
}

/// Full-status pull response: workflow fields plus agents and the persisted log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StatusSnapshot {
    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(flatten)]
    pub state: WorkflowStatusUpdate,
    #[serde(default, deserialize_with = "deserialize_agents")]
    pub agents: Vec<AgentUpdate>,
    #[serde(default)]
    pub logs: Vec<ActivityLogEntry>,
}

impl StatusSnapshot {
    pub fn is_empty(&self) -> bool {
        self.state.is_empty() && self.agents.is_empty() && self.logs.is_empty()
    }
}

/// Accepts plain strings or `{ "message": ... }` objects.
fn deserialize_log_lines<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values: Vec<Value> = Vec::deserialize(deserializer)?;
    let mut lines = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::String(line) => lines.push(line),
            Value::Object(map) => match map.get("message").and_then(Value::as_str) {
                Some(message) => lines.push(message.to_string()),
                None => lines.push(Value::Object(map).to_string()),
            },
            Value::Null => {}
            other => lines.push(other.to_string()),
        }
    }
    Ok(lines)
}

/// Agents arrive either as a list or keyed by agent id.
fn deserialize_agents<'de, D>(deserializer: D) -> Result<Vec<AgentUpdate>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(serde::de::Error::custom))
            .collect(),
        Value::Object(map) => {
            let mut agents = Vec::with_capacity(map.len());
            for (key, mut item) in map {
                if let Value::Object(fields) = &mut item {
                    if !fields.contains_key("agent_id") && !fields.contains_key("id") {
                        fields.insert("agent_id".to_string(), Value::String(key));
                    }
                }
                agents.push(serde_json::from_value(item).map_err(serde::de::Error::custom)?);
            }
            Ok(agents)
        }
        _ => Err(serde::de::Error::custom(
            "expected agent list or agent map",
        )),
    }
}
