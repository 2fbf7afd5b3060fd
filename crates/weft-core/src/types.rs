use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::workflow::{InputType, InputValidation, NodeType, ProviderRef, SandboxLimits};

/// Unique identifier of one workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome status of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Success,
    Failed,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an executor hands back on success. The engine wraps it into a
/// [`NodeOutput`].
#[derive(Debug, Clone, Default)]
pub struct NodeResult {
    pub output: Value,
    pub variables: Map<String, Value>,
}

impl NodeResult {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            variables: Map::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

/// Recorded outcome of one executed node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutput {
    pub node_id: String,
    pub node_name: String,
    pub timestamp: DateTime<Utc>,
    pub status: NodeStatus,
    pub output: Value,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub duration_ms: u64,
}

impl NodeOutput {
    pub fn success(node_id: &str, node_name: &str, output: Value) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_name: node_name.to_string(),
            timestamp: Utc::now(),
            status: NodeStatus::Success,
            output,
            variables: Map::new(),
            error: None,
            error_stack: None,
            attempts: 0,
            duration_ms: 0,
        }
    }

    pub fn failed(node_id: &str, node_name: &str, error: &crate::error::WeftError) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_name: node_name.to_string(),
            timestamp: Utc::now(),
            status: NodeStatus::Failed,
            output: Value::Null,
            variables: Map::new(),
            error: Some(error.to_string()),
            error_stack: Some(format!("{}: {:?}", error.kind(), error)),
            attempts: 0,
            duration_ms: 0,
        }
    }

    /// The short-circuit output recorded for a node whose skip condition held.
    pub fn skipped(node_id: &str, node_name: &str) -> Self {
        Self::success(node_id, node_name, serde_json::json!({ "skipped": true }))
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A pending approve/reject request for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub instance_id: String,
    pub node_id: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub timestamp: DateTime<Utc>,
}

/// Resolution of an approval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected { reason: String },
}

/// Event broadcast to all subscribers of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WorkflowEvent {
    RunStarted {
        instance_id: String,
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        instance_id: String,
        node_id: String,
        node_name: String,
        node_type: NodeType,
    },
    NodeCompleted {
        instance_id: String,
        node_id: String,
        node_name: String,
        node_type: NodeType,
        status: NodeStatus,
        output: Value,
    },
    NodeFailed {
        instance_id: String,
        node_id: String,
        node_name: String,
        node_type: NodeType,
        error: String,
    },
    WorkflowLog {
        instance_id: String,
        level: LogLevel,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
    },
    ApprovalRequired {
        request: ApprovalRequest,
    },
    ApprovalResolved {
        request_id: String,
        approved: bool,
    },
    RunCompleted {
        instance_id: String,
        status: RunStatus,
    },
    RunFailed {
        instance_id: String,
        error: String,
    },
}

impl WorkflowEvent {
    /// Wire name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run-started",
            Self::NodeStarted { .. } => "node-started",
            Self::NodeCompleted { .. } => "node-completed",
            Self::NodeFailed { .. } => "node-failed",
            Self::WorkflowLog { .. } => "workflow-log",
            Self::ApprovalRequired { .. } => "approval-required",
            Self::ApprovalResolved { .. } => "approval-resolved",
            Self::RunCompleted { .. } => "run-completed",
            Self::RunFailed { .. } => "run-failed",
        }
    }

    /// Node id carried by node-scoped events.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::NodeCompleted { node_id, .. }
            | Self::NodeFailed { node_id, .. } => Some(node_id),
            Self::WorkflowLog { node_id, .. } => node_id.as_deref(),
            Self::ApprovalRequired { request } => Some(&request.node_id),
            _ => None,
        }
    }
}

// ── Collaborator payloads ───────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Response of the LLM execution service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub success: bool,
    pub output: Value,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub error: Option<String>,
}

impl LlmResponse {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            usage: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            usage: None,
            error: Some(message.into()),
        }
    }
}

/// Prompt handed to the LLM execution service.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub provider: ProviderRef,
    pub prompt: String,
    pub context: Value,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub language: String,
    pub code: String,
    pub limits: SandboxLimits,
    /// Node context made available to the code.
    pub input: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxResult {
    pub result: Value,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpRequestSpec {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Parsed JSON when the body is JSON, otherwise the raw text.
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Question put to the user-input UI.
#[derive(Debug, Clone)]
pub struct InputRequest {
    pub instance_id: String,
    pub node_id: String,
    pub prompt: String,
    pub input_type: InputType,
    pub required: bool,
    pub default_value: Option<Value>,
    pub validation: InputValidation,
}

/// Stored workflow instance row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub instance_id: String,
    pub workflow_id: String,
    pub version: u32,
    pub status: RunStatus,
    pub project_folder: String,
    #[serde(default)]
    pub parent_instance_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One node execution reported to the persistence service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub instance_id: String,
    pub node_id: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl PhaseRecord {
    pub fn from_output(instance_id: &str, node_type: NodeType, output: &NodeOutput) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            node_id: output.node_id.clone(),
            node_type,
            status: output.status,
            output: output.output.clone(),
            error: output.error.clone(),
            attempts: output.attempts,
            duration_ms: output.duration_ms,
            recorded_at: output.timestamp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubWorkflowRequest {
    pub workflow_id: String,
    pub version: Option<u32>,
    pub parent_instance_id: String,
    pub parent_node_id: String,
    pub project_folder: String,
    pub inputs: Map<String, Value>,
}

/// Handle to a nested run started by the workflow service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubWorkflowHandle {
    pub instance_id: String,
    pub workflow_id: String,
    pub version: u32,
    pub status: RunStatus,
}
