use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A workflow as handed to the engine: an ordered node list plus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<WorkflowNode>,
    /// Edges are carried for observers and editors; execution order is the
    /// order of `nodes`.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Initial values for the run's variable namespace.
    #[serde(default)]
    pub variables: Map<String, Value>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, nodes: Vec<WorkflowNode>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            description: String::new(),
            nodes,
            edges: vec![],
            variables: Map::new(),
        }
    }
}

/// Connection between two nodes in the editor graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: Option<String>,
}

/// One unit of work in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    /// Unique identifier within a run (nested loop bodies included).
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Pause for an external approve/reject signal before executing.
    #[serde(default)]
    pub requires_approval: bool,
    /// Keep the run going when this node fails.
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub retry_config: Option<RetryConfig>,
    /// Per-attempt timeout. `None` means attempts are never raced.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Expression that, when true, bypasses the executor entirely.
    #[serde(default)]
    pub skip_condition: Option<String>,
    #[serde(default)]
    pub context_config: ContextConfig,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            requires_approval: false,
            continue_on_error: false,
            retry_config: None,
            timeout_ms: None,
            skip_condition: None,
            context_config: ContextConfig::default(),
            kind,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry_config = Some(retry);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_skip_condition(mut self, expr: impl Into<String>) -> Self {
        self.skip_condition = Some(expr.into());
        self
    }

    pub fn with_context(mut self, config: ContextConfig) -> Self {
        self.context_config = config;
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }
}

/// Variant-specific configuration, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Planning(AgentNode),
    Writing(AgentNode),
    Gate(AgentNode),
    UserInput(UserInputNode),
    CodeExecution(CodeNode),
    HttpRequest(HttpNode),
    FileOperation(FileNode),
    Conditional(ConditionalNode),
    Loop(LoopNode),
    SubWorkflow(SubWorkflowNode),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Planning(_) => NodeType::Planning,
            Self::Writing(_) => NodeType::Writing,
            Self::Gate(_) => NodeType::Gate,
            Self::UserInput(_) => NodeType::UserInput,
            Self::CodeExecution(_) => NodeType::CodeExecution,
            Self::HttpRequest(_) => NodeType::HttpRequest,
            Self::FileOperation(_) => NodeType::FileOperation,
            Self::Conditional(_) => NodeType::Conditional,
            Self::Loop(_) => NodeType::Loop,
            Self::SubWorkflow(_) => NodeType::SubWorkflow,
        }
    }
}

/// Fieldless discriminant of [`NodeKind`], used as the executor registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Planning,
    Writing,
    Gate,
    UserInput,
    CodeExecution,
    HttpRequest,
    FileOperation,
    Conditional,
    Loop,
    SubWorkflow,
}

impl NodeType {
    pub const ALL: [NodeType; 10] = [
        Self::Planning,
        Self::Writing,
        Self::Gate,
        Self::UserInput,
        Self::CodeExecution,
        Self::HttpRequest,
        Self::FileOperation,
        Self::Conditional,
        Self::Loop,
        Self::SubWorkflow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Writing => "writing",
            Self::Gate => "gate",
            Self::UserInput => "user_input",
            Self::CodeExecution => "code_execution",
            Self::HttpRequest => "http_request",
            Self::FileOperation => "file_operation",
            Self::Conditional => "conditional",
            Self::Loop => "loop",
            Self::SubWorkflow => "sub_workflow",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_retry_delay_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 2.0 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, retry_delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            retry_delay_ms,
            backoff_multiplier,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-based):
    /// `retryDelayMs × backoffMultiplier^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(0.0).powi(attempt as i32);
        let ms = (self.retry_delay_ms as f64 * factor).min(u64::MAX as f64);
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    #[default]
    Simple,
    Advanced,
}

/// How a node sees the context and what it writes back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub mode: ContextMode,
    #[serde(default)]
    pub inputs: Vec<ContextMapping>,
    #[serde(default)]
    pub outputs: Vec<ContextMapping>,
}

impl ContextConfig {
    pub fn advanced(inputs: Vec<ContextMapping>, outputs: Vec<ContextMapping>) -> Self {
        Self {
            mode: ContextMode::Advanced,
            inputs,
            outputs,
        }
    }
}

/// Explicit source → target copy rule used in advanced mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMapping {
    /// Path expression or `{{var}}` template.
    pub source: String,
    /// Variable name to write.
    pub target: String,
    /// Single-argument expression over `value`.
    #[serde(default)]
    pub transform: Option<String>,
    /// Input mappings only: fail the context build when unresolved.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl ContextMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            transform: None,
            required: true,
        }
    }

    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Fully resolved model provider; credentials arrive already decrypted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRef {
    pub id: String,
    #[serde(default)]
    pub provider_type: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

/// Planning, writing, and gate nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentNode {
    #[serde(default)]
    pub provider: ProviderRef,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Gate nodes only: expression over `output` that must hold.
    #[serde(default)]
    pub gate_condition: Option<String>,
}

impl AgentNode {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            provider: ProviderRef::default(),
            prompt: prompt.into(),
            system_prompt: None,
            gate_condition: None,
        }
    }

    pub fn with_gate(mut self, condition: impl Into<String>) -> Self {
        self.gate_condition = Some(condition.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    Text,
    Number,
    Boolean,
    Select,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputValidation {
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputNode {
    pub prompt: String,
    #[serde(default)]
    pub input_type: InputType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub validation: InputValidation,
    /// Variable that receives the answer; defaults to the node id.
    #[serde(default)]
    pub variable: Option<String>,
}

/// Resource limits forwarded to the sandbox runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxLimits {
    #[serde(default = "default_cpu_timeout_ms")]
    pub cpu_timeout_ms: u64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
}

fn default_cpu_timeout_ms() -> u64 { 30_000 }
fn default_memory_mb() -> u64 { 256 }

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            cpu_timeout_ms: default_cpu_timeout_ms(),
            memory_mb: default_memory_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeNode {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub sandbox: SandboxLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpNode {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// String bodies are templates; structured bodies have their string
    /// leaves substituted.
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "GET".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Read,
    Write,
    Copy,
    Move,
    Delete,
    Exists,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub operation: FileOperation,
    pub path: String,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default = "default_require_project_folder")]
    pub require_project_folder: bool,
}

fn default_require_project_folder() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalNode {
    pub condition: String,
    /// Variable receiving the boolean; defaults to `conditionResult`.
    #[serde(default)]
    pub result_variable: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopType {
    ForEach,
    While,
    Count,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopNode {
    pub loop_type: LoopType,
    /// forEach: path expression resolving to an array.
    #[serde(default)]
    pub collection: Option<String>,
    /// count: fixed number of iterations.
    #[serde(default)]
    pub count: Option<u64>,
    /// while: condition checked before every iteration.
    #[serde(default)]
    pub while_condition: Option<String>,
    #[serde(default = "default_iterator_variable")]
    pub iterator_variable: String,
    #[serde(default)]
    pub index_variable: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    pub body: Vec<WorkflowNode>,
}

fn default_iterator_variable() -> String {
    "item".into()
}

pub fn default_max_iterations() -> u64 {
    1000
}

impl LoopNode {
    pub fn for_each(collection: impl Into<String>, body: Vec<WorkflowNode>) -> Self {
        Self {
            loop_type: LoopType::ForEach,
            collection: Some(collection.into()),
            count: None,
            while_condition: None,
            iterator_variable: default_iterator_variable(),
            index_variable: None,
            max_iterations: default_max_iterations(),
            body,
        }
    }

    pub fn count(count: u64, body: Vec<WorkflowNode>) -> Self {
        Self {
            loop_type: LoopType::Count,
            collection: None,
            count: Some(count),
            while_condition: None,
            iterator_variable: default_iterator_variable(),
            index_variable: None,
            max_iterations: default_max_iterations(),
            body,
        }
    }

    pub fn while_loop(condition: impl Into<String>, body: Vec<WorkflowNode>) -> Self {
        Self {
            loop_type: LoopType::While,
            collection: None,
            count: None,
            while_condition: Some(condition.into()),
            iterator_variable: default_iterator_variable(),
            index_variable: None,
            max_iterations: default_max_iterations(),
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubWorkflowNode {
    pub workflow_id: String,
    #[serde(default)]
    pub version: Option<u32>,
    /// Input templates handed to the nested run.
    #[serde(default)]
    pub inputs: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_tagged_node() {
        let json = serde_json::json!({
            "id": "g1",
            "name": "Review gate",
            "type": "gate",
            "prompt": "Score this draft: {{draft}}",
            "gateCondition": "output.score >= 80",
            "retryConfig": { "maxRetries": 2 },
            "timeoutMs": 5000
        });
        let node: WorkflowNode = serde_json::from_value(json).unwrap();
        assert_eq!(node.node_type(), NodeType::Gate);
        assert_eq!(node.timeout_ms, Some(5000));
        let retry = node.retry_config.unwrap();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.retry_delay_ms, 1000);
        match node.kind {
            NodeKind::Gate(agent) => {
                assert_eq!(agent.gate_condition.as_deref(), Some("output.score >= 80"))
            }
            other => panic!("unexpected kind: {:?}", other.node_type()),
        }
        assert_eq!(node.context_config.mode, ContextMode::Simple);
    }

    #[test]
    fn deserialize_nested_loop() {
        let json = serde_json::json!({
            "id": "each",
            "name": "Each file",
            "type": "loop",
            "loopType": "forEach",
            "collection": "variables.files",
            "iteratorVariable": "file",
            "body": [
                { "id": "check", "name": "Check", "type": "conditional", "condition": "variables.file != null" }
            ]
        });
        let node: WorkflowNode = serde_json::from_value(json).unwrap();
        let NodeKind::Loop(spec) = node.kind else {
            panic!("expected loop");
        };
        assert_eq!(spec.loop_type, LoopType::ForEach);
        assert_eq!(spec.max_iterations, 1000);
        assert_eq!(spec.body.len(), 1);
        assert_eq!(spec.body[0].node_type(), NodeType::Conditional);
    }

    #[test]
    fn backoff_delay() {
        let retry = RetryConfig::new(3, 100, 2.0);
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn mapping_defaults_to_required() {
        let mapping: ContextMapping =
            serde_json::from_str(r#"{"source": "output.result", "target": "processedResult"}"#)
                .unwrap();
        assert!(mapping.required);
        assert!(mapping.transform.is_none());
    }

    #[test]
    fn node_type_names_match_tags() {
        for ty in NodeType::ALL {
            let tag = serde_json::to_value(ty).unwrap();
            assert_eq!(tag, Value::String(ty.as_str().to_string()));
        }
    }
}
