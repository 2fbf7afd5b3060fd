use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use weft_core::context::NodeContext;
use weft_core::error::{Result, WeftError};
use weft_core::traits::{
    HttpTransport, LlmExecutor, SandboxRuntime, UserInputProvider, WorkflowService,
};
use weft_core::{NodeResult, NodeType, WorkflowNode};

pub mod agent;
pub mod code;
pub mod conditional;
pub mod file;
pub mod http;
pub(crate) mod loop_node;
pub mod sub_workflow;
pub mod user_input;

pub use agent::AgentExecutor;
pub use code::CodeExecutor;
pub use conditional::ConditionalExecutor;
pub use file::FileExecutor;
pub use http::HttpExecutor;
pub use sub_workflow::SubWorkflowExecutor;
pub use user_input::UserInputExecutor;

/// Runs one kind of node. Executors only read the context they are handed
/// and return data; the engine records results and emits events.
pub trait NodeExecutor: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn execute<'a>(
        &'a self,
        node: &'a WorkflowNode,
        ctx: NodeContext,
    ) -> BoxFuture<'a, Result<NodeResult>>;
}

/// Error for a node routed to an executor that does not handle its kind.
pub(crate) fn kind_mismatch(node: &WorkflowNode, executor: &str) -> WeftError {
    WeftError::Validation {
        node: node.id.clone(),
        message: format!("{} executor cannot run a {} node", executor, node.node_type()),
    }
}

/// Injected collaborator services. Executors are only registered for the
/// services that are present.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub llm: Option<Arc<dyn LlmExecutor>>,
    pub sandbox: Option<Arc<dyn SandboxRuntime>>,
    pub http: Option<Arc<dyn HttpTransport>>,
    pub user_input: Option<Arc<dyn UserInputProvider>>,
    pub workflows: Option<Arc<dyn WorkflowService>>,
}

/// Executors keyed by node type. Loops are run by the engine itself.
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor, replacing any previous one for `node_type`.
    pub fn register(&mut self, node_type: NodeType, executor: impl NodeExecutor) {
        self.executors.insert(node_type, Arc::new(executor));
    }

    pub fn register_shared(&mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(node_type, executor);
    }

    pub fn unregister(&mut self, node_type: NodeType) -> bool {
        self.executors.remove(&node_type).is_some()
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type).cloned()
    }

    pub fn contains(&self, node_type: NodeType) -> bool {
        self.executors.contains_key(&node_type)
    }

    /// Registered node types in declaration order.
    pub fn list(&self) -> Vec<NodeType> {
        NodeType::ALL
            .into_iter()
            .filter(|t| self.executors.contains_key(t))
            .collect()
    }

    /// Registry with the built-in executors for whichever collaborators exist.
    pub fn with_collaborators(collaborators: &Collaborators) -> Self {
        let mut registry = Self::new();

        // ── Pure / local ────────────────────────────────────────
        registry.register(NodeType::Conditional, ConditionalExecutor);
        registry.register(NodeType::FileOperation, FileExecutor);
        registry.register(
            NodeType::UserInput,
            UserInputExecutor::new(collaborators.user_input.clone()),
        );

        // ── Collaborator-backed ─────────────────────────────────
        if let Some(llm) = &collaborators.llm {
            let agent: Arc<dyn NodeExecutor> = Arc::new(AgentExecutor::new(llm.clone()));
            for node_type in [NodeType::Planning, NodeType::Writing, NodeType::Gate] {
                registry.register_shared(node_type, agent.clone());
            }
        }
        if let Some(sandbox) = &collaborators.sandbox {
            registry.register(NodeType::CodeExecution, CodeExecutor::new(sandbox.clone()));
        }
        if let Some(http) = &collaborators.http {
            registry.register(NodeType::HttpRequest, HttpExecutor::new(http.clone()));
        }
        if let Some(workflows) = &collaborators.workflows {
            registry.register(
                NodeType::SubWorkflow,
                SubWorkflowExecutor::new(workflows.clone()),
            );
        }

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::types::{LlmResponse, PromptRequest};

    struct EchoLlm;

    impl LlmExecutor for EchoLlm {
        fn execute_prompt(&self, request: PromptRequest) -> BoxFuture<'_, Result<LlmResponse>> {
            Box::pin(async move { Ok(LlmResponse::ok(request.prompt.into())) })
        }
    }

    #[test]
    fn local_executors_always_present() {
        let registry = ExecutorRegistry::with_collaborators(&Collaborators::default());
        assert_eq!(
            registry.list(),
            vec![NodeType::UserInput, NodeType::FileOperation, NodeType::Conditional]
        );
        assert!(registry.get(NodeType::Planning).is_none());
        assert!(!registry.contains(NodeType::Loop));
    }

    #[test]
    fn llm_registers_agent_types() {
        let collaborators = Collaborators {
            llm: Some(Arc::new(EchoLlm)),
            ..Default::default()
        };
        let mut registry = ExecutorRegistry::with_collaborators(&collaborators);
        for node_type in [NodeType::Planning, NodeType::Writing, NodeType::Gate] {
            assert_eq!(registry.get(node_type).unwrap().name(), "agent");
        }
        assert!(registry.unregister(NodeType::Gate));
        assert!(!registry.contains(NodeType::Gate));
    }
}
