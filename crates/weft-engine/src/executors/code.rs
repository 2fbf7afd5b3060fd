use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use weft_core::context::NodeContext;
use weft_core::error::{Result, WeftError};
use weft_core::traits::SandboxRuntime;
use weft_core::types::SandboxRequest;
use weft_core::{NodeKind, NodeResult, WorkflowNode};

use super::{kind_mismatch, NodeExecutor};

/// Runs user code through the sandbox runtime.
pub struct CodeExecutor {
    sandbox: Arc<dyn SandboxRuntime>,
}

impl CodeExecutor {
    pub fn new(sandbox: Arc<dyn SandboxRuntime>) -> Self {
        Self { sandbox }
    }
}

impl NodeExecutor for CodeExecutor {
    fn name(&self) -> &str {
        "code_execution"
    }

    fn execute<'a>(
        &'a self,
        node: &'a WorkflowNode,
        ctx: NodeContext,
    ) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(async move {
            let NodeKind::CodeExecution(code) = &node.kind else {
                return Err(kind_mismatch(node, self.name()));
            };

            let languages = self.sandbox.languages();
            if !languages.is_empty() && !languages.iter().any(|l| l == &code.language) {
                return Err(WeftError::Validation {
                    node: node.id.clone(),
                    message: format!(
                        "unsupported language '{}' (available: {})",
                        code.language,
                        languages.join(", ")
                    ),
                });
            }

            let result = self
                .sandbox
                .run_code(SandboxRequest {
                    language: code.language.clone(),
                    code: code.code.clone(),
                    limits: code.sandbox.clone(),
                    input: ctx.scope.clone(),
                })
                .await?;

            if let Some(error) = result.error {
                return Err(WeftError::execution(format!(
                    "Code execution failed: {}",
                    error
                )));
            }

            // A result object may hand variables back to the run.
            let variables = result
                .result
                .get("variables")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            let mut node_result =
                NodeResult::new(json!({ "result": result.result, "stdout": result.stdout }));
            node_result.variables = variables;
            Ok(node_result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::types::SandboxResult;
    use weft_core::{CodeNode, ContextMode, SandboxLimits};

    struct FixedSandbox(SandboxResult);

    impl SandboxRuntime for FixedSandbox {
        fn run_code(&self, request: SandboxRequest) -> BoxFuture<'_, Result<SandboxResult>> {
            let mut result = self.0.clone();
            if result.stdout.is_none() {
                result.stdout = Some(format!("{} ms", request.limits.cpu_timeout_ms));
            }
            Box::pin(async move { Ok(result) })
        }

        fn languages(&self) -> Vec<String> {
            vec!["python".into()]
        }
    }

    fn node(language: &str) -> WorkflowNode {
        WorkflowNode::new(
            "calc",
            "Calc",
            NodeKind::CodeExecution(CodeNode {
                language: language.into(),
                code: "print(1)".into(),
                sandbox: SandboxLimits::default(),
            }),
        )
    }

    fn ctx() -> NodeContext {
        NodeContext {
            instance_id: "run-1".into(),
            workflow_id: "wf".into(),
            node_id: "calc".into(),
            project_folder: "/tmp".into(),
            mode: ContextMode::Simple,
            scope: json!({ "variables": {} }),
        }
    }

    #[tokio::test]
    async fn returns_result_and_variables() {
        let sandbox = FixedSandbox(SandboxResult {
            result: json!({ "total": 3, "variables": { "total": 3 } }),
            stdout: None,
            error: None,
        });
        let exec = CodeExecutor::new(Arc::new(sandbox));
        let result = exec.execute(&node("python"), ctx()).await.unwrap();
        assert_eq!(result.output["result"]["total"], json!(3));
        assert_eq!(result.output["stdout"], json!("30000 ms"));
        assert_eq!(result.variables["total"], json!(3));
    }

    #[tokio::test]
    async fn sandbox_error_fails_node() {
        let sandbox = FixedSandbox(SandboxResult {
            error: Some("NameError: x".into()),
            ..Default::default()
        });
        let exec = CodeExecutor::new(Arc::new(sandbox));
        let err = exec.execute(&node("python"), ctx()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("NameError"));
    }

    #[tokio::test]
    async fn unknown_language_rejected() {
        let exec = CodeExecutor::new(Arc::new(FixedSandbox(SandboxResult::default())));
        let err = exec.execute(&node("cobol"), ctx()).await.unwrap_err();
        assert!(matches!(err, WeftError::Validation { .. }));
    }
}
