use futures::future::BoxFuture;
use serde_json::{json, Value};

use weft_core::context::NodeContext;
use weft_core::error::Result;
use weft_core::{NodeKind, NodeResult, WorkflowNode};

use super::{kind_mismatch, NodeExecutor};
use crate::evaluator::condition_in;

/// Evaluates a condition and stores the boolean.
pub struct ConditionalExecutor;

impl NodeExecutor for ConditionalExecutor {
    fn name(&self) -> &str {
        "conditional"
    }

    fn execute<'a>(
        &'a self,
        node: &'a WorkflowNode,
        ctx: NodeContext,
    ) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(async move {
            let NodeKind::Conditional(spec) = &node.kind else {
                return Err(kind_mismatch(node, self.name()));
            };
            let result = condition_in(&spec.condition, &ctx.scope)?;
            let variable = spec
                .result_variable
                .clone()
                .unwrap_or_else(|| "conditionResult".to_string());
            Ok(NodeResult::new(json!({
                "conditionResult": result,
                "branch": if result { "true" } else { "false" },
            }))
            .with_variable(variable, Value::Bool(result)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::error::WeftError;
    use weft_core::{ConditionalNode, ContextMode};

    async fn run(condition: &str, result_variable: Option<&str>) -> Result<NodeResult> {
        let node = WorkflowNode::new(
            "check",
            "Check",
            NodeKind::Conditional(ConditionalNode {
                condition: condition.into(),
                result_variable: result_variable.map(String::from),
            }),
        );
        let ctx = NodeContext {
            instance_id: "run-1".into(),
            workflow_id: "wf".into(),
            node_id: "check".into(),
            project_folder: "/tmp".into(),
            mode: ContextMode::Simple,
            scope: json!({ "variables": { "count": 12 } }),
        };
        ConditionalExecutor.execute(&node, ctx).await
    }

    #[tokio::test]
    async fn sets_default_variable() {
        let result = run("variables.count > 10", None).await.unwrap();
        assert_eq!(result.output["branch"], json!("true"));
        assert_eq!(result.variables["conditionResult"], json!(true));
    }

    #[tokio::test]
    async fn bare_names_read_variables() {
        let result = run("count >= 10", Some("big")).await.unwrap();
        assert_eq!(result.variables["big"], json!(true));
    }

    #[tokio::test]
    async fn malformed_expression_fails() {
        let err = run("count >", None).await.unwrap_err();
        assert!(matches!(err, WeftError::Expression(_)));
        assert!(!err.is_retryable());
    }
}
