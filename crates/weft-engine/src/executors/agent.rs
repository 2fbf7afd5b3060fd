use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use weft_core::context::NodeContext;
use weft_core::error::{Result, WeftError};
use weft_core::traits::LlmExecutor;
use weft_core::types::PromptRequest;
use weft_core::{NodeKind, NodeResult, WorkflowNode};

use super::{kind_mismatch, NodeExecutor};
use crate::evaluator::{condition_in, scope_with, substitute_in};

/// Planning, writing, and gate nodes: render the prompt, call the model.
pub struct AgentExecutor {
    llm: Arc<dyn LlmExecutor>,
}

impl AgentExecutor {
    pub fn new(llm: Arc<dyn LlmExecutor>) -> Self {
        Self { llm }
    }
}

impl NodeExecutor for AgentExecutor {
    fn name(&self) -> &str {
        "agent"
    }

    fn execute<'a>(
        &'a self,
        node: &'a WorkflowNode,
        ctx: NodeContext,
    ) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(async move {
            let (NodeKind::Planning(agent) | NodeKind::Writing(agent) | NodeKind::Gate(agent)) =
                &node.kind
            else {
                return Err(kind_mismatch(node, self.name()));
            };

            let prompt = substitute_in(&agent.prompt, &ctx.scope).text;
            let system_prompt = agent
                .system_prompt
                .as_ref()
                .map(|s| substitute_in(s, &ctx.scope).text);

            let response = self
                .llm
                .execute_prompt(PromptRequest {
                    provider: agent.provider.clone(),
                    prompt,
                    context: ctx.scope.clone(),
                    system_prompt,
                })
                .await?;

            if !response.success {
                return Err(WeftError::execution(
                    response
                        .error
                        .unwrap_or_else(|| "LLM execution failed".to_string()),
                ));
            }
            if let Some(usage) = &response.usage {
                debug!(
                    node_id = %node.id,
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "LLM call finished"
                );
            }

            let output = structured_output(response.output);

            if let NodeKind::Gate(_) = &node.kind {
                let condition = agent.gate_condition.as_deref().ok_or_else(|| {
                    WeftError::Validation {
                        node: node.id.clone(),
                        message: "gate node has no gateCondition".into(),
                    }
                })?;
                let scope = scope_with(&ctx.scope, "output", output.clone());
                if !condition_in(condition, &scope)? {
                    return Err(WeftError::GateFailure {
                        condition: condition.to_string(),
                    });
                }
            }

            Ok(NodeResult::new(output))
        })
    }
}

/// Models often answer with JSON inside a string, sometimes fenced.
fn structured_output(output: Value) -> Value {
    let Value::String(text) = &output else {
        return output;
    };
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);
    match serde_json::from_str::<Value>(unfenced) {
        Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
        _ => output,
    }
}
