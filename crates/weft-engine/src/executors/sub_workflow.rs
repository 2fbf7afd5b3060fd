use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::{info, warn};

use weft_core::context::NodeContext;
use weft_core::error::{Result, WeftError};
use weft_core::traits::WorkflowService;
use weft_core::types::SubWorkflowRequest;
use weft_core::{NodeKind, NodeResult, WorkflowNode};

use super::{kind_mismatch, NodeExecutor};
use crate::evaluator::template::{lone_placeholder, render};

/// Starts a nested run through the workflow service and returns its handle.
pub struct SubWorkflowExecutor {
    workflows: Arc<dyn WorkflowService>,
}

impl SubWorkflowExecutor {
    pub fn new(workflows: Arc<dyn WorkflowService>) -> Self {
        Self { workflows }
    }
}

impl NodeExecutor for SubWorkflowExecutor {
    fn name(&self) -> &str {
        "sub_workflow"
    }

    fn execute<'a>(
        &'a self,
        node: &'a WorkflowNode,
        ctx: NodeContext,
    ) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(async move {
            let NodeKind::SubWorkflow(spec) = &node.kind else {
                return Err(kind_mismatch(node, self.name()));
            };

            let definition = self
                .workflows
                .get_definition(&spec.workflow_id, spec.version)
                .await?
                .ok_or_else(|| {
                    WeftError::WorkflowNotFound(match spec.version {
                        Some(v) => format!("{} (version {})", spec.workflow_id, v),
                        None => spec.workflow_id.clone(),
                    })
                })?;

            let mut inputs = Map::new();
            for (name, template) in &spec.inputs {
                let value = match lone_placeholder(template, &ctx.scope) {
                    Some(Some(value)) => value,
                    Some(None) => {
                        warn!(node_id = %node.id, input = %name, "Sub-workflow input did not resolve");
                        Value::String(template.clone())
                    }
                    None => Value::String(render(template, &ctx.scope).text),
                };
                inputs.insert(name.clone(), value);
            }

            let handle = self
                .workflows
                .start_sub_workflow(SubWorkflowRequest {
                    workflow_id: definition.id.clone(),
                    version: Some(definition.version),
                    parent_instance_id: ctx.instance_id.clone(),
                    parent_node_id: node.id.clone(),
                    project_folder: ctx.project_folder.display().to_string(),
                    inputs,
                })
                .await?;

            info!(
                node_id = %node.id,
                child = %handle.instance_id,
                workflow_id = %handle.workflow_id,
                version = handle.version,
                "Sub-workflow started"
            );
            Ok(NodeResult::new(serde_json::to_value(&handle)?))
        })
    }
}
