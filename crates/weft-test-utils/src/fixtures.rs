use std::path::Path;

use serde_json::{Map, Value};

use weft_core::{
    AgentNode, ConditionalNode, ExecutionContext, NodeKind, SubWorkflowNode, WorkflowDefinition,
    WorkflowNode,
};

pub fn conditional(id: &str, condition: &str) -> WorkflowNode {
    WorkflowNode::new(
        id,
        id,
        NodeKind::Conditional(ConditionalNode {
            condition: condition.into(),
            result_variable: None,
        }),
    )
}

pub fn planning(id: &str, prompt: &str) -> WorkflowNode {
    WorkflowNode::new(id, id, NodeKind::Planning(AgentNode::new(prompt)))
}

pub fn writing(id: &str, prompt: &str) -> WorkflowNode {
    WorkflowNode::new(id, id, NodeKind::Writing(AgentNode::new(prompt)))
}

pub fn gate(id: &str, prompt: &str, condition: &str) -> WorkflowNode {
    WorkflowNode::new(
        id,
        id,
        NodeKind::Gate(AgentNode::new(prompt).with_gate(condition)),
    )
}

pub fn sub_workflow(id: &str, workflow_id: &str, inputs: &[(&str, &str)]) -> WorkflowNode {
    WorkflowNode::new(
        id,
        id,
        NodeKind::SubWorkflow(SubWorkflowNode {
            workflow_id: workflow_id.into(),
            version: None,
            inputs: inputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }),
    )
}

pub fn workflow(id: &str, nodes: Vec<WorkflowNode>) -> WorkflowDefinition {
    WorkflowDefinition::new(id, id, nodes)
}

/// Fresh context for `definition` rooted at `project`, with a fixed instance id.
pub fn context_for(definition: &WorkflowDefinition, project: &Path) -> ExecutionContext {
    ExecutionContext::new(&definition.id, project).with_instance_id(format!("{}-run", definition.id))
}

pub fn vars(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
