use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Result, WeftError};
use crate::types::{InstanceId, NodeOutput};
use crate::workflow::ContextMode;

/// One frame of the loop stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopContext {
    pub loop_node_id: String,
    pub iterator_variable: String,
    #[serde(default)]
    pub index_variable: Option<String>,
    pub current_index: u64,
    /// Unknown for while loops until they finish.
    #[serde(default)]
    pub total_items: Option<u64>,
    pub collection_data: Value,
    /// Outputs of body nodes for the running iteration.
    #[serde(default)]
    pub iteration_outputs: HashMap<String, NodeOutput>,
}

impl LoopContext {
    pub fn new(
        loop_node_id: impl Into<String>,
        iterator_variable: impl Into<String>,
        index_variable: Option<String>,
        total_items: Option<u64>,
        collection_data: Value,
    ) -> Self {
        Self {
            loop_node_id: loop_node_id.into(),
            iterator_variable: iterator_variable.into(),
            index_variable,
            current_index: 0,
            total_items,
            collection_data,
            iteration_outputs: HashMap::new(),
        }
    }

    /// The element bound to the iterator for the current index.
    pub fn current_item(&self) -> Value {
        match &self.collection_data {
            Value::Array(items) => items
                .get(self.current_index as usize)
                .cloned()
                .unwrap_or(Value::Null),
            _ => json!(self.current_index),
        }
    }
}

/// Mutable state of one workflow run. Only the engine writes to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub instance_id: String,
    pub workflow_id: String,
    pub project_folder: PathBuf,
    /// Flat namespace; later writes overwrite.
    pub variables: Map<String, Value>,
    node_outputs: HashMap<String, NodeOutput>,
    loop_stack: Vec<LoopContext>,
    completed_nodes: Vec<String>,
    #[serde(default)]
    pub current_node_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, project_folder: impl Into<PathBuf>) -> Self {
        Self {
            instance_id: InstanceId::new().to_string(),
            workflow_id: workflow_id.into(),
            project_folder: project_folder.into(),
            variables: Map::new(),
            node_outputs: HashMap::new(),
            loop_stack: Vec::new(),
            completed_nodes: Vec::new(),
            current_node_id: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.merge_variables(variables);
        self
    }

    pub fn project_folder(&self) -> &Path {
        &self.project_folder
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Additive merge: keys not present in `incoming` are left untouched.
    pub fn merge_variables(&mut self, incoming: Map<String, Value>) {
        for (k, v) in incoming {
            self.variables.insert(k, v);
        }
    }

    /// Record a finished node.
    ///
    /// Inside a loop the output goes to the innermost frame and is replaced on
    /// the next iteration; at top level entries are write-once.
    pub fn record_output(&mut self, output: NodeOutput) -> Result<()> {
        if let Some(frame) = self.loop_stack.last_mut() {
            frame
                .iteration_outputs
                .insert(output.node_id.clone(), output);
            return Ok(());
        }
        if self.node_outputs.contains_key(&output.node_id) {
            return Err(WeftError::DuplicateNode(output.node_id));
        }
        self.completed_nodes.push(output.node_id.clone());
        self.node_outputs.insert(output.node_id.clone(), output);
        Ok(())
    }

    /// Look up a node output, innermost loop iteration first.
    pub fn node_output(&self, node_id: &str) -> Option<&NodeOutput> {
        self.loop_stack
            .iter()
            .rev()
            .find_map(|frame| frame.iteration_outputs.get(node_id))
            .or_else(|| self.node_outputs.get(node_id))
    }

    pub fn node_outputs(&self) -> &HashMap<String, NodeOutput> {
        &self.node_outputs
    }

    pub fn completed_nodes(&self) -> &[String] {
        &self.completed_nodes
    }

    pub fn push_loop(&mut self, frame: LoopContext) {
        self.loop_stack.push(frame);
    }

    pub fn pop_loop(&mut self) -> Option<LoopContext> {
        self.loop_stack.pop()
    }

    pub fn loop_depth(&self) -> usize {
        self.loop_stack.len()
    }

    pub fn current_loop(&self) -> Option<&LoopContext> {
        self.loop_stack.last()
    }

    pub fn current_loop_mut(&mut self) -> Option<&mut LoopContext> {
        self.loop_stack.last_mut()
    }

    pub fn loop_stack(&self) -> &[LoopContext] {
        &self.loop_stack
    }

    /// JSON view used for path expressions and templates.
    pub fn scope(&self) -> Value {
        let mut outputs = Map::new();
        for (id, out) in &self.node_outputs {
            outputs.insert(id.clone(), output_value(out));
        }
        for frame in &self.loop_stack {
            for (id, out) in &frame.iteration_outputs {
                outputs.insert(id.clone(), output_value(out));
            }
        }

        let current_loop = match self.loop_stack.last() {
            Some(frame) => json!({
                "nodeId": frame.loop_node_id,
                "index": frame.current_index,
                "total": frame.total_items,
                "item": frame.current_item(),
                "depth": self.loop_stack.len(),
            }),
            None => Value::Null,
        };

        json!({
            "instanceId": self.instance_id,
            "workflowId": self.workflow_id,
            "projectFolder": self.project_folder.to_string_lossy(),
            "variables": Value::Object(self.variables.clone()),
            "nodeOutputs": Value::Object(outputs),
            "completedNodes": self.completed_nodes,
            "loop": current_loop,
        })
    }
}

fn output_value(out: &NodeOutput) -> Value {
    serde_json::to_value(out).unwrap_or(Value::Null)
}

/// Read-only context handed to a node executor.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub instance_id: String,
    pub workflow_id: String,
    pub node_id: String,
    pub project_folder: PathBuf,
    pub mode: ContextMode,
    /// Same shape as [`ExecutionContext::scope`]; in advanced mode `variables`
    /// holds only the mapped inputs and `nodeOutputs` is empty.
    pub scope: Value,
}

impl NodeContext {
    pub fn variables(&self) -> Option<&Map<String, Value>> {
        self.scope.get("variables").and_then(|v| v.as_object())
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables().and_then(|vars| vars.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_outputs_are_write_once() {
        let mut ctx = ExecutionContext::new("wf", "/tmp/project");
        ctx.record_output(NodeOutput::success("n1", "One", json!(1)))
            .unwrap();
        let err = ctx
            .record_output(NodeOutput::success("n1", "One again", json!(2)))
            .unwrap_err();
        assert!(matches!(err, WeftError::DuplicateNode(id) if id == "n1"));
        assert_eq!(ctx.node_output("n1").unwrap().output, json!(1));
        assert_eq!(ctx.completed_nodes(), &["n1".to_string()]);
    }

    #[test]
    fn loop_outputs_shadow_and_stay_in_frame() {
        let mut ctx = ExecutionContext::new("wf", "/tmp/project");
        ctx.push_loop(LoopContext::new("l1", "item", None, Some(2), json!([1, 2])));
        ctx.record_output(NodeOutput::success("body", "Body", json!("a")))
            .unwrap();
        ctx.record_output(NodeOutput::success("body", "Body", json!("b")))
            .unwrap();
        assert_eq!(ctx.node_output("body").unwrap().output, json!("b"));
        assert_eq!(ctx.scope()["nodeOutputs"]["body"]["output"], json!("b"));

        let frame = ctx.pop_loop().unwrap();
        assert_eq!(frame.iteration_outputs.len(), 1);
        assert!(ctx.node_output("body").is_none());
        assert!(ctx.completed_nodes().is_empty());
    }

    #[test]
    fn merge_is_additive() {
        let mut ctx = ExecutionContext::new("wf", "/tmp");
        ctx.set_variable("keep", json!(true));
        let mut incoming = Map::new();
        incoming.insert("new".into(), json!(1));
        ctx.merge_variables(incoming);
        assert_eq!(ctx.variable("keep"), Some(&json!(true)));
        assert_eq!(ctx.variable("new"), Some(&json!(1)));
    }

    #[test]
    fn scope_exposes_loop_item() {
        let mut ctx = ExecutionContext::new("wf", "/tmp");
        let mut frame = LoopContext::new("l1", "file", None, Some(2), json!(["a.txt", "b.txt"]));
        frame.current_index = 1;
        ctx.push_loop(frame);
        let scope = ctx.scope();
        assert_eq!(scope["loop"]["item"], json!("b.txt"));
        assert_eq!(scope["loop"]["index"], json!(1));
        assert_eq!(scope["loop"]["depth"], json!(1));
    }
}
