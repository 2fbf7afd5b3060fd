use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use weft_core::{InputType, LoopType, NodeKind, WorkflowDefinition, WorkflowNode};

use crate::evaluator::expression;

/// A structural problem found before a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub node_id: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn node(node: &WorkflowNode, message: impl Into<String>) -> Self {
        Self {
            node_id: Some(node.id.clone()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(id) => write!(f, "{}: {}", id, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Check a definition without running it. Loop bodies are checked
/// recursively and share the id namespace with top-level nodes.
pub fn validate_workflow(definition: &WorkflowDefinition) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if definition.nodes.is_empty() {
        issues.push(ValidationIssue {
            node_id: None,
            message: format!("workflow '{}' has no nodes", definition.id),
        });
    }
    let mut seen = HashSet::new();
    check_nodes(&definition.nodes, &mut seen, &mut issues);
    issues
}

fn check_nodes<'a>(
    nodes: &'a [WorkflowNode],
    seen: &mut HashSet<&'a str>,
    issues: &mut Vec<ValidationIssue>,
) {
    for node in nodes {
        if node.id.trim().is_empty() {
            issues.push(ValidationIssue {
                node_id: None,
                message: format!("node '{}' has an empty id", node.name),
            });
        } else if !seen.insert(node.id.as_str()) {
            issues.push(ValidationIssue::node(node, "duplicate node id"));
        }

        check_expression(node, "skipCondition", node.skip_condition.as_deref(), issues);
        for mapping in node
            .context_config
            .inputs
            .iter()
            .chain(&node.context_config.outputs)
        {
            if mapping.target.trim().is_empty() {
                issues.push(ValidationIssue::node(
                    node,
                    format!("mapping from '{}' has an empty target", mapping.source),
                ));
            }
            check_expression(node, "transform", mapping.transform.as_deref(), issues);
        }

        match &node.kind {
            NodeKind::Gate(agent) => match agent.gate_condition.as_deref() {
                Some(condition) if !condition.trim().is_empty() => {
                    check_expression(node, "gateCondition", Some(condition), issues)
                }
                _ => issues.push(ValidationIssue::node(node, "gate node has no gateCondition")),
            },
            NodeKind::Conditional(spec) => {
                check_expression(node, "condition", Some(&spec.condition), issues);
            }
            NodeKind::UserInput(spec) => {
                if let Some(pattern) = &spec.validation.pattern {
                    if let Err(e) = regex::Regex::new(pattern) {
                        issues.push(ValidationIssue::node(
                            node,
                            format!("invalid validation pattern: {}", e),
                        ));
                    }
                }
                if spec.input_type == InputType::Select && spec.validation.options.is_empty() {
                    issues.push(ValidationIssue::node(node, "select input has no options"));
                }
            }
            NodeKind::FileOperation(spec) => {
                use weft_core::FileOperation::{Copy, Move};
                if matches!(spec.operation, Copy | Move) && spec.destination.is_none() {
                    issues.push(ValidationIssue::node(
                        node,
                        format!("{:?} needs a destination", spec.operation),
                    ));
                }
            }
            NodeKind::HttpRequest(spec) => {
                if spec.url.trim().is_empty() {
                    issues.push(ValidationIssue::node(node, "http request has no url"));
                }
            }
            NodeKind::SubWorkflow(spec) => {
                if spec.workflow_id.trim().is_empty() {
                    issues.push(ValidationIssue::node(node, "sub-workflow has no workflowId"));
                }
            }
            NodeKind::Loop(spec) => {
                if spec.body.is_empty() {
                    issues.push(ValidationIssue::node(node, "loop body is empty"));
                }
                if node.retry_config.as_ref().is_some_and(|r| r.max_retries > 0) {
                    issues.push(ValidationIssue::node(
                        node,
                        "loop nodes are not retried; retryConfig is not allowed",
                    ));
                }
                if spec.max_iterations == 0 {
                    issues.push(ValidationIssue::node(node, "maxIterations must be positive"));
                }
                match spec.loop_type {
                    LoopType::ForEach if spec.collection.is_none() => {
                        issues.push(ValidationIssue::node(node, "forEach loop needs a collection"));
                    }
                    LoopType::Count if spec.count.is_none() => {
                        issues.push(ValidationIssue::node(node, "count loop needs a count"));
                    }
                    LoopType::While => match &spec.while_condition {
                        Some(condition) => {
                            check_expression(node, "whileCondition", Some(condition), issues)
                        }
                        None => {
                            issues.push(ValidationIssue::node(node, "while loop needs a whileCondition"))
                        }
                    },
                    _ => {}
                }
                check_nodes(&spec.body, seen, issues);
            }
            NodeKind::Planning(_) | NodeKind::Writing(_) | NodeKind::CodeExecution(_) => {}
        }
    }
}

fn check_expression(
    node: &WorkflowNode,
    field: &str,
    expr: Option<&str>,
    issues: &mut Vec<ValidationIssue>,
) {
    if let Some(expr) = expr {
        if let Err(e) = expression::parse(expr) {
            issues.push(ValidationIssue::node(node, format!("{}: {}", field, e)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{AgentNode, ConditionalNode, LoopNode, RetryConfig};

    fn check(id: &str, condition: &str) -> WorkflowNode {
        WorkflowNode::new(
            id,
            id,
            NodeKind::Conditional(ConditionalNode {
                condition: condition.into(),
                result_variable: None,
            }),
        )
    }

    #[test]
    fn clean_definition_has_no_issues() {
        let def = WorkflowDefinition::new(
            "wf",
            "Clean",
            vec![
                check("a", "variables.ready == true"),
                WorkflowNode::new(
                    "each",
                    "Each",
                    NodeKind::Loop(LoopNode::for_each("variables.items", vec![check("b", "item")])),
                ),
            ],
        );
        assert!(validate_workflow(&def).is_empty());
    }

    #[test]
    fn duplicate_ids_across_loop_bodies() {
        let def = WorkflowDefinition::new(
            "wf",
            "Dup",
            vec![
                check("a", "true"),
                WorkflowNode::new(
                    "each",
                    "Each",
                    NodeKind::Loop(LoopNode::count(2, vec![check("a", "true")])),
                ),
            ],
        );
        let issues = validate_workflow(&def);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].to_string(), "a: duplicate node id");
    }

    #[test]
    fn malformed_expressions_are_reported() {
        let def = WorkflowDefinition::new(
            "wf",
            "Bad",
            vec![check("a", "x >").with_skip_condition("(y")],
        );
        let issues = validate_workflow(&def);
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().any(|i| i.message.starts_with("skipCondition")));
        assert!(issues.iter().any(|i| i.message.starts_with("condition")));
    }

    #[test]
    fn loop_shape_problems() {
        let mut spec = LoopNode::while_loop("i <", vec![]);
        spec.max_iterations = 0;
        let def = WorkflowDefinition::new(
            "wf",
            "Loop",
            vec![WorkflowNode::new("l", "L", NodeKind::Loop(spec))],
        );
        let messages: Vec<_> = validate_workflow(&def).into_iter().map(|i| i.message).collect();
        assert!(messages.contains(&"loop body is empty".to_string()));
        assert!(messages.contains(&"maxIterations must be positive".to_string()));
        assert!(messages.iter().any(|m| m.starts_with("whileCondition")));
    }

    #[test]
    fn gate_without_condition_is_reported() {
        let def = WorkflowDefinition::new(
            "wf",
            "Gate",
            vec![
                WorkflowNode::new("g", "G", NodeKind::Gate(AgentNode::new("Score it"))),
                WorkflowNode::new(
                    "ok",
                    "Ok",
                    NodeKind::Gate(AgentNode::new("Score it").with_gate("output.score > 1")),
                ),
            ],
        );
        let issues = validate_workflow(&def);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].to_string(), "g: gate node has no gateCondition");
    }

    #[test]
    fn retried_loop_is_reported() {
        let body = vec![check("b", "true")];
        let def = WorkflowDefinition::new(
            "wf",
            "Loop",
            vec![
                WorkflowNode::new("l", "L", NodeKind::Loop(LoopNode::count(2, body)))
                    .with_retry(RetryConfig::new(2, 100, 2.0))
                    .with_timeout_ms(1_000),
            ],
        );
        let issues = validate_workflow(&def);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("retryConfig"));
    }

    #[test]
    fn empty_workflow() {
        let def = WorkflowDefinition::new("wf", "Empty", vec![]);
        let issues = validate_workflow(&def);
        assert_eq!(issues[0].node_id, None);
    }
}
