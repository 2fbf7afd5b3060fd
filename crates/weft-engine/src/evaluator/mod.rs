//! Context evaluation: path lookup, template substitution, conditions, and
//! the input/output mappings that move data between a run and its nodes.

pub mod expression;
pub mod template;

use serde_json::{json, Map, Value};
use tracing::warn;

use weft_core::context::NodeContext;
use weft_core::error::Result;
use weft_core::{ContextMapping, ContextMode, ExecutionContext, NodeOutput, WorkflowNode};

pub use expression::{parse, truthy, Expr};
pub use template::Rendered;

/// Resolve a path expression against the run. Missing paths are `None`.
pub fn evaluate(expr: &str, ctx: &ExecutionContext) -> Option<Value> {
    template::lookup(expr, &ctx.scope())
}

/// Replace `{{...}}` placeholders from the run. Unresolved placeholders are
/// left in place and logged.
pub fn substitute(template: &str, ctx: &ExecutionContext) -> Rendered {
    substitute_in(template, &ctx.scope())
}

pub fn substitute_in(text: &str, scope: &Value) -> Rendered {
    let rendered = template::render(text, scope);
    for name in &rendered.unresolved {
        warn!(placeholder = %name, "Unresolved template placeholder");
    }
    rendered
}

/// Evaluate a boolean condition against the run.
pub fn evaluate_condition(expr: &str, ctx: &ExecutionContext) -> Result<bool> {
    condition_in(expr, &ctx.scope())
}

pub fn condition_in(expr: &str, scope: &Value) -> Result<bool> {
    let parsed = parse(expr)?;
    Ok(truthy(parsed.eval(scope).as_ref()))
}

/// `scope` with an extra top-level key.
pub fn scope_with(scope: &Value, key: &str, value: Value) -> Value {
    let mut scope = scope.clone();
    if let Value::Object(map) = &mut scope {
        map.insert(key.to_string(), value);
    }
    scope
}

/// Outcome of [`build_node_context`].
#[derive(Debug, Clone)]
pub struct ContextBuild {
    pub success: bool,
    pub context: Option<NodeContext>,
    pub error: Option<String>,
    pub missing_variables: Vec<String>,
}

impl ContextBuild {
    fn ok(context: NodeContext) -> Self {
        Self {
            success: true,
            context: Some(context),
            error: None,
            missing_variables: Vec::new(),
        }
    }

    fn failed(error: String, missing_variables: Vec<String>) -> Self {
        Self {
            success: false,
            context: None,
            error: Some(error),
            missing_variables,
        }
    }
}

/// Build the read-only context handed to a node's executor.
///
/// Simple mode exposes the whole run. Advanced mode exposes only the mapped
/// inputs and fails the build when a required source does not resolve.
pub fn build_node_context(node: &WorkflowNode, ctx: &ExecutionContext) -> ContextBuild {
    let scope = ctx.scope();
    let base = NodeContext {
        instance_id: ctx.instance_id.clone(),
        workflow_id: ctx.workflow_id.clone(),
        node_id: node.id.clone(),
        project_folder: ctx.project_folder.clone(),
        mode: node.context_config.mode,
        scope: Value::Null,
    };

    if node.context_config.mode == ContextMode::Simple {
        return ContextBuild::ok(NodeContext { scope, ..base });
    }

    let mut inputs = Value::Object(Map::new());
    let mut missing = Vec::new();
    for mapping in &node.context_config.inputs {
        match apply_mapping(mapping, &scope) {
            Ok(Some(value)) => set_path(&mut inputs, &mapping.target, value),
            Ok(None) if mapping.required => missing.push(mapping.source.clone()),
            Ok(None) => {}
            Err(e) => {
                return ContextBuild::failed(
                    format!("transform for '{}' failed: {}", mapping.target, e),
                    missing,
                )
            }
        }
    }

    if !missing.is_empty() {
        return ContextBuild::failed(
            format!("missing required inputs: {}", missing.join(", ")),
            missing,
        );
    }

    let mut scope = scope_with(&scope, "variables", inputs);
    if let Value::Object(map) = &mut scope {
        map.insert("nodeOutputs".into(), json!({}));
    }
    ContextBuild::ok(NodeContext { scope, ..base })
}

/// Outcome of [`extract_outputs`].
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// `false` when a required output mapping did not resolve.
    pub success: bool,
    pub variables: Map<String, Value>,
    pub warnings: Vec<String>,
}

/// Merge a node's produced variables into the run.
///
/// Never removes variables the node did not target.
pub fn extract_outputs(
    node: &WorkflowNode,
    output: &NodeOutput,
    ctx: &mut ExecutionContext,
) -> Extraction {
    let mut extraction = Extraction {
        success: true,
        ..Default::default()
    };

    match node.context_config.mode {
        ContextMode::Simple => {
            if let Some(vars) = output.output.get("variables").and_then(|v| v.as_object()) {
                extraction.variables.extend(vars.clone());
            }
            extraction.variables.extend(output.variables.clone());
        }
        ContextMode::Advanced => {
            let scope = scope_with(&ctx.scope(), "output", output.output.clone());
            let scope = scope_with(&scope, "nodeVariables", Value::Object(output.variables.clone()));
            let mut produced = Value::Object(Map::new());
            for mapping in &node.context_config.outputs {
                match apply_mapping(mapping, &scope) {
                    Ok(Some(value)) => set_path(&mut produced, &mapping.target, value),
                    Ok(None) => {
                        if mapping.required {
                            extraction.success = false;
                        }
                        extraction.warnings.push(format!(
                            "Output mapping '{}' -> '{}' did not resolve",
                            mapping.source, mapping.target
                        ));
                    }
                    Err(e) => {
                        extraction.success = false;
                        extraction.warnings.push(format!(
                            "Output transform for '{}' failed: {}",
                            mapping.target, e
                        ));
                    }
                }
            }
            if let Value::Object(map) = produced {
                extraction.variables = map;
            }
        }
    }

    ctx.merge_variables(extraction.variables.clone());
    extraction
}

/// Resolve a mapping source and apply its transform.
fn apply_mapping(mapping: &ContextMapping, scope: &Value) -> Result<Option<Value>> {
    let Some(value) = resolve_source(&mapping.source, scope) else {
        return Ok(None);
    };
    match &mapping.transform {
        Some(transform) => {
            let parsed = parse(transform)?;
            Ok(parsed.eval(&scope_with(scope, "value", value)))
        }
        None => Ok(Some(value)),
    }
}

/// A source is either a template (when it contains `{{`) or a path.
pub fn resolve_source(source: &str, scope: &Value) -> Option<Value> {
    if !template::has_placeholders(source) {
        return template::lookup(source, scope);
    }
    if let Some(raw) = template::lone_placeholder(source, scope) {
        return raw;
    }
    let rendered = template::render(source, scope);
    if rendered.unresolved.is_empty() {
        Some(Value::String(rendered.text))
    } else {
        None
    }
}

/// Insert `value` at a dot-separated `path`, creating objects on the way.
fn set_path(root: &mut Value, path: &str, value: Value) {
    let mut current = root;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{AgentNode, ContextConfig, NodeKind};

    fn run() -> ExecutionContext {
        let mut ctx = ExecutionContext::new("wf", "/tmp/project");
        ctx.set_variable("user", json!({ "name": "Ada", "tier": "pro" }));
        ctx.set_variable("topic", json!("compilers"));
        ctx.record_output(NodeOutput::success(
            "research",
            "Research",
            json!({ "summary": "  Lexers and parsers  ", "score": 91 }),
        ))
        .unwrap();
        ctx
    }

    fn node(config: ContextConfig) -> WorkflowNode {
        WorkflowNode::new("n1", "Write", NodeKind::Writing(AgentNode::new("Write about {{topic}}")))
            .with_context(config)
    }

    #[test]
    fn evaluate_and_substitute() {
        let ctx = run();
        assert_eq!(evaluate("variables.user.name", &ctx), Some(json!("Ada")));
        assert_eq!(evaluate("nodeOutputs.research.output.score", &ctx), Some(json!(91)));
        assert_eq!(evaluate("variables.nothing.here", &ctx), None);
        assert_eq!(substitute("On {{topic}} for {{user.name}}", &ctx).text, "On compilers for Ada");
        assert!(evaluate_condition("nodeOutputs.research.output.score >= 80", &ctx).unwrap());
        assert!(!evaluate_condition("variables.user.tier == 'free'", &ctx).unwrap());
        assert!(evaluate_condition("variables.user.tier ==", &ctx).is_err());
    }

    #[test]
    fn simple_mode_sees_everything() {
        let ctx = run();
        let built = build_node_context(&node(ContextConfig::default()), &ctx);
        assert!(built.success);
        let nc = built.context.unwrap();
        assert_eq!(nc.variable("topic"), Some(&json!("compilers")));
        assert_eq!(nc.scope["nodeOutputs"]["research"]["output"]["score"], json!(91));
    }

    #[test]
    fn advanced_mode_maps_inputs() {
        let ctx = run();
        let config = ContextConfig::advanced(
            vec![
                ContextMapping::new("nodeOutputs.research.output.summary", "summary")
                    .with_transform("trim(value)"),
                ContextMapping::new("user.name", "author.name"),
                ContextMapping::new("Topic: {{topic}}", "heading"),
                ContextMapping::new("variables.optional", "opt").optional(),
            ],
            vec![],
        );
        let built = build_node_context(&node(config), &ctx);
        assert!(built.success, "{:?}", built.error);
        let nc = built.context.unwrap();
        assert_eq!(nc.variable("summary"), Some(&json!("Lexers and parsers")));
        assert_eq!(nc.variable("author"), Some(&json!({ "name": "Ada" })));
        assert_eq!(nc.variable("heading"), Some(&json!("Topic: compilers")));
        assert!(nc.variable("opt").is_none());
        assert!(nc.variable("topic").is_none());
        assert_eq!(nc.scope["nodeOutputs"], json!({}));
    }

    #[test]
    fn advanced_mode_reports_missing_required() {
        let ctx = run();
        let config = ContextConfig::advanced(
            vec![
                ContextMapping::new("variables.apiKey", "key"),
                ContextMapping::new("{{ region }}", "region"),
            ],
            vec![],
        );
        let built = build_node_context(&node(config), &ctx);
        assert!(!built.success);
        assert!(built.context.is_none());
        assert_eq!(built.missing_variables, vec!["variables.apiKey", "{{ region }}"]);
    }

    #[test]
    fn simple_extraction_is_additive() {
        let mut ctx = run();
        let mut out = NodeOutput::success("n1", "Write", json!({ "variables": { "draft": "v1" } }));
        out.variables.insert("words".into(), json!(120));
        let ex = extract_outputs(&node(ContextConfig::default()), &out, &mut ctx);
        assert!(ex.success);
        assert_eq!(ctx.variable("draft"), Some(&json!("v1")));
        assert_eq!(ctx.variable("words"), Some(&json!(120)));
        assert_eq!(ctx.variable("topic"), Some(&json!("compilers")));
    }

    #[test]
    fn advanced_extraction_warns_and_keeps_others() {
        let mut ctx = run();
        let config = ContextConfig::advanced(
            vec![],
            vec![
                ContextMapping::new("output.title", "title").with_transform("upper(value)"),
                ContextMapping::new("output.missing", "gone"),
            ],
        );
        let out = NodeOutput::success("n1", "Write", json!({ "title": "draft" }));
        let ex = extract_outputs(&node(config), &out, &mut ctx);
        assert!(!ex.success);
        assert_eq!(ex.warnings.len(), 1);
        assert_eq!(ctx.variable("title"), Some(&json!("DRAFT")));
        assert!(ctx.variable("gone").is_none());
        assert_eq!(ctx.variable("user").unwrap()["name"], json!("Ada"));
    }
}
