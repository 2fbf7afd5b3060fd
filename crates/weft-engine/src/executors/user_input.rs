use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use weft_core::context::NodeContext;
use weft_core::error::{Result, WeftError};
use weft_core::traits::UserInputProvider;
use weft_core::types::InputRequest;
use weft_core::{InputType, InputValidation, NodeKind, NodeResult, UserInputNode, WorkflowNode};

use super::{kind_mismatch, NodeExecutor};
use crate::evaluator::expression::stringify;
use crate::evaluator::substitute_in;

/// Asks the user-input provider, falling back to the node's default value.
pub struct UserInputExecutor {
    provider: Option<Arc<dyn UserInputProvider>>,
}

impl UserInputExecutor {
    pub fn new(provider: Option<Arc<dyn UserInputProvider>>) -> Self {
        Self { provider }
    }
}

impl NodeExecutor for UserInputExecutor {
    fn name(&self) -> &str {
        "user_input"
    }

    fn execute<'a>(
        &'a self,
        node: &'a WorkflowNode,
        ctx: NodeContext,
    ) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(async move {
            let NodeKind::UserInput(spec) = &node.kind else {
                return Err(kind_mismatch(node, self.name()));
            };
            let invalid = |message: String| WeftError::Validation {
                node: node.id.clone(),
                message,
            };

            let answer = match &self.provider {
                Some(provider) => {
                    provider
                        .request_input(InputRequest {
                            instance_id: ctx.instance_id.clone(),
                            node_id: node.id.clone(),
                            prompt: substitute_in(&spec.prompt, &ctx.scope).text,
                            input_type: spec.input_type,
                            required: spec.required,
                            default_value: spec.default_value.clone(),
                            validation: spec.validation.clone(),
                        })
                        .await?
                }
                None => None,
            };

            let value = match answer.filter(|v| !is_blank(v)) {
                Some(v) => v,
                None => match &spec.default_value {
                    Some(default) => default.clone(),
                    None if spec.required => {
                        return Err(invalid("required input was not provided".into()))
                    }
                    None => Value::Null,
                },
            };

            let value = if value.is_null() {
                value
            } else {
                check(spec, value).map_err(invalid)?
            };

            let variable = spec.variable.clone().unwrap_or_else(|| node.id.clone());
            Ok(NodeResult::new(json!({ "value": value })).with_variable(variable, value))
        })
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Coerce to the declared input type, then apply validation rules.
fn check(spec: &UserInputNode, value: Value) -> std::result::Result<Value, String> {
    let value = coerce(spec.input_type, value)?;
    validate(&spec.validation, &value)?;
    Ok(value)
}

fn coerce(input_type: InputType, value: Value) -> std::result::Result<Value, String> {
    match input_type {
        InputType::Text | InputType::Select => Ok(Value::String(stringify(&value))),
        InputType::Number => match &value {
            Value::Number(_) => Ok(value),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|n| {
                    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                        Some(json!(n as i64))
                    } else {
                        serde_json::Number::from_f64(n).map(Value::Number)
                    }
                })
                .ok_or_else(|| format!("'{}' is not a number", s)),
            other => Err(format!("expected a number, got {}", other)),
        },
        InputType::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                _ => Err(format!("'{}' is not a yes/no answer", s)),
            },
            Value::Number(n) => Ok(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
            other => Err(format!("expected a boolean, got {}", other)),
        },
    }
}

fn validate(rules: &InputValidation, value: &Value) -> std::result::Result<(), String> {
    match value {
        Value::String(s) => {
            let len = s.chars().count();
            if let Some(min) = rules.min_length {
                if len < min {
                    return Err(format!("must be at least {} characters", min));
                }
            }
            if let Some(max) = rules.max_length {
                if len > max {
                    return Err(format!("must be at most {} characters", max));
                }
            }
            if let Some(pattern) = &rules.pattern {
                let re = regex::Regex::new(pattern)
                    .map_err(|e| format!("invalid validation pattern: {}", e))?;
                if !re.is_match(s) {
                    return Err(format!("'{}' does not match {}", s, pattern));
                }
            }
            if !rules.options.is_empty() && !rules.options.iter().any(|o| o == s) {
                return Err(format!(
                    "'{}' is not one of: {}",
                    s,
                    rules.options.join(", ")
                ));
            }
        }
        Value::Number(n) => {
            let n = n.as_f64().unwrap_or(f64::NAN);
            if let Some(min) = rules.min {
                if n < min {
                    return Err(format!("must be >= {}", min));
                }
            }
            if let Some(max) = rules.max {
                if n > max {
                    return Err(format!("must be <= {}", max));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use weft_core::ContextMode;

    struct Answer(Option<Value>);

    impl UserInputProvider for Answer {
        fn request_input(&self, _request: InputRequest) -> BoxFuture<'_, Result<Option<Value>>> {
            let answer = self.0.clone();
            Box::pin(async move { Ok(answer) })
        }
    }

    fn ctx() -> NodeContext {
        NodeContext {
            instance_id: "run-1".into(),
            workflow_id: "wf".into(),
            node_id: "ask".into(),
            project_folder: PathBuf::from("/tmp"),
            mode: ContextMode::Simple,
            scope: json!({ "variables": {} }),
        }
    }

    fn node(spec: UserInputNode) -> WorkflowNode {
        WorkflowNode::new("ask", "Ask", NodeKind::UserInput(spec))
    }

    fn spec(input_type: InputType) -> UserInputNode {
        UserInputNode {
            prompt: "Value?".into(),
            input_type,
            required: true,
            default_value: None,
            validation: InputValidation::default(),
            variable: Some("answer".into()),
        }
    }

    #[tokio::test]
    async fn default_used_without_answer() {
        let mut s = spec(InputType::Text);
        s.default_value = Some(json!("fallback"));
        let exec = UserInputExecutor::new(Some(Arc::new(Answer(None))));
        let result = exec.execute(&node(s), ctx()).await.unwrap();
        assert_eq!(result.output, json!({ "value": "fallback" }));
        assert_eq!(result.variables["answer"], json!("fallback"));
    }

    #[tokio::test]
    async fn required_without_default_fails() {
        let exec = UserInputExecutor::new(None);
        let err = exec.execute(&node(spec(InputType::Text)), ctx()).await.unwrap_err();
        assert!(matches!(err, WeftError::Validation { .. }));
    }

    #[tokio::test]
    async fn optional_without_answer_is_null() {
        let mut s = spec(InputType::Text);
        s.required = false;
        s.variable = None;
        let exec = UserInputExecutor::new(None);
        let result = exec.execute(&node(s), ctx()).await.unwrap();
        assert_eq!(result.variables["ask"], Value::Null);
    }

    #[tokio::test]
    async fn number_is_coerced_and_bounded() {
        let mut s = spec(InputType::Number);
        s.validation.min = Some(1.0);
        s.validation.max = Some(10.0);
        let exec = UserInputExecutor::new(Some(Arc::new(Answer(Some(json!("7"))))));
        let result = exec.execute(&node(s.clone()), ctx()).await.unwrap();
        assert_eq!(result.variables["answer"], json!(7));

        let exec = UserInputExecutor::new(Some(Arc::new(Answer(Some(json!("42"))))));
        assert!(exec.execute(&node(s), ctx()).await.is_err());
    }

    #[tokio::test]
    async fn pattern_and_options() {
        let mut s = spec(InputType::Text);
        s.validation.pattern = Some(r"^[a-z]+$".into());
        let exec = UserInputExecutor::new(Some(Arc::new(Answer(Some(json!("Hello"))))));
        assert!(exec.execute(&node(s), ctx()).await.is_err());

        let mut s = spec(InputType::Select);
        s.validation.options = vec!["draft".into(), "final".into()];
        let exec = UserInputExecutor::new(Some(Arc::new(Answer(Some(json!("final"))))));
        assert!(exec.execute(&node(s), ctx()).await.is_ok());
    }

    #[test]
    fn boolean_answers() {
        assert_eq!(coerce(InputType::Boolean, json!("Yes")).unwrap(), json!(true));
        assert_eq!(coerce(InputType::Boolean, json!(0)).unwrap(), json!(false));
        assert!(coerce(InputType::Boolean, json!("maybe")).is_err());
    }
}
