use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::{ExecutionContext, LoopContext, LoopNode, LoopType, WorkflowNode};

use crate::engine::WorkflowEngine;
use crate::evaluator;

/// What a loop iterates over, resolved before the first iteration.
struct Plan {
    total: Option<u64>,
    collection: Value,
}

fn exceeded(node: &WorkflowNode, cap: u64) -> WeftError {
    WeftError::execution(format!("Loop {} exceeded maxIterations ({})", node.id, cap))
}

fn plan(node: &WorkflowNode, spec: &LoopNode, ctx: &ExecutionContext) -> Result<Plan> {
    let invalid = |message: &str| WeftError::Validation {
        node: node.id.clone(),
        message: message.to_string(),
    };
    match spec.loop_type {
        LoopType::ForEach => {
            let source = spec
                .collection
                .as_deref()
                .ok_or_else(|| invalid("forEach loop needs a collection"))?;
            let items = match evaluator::resolve_source(source, &ctx.scope()) {
                Some(Value::Array(items)) => items,
                Some(Value::String(text)) => match serde_json::from_str::<Value>(&text) {
                    Ok(Value::Array(items)) => items,
                    _ => {
                        return Err(WeftError::execution(format!(
                            "Loop collection '{}' is not an array",
                            source
                        )))
                    }
                },
                Some(_) => {
                    return Err(WeftError::execution(format!(
                        "Loop collection '{}' is not an array",
                        source
                    )))
                }
                None => {
                    return Err(WeftError::execution(format!(
                        "Loop collection '{}' did not resolve",
                        source
                    )))
                }
            };
            Ok(Plan {
                total: Some(items.len() as u64),
                collection: Value::Array(items),
            })
        }
        LoopType::Count => {
            let count = spec
                .count
                .ok_or_else(|| invalid("count loop needs a count"))?;
            Ok(Plan {
                total: Some(count),
                collection: Value::Null,
            })
        }
        LoopType::While => {
            if spec.while_condition.is_none() {
                return Err(invalid("while loop needs a whileCondition"));
            }
            Ok(Plan {
                total: None,
                collection: Value::Null,
            })
        }
    }
}

/// Drive a loop node: push a frame, run the body per iteration, pop the frame.
///
/// The frame is popped on every exit path, so the loop stack depth after
/// the call equals the depth before it.
pub(crate) async fn run_loop(
    engine: &WorkflowEngine,
    node: &WorkflowNode,
    spec: &LoopNode,
    ctx: &mut ExecutionContext,
    cancel: &CancellationToken,
) -> Result<Value> {
    let plan = plan(node, spec, ctx)?;
    let cap = spec.max_iterations.min(engine.config().max_loop_iterations);
    if let Some(total) = plan.total {
        if total > cap {
            return Err(exceeded(node, cap));
        }
    }

    let depth = ctx.loop_depth();
    ctx.push_loop(LoopContext::new(
        &node.id,
        &spec.iterator_variable,
        spec.index_variable.clone(),
        plan.total,
        plan.collection,
    ));
    let result = iterate(engine, node, spec, cap, ctx, cancel).await;
    ctx.pop_loop();
    debug_assert_eq!(ctx.loop_depth(), depth);
    result
}

async fn iterate(
    engine: &WorkflowEngine,
    node: &WorkflowNode,
    spec: &LoopNode,
    cap: u64,
    ctx: &mut ExecutionContext,
    cancel: &CancellationToken,
) -> Result<Value> {
    let mut results = Vec::new();
    let mut index: u64 = 0;

    loop {
        let Some(frame) = ctx.current_loop_mut() else {
            return Err(WeftError::execution(format!("Loop {} lost its frame", node.id)));
        };
        frame.current_index = index;
        let total = frame.total_items;
        match total {
            Some(total) if index >= total => break,
            Some(_) => {}
            None => {
                // Sees the previous iteration's outputs
                let condition = spec.while_condition.as_deref().unwrap_or("false");
                if !evaluator::evaluate_condition(condition, ctx)? {
                    break;
                }
            }
        }
        if index >= cap {
            return Err(exceeded(node, cap));
        }
        if cancel.is_cancelled() {
            return Err(WeftError::Cancelled(format!(
                "{} stopped inside loop {}",
                ctx.instance_id, node.id
            )));
        }

        if let Some(frame) = ctx.current_loop_mut() {
            frame.iteration_outputs.clear();
        }
        let item = ctx.current_loop().map(LoopContext::current_item).unwrap_or(Value::Null);
        ctx.set_variable(spec.iterator_variable.clone(), item);
        if let Some(index_variable) = &spec.index_variable {
            ctx.set_variable(index_variable.clone(), json!(index));
        }
        debug!(node_id = %node.id, index, "Loop iteration");

        for body in &spec.body {
            if cancel.is_cancelled() {
                return Err(WeftError::Cancelled(format!(
                    "{} stopped inside loop {}",
                    ctx.instance_id, node.id
                )));
            }
            let run = engine.execute_node_inner(body, ctx, cancel).await?;
            if let Some(err) = run.failure {
                if !body.continue_on_error {
                    return Err(err);
                }
            }
        }

        let mut outputs = Map::new();
        if let Some(frame) = ctx.current_loop() {
            for body in &spec.body {
                if let Some(out) = frame.iteration_outputs.get(&body.id) {
                    outputs.insert(body.id.clone(), out.output.clone());
                }
            }
        }
        results.push(Value::Object(outputs));
        index += 1;
    }

    Ok(json!({ "iterations": index, "results": results }))
}
