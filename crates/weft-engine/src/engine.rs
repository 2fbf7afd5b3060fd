use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::EngineConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::traits::{
    HttpTransport, LlmExecutor, SandboxRuntime, UserInputProvider, WorkflowService,
};
use weft_core::types::{
    ApprovalDecision, ApprovalRequest, LogLevel, NodeOutput, NodeResult, PhaseRecord, RunStatus,
    WorkflowEvent,
};
use weft_core::{
    ExecutionContext, LoopNode, NodeKind, NodeType, WorkflowDefinition, WorkflowNode,
};

use crate::approval::ApprovalBroker;
use crate::evaluator;
use crate::executors::{loop_node, Collaborators, ExecutorRegistry, NodeExecutor};
use crate::retry::RetryGuard;
use crate::validate::validate_workflow;

/// Outcome of one node as seen by the run loop.
pub(crate) struct NodeRun {
    pub output: NodeOutput,
    /// Set when the node failed; the run decides whether that is fatal.
    pub failure: Option<WeftError>,
}

/// Summary returned by a finished run. Node outputs stay in the context.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub instance_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub duration_ms: u64,
}

struct RunControl {
    cancel: CancellationToken,
    status: RunStatus,
    /// Order in which the run finished, among runs still kept.
    finished: Option<u64>,
}

/// Errors that end the run no matter what the node's `continueOnError` says.
fn is_fatal(err: &WeftError) -> bool {
    matches!(
        err,
        WeftError::Dependency(_) | WeftError::Cancelled(_) | WeftError::DuplicateNode(_)
    )
}

/// Drop the oldest finished runs beyond `keep`. Live runs are never dropped.
fn prune_finished(runs: &mut HashMap<String, RunControl>, keep: usize) {
    let mut finished: Vec<(u64, String)> = runs
        .iter()
        .filter_map(|(id, run)| run.finished.map(|at| (at, id.clone())))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        runs.remove(&id);
    }
    debug!(dropped = excess, "Pruned finished runs");
}

/// Executes workflows node by node.
pub struct WorkflowEngine {
    executors: ExecutorRegistry,
    event_bus: Arc<EventBus>,
    broker: Arc<ApprovalBroker>,
    workflows: Option<Arc<dyn WorkflowService>>,
    config: EngineConfig,
    runs: Mutex<HashMap<String, RunControl>>,
}

impl WorkflowEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn broker(&self) -> &Arc<ApprovalBroker> {
        &self.broker
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run every node of `definition` in order against `ctx`.
    ///
    /// Definition variables are seeded only where `ctx` has no value yet.
    /// A node failure without `continueOnError` ends the run and is returned.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        ctx: &mut ExecutionContext,
    ) -> Result<RunSummary> {
        let issues = validate_workflow(definition);
        if !issues.is_empty() {
            let message = issues
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(WeftError::Validation {
                node: definition.id.clone(),
                message,
            });
        }

        for (key, value) in &definition.variables {
            if ctx.variable(key).is_none() {
                ctx.set_variable(key.clone(), value.clone());
            }
        }

        let instance_id = ctx.instance_id.clone();
        let cancel = CancellationToken::new();
        self.lock_runs().insert(
            instance_id.clone(),
            RunControl {
                cancel: cancel.clone(),
                status: RunStatus::Running,
                finished: None,
            },
        );
        self.persist_status(&instance_id, RunStatus::Running).await;

        info!(
            instance_id = %instance_id,
            workflow_id = %definition.id,
            nodes = definition.nodes.len(),
            "Workflow run started"
        );
        self.event_bus.publish(WorkflowEvent::RunStarted {
            instance_id: instance_id.clone(),
            workflow_id: definition.id.clone(),
            timestamp: Utc::now(),
        });

        let started = Instant::now();
        let mut result = self.run_nodes(definition, ctx, &cancel).await;
        if cancel.is_cancelled() && !matches!(result, Err(WeftError::Cancelled(_))) {
            result = Err(WeftError::Cancelled(instance_id.clone()));
        }

        let status = match &result {
            Ok(()) => RunStatus::Completed,
            Err(WeftError::Cancelled(_)) => RunStatus::Cancelled,
            Err(_) => RunStatus::Failed,
        };
        self.set_status(&instance_id, status);
        self.persist_status(&instance_id, status).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                info!(instance_id = %instance_id, elapsed_ms = duration_ms, "Workflow run completed");
                self.event_bus.publish(WorkflowEvent::RunCompleted {
                    instance_id: instance_id.clone(),
                    status,
                });
                Ok(self.summary(definition, ctx, status, duration_ms))
            }
            Err(e @ WeftError::Cancelled(_)) => {
                info!(instance_id = %instance_id, "Workflow run cancelled");
                self.event_bus.publish(WorkflowEvent::RunCompleted {
                    instance_id: instance_id.clone(),
                    status,
                });
                Err(e)
            }
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Workflow run failed");
                self.event_bus.publish(WorkflowEvent::RunFailed {
                    instance_id: instance_id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_nodes(
        &self,
        definition: &WorkflowDefinition,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for node in &definition.nodes {
            if cancel.is_cancelled() {
                return Err(WeftError::Cancelled(format!(
                    "{} stopped before node {}",
                    ctx.instance_id, node.id
                )));
            }
            let run = self.execute_node_inner(node, ctx, cancel).await?;
            if let Some(err) = run.failure {
                if !node.continue_on_error {
                    return Err(err);
                }
                warn!(node_id = %node.id, error = %err, "Continuing after node failure");
            }
        }
        Ok(())
    }

    /// Execute a single node against `ctx` and record its output.
    ///
    /// A failed node is returned as an output with `failed` status; only
    /// errors that end the run (missing executor, cancellation) are `Err`.
    pub async fn execute_node(
        &self,
        node: &WorkflowNode,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeOutput> {
        let cancel = self
            .lock_runs()
            .get(&ctx.instance_id)
            .map(|run| run.cancel.clone())
            .unwrap_or_else(CancellationToken::new);
        Ok(self.execute_node_inner(node, ctx, &cancel).await?.output)
    }

    pub(crate) fn execute_node_inner<'a>(
        &'a self,
        node: &'a WorkflowNode,
        ctx: &'a mut ExecutionContext,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<NodeRun>> {
        Box::pin(async move {
            let started = Instant::now();
            let node_type = node.node_type();
            ctx.current_node_id = Some(node.id.clone());

            // 1. Skip condition
            if let Some(expr) = &node.skip_condition {
                match evaluator::evaluate_condition(expr, ctx) {
                    Ok(true) => {
                        debug!(node_id = %node.id, condition = %expr, "Node skipped");
                        self.log(
                            ctx,
                            LogLevel::Info,
                            format!("Skipped {} ({})", node.name, expr),
                            Some(&node.id),
                        );
                        let output = NodeOutput::skipped(&node.id, &node.name);
                        ctx.record_output(output.clone())?;
                        self.record_phase(ctx, node_type, &output).await;
                        return Ok(NodeRun {
                            output,
                            failure: None,
                        });
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(node_id = %node.id, error = %e, "Skip condition not evaluable");
                        self.log(
                            ctx,
                            LogLevel::Warn,
                            format!("Skip condition of {} ignored: {}", node.name, e),
                            Some(&node.id),
                        );
                    }
                }
            }

            // 2. Node context
            let built = evaluator::build_node_context(node, ctx);
            let Some(node_ctx) = built.context else {
                let err = WeftError::Validation {
                    node: node.id.clone(),
                    message: built
                        .error
                        .unwrap_or_else(|| "context build failed".to_string()),
                };
                error!(node_id = %node.id, error = %err, "Context build failed");
                self.log(ctx, LogLevel::Error, err.to_string(), Some(&node.id));
                let mut output = NodeOutput::failed(&node.id, &node.name, &err);
                output.duration_ms = started.elapsed().as_millis() as u64;
                ctx.record_output(output.clone())?;
                self.record_phase(ctx, node_type, &output).await;
                return Ok(NodeRun {
                    output,
                    failure: Some(err),
                });
            };

            // 3. Executor lookup; loops are driven here
            let executor = match &node.kind {
                NodeKind::Loop(_) => None,
                _ => match self.executors.get(node_type) {
                    Some(executor) => Some(executor),
                    None => {
                        error!(node_id = %node.id, node_type = %node_type, "No executor registered");
                        return Err(WeftError::Dependency(node_type.to_string()));
                    }
                },
            };

            // 4. Start + approval
            self.event_bus.publish(WorkflowEvent::NodeStarted {
                instance_id: ctx.instance_id.clone(),
                node_id: node.id.clone(),
                node_name: node.name.clone(),
                node_type,
            });
            info!(node_id = %node.id, node_type = %node_type, "Node started");

            if node.requires_approval {
                if let Err(e) = self.await_approval(node, ctx, cancel).await {
                    if is_fatal(&e) {
                        return Err(e);
                    }
                    return self.finish_node(node, ctx, Err(e), 0, started).await;
                }
            }

            // 5. Invoke
            let (result, attempts) = match (&node.kind, executor) {
                (NodeKind::Loop(spec), _) => {
                    let result = self.run_loop_limited(node, spec, ctx, cancel).await;
                    match result {
                        Err(e) if is_fatal(&e) => return Err(e),
                        other => (other.map(NodeResult::new), 1),
                    }
                }
                (_, Some(executor)) => self.invoke(executor, node, node_ctx).await,
                (_, None) => return Err(WeftError::Dependency(node_type.to_string())),
            };

            // 6-8. Extract, record, announce
            self.finish_node(node, ctx, result, attempts, started).await
        })
    }

    /// Loops honor `timeoutMs` as one deadline over every iteration. Frames
    /// left by an interrupted body are popped.
    async fn run_loop_limited(
        &self,
        node: &WorkflowNode,
        spec: &LoopNode,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let Some(timeout_ms) = node.timeout_ms else {
            return loop_node::run_loop(self, node, spec, ctx, cancel).await;
        };
        let depth = ctx.loop_depth();
        let limit = Duration::from_millis(timeout_ms);
        let timed =
            tokio::time::timeout(limit, loop_node::run_loop(self, node, spec, ctx, cancel)).await;
        match timed {
            Ok(result) => result,
            Err(_) => {
                while ctx.loop_depth() > depth {
                    ctx.pop_loop();
                }
                warn!(node_id = %node.id, timeout_ms, "Loop timed out");
                Err(WeftError::Timeout {
                    node: node.id.clone(),
                    timeout_ms,
                })
            }
        }
    }

    async fn invoke(
        &self,
        executor: Arc<dyn NodeExecutor>,
        node: &WorkflowNode,
        node_ctx: weft_core::context::NodeContext,
    ) -> (Result<NodeResult>, u32) {
        let guard = RetryGuard::from_node(node);
        let outcome = guard
            .run(&node.id, |attempt| {
                debug!(node_id = %node.id, executor = executor.name(), attempt, "Invoking executor");
                executor.execute(node, node_ctx.clone())
            })
            .await;
        (outcome.result, outcome.attempts)
    }

    async fn finish_node(
        &self,
        node: &WorkflowNode,
        ctx: &mut ExecutionContext,
        result: Result<NodeResult>,
        attempts: u32,
        started: Instant,
    ) -> Result<NodeRun> {
        let node_type = node.node_type();
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(produced) => {
                let mut output = NodeOutput::success(&node.id, &node.name, produced.output);
                output.variables = produced.variables;
                output.attempts = attempts;
                output.duration_ms = duration_ms;

                let extraction = evaluator::extract_outputs(node, &output, ctx);
                for warning in extraction.warnings {
                    warn!(node_id = %node.id, "{}", warning);
                    self.log(ctx, LogLevel::Warn, warning, Some(&node.id));
                }

                ctx.record_output(output.clone())?;
                self.event_bus.publish(WorkflowEvent::NodeCompleted {
                    instance_id: ctx.instance_id.clone(),
                    node_id: node.id.clone(),
                    node_name: node.name.clone(),
                    node_type,
                    status: output.status,
                    output: output.output.clone(),
                });
                info!(node_id = %node.id, attempts, elapsed_ms = duration_ms, "Node completed");
                self.record_phase(ctx, node_type, &output).await;
                Ok(NodeRun {
                    output,
                    failure: None,
                })
            }
            Err(err) => {
                let mut output = NodeOutput::failed(&node.id, &node.name, &err);
                output.attempts = attempts;
                output.duration_ms = duration_ms;

                ctx.record_output(output.clone())?;
                self.event_bus.publish(WorkflowEvent::NodeFailed {
                    instance_id: ctx.instance_id.clone(),
                    node_id: node.id.clone(),
                    node_name: node.name.clone(),
                    node_type,
                    error: err.to_string(),
                });
                error!(node_id = %node.id, attempts, error = %err, "Node failed");
                self.record_phase(ctx, node_type, &output).await;
                Ok(NodeRun {
                    output,
                    failure: Some(err),
                })
            }
        }
    }

    async fn await_approval(
        &self,
        node: &WorkflowNode,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = ApprovalRequest {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: ctx.instance_id.clone(),
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            node_type: node.node_type(),
            timestamp: Utc::now(),
        };
        let request_id = request.id.clone();

        self.set_status(&ctx.instance_id, RunStatus::WaitingApproval);
        self.persist_status(&ctx.instance_id, RunStatus::WaitingApproval).await;
        info!(node_id = %node.id, request_id = %request_id, "Waiting for approval");
        self.log(
            ctx,
            LogLevel::Info,
            format!("Waiting for approval of {}", node.name),
            Some(&node.id),
        );

        let rx = self.broker.request(request).await;
        let timeout = self.config.approval_timeout_secs.map(Duration::from_secs);
        let wait = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, rx).await.ok().and_then(|r| r.ok()),
                None => rx.await.ok(),
            }
        };

        let decision = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.broker.withdraw(&request_id).await;
                return Err(WeftError::Cancelled(format!(
                    "{} stopped while waiting for approval of {}",
                    ctx.instance_id, node.id
                )));
            }
            decision = wait => decision,
        };

        self.set_status(&ctx.instance_id, RunStatus::Running);
        self.persist_status(&ctx.instance_id, RunStatus::Running).await;

        match decision {
            Some(ApprovalDecision::Approved) => {
                info!(node_id = %node.id, "Approval granted");
                Ok(())
            }
            Some(ApprovalDecision::Rejected { reason }) => Err(WeftError::ApprovalRejected {
                node: node.id.clone(),
                reason,
            }),
            None => {
                self.broker.withdraw(&request_id).await;
                Err(WeftError::ApprovalRejected {
                    node: node.id.clone(),
                    reason: "no decision received".to_string(),
                })
            }
        }
    }

    /// Stop a run: it ends before the next node, and its pending approvals
    /// are rejected. In-flight executor calls finish on their own.
    pub async fn stop(&self, instance_id: &str) -> bool {
        let cancel = {
            let mut runs = self.lock_runs();
            match runs.get_mut(instance_id) {
                Some(run) if !run.status.is_terminal() => {
                    run.status = RunStatus::Cancelled;
                    run.cancel.clone()
                }
                _ => return false,
            }
        };
        cancel.cancel();
        let rejected = self
            .broker
            .reject_instance(instance_id, "workflow stopped")
            .await;
        info!(instance_id = %instance_id, rejected, "Workflow stop requested");
        true
    }

    /// Current status of a run started by this engine.
    pub fn status(&self, instance_id: &str) -> Option<RunStatus> {
        self.lock_runs().get(instance_id).map(|run| run.status)
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunControl>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Update a live run's status; terminal states stick.
    fn set_status(&self, instance_id: &str, status: RunStatus) {
        let mut runs = self.lock_runs();
        let Some(run) = runs.get_mut(instance_id) else {
            return;
        };
        if !run.status.is_terminal() || status.is_terminal() {
            run.status = status;
        }
        if status.is_terminal() && run.finished.is_none() {
            let order = runs.values().filter_map(|r| r.finished).max().map_or(0, |m| m + 1);
            if let Some(run) = runs.get_mut(instance_id) {
                run.finished = Some(order);
            }
            prune_finished(&mut runs, self.config.retained_runs);
        }
    }

    async fn persist_status(&self, instance_id: &str, status: RunStatus) {
        if let Some(workflows) = &self.workflows {
            if let Err(e) = workflows.update_instance_status(instance_id, status).await {
                warn!(instance_id = %instance_id, error = %e, "Failed to persist run status");
            }
        }
    }

    async fn record_phase(&self, ctx: &ExecutionContext, node_type: NodeType, output: &NodeOutput) {
        if let Some(workflows) = &self.workflows {
            let record = PhaseRecord::from_output(&ctx.instance_id, node_type, output);
            if let Err(e) = workflows.record_phase_execution(record).await {
                warn!(node_id = %output.node_id, error = %e, "Failed to record phase execution");
            }
        }
    }

    fn log(&self, ctx: &ExecutionContext, level: LogLevel, message: String, node_id: Option<&str>) {
        self.event_bus.publish(WorkflowEvent::WorkflowLog {
            instance_id: ctx.instance_id.clone(),
            level,
            message,
            node_id: node_id.map(String::from),
        });
    }

    fn summary(
        &self,
        definition: &WorkflowDefinition,
        ctx: &ExecutionContext,
        status: RunStatus,
        duration_ms: u64,
    ) -> RunSummary {
        let failed_nodes = ctx
            .completed_nodes()
            .iter()
            .filter(|id| ctx.node_output(id).is_some_and(|o| !o.is_success()))
            .cloned()
            .collect();
        RunSummary {
            instance_id: ctx.instance_id.clone(),
            workflow_id: definition.id.clone(),
            status,
            completed_nodes: ctx.completed_nodes().to_vec(),
            failed_nodes,
            duration_ms,
        }
    }
}

/// Assembles a [`WorkflowEngine`] from collaborators and overrides.
#[derive(Default)]
pub struct EngineBuilder {
    collaborators: Collaborators,
    overrides: Vec<(NodeType, Arc<dyn NodeExecutor>)>,
    event_bus: Option<Arc<EventBus>>,
    broker: Option<Arc<ApprovalBroker>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn llm(mut self, llm: Arc<dyn LlmExecutor>) -> Self {
        self.collaborators.llm = Some(llm);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn SandboxRuntime>) -> Self {
        self.collaborators.sandbox = Some(sandbox);
        self
    }

    pub fn http(mut self, http: Arc<dyn HttpTransport>) -> Self {
        self.collaborators.http = Some(http);
        self
    }

    pub fn user_input(mut self, provider: Arc<dyn UserInputProvider>) -> Self {
        self.collaborators.user_input = Some(provider);
        self
    }

    /// Persistence service: sub-workflows, phase records, and run status.
    pub fn workflows(mut self, workflows: Arc<dyn WorkflowService>) -> Self {
        self.collaborators.workflows = Some(workflows);
        self
    }

    /// Replace (or add) the executor for one node type.
    pub fn executor(mut self, node_type: NodeType, executor: impl NodeExecutor) -> Self {
        self.overrides.push((node_type, Arc::new(executor)));
        self
    }

    pub fn executor_shared(mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) -> Self {
        self.overrides.push((node_type, executor));
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn broker(mut self, broker: Arc<ApprovalBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let mut executors = ExecutorRegistry::with_collaborators(&self.collaborators);
        for (node_type, executor) in self.overrides {
            executors.register_shared(node_type, executor);
        }
        let event_bus = self
            .event_bus
            .unwrap_or_else(|| Arc::new(EventBus::new(self.config.event_capacity)));
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(ApprovalBroker::new(event_bus.clone())));

        WorkflowEngine {
            executors,
            event_bus,
            broker,
            workflows: self.collaborators.workflows,
            config: self.config,
            runs: Mutex::new(HashMap::new()),
        }
    }
}
