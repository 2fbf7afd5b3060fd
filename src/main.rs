use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::AppConfig;
use weft_core::error::Result as WeftResult;
use weft_core::traits::{LlmExecutor, UserInputProvider, WorkflowService};
use weft_core::types::{
    ApprovalDecision, InputRequest, LlmResponse, PromptRequest, WorkflowEvent,
};
use weft_core::{ExecutionContext, InputType, WorkflowDefinition};
use weft_engine::{validate_workflow, ApprovalBroker, WorkflowEngine};
use weft_store::SqliteWorkflowStore;
use weft_tools::{ProcessSandbox, ReqwestTransport};

#[derive(Parser)]
#[command(name = "weft", version, about = "Node-based workflow engine")]
struct Cli {
    /// Path to config file (default: ./weft.toml when present)
    #[arg(short, long, env = "WEFT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition (JSON)
    Run {
        /// Workflow definition file
        workflow: PathBuf,
        /// Project folder for file nodes and sandboxed code
        #[arg(long)]
        project: Option<PathBuf>,
        /// Initial variable (KEY=VALUE, value parsed as JSON when possible)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Approve every approval request without asking
        #[arg(long)]
        auto_approve: bool,
        /// Never prompt: inputs fall back to defaults, approvals are rejected
        #[arg(long)]
        non_interactive: bool,
        /// Print events as JSON lines on stderr
        #[arg(long)]
        json: bool,
    },
    /// Check a workflow definition without running it
    Validate {
        /// Workflow definition file
        workflow: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => AppConfig::load(path),
        None => AppConfig::load_or_default(Path::new("weft.toml")),
    }
    .context("loading config")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { workflow } => {
            let definition = load_definition(&workflow)?;
            let issues = validate_workflow(&definition);
            if issues.is_empty() {
                println!(
                    "{} (v{}): {} nodes, ok",
                    definition.id,
                    definition.version,
                    definition.nodes.len()
                );
            } else {
                for issue in &issues {
                    eprintln!("  {}", issue);
                }
                anyhow::bail!("{} validation issue(s) in {}", issues.len(), workflow.display());
            }
        }
        Commands::Run {
            workflow,
            project,
            vars,
            auto_approve,
            non_interactive,
            json,
        } => {
            let options = RunOptions {
                project,
                vars,
                approvals: if auto_approve {
                    ApprovalMode::Auto
                } else if non_interactive {
                    ApprovalMode::Reject
                } else {
                    ApprovalMode::Ask
                },
                interactive: !non_interactive,
                json,
            };
            run_workflow(&config, &workflow, options).await?;
        }
        Commands::Completions { .. } => unreachable!("handled before config loading"),
    }

    Ok(())
}

#[derive(Clone, Copy)]
enum ApprovalMode {
    Ask,
    Auto,
    Reject,
}

struct RunOptions {
    project: Option<PathBuf>,
    vars: Vec<String>,
    approvals: ApprovalMode,
    interactive: bool,
    json: bool,
}

fn load_definition(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Parse `KEY=VALUE` pairs; values that are valid JSON keep their type.
fn parse_vars(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut vars = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("invalid --var '{}', expected KEY=VALUE", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        vars.insert(key.trim().to_string(), value);
    }
    Ok(vars)
}

async fn run_workflow(
    config: &AppConfig,
    workflow: &Path,
    options: RunOptions,
) -> anyhow::Result<()> {
    let definition = load_definition(workflow)?;
    let project = options
        .project
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.engine.project_folder));
    let project = project.canonicalize().unwrap_or(project);

    let store = match config.store_path() {
        Some(path) => {
            let store = Arc::new(SqliteWorkflowStore::open(&path)?);
            if let Err(e) = store.save_definition(&definition) {
                warn!(workflow_id = %definition.id, error = %e, "Definition not saved");
            }
            Some(store)
        }
        None => None,
    };

    let mut builder = WorkflowEngine::builder()
        .config(config.engine.clone())
        .llm(Arc::new(UnconfiguredLlm))
        .http(Arc::new(ReqwestTransport::new(&config.http)?))
        .sandbox(Arc::new(ProcessSandbox::new(
            config.sandbox.clone(),
            project.clone(),
        )))
        .user_input(Arc::new(TerminalInput {
            interactive: options.interactive,
        }));
    if let Some(store) = &store {
        builder = builder.workflows(store.clone());
    }
    let engine = Arc::new(builder.build());

    let mut ctx = ExecutionContext::new(definition.id.clone(), project.clone())
        .with_variables(parse_vars(&options.vars)?);
    if let Some(store) = &store {
        let record = store
            .create_instance(&definition, &project.display().to_string(), None)
            .await?;
        ctx = ctx.with_instance_id(record.instance_id);
    }
    let instance_id = ctx.instance_id.clone();

    let printer = tokio::spawn(print_events(
        engine.event_bus().subscribe(),
        engine.broker().clone(),
        options.approvals,
        options.json,
    ));

    let stopper = {
        let engine = engine.clone();
        let instance_id = instance_id.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Stopping workflow...");
            engine.stop(&instance_id).await;
        })
    };

    info!(instance_id = %instance_id, workflow = %workflow.display(), "Running workflow");
    let result = engine.run(&definition, &mut ctx).await;
    stopper.abort();
    // Runs rejected before starting publish nothing for the printer to end on
    tokio::time::timeout(Duration::from_secs(2), printer).await.ok();

    let summary = result?;
    let outputs: Map<String, Value> = ctx
        .completed_nodes()
        .iter()
        .filter_map(|id| Some((id.clone(), ctx.node_output(id)?.output.clone())))
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "summary": summary,
            "variables": ctx.variables,
            "outputs": outputs,
        }))?
    );
    Ok(())
}

/// Print events until the run ends, answering approvals along the way.
async fn print_events(
    mut rx: tokio::sync::broadcast::Receiver<WorkflowEvent>,
    broker: Arc<ApprovalBroker>,
    approvals: ApprovalMode,
    json: bool,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event printer lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if json {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{}", line);
            }
        } else {
            print_event(&event);
        }

        match event {
            WorkflowEvent::ApprovalRequired { request } => {
                let decision = match approvals {
                    ApprovalMode::Auto => ApprovalDecision::Approved,
                    ApprovalMode::Reject => ApprovalDecision::Rejected {
                        reason: "non-interactive run".into(),
                    },
                    ApprovalMode::Ask => {
                        let prompt = format!("Approve {} ({})?", request.node_name, request.node_id);
                        let approved = tokio::task::spawn_blocking(move || {
                            dialoguer::Confirm::new()
                                .with_prompt(prompt)
                                .default(true)
                                .interact()
                                .unwrap_or(false)
                        })
                        .await
                        .unwrap_or(false);
                        if approved {
                            ApprovalDecision::Approved
                        } else {
                            ApprovalDecision::Rejected {
                                reason: "rejected by user".into(),
                            }
                        }
                    }
                };
                broker.respond(&request.id, decision).await;
            }
            WorkflowEvent::RunCompleted { .. } | WorkflowEvent::RunFailed { .. } => break,
            _ => {}
        }
    }
}

fn print_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::RunStarted { workflow_id, .. } => eprintln!("[run: {}]", workflow_id),
        WorkflowEvent::NodeStarted {
            node_id, node_type, ..
        } => eprintln!("[{}: {}] started", node_type, node_id),
        WorkflowEvent::NodeCompleted {
            node_id, status, ..
        } => eprintln!("[{}] {}", node_id, status),
        WorkflowEvent::NodeFailed { node_id, error, .. } => {
            eprintln!("[{}: ERROR] {}", node_id, error)
        }
        WorkflowEvent::WorkflowLog {
            level,
            message,
            node_id,
            ..
        } => match node_id {
            Some(id) => eprintln!("  {:?} {}: {}", level, id, message),
            None => eprintln!("  {:?} {}", level, message),
        },
        WorkflowEvent::ApprovalRequired { request } => {
            eprintln!("\n[APPROVAL] {} ({})", request.node_name, request.node_type)
        }
        WorkflowEvent::ApprovalResolved { approved, .. } => {
            eprintln!("[approval: {}]", if *approved { "approved" } else { "rejected" })
        }
        WorkflowEvent::RunCompleted { status, .. } => eprintln!("[done: {}]", status),
        WorkflowEvent::RunFailed { error, .. } => eprintln!("[error: {}]", error),
    }
}

/// Placeholder LLM backend: agent nodes fail until a provider is wired in.
struct UnconfiguredLlm;

impl LlmExecutor for UnconfiguredLlm {
    fn execute_prompt(&self, request: PromptRequest) -> BoxFuture<'_, WeftResult<LlmResponse>> {
        Box::pin(async move {
            Ok(LlmResponse::error(format!(
                "no LLM backend configured for provider '{}'",
                request.provider.id
            )))
        })
    }
}

/// Prompts on the terminal for user-input nodes.
struct TerminalInput {
    interactive: bool,
}

impl UserInputProvider for TerminalInput {
    fn request_input(&self, request: InputRequest) -> BoxFuture<'_, WeftResult<Option<Value>>> {
        let interactive = self.interactive;
        Box::pin(async move {
            if !interactive {
                return Ok(None);
            }
            let answer = tokio::task::spawn_blocking(move || ask(&request))
                .await
                .map_err(|e| weft_core::WeftError::execution(format!("input prompt failed: {}", e)))?;
            Ok(answer)
        })
    }
}

fn ask(request: &InputRequest) -> Option<Value> {
    let default = request.default_value.as_ref().map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    match request.input_type {
        InputType::Boolean => dialoguer::Confirm::new()
            .with_prompt(&request.prompt)
            .default(request.default_value.as_ref().and_then(Value::as_bool).unwrap_or(false))
            .interact()
            .ok()
            .map(Value::Bool),
        InputType::Select if !request.validation.options.is_empty() => {
            let options = &request.validation.options;
            let start = default
                .as_ref()
                .and_then(|d| options.iter().position(|o| o == d))
                .unwrap_or(0);
            dialoguer::Select::new()
                .with_prompt(&request.prompt)
                .items(options)
                .default(start)
                .interact()
                .ok()
                .map(|i| Value::String(options[i].clone()))
        }
        _ => {
            let mut input = dialoguer::Input::<String>::new()
                .with_prompt(&request.prompt)
                .allow_empty(!request.required);
            if let Some(d) = default {
                input = input.default(d);
            }
            input.interact_text().ok().map(Value::String)
        }
    }
}
