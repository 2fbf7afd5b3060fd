pub mod approval;
pub mod engine;
pub mod evaluator;
pub mod executors;
pub mod retry;
pub mod validate;

pub use approval::ApprovalBroker;
pub use engine::{EngineBuilder, RunSummary, WorkflowEngine};
pub use executors::{Collaborators, ExecutorRegistry, NodeExecutor};
pub use retry::{GuardOutcome, RetryGuard};
pub use validate::{validate_workflow, ValidationIssue};
