use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::Result;
use crate::types::*;
use crate::workflow::WorkflowDefinition;

/// LLM execution service. Runs one prompt against a resolved provider.
pub trait LlmExecutor: Send + Sync + 'static {
    fn execute_prompt(&self, request: PromptRequest) -> BoxFuture<'_, Result<LlmResponse>>;
}

/// Sandbox runtime for user-supplied code.
pub trait SandboxRuntime: Send + Sync + 'static {
    fn run_code(&self, request: SandboxRequest) -> BoxFuture<'_, Result<SandboxResult>>;

    /// Languages this runtime accepts.
    fn languages(&self) -> Vec<String> {
        vec![]
    }
}

/// Outbound HTTP.
pub trait HttpTransport: Send + Sync + 'static {
    /// Send a request. Connection failures are errors; non-2xx statuses are
    /// returned as responses and judged by the caller.
    fn send(&self, request: HttpRequestSpec) -> BoxFuture<'_, Result<HttpResponse>>;
}

/// User-facing input surface.
pub trait UserInputProvider: Send + Sync + 'static {
    /// `Ok(None)` means no answer is available; the node falls back to its
    /// default value.
    fn request_input(&self, request: InputRequest) -> BoxFuture<'_, Result<Option<Value>>>;
}

/// Workflow persistence service.
pub trait WorkflowService: Send + Sync + 'static {
    /// Fetch a definition; `None` version means the latest.
    fn get_definition(
        &self,
        workflow_id: &str,
        version: Option<u32>,
    ) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>>;

    fn create_instance(
        &self,
        definition: &WorkflowDefinition,
        project_folder: &str,
        parent_instance_id: Option<&str>,
    ) -> BoxFuture<'_, Result<InstanceRecord>>;

    /// Freeze a definition version so running instances keep seeing it.
    fn lock_version(&self, workflow_id: &str, version: u32) -> BoxFuture<'_, Result<()>>;

    fn record_phase_execution(&self, record: PhaseRecord) -> BoxFuture<'_, Result<()>>;

    fn update_instance_status(
        &self,
        instance_id: &str,
        status: RunStatus,
    ) -> BoxFuture<'_, Result<()>> {
        let _ = (instance_id, status);
        Box::pin(async { Ok(()) })
    }

    /// Start a nested run and return its handle.
    fn start_sub_workflow(
        &self,
        request: SubWorkflowRequest,
    ) -> BoxFuture<'_, Result<SubWorkflowHandle>>;
}
