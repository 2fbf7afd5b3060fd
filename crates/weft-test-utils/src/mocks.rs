use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use weft_core::error::{Result, WeftError};
use weft_core::traits::{HttpTransport, LlmExecutor, SandboxRuntime, UserInputProvider};
use weft_core::types::{
    HttpRequestSpec, HttpResponse, InputRequest, LlmResponse, PromptRequest, SandboxRequest,
    SandboxResult,
};

/// Counts calls and fails the first `failures` of them with an execution error.
#[derive(Debug, Default)]
struct Script {
    calls: AtomicUsize,
    failures: usize,
}

impl Script {
    fn failing(failures: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures,
        }
    }

    /// Register a call; returns its 1-based number or the scripted failure.
    fn next(&self, what: &str) -> Result<usize> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(WeftError::execution(format!("{} failure {}", what, call)));
        }
        Ok(call)
    }

    fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

// ── LLM ─────────────────────────────────────────────────────────

/// LLM that replays queued responses, then echoes the prompt.
#[derive(Default)]
pub struct MockLlm {
    responses: Mutex<VecDeque<LlmResponse>>,
    prompts: Mutex<Vec<String>>,
    script: Script,
    delay: Option<Duration>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` calls with a retryable error.
    pub fn failing(n: usize) -> Self {
        Self {
            script: Script::failing(n),
            ..Self::default()
        }
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_response(self, response: LlmResponse) -> Self {
        self.push(response);
        self
    }

    pub fn with_output(self, output: Value) -> Self {
        self.with_response(LlmResponse::ok(output))
    }

    pub fn push(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.script.count()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl LlmExecutor for MockLlm {
    fn execute_prompt(&self, request: PromptRequest) -> BoxFuture<'_, Result<LlmResponse>> {
        Box::pin(async move {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let scripted = self.script.next("llm");
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            scripted?;
            let queued = self.responses.lock().unwrap().pop_front();
            Ok(queued.unwrap_or_else(|| LlmResponse::ok(json!({ "text": request.prompt }))))
        })
    }
}

// ── Sandbox ─────────────────────────────────────────────────────

/// Sandbox that returns a fixed result and records every request.
pub struct MockSandbox {
    result: SandboxResult,
    languages: Vec<String>,
    requests: Mutex<Vec<SandboxRequest>>,
    script: Script,
}

impl MockSandbox {
    pub fn returning(result: Value) -> Self {
        Self {
            result: SandboxResult {
                result,
                stdout: None,
                error: None,
            },
            languages: vec!["python".into(), "javascript".into()],
            requests: Mutex::new(Vec::new()),
            script: Script::default(),
        }
    }

    /// Report a sandbox-side error in the result.
    pub fn erroring(message: &str) -> Self {
        let mut sandbox = Self::returning(Value::Null);
        sandbox.result.error = Some(message.to_string());
        sandbox
    }

    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.result.stdout = Some(stdout.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.script.count()
    }

    pub fn requests(&self) -> Vec<SandboxRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl SandboxRuntime for MockSandbox {
    fn run_code(&self, request: SandboxRequest) -> BoxFuture<'_, Result<SandboxResult>> {
        Box::pin(async move {
            self.script.next("sandbox")?;
            self.requests.lock().unwrap().push(request);
            Ok(self.result.clone())
        })
    }

    fn languages(&self) -> Vec<String> {
        self.languages.clone()
    }
}

// ── HTTP ────────────────────────────────────────────────────────

/// HTTP transport answering every request with one canned response.
pub struct MockHttp {
    status: u16,
    body: Value,
    requests: Mutex<Vec<HttpRequestSpec>>,
    script: Script,
}

impl MockHttp {
    pub fn ok(body: Value) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            requests: Mutex::new(Vec::new()),
            script: Script::default(),
        }
    }

    /// Fail the first `n` sends as connection errors.
    pub fn flaky(n: usize, body: Value) -> Self {
        Self {
            script: Script::failing(n),
            ..Self::ok(body)
        }
    }

    pub fn calls(&self) -> usize {
        self.script.count()
    }

    pub fn requests(&self) -> Vec<HttpRequestSpec> {
        self.requests.lock().unwrap().clone()
    }
}

impl HttpTransport for MockHttp {
    fn send(&self, request: HttpRequestSpec) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            self.script.next("connection")?;
            Ok(HttpResponse {
                status: self.status,
                headers: Default::default(),
                body: self.body.clone(),
            })
        })
    }
}

// ── User input ──────────────────────────────────────────────────

/// Input provider that hands out queued answers, then `None`.
#[derive(Default)]
pub struct MockInput {
    answers: Mutex<VecDeque<Value>>,
    prompts: Mutex<Vec<String>>,
}

impl MockInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answering<I: IntoIterator<Item = Value>>(answers: I) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl UserInputProvider for MockInput {
    fn request_input(&self, request: InputRequest) -> BoxFuture<'_, Result<Option<Value>>> {
        Box::pin(async move {
            self.prompts.lock().unwrap().push(request.prompt);
            Ok(self.answers.lock().unwrap().pop_front())
        })
    }
}
