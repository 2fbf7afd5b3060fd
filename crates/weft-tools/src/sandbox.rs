use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use weft_core::config::SandboxConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::SandboxRuntime;
use weft_core::types::{SandboxRequest, SandboxResult};

/// Runs code nodes as child interpreter processes.
///
/// The node context arrives as one JSON line on stdin. The last stdout line,
/// when it parses as JSON, becomes the result; everything printed before it
/// is returned as `stdout`. `cpuTimeoutMs` is enforced as a wall-clock limit
/// and the child is killed when it expires. `memoryMb` is exported to the
/// child as `WEFT_MEMORY_MB`.
pub struct ProcessSandbox {
    config: SandboxConfig,
    work_dir: PathBuf,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig, work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = match &config.work_dir {
            Some(dir) => PathBuf::from(dir),
            None => work_dir.into(),
        };
        Self { config, work_dir }
    }
}

/// Split stdout into leading log lines and a trailing JSON result.
fn split_output(stdout: &str) -> (Value, String) {
    let trimmed = stdout.trim_end();
    let (head, last) = match trimmed.rfind('\n') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    };
    match serde_json::from_str::<Value>(last.trim()) {
        Ok(result) => (result, head.to_string()),
        Err(_) => (Value::Null, trimmed.to_string()),
    }
}

fn cap(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("\n... (output truncated)");
    }
    text
}

impl SandboxRuntime for ProcessSandbox {
    fn run_code(&self, request: SandboxRequest) -> BoxFuture<'_, Result<SandboxResult>> {
        Box::pin(async move {
            let command = self
                .config
                .interpreters
                .get(&request.language)
                .filter(|cmd| !cmd.is_empty())
                .ok_or_else(|| {
                    WeftError::execution(format!(
                        "No interpreter configured for '{}'",
                        request.language
                    ))
                })?;

            debug!(language = %request.language, program = %command[0], "Starting sandbox process");

            let mut child = tokio::process::Command::new(&command[0])
                .args(&command[1..])
                .arg(&request.code)
                .current_dir(&self.work_dir)
                .env("WEFT_MEMORY_MB", request.limits.memory_mb.to_string())
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    WeftError::execution(format!("Failed to start {}: {}", command[0], e))
                })?;

            let mut line = serde_json::to_vec(&request.input)?;
            line.push(b'\n');
            let stdin = child.stdin.take();
            let feed = async move {
                if let Some(mut stdin) = stdin {
                    // The code may exit without reading its input
                    if let Err(e) = stdin.write_all(&line).await {
                        debug!(error = %e, "Sandbox stdin closed early");
                    }
                }
            };

            // Feeding stdin and waiting share one deadline.
            let limit = Duration::from_millis(request.limits.cpu_timeout_ms);
            let run = async {
                let ((), output) = tokio::join!(feed, child.wait_with_output());
                output
            };
            let output = match tokio::time::timeout(limit, run).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(language = %request.language, timeout_ms = request.limits.cpu_timeout_ms, "Sandbox timed out");
                    return Err(WeftError::Timeout {
                        node: format!("{} sandbox", request.language),
                        timeout_ms: request.limits.cpu_timeout_ms,
                    });
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let (result, logs) = split_output(&stdout);
            let logs = cap(logs, self.config.max_output_bytes);

            let error = if output.status.success() {
                None
            } else if stderr.is_empty() {
                Some(format!("exit code {}", output.status.code().unwrap_or(-1)))
            } else {
                Some(stderr)
            };

            Ok(SandboxResult {
                result,
                stdout: (!logs.is_empty()).then_some(logs),
                error,
            })
        })
    }

    fn languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self.config.interpreters.keys().cloned().collect();
        languages.sort();
        languages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use weft_core::SandboxLimits;

    fn sandbox(dir: &std::path::Path) -> ProcessSandbox {
        let config = SandboxConfig {
            interpreters: HashMap::from([(
                "bash".to_string(),
                vec!["bash".to_string(), "-c".to_string()],
            )]),
            work_dir: None,
            max_output_bytes: 1024,
        };
        ProcessSandbox::new(config, dir)
    }

    fn request(code: &str, timeout_ms: u64) -> SandboxRequest {
        SandboxRequest {
            language: "bash".into(),
            code: code.into(),
            limits: SandboxLimits {
                cpu_timeout_ms: timeout_ms,
                memory_mb: 64,
            },
            input: json!({ "variables": { "n": 2 } }),
        }
    }

    #[tokio::test]
    async fn reads_stdin_and_returns_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let result = sandbox(dir.path())
            .run_code(request(
                r#"read -r input; echo "working"; echo "{\"got\": $input, \"mem\": $WEFT_MEMORY_MB}""#,
                5_000,
            ))
            .await
            .unwrap();
        assert_eq!(result.result["got"]["variables"]["n"], json!(2));
        assert_eq!(result.result["mem"], json!(64));
        assert_eq!(result.stdout.as_deref(), Some("working"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let result = sandbox(dir.path())
            .run_code(request("echo oops >&2; exit 3", 5_000))
            .await
            .unwrap();
        assert_eq!(result.error.as_deref(), Some("oops"));
        assert_eq!(result.result, Value::Null);
    }

    #[tokio::test]
    async fn runaway_code_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = sandbox(dir.path())
            .run_code(request("sleep 5", 200))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::Timeout { timeout_ms: 200, .. }));
    }

    fn large_input() -> Value {
        json!({ "blob": "x".repeat(256 * 1024) })
    }

    #[tokio::test]
    async fn large_input_to_a_busy_child_still_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request("while true; do :; done", 200);
        req.input = large_input();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            sandbox(dir.path()).run_code(req),
        )
        .await
        .expect("sandbox should enforce its own limit");
        assert!(matches!(outcome, Err(WeftError::Timeout { timeout_ms: 200, .. })));
    }

    #[tokio::test]
    async fn large_input_is_delivered_whole() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(r#"n=$(wc -c); echo "{\"bytes\": $n}""#, 5_000);
        req.input = large_input();

        let result = sandbox(dir.path()).run_code(req).await.unwrap();
        assert!(result.result["bytes"].as_u64().unwrap() > 256 * 1024);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn unknown_language_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request("print(1)", 1_000);
        req.language = "cobol".into();
        let err = sandbox(dir.path()).run_code(req).await.unwrap_err();
        assert!(err.to_string().contains("cobol"));
        assert_eq!(sandbox(dir.path()).languages(), vec!["bash"]);
    }

    #[test]
    fn plain_output_has_no_result() {
        let (result, logs) = split_output("hello\nworld\n");
        assert_eq!(result, Value::Null);
        assert_eq!(logs, "hello\nworld");

        let (result, logs) = split_output("42\n");
        assert_eq!(result, json!(42));
        assert_eq!(logs, "");
    }
}
