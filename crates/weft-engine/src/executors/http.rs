use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::warn;

use weft_core::context::NodeContext;
use weft_core::error::{Result, WeftError};
use weft_core::traits::HttpTransport;
use weft_core::types::HttpRequestSpec;
use weft_core::{NodeKind, NodeResult, WorkflowNode};

use super::{kind_mismatch, NodeExecutor};
use crate::evaluator::substitute_in;
use crate::evaluator::template::render_value;

/// Issues one HTTP request with templated url, headers, and body.
pub struct HttpExecutor {
    transport: Arc<dyn HttpTransport>,
}

impl HttpExecutor {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }
}

impl NodeExecutor for HttpExecutor {
    fn name(&self) -> &str {
        "http_request"
    }

    fn execute<'a>(
        &'a self,
        node: &'a WorkflowNode,
        ctx: NodeContext,
    ) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(async move {
            let NodeKind::HttpRequest(http) = &node.kind else {
                return Err(kind_mismatch(node, self.name()));
            };

            let method = http.method.trim().to_uppercase();
            let url = substitute_in(&http.url, &ctx.scope).text;
            let headers: HashMap<String, String> = http
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), substitute_in(v, &ctx.scope).text))
                .collect();

            let mut unresolved = Vec::new();
            let body = http
                .body
                .as_ref()
                .map(|b| render_value(b, &ctx.scope, &mut unresolved));
            for name in &unresolved {
                warn!(node_id = %node.id, placeholder = %name, "Unresolved placeholder in request body");
            }

            let response = self
                .transport
                .send(HttpRequestSpec {
                    method: method.clone(),
                    url: url.clone(),
                    headers,
                    body,
                    timeout_ms: node.timeout_ms,
                })
                .await?;

            if !response.is_success() {
                return Err(WeftError::execution(format!(
                    "HTTP {} from {} {}",
                    response.status, method, url
                )));
            }

            Ok(NodeResult::new(json!({
                "status": response.status,
                "headers": response.headers,
                "body": response.body,
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use weft_core::types::HttpResponse;
    use weft_core::{ContextMode, HttpNode};

    struct Recorder {
        status: u16,
        seen: Mutex<Vec<HttpRequestSpec>>,
    }

    impl HttpTransport for Recorder {
        fn send(&self, request: HttpRequestSpec) -> BoxFuture<'_, Result<HttpResponse>> {
            self.seen.lock().unwrap().push(request);
            let status = self.status;
            Box::pin(async move {
                Ok(HttpResponse {
                    status,
                    headers: HashMap::new(),
                    body: json!({ "ok": status == 200 }),
                })
            })
        }
    }

    fn ctx() -> NodeContext {
        NodeContext {
            instance_id: "run-1".into(),
            workflow_id: "wf".into(),
            node_id: "call".into(),
            project_folder: "/tmp".into(),
            mode: ContextMode::Simple,
            scope: json!({ "variables": { "userId": 42, "token": "abc" } }),
        }
    }

    fn node() -> WorkflowNode {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer {{token}}".to_string());
        WorkflowNode::new(
            "call",
            "Call",
            NodeKind::HttpRequest(HttpNode {
                method: "post".into(),
                url: "https://api.example.com/users/{{userId}}".into(),
                headers,
                body: Some(json!({ "id": "{{userId}}" })),
            }),
        )
    }

    #[tokio::test]
    async fn substitutes_request_parts() {
        let transport = Arc::new(Recorder {
            status: 200,
            seen: Mutex::new(vec![]),
        });
        let exec = HttpExecutor::new(transport.clone());
        let result = exec.execute(&node(), ctx()).await.unwrap();
        assert_eq!(result.output["status"], json!(200));

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].url, "https://api.example.com/users/42");
        assert_eq!(seen[0].headers["Authorization"], "Bearer abc");
        assert_eq!(seen[0].body, Some(json!({ "id": 42 })));
    }

    #[tokio::test]
    async fn non_2xx_fails() {
        let transport = Arc::new(Recorder {
            status: 503,
            seen: Mutex::new(vec![]),
        });
        let err = HttpExecutor::new(transport)
            .execute(&node(), ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("HTTP 503"));
        assert!(err.is_retryable());
    }
}
