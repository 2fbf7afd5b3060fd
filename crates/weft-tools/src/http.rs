use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use weft_core::config::HttpConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::HttpTransport;
use weft_core::types::{HttpRequestSpec, HttpResponse};

/// [`HttpTransport`] over a shared reqwest client.
pub struct ReqwestTransport {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| WeftError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }
}

/// Cut `text` to at most `max` bytes on a char boundary.
fn truncate(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: HttpRequestSpec) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            let method = request
                .method
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|e| WeftError::execution(format!("Invalid method: {}", e)))?;

            debug!(method = %method, url = %request.url, "Sending HTTP request");

            let mut req = self.client.request(method, &request.url);
            for (k, v) in &request.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Some(timeout_ms) = request.timeout_ms {
                req = req.timeout(Duration::from_millis(timeout_ms));
            }
            match request.body {
                Some(Value::String(text)) => req = req.body(text),
                Some(Value::Null) | None => {}
                Some(body) => req = req.json(&body),
            }

            let resp = req.send().await.map_err(|e| {
                WeftError::execution(format!("Request to {} failed: {}", request.url, e))
            })?;

            let status = resp.status().as_u16();
            let headers: HashMap<String, String> = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
                .collect();
            let text = resp.text().await.map_err(|e| {
                WeftError::execution(format!("Failed to read response body: {}", e))
            })?;
            let text = truncate(text, self.max_body_bytes);
            let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

            debug!(status, "HTTP response received");
            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}
