//! The `http` step executor.
//!
//! Builds an outbound request from the resolved spec, enforces a per-step
//! timeout, and reads the response body incrementally against two
//! thresholds: past the soft limit the step fails with a truncation error
//! (a body the workflow may feed into later steps must never be silently
//! cut), past the hard limit the read is aborted regardless. Successful
//! bodies come back wrapped in the HTTP envelope so downstream template
//! resolution can strip the bookkeeping.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;
use runloom_core::workflow::executor::{
    ExecutorError, ExecutorInput, ExecutorOutput, StepExecutor,
};
use runloom_types::config::HttpConfig;
use runloom_types::envelope::{self, HttpBodyMeta};
use runloom_types::workflow::{HttpMethod, HttpRequestSpec};
use serde_json::Value;

pub struct HttpExecutor {
    client: reqwest::Client,
    config: HttpConfig,
}

impl HttpExecutor {
    pub fn new(config: &HttpConfig) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ExecutorError::Http(e.to_string()))?;
        Ok(HttpExecutor {
            client,
            config: config.clone(),
        })
    }

    fn build_request(&self, spec: &HttpRequestSpec) -> Result<reqwest::RequestBuilder, ExecutorError> {
        if !spec.url.starts_with("http://") && !spec.url.starts_with("https://") {
            return Err(invalid(format!(
                "url must be http(s), got '{}'",
                spec.url
            )));
        }

        let method = match spec.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let mut request = self.client.request(method, &spec.url);

        if let Some(query) = &spec.query {
            let mut pairs = Vec::with_capacity(query.len());
            for (key, value) in query {
                pairs.push((key.as_str(), query_value(key, value)?));
            }
            request = request.query(&pairs);
        }

        if let Some(headers) = &spec.headers {
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }

        // JSON body for mutating methods; `.json` only sets Content-Type
        // when the caller has not supplied one.
        if let Some(body) = &spec.body {
            if spec.method.is_mutating() {
                request = request.json(body);
            }
        }

        let timeout_ms = spec.timeout_ms.unwrap_or(self.config.timeout_ms);
        Ok(request.timeout(Duration::from_millis(timeout_ms)))
    }

    async fn read_body(
        &self,
        response: reqwest::Response,
        timeout_ms: u64,
    ) -> Result<(Vec<u8>, usize), ExecutorError> {
        let limit = self.config.soft_max_body_bytes.min(self.config.hard_max_body_bytes);
        let mut body = Vec::new();
        let mut bytes_read = 0usize;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport_error(e, timeout_ms))?;
            bytes_read += chunk.len();
            if bytes_read > limit {
                // Reading stops here; dropping the stream aborts the
                // transfer.
                return Err(ExecutorError::BodyTooLarge { bytes_read, limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok((body, bytes_read))
    }
}

impl StepExecutor for HttpExecutor {
    fn step_type(&self) -> &'static str {
        "http"
    }

    async fn execute(&self, input: &ExecutorInput) -> Result<ExecutorOutput, ExecutorError> {
        let spec: HttpRequestSpec = serde_json::from_value(input.request.clone())
            .map_err(|e| invalid(e.to_string()))?;
        let timeout_ms = spec.timeout_ms.unwrap_or(self.config.timeout_ms);

        let response = self
            .build_request(&spec)?
            .send()
            .await
            .map_err(|e| transport_error(e, timeout_ms))?;

        let status_code = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        let (body, bytes_read) = self.read_body(response, timeout_ms).await?;
        let data = parse_body(&body, content_type.as_deref());

        let meta = HttpBodyMeta {
            content_type,
            truncated: false,
            bytes_read,
            soft_max_bytes: self.config.soft_max_body_bytes,
            hard_max_bytes: self.config.hard_max_body_bytes,
        };
        Ok(ExecutorOutput {
            status_code,
            headers: Some(headers),
            body: envelope::wrap(&meta, data),
        })
    }
}

fn invalid(message: String) -> ExecutorError {
    ExecutorError::InvalidRequest {
        step_type: "http",
        message,
    }
}

fn transport_error(err: reqwest::Error, timeout_ms: u64) -> ExecutorError {
    if err.is_timeout() {
        ExecutorError::Timeout { timeout_ms }
    } else {
        ExecutorError::Http(err.to_string())
    }
}

/// Stringify a query value; only scalars are allowed.
fn query_value(key: &str, value: &Value) -> Result<String, ExecutorError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(invalid(format!(
            "query parameter '{key}' must be a string, number, or boolean"
        ))),
    }
}

/// JSON content types parse; everything else comes back as text.
fn parse_body(body: &[u8], content_type: Option<&str>) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    let is_json = content_type
        .map(|ct| ct.contains("application/json") || ct.contains("+json"))
        .unwrap_or(false);
    if is_json {
        if let Ok(value) = serde_json::from_slice(body) {
            return value;
        }
    }
    Value::String(String::from_utf8_lossy(body).into_owned())
}

// ===========================================================================
// Tests
// ===========================================================================
