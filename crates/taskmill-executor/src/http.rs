//! One outbound HTTP request per work item. Never retried.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value};
use taskmill_core::config::HttpConfig;
use taskmill_core::{ExecutionResult, ExecutorKind, FailureKind, WorkItem};
use tracing::{debug, instrument, warn};

use crate::executor::{elapsed, parse_args, Executor, HttpArgs};
use crate::truncate::{truncate_output, DEFAULT_MAX_CHARS};

/// Methods a task may use. Anything else is rejected before sending.
pub const ALLOWED_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpExecutor {
    pub fn new(config: &HttpConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            default_timeout: Duration::from_secs(config.default_timeout_secs),
        })
    }
}

/// Methods whose `data` travels as a JSON body; the rest send it as query
/// parameters.
fn sends_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

fn query_pairs(data: &Map<String, Value>) -> Vec<(String, String)> {
    data.iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

fn parse_method(raw: &str) -> Result<Method, String> {
    let upper = raw.trim().to_ascii_uppercase();
    if !ALLOWED_METHODS.contains(&upper.as_str()) {
        return Err(format!("unsupported HTTP method: {raw}"));
    }
    Method::from_bytes(upper.as_bytes()).map_err(|e| e.to_string())
}

#[async_trait]
impl Executor for HttpExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::HttpCall
    }

    #[instrument(skip_all, fields(task_id = item.task_id().unwrap_or("-")))]
    async fn execute(&self, item: &WorkItem) -> ExecutionResult {
        let start = Instant::now();
        let args: HttpArgs = match parse_args(item) {
            Ok(args) => args,
            Err(failure) => return failure,
        };
        let method = match parse_method(&args.method) {
            Ok(method) => method,
            Err(reason) => {
                return ExecutionResult::failure(FailureKind::Validation, reason, elapsed(start))
            }
        };
        let timeout = args
            .timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut request = self
            .client
            .request(method.clone(), &args.url)
            .timeout(timeout);
        for (name, value) in &args.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !args.data.is_empty() {
            request = if sends_body(&method) {
                request.json(&args.data)
            } else {
                request.query(&query_pairs(&args.data))
            };
        }

        debug!(method = %method, url = %args.url, "sending request");
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(url = %args.url, timeout = ?timeout, "request timed out");
                return ExecutionResult::failure(
                    FailureKind::Timeout,
                    format!("request timed out after {}s", timeout.as_secs()),
                    elapsed(start),
                )
                .with_detail("url", args.url)
                .with_detail("method", method.as_str());
            }
            Err(e) => {
                warn!(url = %args.url, error = %e, "request failed");
                return ExecutionResult::failure(
                    FailureKind::Execution,
                    format!("request failed: {e}"),
                    elapsed(start),
                )
                .with_detail("url", args.url)
                .with_detail("method", method.as_str());
            }
        };

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), Value::String(v.to_string())))
            })
            .collect();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return ExecutionResult::failure(
                    FailureKind::Execution,
                    format!("failed to read response body: {e}"),
                    elapsed(start),
                )
                .with_detail("status_code", status.as_u16())
            }
        };
        let json = serde_json::from_str::<Value>(&text).ok();
        let execution_time = elapsed(start);

        let result = if status.is_success() {
            let value = json
                .clone()
                .unwrap_or_else(|| Value::String(truncate_output(&text, DEFAULT_MAX_CHARS)));
            ExecutionResult::success(value, execution_time)
        } else {
            ExecutionResult::failure(FailureKind::Execution, format!("HTTP {status}"), execution_time)
        };
        debug!(status = status.as_u16(), "response received");

        result
            .with_detail("status_code", status.as_u16())
            .with_detail("url", args.url)
            .with_detail("method", method.as_str())
            .with_detail("headers", headers)
            .with_detail("response_text", truncate_output(&text, DEFAULT_MAX_CHARS))
            .with_detail("response_json", json.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn methods_are_case_insensitive_and_bounded() {
        assert_eq!(parse_method("post").unwrap(), Method::POST);
        assert_eq!(parse_method(" Options ").unwrap(), Method::OPTIONS);
        assert!(parse_method("TRACE").is_err());
        assert!(parse_method("BREW").is_err());
    }

    #[test]
    fn only_write_methods_send_a_body() {
        assert!(sends_body(&Method::POST));
        assert!(sends_body(&Method::PATCH));
        assert!(!sends_body(&Method::GET));
        assert!(!sends_body(&Method::DELETE));
    }

    #[test]
    fn query_values_are_stringified() {
        let data = json!({"q": "rust", "page": 2, "exact": true});
        let mut pairs = query_pairs(data.as_object().unwrap());
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("exact".to_string(), "true".to_string()),
                ("page".to_string(), "2".to_string()),
                ("q".to_string(), "rust".to_string()),
            ]
        );
    }
}
