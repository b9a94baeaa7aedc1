//! Streaming client for the analysis workflow service.
//!
//! One POST per analysis, `response_mode = "streaming"`. The body is fed
//! through [`EventStream`] and folded by an [`Accumulator`] into a single
//! [`EnrichmentResult`] once the stream closes.

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::stream::{EventStream, StreamEvent};
use super::{AnalysisRequest, Analyzer, EnrichmentResult};
use crate::config::AnalysisConfig;
use crate::error::{LensError, Result};

/// Returned when the stream closes without any text or outputs.
pub const NO_OUTPUT_TEXT: &str = "analysis completed but no output";

/// Returned, without any network call, when endpoint or key is missing.
pub const NOT_CONFIGURED_TEXT: &str = "analysis unavailable: workflow service not configured";

/// Folds stream events into a final result.
#[derive(Debug, Default)]
pub struct Accumulator {
    text: String,
    outputs: Option<Map<String, Value>>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::TextChunk { text } => self.text.push_str(&text),
            StreamEvent::Message { answer } => self.text.push_str(&answer),
            StreamEvent::WorkflowFinished { outputs } => self.outputs = Some(outputs),
            StreamEvent::Unrecognized { event } => {
                debug!(event = %event, "Ignoring workflow event");
            }
        }
    }

    /// Resolve in priority order: streamed text, first string output,
    /// serialized outputs, then the no-output sentinel.
    pub fn resolve(self) -> EnrichmentResult {
        if !self.text.trim().is_empty() {
            return EnrichmentResult::success(self.text);
        }
        if let Some(outputs) = self.outputs {
            if let Some(text) = outputs.values().find_map(Value::as_str) {
                return EnrichmentResult::success(text);
            }
            let dumped = serde_json::to_string(&outputs).unwrap_or_else(|_| "{}".to_string());
            return EnrichmentResult::success(dumped);
        }
        EnrichmentResult::success(NO_OUTPUT_TEXT)
    }
}

/// Drain an event stream to completion and resolve it.
///
/// The first transport error aborts accumulation and yields a failure.
pub async fn collect_events<S, E>(events: S) -> EnrichmentResult
where
    S: Stream<Item = std::result::Result<StreamEvent, E>>,
    E: Display,
{
    futures::pin_mut!(events);
    let mut acc = Accumulator::new();
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => acc.apply(event),
            Err(e) => return EnrichmentResult::failure(format!("Workflow stream error: {}", e)),
        }
    }
    acc.resolve()
}

/// HTTP client for the workflow `run` endpoint.
pub struct WorkflowClient {
    endpoint: Option<String>,
    api_key: Option<String>,
    user: String,
    http: Client,
}

impl std::fmt::Debug for WorkflowClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowClient")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("user", &self.user)
            .finish()
    }
}

impl WorkflowClient {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| LensError::Config(format!("Failed to build HTTP client: {}", e)))?;
        let non_blank = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());
        Ok(Self {
            endpoint: non_blank(&config.endpoint),
            api_key: non_blank(&config.api_key),
            user: config.user.clone(),
            http,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some() && self.api_key.is_some()
    }

    fn run_url(endpoint: &str) -> String {
        format!("{}/workflows/run", endpoint.trim_end_matches('/'))
    }

    /// Request body for a streaming workflow run.
    pub fn build_body(&self, request: &AnalysisRequest) -> Value {
        let data = serde_json::to_string(request.rows.as_ref()).unwrap_or_else(|_| "[]".into());
        json!({
            "inputs": {
                "query_id": request.query_id,
                "prompt": request.prompt,
                "data": data,
            },
            "response_mode": "streaming",
            "user": self.user,
        })
    }
}

#[async_trait]
impl Analyzer for WorkflowClient {
    async fn request_analysis(&self, request: &AnalysisRequest) -> EnrichmentResult {
        let (Some(endpoint), Some(api_key)) = (&self.endpoint, &self.api_key) else {
            debug!("Analysis requested but workflow service is not configured");
            return EnrichmentResult::success(NOT_CONFIGURED_TEXT);
        };

        let url = Self::run_url(endpoint);
        let resp = match self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&self.build_body(request))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "Workflow request failed");
                return EnrichmentResult::failure(format!("Workflow request failed: {}", e));
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, "Workflow service returned an error status");
            return EnrichmentResult::failure(format!(
                "HTTP {} from workflow service: {}",
                status, body
            ));
        }

        let result = collect_events(EventStream::new(Box::pin(resp.bytes_stream()))).await;
        if let EnrichmentResult::Failure { reason } = &result {
            warn!(reason = %reason, "Workflow stream aborted");
        }
        result
    }
}
