//! AI narrative enrichment over a streaming analysis workflow.

pub mod client;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::store::Row;

pub use client::{Accumulator, WorkflowClient, NOT_CONFIGURED_TEXT, NO_OUTPUT_TEXT};
pub use stream::{DecoderState, EventStream, SseDecoder, StreamEvent};

/// Input for one analysis run.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub query_id: String,
    pub prompt: String,
    pub rows: Arc<Vec<Row>>,
}

/// Outcome of one enrichment attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentResult {
    Success { text: String },
    Failure { reason: String },
}

impl EnrichmentResult {
    pub fn success(text: impl Into<String>) -> Self {
        Self::Success { text: text.into() }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Produces a narrative for a query result. Never errors: failures are
/// reported as [`EnrichmentResult::Failure`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn request_analysis(&self, request: &AnalysisRequest) -> EnrichmentResult;
}
