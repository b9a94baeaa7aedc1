//! Query routes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::server::AppState;
use crate::error::ErrorKind;
use crate::pipeline::PipelineResponse;

/// Body of `POST /api/query`.
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query_id: String,
    #[serde(default)]
    pub params: Vec<Value>,
    /// Request an AI narrative alongside the rows.
    #[serde(default)]
    pub analysis: bool,
}

fn status_for(resp: &PipelineResponse) -> StatusCode {
    match resp.error_kind() {
        None => StatusCode::OK,
        Some(ErrorKind::InvalidRequest) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::ExecutionFailure) => StatusCode::BAD_GATEWAY,
    }
}

/// POST /api/query: run a registered query.
pub async fn run_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> (StatusCode, Json<PipelineResponse>) {
    let resp = state
        .pipeline
        .handle(&req.query_id, req.params, req.analysis)
        .await;
    (status_for(&resp), Json(resp))
}

/// GET /api/queries: registered queries for the frontend's picker.
pub async fn list_queries(State(state): State<Arc<AppState>>) -> Json<Value> {
    let queries: Vec<Value> = state
        .pipeline
        .registry()
        .definitions()
        .into_iter()
        .map(|d| {
            json!({
                "id": d.id,
                "description": d.description,
                "params": d.param_count,
                "analysis": d.analysis_prompt().is_some(),
            })
        })
        .collect();
    Json(json!({ "queries": queries }))
}
