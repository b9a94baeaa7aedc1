//! Request pipeline: registry lookup, cached query execution and
//! best-effort analysis enrichment.
//!
//! The one rule this module exists to enforce: an enrichment fault never
//! turns into a data-retrieval fault. Once rows are fetched the response is
//! `ok`; a failed analysis only degrades the `analysis` field to
//! [`ANALYSIS_UNAVAILABLE_TEXT`].

pub mod singleflight;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::analysis::{AnalysisRequest, Analyzer, EnrichmentResult, WorkflowClient};
use crate::cache::{derive_key, CacheKey, CacheSettings, CacheStats, TtlCache};
use crate::config::Config;
use crate::error::{ErrorKind, LensError, Result};
use crate::registry::{QueryDefinition, QueryRegistry};
use crate::store::{PgRowStore, Row, RowStore};

pub use singleflight::SingleFlight;

/// Placeholder analysis when the workflow call fails.
pub const ANALYSIS_UNAVAILABLE_TEXT: &str = "analysis temporarily unavailable";

/// Shared, read-only query result.
pub type Rows = Arc<Vec<Row>>;

type FetchOutcome = std::result::Result<Rows, Arc<LensError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of one pipeline request.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResponse {
    pub status: ResponseStatus,
    pub query_id: String,
    pub data: Option<Rows>,
    pub analysis: Option<String>,
    pub error: Option<ErrorBody>,
    /// Rows were served from the cache.
    pub cached: bool,
    pub generated_at: DateTime<Utc>,
}

impl PipelineResponse {
    fn success(query_id: &str, rows: Rows, analysis: Option<String>, cached: bool) -> Self {
        Self {
            status: ResponseStatus::Ok,
            query_id: query_id.to_string(),
            data: Some(rows),
            analysis,
            error: None,
            cached,
            generated_at: Utc::now(),
        }
    }

    fn failure(query_id: &str, err: &LensError) -> Self {
        Self {
            status: ResponseStatus::Error,
            query_id: query_id.to_string(),
            data: None,
            analysis: None,
            error: Some(ErrorBody {
                kind: err.kind(),
                message: err.to_string(),
            }),
            cached: false,
            generated_at: Utc::now(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Orchestrates registry, cache, row-store and analyzer.
pub struct Pipeline {
    registry: Arc<QueryRegistry>,
    store: Arc<dyn RowStore>,
    analyzer: Arc<dyn Analyzer>,
    cache: Arc<TtlCache<Rows>>,
    coalesce: bool,
    fetches: SingleFlight<CacheKey, FetchOutcome>,
    analyses: SingleFlight<CacheKey, EnrichmentResult>,
}

impl Pipeline {
    pub fn new(
        registry: Arc<QueryRegistry>,
        store: Arc<dyn RowStore>,
        analyzer: Arc<dyn Analyzer>,
        cache: Arc<TtlCache<Rows>>,
    ) -> Self {
        Self {
            registry,
            store,
            analyzer,
            cache,
            coalesce: true,
            fetches: SingleFlight::new(),
            analyses: SingleFlight::new(),
        }
    }

    /// Toggle coalescing of identical in-flight fetches and analyses.
    pub fn with_coalescing(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    /// Wire the production collaborators from config: registry file,
    /// Postgres pool, workflow client and a sweeping cache.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let registry = Arc::new(QueryRegistry::load(&config.registry.path)?);
        let store: Arc<dyn RowStore> = Arc::new(PgRowStore::connect(&config.database).await?);
        let analyzer: Arc<dyn Analyzer> = Arc::new(WorkflowClient::new(&config.analysis)?);
        let cache = TtlCache::init(CacheSettings::from(&config.cache));
        if !config.analysis.is_configured() {
            info!("Analysis workflow not configured; analysis requests return a placeholder");
        }
        Ok(Self::new(registry, store, analyzer, cache).with_coalescing(config.cache.coalesce))
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    /// Serve one request. Never panics or errors: failures are encoded in
    /// the returned response.
    pub async fn handle(
        &self,
        query_id: &str,
        params: Vec<Value>,
        want_analysis: bool,
    ) -> PipelineResponse {
        let span = info_span!(
            "pipeline",
            request_id = %uuid::Uuid::new_v4(),
            query_id = %query_id,
        );
        self.handle_inner(query_id, params, want_analysis)
            .instrument(span)
            .await
    }

    async fn handle_inner(
        &self,
        query_id: &str,
        params: Vec<Value>,
        want_analysis: bool,
    ) -> PipelineResponse {
        let Some(def) = self.registry.lookup(query_id) else {
            let err = LensError::InvalidRequest(format!("Unknown query '{}'", query_id));
            warn!("Rejected request for unknown query");
            return PipelineResponse::failure(query_id, &err);
        };
        if let Err(err) = validate_params(def, &params) {
            warn!(error = %err, "Rejected request with invalid parameters");
            return PipelineResponse::failure(query_id, &err);
        }

        let key = derive_key(query_id, &params);
        let (rows, cached) = match self.cache.get(&key) {
            Some(rows) => {
                debug!(key = %key.short(), "Cache hit");
                (rows, true)
            }
            None => match self.fetch(def, key.clone(), params).await {
                Ok(rows) => (rows, false),
                Err(err) => {
                    warn!(error = %err, "Query execution failed");
                    return PipelineResponse::failure(query_id, &err);
                }
            },
        };

        let analysis = match def.analysis_prompt() {
            Some(prompt) if want_analysis => {
                Some(self.enrich(key, query_id, prompt, Arc::clone(&rows)).await)
            }
            _ => None,
        };

        info!(rows = rows.len(), cached, analysis = analysis.is_some(), "Request served");
        PipelineResponse::success(query_id, rows, analysis, cached)
    }

    /// Execute on the row-store and populate the cache.
    async fn fetch(
        &self,
        def: &QueryDefinition,
        key: CacheKey,
        params: Vec<Value>,
    ) -> FetchOutcome {
        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        let sql = def.sql.clone();
        let cache_key = key.clone();
        let call = move || async move {
            match store.execute(&sql, &params).await {
                Ok(rows) => {
                    let rows: Rows = Arc::new(rows);
                    cache.set(cache_key, Arc::clone(&rows));
                    FetchOutcome::Ok(rows)
                }
                Err(err) => FetchOutcome::Err(Arc::new(err)),
            }
        };

        if !self.coalesce {
            return call().await;
        }
        match self.fetches.run(key, call).await {
            Some((outcome, leader)) => {
                if !leader {
                    debug!("Joined in-flight query execution");
                }
                outcome
            }
            None => FetchOutcome::Err(Arc::new(LensError::Execution(
                "query execution task aborted".into(),
            ))),
        }
    }

    /// Run the analyzer, absorbing any failure into the placeholder text.
    async fn enrich(&self, key: CacheKey, query_id: &str, prompt: &str, rows: Rows) -> String {
        let analyzer = Arc::clone(&self.analyzer);
        let request = AnalysisRequest {
            query_id: query_id.to_string(),
            prompt: prompt.to_string(),
            rows,
        };
        let call = move || async move { analyzer.request_analysis(&request).await };

        let result = if self.coalesce {
            self.analyses
                .run(key, call)
                .await
                .map(|(result, _)| result)
                .unwrap_or_else(|| EnrichmentResult::failure("analysis task aborted"))
        } else {
            call().await
        };

        match result {
            EnrichmentResult::Success { text } => text,
            EnrichmentResult::Failure { reason } => {
                warn!(reason = %reason, "Analysis failed, serving data without it");
                ANALYSIS_UNAVAILABLE_TEXT.to_string()
            }
        }
    }

    /// Drop every cached result.
    pub fn flush_cache(&self) {
        self.cache.flush();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Stop background work (the cache sweep).
    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
    }
}

/// Parameters must be primitives and match the SQL's placeholder count.
fn validate_params(def: &QueryDefinition, params: &[Value]) -> Result<()> {
    if params
        .iter()
        .any(|p| matches!(p, Value::Array(_) | Value::Object(_)))
    {
        return Err(LensError::InvalidRequest(
            "Query parameters must be primitive values".into(),
        ));
    }
    if params.len() != def.param_count {
        return Err(LensError::InvalidRequest(format!(
            "Query '{}' expects {} parameter(s), got {}",
            def.id,
            def.param_count,
            params.len()
        )));
    }
    Ok(())
}
