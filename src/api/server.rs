//! Axum API server for the dashboard frontend.

use std::future::Future;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{LensError, Result};
use crate::pipeline::Pipeline;

/// Shared state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

/// Build the axum router with all API routes.
pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/api/health", get(super::routes::health::get_health))
        .route("/api/queries", get(super::routes::query::list_queries))
        .route("/api/query", post(super::routes::query::run_query))
        .route("/api/cache/flush", post(super::routes::cache::flush_cache))
        .route("/api/cache/stats", get(super::routes::cache::cache_stats))
        // Request bodies are small JSON documents.
        .layer(DefaultBodyLimit::max(256 * 1024))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(shared_state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn start_server<F>(config: &ServerConfig, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state, &config.cors_origins);
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .map_err(|e| LensError::Config(format!("Failed to bind {}: {}", config.bind, e)))?;
    info!("API server listening on {}", config.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use super::*;
    use crate::analysis::{EnrichmentResult, MockAnalyzer};
    use crate::cache::{CacheSettings, TtlCache};
    use crate::error::LensError;
    use crate::registry::{QueryDefinition, QueryRegistry};
    use crate::store::{MockRowStore, Row};

    /// State over a mock store: `sales` succeeds, `broken` fails.
    pub(crate) fn test_state() -> AppState {
        let registry = QueryRegistry::from_definitions(vec![
            QueryDefinition::new("sales", "SELECT day, total FROM sales WHERE region = $1")
                .with_analysis("Describe the sales trend."),
            QueryDefinition::new("broken", "SELECT * FROM missing_table"),
        ])
        .unwrap();

        let mut store = MockRowStore::new();
        store.expect_execute().returning(|sql, _| {
            if sql.contains("missing_table") {
                return Err(LensError::Execution(
                    "relation \"missing_table\" does not exist".into(),
                ));
            }
            let mut row = Row::new();
            row.insert("day".into(), serde_json::json!("2024-03-01"));
            row.insert("total".into(), serde_json::json!(99.5));
            Ok(vec![row])
        });
        let mut analyzer = MockAnalyzer::new();
        analyzer
            .expect_request_analysis()
            .returning(|_| EnrichmentResult::failure("upstream reset"));

        let cache = Arc::new(TtlCache::new(CacheSettings {
            default_ttl: Duration::from_secs(60),
            sweep_interval: None,
        }));
        let pipeline = Pipeline::new(
            Arc::new(registry),
            Arc::new(store),
            Arc::new(analyzer),
            cache,
        );
        AppState::new(Arc::new(pipeline))
    }
}
