use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use keyword_engine::combine::KeywordOverview;
use keyword_engine::config::EngineConfig;
use keyword_engine::engine::EngineStats;
use keyword_engine::error::ResolutionError;
use keyword_engine::{mcp, types::*, AppState};

type ApiError = (StatusCode, Json<ErrorResponse>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::from_env()?;
    info!("Starting keyword engine");
    info!("Provider URL: {}", config.provider_url);
    if config.provider_login.is_empty() {
        warn!("KEYWORD_PROVIDER_LOGIN is not set; provider calls will be rejected");
    }

    let http_client = reqwest::Client::builder()
        .timeout(config.call_timeout)
        .gzip(true)
        .build()?;

    let state = Arc::new(AppState::new(config, http_client));
    let _maintenance = state
        .engine
        .spawn_maintenance(state.config.maintenance_interval);

    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(&state.config.listen_addr).await?;
    info!("Keyword engine listening on http://{}", state.config.listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/keywords/resolve", post(resolve_handler))
        .route("/keywords/overview", post(overview_handler))
        .route("/tickets/:kind/:id", get(ticket_handler))
        .route("/stats", get(stats_handler))
        .route("/mcp/tools", get(mcp::list_tools))
        .route("/mcp/call", post(mcp::call_tool))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "keyword-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

fn api_error(context: &str, err: &ResolutionError) -> ApiError {
    let status = StatusCode::from_u16(err.kind().http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("{} error: {}", context, err);
    } else {
        warn!("{} rejected: {}", context, err);
    }
    (status, Json(ErrorResponse::from(err)))
}

/// Pending resolutions are accepted, not failed.
fn resolution_status(resolution: &Resolution) -> StatusCode {
    if resolution.is_pending() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    }
}

async fn resolve_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<KeywordRequest>,
) -> Result<(StatusCode, Json<Resolution>), ApiError> {
    match state.engine.resolve(&request).await {
        Ok(resolution) => Ok((resolution_status(&resolution), Json(resolution))),
        Err(e) => Err(api_error("Resolve", &e)),
    }
}

async fn overview_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OverviewRequest>,
) -> Result<Json<KeywordOverview>, ApiError> {
    info!("Processing overview request: {}", request.keyword);
    state
        .engine
        .overview(&request)
        .await
        .map(Json)
        .map_err(|e| api_error("Overview", &e))
}

async fn ticket_handler(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<Resolution>), ApiError> {
    let kind: TaskKind = kind.parse().map_err(|e| api_error("Ticket", &e))?;
    match state.engine.resume_ticket(kind, &id).await {
        Ok(resolution) => Ok((resolution_status(&resolution), Json(resolution))),
        Err(e) => Err(api_error("Ticket", &e)),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<EngineStats> {
    Json(state.engine.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyword_engine::error::{ErrorKind, UpstreamSignal};
    use keyword_engine::provider::{TaskState, UpstreamClient};

    /// Upstream that is never reached; routing needs no network.
    struct Unreachable;

    #[async_trait::async_trait]
    impl UpstreamClient for Unreachable {
        async fn post_task(&self, _: TaskKind, _: &TaskInput) -> Result<String, UpstreamSignal> {
            Err(UpstreamSignal::Transport("offline".into()))
        }

        async fn get_task(&self, _: TaskKind, _: &str) -> Result<TaskState, UpstreamSignal> {
            Err(UpstreamSignal::Transport("offline".into()))
        }
    }

    #[test]
    fn errors_surface_with_their_kind_status() {
        let (status, body) = api_error("test", &ResolutionError::Validation("empty".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.0.kind, ErrorKind::Validation);

        let (status, body) = api_error("test", &ResolutionError::Auth("login=secret".into()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.0.error.contains("secret"));

        let (status, _) = api_error("test", &ResolutionError::Timeout("slow".into()));
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn router_builds_without_network() {
        let state = Arc::new(AppState::with_upstream(EngineConfig::default(), Arc::new(Unreachable)));
        let _ = router(state);
    }
}
