//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::cluster::{spawn_idle_reaper, Kubectl, Provisioner, ProvisionerConfig};
use crate::error::{SandboxError, SandboxResult};
use crate::protocol::{
    AcquireRequest, CleanupResponse, ExecuteRequest, ExecuteResponse, HealthResponse, Lease,
    ListRequest, ListResponse, ReadFileRequest, ReadFileResponse, ReleaseRequest, ReleaseResponse,
    ReplaceRequest, ReplaceResponse, WriteFileRequest, WriteFileResponse,
};
use crate::state::AppState;

impl SandboxError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Path(_)
            | Self::CommandRefused { .. }
            | Self::InvalidRequest { .. }
            | Self::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::ActionFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Disabled | Self::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::StartupFailed { .. }
            | Self::InvalidResponse { .. }
            | Self::Remote { .. }
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SandboxError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "request failed");
        } else {
            warn!(kind = self.kind(), error = %self, "request rejected");
        }
        (status, Json(self.to_body())).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, SandboxError>;

/// Build the router. `/healthz` is always open; `/v1` routes require the
/// bearer token when one is configured.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/v1/sandbox/acquire", post(acquire))
        .route("/v1/sandbox/release", post(release))
        .route("/v1/sandbox/execute", post(execute))
        .route("/v1/sandbox/ls", post(list))
        .route("/v1/sandbox/read_file", post(read_file))
        .route("/v1/sandbox/write_file", post(write_file))
        .route("/v1/sandbox/replace", post(replace))
        .route("/v1/sandbox/cleanup_idle", post(cleanup_idle))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/healthz", get(health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the provisioner: HTTP API plus the idle reaper, until Ctrl-C.
pub async fn run_server(config: ProvisionerConfig) -> SandboxResult<()> {
    config.validate()?;
    let control = Arc::new(Kubectl::new(
        config.kubectl.clone(),
        config.kube_context.clone(),
        config.namespace.clone(),
    ));
    let provisioner = Arc::new(Provisioner::new(config.clone(), control));

    // Spawn cleanup task
    let reaper = spawn_idle_reaper(Arc::clone(&provisioner), config.cleanup_interval());

    let state = AppState::new(provisioner);
    if state.api_key.is_none() {
        warn!("no API key configured, /v1 routes are unauthenticated");
    }
    let app = router(state);

    info!(
        addr = %config.bind,
        namespace = %config.namespace,
        image = %config.worker_image,
        "Starting provisioner"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.abort();
    info!("provisioner stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if token_matches(presented, expected) {
        next.run(request).await
    } else {
        SandboxError::Unauthorized.into_response()
    }
}

fn token_matches(presented: Option<&str>, expected: &str) -> bool {
    presented.is_some_and(|token| token.as_bytes().ct_eq(expected.as_bytes()).into())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.provisioner.health())
}

async fn acquire(State(state): State<AppState>, Json(req): Json<AcquireRequest>) -> ApiResult<Lease> {
    Ok(Json(state.provisioner.acquire(&req.identity).await?))
}

async fn release(
    State(state): State<AppState>,
    Json(req): Json<ReleaseRequest>,
) -> ApiResult<ReleaseResponse> {
    Ok(Json(state.provisioner.release(&req).await?))
}

async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> ApiResult<ExecuteResponse> {
    Ok(Json(state.provisioner.execute(&req).await?))
}

async fn list(State(state): State<AppState>, Json(req): Json<ListRequest>) -> ApiResult<ListResponse> {
    Ok(Json(state.provisioner.list(&req).await?))
}

async fn read_file(
    State(state): State<AppState>,
    Json(req): Json<ReadFileRequest>,
) -> ApiResult<ReadFileResponse> {
    Ok(Json(state.provisioner.read_file(&req).await?))
}

async fn write_file(
    State(state): State<AppState>,
    Json(req): Json<WriteFileRequest>,
) -> ApiResult<WriteFileResponse> {
    Ok(Json(state.provisioner.write_file(&req).await?))
}

async fn replace(
    State(state): State<AppState>,
    Json(req): Json<ReplaceRequest>,
) -> ApiResult<ReplaceResponse> {
    Ok(Json(state.provisioner.replace(&req).await?))
}

async fn cleanup_idle(State(state): State<AppState>) -> ApiResult<CleanupResponse> {
    let report = state.provisioner.cleanup_idle().await?;
    info!(count = report.count, "on-demand idle sweep");
    Ok(Json(report))
}
