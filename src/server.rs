//! Reward Ledger Server
//!
//! HTTP surface for accounts, task completion, referrals and the task
//! catalog. All routes except `/health` live under `/api/v1`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        FromRequest, FromRequestParts, Path, Request, State,
    },
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::auth::TokenIssuer;
use crate::engine::{RegisterRequest, RewardEngine};
use crate::error::{ErrorKind, LedgerError};
use crate::store::LedgerStore;
use crate::types::NewTask;

pub struct AppState<S> {
    pub engine: RewardEngine<S>,
    pub tokens: TokenIssuer,
    pub started_at: std::time::Instant,
}

impl<S: LedgerStore> AppState<S> {
    pub fn new(engine: RewardEngine<S>, tokens: TokenIssuer) -> Self {
        Self {
            engine,
            tokens,
            started_at: std::time::Instant::now(),
        }
    }
}

pub fn create_router<S: LedgerStore>(state: Arc<AppState<S>>) -> Router {
    let api = Router::new()
        .route("/register", post(register_handler::<S>))
        .route("/login", post(login_handler::<S>))
        .route("/users/leaderboard", get(leaderboard_handler::<S>))
        .route("/users/:id/status", get(user_status_handler::<S>))
        .route("/users/:id/task/complete", post(complete_task_handler::<S>))
        .route("/users/:id/referrer", post(referrer_handler::<S>))
        .route("/tasks/all", get(list_tasks_handler::<S>))
        .route("/tasks/create", post(create_task_handler::<S>))
        .route("/tasks/:id", get(get_task_handler::<S>))
        .route("/tasks/:id/updateReward", post(update_reward_handler::<S>));

    Router::new()
        .route("/health", get(health_handler::<S>))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// ERRORS
// ============================================================================

/// Error response: `{"status":"error","message":...}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authorization required")
    }

    fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden")
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err.kind() {
            ErrorKind::NotFound
            | ErrorKind::AlreadyExists
            | ErrorKind::AlreadyCompleted
            | ErrorKind::Rejected => Self::new(StatusCode::BAD_REQUEST, err.to_string()),
            ErrorKind::Transient => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "service temporarily unavailable",
            ),
            // Already reported with full context by the engine
            ErrorKind::Internal => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        debug!("Rejected request body: {}", rejection.body_text());
        Self::new(StatusCode::BAD_REQUEST, "invalid request body")
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        debug!("Rejected path: {}", rejection.body_text());
        Self::new(StatusCode::BAD_REQUEST, "invalid path parameter")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "status": "error", "message": self.message })),
        )
            .into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn success(body: serde_json::Value) -> Response {
    success_with(StatusCode::OK, body)
}

fn success_with(status: StatusCode, mut body: serde_json::Value) -> Response {
    if let Some(map) = body.as_object_mut() {
        map.insert("status".to_string(), json!("success"));
    }
    (status, Json(body)).into_response()
}

// ============================================================================
// BODY AND PATH EXTRACTORS
// ============================================================================

/// `Json` whose rejections use the error body shape
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// `Path` whose rejections use the error body shape
pub struct ApiPath<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

// ============================================================================
// AUTH EXTRACTOR
// ============================================================================

/// Id of the user carried by a valid bearer token
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub i64);

impl AuthUser {
    fn ensure(&self, user_id: i64) -> Result<(), ApiError> {
        if self.0 == user_id {
            Ok(())
        } else {
            Err(ApiError::forbidden())
        }
    }
}

#[async_trait]
impl<S: LedgerStore> FromRequestParts<Arc<AppState<S>>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState<S>>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(ApiError::unauthorized)?;

        state
            .tokens
            .verify(token.trim())
            .map(AuthUser)
            .ok_or_else(ApiError::unauthorized)
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    healthy: bool,
    uptime_secs: u64,
    version: &'static str,
}

async fn health_handler<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn register_handler<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    ApiJson(request): ApiJson<RegisterRequest>,
) -> ApiResult {
    let id = state.engine.register(request).await?;
    Ok(success_with(StatusCode::CREATED, json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login_handler<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    ApiJson(request): ApiJson<LoginRequest>,
) -> ApiResult {
    let user = state
        .engine
        .authenticate(&request.username, &request.password)
        .await?;
    let token = state.tokens.issue(user.id)?;
    Ok(success(json!({ "token": token, "user_id": user.id })))
}

async fn user_status_handler<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    _auth: AuthUser,
    ApiPath(user_id): ApiPath<i64>,
) -> ApiResult {
    let user = state.engine.user_status(user_id).await?;
    Ok(success(json!({ "user": user })))
}

async fn leaderboard_handler<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    _auth: AuthUser,
) -> ApiResult {
    let leaderboard = state.engine.leaderboard().await?;
    Ok(success(json!({ "leaderboard": leaderboard })))
}

#[derive(Debug, Deserialize)]
struct CompleteTaskRequest {
    task_id: i64,
}

async fn complete_task_handler<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    auth: AuthUser,
    ApiPath(user_id): ApiPath<i64>,
    ApiJson(request): ApiJson<CompleteTaskRequest>,
) -> ApiResult {
    auth.ensure(user_id)?;
    let balance = state
        .engine
        .complete_task(user_id, request.task_id)
        .await?;
    Ok(success(json!({ "balance": balance })))
}

#[derive(Debug, Deserialize)]
struct ReferrerRequest {
    referrer_code: String,
}

async fn referrer_handler<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    auth: AuthUser,
    ApiPath(user_id): ApiPath<i64>,
    ApiJson(request): ApiJson<ReferrerRequest>,
) -> ApiResult {
    auth.ensure(user_id)?;
    let reward = state
        .engine
        .apply_referral(user_id, &request.referrer_code)
        .await?;
    Ok(success(json!({
        "bonus": reward.bonus,
        "balance": reward.redeemer_balance,
    })))
}

async fn list_tasks_handler<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    _auth: AuthUser,
) -> ApiResult {
    let tasks = state.engine.list_tasks().await?;
    Ok(success(json!({ "tasks": tasks })))
}

async fn get_task_handler<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    _auth: AuthUser,
    ApiPath(task_id): ApiPath<i64>,
) -> ApiResult {
    let task = state.engine.get_task(task_id).await?;
    Ok(success(json!({ "task": task })))
}

async fn create_task_handler<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    _auth: AuthUser,
    ApiJson(task): ApiJson<NewTask>,
) -> ApiResult {
    let id = state.engine.create_task(task).await?;
    Ok(success_with(StatusCode::CREATED, json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
struct UpdateRewardRequest {
    reward: i64,
}

async fn update_reward_handler<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    _auth: AuthUser,
    ApiPath(task_id): ApiPath<i64>,
    ApiJson(request): ApiJson<UpdateRewardRequest>,
) -> ApiResult {
    state
        .engine
        .update_task_reward(task_id, request.reward)
        .await?;
    Ok(success(json!({})))
}

// ============================================================================
// SERVE
// ============================================================================

/// Run the server until Ctrl-C
pub async fn run_server<S: LedgerStore>(
    host: &str,
    port: u16,
    state: Arc<AppState<S>>,
) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!("Starting Reward Ledger server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        // Without a signal handler, keep serving
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
