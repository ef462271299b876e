//! HTTP API for credential operations
//!
//! Endpoints:
//! - POST /connect         authenticate (optionally rotating an expired password), then log off
//! - POST /password        self-service change through a pooled session
//! - POST /admin/password  privileged reset through the administrator session
//! - GET  /health          pool health summary
//! - GET  /metrics         Prometheus text exposition
//!
//! Bodies use the camelCase field names a driver would send and are
//! validated before any endpoint call. Failures render as
//! `{"error": {"code": "...", "message": "..."}}`.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use common::Secret;
use endpoint::{Error, ErrorKind, PrivilegeLevel, ServerEndpoint};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use session::{
    ConnectOptions, Identity, IdentityStore, PasswordChange, RotationPolicy, SessionHandle,
};
use session_pool::SessionPool;
use tokio::sync::Mutex;
use tracing::{info, warn};

static NULL: Value = Value::Null;

/// Administrator session used for privileged resets.
///
/// Reconnects lazily when the previous session was lost.
pub struct AdminSession {
    endpoint: Arc<dyn ServerEndpoint>,
    options: ConnectOptions,
    handle: Mutex<Option<SessionHandle>>,
}

impl AdminSession {
    /// Authenticate the administrator identity with administrator privilege.
    pub async fn connect(
        endpoint: Arc<dyn ServerEndpoint>,
        identity: &Identity,
        connect_string: &str,
    ) -> endpoint::Result<Self> {
        let options = identity
            .connect_options(connect_string)
            .privilege(PrivilegeLevel::Administrator);
        let handle = SessionHandle::connect(Arc::clone(&endpoint), &options).await?;
        info!(user = %identity.user, "administrator session established");
        Ok(Self {
            endpoint,
            options,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn user(&self) -> &str {
        &self.options.user
    }

    pub async fn is_connected(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(SessionHandle::is_active)
    }

    pub async fn change_password(
        &self,
        change: &PasswordChange,
    ) -> endpoint::Result<RotationPolicy> {
        let mut guard = self.handle.lock().await;
        if !guard.as_ref().is_some_and(SessionHandle::is_active) {
            info!(user = %self.options.user, "re-establishing administrator session");
            *guard = Some(SessionHandle::connect(Arc::clone(&self.endpoint), &self.options).await?);
        }
        let handle = guard.as_mut().ok_or_else(Error::session_closed)?;
        let result = handle.change_password(change).await;
        if matches!(&result, Err(e) if e.kind() == ErrorKind::SessionClosed) {
            *guard = None;
        }
        result
    }

    pub async fn close(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.close().await {
                warn!(user = %self.options.user, error = %e, "administrator logoff failed");
            }
        }
    }
}

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: SessionPool,
    pub endpoint: Arc<dyn ServerEndpoint>,
    /// Used when a /connect body carries no connectString
    pub connect_string: String,
    pub admin: Option<Arc<AdminSession>>,
    pub store: Option<Arc<IdentityStore>>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    /// Point the pool at a password rotated outside of it and persist it.
    async fn adopt_rotation(&self, user: &str, password: &Secret<String>) {
        if password.is_empty() || user != self.pool.user() {
            return;
        }
        self.pool.update_password(password.clone());
        if let Some(store) = &self.store {
            if let Err(e) = store.update_password(user, password).await {
                warn!(user, error = %e, "failed to persist rotated password");
            }
        }
    }
}

/// Build the axum router with all routes and shared state.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/connect", post(connect_handler))
        .route("/password", post(password_handler))
        .route("/admin/password", post(admin_password_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Endpoint error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::invalid_parameter_value(rejection.body_text()))
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidParameterType | ErrorKind::InvalidParameterValue => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::InvalidCredentials
        | ErrorKind::CredentialExpired
        | ErrorKind::InvalidOldCredential => StatusCode::UNAUTHORIZED,
        ErrorKind::InsufficientPrivilege => StatusCode::FORBIDDEN,
        ErrorKind::PoolTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::PoolClosed | ErrorKind::SessionClosed | ErrorKind::EndpointUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.0.kind().code(),
                "message": self.0.message(),
            }
        });
        (status_for(self.0.kind()), Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Run a handler body and record its outcome.
async fn timed(route: &'static str, handler: impl Future<Output = ApiResult>) -> Response {
    let start = Instant::now();
    let response = handler.await.into_response();
    let elapsed = start.elapsed().as_secs_f64();
    crate::metrics::record_request(route, response.status().as_u16(), elapsed);
    response
}

fn request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Build a `PasswordChange` from a JSON body.
///
/// Missing fields are reported like wrong-typed ones. With `old_optional`
/// an absent `oldPassword` is sent as empty.
fn password_change(body: &Value, old_optional: bool) -> endpoint::Result<PasswordChange> {
    let object = body
        .as_object()
        .ok_or_else(|| Error::invalid_parameter_value("request body must be a JSON object"))?;
    let field = |name: &str| object.get(name).unwrap_or(&NULL);
    let empty = Value::String(String::new());
    let old_password = match object.get("oldPassword") {
        None if old_optional => &empty,
        _ => field("oldPassword"),
    };
    PasswordChange::from_values(field("user"), old_password, field("newPassword"))
}

/// POST /connect: verify a login, rotating the password when `newPassword` is set.
async fn connect_handler(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    timed("/connect", verify_login(state, payload)).await
}

async fn verify_login(state: AppState, payload: Result<Json<Value>, JsonRejection>) -> ApiResult {
    let Json(body) = payload?;
    let request_id = request_id();
    let mut options = ConnectOptions::from_value(&body)?;
    if options.connect_string.is_empty() {
        options.connect_string = state.connect_string.clone();
    }
    let rotated = options.rotates();

    let session = SessionHandle::connect(Arc::clone(&state.endpoint), &options).await?;
    let privilege = session.privilege();

    // The rotation is committed once authentication succeeds.
    if let Some(new_password) = options.new_password.as_ref().filter(|_| rotated) {
        state.adopt_rotation(&options.user, new_password).await;
    }
    if let Err(e) = session.close().await {
        warn!(request_id, user = %options.user, error = %e, "logoff after login check failed");
    }
    info!(request_id, user = %options.user, rotated, "login verified");
    Ok(Json(json!({
        "user": options.user,
        "privilege": privilege.label(),
        "rotated": rotated,
    })))
}

/// POST /password: self-service change through a pooled session.
async fn password_handler(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    timed("/password", change_own_password(state, payload)).await
}

async fn change_own_password(
    state: AppState,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    let request_id = request_id();
    let change = password_change(&body, false)?;

    let mut session = state.pool.acquire().await?;
    let policy = session.change_password(&change).await?;
    session.release();

    info!(request_id, user = %change.user, policy = policy.label(), "password changed");
    Ok(Json(json!({ "user": change.user, "policy": policy.label() })))
}

/// POST /admin/password: privileged reset; `oldPassword` is optional and ignored.
async fn admin_password_handler(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    timed("/admin/password", reset_password(state, payload)).await
}

async fn reset_password(state: AppState, payload: Result<Json<Value>, JsonRejection>) -> ApiResult {
    let Json(body) = payload?;
    let request_id = request_id();
    let change = password_change(&body, true)?;
    let admin = state.admin.as_ref().ok_or_else(|| {
        Error::new(
            ErrorKind::InsufficientPrivilege,
            "no administrator identity configured",
        )
    })?;

    let policy = admin.change_password(&change).await?;
    state.adopt_rotation(&change.user, &change.new_password).await;

    info!(request_id, user = %change.user, by = admin.user(), "password reset");
    Ok(Json(json!({ "user": change.user, "policy": policy.label() })))
}

/// GET /health: 200 when the pool is healthy, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.pool.health();
    let admin = match &state.admin {
        Some(admin) if admin.is_connected().await => "connected",
        Some(_) => "disconnected",
        None => "not_configured",
    };
    body["admin"] = json!(admin);
    body["uptime_seconds"] = json!(state.started_at.elapsed().as_secs());

    let status = if body["status"] == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// GET /metrics: Prometheus text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
