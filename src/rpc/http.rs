//! HTTP admin API for a zone server
//!
//! `/health` and `/metrics` are public. Everything else runs through the
//! dispatch table with the principal resolved from the `Authorization`
//! header.

use crate::common::{AuditEventType, AuthResult, Error, Principal, ServerId, ZoneId};
use crate::rpc::dispatch::{dispatch, Request as Call};
use crate::zone::ServerContext;
use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

type AppState = Arc<ServerContext>;

/// Admin bodies are a statement or a server registration
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn create_router(ctx: AppState) -> Router {
    let admin = Router::new()
        .route("/raft/status", get(raft_status))
        .route("/zone/:zone_id/server", post(add_server))
        .route("/zone/:zone_id/server/:server_id", delete(delete_server))
        .route("/zone/:zone_id/server/:server_id/reset", post(reset_server))
        .route("/log", post(submit_log))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), resolve_principal));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(admin)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Error reply: `{"error": ...}` with the status from [`Error::to_http_status`]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        let body = match &self.0 {
            Error::NotLeader { leader, endpoint } => json!({
                "error": self.0.to_string(),
                "leader": leader,
                "leader_endpoint": endpoint,
            }),
            e => json!({ "error": e.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn resolve_principal(
    State(ctx): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let principal = match ctx.auth.authenticate_admin(header) {
        AuthResult::Ok(principal) => principal,
        AuthResult::Missing => Principal::Anonymous,
        AuthResult::Invalid(reason) => {
            warn!("rejected admin request to {}: {}", request.uri().path(), reason);
            ctx.audit.log_event(
                AuditEventType::AccessDenied,
                "http",
                Some(request.uri().path().to_string()),
                reason.clone(),
                None,
            );
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": reason }))).into_response();
        }
    };
    request.extensions_mut().insert(principal);
    next.run(request).await
}

/// Tag each request with an id and log its completion
async fn request_id(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    let status = response.status();
    if status.is_server_error() {
        warn!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %start.elapsed().as_millis(),
            "Request failed"
        );
    } else {
        info!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %start.elapsed().as_millis(),
            "Request completed"
        );
    }
    response
}

async fn health(State(ctx): State<AppState>) -> impl IntoResponse {
    let body = match ctx.raft() {
        Ok(raft) => {
            let status = raft.status();
            json!({
                "status": if status.halted { "halted" } else { "ok" },
                "server_id": status.server_id,
                "zone_id": status.zone_id,
                "role": status.role,
                "term": status.term,
                "leader": status.leader_id,
            })
        }
        Err(_) => json!({
            "status": "cache",
            "server_id": ctx.config.server_id,
            "zone_id": ctx.config.zone_id,
        }),
    };
    let code = if body["status"] == "halted" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body))
}

async fn metrics(State(ctx): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        ctx.metrics.to_prometheus(),
    )
}

async fn raft_status(
    State(ctx): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<impl IntoResponse> {
    let status = dispatch(&ctx, principal, Call::RaftStatus)
        .await?
        .into_status()?;
    Ok(Json(status))
}

#[derive(Debug, Deserialize)]
struct AddServerBody {
    #[serde(default)]
    name: String,
    endpoint: String,
}

async fn add_server(
    State(ctx): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(zone_id): Path<ZoneId>,
    Json(body): Json<AddServerBody>,
) -> ApiResult<impl IntoResponse> {
    let call = Call::AddServer {
        zone_id,
        name: body.name,
        endpoint: body.endpoint,
    };
    let server_id = dispatch(&ctx, principal, call).await?.into_server_id()?;
    Ok((StatusCode::CREATED, Json(json!({ "server_id": server_id }))))
}

async fn delete_server(
    State(ctx): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((zone_id, server_id)): Path<(ZoneId, ServerId)>,
) -> ApiResult<impl IntoResponse> {
    let call = Call::DeleteServer { zone_id, server_id };
    let server_id = dispatch(&ctx, principal, call).await?.into_server_id()?;
    Ok(Json(json!({ "server_id": server_id })))
}

async fn reset_server(
    State(ctx): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((zone_id, server_id)): Path<(ZoneId, ServerId)>,
) -> ApiResult<impl IntoResponse> {
    let call = Call::ResetServer { zone_id, server_id };
    let server_id = dispatch(&ctx, principal, call).await?.into_server_id()?;
    Ok(Json(json!({ "server_id": server_id })))
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    sql: String,
    #[serde(default)]
    federated: bool,
}

async fn submit_log(
    State(ctx): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<SubmitBody>,
) -> ApiResult<impl IntoResponse> {
    if body.sql.trim().is_empty() {
        return Err(Error::Malformed("empty command".into()).into());
    }
    let call = Call::Execute {
        sql: body.sql,
        federated: body.federated,
    };
    let index = dispatch(&ctx, principal, call).await?.into_index()?;
    Ok(Json(json!({ "index": index })))
}
