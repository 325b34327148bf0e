//! Registration HTTP API
//!
//! CRUD over registry records at `/registry/v1/services`, speaking the
//! camelCase wire form. Instances re-register themselves with PUT as their
//! heartbeat; a PUT arriving later than the configured interval is logged.
//! When basic auth credentials are configured every route requires them.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use tracing::{error, info, warn};

use crate::config::LunaConfig;
use crate::error::{LunaError, LunaResult};
use crate::registry::ServiceRegistry;
use crate::types::{InstanceId, ServiceRecord, ServiceRecordPayload};

/// Shared state of the registration API
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<ServiceRegistry>,
    pub config: Arc<LunaConfig>,
}

/// Router serving the registration API
pub fn create_router(state: ApiState) -> Router {
    let app = Router::new()
        .route("/registry/v1/services", get(list_services))
        .route(
            "/registry/v1/services/{instance_id}",
            get(get_service)
                .post(add_service)
                .put(update_service)
                .delete(remove_service),
        )
        .with_state(state.clone());

    app.layer(middleware::from_fn_with_state(state, auth_middleware))
}

struct ApiError(LunaError);

impl From<LunaError> for ApiError {
    fn from(e: LunaError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LunaError::Validation(_) => StatusCode::BAD_REQUEST,
            LunaError::DuplicateInstance(_) => StatusCode::CONFLICT,
            LunaError::NotRegistered(_) => StatusCode::NOT_FOUND,
            LunaError::NoInstances(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!(status = status.as_u16(), error = %self.0, "registration API error");
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        (status, Json(body)).into_response()
    }
}

async fn list_services(State(state): State<ApiState>) -> Json<Vec<ServiceRecordPayload>> {
    let records = state.registry.get_all().await;
    Json(records.iter().map(ServiceRecordPayload::from_record).collect())
}

async fn get_service(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> Result<Json<ServiceRecordPayload>, ApiError> {
    let id = InstanceId::parse(&instance_id)?;
    let record = state
        .registry
        .find_by_instance_id(&id)
        .await
        .ok_or_else(|| LunaError::NotRegistered(format!("no instance '{}'", id)))?;
    Ok(Json(ServiceRecordPayload::from_record(&record)))
}

async fn add_service(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    Json(payload): Json<ServiceRecordPayload>,
) -> Result<(StatusCode, Json<ServiceRecordPayload>), ApiError> {
    check_id_match(&instance_id, &payload)?;
    let record = payload.into_record(state.config.balancer.strategy)?;
    let stored = state.registry.add(record).await?;
    info!(instance = %stored.instance_id, "service registered");
    Ok((
        StatusCode::CREATED,
        Json(ServiceRecordPayload::from_record(&stored)),
    ))
}

async fn update_service(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    Json(payload): Json<ServiceRecordPayload>,
) -> Result<Json<ServiceRecordPayload>, ApiError> {
    check_id_match(&instance_id, &payload)?;
    let record = payload.into_record(state.config.balancer.strategy)?;

    if let Some(previous) = state.registry.find_by_instance_id(&record.instance_id).await {
        warn_if_late(&previous, state.config.registry.heartbeat_interval_secs);
    }

    let stored = state.registry.update(record).await?;
    Ok(Json(ServiceRecordPayload::from_record(&stored)))
}

async fn remove_service(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> Result<Json<ServiceRecordPayload>, ApiError> {
    let id = InstanceId::parse(&instance_id)?;
    let removed = state.registry.remove(&id).await?;
    info!(instance = %id, "service deregistered");
    Ok(Json(ServiceRecordPayload::from_record(&removed)))
}

/// The instance id addressed in the URL must match the one in the body
fn check_id_match(url_id: &str, payload: &ServiceRecordPayload) -> LunaResult<()> {
    let from_url = InstanceId::parse(url_id)?;
    let from_body = InstanceId::parse(&payload.instance_id)?;
    if from_url != from_body {
        return Err(LunaError::Validation(format!(
            "instance id '{}' in the URL does not match '{}' in the body",
            from_url, from_body
        )));
    }
    Ok(())
}

fn warn_if_late(previous: &ServiceRecord, interval_secs: u64) {
    if previous.last_heartbeat <= 0 {
        return;
    }
    let elapsed_ms = chrono::Utc::now().timestamp_millis() - previous.last_heartbeat;
    let interval_ms = interval_secs as i64 * 1000;
    if elapsed_ms > interval_ms {
        warn!(
            instance = %previous.instance_id,
            elapsed_ms,
            interval_ms,
            "heartbeat arrived late"
        );
    }
}

async fn auth_middleware(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (username, password) = match (
        &state.config.registry.username,
        &state.config.registry.password,
    ) {
        (Some(username), Some(password)) => (username, password),
        _ => return next.run(request).await,
    };

    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password))
    );
    let supplied = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if supplied == Some(expected.as_str()) {
        return next.run(request).await;
    }

    warn!("registration API request rejected, authorization failed");
    let body = serde_json::json!({ "error": "authorization failed" });
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}
