use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::{Extension, Json};
use http::HeaderMap;
use tenantry_db::validate::{self, Admission, ClusterUsersDirectory};
use tenantry_db::{ConnectionDescriptor, Engine, Operation, RawDescriptor, TenantId};

use super::dto::{
    ExecResponse, HealthResponse, QueryRequest, RawRequest, TestConnectionRequest,
    TestConnectionResponse,
};
use super::{ApiError, AppState, DB_CONFIG_HEADER, TENANT_HEADER};

type ApiResult<T> = Result<Json<T>, ApiError>;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

/// Missing header means no tenant; the executor turns that into an isolation error.
fn tenant(headers: &HeaderMap) -> Result<Option<TenantId>, ApiError> {
    let Some(value) = headers.get(TENANT_HEADER) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest(format!("{TENANT_HEADER} is not valid text")))?;
    Ok(Some(TenantId::new(value.trim())?))
}

/// The body wins over the header when both carry a descriptor.
fn descriptor(
    state: &AppState,
    headers: &HeaderMap,
    from_body: Option<RawDescriptor>,
) -> Result<ConnectionDescriptor, ApiError> {
    let raw = match from_body {
        Some(raw) => raw,
        None => match headers.get(DB_CONFIG_HEADER) {
            Some(value) => {
                let text = value.to_str().map_err(|_| {
                    ApiError::BadRequest(format!("{DB_CONFIG_HEADER} is not valid text"))
                })?;
                serde_json::from_str(text).map_err(|e| {
                    ApiError::BadRequest(format!("{DB_CONFIG_HEADER} is not a valid descriptor: {e}"))
                })?
            }
            None => RawDescriptor::default(),
        },
    };
    let engine = raw.engine.as_deref().and_then(Engine::from_tag);
    validate::validate(&raw, &state.config.document)
        .map_err(|error| ApiError::Config { error, engine })
}

/// GET /health
pub async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        cached_pools: state.manager.cached_pools(),
    })
}

/// POST /v1/connections/test
///
/// Validates the descriptor, runs managed-cloud admission, then performs one
/// round trip.
pub async fn test_connection(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<TestConnectionRequest>, JsonRejection>,
) -> ApiResult<TestConnectionResponse> {
    let req = match payload {
        Ok(Json(req)) => req,
        // Descriptor may arrive in the header alone, with no body at all.
        Err(JsonRejection::MissingJsonContentType(_)) => TestConnectionRequest::default(),
        Err(e) => return Err(ApiError::BadRequest(e.body_text())),
    };
    let tenant = tenant(&headers)?;
    let descriptor = descriptor(&state, &headers, req.db_config)?;

    let directory = ClusterUsersDirectory::new(&state.manager, descriptor.host());
    Admission::new(&state.config.document, &directory)
        .admit(&descriptor, tenant.as_ref())
        .await?;
    state.manager.test_connection(&descriptor).await?;

    tracing::info!(descriptor = %descriptor, "connection test succeeded");
    Ok(Json(TestConnectionResponse {
        success: true,
        connected: true,
        descriptor: descriptor.summary(),
    }))
}

/// POST /v1/query
pub async fn query(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> ApiResult<ExecResponse> {
    let req = body(payload)?;
    let tenant = tenant(&headers)?;
    let descriptor = descriptor(&state, &headers, req.db_config)?;
    let outcome = state
        .executor
        .execute(
            tenant.as_ref(),
            &descriptor,
            Operation::Structured(req.operation),
        )
        .await?;
    Ok(Json(ExecResponse {
        success: true,
        engine: descriptor.engine(),
        outcome,
    }))
}

/// POST /v1/raw
///
/// Privileged path; every statement passes the inspection gate and is audited.
pub async fn raw(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<RawRequest>, JsonRejection>,
) -> ApiResult<ExecResponse> {
    let req = body(payload)?;
    let tenant = tenant(&headers)?;
    let descriptor = descriptor(&state, &headers, req.db_config)?;
    let outcome = state
        .executor
        .execute(tenant.as_ref(), &descriptor, Operation::Raw(req.statement))
        .await?;
    Ok(Json(ExecResponse {
        success: true,
        engine: descriptor.engine(),
        outcome,
    }))
}
