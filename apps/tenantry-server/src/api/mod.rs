//! HTTP surface: one descriptor per request, tenant taken from `X-Tenant-Id`.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Extension, Router};
use tenantry_db::{ConnectionManager, DataConfig, Executor};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

mod dto;
mod error;
mod handlers;

pub use error::ApiError;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const DB_CONFIG_HEADER: &str = "x-db-config";

/// Shared by every handler.
pub struct AppState {
    pub config: DataConfig,
    pub manager: Arc<ConnectionManager>,
    pub executor: Executor,
}

impl AppState {
    #[must_use]
    pub fn new(config: DataConfig) -> Self {
        let manager = Arc::new(ConnectionManager::new(config.clone()));
        let executor = Executor::new(manager.clone(), config.clone());
        Self {
            config,
            manager,
            executor,
        }
    }
}

pub fn router(state: Arc<AppState>, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/connections/test", post(handlers::test_connection))
        .route("/v1/query", post(handlers::query))
        .route("/v1/raw", post(handlers::raw))
        .layer(Extension(state))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
}
