#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Tenant-isolated data access over `MySQL`, `PostgreSQL` and `MongoDB`.
//!
//! Every request brings its own [`RawDescriptor`]. The descriptor is validated
//! into a typed [`ConnectionDescriptor`], a connection is acquired from the
//! [`ConnectionManager`] for exactly that descriptor, and the [`Executor`] runs
//! the operation with the requester's [`TenantId`] injected into every write
//! and every filter.
//!
//! # Layers
//! - [`validate`]: descriptor validation and managed-cloud admission
//! - [`manager`]: per-descriptor pools (relational) and per-unit-of-work
//!   clients (document)
//! - [`exec`]: structured CRUD with tenant injection, plus the audited raw path
//! - [`isolation`]: reconciles unique indexes so that every one of them leads
//!   with the tenant key
//! - [`migrate`]: folds legacy per-tenant collections into shared ones
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use tenantry_db::{
//!     ConnectionManager, DataConfig, Executor, Operation, RawDescriptor, TenantId, validate,
//! };
//!
//! # async fn demo() -> tenantry_db::Result<()> {
//! let config = DataConfig::default();
//! let manager = Arc::new(ConnectionManager::new(config.clone()));
//! let executor = Executor::new(manager, config);
//!
//! let raw: RawDescriptor = serde_json::from_value(serde_json::json!({
//!     "type": "postgresql", "host": "localhost", "port": 5432, "database": "shop"
//! })).map_err(|e| tenantry_db::DataError::InvalidOperation(e.to_string()))?;
//! let descriptor = validate::validate(&raw, &DataConfig::default().document)?;
//!
//! let tenant = TenantId::new("tenant_42")?;
//! let op: Operation = serde_json::from_value(serde_json::json!({
//!     "action": "find", "entity": "products", "filter": {}
//! })).map_err(|e| tenantry_db::DataError::InvalidOperation(e.to_string()))?;
//! let _rows = executor.execute(Some(&tenant), &descriptor, op).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod descriptor;
mod error;
pub mod exec;
pub mod isolation;
pub mod manager;
pub mod migrate;
mod pool_opts;
pub mod schema;
pub mod secret;
pub mod tenant;
pub mod validate;

pub use config::{DataConfig, DocumentCfg, PoolCfg, RawCfg, RawPolicy};
pub use descriptor::{ConnectionDescriptor, Engine, RawDescriptor};
pub use error::{ConfigError, ConnectionFailure, DataError};
pub use exec::{ExecOutcome, Executor, Operation, RawStatement, StructuredOp};
pub use isolation::{IndexCatalog, ReconcileReport};
pub use manager::{ConnectionManager, DbHandle};
pub use migrate::MigrationReport;
pub use schema::{EntityDef, IndexDescriptor, Schema};
pub use secret::Secret;
pub use tenant::TenantId;

/// Library-local result type.
pub type Result<T> = std::result::Result<T, DataError>;
