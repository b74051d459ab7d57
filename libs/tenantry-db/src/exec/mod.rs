//! Operation execution with tenant injection.
//!
//! Structured operations are rewritten by [`scope`] before they reach a
//! backend, so no code path below this module ever sees an unscoped filter or
//! document. Raw statements skip injection but must pass the [`raw`] gate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::{DataConfig, RawPolicy};
use crate::descriptor::{ConnectionDescriptor, Engine};
use crate::error::DataError;
use crate::manager::{ConnectionManager, DbHandle};
use crate::schema::{KeyOrder, Schema};
use crate::tenant::TenantId;

pub mod document;
pub mod raw;
pub mod scope;
pub mod sql;

pub use scope::ScopedOp;

/// Field/value map used for filters, documents and `$set` payloads.
pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub order: KeyOrder,
}

/// Backend-agnostic CRUD operation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StructuredOp {
    Insert {
        entity: String,
        documents: Vec<Fields>,
    },
    Find {
        entity: String,
        #[serde(default)]
        filter: Fields,
        #[serde(default)]
        sort: Vec<SortKey>,
        limit: Option<u64>,
        skip: Option<u64>,
    },
    Count {
        entity: String,
        #[serde(default)]
        filter: Fields,
    },
    Update {
        entity: String,
        #[serde(default)]
        filter: Fields,
        set: Fields,
    },
    Delete {
        entity: String,
        #[serde(default)]
        filter: Fields,
    },
}

impl StructuredOp {
    #[must_use]
    pub fn entity(&self) -> &str {
        match self {
            Self::Insert { entity, .. }
            | Self::Find { entity, .. }
            | Self::Count { entity, .. }
            | Self::Update { entity, .. }
            | Self::Delete { entity, .. } => entity,
        }
    }

    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Find { .. } => "find",
            Self::Count { .. } => "count",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Backend-native statement: SQL text or a document command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawStatement {
    Sql(String),
    Command(Fields),
}

impl RawStatement {
    fn render(&self) -> String {
        match self {
            Self::Sql(sql) => sql.clone(),
            Self::Command(cmd) => Value::Object(cmd.clone()).to_string(),
        }
    }
}

/// Deserializes from a structured operation only. Raw statements are built
/// explicitly so malformed CRUD input can never fall through to the raw path.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "StructuredOp")]
pub enum Operation {
    Structured(StructuredOp),
    Raw(RawStatement),
}

impl From<StructuredOp> for Operation {
    fn from(op: StructuredOp) -> Self {
        Self::Structured(op)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecOutcome {
    Rows(Vec<Value>),
    Affected(u64),
    Count(u64),
}

/// Work resolved before a connection is taken; owns everything it needs.
enum Prepared {
    Structured(ScopedOp),
    Raw(RawStatement),
}

/// Runs operations for one tenant against one descriptor.
pub struct Executor {
    manager: Arc<ConnectionManager>,
    config: DataConfig,
    schema: Schema,
}

impl Executor {
    #[must_use]
    pub fn new(manager: Arc<ConnectionManager>, config: DataConfig) -> Self {
        let schema = Schema::standard(&config.tenant_field);
        Self {
            manager,
            config,
            schema,
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Executes `op` for `tenant` on a connection acquired for `descriptor`.
    ///
    /// # Errors
    /// - `DataError::Isolation` without a tenant, on tenant mismatch, or when
    ///   the raw gate rejects the statement
    /// - `DataError::InvalidOperation` for malformed operations
    /// - connection and backend errors from the manager and driver
    pub async fn execute(
        &self,
        tenant: Option<&TenantId>,
        descriptor: &ConnectionDescriptor,
        op: Operation,
    ) -> crate::Result<ExecOutcome> {
        let prepared = self.prepare(tenant, descriptor.engine(), op)?;
        self.manager
            .with_handle(descriptor, move |handle| Box::pin(run(handle, prepared)))
            .await
    }

    /// Executes `op` on a handle the caller already holds.
    ///
    /// # Errors
    /// Same as [`Executor::execute`] minus acquisition.
    pub async fn execute_on(
        &self,
        tenant: Option<&TenantId>,
        handle: &DbHandle,
        op: Operation,
    ) -> crate::Result<ExecOutcome> {
        let prepared = self.prepare(tenant, handle.engine(), op)?;
        run(handle, prepared).await
    }

    fn prepare(
        &self,
        tenant: Option<&TenantId>,
        engine: Engine,
        op: Operation,
    ) -> crate::Result<Prepared> {
        let tenant = tenant.ok_or_else(|| {
            DataError::Isolation("operation has no resolvable tenant".to_owned())
        })?;
        match op {
            Operation::Structured(op) => {
                let action = op.action();
                let scoped = scope::scope(op, tenant, &self.schema)?;
                tracing::debug!(
                    tenant = %tenant,
                    engine = %engine,
                    action,
                    entity = scoped.entity(),
                    "structured operation scoped"
                );
                Ok(Prepared::Structured(scoped))
            }
            Operation::Raw(statement) => {
                self.gate_raw(tenant, engine, &statement)?;
                Ok(Prepared::Raw(statement))
            }
        }
    }

    fn gate_raw(
        &self,
        tenant: &TenantId,
        engine: Engine,
        statement: &RawStatement,
    ) -> crate::Result<()> {
        let text = statement.render();
        if !self.config.raw.enabled {
            tracing::warn!(
                target: "audit",
                tenant = %tenant,
                engine = %engine,
                verdict = "disabled",
                statement = %text,
                "raw statement refused"
            );
            return Err(DataError::Isolation(
                "raw statements are disabled".to_owned(),
            ));
        }

        let field = &self.config.tenant_field;
        let verdict = match (engine, statement) {
            (Engine::MySql | Engine::Postgres, RawStatement::Sql(sql)) => {
                raw::inspect_sql(sql, field, tenant)
            }
            (Engine::MongoDb, RawStatement::Command(cmd)) => {
                raw::inspect_command(cmd, field, tenant)
            }
            (Engine::MongoDb, RawStatement::Sql(_)) => {
                return Err(DataError::InvalidOperation(
                    "document databases take a command object, not SQL text".to_owned(),
                ));
            }
            (_, RawStatement::Command(_)) => {
                return Err(DataError::InvalidOperation(
                    "relational databases take SQL text, not a command object".to_owned(),
                ));
            }
        };

        match verdict {
            Ok(()) => {
                tracing::info!(
                    target: "audit",
                    tenant = %tenant,
                    engine = %engine,
                    verdict = "accepted",
                    statement = %text,
                    "raw statement"
                );
                Ok(())
            }
            Err(reason) if self.config.raw.policy == RawPolicy::AuditOnly => {
                tracing::warn!(
                    target: "audit",
                    tenant = %tenant,
                    engine = %engine,
                    verdict = "flagged",
                    reason = %reason,
                    statement = %text,
                    "raw statement executed despite failing inspection"
                );
                Ok(())
            }
            Err(reason) => {
                tracing::warn!(
                    target: "audit",
                    tenant = %tenant,
                    engine = %engine,
                    verdict = "rejected",
                    reason = %reason,
                    statement = %text,
                    "raw statement rejected"
                );
                Err(DataError::Isolation(format!(
                    "raw statement rejected: {reason}"
                )))
            }
        }
    }
}

async fn run(handle: &DbHandle, prepared: Prepared) -> crate::Result<ExecOutcome> {
    match (handle, prepared) {
        (DbHandle::Relational(h), Prepared::Structured(op)) => {
            sql::run(h.connection(), h.engine(), &op).await
        }
        (DbHandle::Relational(h), Prepared::Raw(RawStatement::Sql(text))) => {
            sql::run_raw(h.connection(), h.engine(), &text).await
        }
        (DbHandle::Document(s), Prepared::Structured(op)) => {
            document::run(s.database(), &op).await
        }
        (DbHandle::Document(s), Prepared::Raw(RawStatement::Command(cmd))) => {
            document::run_command(s.database(), cmd).await
        }
        (handle, Prepared::Raw(_)) => Err(DataError::InvalidOperation(format!(
            "statement kind does not match engine {}",
            handle.engine()
        ))),
    }
}
