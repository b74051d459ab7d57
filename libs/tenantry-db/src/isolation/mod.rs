//! Tenant isolation enforcement at the index level.
//!
//! [`reconcile`] walks the declared schema and brings each entity's live
//! indexes in line: unique indexes that do not lead with the tenant key are
//! dropped, declared indexes are created, and a declared name carrying a
//! different key spec is replaced. Data is never touched.

use async_trait::async_trait;
use serde::Serialize;

use crate::descriptor::{ConnectionDescriptor, Engine};
use crate::manager::{ConnectionManager, DbHandle};
use crate::schema::{EntityDef, IndexDescriptor, IndexKey, Schema};

mod mongo_catalog;
mod sql_catalog;

pub use mongo_catalog::DocumentIndexCatalog;
pub use sql_catalog::SqlIndexCatalog;

/// Index as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingIndex {
    pub name: String,
    pub keys: Vec<IndexKey>,
    pub unique: bool,
    /// Primary key or `_id_`. Never dropped.
    pub primary: bool,
}

impl ExistingIndex {
    fn same_definition(&self, declared: &IndexDescriptor) -> bool {
        self.keys == declared.keys && self.unique == declared.unique
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Backend access needed by [`reconcile`].
#[async_trait]
pub trait IndexCatalog: Send + Sync {
    fn engine(&self) -> Engine;

    /// Lists the indexes of `entity`. A missing table/collection lists as empty.
    async fn list_indexes(&self, entity: &str) -> crate::Result<Vec<ExistingIndex>>;

    async fn drop_index(&self, entity: &str, name: &str) -> crate::Result<()>;

    /// Creates `index`. "Already exists" is reported, not raised.
    async fn create_index(
        &self,
        entity: &str,
        index: &IndexDescriptor,
    ) -> crate::Result<CreateOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum IndexAction {
    Created { entity: String, index: String },
    Dropped {
        entity: String,
        index: String,
        reason: String,
    },
    Unchanged { entity: String, index: String },
}

impl IndexAction {
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityFailure {
    pub entity: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub actions: Vec<IndexAction>,
    pub failures: Vec<EntityFailure>,
}

impl ReconcileReport {
    /// `true` when anything was created or dropped.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.actions.iter().any(|a| !a.is_unchanged())
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Reconciles every declared entity. Per-entity failures are recorded and do
/// not stop the remaining entities.
pub async fn reconcile(catalog: &dyn IndexCatalog, schema: &Schema) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    for entity in schema.entities() {
        let mut actions = Vec::new();
        if let Err(e) =
            reconcile_entity(catalog, schema.tenant_field(), entity, &mut actions).await
        {
            tracing::error!(
                engine = %catalog.engine(),
                entity = %entity.name,
                error = %e,
                "index reconciliation failed"
            );
            report.failures.push(EntityFailure {
                entity: entity.name.clone(),
                error: e.to_string(),
            });
        }
        report.actions.extend(actions);
    }
    tracing::info!(
        engine = %catalog.engine(),
        actions = report.actions.len(),
        failures = report.failures.len(),
        changed = report.changed(),
        "index reconciliation finished"
    );
    report
}

/// Connects with `descriptor` and reconciles its indexes.
///
/// # Errors
/// Only acquisition errors; per-entity failures land in the report.
pub async fn reconcile_descriptor(
    manager: &ConnectionManager,
    descriptor: &ConnectionDescriptor,
    schema: &Schema,
) -> crate::Result<ReconcileReport> {
    let handle = manager.acquire(descriptor).await?;
    let report = match &handle {
        DbHandle::Relational(h) => {
            let catalog = SqlIndexCatalog::new(h.connection().clone(), h.engine());
            reconcile(&catalog, schema).await
        }
        DbHandle::Document(session) => {
            let catalog = DocumentIndexCatalog::new(session.database().clone());
            reconcile(&catalog, schema).await
        }
    };
    manager.release(handle).await;
    Ok(report)
}

async fn reconcile_entity(
    catalog: &dyn IndexCatalog,
    field: &str,
    def: &EntityDef,
    actions: &mut Vec<IndexAction>,
) -> crate::Result<()> {
    let entity = def.name.as_str();
    let mut existing = catalog.list_indexes(entity).await?;

    if def.tenant_scoped {
        let offending: Vec<String> = existing
            .iter()
            .filter(|i| i.unique && !i.primary)
            .filter(|i| i.keys.first().is_none_or(|k| k.field != field))
            .map(|i| i.name.clone())
            .collect();
        for name in offending {
            catalog.drop_index(entity, &name).await?;
            tracing::warn!(entity, index = %name, "dropped unique index without leading tenant key");
            actions.push(IndexAction::Dropped {
                entity: entity.to_owned(),
                index: name.clone(),
                reason: format!("unique index does not lead with {field}"),
            });
            existing.retain(|i| i.name != name);
        }
    }

    for index in &def.indexes {
        if let Some(current) = existing.iter().find(|i| i.name == index.name) {
            if current.same_definition(index) {
                actions.push(unchanged(entity, index));
                continue;
            }
            catalog.drop_index(entity, &index.name).await?;
            tracing::warn!(entity, index = %index.name, "dropped index with outdated definition");
            actions.push(IndexAction::Dropped {
                entity: entity.to_owned(),
                index: index.name.clone(),
                reason: "key spec differs from declaration".to_owned(),
            });
            existing.retain(|i| i.name != index.name);
        } else if existing.iter().any(|i| i.same_definition(index)) {
            tracing::debug!(entity, index = %index.name, "equivalent index exists under another name");
            actions.push(unchanged(entity, index));
            continue;
        }

        // Same keys without the declared uniqueness would block the unique
        // index on document stores and leave it unenforced elsewhere.
        if index.unique {
            let weaker: Vec<String> = existing
                .iter()
                .filter(|i| !i.primary && !i.unique && i.keys == index.keys)
                .map(|i| i.name.clone())
                .collect();
            for name in weaker {
                catalog.drop_index(entity, &name).await?;
                tracing::warn!(entity, index = %name, declared = %index.name, "dropped non-unique index shadowing a unique one");
                actions.push(IndexAction::Dropped {
                    entity: entity.to_owned(),
                    index: name.clone(),
                    reason: format!("non-unique duplicate of {}", index.name),
                });
                existing.retain(|i| i.name != name);
            }
        }

        match catalog.create_index(entity, index).await? {
            CreateOutcome::Created => {
                tracing::info!(entity, index = %index, "created index");
                actions.push(IndexAction::Created {
                    entity: entity.to_owned(),
                    index: index.name.clone(),
                });
            }
            CreateOutcome::AlreadyExists => {
                tracing::info!(entity, index = %index.name, "index already exists");
                actions.push(unchanged(entity, index));
            }
        }
    }
    Ok(())
}

fn unchanged(entity: &str, index: &IndexDescriptor) -> IndexAction {
    IndexAction::Unchanged {
        entity: entity.to_owned(),
        index: index.name.clone(),
    }
}
