//! Folds legacy per-tenant collections into shared, tenant-keyed ones.
//!
//! Legacy stores kept one physical collection per tenant and entity, named
//! `{entity}_{tenantHandle}_{timestamp}`. Each matching collection is copied
//! into the shared `{entity}` collection with the recovered tenant stamped on
//! every document. Legacy collections are never dropped. Re-running is safe:
//! documents that already made it across hit the tenant-scoped unique indexes
//! and are counted as duplicates.

use std::sync::LazyLock;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::Database;
use mongodb::bson::{self, Bson, DateTime, Document, doc};
use regex::Regex;
use serde::Serialize;

use crate::descriptor::{ConnectionDescriptor, Engine};
use crate::error::{ConfigError, DataError, MONGO_DUPLICATE_KEY, mongo_server_code};
use crate::isolation::{self, DocumentIndexCatalog, IndexCatalog, ReconcileReport};
use crate::manager::ConnectionManager;
use crate::schema::Schema;
use crate::tenant::TenantId;

/// Collection holding one record per migrated legacy collection.
pub const MIGRATIONS_COLLECTION: &str = "tenant_migrations";
const MIGRATION_KIND: &str = "legacy-collections";
const MIGRATION_VERSION: u32 = 1;

#[allow(clippy::expect_used)] // good regex, it doesn't panic
static LEGACY_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<entity>[A-Za-z][A-Za-z0-9]*)_(?P<tenant>[A-Za-z0-9][A-Za-z0-9_.@:-]*?)_(?P<ts>\d{10,13})$")
        .expect("static regex should not panic")
});

/// `{entity, tenant handle}` recovered from a legacy collection name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyCollection {
    pub source: String,
    pub entity: String,
    pub tenant: TenantId,
}

/// Parses a legacy collection name. Only tenant-scoped entities of `schema`
/// are recognized.
#[must_use]
pub fn parse_legacy_name(name: &str, schema: &Schema) -> Option<LegacyCollection> {
    let caps = LEGACY_NAME_RE.captures(name)?;
    let entity = caps.name("entity")?.as_str();
    let is_scoped_entity = schema
        .tenant_scoped_entities()
        .any(|e| e.name == entity);
    if !is_scoped_entity {
        return None;
    }
    let tenant = TenantId::new(caps.name("tenant")?.as_str()).ok()?;
    Some(LegacyCollection {
        source: name.to_owned(),
        entity: entity.to_owned(),
        tenant,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Explicit, versioned record of one processed legacy collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub kind: &'static str,
    pub version: u32,
    pub source: String,
    pub target: String,
    pub tenant: String,
    pub read: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub completed_at: DateTime,
}

impl MigrationRecord {
    #[must_use]
    pub fn record_id(source: &str) -> String {
        format!("{MIGRATION_KIND}-v{MIGRATION_VERSION}:{source}")
    }
}

/// Storage used by [`migrate_legacy`].
#[async_trait]
pub trait LegacyStore: Send + Sync {
    async fn collection_names(&self) -> crate::Result<Vec<String>>;

    async fn read_all(&self, collection: &str) -> crate::Result<Vec<Document>>;

    /// Inserts one document; a duplicate key is reported, not raised.
    async fn insert(&self, collection: &str, doc: Document) -> crate::Result<InsertOutcome>;

    async fn record(&self, record: &MigrationRecord) -> crate::Result<()>;
}

pub struct MongoLegacyStore {
    db: Database,
}

impl MongoLegacyStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LegacyStore for MongoLegacyStore {
    async fn collection_names(&self) -> crate::Result<Vec<String>> {
        self.db
            .list_collection_names()
            .await
            .map_err(|e| DataError::from_mongo(&e))
    }

    async fn read_all(&self, collection: &str) -> crate::Result<Vec<Document>> {
        let cursor = self
            .db
            .collection::<Document>(collection)
            .find(doc! {})
            .await
            .map_err(|e| DataError::from_mongo(&e))?;
        cursor
            .try_collect()
            .await
            .map_err(|e| DataError::from_mongo(&e))
    }

    async fn insert(&self, collection: &str, doc: Document) -> crate::Result<InsertOutcome> {
        match self
            .db
            .collection::<Document>(collection)
            .insert_one(doc)
            .await
        {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if mongo_server_code(&e) == Some(MONGO_DUPLICATE_KEY) => {
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(DataError::from_mongo(&e)),
        }
    }

    async fn record(&self, record: &MigrationRecord) -> crate::Result<()> {
        let doc = bson::to_document(record).map_err(|e| DataError::Backend {
            engine: Engine::MongoDb,
            message: e.to_string(),
        })?;
        self.db
            .collection::<Document>(MIGRATIONS_COLLECTION)
            .replace_one(doc! { "_id": &record.id }, doc)
            .upsert(true)
            .await
            .map(|_| ())
            .map_err(|e| DataError::from_mongo(&e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionReport {
    pub source: String,
    pub target: String,
    pub tenant: String,
    pub read: u64,
    pub inserted: u64,
    pub duplicates: u64,
}

/// Legacy collection left untouched because its target's indexes could not
/// be reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedCollection {
    pub source: String,
    pub target: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub collections: Vec<CollectionReport>,
    pub skipped: Vec<SkippedCollection>,
}

impl MigrationReport {
    #[must_use]
    pub fn inserted(&self) -> u64 {
        self.collections.iter().map(|c| c.inserted).sum()
    }

    #[must_use]
    pub fn duplicates(&self) -> u64 {
        self.collections.iter().map(|c| c.duplicates).sum()
    }
}

/// Copies every legacy collection into its shared collection.
///
/// # Errors
/// Any store error other than a duplicate key aborts the run. Collections
/// finished before the failure keep their migration records.
pub async fn migrate_legacy(
    store: &dyn LegacyStore,
    schema: &Schema,
) -> crate::Result<MigrationReport> {
    migrate_collections(store, schema, &[]).await
}

/// Like [`migrate_legacy`], but collections targeting an entity in
/// `unguarded` are skipped: without their unique indexes a re-run could not
/// tell copied documents apart.
async fn migrate_collections(
    store: &dyn LegacyStore,
    schema: &Schema,
    unguarded: &[String],
) -> crate::Result<MigrationReport> {
    let tenant_field = schema.tenant_field();
    let mut names = store.collection_names().await?;
    names.sort();

    let mut report = MigrationReport::default();
    for legacy in names.iter().filter_map(|n| parse_legacy_name(n, schema)) {
        if unguarded.contains(&legacy.entity) {
            tracing::warn!(
                source = %legacy.source,
                target = %legacy.entity,
                "skipping legacy collection; target indexes were not reconciled"
            );
            report.skipped.push(SkippedCollection {
                source: legacy.source,
                reason: format!("indexes on {} could not be reconciled", legacy.entity),
                target: legacy.entity,
            });
            continue;
        }
        let docs = store.read_all(&legacy.source).await?;
        let mut entry = CollectionReport {
            source: legacy.source.clone(),
            target: legacy.entity.clone(),
            tenant: legacy.tenant.to_string(),
            read: 0,
            inserted: 0,
            duplicates: 0,
        };

        for mut doc in docs {
            entry.read += 1;
            doc.remove("_id");
            doc.insert(tenant_field, Bson::String(legacy.tenant.to_string()));
            match store.insert(&legacy.entity, doc).await? {
                InsertOutcome::Inserted => entry.inserted += 1,
                InsertOutcome::Duplicate => entry.duplicates += 1,
            }
        }
        if entry.duplicates > 0 {
            tracing::info!(
                source = %entry.source,
                duplicates = entry.duplicates,
                "skipped documents that were already migrated"
            );
        }

        store
            .record(&MigrationRecord {
                id: MigrationRecord::record_id(&entry.source),
                kind: MIGRATION_KIND,
                version: MIGRATION_VERSION,
                source: entry.source.clone(),
                target: entry.target.clone(),
                tenant: entry.tenant.clone(),
                read: entry.read,
                inserted: entry.inserted,
                duplicates: entry.duplicates,
                completed_at: DateTime::now(),
            })
            .await?;
        tracing::info!(
            source = %entry.source,
            target = %entry.target,
            tenant = %entry.tenant,
            read = entry.read,
            inserted = entry.inserted,
            "legacy collection migrated"
        );
        report.collections.push(entry);
    }
    Ok(report)
}

/// Outcome of [`migrate_descriptor`]: the index pass, then the copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRun {
    pub indexes: ReconcileReport,
    pub migration: MigrationReport,
}

/// Reconciles indexes, then migrates legacy collections on one document
/// database.
///
/// # Errors
/// - `ConfigError::InvalidField` for relational descriptors
/// - connection errors, and any migration error other than duplicate keys
pub async fn migrate_descriptor(
    manager: &ConnectionManager,
    descriptor: &ConnectionDescriptor,
    schema: &Schema,
) -> crate::Result<MigrationRun> {
    let ConnectionDescriptor::MongoDb(doc_descriptor) = descriptor else {
        return Err(ConfigError::InvalidField {
            field: "type",
            reason: "legacy collection migration targets document databases".to_owned(),
        }
        .into());
    };
    let session = manager.open_document(doc_descriptor).await?;
    let db = session.database().clone();
    let run = reconcile_then_migrate(
        &DocumentIndexCatalog::new(db.clone()),
        &MongoLegacyStore::new(db),
        schema,
    )
    .await;
    session.close().await;
    run
}

/// Entities whose reconciliation failed are not migrated into.
///
/// # Errors
/// Any migration error other than duplicate keys.
pub async fn reconcile_then_migrate(
    catalog: &dyn IndexCatalog,
    store: &dyn LegacyStore,
    schema: &Schema,
) -> crate::Result<MigrationRun> {
    let indexes = isolation::reconcile(catalog, schema).await;
    let unguarded: Vec<String> = indexes.failures.iter().map(|f| f.entity.clone()).collect();
    let migration = migrate_collections(store, schema, &unguarded).await?;
    Ok(MigrationRun { indexes, migration })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Enforces uniqueness on `(userId, name)` like the reconciled indexes.
    #[derive(Default)]
    struct FakeStore {
        collections: Mutex<HashMap<String, Vec<Document>>>,
        records: Mutex<Vec<MigrationRecord>>,
        fail_on: Option<String>,
    }

    impl FakeStore {
        fn seed(&self, name: &str, docs: Vec<Document>) {
            self.collections
                .lock()
                .unwrap()
                .insert(name.to_owned(), docs);
        }

        fn docs(&self, name: &str) -> Vec<Document> {
            self.collections
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_default()
        }
    }

    fn unique_key(d: &Document) -> (Option<&str>, Option<&str>) {
        (d.get_str("userId").ok(), d.get_str("name").ok())
    }

    #[async_trait]
    impl LegacyStore for FakeStore {
        async fn collection_names(&self) -> crate::Result<Vec<String>> {
            Ok(self.collections.lock().unwrap().keys().cloned().collect())
        }

        async fn read_all(&self, collection: &str) -> crate::Result<Vec<Document>> {
            Ok(self.docs(collection))
        }

        async fn insert(&self, collection: &str, doc: Document) -> crate::Result<InsertOutcome> {
            if self.fail_on.is_some() && doc.get_str("name").ok() == self.fail_on.as_deref() {
                return Err(DataError::Backend {
                    engine: Engine::MongoDb,
                    message: "disk full".to_owned(),
                });
            }
            let mut map = self.collections.lock().unwrap();
            let target = map.entry(collection.to_owned()).or_default();
            if target.iter().any(|d| unique_key(d) == unique_key(&doc)) {
                return Ok(InsertOutcome::Duplicate);
            }
            target.push(doc);
            Ok(InsertOutcome::Inserted)
        }

        async fn record(&self, record: &MigrationRecord) -> crate::Result<()> {
            let mut records = self.records.lock().unwrap();
            records.retain(|r| r.id != record.id);
            records.push(record.clone());
            Ok(())
        }
    }

    fn schema() -> Schema {
        Schema::standard("userId")
    }

    #[test]
    fn parses_legacy_names() {
        let parsed = parse_legacy_name("products_acme_1700000000000", &schema()).unwrap();
        assert_eq!(parsed.entity, "products");
        assert_eq!(parsed.tenant.as_str(), "acme");

        let parsed = parse_legacy_name("sales_shop_42_1700000000", &schema()).unwrap();
        assert_eq!(parsed.tenant.as_str(), "shop_42");

        assert!(parse_legacy_name("products", &schema()).is_none());
        assert!(parse_legacy_name("products_acme", &schema()).is_none());
        assert!(parse_legacy_name("users_acme_1700000000000", &schema()).is_none());
        assert!(parse_legacy_name("widgets_acme_1700000000000", &schema()).is_none());
        assert!(parse_legacy_name("tenant_migrations", &schema()).is_none());
    }

    #[tokio::test]
    async fn stamps_tenant_and_strips_identity() {
        let store = FakeStore::default();
        store.seed(
            "products_acme_1700000000000",
            vec![
                doc! { "_id": 1, "name": "widget" },
                doc! { "_id": 2, "name": "gadget", "userId": "stale" },
            ],
        );
        let report = migrate_legacy(&store, &schema()).await.unwrap();
        assert_eq!(report.inserted(), 2);

        let shared = store.docs("products");
        assert_eq!(shared.len(), 2);
        assert!(shared.iter().all(|d| !d.contains_key("_id")));
        assert!(shared.iter().all(|d| d.get_str("userId") == Ok("acme")));
        assert_eq!(store.docs("products_acme_1700000000000").len(), 2);

        let records = store.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].id,
            "legacy-collections-v1:products_acme_1700000000000"
        );
        assert_eq!(records[0].inserted, 2);
    }

    #[tokio::test]
    async fn second_run_inserts_nothing() {
        let store = FakeStore::default();
        store.seed(
            "categories_acme_1700000000000",
            vec![doc! { "_id": 1, "name": "tools" }],
        );
        store.seed(
            "categories_globex_1700000000001",
            vec![doc! { "_id": 1, "name": "tools" }],
        );
        let first = migrate_legacy(&store, &schema()).await.unwrap();
        assert_eq!(first.inserted(), 2);

        let second = migrate_legacy(&store, &schema()).await.unwrap();
        assert_eq!(second.inserted(), 0);
        assert_eq!(second.duplicates(), 2);
        assert_eq!(store.records.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn other_insert_errors_abort() {
        let store = FakeStore {
            fail_on: Some("boom".to_owned()),
            ..FakeStore::default()
        };
        store.seed(
            "products_acme_1700000000000",
            vec![doc! { "name": "ok" }, doc! { "name": "boom" }],
        );
        let err = migrate_legacy(&store, &schema()).await.unwrap_err();
        assert!(matches!(err, DataError::Backend { .. }));
        assert!(store.records.lock().unwrap().is_empty());
    }

    /// Catalog where listing `broken` fails and everything else is empty.
    struct PartialCatalog {
        broken: &'static str,
    }

    #[async_trait]
    impl IndexCatalog for PartialCatalog {
        fn engine(&self) -> Engine {
            Engine::MongoDb
        }

        async fn list_indexes(
            &self,
            entity: &str,
        ) -> crate::Result<Vec<isolation::ExistingIndex>> {
            if entity == self.broken {
                return Err(DataError::Backend {
                    engine: Engine::MongoDb,
                    message: "listIndexes failed".to_owned(),
                });
            }
            Ok(Vec::new())
        }

        async fn drop_index(&self, _entity: &str, _name: &str) -> crate::Result<()> {
            Ok(())
        }

        async fn create_index(
            &self,
            _entity: &str,
            _index: &crate::schema::IndexDescriptor,
        ) -> crate::Result<isolation::CreateOutcome> {
            Ok(isolation::CreateOutcome::Created)
        }
    }

    #[tokio::test]
    async fn entities_that_failed_to_reconcile_are_not_migrated() {
        let store = FakeStore::default();
        store.seed(
            "products_acme_1700000000000",
            vec![doc! { "_id": 1, "name": "widget" }],
        );
        store.seed(
            "categories_acme_1700000000000",
            vec![doc! { "_id": 1, "name": "tools" }],
        );
        let catalog = PartialCatalog { broken: "products" };

        let run = reconcile_then_migrate(&catalog, &store, &schema())
            .await
            .unwrap();
        assert_eq!(run.indexes.failures.len(), 1);
        assert_eq!(run.migration.inserted(), 1);
        assert_eq!(run.migration.skipped.len(), 1);
        assert_eq!(run.migration.skipped[0].source, "products_acme_1700000000000");
        assert!(store.docs("products").is_empty());
        assert_eq!(store.docs("categories").len(), 1);
        assert_eq!(store.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn relational_descriptor_is_rejected() {
        use crate::config::DataConfig;
        use crate::descriptor::{RelationalDescriptor, RelationalOptions};

        let manager = ConnectionManager::new(DataConfig::default());
        let descriptor = ConnectionDescriptor::MySql(RelationalDescriptor {
            host: "localhost".to_owned(),
            port: 3306,
            database: "shop".to_owned(),
            credentials: None,
            options: RelationalOptions::default(),
        });
        let err = migrate_descriptor(&manager, &descriptor, &schema())
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Configuration(_)));
    }
}
