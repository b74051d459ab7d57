use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{Bson, Document};
use mongodb::options::IndexOptions;
use mongodb::{Database, IndexModel};

use super::{CreateOutcome, ExistingIndex, IndexCatalog};
use crate::descriptor::Engine;
use crate::error::{DataError, mongo_server_code};
use crate::schema::{IndexDescriptor, IndexKey};

const NAMESPACE_NOT_FOUND: i32 = 26;
const INDEX_ALREADY_EXISTS: i32 = 68;
const INDEX_OPTIONS_CONFLICT: i32 = 85;
const INDEX_KEY_SPECS_CONFLICT: i32 = 86;
const INDEX_NOT_FOUND: i32 = 27;
const ID_INDEX: &str = "_id_";

pub struct DocumentIndexCatalog {
    db: Database,
}

impl DocumentIndexCatalog {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn key_spec(keys: &Document) -> Vec<IndexKey> {
    keys.iter()
        .map(|(field, dir)| {
            let desc = match dir {
                Bson::Int32(n) => *n < 0,
                Bson::Int64(n) => *n < 0,
                Bson::Double(n) => *n < 0.0,
                _ => false,
            };
            if desc {
                IndexKey::desc(field.clone())
            } else {
                IndexKey::asc(field.clone())
            }
        })
        .collect()
}

fn to_existing(model: IndexModel) -> Option<ExistingIndex> {
    let options = model.options.unwrap_or_default();
    let name = options.name?;
    Some(ExistingIndex {
        primary: name == ID_INDEX,
        unique: options.unique.unwrap_or(false) || name == ID_INDEX,
        keys: key_spec(&model.keys),
        name,
    })
}

#[async_trait]
impl IndexCatalog for DocumentIndexCatalog {
    fn engine(&self) -> Engine {
        Engine::MongoDb
    }

    async fn list_indexes(&self, entity: &str) -> crate::Result<Vec<ExistingIndex>> {
        let coll = self.db.collection::<Document>(entity);
        let cursor = match coll.list_indexes().await {
            Ok(cursor) => cursor,
            Err(e) if mongo_server_code(&e) == Some(NAMESPACE_NOT_FOUND) => return Ok(Vec::new()),
            Err(e) => return Err(DataError::from_mongo(&e)),
        };
        let models: Vec<IndexModel> = cursor
            .try_collect()
            .await
            .map_err(|e| DataError::from_mongo(&e))?;
        Ok(models.into_iter().filter_map(to_existing).collect())
    }

    async fn drop_index(&self, entity: &str, name: &str) -> crate::Result<()> {
        match self
            .db
            .collection::<Document>(entity)
            .drop_index(name)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if mongo_server_code(&e) == Some(INDEX_NOT_FOUND) => Ok(()),
            Err(e) => Err(DataError::from_mongo(&e)),
        }
    }

    async fn create_index(
        &self,
        entity: &str,
        index: &IndexDescriptor,
    ) -> crate::Result<CreateOutcome> {
        let keys: Document = index
            .keys
            .iter()
            .map(|k| (k.field.clone(), Bson::Int32(k.order.direction())))
            .collect();
        let model = IndexModel::builder()
            .keys(keys)
            .options(
                IndexOptions::builder()
                    .name(index.name.clone())
                    .unique(index.unique)
                    .build(),
            )
            .build();
        match self
            .db
            .collection::<Document>(entity)
            .create_index(model)
            .await
        {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e)
                if matches!(
                    mongo_server_code(&e),
                    Some(INDEX_ALREADY_EXISTS | INDEX_OPTIONS_CONFLICT | INDEX_KEY_SPECS_CONFLICT)
                ) =>
            {
                let existing = self.list_indexes(entity).await?;
                if has_equivalent(&existing, index) {
                    tracing::debug!(entity, index = %index.name, error = %e, "index already present");
                    Ok(CreateOutcome::AlreadyExists)
                } else {
                    Err(DataError::Backend {
                        engine: Engine::MongoDb,
                        message: format!(
                            "index {} conflicts with an existing index on {entity}: {e}",
                            index.name
                        ),
                    })
                }
            }
            Err(e) => Err(DataError::from_mongo(&e)),
        }
    }
}

/// A conflict only counts as "already exists" when the same keys carry the
/// same uniqueness.
fn has_equivalent(existing: &[ExistingIndex], index: &IndexDescriptor) -> bool {
    existing.iter().any(|i| i.same_definition(index))
}
