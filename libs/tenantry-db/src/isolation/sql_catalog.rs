use async_trait::async_trait;
use sea_orm::sea_query::{Alias, Index, IndexOrder};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, QueryResult, Statement};

use super::{CreateOutcome, ExistingIndex, IndexCatalog};
use crate::descriptor::Engine;
use crate::error::DataError;
use crate::schema::{IndexDescriptor, IndexKey, KeyOrder};

const PG_LIST: &str = r"
SELECT i.relname::text AS name,
       ix.indisunique AS is_unique,
       ix.indisprimary AS is_primary,
       a.attname::text AS column_name,
       (ix.indoption[k.ord - 1] & 1) = 1 AS is_desc
FROM pg_class t
JOIN pg_namespace n ON n.oid = t.relnamespace
JOIN pg_index ix ON ix.indrelid = t.oid
JOIN pg_class i ON i.oid = ix.indexrelid
CROSS JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord)
JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
WHERE t.relname = $1 AND n.nspname = current_schema()
ORDER BY i.relname, k.ord";

const MYSQL_LIST: &str = r"
SELECT CAST(INDEX_NAME AS CHAR) AS name,
       CAST(NON_UNIQUE AS SIGNED) AS non_unique,
       CAST(COLUMN_NAME AS CHAR) AS column_name,
       CAST(COALESCE(COLLATION, 'A') AS CHAR) AS collation
FROM information_schema.STATISTICS
WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
ORDER BY INDEX_NAME, SEQ_IN_INDEX";

const SQLITE_LIST: &str = r#"
SELECT il.name AS name,
       il."unique" AS is_unique,
       il.origin AS origin,
       ix.name AS column_name,
       ix."desc" AS is_desc
FROM pragma_index_list(?) AS il
JOIN pragma_index_xinfo(il.name) AS ix
WHERE ix.key = 1
ORDER BY il.name, ix.seqno"#;

/// Index catalog over a relational connection. Queries follow the
/// connection's backend; `engine` only labels errors and logs.
pub struct SqlIndexCatalog {
    conn: DatabaseConnection,
    engine: Engine,
}

impl SqlIndexCatalog {
    #[must_use]
    pub fn new(conn: DatabaseConnection, engine: Engine) -> Self {
        Self { conn, engine }
    }

    fn backend(&self) -> DatabaseBackend {
        self.conn.get_database_backend()
    }

    fn err(&self, e: sea_orm::DbErr) -> DataError {
        DataError::from_db(self.engine, e)
    }

    fn decode(&self, row: &QueryResult) -> Result<(String, IndexColumn), sea_orm::DbErr> {
        let name: String = row.try_get("", "name")?;
        let column: String = row.try_get("", "column_name")?;
        let col = match self.backend() {
            DatabaseBackend::Postgres => IndexColumn {
                field: column,
                desc: row.try_get("", "is_desc")?,
                unique: row.try_get("", "is_unique")?,
                primary: row.try_get("", "is_primary")?,
            },
            DatabaseBackend::MySql => {
                let non_unique: i64 = row.try_get("", "non_unique")?;
                let collation: String = row.try_get("", "collation")?;
                IndexColumn {
                    field: column,
                    desc: collation == "D",
                    unique: non_unique == 0,
                    primary: name == "PRIMARY",
                }
            }
            DatabaseBackend::Sqlite => {
                let unique: i64 = row.try_get("", "is_unique")?;
                let desc: i64 = row.try_get("", "is_desc")?;
                let origin: String = row.try_get("", "origin")?;
                IndexColumn {
                    field: column,
                    desc: desc != 0,
                    unique: unique != 0,
                    primary: origin == "pk",
                }
            }
        };
        Ok((name, col))
    }
}

struct IndexColumn {
    field: String,
    desc: bool,
    unique: bool,
    primary: bool,
}

fn is_already_exists(err: &sea_orm::DbErr) -> bool {
    let message = err.to_string();
    message.contains("already exists") || message.contains("Duplicate key name")
}

#[async_trait]
impl IndexCatalog for SqlIndexCatalog {
    fn engine(&self) -> Engine {
        self.engine
    }

    async fn list_indexes(&self, entity: &str) -> crate::Result<Vec<ExistingIndex>> {
        let backend = self.backend();
        let sql = match backend {
            DatabaseBackend::Postgres => PG_LIST,
            DatabaseBackend::MySql => MYSQL_LIST,
            DatabaseBackend::Sqlite => SQLITE_LIST,
        };
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(backend, sql, [entity.into()]))
            .await
            .map_err(|e| self.err(e))?;

        let mut out: Vec<ExistingIndex> = Vec::new();
        for row in &rows {
            let (name, col) = self.decode(row).map_err(|e| self.err(e))?;
            let key = if col.desc {
                IndexKey::desc(col.field)
            } else {
                IndexKey::asc(col.field)
            };
            match out.last_mut() {
                Some(last) if last.name == name => last.keys.push(key),
                _ => out.push(ExistingIndex {
                    name,
                    keys: vec![key],
                    unique: col.unique,
                    primary: col.primary,
                }),
            }
        }
        Ok(out)
    }

    async fn drop_index(&self, entity: &str, name: &str) -> crate::Result<()> {
        let backend = self.backend();
        if backend == DatabaseBackend::Postgres {
            // Unique constraints own their index and must be dropped as constraints.
            let constraint = format!(
                r#"ALTER TABLE "{}" DROP CONSTRAINT IF EXISTS "{}""#,
                entity.replace('"', "\"\""),
                name.replace('"', "\"\"")
            );
            self.conn
                .execute_unprepared(&constraint)
                .await
                .map_err(|e| self.err(e))?;
        }
        let mut stmt = Index::drop();
        stmt.name(name).table(Alias::new(entity));
        if backend != DatabaseBackend::MySql {
            stmt.if_exists();
        }
        self.conn
            .execute(backend.build(&stmt))
            .await
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    async fn create_index(
        &self,
        entity: &str,
        index: &IndexDescriptor,
    ) -> crate::Result<CreateOutcome> {
        let mut stmt = Index::create();
        stmt.name(&index.name).table(Alias::new(entity));
        for key in &index.keys {
            let order = match key.order {
                KeyOrder::Asc => IndexOrder::Asc,
                KeyOrder::Desc => IndexOrder::Desc,
            };
            stmt.col((Alias::new(key.field.as_str()), order));
        }
        if index.unique {
            stmt.unique();
        }
        match self.conn.execute(self.backend().build(&stmt)).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) if is_already_exists(&e) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(self.err(e)),
        }
    }
}
