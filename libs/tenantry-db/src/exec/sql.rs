//! Relational execution through sea-query statements.

use sea_orm::sea_query::{
    Alias, Asterisk, Condition, DeleteStatement, Expr, InsertStatement, Order, Query,
    SelectStatement, SimpleExpr, UpdateStatement, Value as SqlValue,
};
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, FromQueryResult, JsonValue, Statement,
    TransactionTrait,
};
use serde_json::Value;

use super::{ExecOutcome, Fields, ScopedOp, SortKey, StructuredOp};
use crate::descriptor::Engine;
use crate::error::DataError;
use crate::schema::KeyOrder;

const COUNT_ALIAS: &str = "count";

fn bind(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::String(None),
        Value::Bool(b) => SqlValue::from(*b),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::from)
            .or_else(|| n.as_u64().map(SqlValue::from))
            .or_else(|| n.as_f64().map(SqlValue::from))
            .unwrap_or_else(|| SqlValue::from(n.to_string())),
        Value::String(s) => SqlValue::from(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::from(value.to_string()),
    }
}

fn condition(filter: &Fields) -> Condition {
    filter.iter().fold(Condition::all(), |cond, (field, value)| {
        let col = Expr::col(Alias::new(field.as_str()));
        cond.add(if value.is_null() {
            col.is_null()
        } else {
            col.eq(bind(value))
        })
    })
}

pub(crate) fn insert_statement(entity: &str, doc: &Fields) -> crate::Result<InsertStatement> {
    let mut stmt = Query::insert();
    stmt.into_table(Alias::new(entity))
        .columns(doc.keys().map(|k| Alias::new(k.as_str())))
        .values(doc.values().map(|v| SimpleExpr::Value(bind(v))))
        .map_err(|e| DataError::InvalidOperation(e.to_string()))?;
    Ok(stmt)
}

pub(crate) fn select_statement(
    entity: &str,
    filter: &Fields,
    sort: &[SortKey],
    limit: Option<u64>,
    skip: Option<u64>,
) -> SelectStatement {
    let mut stmt = Query::select();
    stmt.column(Asterisk)
        .from(Alias::new(entity))
        .cond_where(condition(filter));
    for key in sort {
        let order = match key.order {
            KeyOrder::Asc => Order::Asc,
            KeyOrder::Desc => Order::Desc,
        };
        stmt.order_by(Alias::new(key.field.as_str()), order);
    }
    match (limit, skip) {
        (Some(limit), _) => {
            stmt.limit(limit);
        }
        // OFFSET without LIMIT is not portable.
        (None, Some(_)) => {
            stmt.limit(i64::MAX.unsigned_abs());
        }
        (None, None) => {}
    }
    if let Some(skip) = skip {
        stmt.offset(skip);
    }
    stmt
}

pub(crate) fn count_statement(entity: &str, filter: &Fields) -> SelectStatement {
    let mut stmt = Query::select();
    stmt.expr_as(Expr::cust("COUNT(*)"), Alias::new(COUNT_ALIAS))
        .from(Alias::new(entity))
        .cond_where(condition(filter));
    stmt
}

pub(crate) fn update_statement(entity: &str, filter: &Fields, set: &Fields) -> UpdateStatement {
    let mut stmt = Query::update();
    stmt.table(Alias::new(entity))
        .values(
            set.iter()
                .map(|(k, v)| (Alias::new(k.as_str()), SimpleExpr::Value(bind(v)))),
        )
        .cond_where(condition(filter));
    stmt
}

pub(crate) fn delete_statement(entity: &str, filter: &Fields) -> DeleteStatement {
    let mut stmt = Query::delete();
    stmt.from_table(Alias::new(entity))
        .cond_where(condition(filter));
    stmt
}

/// Runs a scoped operation. `engine` labels errors; the SQL dialect comes from
/// the connection itself.
pub(crate) async fn run(
    conn: &DatabaseConnection,
    engine: Engine,
    op: &ScopedOp,
) -> crate::Result<ExecOutcome> {
    let backend = conn.get_database_backend();
    let db_err = |e| DataError::from_db(engine, e);

    match op.op() {
        StructuredOp::Insert { entity, documents } => {
            let txn = conn.begin().await.map_err(db_err)?;
            let mut affected = 0;
            for doc in documents {
                let stmt = backend.build(&insert_statement(entity, doc)?);
                affected += txn.execute(stmt).await.map_err(db_err)?.rows_affected();
            }
            txn.commit().await.map_err(db_err)?;
            Ok(ExecOutcome::Affected(affected))
        }
        StructuredOp::Find {
            entity,
            filter,
            sort,
            limit,
            skip,
        } => {
            let stmt = backend.build(&select_statement(entity, filter, sort, *limit, *skip));
            query_rows(conn, stmt).await.map_err(db_err)
        }
        StructuredOp::Count { entity, filter } => {
            let stmt = backend.build(&count_statement(entity, filter));
            let row = conn.query_one(stmt).await.map_err(db_err)?;
            let count = match row {
                Some(row) => row.try_get::<i64>("", COUNT_ALIAS).map_err(db_err)?,
                None => 0,
            };
            Ok(ExecOutcome::Count(count.unsigned_abs()))
        }
        StructuredOp::Update { entity, filter, set } => {
            let stmt = backend.build(&update_statement(entity, filter, set));
            let res = conn.execute(stmt).await.map_err(db_err)?;
            Ok(ExecOutcome::Affected(res.rows_affected()))
        }
        StructuredOp::Delete { entity, filter } => {
            let stmt = backend.build(&delete_statement(entity, filter));
            let res = conn.execute(stmt).await.map_err(db_err)?;
            Ok(ExecOutcome::Affected(res.rows_affected()))
        }
    }
}

/// Runs SQL text that already passed the raw gate.
pub(crate) async fn run_raw(
    conn: &DatabaseConnection,
    engine: Engine,
    sql: &str,
) -> crate::Result<ExecOutcome> {
    let backend = conn.get_database_backend();
    let stmt = Statement::from_string(backend, sql.trim().trim_end_matches(';').to_owned());
    if returns_rows(sql) {
        query_rows(conn, stmt)
            .await
            .map_err(|e| DataError::from_db(engine, e))
    } else {
        conn.execute(stmt)
            .await
            .map(|r| ExecOutcome::Affected(r.rows_affected()))
            .map_err(|e| DataError::from_db(engine, e))
    }
}

fn returns_rows(sql: &str) -> bool {
    let verb = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default();
    verb.eq_ignore_ascii_case("select") || verb.eq_ignore_ascii_case("with")
}

async fn query_rows(
    conn: &DatabaseConnection,
    stmt: Statement,
) -> Result<ExecOutcome, sea_orm::DbErr> {
    let rows = JsonValue::find_by_statement(stmt).all(conn).await?;
    Ok(ExecOutcome::Rows(rows))
}

/// Renders the statement a structured operation would run, for logs and tests.
#[must_use]
pub fn render(backend: DatabaseBackend, op: &ScopedOp) -> Vec<String> {
    match op.op() {
        StructuredOp::Insert { entity, documents } => documents
            .iter()
            .filter_map(|d| insert_statement(entity, d).ok())
            .map(|s| backend.build(&s).to_string())
            .collect(),
        StructuredOp::Find {
            entity,
            filter,
            sort,
            limit,
            skip,
        } => vec![
            backend
                .build(&select_statement(entity, filter, sort, *limit, *skip))
                .to_string(),
        ],
        StructuredOp::Count { entity, filter } => {
            vec![backend.build(&count_statement(entity, filter)).to_string()]
        }
        StructuredOp::Update { entity, filter, set } => {
            vec![backend.build(&update_statement(entity, filter, set)).to_string()]
        }
        StructuredOp::Delete { entity, filter } => {
            vec![backend.build(&delete_statement(entity, filter)).to_string()]
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::exec::scope::scope;
    use crate::schema::Schema;
    use crate::tenant::TenantId;
    use sea_orm::SqlxSqliteConnector;
    use sea_orm::sqlx::sqlite::SqlitePoolOptions;
    use serde_json::json;

    fn scoped(value: serde_json::Value, tenant: &str) -> ScopedOp {
        scope(
            serde_json::from_value(value).unwrap(),
            &TenantId::new(tenant).unwrap(),
            &Schema::standard("userId"),
        )
        .unwrap()
    }

    async fn sqlite() -> DatabaseConnection {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let conn = SqlxSqliteConnector::from_sqlx_sqlite_pool(pool);
        conn.execute_unprepared(
            "CREATE TABLE products (id INTEGER PRIMARY KEY, userId TEXT NOT NULL, name TEXT NOT NULL, price REAL, \
             UNIQUE (userId, name))",
        )
        .await
        .unwrap();
        conn
    }

    #[test]
    fn rendered_filters_always_carry_tenant_predicate() {
        let op = scoped(
            json!({"action": "find", "entity": "products", "filter": {"name": "x"}, "limit": 2}),
            "tenant_a",
        );
        let sql = render(DatabaseBackend::Postgres, &op).remove(0);
        assert!(sql.contains(r#""userId" = 'tenant_a'"#), "{sql}");
        assert!(sql.contains("LIMIT 2"), "{sql}");

        let op = scoped(
            json!({"action": "delete", "entity": "products", "filter": {"price": null}}),
            "tenant_a",
        );
        let sql = render(DatabaseBackend::MySql, &op).remove(0);
        assert!(sql.contains("`price` IS NULL"), "{sql}");
        assert!(sql.contains("`userId` = 'tenant_a'"), "{sql}");
    }

    #[test]
    fn skip_without_limit_still_renders_limit() {
        let op = scoped(
            json!({"action": "find", "entity": "products", "skip": 5}),
            "tenant_a",
        );
        let sql = render(DatabaseBackend::MySql, &op).remove(0);
        assert!(sql.contains("LIMIT") && sql.contains("OFFSET 5"), "{sql}");
    }

    #[tokio::test]
    async fn crud_round_trip_stays_within_tenant() {
        let conn = sqlite().await;
        let insert = |tenant: &str| {
            scoped(
                json!({"action": "insert", "entity": "products", "documents": [{"name": "widget", "price": 2.5}]}),
                tenant,
            )
        };
        assert_eq!(
            run(&conn, Engine::Postgres, &insert("tenant_a")).await.unwrap(),
            ExecOutcome::Affected(1)
        );
        assert_eq!(
            run(&conn, Engine::Postgres, &insert("tenant_b")).await.unwrap(),
            ExecOutcome::Affected(1)
        );

        let count = scoped(json!({"action": "count", "entity": "products"}), "tenant_a");
        assert_eq!(
            run(&conn, Engine::Postgres, &count).await.unwrap(),
            ExecOutcome::Count(1)
        );

        let update = scoped(
            json!({"action": "update", "entity": "products", "filter": {"name": "widget"}, "set": {"price": 3}}),
            "tenant_b",
        );
        assert_eq!(
            run(&conn, Engine::Postgres, &update).await.unwrap(),
            ExecOutcome::Affected(1)
        );

        let find = scoped(json!({"action": "find", "entity": "products"}), "tenant_a");
        let ExecOutcome::Rows(rows) = run(&conn, Engine::Postgres, &find).await.unwrap() else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["userId"], "tenant_a");
        assert_eq!(rows[0]["price"], 2.5);
    }

    #[tokio::test]
    async fn duplicate_within_tenant_is_conflict() {
        let conn = sqlite().await;
        let op = scoped(
            json!({"action": "insert", "entity": "products", "documents": [{"name": "dup"}]}),
            "tenant_a",
        );
        run(&conn, Engine::MySql, &op).await.unwrap();
        let err = run(&conn, Engine::MySql, &op).await.unwrap_err();
        assert!(matches!(err, DataError::Conflict { engine: Engine::MySql, .. }), "{err}");
    }

    #[tokio::test]
    async fn raw_select_returns_rows() {
        let conn = sqlite().await;
        conn.execute_unprepared("INSERT INTO products (userId, name) VALUES ('tenant_a', 'a')")
            .await
            .unwrap();
        let out = run_raw(
            &conn,
            Engine::Postgres,
            "SELECT name FROM products WHERE userId = 'tenant_a';",
        )
        .await
        .unwrap();
        assert_eq!(out, ExecOutcome::Rows(vec![json!({"name": "a"})]));
    }
}
