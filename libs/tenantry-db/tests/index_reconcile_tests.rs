#![allow(clippy::unwrap_used, clippy::expect_used, clippy::use_debug)]

//! Index reconciliation against a live SQLite catalog.

mod common;

use sea_orm::ConnectionTrait;
use serde_json::json;
use tenantry_db::isolation::{self, IndexAction, SqlIndexCatalog};
use tenantry_db::{DataConfig, DataError, DbHandle, Engine, ExecOutcome, Operation, Schema};

fn catalog(handle: &DbHandle) -> SqlIndexCatalog {
    let DbHandle::Relational(h) = handle else {
        panic!("expected a relational handle");
    };
    SqlIndexCatalog::new(h.connection().clone(), Engine::Postgres)
}

#[tokio::test]
async fn legacy_global_unique_index_is_replaced() {
    let handle = common::sqlite_shop().await.unwrap();
    let DbHandle::Relational(h) = &handle else {
        unreachable!()
    };
    h.connection()
        .execute_unprepared("CREATE UNIQUE INDEX products_name_1 ON products(name)")
        .await
        .unwrap();

    let executor = common::executor(DataConfig::default());
    let a = common::tenant("tenant_a");
    let b = common::tenant("tenant_b");
    let widget = || -> Operation {
        serde_json::from_value(
            json!({"action": "insert", "entity": "products", "documents": [{"name": "widget"}]}),
        )
        .unwrap()
    };

    executor.execute_on(Some(&a), &handle, widget()).await.unwrap();
    let blocked = executor.execute_on(Some(&b), &handle, widget()).await;
    assert!(matches!(blocked, Err(DataError::Conflict { .. })));

    let schema = Schema::standard("userId");
    let report = isolation::reconcile(&catalog(&handle), &schema).await;
    assert!(report.is_clean(), "{report:?}");
    assert!(report.actions.contains(&IndexAction::Dropped {
        entity: "products".to_owned(),
        index: "products_name_1".to_owned(),
        reason: "unique index does not lead with userId".to_owned(),
    }));
    assert!(report.actions.contains(&IndexAction::Created {
        entity: "products".to_owned(),
        index: "products_userId_1_name_1".to_owned(),
    }));

    assert_eq!(
        executor.execute_on(Some(&b), &handle, widget()).await.unwrap(),
        ExecOutcome::Affected(1)
    );
    let again = executor.execute_on(Some(&b), &handle, widget()).await;
    assert!(matches!(again, Err(DataError::Conflict { .. })));

    let second = isolation::reconcile(&catalog(&handle), &schema).await;
    assert!(second.is_clean());
    assert!(!second.changed(), "{second:?}");
}

#[tokio::test]
async fn missing_tables_do_not_fail_the_pass() {
    let handle = common::sqlite_shop().await.unwrap();
    let DbHandle::Relational(h) = &handle else {
        unreachable!()
    };
    h.connection()
        .execute_unprepared("DROP TABLE suppliers")
        .await
        .unwrap();

    let report = isolation::reconcile(&catalog(&handle), &Schema::standard("userId")).await;
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].entity, "suppliers");
    assert!(report.actions.iter().any(|a| matches!(
        a,
        IndexAction::Created { entity, .. } if entity == "customers"
    )));
}
