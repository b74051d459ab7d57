#![allow(clippy::unwrap_used, clippy::expect_used, clippy::use_debug)]

//! Structured and raw operations against a shared SQLite shop.

mod common;

use serde_json::{Value, json};
use tenantry_db::{DataConfig, DataError, ExecOutcome, Operation, RawPolicy, RawStatement};

fn op(value: Value) -> Operation {
    serde_json::from_value(value).unwrap()
}

fn rows(outcome: ExecOutcome) -> Vec<Value> {
    match outcome {
        ExecOutcome::Rows(rows) => rows,
        other => panic!("expected rows, got {other:?}"),
    }
}

#[tokio::test]
async fn tenants_only_see_their_own_rows() {
    let handle = common::sqlite_shop().await.unwrap();
    let executor = common::executor(DataConfig::default());
    let a = common::tenant("tenant_a");
    let b = common::tenant("tenant_b");

    let insert = json!({"action": "insert", "entity": "products", "documents": [
        {"name": "widget", "price": 2.5},
        {"name": "gadget", "price": 4.0}
    ]});
    let inserted = executor
        .execute_on(Some(&a), &handle, op(insert))
        .await
        .unwrap();
    assert_eq!(inserted, ExecOutcome::Affected(2));
    executor
        .execute_on(
            Some(&b),
            &handle,
            op(json!({"action": "insert", "entity": "products", "documents": [{"name": "widget"}]})),
        )
        .await
        .unwrap();

    let seen_by_a = rows(
        executor
            .execute_on(
                Some(&a),
                &handle,
                op(json!({"action": "find", "entity": "products", "sort": [{"field": "name"}]})),
            )
            .await
            .unwrap(),
    );
    assert_eq!(seen_by_a.len(), 2);
    assert!(seen_by_a.iter().all(|r| r["userId"] == "tenant_a"));
    assert_eq!(seen_by_a[0]["name"], "gadget");

    let count_b = executor
        .execute_on(
            Some(&b),
            &handle,
            op(json!({"action": "count", "entity": "products"})),
        )
        .await
        .unwrap();
    assert_eq!(count_b, ExecOutcome::Count(1));
}

#[tokio::test]
async fn updates_and_deletes_never_cross_tenants() {
    let handle = common::sqlite_shop().await.unwrap();
    let executor = common::executor(DataConfig::default());
    let a = common::tenant("tenant_a");
    let b = common::tenant("tenant_b");

    for tenant in [&a, &b] {
        executor
            .execute_on(
                Some(tenant),
                &handle,
                op(json!({"action": "insert", "entity": "categories", "documents": [{"name": "tools"}]})),
            )
            .await
            .unwrap();
    }

    let updated = executor
        .execute_on(
            Some(&a),
            &handle,
            op(json!({"action": "update", "entity": "categories", "filter": {"name": "tools"}, "set": {"name": "hardware"}})),
        )
        .await
        .unwrap();
    assert_eq!(updated, ExecOutcome::Affected(1));

    let deleted = executor
        .execute_on(
            Some(&a),
            &handle,
            op(json!({"action": "delete", "entity": "categories", "filter": {}})),
        )
        .await
        .unwrap();
    assert_eq!(deleted, ExecOutcome::Affected(1));

    let left_for_b = rows(
        executor
            .execute_on(
                Some(&b),
                &handle,
                op(json!({"action": "find", "entity": "categories"})),
            )
            .await
            .unwrap(),
    );
    assert_eq!(left_for_b.len(), 1);
    assert_eq!(left_for_b[0]["name"], "tools");
}

#[tokio::test]
async fn unscoped_requests_are_isolation_errors() {
    let handle = common::sqlite_shop().await.unwrap();
    let executor = common::executor(DataConfig::default());
    let a = common::tenant("tenant_a");

    let err = executor
        .execute_on(
            None,
            &handle,
            op(json!({"action": "find", "entity": "products"})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Isolation(_)));

    let err = executor
        .execute_on(
            Some(&a),
            &handle,
            op(json!({"action": "find", "entity": "products", "filter": {"userId": "tenant_b"}})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Isolation(_)));

    let err = executor
        .execute_on(
            Some(&a),
            &handle,
            op(json!({"action": "update", "entity": "products", "filter": {}, "set": {"userId": "tenant_b"}})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Isolation(_)));

    let err = executor
        .execute_on(
            Some(&a),
            &handle,
            op(json!({"action": "find", "entity": "users"})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Isolation(_)));
}

#[tokio::test]
async fn raw_statements_follow_the_configured_policy() {
    let handle = common::sqlite_shop().await.unwrap();
    let a = common::tenant("tenant_a");
    let unscoped = || Operation::Raw(RawStatement::Sql("SELECT * FROM products".to_owned()));
    let scoped = || {
        Operation::Raw(RawStatement::Sql(
            "SELECT name FROM products WHERE userId = 'tenant_a'".to_owned(),
        ))
    };

    let enforce = common::executor(DataConfig::default());
    let err = enforce
        .execute_on(Some(&a), &handle, unscoped())
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Isolation(_)));
    assert!(matches!(
        enforce.execute_on(Some(&a), &handle, scoped()).await.unwrap(),
        ExecOutcome::Rows(_)
    ));

    let mut audit = DataConfig::default();
    audit.raw.policy = RawPolicy::AuditOnly;
    let audit = common::executor(audit);
    assert!(audit.execute_on(Some(&a), &handle, unscoped()).await.is_ok());

    let mut disabled = DataConfig::default();
    disabled.raw.enabled = false;
    let disabled = common::executor(disabled);
    let err = disabled
        .execute_on(Some(&a), &handle, scoped())
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Isolation(_)));

    let err = enforce
        .execute_on(
            Some(&a),
            &handle,
            Operation::Raw(RawStatement::Command(
                serde_json::from_value(json!({"find": "products", "filter": {"userId": "tenant_a"}}))
                    .unwrap(),
            )),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::InvalidOperation(_)));
}

#[tokio::test]
async fn raw_predicates_cannot_be_negated_or_widened() {
    let handle = common::sqlite_shop().await.unwrap();
    let executor = common::executor(DataConfig::default());
    let a = common::tenant("tenant_a");
    let b = common::tenant("tenant_b");
    let insert = |name: &str| {
        op(json!({"action": "insert", "entity": "products", "documents": [{"name": name}]}))
    };
    executor
        .execute_on(Some(&b), &handle, insert("secret_b"))
        .await
        .unwrap();
    executor
        .execute_on(Some(&a), &handle, insert("mine"))
        .await
        .unwrap();

    let statements = [
        "SELECT * FROM products WHERE NOT userId = 'tenant_a'",
        "DELETE FROM products WHERE userId = 'tenant_a' IS NOT NULL",
        "SELECT * FROM products WHERE userId = 'tenant_a' AND name IN (SELECT name FROM products)",
        "INSERT INTO products (userId, name) VALUES ('tenant_b', 'tenant_a')",
    ];
    for statement in statements {
        let err = executor
            .execute_on(
                Some(&a),
                &handle,
                Operation::Raw(RawStatement::Sql(statement.to_owned())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Isolation(_)), "{statement}: {err:?}");
    }

    let left = executor
        .execute_on(
            Some(&b),
            &handle,
            op(json!({"action": "find", "entity": "products"})),
        )
        .await
        .unwrap();
    let left = rows(left);
    assert_eq!(left.len(), 1);
    assert_eq!(left[0]["name"], "secret_b");
}
