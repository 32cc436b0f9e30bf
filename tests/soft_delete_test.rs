use std::sync::Arc;

use rowguard_db::{
    DataType, HistoryMode, Operation, PolicyPrimitive, PolicyRuntime, Row, TablePolicies,
    TableSchema,
};
use tempfile::TempDir;

fn test_runtime() -> (TempDir, PolicyRuntime) {
    let temp_dir = TempDir::new().unwrap();
    let db = Arc::new(sled::open(temp_dir.path().join("test.db")).unwrap());
    let runtime = PolicyRuntime::with_db(db, HistoryMode::Strict).unwrap();
    (temp_dir, runtime)
}

fn row(pairs: &[(&str, &str)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn setup_accounts(runtime: &PolicyRuntime) {
    runtime
        .create_table(
            TableSchema::new("accounts")
                .add_column("id", DataType::Text, false)
                .add_column("owner", DataType::Text, false)
                .add_column("is_active", DataType::Boolean, false),
        )
        .unwrap();
    runtime
        .declare(TablePolicies::new("accounts").with_policy(PolicyPrimitive::soft_delete(
            "soft_delete",
            "is_active",
            "false",
        )))
        .unwrap();
}

#[test]
fn test_delete_is_diverted_into_flag_update() {
    let (_guard, runtime) = test_runtime();
    setup_accounts(&runtime);

    let session = runtime.new_session();
    let executor = runtime.executor();
    executor
        .insert(
            &session,
            "accounts",
            "a1",
            row(&[("id", "a1"), ("owner", "alice"), ("is_active", "true")]),
        )
        .unwrap();

    let outcome = executor.delete(&session, "accounts", "a1").unwrap();
    assert!(outcome.diverted);
    assert_eq!(outcome.operation, Operation::Update);

    // The row is never removed from storage
    let stored = executor.select("accounts", "a1").unwrap().unwrap();
    assert_eq!(stored.get("is_active").map(String::as_str), Some("false"));
    assert_eq!(stored.get("owner").map(String::as_str), Some("alice"));
    assert_eq!(executor.row_count("accounts").unwrap(), 1);
}

#[test]
fn test_soft_delete_is_idempotent() {
    let (_guard, runtime) = test_runtime();
    setup_accounts(&runtime);

    let session = runtime.new_session();
    let executor = runtime.executor();
    executor
        .insert(
            &session,
            "accounts",
            "a1",
            row(&[("id", "a1"), ("owner", "alice"), ("is_active", "true")]),
        )
        .unwrap();

    // A second real delete attempt is subject to the same diversion
    executor.delete(&session, "accounts", "a1").unwrap();
    let second = executor.delete(&session, "accounts", "a1").unwrap();
    assert!(second.diverted);

    let stored = executor.select("accounts", "a1").unwrap().unwrap();
    assert_eq!(stored.get("is_active").map(String::as_str), Some("false"));
    assert_eq!(executor.row_count("accounts").unwrap(), 1);
}

#[test]
fn test_suppressed_soft_delete_removes_physically() {
    let (_guard, runtime) = test_runtime();
    setup_accounts(&runtime);

    let session = runtime.new_session();
    let executor = runtime.executor();
    executor
        .insert(
            &session,
            "accounts",
            "a1",
            row(&[("id", "a1"), ("owner", "alice"), ("is_active", "true")]),
        )
        .unwrap();

    let _scope = runtime.suppress(&session, "accounts", "soft_delete");
    let outcome = executor.delete(&session, "accounts", "a1").unwrap();
    assert!(!outcome.diverted);
    assert!(executor.select("accounts", "a1").unwrap().is_none());
}
