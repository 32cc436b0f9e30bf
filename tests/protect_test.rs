use std::sync::Arc;

use rowguard_db::{
    Condition, DataType, HistoryMode, Operation, PolicyPrimitive, PolicyRuntime, Row,
    TablePolicies, TableSchema,
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

#[test]
fn test_protect_delete_denies_until_suppressed() {
    let (_guard, runtime) = test_runtime();
    runtime
        .create_table(
            TableSchema::new("ledger_entries")
                .add_column("id", DataType::Text, false)
                .add_column("amount", DataType::Integer, false),
        )
        .unwrap();
    runtime
        .declare(TablePolicies::new("ledger_entries").with_policy(
            PolicyPrimitive::protect("protect_deletes", &[Operation::Delete]),
        ))
        .unwrap();

    let session = runtime.new_session();
    let executor = runtime.executor();
    executor
        .insert(&session, "ledger_entries", "e1", row(&[("id", "e1"), ("amount", "10")]))
        .unwrap();

    let err = executor.delete(&session, "ledger_entries", "e1").unwrap_err();
    assert_eq!(err.error_code(), "POLICY_VIOLATION");
    assert!(err.to_string().contains("protect_deletes"));
    assert!(executor.select("ledger_entries", "e1").unwrap().is_some());

    {
        let _scope = runtime.suppress(&session, "ledger_entries", "protect_deletes");
        let outcome = executor.delete(&session, "ledger_entries", "e1").unwrap();
        assert!(outcome.performed);
    }
    assert!(executor.select("ledger_entries", "e1").unwrap().is_none());

    // Guard dropped: the policy is enforced again
    executor
        .insert(&session, "ledger_entries", "e2", row(&[("id", "e2"), ("amount", "20")]))
        .unwrap();
    assert!(executor.delete(&session, "ledger_entries", "e2").is_err());
}

#[test]
fn test_append_only_denies_update_and_delete() {
    let (_guard, runtime) = test_runtime();
    runtime
        .create_table(
            TableSchema::new("audit_lines")
                .add_column("id", DataType::Text, false)
                .add_column("entry", DataType::Text, false),
        )
        .unwrap();
    runtime
        .declare(TablePolicies::new("audit_lines").with_policy(PolicyPrimitive::protect(
            "append_only",
            &[Operation::Update, Operation::Delete],
        )))
        .unwrap();

    let session = runtime.new_session();
    let executor = runtime.executor();
    executor
        .insert(&session, "audit_lines", "1", row(&[("id", "1"), ("entry", "created")]))
        .unwrap();

    assert!(executor
        .update(&session, "audit_lines", "1", row(&[("entry", "edited")]))
        .is_err());
    assert!(executor.delete(&session, "audit_lines", "1").is_err());

    // Appending more rows stays legal
    executor
        .insert(&session, "audit_lines", "2", row(&[("id", "2"), ("entry", "second")]))
        .unwrap();
    assert_eq!(executor.row_count("audit_lines").unwrap(), 2);
}

#[test]
fn test_read_only_field() {
    let (_guard, runtime) = test_runtime();
    runtime
        .create_table(
            TableSchema::new("profiles")
                .add_column("id", DataType::Text, false)
                .add_column("created_at", DataType::Timestamp, true)
                .add_column("nickname", DataType::Text, true),
        )
        .unwrap();
    runtime
        .declare(TablePolicies::new("profiles").with_policy(
            PolicyPrimitive::read_only_field("read_only_created_at", "created_at"),
        ))
        .unwrap();

    let session = runtime.new_session();
    let executor = runtime.executor();
    executor
        .insert(
            &session,
            "profiles",
            "p1",
            row(&[("id", "p1"), ("created_at", "2024-01-01T00:00:00Z")]),
        )
        .unwrap();

    // Touching the protected field fails
    let err = executor
        .update(
            &session,
            "profiles",
            "p1",
            row(&[("created_at", "2025-01-01T00:00:00Z")]),
        )
        .unwrap_err();
    assert_eq!(err.error_code(), "POLICY_VIOLATION");

    // Touching any other field passes
    executor
        .update(&session, "profiles", "p1", row(&[("nickname", "momo")]))
        .unwrap();

    // NULL-vs-NULL on the protected field counts as unchanged
    executor
        .insert(&session, "profiles", "p2", row(&[("id", "p2")]))
        .unwrap();
    executor
        .update(&session, "profiles", "p2", row(&[("nickname", "nix")]))
        .unwrap();
}

#[test]
fn test_protect_insert_with_official_path() {
    let (_guard, runtime) = test_runtime();
    runtime
        .create_table(
            TableSchema::new("grants")
                .add_column("id", DataType::Text, false)
                .add_column("holder", DataType::Text, false),
        )
        .unwrap();
    runtime
        .declare(TablePolicies::new("grants").with_policy(PolicyPrimitive::protect(
            "protect_inserts",
            &[Operation::Insert],
        )))
        .unwrap();

    let session = runtime.new_session();
    let executor = runtime.executor();

    // Direct inserts are denied
    assert!(executor
        .insert(&session, "grants", "g1", row(&[("id", "g1"), ("holder", "root")]))
        .is_err());

    // The official path suppresses the guard for its own scope only
    {
        let _scope = runtime.suppress(&session, "grants", "protect_inserts");
        executor
            .insert(&session, "grants", "g1", row(&[("id", "g1"), ("holder", "root")]))
            .unwrap();
    }
    assert!(executor
        .insert(&session, "grants", "g2", row(&[("id", "g2"), ("holder", "guest")]))
        .is_err());
}

#[test]
fn test_conditional_protect_uses_compiled_condition() {
    let (_guard, runtime) = test_runtime();
    runtime
        .create_table(
            TableSchema::new("jobs")
                .add_column("id", DataType::Text, false)
                .add_column("state", DataType::Text, false),
        )
        .unwrap();
    // Deny deleting jobs that are still running
    runtime
        .declare(TablePolicies::new("jobs").with_policy(PolicyPrimitive::protect_when(
            "protect_running",
            &[Operation::Delete],
            Condition::compare(
                rowguard_db::policy::condition::old("state"),
                rowguard_db::CompareOp::Eq,
                rowguard_db::Operand::lit("running"),
            ),
        )))
        .unwrap();

    let session = runtime.new_session();
    let executor = runtime.executor();
    executor
        .insert(&session, "jobs", "j1", row(&[("id", "j1"), ("state", "running")]))
        .unwrap();
    executor
        .insert(&session, "jobs", "j2", row(&[("id", "j2"), ("state", "done")]))
        .unwrap();

    assert!(executor.delete(&session, "jobs", "j1").is_err());
    executor.delete(&session, "jobs", "j2").unwrap();
}
