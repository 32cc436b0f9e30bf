use std::env;

use anyhow::Context;

use rowguard_db::policy::condition;
use rowguard_db::{
    CompareOp, Condition, DataType, HistoryEventSpec, Operand, Operation, PolicyPrimitive,
    PolicyRuntime, Row, RuntimeConfig, TablePolicies, TableSchema, Timing,
};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    println!("🛡️ RowGuard - Row-Level Policy & History Engine");
    println!("===============================================\n");

    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    config.db_path = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: --db requires a database path");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    println!("🔧 Configuration:");
    println!("   Database: {}", config.db_path);
    println!("   History Mode: {:?}", config.history_mode);
    println!();

    let runtime = PolicyRuntime::open(&config).context("failed to open runtime")?;
    setup_demo_tables(&runtime)?;
    run_demo(&runtime)?;

    Ok(())
}

fn setup_demo_tables(runtime: &PolicyRuntime) -> anyhow::Result<()> {
    println!("🔧 Declaring demo tables and policies...");

    // Append-only ledger: updates and deletes are denied outright
    runtime.create_table(
        TableSchema::new("ledger_entries")
            .add_column("id", DataType::Text, false)
            .add_column("amount", DataType::Integer, false),
    )?;
    runtime.declare(TablePolicies::new("ledger_entries").with_policy(
        PolicyPrimitive::protect("append_only", &[Operation::Update, Operation::Delete]),
    ))?;

    // Accounts: deletes are diverted into an is_active=false update
    runtime.create_table(
        TableSchema::new("accounts")
            .add_column("id", DataType::Text, false)
            .add_column("owner", DataType::Text, false)
            .add_column("is_active", DataType::Boolean, false),
    )?;
    runtime.declare(TablePolicies::new("accounts").with_policy(
        PolicyPrimitive::soft_delete("soft_delete", "is_active", "false"),
    ))?;

    // Documents: FSM-governed status plus a protected, auto-bumped version
    runtime.create_table(
        TableSchema::new("documents")
            .add_column("id", DataType::Text, false)
            .add_column("status", DataType::Text, false)
            .add_column("body", DataType::Text, true)
            .add_column("version", DataType::Integer, false),
    )?;
    runtime.declare(
        TablePolicies::new("documents")
            .with_policy(PolicyPrimitive::fsm(
                "check_status_transitions",
                "status",
                &[
                    ("unpublished", "published"),
                    ("unpublished", "inactive"),
                    ("published", "inactive"),
                ],
            ))
            .with_policy(
                PolicyPrimitive::protect_when(
                    "protect_version_edits",
                    &[Operation::Update],
                    Condition::changed("version"),
                )
                .with_priority(10),
            )
            .with_policy(
                PolicyPrimitive::raw(
                    "versioned",
                    Timing::Before,
                    &[Operation::Update],
                    Some(Condition::AnyColumnChanged),
                    "bump_version",
                )
                .with_priority(20),
            ),
    )?;

    // Measurements: full history tracking with a conditional event
    runtime.create_table(
        TableSchema::new("measurements")
            .add_column("id", DataType::Text, false)
            .add_column("reading", DataType::Integer, false)
            .add_column("note", DataType::Text, true),
    )?;
    runtime.declare(
        TablePolicies::new("measurements")
            .with_event(HistoryEventSpec::snapshot())
            .with_event(HistoryEventSpec::after_insert("create"))
            .with_event(HistoryEventSpec::after_update("low_reading").when(
                Condition::compare(condition::new("reading"), CompareOp::Lt, Operand::lit("0")),
            )),
    )?;

    println!("   ✅ 4 tables declared\n");
    Ok(())
}

fn seed(
    runtime: &PolicyRuntime,
    session: &str,
    table: &str,
    key: &str,
    values: Row,
) {
    // Reruns against an existing database just warn, like any demo seed
    match runtime.executor().insert(session, table, key, values) {
        Ok(_) => println!("   ✅ Seeded {}/{}", table, key),
        Err(e) => println!("   ⚠️ Seed {}/{}: {}", table, key, e),
    }
}

fn run_demo(runtime: &PolicyRuntime) -> anyhow::Result<()> {
    let session = runtime.new_session();
    let executor = runtime.executor();

    println!("🚀 Running guarded writes...\n");

    // Append-only: insert passes, delete is denied
    seed(runtime, &session, "ledger_entries", "e1", row(&[("id", "e1"), ("amount", "100")]));
    match executor.delete(&session, "ledger_entries", "e1") {
        Err(err) => println!("   ❌ Denied as declared: {}", err),
        Ok(_) => println!("   ⚠️ Unexpected: delete passed"),
    }

    // Suppression: the same delete goes through inside a suppression scope
    {
        let _guard = runtime.suppress(&session, "ledger_entries", "append_only");
        executor.delete(&session, "ledger_entries", "e1")?;
        println!("   ✅ Delete passed inside suppression scope");
    }

    // Soft delete: the row survives with is_active=false
    seed(
        runtime,
        &session,
        "accounts",
        "a1",
        row(&[("id", "a1"), ("owner", "alice"), ("is_active", "true")]),
    );
    let outcome = executor.delete(&session, "accounts", "a1")?;
    println!(
        "   ✅ Soft delete diverted={} row_still_exists={}",
        outcome.diverted,
        executor.select("accounts", "a1")?.is_some()
    );

    // FSM + versioning
    seed(
        runtime,
        &session,
        "documents",
        "d1",
        row(&[("id", "d1"), ("status", "unpublished"), ("version", "0")]),
    );
    match executor.update(&session, "documents", "d1", row(&[("status", "published")])) {
        Ok(outcome) => println!(
            "   ✅ status -> published, version bumped to {:?}",
            outcome.row.as_ref().and_then(|r| r.get("version"))
        ),
        Err(err) => println!("   ⚠️ Publish: {}", err),
    }
    match executor.update(&session, "documents", "d1", row(&[("status", "unpublished")])) {
        Err(err) => println!("   ❌ Illegal transition denied: {}", err),
        Ok(_) => println!("   ⚠️ Unexpected: illegal transition passed"),
    }

    // History tracking
    seed(
        runtime,
        &session,
        "measurements",
        "m1",
        row(&[("id", "m1"), ("reading", "5")]),
    );
    executor.update(&session, "measurements", "m1", row(&[("reading", "-3")]))?;
    let events = rowguard_db::history::read_events(executor.storage(), "measurements", None)?;
    println!("\n📜 measurements history ({} events):", events.len());
    for event in &events {
        println!(
            "   [{}] {} seq={} reading={:?}",
            event.event_label,
            event.source_key,
            event.sequence,
            event.row_image.get("reading")
        );
    }

    println!("\n✅ Demo finished");
    Ok(())
}

fn row(pairs: &[(&str, &str)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn print_help() {
    println!("RowGuard - declarative row-level policies and history capture over sled");
    println!();
    println!("USAGE:");
    println!("    rowguard [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -d, --db <PATH>         Database file path (default: rowguard.db)");
    println!("    -h, --help              Print this help message");
    println!();
    println!("EXAMPLES:");
    println!("    rowguard                         # Run the policy demo");
    println!("    rowguard --db myapp.db           # Custom database path");
    println!();
}
