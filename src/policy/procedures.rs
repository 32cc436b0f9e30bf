/*
📌 Raw Procedure Registry
✅ Named Rust callbacks for RawProcedure policies
✅ Process-wide registry, initialized with the built-in procedures
✅ Compile-time name validation, write-time dispatch
*/

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::policy::primitive::Operation;
use crate::storage::Row;

/// Execution context handed to a raw procedure. Returning Some(row) replaces
/// the NEW row image; returning None leaves it untouched.
pub struct ProcedureContext<'a> {
    pub table: &'a str,
    pub operation: Operation,
    pub old_row: Option<&'a Row>,
    pub new_row: Option<&'a Row>,
}

pub type ProcedureFn = fn(&ProcedureContext) -> Result<Option<Row>, String>;

static PROCEDURES: Lazy<RwLock<HashMap<String, ProcedureFn>>> = Lazy::new(|| {
    let mut procedures: HashMap<String, ProcedureFn> = HashMap::new();
    procedures.insert("bump_version".to_string(), bump_version);
    RwLock::new(procedures)
});

/// Register a procedure under a name (replaces any existing registration)
pub fn register_procedure(name: &str, procedure: ProcedureFn) {
    PROCEDURES
        .write()
        .unwrap()
        .insert(name.to_string(), procedure);
}

pub fn is_registered(name: &str) -> bool {
    PROCEDURES.read().unwrap().contains_key(name)
}

pub fn invoke(name: &str, context: &ProcedureContext) -> Result<Option<Row>, String> {
    let procedure = {
        let procedures = PROCEDURES.read().unwrap();
        procedures
            .get(name)
            .copied()
            .ok_or_else(|| format!("unknown raw procedure '{}'", name))?
    };
    procedure(context)
}

/// Built-in: NEW.version = OLD.version + 1. Bind it behind an
/// AnyColumnChanged condition so no-op updates never bump.
fn bump_version(context: &ProcedureContext) -> Result<Option<Row>, String> {
    let new_row = match context.new_row {
        Some(row) => row,
        None => return Ok(None),
    };

    let old_version = context
        .old_row
        .and_then(|row| row.get("version"))
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);

    let mut updated = new_row.clone();
    updated.insert("version".to_string(), (old_version + 1).to_string());
    Ok(Some(updated))
}
