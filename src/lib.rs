/*
📌 File: src/lib.rs
✅ Declarative row-level integrity policies compiled to sled-backed triggers
✅ Session-scoped policy suppression and append-only history capture
*/

// ================================
// Core Engine Modules
// ================================
pub mod storage;
pub mod schema;
pub mod policy;
pub mod suppression;
pub mod history;
pub mod installer;
pub mod executor;
pub mod runtime;
pub mod config;
pub mod error;

// ================================
// Internal Types
// ================================
pub use storage::{Row, Storage};
pub use schema::{Column, DataType, SchemaManager, TableSchema};
pub use error::{PolicyError, PolicyResult};

// ================================
// Policy Surface
// ================================
pub use policy::{
    compile_table, Assignment, CompareOp, CompiledTableSet, Condition, FsmSpec, Operand,
    Operation, PolicyAction, PolicyPrimitive, RewriteExpr, TablePolicies, Timing,
};
pub use suppression::{SuppressionGuard, SuppressionRegistry};
pub use history::{HistoryEventSpec, HistoryMode, HistoryRow};
pub use installer::{InstallReport, PolicyInstaller, TriggerDescriptor};
pub use executor::{PolicyExecutor, WriteOutcome};
pub use runtime::PolicyRuntime;
pub use config::RuntimeConfig;
