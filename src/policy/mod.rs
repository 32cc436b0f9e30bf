// Policy core: condition language, primitives, raw procedures, compiler

pub mod compiler;
pub mod condition;
pub mod primitive;
pub mod procedures;

pub use compiler::{compile_table, CompiledPolicy, CompiledTableSet, CompiledTrigger, TablePolicies};
pub use condition::{CompareOp, CompiledCondition, Condition, FieldRef, Operand, RowImage};
pub use primitive::{
    Assignment, FsmSpec, Operation, PolicyAction, PolicyPrimitive, RewriteExpr, Timing,
};
pub use procedures::{register_procedure, ProcedureContext, ProcedureFn};
