/*
📌 Policy Primitives
✅ Reusable behavior templates: Protect, SoftDelete, FiniteStateMachine, RawProcedure
✅ Each lowers to timing + operations + condition + tagged action
✅ Explicit priority for ordering multiple primitives on one operation
*/

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::policy::condition::{self, CompareOp, Condition, Operand};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Timing {
    Before,
    After,
}

impl Timing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timing::Before => "before",
            Timing::After => "after",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Right-hand side of a field rewrite
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RewriteExpr {
    Literal(String),
    Null,
    /// NEW.column + by (column must be integer-typed)
    Increment { column: String, by: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: RewriteExpr,
}

impl Assignment {
    pub fn set(column: &str, value: &str) -> Self {
        Self {
            column: column.to_string(),
            value: RewriteExpr::Literal(value.to_string()),
        }
    }

    pub fn set_null(column: &str) -> Self {
        Self {
            column: column.to_string(),
            value: RewriteExpr::Null,
        }
    }

    pub fn increment(column: &str, by: i64) -> Self {
        Self {
            column: column.to_string(),
            value: RewriteExpr::Increment {
                column: column.to_string(),
                by,
            },
        }
    }
}

/// What a policy does when its condition matches. A tagged variant evaluated
/// by the single trigger executor; never class-based dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PolicyAction {
    /// Abort the write with a PolicyViolation
    Deny,
    /// Rewrite fields of the NEW row image, then let the write proceed
    Rewrite { assignments: Vec<Assignment> },
    /// Convert the operation into another one (delete -> update) with the
    /// given field assignments applied to the diverted row
    Divert {
        to: Operation,
        assignments: Vec<Assignment>,
    },
    /// Invoke a registered raw procedure by name
    Raw { procedure: String },
}

impl PolicyAction {
    pub fn kind(&self) -> &'static str {
        match self {
            PolicyAction::Deny => "deny",
            PolicyAction::Rewrite { .. } => "rewrite",
            PolicyAction::Divert { .. } => "divert",
            PolicyAction::Raw { .. } => "raw",
        }
    }
}

/// A named, reusable behavior template bound to one table at compile time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyPrimitive {
    pub name: String,
    pub timing: Timing,
    pub operations: Vec<Operation>,
    pub condition: Option<Condition>,
    pub action: PolicyAction,
    pub priority: i32,
}

impl PolicyPrimitive {
    /// Protect: deny the listed operations outright (condition defaults to
    /// always-true)
    pub fn protect(name: &str, operations: &[Operation]) -> Self {
        Self {
            name: name.to_string(),
            timing: Timing::Before,
            operations: dedup_operations(operations),
            condition: None,
            action: PolicyAction::Deny,
            priority: 0,
        }
    }

    /// Protect with a guard condition (e.g. read-only field: deny update when
    /// OLD.field IS DISTINCT FROM NEW.field)
    pub fn protect_when(name: &str, operations: &[Operation], condition: Condition) -> Self {
        Self {
            condition: Some(condition),
            ..Self::protect(name, operations)
        }
    }

    /// Deny updates that touch the given field
    pub fn read_only_field(name: &str, field: &str) -> Self {
        Self::protect_when(name, &[Operation::Update], Condition::changed(field))
    }

    /// SoftDelete: divert deletes into an update that flags the row
    pub fn soft_delete(name: &str, field: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            timing: Timing::Before,
            operations: vec![Operation::Delete],
            condition: None,
            action: PolicyAction::Divert {
                to: Operation::Update,
                assignments: vec![Assignment::set(field, value)],
            },
            priority: 0,
        }
    }

    /// FiniteStateMachine: deny any update that moves the governed field
    /// outside the declared edge set
    pub fn fsm(name: &str, field: &str, edges: &[(&str, &str)]) -> Self {
        let spec = FsmSpec::new(field, edges);
        spec.into_primitive(name)
    }

    /// RawProcedure: opaque registered procedure with explicit binding
    pub fn raw(
        name: &str,
        timing: Timing,
        operations: &[Operation],
        condition: Option<Condition>,
        procedure: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            timing,
            operations: dedup_operations(operations),
            condition,
            action: PolicyAction::Raw {
                procedure: procedure.to_string(),
            },
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

fn dedup_operations(operations: &[Operation]) -> Vec<Operation> {
    let set: BTreeSet<Operation> = operations.iter().copied().collect();
    set.into_iter().collect()
}

/// Declared transition graph for one governed field. Edges are exact: no
/// implicit self-loops, reverse edges, or transitivity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FsmSpec {
    pub field: String,
    pub edges: BTreeSet<(String, String)>,
}

impl FsmSpec {
    pub fn new(field: &str, edges: &[(&str, &str)]) -> Self {
        Self {
            field: field.to_string(),
            edges: edges
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        }
    }

    /// Lower to a Before-Update Deny primitive. The condition matches when the
    /// field actually changed AND the (OLD, NEW) pair is not a declared edge;
    /// setting the same value never trips the guard.
    pub fn into_primitive(self, name: &str) -> PolicyPrimitive {
        let changed = Condition::changed(&self.field);

        let edge_conditions: Vec<Condition> = self
            .edges
            .iter()
            .map(|(from, to)| {
                Condition::all(vec![
                    Condition::compare(
                        condition::old(&self.field),
                        CompareOp::Eq,
                        Operand::lit(from.clone()),
                    ),
                    Condition::compare(
                        condition::new(&self.field),
                        CompareOp::Eq,
                        Operand::lit(to.clone()),
                    ),
                ])
            })
            .collect();

        let condition = if edge_conditions.is_empty() {
            // No edges declared: every actual change is illegal
            changed
        } else {
            Condition::all(vec![changed, Condition::any(edge_conditions).negate()])
        };

        PolicyPrimitive {
            name: name.to_string(),
            timing: Timing::Before,
            operations: vec![Operation::Update],
            condition: Some(condition),
            action: PolicyAction::Deny,
            priority: 0,
        }
    }
}
