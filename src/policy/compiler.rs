/*
📌 Trigger Compiler
✅ Declarative table policies -> one compiled trigger per (timing, operation)
✅ Compile-time validation: unique names, resolvable fields, action sanity
✅ Conflict detection: Deny vs Divert/Rewrite on one operation needs explicit
   priority ordering, never silent precedence
✅ Deterministic output with a canonical definition for drift detection
*/

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{PolicyError, PolicyResult};
use crate::history::{self, CompiledHistoryEvent, HistoryEventSpec};
use crate::policy::condition::CompiledCondition;
use crate::policy::primitive::{
    Assignment, Operation, PolicyAction, PolicyPrimitive, RewriteExpr, Timing,
};
use crate::policy::procedures;
use crate::schema::{Column, TableSchema};

// ================================
// Declaration surface
// ================================

/// Everything declared for one table: policy primitives plus history events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TablePolicies {
    pub table: String,
    pub primitives: Vec<PolicyPrimitive>,
    pub events: Vec<HistoryEventSpec>,
}

impl TablePolicies {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            primitives: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn with_policy(mut self, primitive: PolicyPrimitive) -> Self {
        self.primitives.push(primitive);
        self
    }

    pub fn with_event(mut self, event: HistoryEventSpec) -> Self {
        self.events.push(event);
        self
    }
}

// ================================
// Compiled artifacts
// ================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompiledPolicy {
    pub name: String,
    pub condition: Option<CompiledCondition>,
    pub action: PolicyAction,
    pub priority: i32,
}

/// One installable trigger: all policies for a (timing, operation) pair,
/// already ordered
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompiledTrigger {
    pub name: String,
    pub table: String,
    pub timing: Timing,
    pub operation: Operation,
    pub policies: Vec<CompiledPolicy>,
}

/// The full compiled output for one table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompiledTableSet {
    pub table: String,
    pub triggers: Vec<CompiledTrigger>,
    pub events: Vec<CompiledHistoryEvent>,
    pub event_table: Option<TableSchema>,
}

/// Canonical view serialized for drift comparison. Excludes schema
/// timestamps so recompiling the same declarations yields identical text.
#[derive(Serialize)]
struct DefinitionView<'a> {
    table: &'a str,
    triggers: &'a [CompiledTrigger],
    events: &'a [CompiledHistoryEvent],
    event_columns: Vec<&'a Column>,
}

impl CompiledTableSet {
    pub fn trigger_for(&self, timing: Timing, operation: Operation) -> Option<&CompiledTrigger> {
        self.triggers
            .iter()
            .find(|t| t.timing == timing && t.operation == operation)
    }

    pub fn has_history(&self) -> bool {
        !self.events.is_empty()
    }

    /// Canonical JSON definition. Identical declarations always produce
    /// identical definitions, which is what drift detection compares.
    pub fn definition(&self) -> PolicyResult<String> {
        let view = DefinitionView {
            table: &self.table,
            triggers: &self.triggers,
            events: &self.events,
            event_columns: self
                .event_table
                .as_ref()
                .map(|schema| schema.columns.iter().collect())
                .unwrap_or_default(),
        };
        Ok(serde_json::to_string(&view)?)
    }
}

// ================================
// Compilation
// ================================

/// Compile the declarations for one table against its schema
pub fn compile_table(
    schema: &TableSchema,
    policies: &TablePolicies,
) -> PolicyResult<CompiledTableSet> {
    if policies.table != schema.name {
        return Err(PolicyError::compile(
            &schema.name,
            None,
            &format!(
                "declarations are bound to table '{}', not '{}'",
                policies.table, schema.name
            ),
        ));
    }

    validate_unique_names(schema, &policies.primitives)?;

    let mut compiled: Vec<(Timing, Operation, CompiledPolicy)> = Vec::new();
    for primitive in &policies.primitives {
        validate_primitive(schema, primitive)?;
        let condition = match &primitive.condition {
            Some(raw) => Some(
                raw.compile(schema)
                    .map_err(|err| attach_policy(err, &primitive.name))?,
            ),
            None => None,
        };

        for operation in &primitive.operations {
            compiled.push((
                primitive.timing,
                *operation,
                CompiledPolicy {
                    name: primitive.name.clone(),
                    condition: condition.clone(),
                    action: primitive.action.clone(),
                    priority: primitive.priority,
                },
            ));
        }
    }

    detect_conflicts(schema, &compiled)?;

    // Group into one trigger per (timing, operation), policies ordered by
    // (priority, name) for deterministic execution
    let mut groups: HashMap<(Timing, Operation), Vec<CompiledPolicy>> = HashMap::new();
    for (timing, operation, policy) in compiled {
        groups.entry((timing, operation)).or_default().push(policy);
    }

    let mut triggers: Vec<CompiledTrigger> = groups
        .into_iter()
        .map(|((timing, operation), mut group)| {
            group.sort_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));
            CompiledTrigger {
                name: format!("{}__{}_{}", schema.name, timing.as_str(), operation.as_str()),
                table: schema.name.clone(),
                timing,
                operation,
                policies: group,
            }
        })
        .collect();
    triggers.sort_by(|a, b| {
        (a.timing.as_str(), a.operation).cmp(&(b.timing.as_str(), b.operation))
    });

    let events = history::compile_events(schema, &policies.events)?;
    let event_table = if events.is_empty() {
        None
    } else {
        Some(history::event_table_schema(schema))
    };

    Ok(CompiledTableSet {
        table: schema.name.clone(),
        triggers,
        events,
        event_table,
    })
}

/// Attach the policy name to condition compile errors
fn attach_policy(err: PolicyError, policy: &str) -> PolicyError {
    match err {
        PolicyError::Compile { table, message, .. } => PolicyError::Compile {
            table,
            policy: Some(policy.to_string()),
            message,
        },
        other => other,
    }
}

fn validate_unique_names(schema: &TableSchema, primitives: &[PolicyPrimitive]) -> PolicyResult<()> {
    let mut seen = std::collections::HashSet::new();
    for primitive in primitives {
        if primitive.name.trim().is_empty() {
            return Err(PolicyError::compile(
                &schema.name,
                None,
                "policy name cannot be empty",
            ));
        }
        if !seen.insert(primitive.name.clone()) {
            return Err(PolicyError::compile(
                &schema.name,
                Some(&primitive.name),
                "duplicate policy name",
            ));
        }
    }
    Ok(())
}

fn validate_primitive(schema: &TableSchema, primitive: &PolicyPrimitive) -> PolicyResult<()> {
    let compile_err = |message: String| {
        PolicyError::compile(&schema.name, Some(&primitive.name), &message)
    };

    if primitive.operations.is_empty() {
        return Err(compile_err("policy must bind at least one operation".into()));
    }

    match &primitive.action {
        PolicyAction::Deny => {
            if primitive.timing != Timing::Before {
                return Err(compile_err("Deny actions require Before timing".into()));
            }
        }
        PolicyAction::Rewrite { assignments } => {
            if primitive.timing != Timing::Before {
                return Err(compile_err("Rewrite actions require Before timing".into()));
            }
            if primitive.operations.contains(&Operation::Delete) {
                return Err(compile_err(
                    "Rewrite cannot be bound on Delete (no NEW image to rewrite)".into(),
                ));
            }
            validate_assignments(schema, primitive, assignments)?;
        }
        PolicyAction::Divert { to, assignments } => {
            if primitive.timing != Timing::Before {
                return Err(compile_err("Divert actions require Before timing".into()));
            }
            if *to != Operation::Update {
                return Err(compile_err("Divert can only target Update".into()));
            }
            if primitive.operations != vec![Operation::Delete] {
                return Err(compile_err(
                    "Divert to Update can only be bound on Delete".into(),
                ));
            }
            validate_assignments(schema, primitive, assignments)?;
        }
        PolicyAction::Raw { procedure } => {
            if !procedures::is_registered(procedure) {
                return Err(compile_err(format!(
                    "raw procedure '{}' is not registered",
                    procedure
                )));
            }
        }
    }

    Ok(())
}

fn validate_assignments(
    schema: &TableSchema,
    primitive: &PolicyPrimitive,
    assignments: &[Assignment],
) -> PolicyResult<()> {
    if assignments.is_empty() {
        return Err(PolicyError::compile(
            &schema.name,
            Some(&primitive.name),
            "action requires at least one field assignment",
        ));
    }
    for assignment in assignments {
        let column = schema.column(&assignment.column).ok_or_else(|| {
            PolicyError::compile(
                &schema.name,
                Some(&primitive.name),
                &format!("assignment references unknown column '{}'", assignment.column),
            )
        })?;
        match &assignment.value {
            RewriteExpr::Null => {
                if !column.is_nullable {
                    return Err(PolicyError::compile(
                        &schema.name,
                        Some(&primitive.name),
                        &format!("cannot assign NULL to non-nullable column '{}'", column.name),
                    ));
                }
            }
            RewriteExpr::Increment { column: source, .. } => {
                let source_column = schema.column(source).ok_or_else(|| {
                    PolicyError::compile(
                        &schema.name,
                        Some(&primitive.name),
                        &format!("increment references unknown column '{}'", source),
                    )
                })?;
                if !source_column.data_type.is_integer() {
                    return Err(PolicyError::compile(
                        &schema.name,
                        Some(&primitive.name),
                        &format!("increment requires an integer column, got '{}'", source),
                    ));
                }
            }
            RewriteExpr::Literal(_) => {}
        }
    }
    Ok(())
}

/// Two primitives on the same (timing, operation) with equal priority are a
/// configuration error unless both merely Deny: a Protect guarding an
/// operation that a SoftDelete diverts would otherwise resolve silently.
fn detect_conflicts(
    schema: &TableSchema,
    compiled: &[(Timing, Operation, CompiledPolicy)],
) -> PolicyResult<()> {
    for (i, (timing_a, op_a, a)) in compiled.iter().enumerate() {
        for (timing_b, op_b, b) in compiled.iter().skip(i + 1) {
            if timing_a != timing_b || op_a != op_b || a.priority != b.priority {
                continue;
            }
            let both_deny = a.action == PolicyAction::Deny && b.action == PolicyAction::Deny;
            if !both_deny {
                return Err(PolicyError::compile(
                    &schema.name,
                    Some(&a.name),
                    &format!(
                        "policies '{}' ({}) and '{}' ({}) overlap on {} with equal priority; \
                         assign distinct priorities to order them",
                        a.name,
                        a.action.kind(),
                        b.name,
                        b.action.kind(),
                        op_a
                    ),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DataType;

    fn schema() -> TableSchema {
        TableSchema::new("accounts")
            .add_column("id", DataType::Text, false)
            .add_column("is_active", DataType::Boolean, false)
            .add_column("balance", DataType::Integer, false)
    }

    #[test]
    fn test_compile_groups_by_timing_and_operation() {
        let policies = TablePolicies::new("accounts")
            .with_policy(PolicyPrimitive::protect(
                "append_only",
                &[Operation::Update, Operation::Delete],
            ));
        let set = compile_table(&schema(), &policies).unwrap();
        assert_eq!(set.triggers.len(), 2);
        assert!(set
            .trigger_for(Timing::Before, Operation::Update)
            .is_some());
        assert!(set
            .trigger_for(Timing::Before, Operation::Delete)
            .is_some());
        assert!(set.trigger_for(Timing::Before, Operation::Insert).is_none());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let policies = TablePolicies::new("accounts")
            .with_policy(PolicyPrimitive::protect("guard", &[Operation::Delete]))
            .with_policy(PolicyPrimitive::protect("guard", &[Operation::Insert]));
        let err = compile_table(&schema(), &policies).unwrap_err();
        assert_eq!(err.error_code(), "COMPILE_ERROR");
    }

    #[test]
    fn test_deny_and_divert_with_equal_priority_conflict() {
        let policies = TablePolicies::new("accounts")
            .with_policy(PolicyPrimitive::protect("protect_deletes", &[Operation::Delete]))
            .with_policy(PolicyPrimitive::soft_delete("soft_delete", "is_active", "false"));
        let err = compile_table(&schema(), &policies).unwrap_err();
        assert!(err.user_message().contains("equal priority"));
    }

    #[test]
    fn test_distinct_priorities_resolve_the_conflict() {
        let policies = TablePolicies::new("accounts")
            .with_policy(
                PolicyPrimitive::protect("protect_deletes", &[Operation::Delete]).with_priority(10),
            )
            .with_policy(PolicyPrimitive::soft_delete("soft_delete", "is_active", "false"));
        let set = compile_table(&schema(), &policies).unwrap();
        let trigger = set.trigger_for(Timing::Before, Operation::Delete).unwrap();
        // Lower priority value executes first
        assert_eq!(trigger.policies[0].name, "soft_delete");
        assert_eq!(trigger.policies[1].name, "protect_deletes");
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let policies = TablePolicies::new("accounts")
            .with_policy(PolicyPrimitive::protect("b_guard", &[Operation::Delete]))
            .with_policy(PolicyPrimitive::protect("a_guard", &[Operation::Delete]))
            .with_event(crate::history::HistoryEventSpec::snapshot());
        let first = compile_table(&schema(), &policies).unwrap();
        let second = compile_table(&schema(), &policies).unwrap();
        assert_eq!(first.definition().unwrap(), second.definition().unwrap());
    }

    #[test]
    fn test_divert_must_target_update() {
        let mut primitive = PolicyPrimitive::soft_delete("soft_delete", "is_active", "false");
        if let PolicyAction::Divert { to, .. } = &mut primitive.action {
            *to = Operation::Insert;
        }
        let policies = TablePolicies::new("accounts").with_policy(primitive);
        assert!(compile_table(&schema(), &policies).is_err());
    }

    #[test]
    fn test_unregistered_procedure_rejected() {
        let policies = TablePolicies::new("accounts").with_policy(PolicyPrimitive::raw(
            "custom",
            Timing::Before,
            &[Operation::Update],
            None,
            "definitely_not_registered",
        ));
        let err = compile_table(&schema(), &policies).unwrap_err();
        assert!(err.user_message().contains("not registered"));
    }

    #[test]
    fn test_increment_requires_integer_column() {
        let primitive = PolicyPrimitive {
            name: "bump".to_string(),
            timing: Timing::Before,
            operations: vec![Operation::Update],
            condition: None,
            action: PolicyAction::Rewrite {
                assignments: vec![Assignment::increment("is_active", 1)],
            },
            priority: 0,
        };
        let policies = TablePolicies::new("accounts").with_policy(primitive);
        assert!(compile_table(&schema(), &policies).is_err());
    }
}
