/*
📌 Trigger Executor - the guarded write path
✅ Single evaluator over the tagged action variant (Deny/Rewrite/Divert/Raw)
✅ Every policy checks the suppression registry before acting
✅ Delete -> Update diversion re-enters the update pipeline
✅ After-write history events, strict (compensating) or best-effort
*/

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{PolicyError, PolicyResult};
use crate::history::{self, HistoryMode};
use crate::policy::compiler::{CompiledPolicy, CompiledTableSet};
use crate::policy::primitive::{Assignment, Operation, PolicyAction, RewriteExpr, Timing};
use crate::policy::procedures::{self, ProcedureContext};
use crate::schema::SchemaManager;
use crate::storage::{Row, Storage};
use crate::suppression::SuppressionRegistry;

/// What a guarded write ended up doing
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Operation actually performed (a diverted delete reports Update)
    pub operation: Operation,
    /// False when the target row did not exist
    pub performed: bool,
    /// True when a Divert action converted the operation
    pub diverted: bool,
    /// Labels of the history events recorded for this write
    pub recorded_events: Vec<String>,
    /// Final row image, None after a physical delete
    pub row: Option<Row>,
}

impl WriteOutcome {
    fn skipped(operation: Operation) -> Self {
        Self {
            operation,
            performed: false,
            diverted: false,
            recorded_events: Vec::new(),
            row: None,
        }
    }
}

/// Result of the BEFORE pipeline for one operation
enum BeforeOutcome {
    Proceed(Option<Row>),
    Diverted { assignments: Vec<Assignment> },
}

pub struct PolicyExecutor {
    storage: Storage,
    schemas: Arc<SchemaManager>,
    suppression: SuppressionRegistry,
    installed: Arc<Mutex<HashMap<String, CompiledTableSet>>>,
    history_mode: HistoryMode,
}

impl PolicyExecutor {
    pub fn new(
        storage: Storage,
        schemas: Arc<SchemaManager>,
        suppression: SuppressionRegistry,
        installed: Arc<Mutex<HashMap<String, CompiledTableSet>>>,
        history_mode: HistoryMode,
    ) -> Self {
        Self {
            storage,
            schemas,
            suppression,
            installed,
            history_mode,
        }
    }

    // ================================
    // Guarded writes
    // ================================

    pub fn insert(&self, session: &str, table: &str, key: &str, row: Row) -> PolicyResult<WriteOutcome> {
        if self.storage.select(table, key)?.is_some() {
            return Err(PolicyError::schema(
                Some(table),
                &format!("row '{}' already exists", key),
            ));
        }

        let transaction_id = Uuid::new_v4().to_string();
        let set = self.table_set(table);

        let new_row = match self.run_before(
            session,
            table,
            set.as_ref(),
            Operation::Insert,
            None,
            Some(row),
        )? {
            // Divert is compile-restricted to delete, so insert always proceeds
            BeforeOutcome::Proceed(Some(new_row)) => new_row,
            _ => {
                return Err(PolicyError::storage(
                    "trigger_pipeline",
                    "insert lost its NEW image",
                ))
            }
        };

        self.schemas.validate_row(table, &new_row)?;
        self.storage.insert(table, key, &new_row)?;

        let recorded_events = match self.run_after(
            session,
            table,
            set.as_ref(),
            Operation::Insert,
            None,
            &new_row,
            key,
            &transaction_id,
        ) {
            Ok(labels) => labels,
            Err(err) => {
                // Strict history mode: compensate the primary write
                self.storage.delete(table, key)?;
                return Err(err);
            }
        };

        Ok(WriteOutcome {
            operation: Operation::Insert,
            performed: true,
            diverted: false,
            recorded_events,
            row: Some(new_row),
        })
    }

    /// Merge the given column changes into the stored row and apply the
    /// guarded update. Updating a missing row is a no-op.
    pub fn update(&self, session: &str, table: &str, key: &str, changes: Row) -> PolicyResult<WriteOutcome> {
        let old_row = match self.storage.select(table, key)? {
            Some(row) => row,
            None => return Ok(WriteOutcome::skipped(Operation::Update)),
        };

        let mut merged = old_row.clone();
        merged.extend(changes);

        let transaction_id = Uuid::new_v4().to_string();
        self.update_inner(session, table, key, old_row, merged, &transaction_id, false)
    }

    pub fn delete(&self, session: &str, table: &str, key: &str) -> PolicyResult<WriteOutcome> {
        let old_row = match self.storage.select(table, key)? {
            Some(row) => row,
            None => return Ok(WriteOutcome::skipped(Operation::Delete)),
        };

        let transaction_id = Uuid::new_v4().to_string();
        let set = self.table_set(table);

        match self.run_before(
            session,
            table,
            set.as_ref(),
            Operation::Delete,
            Some(&old_row),
            None,
        )? {
            BeforeOutcome::Diverted { assignments } => {
                // The delete becomes an update of the same row; the update
                // pipeline (its policies and history) applies in full
                let mut diverted_row = old_row.clone();
                apply_assignments(&mut diverted_row, &assignments);
                log::debug!("delete on {}/{} diverted to update", table, key);
                self.update_inner(
                    session,
                    table,
                    key,
                    old_row,
                    diverted_row,
                    &transaction_id,
                    true,
                )
            }
            BeforeOutcome::Proceed(_) => {
                self.storage.delete(table, key)?;
                // No history event fires on delete; After raw policies still run
                if let Err(err) = self.run_after_procedures(
                    session,
                    table,
                    set.as_ref(),
                    Operation::Delete,
                    Some(&old_row),
                    None,
                ) {
                    self.storage.insert(table, key, &old_row)?;
                    return Err(err);
                }
                Ok(WriteOutcome {
                    operation: Operation::Delete,
                    performed: true,
                    diverted: false,
                    recorded_events: Vec::new(),
                    row: None,
                })
            }
        }
    }

    fn update_inner(
        &self,
        session: &str,
        table: &str,
        key: &str,
        old_row: Row,
        new_row: Row,
        transaction_id: &str,
        diverted: bool,
    ) -> PolicyResult<WriteOutcome> {
        let set = self.table_set(table);

        let new_row = match self.run_before(
            session,
            table,
            set.as_ref(),
            Operation::Update,
            Some(&old_row),
            Some(new_row),
        )? {
            BeforeOutcome::Proceed(Some(row)) => row,
            _ => {
                return Err(PolicyError::storage(
                    "trigger_pipeline",
                    "update lost its NEW image",
                ))
            }
        };

        self.schemas.validate_row(table, &new_row)?;
        self.storage.update(table, key, &new_row)?;

        let recorded_events = match self.run_after(
            session,
            table,
            set.as_ref(),
            Operation::Update,
            Some(&old_row),
            &new_row,
            key,
            transaction_id,
        ) {
            Ok(labels) => labels,
            Err(err) => {
                self.storage.update(table, key, &old_row)?;
                return Err(err);
            }
        };

        Ok(WriteOutcome {
            operation: Operation::Update,
            performed: true,
            diverted,
            recorded_events,
            row: Some(new_row),
        })
    }

    // ================================
    // Unguarded read surface
    // ================================

    pub fn select(&self, table: &str, key: &str) -> PolicyResult<Option<Row>> {
        self.storage.select(table, key)
    }

    pub fn row_count(&self, table: &str) -> PolicyResult<usize> {
        self.storage.row_count(table)
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    // ================================
    // Pipeline stages
    // ================================

    fn table_set(&self, table: &str) -> Option<CompiledTableSet> {
        self.installed.lock().unwrap().get(table).cloned()
    }

    fn run_before(
        &self,
        session: &str,
        table: &str,
        set: Option<&CompiledTableSet>,
        operation: Operation,
        old_row: Option<&Row>,
        mut new_row: Option<Row>,
    ) -> PolicyResult<BeforeOutcome> {
        let trigger = match set.and_then(|s| s.trigger_for(Timing::Before, operation)) {
            Some(trigger) => trigger,
            None => return Ok(BeforeOutcome::Proceed(new_row)),
        };

        for policy in &trigger.policies {
            if self.suppression.is_suppressed(session, table, &policy.name) {
                log::debug!("policy '{}' suppressed in session {}", policy.name, session);
                continue;
            }

            let matches = policy
                .condition
                .as_ref()
                .map_or(true, |c| c.evaluate(old_row, new_row.as_ref()));
            if !matches {
                continue;
            }

            match &policy.action {
                PolicyAction::Deny => {
                    return Err(PolicyError::violation(
                        table,
                        &policy.name,
                        operation.as_str(),
                        "operation denied by policy",
                    ));
                }
                PolicyAction::Rewrite { assignments } => {
                    if let Some(row) = new_row.as_mut() {
                        apply_assignments(row, assignments);
                    }
                }
                PolicyAction::Divert { assignments, .. } => {
                    return Ok(BeforeOutcome::Diverted {
                        assignments: assignments.clone(),
                    });
                }
                PolicyAction::Raw { procedure } => {
                    new_row = self.invoke_procedure(
                        procedure,
                        policy,
                        table,
                        operation,
                        old_row,
                        new_row,
                    )?;
                }
            }
        }

        Ok(BeforeOutcome::Proceed(new_row))
    }

    /// After-write stage: raw After policies first, then history events
    fn run_after(
        &self,
        session: &str,
        table: &str,
        set: Option<&CompiledTableSet>,
        operation: Operation,
        old_row: Option<&Row>,
        new_row: &Row,
        key: &str,
        transaction_id: &str,
    ) -> PolicyResult<Vec<String>> {
        self.run_after_procedures(session, table, set, operation, old_row, Some(new_row))?;

        let set = match set {
            Some(set) if set.has_history() => set,
            _ => return Ok(Vec::new()),
        };

        let mut recorded = Vec::new();
        for event in set.events.iter().filter(|e| e.fires_for(operation)) {
            let matches = event
                .condition
                .as_ref()
                .map_or(true, |c| c.evaluate(old_row, Some(new_row)));
            if !matches {
                continue;
            }

            match self.record_event(table, &event.label, new_row, key, transaction_id) {
                Ok(()) => recorded.push(event.label.clone()),
                Err(err) => match self.history_mode {
                    HistoryMode::Strict => return Err(err),
                    HistoryMode::BestEffort => {
                        log::warn!("best-effort history write failed: {}", err);
                    }
                },
            }
        }
        Ok(recorded)
    }

    fn run_after_procedures(
        &self,
        session: &str,
        table: &str,
        set: Option<&CompiledTableSet>,
        operation: Operation,
        old_row: Option<&Row>,
        new_row: Option<&Row>,
    ) -> PolicyResult<()> {
        let trigger = match set.and_then(|s| s.trigger_for(Timing::After, operation)) {
            Some(trigger) => trigger,
            None => return Ok(()),
        };

        for policy in &trigger.policies {
            if self.suppression.is_suppressed(session, table, &policy.name) {
                continue;
            }
            let matches = policy
                .condition
                .as_ref()
                .map_or(true, |c| c.evaluate(old_row, new_row));
            if !matches {
                continue;
            }
            if let PolicyAction::Raw { procedure } = &policy.action {
                // After procedures observe the write; image rewrites are gone
                self.invoke_procedure(
                    procedure,
                    policy,
                    table,
                    operation,
                    old_row,
                    new_row.cloned(),
                )?;
            }
        }
        Ok(())
    }

    fn invoke_procedure(
        &self,
        procedure: &str,
        policy: &CompiledPolicy,
        table: &str,
        operation: Operation,
        old_row: Option<&Row>,
        new_row: Option<Row>,
    ) -> PolicyResult<Option<Row>> {
        let context = ProcedureContext {
            table,
            operation,
            old_row,
            new_row: new_row.as_ref(),
        };
        match procedures::invoke(procedure, &context) {
            Ok(Some(modified)) => Ok(Some(modified)),
            Ok(None) => Ok(new_row),
            Err(message) => Err(PolicyError::violation(
                table,
                &policy.name,
                operation.as_str(),
                &message,
            )),
        }
    }

    fn record_event(
        &self,
        table: &str,
        label: &str,
        image: &Row,
        key: &str,
        transaction_id: &str,
    ) -> PolicyResult<()> {
        let event_table = history::event_table_name(table);
        let sequence = self
            .storage
            .next_sequence()
            .map_err(|e| PolicyError::history_write(table, &event_table, &e.to_string()))?;
        let row = history::build_history_row(image, label, key, transaction_id, sequence);
        self.storage
            .insert(&event_table, &history::history_key(sequence), &row)
            .map_err(|e| PolicyError::history_write(table, &event_table, &e.to_string()))
    }
}

fn apply_assignments(row: &mut Row, assignments: &[Assignment]) {
    for assignment in assignments {
        match &assignment.value {
            RewriteExpr::Literal(value) => {
                row.insert(assignment.column.clone(), value.clone());
            }
            RewriteExpr::Null => {
                row.remove(&assignment.column);
            }
            RewriteExpr::Increment { column, by } => {
                let current = row
                    .get(column)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                row.insert(assignment.column.clone(), (current + by).to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_assignments() {
        let mut row = Row::new();
        row.insert("count".to_string(), "4".to_string());
        row.insert("note".to_string(), "x".to_string());

        apply_assignments(
            &mut row,
            &[
                Assignment::increment("count", 1),
                Assignment::set_null("note"),
                Assignment::set("flag", "true"),
            ],
        );

        assert_eq!(row.get("count").map(String::as_str), Some("5"));
        assert!(!row.contains_key("note"));
        assert_eq!(row.get("flag").map(String::as_str), Some("true"));
    }
}
