/*
📌 History Derivation
✅ Event specs: snapshot-on-write, after-insert, after-update-with-condition
✅ Satellite append-only event table per tracked table
✅ Every history row carries label, source key, transaction id and sequence
✅ Strict (default) or best-effort write mode, fixed per deployment
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, PolicyResult};
use crate::policy::condition::{CompiledCondition, Condition};
use crate::policy::primitive::Operation;
use crate::schema::{DataType, TableSchema};
use crate::storage::{Row, Storage};

/// Reserved label for the unconditional full-image event
pub const SNAPSHOT_LABEL: &str = "snapshot";

/// Metadata columns appended to the tracked table's columns in the event table
pub const METADATA_COLUMNS: [&str; 5] = [
    "event_label",
    "source_key",
    "transaction_id",
    "sequence",
    "recorded_at",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HistoryFireOn {
    Snapshot,
    AfterInsert,
    AfterUpdate,
}

/// Declarative history event specification for one tracked table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEventSpec {
    pub label: String,
    pub fire_on: HistoryFireOn,
    pub condition: Option<Condition>,
}

impl HistoryEventSpec {
    /// Full row image on every insert and update, labeled "snapshot"
    pub fn snapshot() -> Self {
        Self {
            label: SNAPSHOT_LABEL.to_string(),
            fire_on: HistoryFireOn::Snapshot,
            condition: None,
        }
    }

    pub fn after_insert(label: &str) -> Self {
        Self {
            label: label.to_string(),
            fire_on: HistoryFireOn::AfterInsert,
            condition: None,
        }
    }

    pub fn after_update(label: &str) -> Self {
        Self {
            label: label.to_string(),
            fire_on: HistoryFireOn::AfterUpdate,
            condition: None,
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// How a failed history insert affects the primary write
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HistoryMode {
    /// History failure aborts (compensates) the primary write. The default.
    Strict,
    /// History failure is logged and the primary write stands
    BestEffort,
}

impl Default for HistoryMode {
    fn default() -> Self {
        HistoryMode::Strict
    }
}

impl HistoryMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "strict" => Some(HistoryMode::Strict),
            "best_effort" => Some(HistoryMode::BestEffort),
            _ => None,
        }
    }
}

/// A schema-validated history event ready for write-time evaluation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompiledHistoryEvent {
    pub label: String,
    pub fire_on: HistoryFireOn,
    pub condition: Option<CompiledCondition>,
}

impl CompiledHistoryEvent {
    pub fn fires_for(&self, operation: Operation) -> bool {
        match self.fire_on {
            HistoryFireOn::Snapshot => {
                matches!(operation, Operation::Insert | Operation::Update)
            }
            HistoryFireOn::AfterInsert => operation == Operation::Insert,
            HistoryFireOn::AfterUpdate => operation == Operation::Update,
        }
    }
}

pub fn event_table_name(table: &str) -> String {
    format!("{}_events", table)
}

/// Satellite table schema: tracked columns plus event metadata
pub fn event_table_schema(tracked: &TableSchema) -> TableSchema {
    let mut schema = TableSchema::new(&event_table_name(&tracked.name));
    for column in &tracked.columns {
        // Copied images may omit columns the tracked row left NULL
        schema = schema.add_column(&column.name, column.data_type, true);
    }
    schema
        .add_column("event_label", DataType::Text, false)
        .add_column("source_key", DataType::Text, false)
        .add_column("transaction_id", DataType::UUID, false)
        .add_column("sequence", DataType::BigInteger, false)
        .add_column("recorded_at", DataType::Timestamp, false)
}

/// Validate and compile the event specs for one tracked table
pub fn compile_events(
    schema: &TableSchema,
    specs: &[HistoryEventSpec],
) -> PolicyResult<Vec<CompiledHistoryEvent>> {
    for metadata in METADATA_COLUMNS {
        if schema.has_column(metadata) {
            return Err(PolicyError::compile(
                &schema.name,
                None,
                &format!(
                    "tracked table column '{}' collides with a history metadata column",
                    metadata
                ),
            ));
        }
    }

    let mut seen = std::collections::HashSet::new();
    let mut compiled = Vec::new();
    for spec in specs {
        if spec.label.trim().is_empty() {
            return Err(PolicyError::compile(
                &schema.name,
                None,
                "history event label cannot be empty",
            ));
        }
        if !seen.insert((spec.label.clone(), spec.fire_on)) {
            return Err(PolicyError::compile(
                &schema.name,
                None,
                &format!("duplicate history event '{}'", spec.label),
            ));
        }
        match spec.fire_on {
            HistoryFireOn::Snapshot => {
                if spec.label != SNAPSHOT_LABEL {
                    return Err(PolicyError::compile(
                        &schema.name,
                        None,
                        &format!("snapshot events must use the '{}' label", SNAPSHOT_LABEL),
                    ));
                }
                if spec.condition.is_some() {
                    return Err(PolicyError::compile(
                        &schema.name,
                        None,
                        "snapshot events are unconditional",
                    ));
                }
            }
            _ => {
                if spec.label == SNAPSHOT_LABEL {
                    return Err(PolicyError::compile(
                        &schema.name,
                        None,
                        &format!("label '{}' is reserved for snapshot events", SNAPSHOT_LABEL),
                    ));
                }
            }
        }

        let condition = spec
            .condition
            .as_ref()
            .map(|c| c.compile(schema))
            .transpose()?;
        compiled.push(CompiledHistoryEvent {
            label: spec.label.clone(),
            fire_on: spec.fire_on,
            condition,
        });
    }

    // Deterministic ordering for reproducible installation
    compiled.sort_by(|a, b| (a.fire_on, &a.label).cmp(&(b.fire_on, &b.label)));
    Ok(compiled)
}

// ================================
// History rows (read surface)
// ================================

/// One append-only history record parsed back from the event table
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub event_label: String,
    pub source_key: String,
    pub transaction_id: String,
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub row_image: Row,
}

/// Flatten a NEW row image plus metadata into an event table row
pub fn build_history_row(
    image: &Row,
    label: &str,
    source_key: &str,
    transaction_id: &str,
    sequence: u64,
) -> Row {
    let mut row = image.clone();
    row.insert("event_label".to_string(), label.to_string());
    row.insert("source_key".to_string(), source_key.to_string());
    row.insert("transaction_id".to_string(), transaction_id.to_string());
    row.insert("sequence".to_string(), sequence.to_string());
    row.insert("recorded_at".to_string(), Utc::now().to_rfc3339());
    row
}

/// Storage key: zero-padded sequence so key order equals event order
pub fn history_key(sequence: u64) -> String {
    format!("{:020}", sequence)
}

fn parse_history_row(flat: &Row) -> Option<HistoryRow> {
    let event_label = flat.get("event_label")?.clone();
    let source_key = flat.get("source_key")?.clone();
    let transaction_id = flat.get("transaction_id")?.clone();
    let sequence = flat.get("sequence")?.parse::<u64>().ok()?;
    let recorded_at = DateTime::parse_from_rfc3339(flat.get("recorded_at")?)
        .ok()?
        .with_timezone(&Utc);

    let row_image: Row = flat
        .iter()
        .filter(|(key, _)| !METADATA_COLUMNS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Some(HistoryRow {
        event_label,
        source_key,
        transaction_id,
        sequence,
        recorded_at,
        row_image,
    })
}

/// Read history rows in event order, optionally filtered by label
pub fn read_events(
    storage: &Storage,
    table: &str,
    label: Option<&str>,
) -> PolicyResult<Vec<HistoryRow>> {
    let event_table = event_table_name(table);
    let mut events: Vec<HistoryRow> = storage
        .scan(&event_table)?
        .iter()
        .filter_map(|(_, row)| parse_history_row(row))
        .filter(|event| label.map_or(true, |l| event.event_label == l))
        .collect();
    events.sort_by_key(|event| event.sequence);
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::condition::{self, CompareOp, Operand};

    fn schema() -> TableSchema {
        TableSchema::new("measurements")
            .add_column("id", DataType::Text, false)
            .add_column("reading", DataType::Integer, false)
    }

    #[test]
    fn test_snapshot_fires_on_insert_and_update() {
        let events = compile_events(&schema(), &[HistoryEventSpec::snapshot()]).unwrap();
        assert!(events[0].fires_for(Operation::Insert));
        assert!(events[0].fires_for(Operation::Update));
        assert!(!events[0].fires_for(Operation::Delete));
    }

    #[test]
    fn test_snapshot_label_is_reserved() {
        let err = compile_events(&schema(), &[HistoryEventSpec::after_insert("snapshot")])
            .unwrap_err();
        assert_eq!(err.error_code(), "COMPILE_ERROR");
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        let specs = vec![
            HistoryEventSpec::after_insert("create"),
            HistoryEventSpec::after_insert("create"),
        ];
        assert!(compile_events(&schema(), &specs).is_err());
    }

    #[test]
    fn test_metadata_collision_rejected() {
        let colliding = TableSchema::new("bad")
            .add_column("id", DataType::Text, false)
            .add_column("sequence", DataType::Integer, false);
        let err = compile_events(&colliding, &[HistoryEventSpec::snapshot()]).unwrap_err();
        assert!(err.user_message().contains("sequence"));
    }

    #[test]
    fn test_conditional_event_compiles() {
        let spec = HistoryEventSpec::after_update("low_reading").when(Condition::compare(
            condition::new("reading"),
            CompareOp::Lt,
            Operand::lit("0"),
        ));
        let events = compile_events(&schema(), &[spec]).unwrap();
        assert!(events[0].condition.is_some());
        assert!(events[0].fires_for(Operation::Update));
        assert!(!events[0].fires_for(Operation::Insert));
    }

    #[test]
    fn test_history_row_roundtrip() {
        let mut image = Row::new();
        image.insert("id".to_string(), "m1".to_string());
        image.insert("reading".to_string(), "-5".to_string());

        let flat = build_history_row(&image, "low_reading", "m1", "tx-1", 42);
        let parsed = parse_history_row(&flat).unwrap();
        assert_eq!(parsed.event_label, "low_reading");
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.row_image, image);
    }
}
