/*
📌 Condition Expressions over OLD/NEW Row Images
✅ Typed predicate tree compiled against a table schema
✅ NULL-aware evaluation (comparisons against NULL are false)
✅ IS DISTINCT FROM / IS NOT DISTINCT FROM for change detection
✅ OLD.* IS DISTINCT FROM NEW.* wildcard for "row actually changed"
*/

use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, PolicyResult};
use crate::schema::{DataType, TableSchema};
use crate::storage::Row;

// ================================
// Raw (declarative) expression tree
// ================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowImage {
    Old,
    New,
}

/// Reference to one column of the OLD or NEW row image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRef {
    pub image: RowImage,
    pub column: String,
}

/// OLD.column reference
pub fn old(column: &str) -> FieldRef {
    FieldRef {
        image: RowImage::Old,
        column: column.to_string(),
    }
}

/// NEW.column reference
pub fn new(column: &str) -> FieldRef {
    FieldRef {
        image: RowImage::New,
        column: column.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    IsDistinctFrom,
    IsNotDistinctFrom,
}

impl CompareOp {
    fn is_ordering(&self) -> bool {
        matches!(self, CompareOp::Lt | CompareOp::LtEq | CompareOp::Gt | CompareOp::GtEq)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Literal(String),
    Field(FieldRef),
}

impl Operand {
    pub fn lit(value: impl Into<String>) -> Self {
        Operand::Literal(value.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Compare {
        left: FieldRef,
        op: CompareOp,
        right: Operand,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    /// OLD.* IS DISTINCT FROM NEW.* over every column of the bound table
    AnyColumnChanged,
}

impl Condition {
    pub fn compare(left: FieldRef, op: CompareOp, right: Operand) -> Self {
        Condition::Compare { left, op, right }
    }

    /// OLD.column IS DISTINCT FROM NEW.column
    pub fn changed(column: &str) -> Self {
        Condition::Compare {
            left: old(column),
            op: CompareOp::IsDistinctFrom,
            right: Operand::Field(new(column)),
        }
    }

    /// OLD.column IS NOT DISTINCT FROM NEW.column
    pub fn unchanged(column: &str) -> Self {
        Condition::Compare {
            left: old(column),
            op: CompareOp::IsNotDistinctFrom,
            right: Operand::Field(new(column)),
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::And(conditions)
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Or(conditions)
    }

    pub fn negate(self) -> Self {
        Condition::Not(Box::new(self))
    }

    /// Resolve every field reference against the table schema and type every
    /// literal. Fails with a compile error on unknown columns, type
    /// mismatches, or ordering comparisons on non-comparable types.
    pub fn compile(&self, schema: &TableSchema) -> PolicyResult<CompiledCondition> {
        let root = compile_node(self, schema)?;
        Ok(CompiledCondition {
            table: schema.name.clone(),
            root,
        })
    }
}

// ================================
// Compiled (typed, validated) form
// ================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Int,
    Float,
    Bool,
    Text,
}

fn kind_of(data_type: DataType) -> ValueKind {
    match data_type {
        DataType::Integer | DataType::BigInteger => ValueKind::Int,
        DataType::Real | DataType::Double => ValueKind::Float,
        DataType::Boolean => ValueKind::Bool,
        _ => ValueKind::Text,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
}

fn parse_typed(value: &str, kind: ValueKind) -> Option<TypedValue> {
    match kind {
        ValueKind::Int => value.parse::<i64>().ok().map(TypedValue::Integer),
        ValueKind::Float => value.parse::<f64>().ok().map(TypedValue::Float),
        ValueKind::Bool => match value.to_lowercase().as_str() {
            "true" | "1" => Some(TypedValue::Boolean(true)),
            "false" | "0" => Some(TypedValue::Boolean(false)),
            _ => None,
        },
        ValueKind::Text => Some(TypedValue::Text(value.to_string())),
    }
}

fn order_values(left: &TypedValue, right: &TypedValue) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (TypedValue::Integer(a), TypedValue::Integer(b)) => Some(a.cmp(b)),
        (TypedValue::Float(a), TypedValue::Float(b)) => a.partial_cmp(b),
        (TypedValue::Boolean(a), TypedValue::Boolean(b)) => Some(a.cmp(b)),
        (TypedValue::Text(a), TypedValue::Text(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledField {
    pub image: RowImage,
    pub column: String,
    pub kind: ValueKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompiledOperand {
    Literal(TypedValue),
    Field(CompiledField),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum CompiledNode {
    Compare {
        left: CompiledField,
        op: CompareOp,
        right: CompiledOperand,
    },
    And(Vec<CompiledNode>),
    Or(Vec<CompiledNode>),
    Not(Box<CompiledNode>),
    AnyColumnChanged {
        columns: Vec<(String, ValueKind)>,
    },
}

/// An immutable, schema-validated condition ready for write-time evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledCondition {
    table: String,
    root: CompiledNode,
}

impl CompiledCondition {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Evaluate against the OLD/NEW row images. Pure and side-effect free.
    /// A missing image (e.g. OLD on insert) reads as all-NULL.
    pub fn evaluate(&self, old_row: Option<&Row>, new_row: Option<&Row>) -> bool {
        evaluate_node(&self.root, old_row, new_row)
    }
}

fn compile_field(field: &FieldRef, schema: &TableSchema) -> PolicyResult<CompiledField> {
    let column = schema.column(&field.column).ok_or_else(|| {
        PolicyError::compile(
            &schema.name,
            None,
            &format!("condition references unknown column '{}'", field.column),
        )
    })?;
    Ok(CompiledField {
        image: field.image,
        column: field.column.clone(),
        kind: kind_of(column.data_type),
    })
}

fn compile_node(condition: &Condition, schema: &TableSchema) -> PolicyResult<CompiledNode> {
    match condition {
        Condition::Compare { left, op, right } => {
            let left_column = schema.column(&left.column).ok_or_else(|| {
                PolicyError::compile(
                    &schema.name,
                    None,
                    &format!("condition references unknown column '{}'", left.column),
                )
            })?;
            let left_field = CompiledField {
                image: left.image,
                column: left.column.clone(),
                kind: kind_of(left_column.data_type),
            };

            // Distinctness is defined for every type; equality and ordering
            // only for comparable ones
            let distinctness = matches!(
                op,
                CompareOp::IsDistinctFrom | CompareOp::IsNotDistinctFrom
            );
            if !distinctness && !left_column.data_type.is_comparable() {
                return Err(PolicyError::compile(
                    &schema.name,
                    None,
                    &format!(
                        "{} comparison on non-comparable column '{}'",
                        if op.is_ordering() { "ordering" } else { "equality" },
                        left.column
                    ),
                ));
            }

            let compiled_right = match right {
                Operand::Literal(raw) => {
                    let typed = parse_typed(raw, left_field.kind).ok_or_else(|| {
                        PolicyError::compile(
                            &schema.name,
                            None,
                            &format!(
                                "literal '{}' is not valid for column '{}'",
                                raw, left.column
                            ),
                        )
                    })?;
                    CompiledOperand::Literal(typed)
                }
                Operand::Field(field) => {
                    let right_field = compile_field(field, schema)?;
                    if right_field.kind != left_field.kind {
                        return Err(PolicyError::compile(
                            &schema.name,
                            None,
                            &format!(
                                "cannot compare columns '{}' and '{}' of different kinds",
                                left.column, field.column
                            ),
                        ));
                    }
                    CompiledOperand::Field(right_field)
                }
            };

            Ok(CompiledNode::Compare {
                left: left_field,
                op: *op,
                right: compiled_right,
            })
        }
        Condition::And(children) => {
            if children.is_empty() {
                return Err(PolicyError::compile(
                    &schema.name,
                    None,
                    "And requires at least one operand",
                ));
            }
            let compiled = children
                .iter()
                .map(|c| compile_node(c, schema))
                .collect::<PolicyResult<Vec<_>>>()?;
            Ok(CompiledNode::And(compiled))
        }
        Condition::Or(children) => {
            if children.is_empty() {
                return Err(PolicyError::compile(
                    &schema.name,
                    None,
                    "Or requires at least one operand",
                ));
            }
            let compiled = children
                .iter()
                .map(|c| compile_node(c, schema))
                .collect::<PolicyResult<Vec<_>>>()?;
            Ok(CompiledNode::Or(compiled))
        }
        Condition::Not(inner) => Ok(CompiledNode::Not(Box::new(compile_node(inner, schema)?))),
        Condition::AnyColumnChanged => {
            let columns = schema
                .columns
                .iter()
                .map(|c| (c.name.clone(), kind_of(c.data_type)))
                .collect();
            Ok(CompiledNode::AnyColumnChanged { columns })
        }
    }
}

fn resolve_field(
    field: &CompiledField,
    old_row: Option<&Row>,
    new_row: Option<&Row>,
) -> Option<TypedValue> {
    let row = match field.image {
        RowImage::Old => old_row,
        RowImage::New => new_row,
    }?;
    // Unparseable stored values read as NULL so evaluation stays total
    row.get(&field.column)
        .and_then(|raw| parse_typed(raw, field.kind))
}

fn evaluate_compare(
    left: Option<TypedValue>,
    op: CompareOp,
    right: Option<TypedValue>,
) -> bool {
    match op {
        CompareOp::IsDistinctFrom => match (&left, &right) {
            (None, None) => false,
            (Some(a), Some(b)) => a != b,
            _ => true,
        },
        CompareOp::IsNotDistinctFrom => {
            !evaluate_compare(left, CompareOp::IsDistinctFrom, right)
        }
        // Plain comparisons against a NULL operand are false
        _ => match (left, right) {
            (Some(a), Some(b)) => match op {
                CompareOp::Eq => a == b,
                CompareOp::NotEq => a != b,
                CompareOp::Lt => order_values(&a, &b) == Some(std::cmp::Ordering::Less),
                CompareOp::LtEq => matches!(
                    order_values(&a, &b),
                    Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
                ),
                CompareOp::Gt => order_values(&a, &b) == Some(std::cmp::Ordering::Greater),
                CompareOp::GtEq => matches!(
                    order_values(&a, &b),
                    Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
                ),
                CompareOp::IsDistinctFrom | CompareOp::IsNotDistinctFrom => unreachable!(),
            },
            _ => false,
        },
    }
}

fn evaluate_node(node: &CompiledNode, old_row: Option<&Row>, new_row: Option<&Row>) -> bool {
    match node {
        CompiledNode::Compare { left, op, right } => {
            let left_value = resolve_field(left, old_row, new_row);
            let right_value = match right {
                CompiledOperand::Literal(value) => Some(value.clone()),
                CompiledOperand::Field(field) => resolve_field(field, old_row, new_row),
            };
            evaluate_compare(left_value, *op, right_value)
        }
        CompiledNode::And(children) => children.iter().all(|c| evaluate_node(c, old_row, new_row)),
        CompiledNode::Or(children) => children.iter().any(|c| evaluate_node(c, old_row, new_row)),
        CompiledNode::Not(inner) => !evaluate_node(inner, old_row, new_row),
        CompiledNode::AnyColumnChanged { columns } => columns.iter().any(|(name, kind)| {
            let field = |image| CompiledField {
                image,
                column: name.clone(),
                kind: *kind,
            };
            let old_value = resolve_field(&field(RowImage::Old), old_row, new_row);
            let new_value = resolve_field(&field(RowImage::New), old_row, new_row);
            evaluate_compare(old_value, CompareOp::IsDistinctFrom, new_value)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TableSchema;

    fn schema() -> TableSchema {
        TableSchema::new("measurements")
            .add_column("id", DataType::Text, false)
            .add_column("reading", DataType::Integer, false)
            .add_column("note", DataType::Text, true)
    }

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_numeric_comparison_is_typed() {
        let cond = Condition::compare(new("reading"), CompareOp::Gt, Operand::lit("9"))
            .compile(&schema())
            .unwrap();
        // "10" > "9" lexically would be false; numerically it is true
        let new_row = row(&[("reading", "10")]);
        assert!(cond.evaluate(None, Some(&new_row)));
    }

    #[test]
    fn test_comparison_against_null_is_false() {
        let s = schema();
        let lt = Condition::compare(new("note"), CompareOp::Eq, Operand::lit("x"))
            .compile(&s)
            .unwrap();
        let new_row = row(&[("reading", "1")]); // note absent -> NULL
        assert!(!lt.evaluate(None, Some(&new_row)));

        let neq = Condition::compare(new("note"), CompareOp::NotEq, Operand::lit("x"))
            .compile(&s)
            .unwrap();
        assert!(!neq.evaluate(None, Some(&new_row)));
    }

    #[test]
    fn test_null_vs_null_is_not_distinct() {
        let cond = Condition::changed("note").compile(&schema()).unwrap();
        let old_row = row(&[("reading", "1")]);
        let new_row = row(&[("reading", "1")]);
        // NULL vs NULL counts as unchanged
        assert!(!cond.evaluate(Some(&old_row), Some(&new_row)));
    }

    #[test]
    fn test_null_vs_value_is_distinct() {
        let cond = Condition::changed("note").compile(&schema()).unwrap();
        let old_row = row(&[("reading", "1")]);
        let new_row = row(&[("reading", "1"), ("note", "hi")]);
        assert!(cond.evaluate(Some(&old_row), Some(&new_row)));
    }

    #[test]
    fn test_field_to_field_comparison() {
        let cond = Condition::compare(
            old("reading"),
            CompareOp::Lt,
            Operand::Field(new("reading")),
        )
        .compile(&schema())
        .unwrap();
        let old_row = row(&[("reading", "5")]);
        let new_row = row(&[("reading", "6")]);
        assert!(cond.evaluate(Some(&old_row), Some(&new_row)));
        assert!(!cond.evaluate(Some(&new_row), Some(&old_row)));
    }

    #[test]
    fn test_any_column_changed() {
        let cond = Condition::AnyColumnChanged.compile(&schema()).unwrap();
        let old_row = row(&[("id", "m1"), ("reading", "5")]);
        let same = old_row.clone();
        assert!(!cond.evaluate(Some(&old_row), Some(&same)));

        let changed = row(&[("id", "m1"), ("reading", "6")]);
        assert!(cond.evaluate(Some(&old_row), Some(&changed)));

        // NULL -> value transition counts as changed
        let with_note = row(&[("id", "m1"), ("reading", "5"), ("note", "n")]);
        assert!(cond.evaluate(Some(&old_row), Some(&with_note)));
    }

    #[test]
    fn test_missing_image_reads_as_null() {
        let cond = Condition::changed("reading").compile(&schema()).unwrap();
        let new_row = row(&[("reading", "1")]);
        // Insert: OLD image absent, so OLD.reading is NULL and distinct from 1
        assert!(cond.evaluate(None, Some(&new_row)));
    }

    #[test]
    fn test_compile_rejects_unknown_column() {
        let err = Condition::changed("missing").compile(&schema()).unwrap_err();
        assert_eq!(err.error_code(), "COMPILE_ERROR");
    }

    #[test]
    fn test_compile_rejects_bad_literal() {
        let err = Condition::compare(new("reading"), CompareOp::Eq, Operand::lit("abc"))
            .compile(&schema())
            .unwrap_err();
        assert_eq!(err.error_code(), "COMPILE_ERROR");
    }

    #[test]
    fn test_boolean_combinators() {
        let s = schema();
        let cond = Condition::all(vec![
            Condition::compare(new("reading"), CompareOp::GtEq, Operand::lit("0")),
            Condition::compare(new("reading"), CompareOp::Lt, Operand::lit("100")).negate(),
        ])
        .compile(&s)
        .unwrap();
        let high = row(&[("reading", "150")]);
        assert!(cond.evaluate(None, Some(&high)));
        let low = row(&[("reading", "50")]);
        assert!(!cond.evaluate(None, Some(&low)));
    }
}
