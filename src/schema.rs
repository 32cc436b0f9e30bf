/*
📌 Table Schema Management
✅ Table identity: name + typed column set
✅ Schema persistence in sled (__schemas__ tree)
✅ Row validation against column types and nullability
✅ Foundation for trigger compilation (field resolution)
*/

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use sled::Db;

use crate::error::{PolicyError, PolicyResult};
use crate::storage::Row;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub is_nullable: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataType {
    Integer,
    BigInteger,
    Text,
    VarChar(usize),
    Real,
    Double,
    Boolean,
    Timestamp,
    Date,
    UUID,
    JSON,
    Binary,
}

impl DataType {
    /// Types that support ordering comparisons and FSM governance
    pub fn is_comparable(&self) -> bool {
        !matches!(self, DataType::JSON | DataType::Binary)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, DataType::Integer | DataType::BigInteger)
    }
}

impl TableSchema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            created_at: chrono::Utc::now(),
            version: 1,
        }
    }

    pub fn add_column(mut self, name: &str, data_type: DataType, is_nullable: bool) -> Self {
        self.columns.push(Column {
            name: name.to_string(),
            data_type,
            is_nullable,
        });
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

pub struct SchemaManager {
    db: Arc<Db>,
    schemas: Mutex<HashMap<String, TableSchema>>,
}

impl SchemaManager {
    pub fn new(db: Arc<Db>) -> Self {
        let manager = Self {
            db,
            schemas: Mutex::new(HashMap::new()),
        };
        manager.load_schemas();
        manager
    }

    /// Load all schemas from the database
    fn load_schemas(&self) {
        if let Ok(schema_tree) = self.db.open_tree("__schemas__") {
            let mut schemas = self.schemas.lock().unwrap();
            for item in schema_tree.iter().flatten() {
                let (key, value) = item;
                let table_name = String::from_utf8_lossy(&key).to_string();
                if let Ok(schema) = serde_json::from_slice::<TableSchema>(&value) {
                    schemas.insert(table_name, schema);
                }
            }
        }
    }

    /// Create a new table schema (no-op if an identical schema exists)
    pub fn create_table(&self, mut schema: TableSchema) -> PolicyResult<()> {
        self.validate_schema(&schema)?;

        {
            let schemas = self.schemas.lock().unwrap();
            if let Some(existing) = schemas.get(&schema.name) {
                if existing.columns == schema.columns {
                    return Ok(());
                }
                return Err(PolicyError::schema(
                    Some(&schema.name),
                    "table already exists with a different column set",
                ));
            }
        }

        schema.created_at = chrono::Utc::now();
        schema.version = 1;

        let schema_tree = self.db.open_tree("__schemas__")?;
        let serialized = serde_json::to_vec(&schema)?;
        schema_tree.insert(schema.name.as_bytes(), serialized)?;

        // Touch the table tree so it exists in the live schema
        let table_tree = self.db.open_tree(schema.name.as_bytes())?;
        table_tree.flush()?;

        let mut schemas = self.schemas.lock().unwrap();
        schemas.insert(schema.name.clone(), schema.clone());

        log::info!("schema created for table '{}'", schema.name);
        Ok(())
    }

    fn validate_schema(&self, schema: &TableSchema) -> PolicyResult<()> {
        if schema.name.is_empty() {
            return Err(PolicyError::schema(None, "table name cannot be empty"));
        }
        if schema.columns.is_empty() {
            return Err(PolicyError::schema(
                Some(&schema.name),
                "table must have at least one column",
            ));
        }

        let mut column_names = std::collections::HashSet::new();
        for column in &schema.columns {
            if !column_names.insert(column.name.clone()) {
                return Err(PolicyError::schema(
                    Some(&schema.name),
                    &format!("duplicate column name: {}", column.name),
                ));
            }
        }
        Ok(())
    }

    /// Validate a full row image against the table schema
    pub fn validate_row(&self, table: &str, row: &Row) -> PolicyResult<()> {
        let schema = self
            .get_schema(table)
            .ok_or_else(|| PolicyError::schema(Some(table), "schema not found"))?;

        for column in &schema.columns {
            match row.get(&column.name) {
                // Absent key represents SQL NULL
                None => {
                    if !column.is_nullable {
                        return Err(PolicyError::schema(
                            Some(table),
                            &format!("column '{}' cannot be NULL", column.name),
                        ));
                    }
                }
                Some(value) => {
                    self.validate_data_type(table, &column.name, column.data_type, value)?;
                }
            }
        }

        for key in row.keys() {
            if !schema.has_column(key) {
                return Err(PolicyError::schema(
                    Some(table),
                    &format!("unknown column '{}'", key),
                ));
            }
        }

        Ok(())
    }

    fn validate_data_type(
        &self,
        table: &str,
        column: &str,
        data_type: DataType,
        value: &str,
    ) -> PolicyResult<()> {
        let type_error = |detail: String| PolicyError::schema(Some(table), &format!("column '{}': {}", column, detail));

        match data_type {
            DataType::Integer | DataType::BigInteger => {
                value
                    .parse::<i64>()
                    .map_err(|_| type_error(format!("'{}' is not a valid integer", value)))?;
            }
            DataType::Real | DataType::Double => {
                value
                    .parse::<f64>()
                    .map_err(|_| type_error(format!("'{}' is not a valid number", value)))?;
            }
            DataType::Boolean => {
                let lower = value.to_lowercase();
                if !["true", "false", "1", "0"].contains(&lower.as_str()) {
                    return Err(type_error(format!("'{}' is not a valid boolean", value)));
                }
            }
            DataType::VarChar(max_len) => {
                if value.len() > max_len {
                    return Err(type_error(format!(
                        "text too long: {} > {} characters",
                        value.len(),
                        max_len
                    )));
                }
            }
            DataType::UUID => {
                uuid::Uuid::parse_str(value)
                    .map_err(|_| type_error(format!("'{}' is not a valid UUID", value)))?;
            }
            DataType::JSON => {
                serde_json::from_str::<serde_json::Value>(value)
                    .map_err(|_| type_error(format!("'{}' is not valid JSON", value)))?;
            }
            DataType::Text | DataType::Timestamp | DataType::Date | DataType::Binary => {}
        }
        Ok(())
    }

    pub fn get_schema(&self, table_name: &str) -> Option<TableSchema> {
        self.schemas.lock().unwrap().get(table_name).cloned()
    }

    pub fn has_table(&self, table_name: &str) -> bool {
        self.schemas.lock().unwrap().contains_key(table_name)
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.schemas.lock().unwrap().keys().cloned().collect();
        tables.sort();
        tables
    }

    pub fn drop_table(&self, table_name: &str) -> PolicyResult<()> {
        if let Ok(schema_tree) = self.db.open_tree("__schemas__") {
            schema_tree.remove(table_name.as_bytes())?;
        }
        let table_tree = self.db.open_tree(table_name.as_bytes())?;
        table_tree.clear()?;

        self.schemas.lock().unwrap().remove(table_name);
        log::info!("table '{}' dropped", table_name);
        Ok(())
    }
}
