/*
📌 Structured Error Handling for the Policy Engine
🚨 Unified error types for compile-time and write-time failures
✅ Compile errors surface at build/install time, never at write time
✅ Policy violations abort the guarded write with table + policy context
✅ Drift and history-write failures carry enough detail for diagnosis
*/

use std::fmt;
use serde::{Deserialize, Serialize};

/// Comprehensive error type for policy compilation, installation and
/// guarded write execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PolicyError {
    // Declarative spec could not be compiled (unresolved field, duplicate
    // policy name, conflicting primitives, bad literal)
    Compile {
        table: String,
        policy: Option<String>,
        message: String,
    },

    // A Deny action fired (or an FSM transition was not in the edge set)
    Violation {
        table: String,
        policy: String,
        operation: String,
        message: String,
    },

    // Installed trigger definition no longer matches the compiled one
    Drift {
        table: String,
        trigger: String,
        message: String,
    },

    // Failure while inserting a history row
    HistoryWrite {
        table: String,
        event_table: String,
        message: String,
    },

    // Release of a suppression entry that was never acquired
    SuppressionMisuse {
        session: String,
        table: String,
        policy: String,
    },

    // Underlying store faults
    Storage {
        operation: String,
        message: String,
    },

    // Schema-level errors (missing table, invalid column value)
    Schema {
        table: Option<String>,
        message: String,
    },
}

impl PolicyError {
    /// Create a compile error
    pub fn compile(table: &str, policy: Option<&str>, message: &str) -> Self {
        Self::Compile {
            table: table.to_string(),
            policy: policy.map(|s| s.to_string()),
            message: message.to_string(),
        }
    }

    /// Create a policy violation error
    pub fn violation(table: &str, policy: &str, operation: &str, message: &str) -> Self {
        Self::Violation {
            table: table.to_string(),
            policy: policy.to_string(),
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a drift error
    pub fn drift(table: &str, trigger: &str, message: &str) -> Self {
        Self::Drift {
            table: table.to_string(),
            trigger: trigger.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a history write error
    pub fn history_write(table: &str, event_table: &str, message: &str) -> Self {
        Self::HistoryWrite {
            table: table.to_string(),
            event_table: event_table.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a suppression misuse error
    pub fn suppression_misuse(session: &str, table: &str, policy: &str) -> Self {
        Self::SuppressionMisuse {
            session: session.to_string(),
            table: table.to_string(),
            policy: policy.to_string(),
        }
    }

    /// Create a storage error
    pub fn storage(operation: &str, message: &str) -> Self {
        Self::Storage {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a schema error
    pub fn schema(table: Option<&str>, message: &str) -> Self {
        Self::Schema {
            table: table.map(|s| s.to_string()),
            message: message.to_string(),
        }
    }

    /// Get error code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Compile { .. } => "COMPILE_ERROR",
            Self::Violation { .. } => "POLICY_VIOLATION",
            Self::Drift { .. } => "DRIFT_ERROR",
            Self::HistoryWrite { .. } => "HISTORY_WRITE_ERROR",
            Self::SuppressionMisuse { .. } => "SUPPRESSION_MISUSE",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Schema { .. } => "SCHEMA_ERROR",
        }
    }

    /// True for errors that can only occur at build/install time
    pub fn is_compile_time(&self) -> bool {
        matches!(self, Self::Compile { .. } | Self::Drift { .. })
    }

    /// True for errors that abort a guarded write
    pub fn aborts_write(&self) -> bool {
        matches!(
            self,
            Self::Violation { .. } | Self::HistoryWrite { .. } | Self::Storage { .. } | Self::Schema { .. }
        )
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::Compile { table, policy, message } => {
                format!(
                    "Policy compilation failed for table '{}': {}{}",
                    table,
                    message,
                    policy.as_ref().map(|p| format!(" (Policy: {})", p)).unwrap_or_default()
                )
            }
            Self::Violation { table, policy, operation, message } => {
                format!(
                    "Policy '{}' blocked {} on table '{}': {}",
                    policy, operation, table, message
                )
            }
            Self::Drift { table, trigger, message } => {
                format!(
                    "Installed trigger '{}' on table '{}' has drifted: {}",
                    trigger, table, message
                )
            }
            Self::HistoryWrite { table, event_table, message } => {
                format!(
                    "History write into '{}' failed for table '{}': {}",
                    event_table, table, message
                )
            }
            Self::SuppressionMisuse { session, table, policy } => {
                format!(
                    "Suppression released without matching acquire: ({}, {}) in session {}",
                    table, policy, session
                )
            }
            Self::Storage { operation, message } => {
                format!("Storage operation '{}' failed: {}", operation, message)
            }
            Self::Schema { table, message } => {
                format!(
                    "Schema error: {}{}",
                    message,
                    table.as_ref().map(|t| format!(" (Table: {})", t)).unwrap_or_default()
                )
            }
        }
    }
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_code(), self.user_message())
    }
}

impl std::error::Error for PolicyError {}

/// Result type alias for policy operations
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Convert from sled::Error to PolicyError
impl From<sled::Error> for PolicyError {
    fn from(err: sled::Error) -> Self {
        PolicyError::storage("sled_operation", &err.to_string())
    }
}

/// Convert from serde_json::Error to PolicyError
impl From<serde_json::Error> for PolicyError {
    fn from(err: serde_json::Error) -> Self {
        PolicyError::storage("json_serialization", &err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PolicyError::violation("orders", "protect_deletes", "DELETE", "operation denied");
        assert_eq!(err.error_code(), "POLICY_VIOLATION");
        assert!(err.aborts_write());
        assert!(!err.is_compile_time());
    }

    #[test]
    fn test_compile_error_message() {
        let err = PolicyError::compile("orders", Some("fsm_status"), "column 'status' not found");
        let message = err.user_message();
        assert!(message.contains("orders"));
        assert!(message.contains("Policy: fsm_status"));
        assert!(err.is_compile_time());
    }

    #[test]
    fn test_suppression_misuse_display() {
        let err = PolicyError::suppression_misuse("session-1", "orders", "protect_deletes");
        assert_eq!(err.error_code(), "SUPPRESSION_MISUSE");
        assert!(err.to_string().contains("without matching acquire"));
    }
}
