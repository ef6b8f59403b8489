//! Error types for field dependency operations.
//!
//! Errors fall into two groups:
//!
//! - **`Error`**: returned to the caller and fatal to the operation in progress
//!   (a rejected formula edit, an unresolvable reference, a storage failure).
//! - **`FieldFailure`**: a per-field failure collected during a formula
//!   migration run. The run continues with the remaining fields.

use crate::domain::{FieldId, TableId};
use std::fmt;
use std::io;
use thiserror::Error;

/// The error type for field dependency operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Following dependency edges from a field leads back onto the path.
    #[error("circular field dependency detected for field {field_id}: {}", format_path(.path))]
    CircularFieldDependency {
        /// The field whose edit or traversal hit the cycle
        field_id: FieldId,
        /// The cycle, first and last element equal
        path: Vec<FieldId>,
    },

    /// An expression names a field that cannot be resolved in scope.
    #[error("unknown field reference '{name}' in table {table_id}")]
    UnknownFieldReference {
        /// Table the reference was resolved from
        table_id: TableId,
        /// The unresolved name
        name: String,
    },

    /// Expression nesting exceeded the configured limit.
    #[error("formula too large: nesting depth {depth} exceeds limit of {limit}")]
    MaximumFormulaSize {
        /// Depth reached
        depth: usize,
        /// Configured limit
        limit: usize,
    },

    /// Field not found.
    #[error("Field not found: {0}")]
    FieldNotFound(FieldId),

    /// Table not found.
    #[error("Table not found: {0}")]
    TableNotFound(TableId),

    /// Another non-trashed field in the table already has this name.
    #[error("a field named '{name}' already exists in table {table_id}")]
    FieldNameTaken {
        /// Table
        table_id: TableId,
        /// Conflicting name
        name: String,
    },

    /// An edge violates the edge store invariants.
    #[error("invalid dependency edge: {0}")]
    InvalidEdge(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(String),
}

fn format_path(path: &[FieldId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl Error {
    /// Returns `true` for errors caused by the content of a field definition
    /// (cycles, unresolvable names, oversized formulas) rather than by the
    /// engine or its storage.
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::CircularFieldDependency { .. }
                | Self::UnknownFieldReference { .. }
                | Self::MaximumFormulaSize { .. }
                | Self::FieldNameTaken { .. }
        )
    }
}

/// A specialized Result type for field dependency operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Phase of a formula migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationPhase {
    /// Dependency edges rebuilt from the expression
    Dependencies,
    /// Type/attribute metadata recomputed
    Attributes,
    /// Stored cell values recomputed
    CellValues,
    /// Backing column dropped and recreated
    ColumnRecreation,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dependencies => write!(f, "dependency rebuild"),
            Self::Attributes => write!(f, "attribute recalculation"),
            Self::CellValues => write!(f, "cell value recalculation"),
            Self::ColumnRecreation => write!(f, "column recreation"),
        }
    }
}

/// Failure of one field in one migration phase.
///
/// Collected in the migration report; the field keeps its pending flag and
/// is skipped by the remaining phases of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFailure {
    /// The field that failed
    pub field_id: FieldId,
    /// Phase in which it failed
    pub phase: MigrationPhase,
    /// Human-readable error message
    pub message: String,
}

impl fmt::Display for FieldFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field {}: {} failed: {}",
            self.field_id, self.phase, self.message
        )
    }
}

impl std::error::Error for FieldFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circular_error_message_lists_path() {
        let err = Error::CircularFieldDependency {
            field_id: FieldId(1),
            path: vec![FieldId(1), FieldId(2), FieldId(1)],
        };
        assert_eq!(
            err.to_string(),
            "circular field dependency detected for field 1: 1 -> 2 -> 1"
        );
        assert!(err.is_validation_error());
    }

    #[test]
    fn test_storage_errors_are_not_validation_errors() {
        assert!(!Error::Storage("boom".into()).is_validation_error());
        assert!(!Error::FieldNotFound(FieldId(3)).is_validation_error());
    }
}
