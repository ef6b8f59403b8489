//! Domain types for the field dependency graph.
//!
//! Tables group fields, fields own their outgoing dependency edges, and every
//! edge points from a **dependant** field to the field it depends on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldId(pub u64);

impl FieldId {
    /// Create a new field ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw integer value of this ID
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for FieldId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Unique identifier for a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(pub u64);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TableId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Unique identifier for a workspace. Edges never cross workspace boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(pub u64);

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for WorkspaceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A table holding fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Unique identifier
    pub id: TableId,

    /// Workspace the table belongs to
    pub workspace_id: WorkspaceId,

    /// Display name
    pub name: String,

    /// The table's primary field. Set when the first field is created.
    pub primary_field_id: Option<FieldId>,
}

/// Data for creating a new table
#[derive(Debug, Clone)]
pub struct NewTable {
    /// Workspace the table belongs to
    pub workspace_id: WorkspaceId,

    /// Display name
    pub name: String,
}

/// Column type of a field, including its defining expression where it has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    /// Plain text
    Text,

    /// Numeric value
    Number,

    /// True/false value
    Boolean,

    /// Date or date-time value
    Date,

    /// Links rows of this table to rows of another table
    LinkRow {
        /// The table on the other side of the relation
        linked_table_id: TableId,
    },

    /// Computed from an expression referencing other fields
    Formula {
        /// Expression text, e.g. `field('price') + field('tax')`
        expression: String,
    },

    /// Pulls the values of a field in a linked table through a link-row field
    Lookup {
        /// Name of the link-row field in this field's table
        through_field_name: String,

        /// Name of the field looked up in the linked table
        target_field_name: String,
    },
}

impl FieldKind {
    /// Short type tag, as used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "date",
            FieldKind::LinkRow { .. } => "link_row",
            FieldKind::Formula { .. } => "formula",
            FieldKind::Lookup { .. } => "lookup",
        }
    }

    /// Whether this kind is versioned by the formula language
    pub fn is_formula_type(&self) -> bool {
        matches!(self, FieldKind::Formula { .. } | FieldKind::Lookup { .. })
    }
}

/// A column definition belonging to a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Unique identifier
    pub id: FieldId,

    /// Table the field belongs to
    pub table_id: TableId,

    /// Display name, unique among the table's non-trashed fields
    pub name: String,

    /// Type and definition
    pub kind: FieldKind,

    /// Soft-deleted flag. Trashed fields keep their edges until purged.
    #[serde(default)]
    pub trashed: bool,

    /// When the field was trashed
    #[serde(default)]
    pub trashed_at: Option<DateTime<Utc>>,

    /// Formula language version the field's stored state is consistent with.
    /// `None` for non-formula kinds.
    #[serde(default)]
    pub formula_version: Option<u32>,
}

impl Field {
    /// Formula expression text, if this is a formula field
    pub fn expression(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Formula { expression } => Some(expression),
            _ => None,
        }
    }
}

/// Data for creating a new field
#[derive(Debug, Clone)]
pub struct NewField {
    /// Table the field belongs to
    pub table_id: TableId,

    /// Display name
    pub name: String,

    /// Type and definition
    pub kind: FieldKind,
}

impl NewField {
    /// Convenience constructor
    pub fn new(table_id: TableId, name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            table_id,
            name: name.into(),
            kind,
        }
    }
}

/// Directed edge from a dependant field to the field it depends on.
///
/// Exactly one of `dependency` and `broken_reference_field_name` is expected
/// to be set. A broken edge keeps the referenced name so that a later rename
/// or restore can resolve it again.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldDependency {
    /// The field whose value depends on another
    pub dependant: FieldId,

    /// The field depended upon, `None` if the reference is broken
    pub dependency: Option<FieldId>,

    /// Link-row field through which the dependency is resolved across tables
    #[serde(default)]
    pub via: Option<FieldId>,

    /// Name that could not be resolved
    #[serde(default)]
    pub broken_reference_field_name: Option<String>,
}

impl FieldDependency {
    /// Edge to a concrete field in the same table
    pub fn direct(dependant: FieldId, dependency: FieldId) -> Self {
        Self {
            dependant,
            dependency: Some(dependency),
            via: None,
            broken_reference_field_name: None,
        }
    }

    /// Edge to a concrete field reached through a link-row field
    pub fn via(dependant: FieldId, dependency: FieldId, via: FieldId) -> Self {
        Self {
            dependant,
            dependency: Some(dependency),
            via: Some(via),
            broken_reference_field_name: None,
        }
    }

    /// Edge recording a reference that could not be resolved
    pub fn broken(dependant: FieldId, name: impl Into<String>, via: Option<FieldId>) -> Self {
        Self {
            dependant,
            dependency: None,
            via,
            broken_reference_field_name: Some(name.into()),
        }
    }

    /// True when the dependency target could not be resolved
    pub fn is_broken(&self) -> bool {
        self.dependency.is_none()
    }
}

impl fmt::Display for FieldDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.dependency, &self.broken_reference_field_name) {
            (Some(dep), _) => write!(f, "{} -> {}", self.dependant, dep)?,
            (None, Some(name)) => write!(f, "{} -> <broken '{}'>", self.dependant, name)?,
            (None, None) => write!(f, "{} -> <dangling>", self.dependant)?,
        }
        if let Some(via) = self.via {
            write!(f, " via {}", via)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_kind_serializes_with_type_tag() {
        let kind = FieldKind::Formula {
            expression: "field('a')".to_string(),
        };
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, r#"{"type":"formula","expression":"field('a')"}"#);

        let back: FieldKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn test_dependency_display() {
        let edge = FieldDependency::via(FieldId(1), FieldId(2), FieldId(3));
        assert_eq!(edge.to_string(), "1 -> 2 via 3");

        let broken = FieldDependency::broken(FieldId(1), "price", None);
        assert!(broken.is_broken());
        assert_eq!(broken.to_string(), "1 -> <broken 'price'>");
    }

    #[test]
    fn test_formula_types() {
        assert!(FieldKind::Formula {
            expression: String::new()
        }
        .is_formula_type());
        assert!(FieldKind::Lookup {
            through_field_name: "l".into(),
            target_field_name: "t".into()
        }
        .is_formula_type());
        assert!(!FieldKind::LinkRow {
            linked_table_id: TableId(1)
        }
        .is_formula_type());
    }
}
