//! Storage abstraction layer for the field dependency engine.
//!
//! This module provides the core store trait and a factory for creating
//! store backends:
//!
//! - **In-memory**: the engine state held in RAM
//! - **JSONL**: the in-memory engine persisted to a JSON Lines file
//!
//! # Architecture
//!
//! The store is an async, object-safe trait so callers can work with
//! `Box<dyn FieldDependencyStore>` regardless of the backend. Writes take
//! `&mut self`, reads take `&self`.
//!
//! # Example
//!
//! ```no_run
//! use fieldgraph::config::EngineConfig;
//! use fieldgraph::domain::{FieldKind, NewField, NewTable, WorkspaceId};
//! use fieldgraph::storage::{create_store, StorageBackend};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let mut store = create_store(StorageBackend::InMemory, EngineConfig::default()).await?;
//!
//!     let table = store
//!         .create_table(NewTable {
//!             workspace_id: WorkspaceId(1),
//!             name: "Orders".to_string(),
//!         })
//!         .await?;
//!     store
//!         .create_field(NewField::new(table.id, "price", FieldKind::Number))
//!         .await?;
//!     let total = store
//!         .create_field(NewField::new(
//!             table.id,
//!             "total",
//!             FieldKind::Formula {
//!                 expression: "field('price') * 2".to_string(),
//!             },
//!         ))
//!         .await?;
//!
//!     let deps = store.get_all_field_dependencies(total.id).await?;
//!     println!("total depends on {deps:?}");
//!     Ok(())
//! }
//! ```

use crate::config::EngineConfig;
use crate::domain::{Field, FieldDependency, FieldId, FieldKind, NewField, NewTable, Table, TableId};
use crate::error::{FieldFailure, Result};
use crate::events::DependencyEvent;
use crate::export::DependencyGraphExport;
use crate::migrations::{FieldRecalculator, FormulaMigrations, MigrationReport, PendingWork};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

pub mod in_memory;

pub use in_memory::{ClosureEntry, DependencyClosure};

/// Fields rebuilt as a side effect of a rename, trash, restore or delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealReport {
    /// Fields rebuilt successfully (for heals: no longer broken)
    pub healed: Vec<FieldId>,
    /// Fields whose rebuild failed; their previous edges are kept
    pub failed: Vec<FieldFailure>,
}

impl HealReport {
    /// Append another report
    pub fn extend(&mut self, other: HealReport) {
        self.healed.extend(other.healed);
        self.failed.extend(other.failed);
    }
}

/// A reference resolved to a concrete field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedReference {
    /// The referenced field
    pub field_id: FieldId,
    /// Link-row field the reference goes through, for lookups
    pub via: Option<FieldId>,
}

/// Every record held by a store, as persisted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Tables ordered by ID
    pub tables: Vec<Table>,
    /// Fields ordered by ID, trashed included
    pub fields: Vec<Field>,
    /// Edges ordered by dependant
    pub dependencies: Vec<FieldDependency>,
}

/// Core store trait for the field dependency graph.
///
/// # Method Categories
///
/// - **Tables and fields**: `create_table`, `get_table`, `create_field`,
///   `get_field`, `fields_in_table`, `update_field_kind`, `rename_field`,
///   `trash_field`, `restore_field`, `delete_field`
/// - **Edge store**: `get_edges_for`, `replace_edges`, `remove_all_edges_for`,
///   `get_dependants`
/// - **Cycle detection**: `get_all_field_dependencies`, `dependency_closure`,
///   `will_cause_circular_dep`
/// - **Rebuilding**: `rebuild_dependencies`, `resolve_expression`
/// - **Migrations**: `run_formula_migrations`, `pending_work`
/// - **Diagnostics**: `export_graph`, `snapshot`, `subscribe`
/// - **Persistence**: `save`, `reload`
///
/// # Consistency
///
/// Every write is applied as a whole or not at all. Reads observe one
/// consistent state of the graph for their whole traversal.
#[async_trait]
pub trait FieldDependencyStore: Send + Sync {
    // ========== Tables and Fields ==========

    /// Create a table in a workspace.
    async fn create_table(&mut self, table: NewTable) -> Result<Table>;

    /// Get a table by ID.
    async fn get_table(&self, table_id: TableId) -> Result<Option<Table>>;

    /// Create a field and build its dependencies.
    ///
    /// The first field of a table becomes its primary field. Broken
    /// references elsewhere naming the new field are healed.
    ///
    /// # Errors
    ///
    /// - `Error::TableNotFound` if the table (or a linked table) doesn't exist
    /// - `Error::FieldNameTaken` if the name is in use
    /// - `Error::UnknownFieldReference` if a link-row field points outside
    ///   the workspace
    /// - `Error::CircularFieldDependency` if the definition closes a loop;
    ///   nothing is created
    async fn create_field(&mut self, field: NewField) -> Result<Field>;

    /// Get a field by ID, trashed or not.
    async fn get_field(&self, field_id: FieldId) -> Result<Option<Field>>;

    /// Fields of a table ordered by ID, trashed included.
    async fn fields_in_table(&self, table_id: TableId) -> Result<Vec<Field>>;

    /// Replace a field's definition and rebuild its dependencies.
    ///
    /// # Errors
    ///
    /// On `Error::CircularFieldDependency` (or any other rebuild error) the
    /// previous definition and edges are kept.
    async fn update_field_kind(&mut self, field_id: FieldId, kind: FieldKind) -> Result<Field>;

    /// Rename a field, rewriting every expression that refers to it.
    ///
    /// Broken references naming the new name are healed.
    async fn rename_field(&mut self, field_id: FieldId, new_name: &str) -> Result<HealReport>;

    /// Move a field to the trash. References to it become broken.
    async fn trash_field(&mut self, field_id: FieldId) -> Result<HealReport>;

    /// Restore a trashed field and heal references naming it.
    ///
    /// # Errors
    ///
    /// - `Error::FieldNameTaken` if another field took the name meanwhile
    /// - `Error::CircularFieldDependency` if the field's own definition would
    ///   now close a loop; the field stays trashed
    async fn restore_field(&mut self, field_id: FieldId) -> Result<HealReport>;

    /// Permanently delete a field and its outgoing edges.
    async fn delete_field(&mut self, field_id: FieldId) -> Result<HealReport>;

    // ========== Edge Store ==========

    /// Direct outgoing edges of a field, trashed or not.
    async fn get_edges_for(&self, field_id: FieldId) -> Result<Vec<FieldDependency>>;

    /// Atomically replace every outgoing edge of a field.
    ///
    /// # Errors
    ///
    /// - `Error::UnknownFieldReference` if an edge targets a field outside the
    ///   allowed scope
    /// - `Error::InvalidEdge` if an edge belongs to another field or has
    ///   neither a dependency nor a broken reference name
    /// - `Error::CircularFieldDependency` if the edges would close a loop
    async fn replace_edges(&mut self, field_id: FieldId, edges: Vec<FieldDependency>)
    -> Result<()>;

    /// Remove every outgoing edge of a field.
    async fn remove_all_edges_for(&mut self, field_id: FieldId) -> Result<()>;

    /// Fields with an edge to `field_id` as dependency or via, ordered by ID.
    async fn get_dependants(&self, field_id: FieldId) -> Result<Vec<FieldId>>;

    // ========== Cycle Detection ==========

    /// Every field reachable from `field_id` within the reference depth bound.
    ///
    /// Fields beyond the bound are left out without an error.
    ///
    /// # Errors
    ///
    /// Returns `Error::CircularFieldDependency` if any traversal path revisits
    /// a field already on it. No partial result is returned.
    async fn get_all_field_dependencies(&self, field_id: FieldId) -> Result<BTreeSet<FieldId>>;

    /// Like `get_all_field_dependencies`, with the deepest level each field
    /// was observed at, ordered by descending depth then ascending ID.
    async fn dependency_closure(&self, field_id: FieldId) -> Result<DependencyClosure>;

    /// True if `from` is among the dependencies of `to`, so making `from`
    /// depend on `to` would close a loop.
    async fn will_cause_circular_dep(&self, from: FieldId, to: FieldId) -> Result<bool>;

    // ========== Rebuilding ==========

    /// Recompute a field's edges from its definition and replace them.
    ///
    /// Unresolvable names become broken edges.
    ///
    /// # Errors
    ///
    /// Returns `Error::CircularFieldDependency` if a new edge would close a
    /// loop; the previous edges are kept.
    async fn rebuild_dependencies(&mut self, field_id: FieldId) -> Result<Vec<FieldDependency>>;

    /// Resolve the references of an expression evaluated in `table_id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownFieldReference` for the first name that does
    /// not resolve.
    async fn resolve_expression(
        &self,
        table_id: TableId,
        expression: &str,
    ) -> Result<Vec<ResolvedReference>>;

    // ========== Formula Migrations ==========

    /// Bring every formula field up to `migrations.current_version()`.
    ///
    /// Per-field failures are collected in the report, not returned.
    async fn run_formula_migrations(
        &mut self,
        migrations: &FormulaMigrations,
        recalculator: &dyn FieldRecalculator,
    ) -> Result<MigrationReport>;

    /// Flags left on a field by an unfinished migration run.
    async fn pending_work(&self, field_id: FieldId) -> Result<Option<PendingWork>>;

    // ========== Diagnostics ==========

    /// Export every field and edge.
    async fn export_graph(&self) -> Result<DependencyGraphExport>;

    /// Every table, field and edge.
    async fn snapshot(&self) -> Result<StoreSnapshot>;

    /// Receive dependency change events.
    ///
    /// A receiver belongs to the engine state it was obtained from; after
    /// `reload` a new receiver is needed.
    async fn subscribe(&self) -> broadcast::Receiver<DependencyEvent>;

    // ========== Persistence ==========

    /// Save changes to persistent storage.
    ///
    /// For in-memory storage this is a no-op.
    async fn save(&self) -> Result<()>;

    /// Reload state from persistent storage, discarding unsaved changes.
    ///
    /// For in-memory storage this is a no-op.
    async fn reload(&mut self) -> Result<()>;
}

/// Storage backend configuration.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    /// In-memory storage (ephemeral)
    InMemory,

    /// JSONL file storage (persistent)
    Jsonl(PathBuf),
}

impl StorageBackend {
    /// Returns the data file path for file-based backends.
    pub fn data_path(&self) -> Option<&Path> {
        match self {
            StorageBackend::Jsonl(path) => Some(path),
            StorageBackend::InMemory => None,
        }
    }
}

/// Wrapper that adds JSONL file persistence to the in-memory engine.
struct JsonlBackedStore {
    inner: Box<dyn FieldDependencyStore>,
    path: PathBuf,
    config: EngineConfig,
}

impl JsonlBackedStore {
    async fn load_or_empty(
        path: &Path,
        config: &EngineConfig,
    ) -> Result<Box<dyn FieldDependencyStore>> {
        if !path.exists() {
            return in_memory::new_in_memory_store(config.clone());
        }
        let (store, warnings) = in_memory::load_from_jsonl(path, config.clone()).await?;
        for warning in &warnings {
            tracing::warn!(warning = %warning, path = %path.display(), "JSONL load warning");
        }
        Ok(store)
    }
}

#[async_trait]
impl FieldDependencyStore for JsonlBackedStore {
    async fn create_table(&mut self, table: NewTable) -> Result<Table> {
        self.inner.create_table(table).await
    }

    async fn get_table(&self, table_id: TableId) -> Result<Option<Table>> {
        self.inner.get_table(table_id).await
    }

    async fn create_field(&mut self, field: NewField) -> Result<Field> {
        self.inner.create_field(field).await
    }

    async fn get_field(&self, field_id: FieldId) -> Result<Option<Field>> {
        self.inner.get_field(field_id).await
    }

    async fn fields_in_table(&self, table_id: TableId) -> Result<Vec<Field>> {
        self.inner.fields_in_table(table_id).await
    }

    async fn update_field_kind(&mut self, field_id: FieldId, kind: FieldKind) -> Result<Field> {
        self.inner.update_field_kind(field_id, kind).await
    }

    async fn rename_field(&mut self, field_id: FieldId, new_name: &str) -> Result<HealReport> {
        self.inner.rename_field(field_id, new_name).await
    }

    async fn trash_field(&mut self, field_id: FieldId) -> Result<HealReport> {
        self.inner.trash_field(field_id).await
    }

    async fn restore_field(&mut self, field_id: FieldId) -> Result<HealReport> {
        self.inner.restore_field(field_id).await
    }

    async fn delete_field(&mut self, field_id: FieldId) -> Result<HealReport> {
        self.inner.delete_field(field_id).await
    }

    async fn get_edges_for(&self, field_id: FieldId) -> Result<Vec<FieldDependency>> {
        self.inner.get_edges_for(field_id).await
    }

    async fn replace_edges(
        &mut self,
        field_id: FieldId,
        edges: Vec<FieldDependency>,
    ) -> Result<()> {
        self.inner.replace_edges(field_id, edges).await
    }

    async fn remove_all_edges_for(&mut self, field_id: FieldId) -> Result<()> {
        self.inner.remove_all_edges_for(field_id).await
    }

    async fn get_dependants(&self, field_id: FieldId) -> Result<Vec<FieldId>> {
        self.inner.get_dependants(field_id).await
    }

    async fn get_all_field_dependencies(&self, field_id: FieldId) -> Result<BTreeSet<FieldId>> {
        self.inner.get_all_field_dependencies(field_id).await
    }

    async fn dependency_closure(&self, field_id: FieldId) -> Result<DependencyClosure> {
        self.inner.dependency_closure(field_id).await
    }

    async fn will_cause_circular_dep(&self, from: FieldId, to: FieldId) -> Result<bool> {
        self.inner.will_cause_circular_dep(from, to).await
    }

    async fn rebuild_dependencies(&mut self, field_id: FieldId) -> Result<Vec<FieldDependency>> {
        self.inner.rebuild_dependencies(field_id).await
    }

    async fn resolve_expression(
        &self,
        table_id: TableId,
        expression: &str,
    ) -> Result<Vec<ResolvedReference>> {
        self.inner.resolve_expression(table_id, expression).await
    }

    async fn run_formula_migrations(
        &mut self,
        migrations: &FormulaMigrations,
        recalculator: &dyn FieldRecalculator,
    ) -> Result<MigrationReport> {
        self.inner
            .run_formula_migrations(migrations, recalculator)
            .await
    }

    async fn pending_work(&self, field_id: FieldId) -> Result<Option<PendingWork>> {
        self.inner.pending_work(field_id).await
    }

    async fn export_graph(&self) -> Result<DependencyGraphExport> {
        self.inner.export_graph().await
    }

    async fn snapshot(&self) -> Result<StoreSnapshot> {
        self.inner.snapshot().await
    }

    async fn subscribe(&self) -> broadcast::Receiver<DependencyEvent> {
        self.inner.subscribe().await
    }

    async fn save(&self) -> Result<()> {
        in_memory::save_to_jsonl(self.inner.as_ref(), &self.path).await
    }

    async fn reload(&mut self) -> Result<()> {
        self.inner = Self::load_or_empty(&self.path, &self.config).await?;
        Ok(())
    }
}

/// Create a store for the given backend.
///
/// # Errors
///
/// - `Error::Config` if `config` fails validation
/// - `Error::Io` if the JSONL file cannot be read
pub async fn create_store(
    backend: StorageBackend,
    config: EngineConfig,
) -> Result<Box<dyn FieldDependencyStore>> {
    config.validate()?;
    match backend {
        StorageBackend::InMemory => in_memory::new_in_memory_store(config),
        StorageBackend::Jsonl(path) => {
            let inner = JsonlBackedStore::load_or_empty(&path, &config).await?;
            Ok(Box::new(JsonlBackedStore {
                inner,
                path,
                config,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WorkspaceId;
    use crate::error::Error;
    use tempfile::tempdir;

    #[test]
    fn test_data_path() {
        assert!(StorageBackend::InMemory.data_path().is_none());
        let backend = StorageBackend::Jsonl(PathBuf::from("graph.jsonl"));
        assert_eq!(backend.data_path(), Some(Path::new("graph.jsonl")));
    }

    #[tokio::test]
    async fn test_create_store_rejects_invalid_config() {
        let result = create_store(StorageBackend::InMemory, EngineConfig::with_max_depth(0)).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_jsonl_store_starts_empty_without_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graph.jsonl");
        let store = create_store(StorageBackend::Jsonl(path.clone()), EngineConfig::default())
            .await
            .unwrap();

        assert_eq!(store.snapshot().await.unwrap(), StoreSnapshot::default());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_jsonl_store_reload_discards_unsaved_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graph.jsonl");
        let mut store = create_store(StorageBackend::Jsonl(path.clone()), EngineConfig::default())
            .await
            .unwrap();

        let table = store
            .create_table(NewTable {
                workspace_id: WorkspaceId(1),
                name: "Orders".to_string(),
            })
            .await
            .unwrap();
        store.save().await.unwrap();

        store
            .create_field(NewField::new(table.id, "price", FieldKind::Number))
            .await
            .unwrap();
        assert_eq!(store.fields_in_table(table.id).await.unwrap().len(), 1);

        store.reload().await.unwrap();
        assert!(store.get_table(table.id).await.unwrap().is_some());
        assert!(store.fields_in_table(table.id).await.unwrap().is_empty());
    }

    #[test]
    fn test_heal_report_extend() {
        let mut report = HealReport {
            healed: vec![FieldId(1)],
            failed: vec![],
        };
        report.extend(HealReport {
            healed: vec![FieldId(2)],
            failed: vec![],
        });
        assert_eq!(report.healed, vec![FieldId(1), FieldId(2)]);
    }
}
