//! Core in-memory storage data structures.
//!
//! This module contains the inner state that holds tables, fields and the
//! edge arena. It is wrapped in `Arc<RwLock<>>` by [`super::InMemoryFieldStore`].

use super::graph::DependencyClosure;
use crate::config::EngineConfig;
use crate::domain::{Field, FieldDependency, FieldId, FieldKind, Table, TableId, WorkspaceId};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::migrations::PendingWork;
use crate::references::ExpressionParser;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Outgoing edges indexed by dependant.
pub(crate) type EdgeMap = BTreeMap<FieldId, Vec<FieldDependency>>;

/// Inner storage structure (not thread-safe on its own).
///
/// # Edge Representation
///
/// `edges` is the source of truth: every field's outgoing edges, keyed by
/// the dependant. `dependants` is the reverse index, keyed by a field that
/// appears as `dependency` or `via` of some edge, and must always agree with
/// `edges`.
pub(crate) struct FieldGraphInner {
    pub(super) config: EngineConfig,

    pub(super) parser: Arc<dyn ExpressionParser>,

    pub(super) tables: BTreeMap<TableId, Table>,

    /// Every field, trashed or not
    pub(super) fields: BTreeMap<FieldId, Field>,

    pub(super) edges: EdgeMap,

    /// Reverse index: field -> fields holding an edge to it
    pub(super) dependants: HashMap<FieldId, BTreeSet<FieldId>>,

    /// Memoised closures. Behind its own mutex so readers holding the
    /// shared lock can fill it.
    closure_cache: Mutex<HashMap<FieldId, DependencyClosure>>,

    /// Migration flags left on fields by earlier runs
    pub(super) pending: BTreeMap<FieldId, PendingWork>,

    pub(super) events: EventBus,

    next_table_id: u64,
    next_field_id: u64,
}

impl FieldGraphInner {
    /// Create a new empty engine state
    pub(crate) fn new(config: EngineConfig, parser: Arc<dyn ExpressionParser>) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            config,
            parser,
            tables: BTreeMap::new(),
            fields: BTreeMap::new(),
            edges: BTreeMap::new(),
            dependants: HashMap::new(),
            closure_cache: Mutex::new(HashMap::new()),
            pending: BTreeMap::new(),
            events,
            next_table_id: 1,
            next_field_id: 1,
        }
    }

    pub(super) fn allocate_table_id(&mut self) -> TableId {
        let id = TableId(self.next_table_id);
        self.next_table_id += 1;
        id
    }

    pub(super) fn allocate_field_id(&mut self) -> FieldId {
        let id = FieldId(self.next_field_id);
        self.next_field_id += 1;
        id
    }

    /// Keep the ID counters ahead of records loaded from disk
    pub(super) fn bump_id_counters(&mut self) {
        if let Some(max) = self.tables.keys().next_back() {
            self.next_table_id = self.next_table_id.max(max.0 + 1);
        }
        if let Some(max) = self.fields.keys().next_back() {
            self.next_field_id = self.next_field_id.max(max.0 + 1);
        }
    }

    pub(super) fn field(&self, id: FieldId) -> Result<&Field> {
        self.fields.get(&id).ok_or(Error::FieldNotFound(id))
    }

    pub(super) fn field_mut(&mut self, id: FieldId) -> Result<&mut Field> {
        self.fields.get_mut(&id).ok_or(Error::FieldNotFound(id))
    }

    pub(super) fn table(&self, id: TableId) -> Result<&Table> {
        self.tables.get(&id).ok_or(Error::TableNotFound(id))
    }

    pub(super) fn workspace_of(&self, field_id: FieldId) -> Result<WorkspaceId> {
        let field = self.field(field_id)?;
        Ok(self.table(field.table_id)?.workspace_id)
    }

    /// Non-trashed field with the given name in a table
    pub(super) fn find_field_by_name(&self, table_id: TableId, name: &str) -> Option<&Field> {
        self.fields
            .values()
            .find(|f| f.table_id == table_id && !f.trashed && f.name == name)
    }

    /// Fail if another non-trashed field in the table already uses `name`
    pub(super) fn ensure_name_available(
        &self,
        table_id: TableId,
        name: &str,
        except: Option<FieldId>,
    ) -> Result<()> {
        match self.find_field_by_name(table_id, name) {
            Some(existing) if Some(existing.id) != except => Err(Error::FieldNameTaken {
                table_id,
                name: name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Table a link-row field points at
    pub(super) fn linked_table_of(&self, field_id: FieldId) -> Option<TableId> {
        match self.fields.get(&field_id)?.kind {
            FieldKind::LinkRow { linked_table_id } => Some(linked_table_id),
            _ => None,
        }
    }

    /// Direct dependants, in ascending ID order
    pub(super) fn direct_dependants(&self, field_id: FieldId) -> Vec<FieldId> {
        self.dependants
            .get(&field_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(super) fn cache(&self) -> MutexGuard<'_, HashMap<FieldId, DependencyClosure>> {
        // Entries are inserted whole, so a poisoned map is still valid.
        self.closure_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
