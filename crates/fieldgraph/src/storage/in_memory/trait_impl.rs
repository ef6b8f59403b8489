//! FieldDependencyStore trait implementation for the in-memory engine.

use super::edges::{
    get_edges_for_impl, remove_all_edges_for_impl, replace_edges_impl, validate_edge,
};
use super::fields::{
    create_field_impl, create_table_impl, delete_field_impl, rename_field_impl,
    restore_field_impl, trash_field_impl, update_field_kind_impl,
};
use super::graph::{dependency_closure_impl, will_cause_circular_dep_impl};
use super::rebuild::{
    check_for_cycles, notify_dependants, rebuild_dependencies_impl, resolve_expression_impl,
};
use super::scheduler::run_formula_migrations_impl;
use super::{DependencyClosure, InMemoryFieldStore};
use crate::domain::{Field, FieldDependency, FieldId, FieldKind, NewField, NewTable, Table, TableId};
use crate::error::Result;
use crate::events::DependencyEvent;
use crate::export::DependencyGraphExport;
use crate::migrations::{FieldRecalculator, FormulaMigrations, MigrationReport, PendingWork};
use crate::storage::{FieldDependencyStore, HealReport, ResolvedReference, StoreSnapshot};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::sync::broadcast;

#[async_trait]
impl FieldDependencyStore for InMemoryFieldStore {
    async fn create_table(&mut self, table: NewTable) -> Result<Table> {
        let mut inner = self.0.write().await;
        Ok(create_table_impl(&mut inner, table))
    }

    async fn get_table(&self, table_id: TableId) -> Result<Option<Table>> {
        let inner = self.0.read().await;
        Ok(inner.tables.get(&table_id).cloned())
    }

    async fn create_field(&mut self, field: NewField) -> Result<Field> {
        let mut inner = self.0.write().await;
        create_field_impl(&mut inner, field)
    }

    async fn get_field(&self, field_id: FieldId) -> Result<Option<Field>> {
        let inner = self.0.read().await;
        Ok(inner.fields.get(&field_id).cloned())
    }

    async fn fields_in_table(&self, table_id: TableId) -> Result<Vec<Field>> {
        let inner = self.0.read().await;
        inner.table(table_id)?;
        Ok(inner
            .fields
            .values()
            .filter(|f| f.table_id == table_id)
            .cloned()
            .collect())
    }

    async fn update_field_kind(&mut self, field_id: FieldId, kind: FieldKind) -> Result<Field> {
        let mut inner = self.0.write().await;
        update_field_kind_impl(&mut inner, field_id, kind)
    }

    async fn rename_field(&mut self, field_id: FieldId, new_name: &str) -> Result<HealReport> {
        let mut inner = self.0.write().await;
        rename_field_impl(&mut inner, field_id, new_name)
    }

    async fn trash_field(&mut self, field_id: FieldId) -> Result<HealReport> {
        let mut inner = self.0.write().await;
        trash_field_impl(&mut inner, field_id)
    }

    async fn restore_field(&mut self, field_id: FieldId) -> Result<HealReport> {
        let mut inner = self.0.write().await;
        restore_field_impl(&mut inner, field_id)
    }

    async fn delete_field(&mut self, field_id: FieldId) -> Result<HealReport> {
        let mut inner = self.0.write().await;
        delete_field_impl(&mut inner, field_id)
    }

    async fn get_edges_for(&self, field_id: FieldId) -> Result<Vec<FieldDependency>> {
        let inner = self.0.read().await;
        get_edges_for_impl(&inner, field_id)
    }

    async fn replace_edges(
        &mut self,
        field_id: FieldId,
        edges: Vec<FieldDependency>,
    ) -> Result<()> {
        let mut inner = self.0.write().await;
        for edge in &edges {
            validate_edge(&inner, field_id, edge)?;
        }
        check_for_cycles(&inner, field_id, &edges)?;
        replace_edges_impl(&mut inner, field_id, edges)?;
        inner
            .events
            .publish(DependencyEvent::DependenciesRebuilt { field_id });
        notify_dependants(&inner, field_id);
        Ok(())
    }

    async fn remove_all_edges_for(&mut self, field_id: FieldId) -> Result<()> {
        let mut inner = self.0.write().await;
        inner.field(field_id)?;
        remove_all_edges_for_impl(&mut inner, field_id);
        Ok(())
    }

    async fn get_dependants(&self, field_id: FieldId) -> Result<Vec<FieldId>> {
        let inner = self.0.read().await;
        inner.field(field_id)?;
        Ok(inner.direct_dependants(field_id))
    }

    async fn get_all_field_dependencies(&self, field_id: FieldId) -> Result<BTreeSet<FieldId>> {
        let inner = self.0.read().await;
        Ok(dependency_closure_impl(&inner, field_id)?.field_ids())
    }

    async fn dependency_closure(&self, field_id: FieldId) -> Result<DependencyClosure> {
        let inner = self.0.read().await;
        dependency_closure_impl(&inner, field_id)
    }

    async fn will_cause_circular_dep(&self, from: FieldId, to: FieldId) -> Result<bool> {
        let inner = self.0.read().await;
        will_cause_circular_dep_impl(&inner, from, to)
    }

    async fn rebuild_dependencies(&mut self, field_id: FieldId) -> Result<Vec<FieldDependency>> {
        let mut inner = self.0.write().await;
        rebuild_dependencies_impl(&mut inner, field_id)
    }

    async fn resolve_expression(
        &self,
        table_id: TableId,
        expression: &str,
    ) -> Result<Vec<ResolvedReference>> {
        let inner = self.0.read().await;
        resolve_expression_impl(&inner, table_id, expression)
    }

    async fn run_formula_migrations(
        &mut self,
        migrations: &FormulaMigrations,
        recalculator: &dyn FieldRecalculator,
    ) -> Result<MigrationReport> {
        let mut inner = self.0.write().await;
        Ok(run_formula_migrations_impl(&mut inner, migrations, recalculator).await)
    }

    async fn pending_work(&self, field_id: FieldId) -> Result<Option<PendingWork>> {
        let inner = self.0.read().await;
        inner.field(field_id)?;
        Ok(inner.pending.get(&field_id).copied())
    }

    async fn export_graph(&self) -> Result<DependencyGraphExport> {
        let inner = self.0.read().await;
        Ok(DependencyGraphExport::new(
            inner.fields.values(),
            inner.edges.values().flatten().cloned(),
        ))
    }

    async fn snapshot(&self) -> Result<StoreSnapshot> {
        let inner = self.0.read().await;
        Ok(StoreSnapshot {
            tables: inner.tables.values().cloned().collect(),
            fields: inner.fields.values().cloned().collect(),
            dependencies: inner.edges.values().flatten().cloned().collect(),
        })
    }

    async fn subscribe(&self) -> broadcast::Receiver<DependencyEvent> {
        self.0.read().await.events.subscribe()
    }

    async fn save(&self) -> Result<()> {
        // No-op for pure in-memory storage
        Ok(())
    }

    async fn reload(&mut self) -> Result<()> {
        // No-op for pure in-memory storage; there is no file to reload from
        Ok(())
    }
}
