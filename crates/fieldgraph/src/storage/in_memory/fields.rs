//! Table and field lifecycle.
//!
//! Every operation here keeps a field's edges in step with its definition.
//! Validation happens before the first mutation; if the dependency rebuild
//! of the field itself fails, its previous state is put back so the call
//! has no effect.

use super::edges::remove_all_edges_for_impl;
use super::inner::FieldGraphInner;
use super::rebuild::{
    heal_broken_references, rebuild_dependants, rebuild_dependencies_impl, rebuild_links_to,
    rewrite_references_to,
};
use crate::domain::{Field, FieldId, FieldKind, NewField, NewTable, Table, TableId};
use crate::error::{Error, Result};
use crate::events::DependencyEvent;
use crate::storage::HealReport;
use chrono::Utc;

pub(super) fn create_table_impl(inner: &mut FieldGraphInner, new_table: NewTable) -> Table {
    let table = Table {
        id: inner.allocate_table_id(),
        workspace_id: new_table.workspace_id,
        name: new_table.name,
        primary_field_id: None,
    };
    tracing::debug!(table_id = %table.id, name = %table.name, "Created table");
    inner.tables.insert(table.id, table.clone());
    table
}

/// A link-row field may only point at an existing table of its own workspace.
fn check_link_target(
    inner: &FieldGraphInner,
    table_id: TableId,
    name: &str,
    kind: &FieldKind,
) -> Result<()> {
    if let FieldKind::LinkRow { linked_table_id } = kind {
        let workspace = inner.table(table_id)?.workspace_id;
        if inner.table(*linked_table_id)?.workspace_id != workspace {
            return Err(Error::UnknownFieldReference {
                table_id,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

fn set_primary(inner: &mut FieldGraphInner, table_id: TableId, primary: Option<FieldId>) {
    if let Some(table) = inner.tables.get_mut(&table_id) {
        table.primary_field_id = primary;
    }
}

fn log_failures(report: &HealReport, operation: &str) {
    for failure in &report.failed {
        tracing::warn!(operation, failure = %failure, "Dependant could not be rebuilt");
    }
}

pub(super) fn create_field_impl(inner: &mut FieldGraphInner, new_field: NewField) -> Result<Field> {
    let table = inner.table(new_field.table_id)?.clone();
    inner.ensure_name_available(table.id, &new_field.name, None)?;
    check_link_target(inner, table.id, &new_field.name, &new_field.kind)?;

    let field = Field {
        id: inner.allocate_field_id(),
        table_id: table.id,
        formula_version: new_field
            .kind
            .is_formula_type()
            .then_some(inner.config.formula_version),
        name: new_field.name,
        kind: new_field.kind,
        trashed: false,
        trashed_at: None,
    };
    let field_id = field.id;
    inner.fields.insert(field_id, field);

    let is_primary = table.primary_field_id.is_none();
    if is_primary {
        set_primary(inner, table.id, Some(field_id));
    }

    if let Err(e) = rebuild_dependencies_impl(inner, field_id) {
        inner.fields.remove(&field_id);
        if is_primary {
            set_primary(inner, table.id, None);
        }
        return Err(e);
    }

    let field = inner.field(field_id)?.clone();
    tracing::debug!(
        field_id = %field_id,
        name = %field.name,
        kind = field.kind.type_name(),
        "Created field"
    );

    let mut report = heal_broken_references(inner, table.id, &field.name);
    if is_primary {
        report.extend(rebuild_links_to(inner, table.id));
    }
    log_failures(&report, "create_field");

    Ok(field)
}

pub(super) fn update_field_kind_impl(
    inner: &mut FieldGraphInner,
    field_id: FieldId,
    kind: FieldKind,
) -> Result<Field> {
    let previous = inner.field(field_id)?.clone();
    check_link_target(inner, previous.table_id, &previous.name, &kind)?;

    let link_changed = matches!(previous.kind, FieldKind::LinkRow { .. })
        || matches!(kind, FieldKind::LinkRow { .. });
    let formula_version = if kind.is_formula_type() {
        previous
            .formula_version
            .or(Some(inner.config.formula_version))
    } else {
        None
    };

    {
        let field = inner.field_mut(field_id)?;
        field.kind = kind;
        field.formula_version = formula_version;
    }

    if let Err(e) = rebuild_dependencies_impl(inner, field_id) {
        tracing::debug!(field_id = %field_id, error = %e, "Rejected field update");
        *inner.field_mut(field_id)? = previous;
        return Err(e);
    }

    if link_changed {
        // Lookups through this field resolve against a different table now.
        let report = rebuild_dependants(inner, field_id);
        log_failures(&report, "update_field_kind");
    }

    Ok(inner.field(field_id)?.clone())
}

pub(super) fn rename_field_impl(
    inner: &mut FieldGraphInner,
    field_id: FieldId,
    new_name: &str,
) -> Result<HealReport> {
    let field = inner.field(field_id)?.clone();
    if field.name == new_name {
        return Ok(HealReport::default());
    }
    if !field.trashed {
        inner.ensure_name_available(field.table_id, new_name, Some(field_id))?;
    }

    rewrite_references_to(inner, field_id, &field.name, new_name)?;
    inner.field_mut(field_id)?.name = new_name.to_string();
    tracing::debug!(field_id = %field_id, old = %field.name, new = new_name, "Renamed field");

    if field.trashed {
        return Ok(HealReport::default());
    }
    let report = heal_broken_references(inner, field.table_id, new_name);
    log_failures(&report, "rename_field");
    Ok(report)
}

pub(super) fn trash_field_impl(
    inner: &mut FieldGraphInner,
    field_id: FieldId,
) -> Result<HealReport> {
    let field = inner.field_mut(field_id)?;
    if field.trashed {
        return Ok(HealReport::default());
    }
    field.trashed = true;
    field.trashed_at = Some(Utc::now());

    let report = rebuild_dependants(inner, field_id);
    log_failures(&report, "trash_field");
    inner
        .events
        .publish(DependencyEvent::FieldTrashed { field_id });
    Ok(report)
}

pub(super) fn restore_field_impl(
    inner: &mut FieldGraphInner,
    field_id: FieldId,
) -> Result<HealReport> {
    let field = inner.field(field_id)?.clone();
    if !field.trashed {
        return Ok(HealReport::default());
    }
    inner.ensure_name_available(field.table_id, &field.name, None)?;

    {
        let restored = inner.field_mut(field_id)?;
        restored.trashed = false;
        restored.trashed_at = None;
    }
    if let Err(e) = rebuild_dependencies_impl(inner, field_id) {
        *inner.field_mut(field_id)? = field;
        return Err(e);
    }

    let mut report = heal_broken_references(inner, field.table_id, &field.name);
    if inner.table(field.table_id)?.primary_field_id == Some(field_id) {
        report.extend(rebuild_links_to(inner, field.table_id));
    }
    log_failures(&report, "restore_field");
    inner
        .events
        .publish(DependencyEvent::FieldRestored { field_id });
    Ok(report)
}

pub(super) fn delete_field_impl(
    inner: &mut FieldGraphInner,
    field_id: FieldId,
) -> Result<HealReport> {
    let field = inner.field(field_id)?.clone();

    remove_all_edges_for_impl(inner, field_id);
    inner.fields.remove(&field_id);
    inner.pending.remove(&field_id);
    inner.cache().remove(&field_id);
    if inner.table(field.table_id)?.primary_field_id == Some(field_id) {
        set_primary(inner, field.table_id, None);
    }

    // The reverse index still lists the dependants; rebuilding them removes
    // their edges to the deleted field.
    let report = rebuild_dependants(inner, field_id);
    log_failures(&report, "delete_field");
    tracing::debug!(field_id = %field_id, name = %field.name, "Deleted field");
    inner
        .events
        .publish(DependencyEvent::FieldDeleted { field_id });
    Ok(report)
}
