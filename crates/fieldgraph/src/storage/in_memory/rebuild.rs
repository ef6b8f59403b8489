//! Dependency rebuilding.
//!
//! A field's outgoing edges are always derived from its definition: the
//! references in a formula, the link and target of a lookup, or the primary
//! field of the table a link-row field points at. References that cannot be
//! resolved are stored as broken edges carrying the unresolved name, so that
//! creating, renaming or restoring a field with that name can heal them.

use super::edges::replace_edges_impl;
use super::graph::{find_path, transitive_dependants, will_cause_circular_dep_impl};
use super::inner::FieldGraphInner;
use crate::domain::{Field, FieldDependency, FieldId, FieldKind, TableId};
use crate::error::{Error, FieldFailure, MigrationPhase, Result};
use crate::events::DependencyEvent;
use crate::references::{FieldReference, RenameTarget};
use crate::storage::{HealReport, ResolvedReference};

/// References a field's definition contains
fn references_of(inner: &FieldGraphInner, field: &Field) -> Result<Vec<FieldReference>> {
    match &field.kind {
        FieldKind::Formula { expression } => inner.parser.references(expression),
        FieldKind::Lookup {
            through_field_name,
            target_field_name,
        } => Ok(vec![FieldReference::lookup(
            through_field_name.clone(),
            target_field_name.clone(),
        )]),
        _ => Ok(Vec::new()),
    }
}

/// Resolve one reference made from `table_id` by `dependant`.
fn resolve_reference(
    inner: &FieldGraphInner,
    dependant: FieldId,
    table_id: TableId,
    reference: &FieldReference,
) -> FieldDependency {
    match reference {
        FieldReference::Field { name } => match inner.find_field_by_name(table_id, name) {
            Some(target) => FieldDependency::direct(dependant, target.id),
            None => FieldDependency::broken(dependant, name.clone(), None),
        },
        FieldReference::Lookup { through, target } => {
            let link = inner
                .find_field_by_name(table_id, through)
                .and_then(|link| inner.linked_table_of(link.id).map(|t| (link.id, t)));
            let Some((link_id, linked_table_id)) = link else {
                return FieldDependency::broken(dependant, through.clone(), None);
            };
            match inner.find_field_by_name(linked_table_id, target) {
                Some(found) => FieldDependency::via(dependant, found.id, link_id),
                None => FieldDependency::broken(dependant, target.clone(), Some(link_id)),
            }
        }
    }
}

/// Derive the full outgoing edge set of a field from its definition.
pub(super) fn resolve_edges(
    inner: &FieldGraphInner,
    field: &Field,
) -> Result<Vec<FieldDependency>> {
    let mut edges: Vec<FieldDependency> = references_of(inner, field)?
        .iter()
        .map(|reference| resolve_reference(inner, field.id, field.table_id, reference))
        .collect();

    if let FieldKind::LinkRow { linked_table_id } = field.kind {
        let primary = inner
            .tables
            .get(&linked_table_id)
            .and_then(|table| table.primary_field_id)
            .filter(|id| *id != field.id && inner.fields.get(id).is_some_and(|f| !f.trashed));
        if let Some(primary) = primary {
            edges.push(FieldDependency::via(field.id, primary, field.id));
        }
    }

    edges.sort();
    edges.dedup();
    Ok(edges)
}

/// Resolve every reference of an expression concretely.
///
/// # Errors
///
/// Unlike a rebuild, an unresolvable name is fatal here and returns
/// `Error::UnknownFieldReference`.
pub(super) fn resolve_expression_impl(
    inner: &FieldGraphInner,
    table_id: TableId,
    expression: &str,
) -> Result<Vec<ResolvedReference>> {
    inner.table(table_id)?;
    // Placeholder dependant; only the resolved target matters here.
    let dependant = FieldId(0);

    inner
        .parser
        .references(expression)?
        .iter()
        .map(|reference| {
            let edge = resolve_reference(inner, dependant, table_id, reference);
            match edge.dependency {
                Some(field_id) => Ok(ResolvedReference {
                    field_id,
                    via: edge.via,
                }),
                None => Err(Error::UnknownFieldReference {
                    table_id,
                    name: edge.broken_reference_field_name.unwrap_or_default(),
                }),
            }
        })
        .collect()
}

/// Reject `new_edges` if any of them would close a loop through `field_id`.
pub(super) fn check_for_cycles(
    inner: &FieldGraphInner,
    field_id: FieldId,
    new_edges: &[FieldDependency],
) -> Result<()> {
    for dependency in new_edges.iter().filter_map(|edge| edge.dependency) {
        if dependency == field_id {
            return Err(Error::CircularFieldDependency {
                field_id,
                path: vec![field_id, field_id],
            });
        }
        if will_cause_circular_dep_impl(inner, field_id, dependency)? {
            let mut path = vec![field_id];
            path.extend(
                find_path(&inner.edges, dependency, field_id)
                    .unwrap_or_else(|| vec![dependency, field_id]),
            );
            return Err(Error::CircularFieldDependency { field_id, path });
        }
    }
    Ok(())
}

/// Recompute and atomically replace a field's outgoing edges.
///
/// On any error the previous edge set is left exactly as it was.
pub(super) fn rebuild_dependencies_impl(
    inner: &mut FieldGraphInner,
    field_id: FieldId,
) -> Result<Vec<FieldDependency>> {
    let field = inner.field(field_id)?.clone();
    let new_edges = resolve_edges(inner, &field)?;

    check_for_cycles(inner, field_id, &new_edges)?;
    replace_edges_impl(inner, field_id, new_edges.clone())?;

    for edge in new_edges.iter().filter(|e| e.is_broken()) {
        tracing::warn!(
            field = %field.name,
            field_id = %field_id,
            reference = edge.broken_reference_field_name.as_deref().unwrap_or_default(),
            "Field references an unknown field"
        );
    }

    inner
        .events
        .publish(DependencyEvent::DependenciesRebuilt { field_id });
    notify_dependants(inner, field_id);

    Ok(new_edges)
}

/// Publish the transitive dependants of `field_id` for recalculation
pub(super) fn notify_dependants(inner: &FieldGraphInner, field_id: FieldId) {
    let dependants = transitive_dependants(inner, field_id);
    if !dependants.is_empty() {
        inner.events.publish(DependencyEvent::DependantsChanged {
            source: field_id,
            dependants,
        });
    }
}

/// Rebuild a list of fields, collecting failures instead of stopping.
pub(super) fn rebuild_all(inner: &mut FieldGraphInner, field_ids: Vec<FieldId>) -> HealReport {
    let mut report = HealReport::default();
    for field_id in field_ids {
        match rebuild_dependencies_impl(inner, field_id) {
            Ok(_) => report.healed.push(field_id),
            Err(e) => {
                tracing::warn!(
                    field_id = %field_id,
                    error = %e,
                    "Failed to rebuild field dependencies"
                );
                report.failed.push(FieldFailure {
                    field_id,
                    phase: MigrationPhase::Dependencies,
                    message: e.to_string(),
                });
            }
        }
    }
    report
}

/// Rebuild every direct dependant of `field_id`, e.g. after it was trashed
/// or deleted and references to it have to become broken.
pub(super) fn rebuild_dependants(inner: &mut FieldGraphInner, field_id: FieldId) -> HealReport {
    let dependants: Vec<FieldId> = inner
        .direct_dependants(field_id)
        .into_iter()
        .filter(|id| *id != field_id)
        .collect();
    rebuild_all(inner, dependants)
}

/// Rebuild every link-row field pointing at `table_id`, after the table's
/// primary field appeared, disappeared or came back.
pub(super) fn rebuild_links_to(inner: &mut FieldGraphInner, table_id: TableId) -> HealReport {
    let links: Vec<FieldId> = inner
        .fields
        .values()
        .filter(|f| {
            matches!(f.kind, FieldKind::LinkRow { linked_table_id } if linked_table_id == table_id)
        })
        .map(|f| f.id)
        .collect();
    rebuild_all(inner, links)
}

/// Table in which a broken edge's name would be resolved
fn broken_edge_scope(inner: &FieldGraphInner, edge: &FieldDependency) -> Option<TableId> {
    match edge.via {
        Some(via) => inner.linked_table_of(via),
        None => inner.fields.get(&edge.dependant).map(|f| f.table_id),
    }
}

/// Rebuild every field holding a broken reference to `name` in `table_id`.
pub(super) fn heal_broken_references(
    inner: &mut FieldGraphInner,
    table_id: TableId,
    name: &str,
) -> HealReport {
    let mut candidates: Vec<FieldId> = inner
        .edges
        .values()
        .flatten()
        .filter(|edge| edge.broken_reference_field_name.as_deref() == Some(name))
        .filter(|edge| broken_edge_scope(inner, edge) == Some(table_id))
        .map(|edge| edge.dependant)
        .collect();
    candidates.sort_unstable();
    candidates.dedup();

    if !candidates.is_empty() {
        tracing::debug!(
            table_id = %table_id,
            name,
            fields = candidates.len(),
            "Healing broken references"
        );
    }

    let mut report = rebuild_all(inner, candidates);
    // A rebuild that succeeds but still leaves the name unresolved is not a heal.
    report.healed.retain(|id| {
        !inner.edges.get(id).into_iter().flatten().any(|edge| {
            edge.broken_reference_field_name.as_deref() == Some(name)
                && broken_edge_scope(inner, edge) == Some(table_id)
        })
    });
    report
}

/// Rewrite dependants' definitions after `field_id` was renamed from
/// `old_name`. Edges keep pointing at the same fields.
pub(super) fn rewrite_references_to(
    inner: &mut FieldGraphInner,
    field_id: FieldId,
    old_name: &str,
    new_name: &str,
) -> Result<()> {
    let mut rewrites: Vec<(FieldId, FieldKind)> = Vec::new();

    for dependant_id in inner.direct_dependants(field_id) {
        let dependant = inner.field(dependant_id)?;
        let mut kind = dependant.kind.clone();

        for edge in inner.edges.get(&dependant_id).into_iter().flatten() {
            let via_name = edge
                .via
                .and_then(|via| inner.fields.get(&via))
                .map(|f| f.name.clone());

            if edge.dependency == Some(field_id) && edge.via.is_none() {
                if let FieldKind::Formula { expression } = &mut kind {
                    *expression = inner.parser.rename_reference(
                        expression,
                        RenameTarget::Field,
                        old_name,
                        new_name,
                    );
                }
            }

            if edge.dependency == Some(field_id)
                && edge.via.is_some()
                && edge.via != Some(dependant_id)
            {
                let through = via_name.unwrap_or_default();
                match &mut kind {
                    FieldKind::Formula { expression } => {
                        *expression = inner.parser.rename_reference(
                            expression,
                            RenameTarget::LookupTarget { through },
                            old_name,
                            new_name,
                        );
                    }
                    FieldKind::Lookup {
                        through_field_name,
                        target_field_name,
                    } if *through_field_name == through && target_field_name == old_name => {
                        *target_field_name = new_name.to_string();
                    }
                    _ => {}
                }
            }

            if edge.via == Some(field_id) && dependant_id != field_id {
                match &mut kind {
                    FieldKind::Formula { expression } => {
                        *expression = inner.parser.rename_reference(
                            expression,
                            RenameTarget::LookupThrough,
                            old_name,
                            new_name,
                        );
                    }
                    FieldKind::Lookup {
                        through_field_name, ..
                    } if through_field_name == old_name => {
                        *through_field_name = new_name.to_string();
                    }
                    _ => {}
                }
            }
        }

        if kind != dependant.kind {
            rewrites.push((dependant_id, kind));
        }
    }

    for (dependant_id, kind) in rewrites {
        tracing::debug!(field_id = %dependant_id, "Rewrote references after rename");
        inner.field_mut(dependant_id)?.kind = kind;
    }
    Ok(())
}
