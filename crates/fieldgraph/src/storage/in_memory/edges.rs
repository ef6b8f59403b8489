//! Edge store operations.
//!
//! Every mutation of the edge arena goes through [`replace_edges_impl`] or
//! [`remove_all_edges_for_impl`], which keep the reverse index and the
//! closure cache consistent with `edges`. Both run while the caller holds
//! the exclusive lock, so readers only ever see the full old or the full new
//! edge set of a field.

use super::graph::transitive_dependants;
use super::inner::FieldGraphInner;
use crate::domain::{FieldDependency, FieldId};
use crate::error::{Error, Result};

/// Outgoing edges of a field, trashed or not.
pub(super) fn get_edges_for_impl(
    inner: &FieldGraphInner,
    field_id: FieldId,
) -> Result<Vec<FieldDependency>> {
    inner.field(field_id)?;
    Ok(inner.edges.get(&field_id).cloned().unwrap_or_default())
}

/// Check a single edge against the store invariants.
///
/// - the edge belongs to `field_id`
/// - it has a concrete dependency or a broken reference name
/// - the dependency exists in the dependant's workspace
/// - a dependency in another table is reached through a link-row field of
///   the dependant's table that points at that table
pub(super) fn validate_edge(
    inner: &FieldGraphInner,
    field_id: FieldId,
    edge: &FieldDependency,
) -> Result<()> {
    if edge.dependant != field_id {
        return Err(Error::InvalidEdge(format!(
            "edge {} does not belong to field {}",
            edge, field_id
        )));
    }

    let dependant = inner.field(field_id)?;
    let table_id = dependant.table_id;
    let workspace_id = inner.table(table_id)?.workspace_id;

    let unknown = |name: String| Error::UnknownFieldReference { table_id, name };

    if let Some(via) = edge.via {
        let via_field = inner
            .fields
            .get(&via)
            .ok_or_else(|| unknown(via.to_string()))?;
        if via_field.table_id != table_id || inner.linked_table_of(via).is_none() {
            return Err(unknown(via_field.name.clone()));
        }
    }

    match edge.dependency {
        None => {
            if edge.broken_reference_field_name.is_none() {
                return Err(Error::InvalidEdge(format!(
                    "edge {} has neither a dependency nor a broken reference name",
                    edge
                )));
            }
        }
        Some(dependency) => {
            let target = inner
                .fields
                .get(&dependency)
                .ok_or_else(|| unknown(dependency.to_string()))?;
            let target_workspace = inner.table(target.table_id)?.workspace_id;
            if target_workspace != workspace_id {
                return Err(unknown(target.name.clone()));
            }
            if target.table_id != table_id {
                let reachable = edge
                    .via
                    .and_then(|via| inner.linked_table_of(via))
                    .is_some_and(|linked| linked == target.table_id);
                if !reachable {
                    return Err(unknown(target.name.clone()));
                }
            }
        }
    }

    Ok(())
}

/// Atomically replace every outgoing edge of `field_id`.
///
/// All new edges are validated before anything changes; on error the old
/// edge set is untouched.
pub(super) fn replace_edges_impl(
    inner: &mut FieldGraphInner,
    field_id: FieldId,
    mut new_edges: Vec<FieldDependency>,
) -> Result<()> {
    inner.field(field_id)?;
    for edge in &new_edges {
        validate_edge(inner, field_id, edge)?;
    }
    new_edges.sort();
    new_edges.dedup();

    invalidate_closures(inner, field_id);
    unindex(inner, field_id);

    for edge in &new_edges {
        for target in edge.dependency.into_iter().chain(edge.via) {
            inner.dependants.entry(target).or_default().insert(field_id);
        }
    }

    tracing::debug!(field_id = %field_id, edges = new_edges.len(), "Replaced field dependencies");

    if new_edges.is_empty() {
        inner.edges.remove(&field_id);
    } else {
        inner.edges.insert(field_id, new_edges);
    }
    Ok(())
}

/// Drop every outgoing edge of a field, used on permanent deletion.
pub(super) fn remove_all_edges_for_impl(inner: &mut FieldGraphInner, field_id: FieldId) {
    invalidate_closures(inner, field_id);
    unindex(inner, field_id);
    inner.edges.remove(&field_id);
}

/// Remove `field_id`'s outgoing edges from the reverse index
fn unindex(inner: &mut FieldGraphInner, field_id: FieldId) {
    let old_targets: Vec<FieldId> = inner
        .edges
        .get(&field_id)
        .into_iter()
        .flatten()
        .flat_map(|edge| edge.dependency.into_iter().chain(edge.via))
        .collect();

    for target in old_targets {
        if let Some(set) = inner.dependants.get_mut(&target) {
            set.remove(&field_id);
            if set.is_empty() {
                inner.dependants.remove(&target);
            }
        }
    }
}

/// Forget cached closures of `field_id` and of everything depending on it.
pub(super) fn invalidate_closures(inner: &FieldGraphInner, field_id: FieldId) {
    let affected = transitive_dependants(inner, field_id);
    let mut cache = inner.cache();
    cache.remove(&field_id);
    for id in &affected {
        cache.remove(id);
    }
}
