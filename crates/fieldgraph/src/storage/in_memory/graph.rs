//! Transitive dependency closure and cycle detection.
//!
//! The closure of a field is every field reachable by following concrete
//! `dependency` edges along paths of at most the configured maximum
//! reference depth. Broken edges are skipped. The traversal runs in three
//! passes:
//!
//! 1. Level by level from the origin, recording the shortest and deepest
//!    level at which each field is reached. Nothing past `max_depth` is
//!    ever reached.
//! 2. For every reached field, the shortest loop back to itself is searched
//!    within the edges left in the bound. A loop that closes within the
//!    bound aborts the whole computation with the offending path; longer
//!    loops are never walked and are not reported.
//! 3. With every bounded path known to be simple, the deepest level is the
//!    depth reported for each field.

use super::inner::{EdgeMap, FieldGraphInner};
use crate::domain::FieldId;
use crate::error::{Error, Result};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// A field reachable from the origin, with the deepest level it was observed at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosureEntry {
    /// The reachable field
    pub field_id: FieldId,
    /// Deepest observation, 1 for direct dependencies
    pub depth: usize,
}

/// Result of a closure computation.
///
/// Entries are ordered by descending depth, then ascending field ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyClosure {
    origin: FieldId,
    entries: Vec<ClosureEntry>,
}

impl DependencyClosure {
    /// The field the traversal started from
    pub fn origin(&self) -> FieldId {
        self.origin
    }

    /// Reachable fields with their depths
    pub fn entries(&self) -> &[ClosureEntry] {
        &self.entries
    }

    /// Deduplicated set of reachable field IDs
    pub fn field_ids(&self) -> BTreeSet<FieldId> {
        self.entries.iter().map(|e| e.field_id).collect()
    }

    /// Whether `field_id` is reachable
    pub fn contains(&self, field_id: FieldId) -> bool {
        self.entries.iter().any(|e| e.field_id == field_id)
    }

    /// Number of reachable fields
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the origin has no dependencies
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Concrete targets of a field's outgoing edges, sorted and deduplicated
fn concrete_targets(edges: &EdgeMap, field_id: FieldId) -> Vec<FieldId> {
    let mut targets: Vec<FieldId> = edges
        .get(&field_id)
        .into_iter()
        .flatten()
        .filter_map(|edge| edge.dependency)
        .collect();
    targets.sort_unstable();
    targets.dedup();
    targets
}

/// Compute the closure of `origin` over `edges`.
///
/// # Errors
///
/// Returns `Error::CircularFieldDependency` if a path of at most
/// `max_depth` edges from `origin` revisits a field.
pub(crate) fn compute_closure(
    edges: &EdgeMap,
    origin: FieldId,
    max_depth: usize,
) -> Result<DependencyClosure> {
    // Pass 1: fields reached by walks of each length
    let mut shortest: BTreeMap<FieldId, usize> = BTreeMap::from([(origin, 0)]);
    let mut deepest: HashMap<FieldId, usize> = HashMap::new();
    let mut frontier = BTreeSet::from([origin]);

    for depth in 1..=max_depth {
        let next: BTreeSet<FieldId> = frontier
            .iter()
            .flat_map(|&field_id| concrete_targets(edges, field_id))
            .collect();
        if next.is_empty() {
            break;
        }
        for &field_id in &next {
            shortest.entry(field_id).or_insert(depth);
            deepest.insert(field_id, depth);
        }
        frontier = next;
    }

    // Pass 2: a loop closing within the bound
    let mut best: Option<(usize, Vec<FieldId>)> = None;
    for (&field_id, &depth) in &shortest {
        let budget = max_depth - depth;
        if let Some(cycle) = shortest_cycle(edges, field_id, budget) {
            let reach = depth + cycle.len() - 1;
            if best.as_ref().is_none_or(|(best_reach, _)| reach < *best_reach) {
                best = Some((reach, cycle));
            }
        }
    }
    if let Some((_, path)) = best {
        tracing::debug!(origin = %origin, ?path, "Circular field dependency");
        return Err(Error::CircularFieldDependency {
            field_id: origin,
            path,
        });
    }

    // Pass 3: deepest observation, now known to be along a simple path
    let mut entries: Vec<ClosureEntry> = deepest
        .into_iter()
        .filter(|(field_id, _)| *field_id != origin)
        .map(|(field_id, depth)| ClosureEntry { field_id, depth })
        .collect();
    entries.sort_by(|a, b| b.depth.cmp(&a.depth).then(a.field_id.cmp(&b.field_id)));

    Ok(DependencyClosure { origin, entries })
}

/// Shortest loop `start -> ... -> start` of at most `budget` edges.
fn shortest_cycle(edges: &EdgeMap, start: FieldId, budget: usize) -> Option<Vec<FieldId>> {
    let mut parent: HashMap<FieldId, FieldId> = HashMap::new();
    let mut queue = VecDeque::from([(start, 0)]);

    while let Some((current, depth)) = queue.pop_front() {
        if depth >= budget {
            continue;
        }
        for target in concrete_targets(edges, current) {
            if target == start {
                let mut path = vec![start, current];
                let mut cursor = current;
                while let Some(&prev) = parent.get(&cursor) {
                    path.push(prev);
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            if let Entry::Vacant(slot) = parent.entry(target) {
                slot.insert(current);
                queue.push_back((target, depth + 1));
            }
        }
    }
    None
}

/// Closure of a field using the engine's depth bound and cache.
pub(super) fn dependency_closure_impl(
    inner: &FieldGraphInner,
    field_id: FieldId,
) -> Result<DependencyClosure> {
    inner.field(field_id)?;

    if let Some(cached) = inner.cache().get(&field_id) {
        return Ok(cached.clone());
    }

    let closure = compute_closure(
        &inner.edges,
        field_id,
        inner.config.max_field_reference_depth,
    )?;
    tracing::debug!(
        field_id = %field_id,
        dependencies = closure.len(),
        "Computed dependency closure"
    );
    inner.cache().insert(field_id, closure.clone());
    Ok(closure)
}

/// True if `from` is in the closure of `to`, i.e. making `from` depend on
/// `to` would close a loop.
pub(super) fn will_cause_circular_dep_impl(
    inner: &FieldGraphInner,
    from: FieldId,
    to: FieldId,
) -> Result<bool> {
    inner.field(from)?;
    Ok(dependency_closure_impl(inner, to)?.contains(from))
}

/// Shortest path `from -> ... -> to` along concrete edges, for error reporting.
pub(super) fn find_path(edges: &EdgeMap, from: FieldId, to: FieldId) -> Option<Vec<FieldId>> {
    let mut parent: HashMap<FieldId, FieldId> = HashMap::new();
    let mut queue = VecDeque::from([from]);
    let mut seen = HashSet::from([from]);

    while let Some(current) = queue.pop_front() {
        if current == to {
            let mut path = vec![to];
            let mut cursor = to;
            while let Some(&prev) = parent.get(&cursor) {
                path.push(prev);
                cursor = prev;
            }
            path.reverse();
            return Some(path);
        }
        for target in concrete_targets(edges, current) {
            if seen.insert(target) {
                parent.insert(target, current);
                queue.push_back(target);
            }
        }
    }
    None
}

/// Every field that transitively depends on `field_id`, following both
/// `dependency` and `via` back-references. Excludes `field_id` itself.
pub(super) fn transitive_dependants(inner: &FieldGraphInner, field_id: FieldId) -> Vec<FieldId> {
    let mut seen = HashSet::from([field_id]);
    let mut queue = VecDeque::from([field_id]);
    let mut result = Vec::new();

    while let Some(current) = queue.pop_front() {
        for dependant in inner.direct_dependants(current) {
            if seen.insert(dependant) {
                result.push(dependant);
                queue.push_back(dependant);
            }
        }
    }

    result.sort_unstable();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldDependency;

    fn edges(pairs: &[(u64, u64)]) -> EdgeMap {
        let mut map = EdgeMap::new();
        for &(from, to) in pairs {
            map.entry(FieldId(from))
                .or_default()
                .push(FieldDependency::direct(FieldId(from), FieldId(to)));
        }
        map
    }

    fn ids(values: &[u64]) -> BTreeSet<FieldId> {
        values.iter().copied().map(FieldId).collect()
    }

    #[test]
    fn test_no_edges_gives_empty_closure() {
        let closure = compute_closure(&EdgeMap::new(), FieldId(1), 10).unwrap();
        assert!(closure.is_empty());
        assert_eq!(closure.origin(), FieldId(1));
    }

    #[test]
    fn test_diamond_reports_deepest_observation() {
        // 1 -> 2 -> 4, 1 -> 3 -> 5 -> 4
        let map = edges(&[(1, 2), (2, 4), (1, 3), (3, 5), (5, 4)]);
        let closure = compute_closure(&map, FieldId(1), 10).unwrap();

        assert_eq!(closure.field_ids(), ids(&[2, 3, 4, 5]));
        assert_eq!(
            closure.entries(),
            &[
                ClosureEntry {
                    field_id: FieldId(4),
                    depth: 3
                },
                ClosureEntry {
                    field_id: FieldId(5),
                    depth: 2
                },
                ClosureEntry {
                    field_id: FieldId(2),
                    depth: 1
                },
                ClosureEntry {
                    field_id: FieldId(3),
                    depth: 1
                },
            ]
        );
    }

    #[test]
    fn test_deepest_observation_is_capped_by_bound() {
        // 4 is reachable at depth 1 directly and at depth 3 through 2 and 3.
        let map = edges(&[(1, 4), (1, 2), (2, 3), (3, 4)]);
        let closure = compute_closure(&map, FieldId(1), 2).unwrap();

        assert_eq!(closure.field_ids(), ids(&[2, 3, 4]));
        let depth_of_4 = closure
            .entries()
            .iter()
            .find(|e| e.field_id == FieldId(4))
            .map(|e| e.depth);
        assert_eq!(depth_of_4, Some(1));
    }

    #[test]
    fn test_cycle_reports_path() {
        let map = edges(&[(1, 2), (2, 3), (3, 1)]);
        let err = compute_closure(&map, FieldId(2), 10).unwrap_err();
        match err {
            Error::CircularFieldDependency { field_id, path } => {
                assert_eq!(field_id, FieldId(2));
                assert_eq!(path, vec![FieldId(2), FieldId(3), FieldId(1), FieldId(2)]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_cycle_not_through_origin_is_detected() {
        let map = edges(&[(1, 2), (2, 3), (3, 2)]);
        assert!(matches!(
            compute_closure(&map, FieldId(1), 10),
            Err(Error::CircularFieldDependency { .. })
        ));
    }

    #[test]
    fn test_loop_beyond_bound_is_not_walked() {
        // 1 -> 2, 3, 4, 5 and 2 -> 3 -> 4 -> 5 -> 2; every path of two edges is simple.
        let map = edges(&[(1, 2), (1, 3), (1, 4), (1, 5), (2, 3), (3, 4), (4, 5), (5, 2)]);
        let closure = compute_closure(&map, FieldId(1), 2).unwrap();

        assert_eq!(closure.field_ids(), ids(&[2, 3, 4, 5]));
        assert!(closure.entries().iter().all(|e| e.depth == 2));
    }

    #[test]
    fn test_loop_closing_at_bound_is_detected() {
        let map = edges(&[(1, 2), (2, 3), (3, 2)]);
        assert!(compute_closure(&map, FieldId(1), 2).is_ok());

        let err = compute_closure(&map, FieldId(1), 3).unwrap_err();
        match err {
            Error::CircularFieldDependency { field_id, path } => {
                assert_eq!(field_id, FieldId(1));
                assert_eq!(path, vec![FieldId(2), FieldId(3), FieldId(2)]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_self_loop_reports_two_element_path() {
        let map = edges(&[(1, 2), (2, 2)]);
        let err = compute_closure(&map, FieldId(1), 5).unwrap_err();
        assert!(matches!(
            err,
            Error::CircularFieldDependency { ref path, .. } if *path == vec![FieldId(2), FieldId(2)]
        ));
    }

    #[test]
    fn test_broken_edges_are_skipped() {
        let mut map = edges(&[(1, 2)]);
        map.entry(FieldId(1))
            .or_default()
            .push(FieldDependency::broken(FieldId(1), "gone", None));
        let closure = compute_closure(&map, FieldId(1), 10).unwrap();
        assert_eq!(closure.field_ids(), ids(&[2]));
    }

    #[test]
    fn test_depth_bound_truncates_silently() {
        let map = edges(&[(1, 2), (2, 3), (3, 4)]);
        assert_eq!(
            compute_closure(&map, FieldId(1), 3).unwrap().field_ids(),
            ids(&[2, 3, 4])
        );
        assert_eq!(
            compute_closure(&map, FieldId(1), 2).unwrap().field_ids(),
            ids(&[2, 3])
        );
    }

    #[test]
    fn test_find_path() {
        let map = edges(&[(1, 2), (2, 3), (1, 3)]);
        assert_eq!(
            find_path(&map, FieldId(1), FieldId(3)),
            Some(vec![FieldId(1), FieldId(3)])
        );
        assert_eq!(find_path(&map, FieldId(3), FieldId(1)), None);
    }
}
