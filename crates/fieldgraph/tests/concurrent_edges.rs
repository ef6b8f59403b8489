//! Concurrency and property tests for the edge store.
//!
//! Writers replace a field's whole edge set while readers traverse the
//! graph; a reader must only ever see one complete edge set or the other.
//! The property tests compare closures on random acyclic graphs against a
//! plain reachability search.

use fieldgraph::config::EngineConfig;
use fieldgraph::domain::{FieldDependency, FieldId, FieldKind, NewField, NewTable, WorkspaceId};
use fieldgraph::error::Error;
use fieldgraph::storage::in_memory::InMemoryFieldStore;
use fieldgraph::storage::FieldDependencyStore;
use proptest::prelude::*;
use std::collections::{BTreeSet, VecDeque};

async fn store_with_fields(count: usize) -> (InMemoryFieldStore, Vec<FieldId>) {
    let mut store = InMemoryFieldStore::new(EngineConfig::default()).unwrap();
    let table = store
        .create_table(NewTable {
            workspace_id: WorkspaceId(1),
            name: "Sheet".to_string(),
        })
        .await
        .unwrap();

    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let field = store
            .create_field(NewField::new(table.id, format!("f{i}"), FieldKind::Number))
            .await
            .unwrap();
        ids.push(field.id);
    }
    (store, ids)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_see_whole_edge_sets() {
    let (store, ids) = store_with_fields(4).await;
    let (x, a, b, c) = (ids[0], ids[1], ids[2], ids[3]);

    let first = vec![FieldDependency::direct(x, a)];
    let second = vec![FieldDependency::direct(x, b), FieldDependency::direct(x, c)];
    let mut writer = store.clone();
    writer.replace_edges(x, first.clone()).await.unwrap();

    let writer_task = {
        let (first, second) = (first.clone(), second.clone());
        tokio::spawn(async move {
            for i in 0..200 {
                let edges = if i % 2 == 0 { second.clone() } else { first.clone() };
                writer.replace_edges(x, edges).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let reader = store.clone();
            let (first, second) = (first.clone(), second.clone());
            tokio::spawn(async move {
                for _ in 0..200 {
                    let edges = reader.get_edges_for(x).await.unwrap();
                    assert!(edges == first || edges == second, "torn edge set: {edges:?}");

                    let deps = reader.get_all_field_dependencies(x).await.unwrap();
                    assert!(
                        deps == BTreeSet::from([a]) || deps == BTreeSet::from([b, c]),
                        "torn closure: {deps:?}"
                    );
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    writer_task.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_never_create_a_loop() {
    let (store, ids) = store_with_fields(2).await;
    let (a, b) = (ids[0], ids[1]);

    let mut left = store.clone();
    let mut right = store.clone();
    let (l, r) = tokio::join!(
        tokio::spawn(async move {
            left.replace_edges(a, vec![FieldDependency::direct(a, b)]).await
        }),
        tokio::spawn(async move {
            right.replace_edges(b, vec![FieldDependency::direct(b, a)]).await
        }),
    );
    let results = [l.unwrap(), r.unwrap()];

    let failures = results.iter().filter(|r| r.is_err()).count();
    assert_eq!(failures, 1, "exactly one writer must lose: {results:?}");
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(Error::CircularFieldDependency { .. })))
    );
    assert!(store.get_all_field_dependencies(a).await.is_ok());
    assert!(store.get_all_field_dependencies(b).await.is_ok());
}

/// Fields reachable from `from` by plain BFS, excluding `from`.
fn reachable(n: usize, edges: &[(usize, usize)], from: usize) -> BTreeSet<usize> {
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([from]);
    while let Some(current) = queue.pop_front() {
        for &(_, to) in edges.iter().filter(|(f, _)| *f == current) {
            if to < n && seen.insert(to) {
                queue.push_back(to);
            }
        }
    }
    seen
}

/// Edges `i -> j` with `i < j`, selected by `mask`; always acyclic.
fn dag_edges(n: usize, mask: &[bool]) -> Vec<(usize, usize)> {
    let pairs = (0..n).flat_map(|i| (i + 1..n).map(move |j| (i, j)));
    pairs
        .zip(mask.iter())
        .filter(|(_, keep)| **keep)
        .map(|(pair, _)| pair)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn closure_matches_reachability(
        n in 2usize..9,
        mask in prop::collection::vec(any::<bool>(), 36),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let (mut store, ids) = store_with_fields(n).await;
            let edges = dag_edges(n, &mask);

            for i in 0..n {
                let outgoing: Vec<FieldDependency> = edges
                    .iter()
                    .filter(|(from, _)| *from == i)
                    .map(|&(from, to)| FieldDependency::direct(ids[from], ids[to]))
                    .collect();
                store.replace_edges(ids[i], outgoing).await.unwrap();
            }

            for i in 0..n {
                let expected: BTreeSet<FieldId> =
                    reachable(n, &edges, i).into_iter().map(|j| ids[j]).collect();
                prop_assert_eq!(store.get_all_field_dependencies(ids[i]).await.unwrap(), expected);

                for j in 0..n {
                    let loops = reachable(n, &edges, j).contains(&i);
                    let rejected = store.will_cause_circular_dep(ids[i], ids[j]).await.unwrap();
                    prop_assert_eq!(rejected, loops);
                }
            }
            Ok(())
        })?;
    }

    #[test]
    fn back_edge_is_always_rejected(
        n in 2usize..9,
        mask in prop::collection::vec(any::<bool>(), 36),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let (mut store, ids) = store_with_fields(n).await;
            let edges = dag_edges(n, &mask);
            for &(from, to) in &edges {
                let mut outgoing = store.get_edges_for(ids[from]).await.unwrap();
                outgoing.push(FieldDependency::direct(ids[from], ids[to]));
                store.replace_edges(ids[from], outgoing).await.unwrap();
            }

            // Closing any existing path back on itself must fail and change nothing.
            for i in 0..n {
                for j in reachable(n, &edges, i) {
                    let before = store.get_edges_for(ids[j]).await.unwrap();
                    let mut closing = before.clone();
                    closing.push(FieldDependency::direct(ids[j], ids[i]));
                    let result = store.replace_edges(ids[j], closing).await;
                    let is_cycle = matches!(result, Err(Error::CircularFieldDependency { .. }));
                    prop_assert!(is_cycle);
                    prop_assert_eq!(store.get_edges_for(ids[j]).await.unwrap(), before);
                }
            }
            Ok(())
        })?;
    }
}
