//! Diagnostic export of the dependency graph.
//!
//! The export is a read-only picture of every field and edge, taken under
//! the store's shared lock. It can be serialized as JSON or rendered as a
//! Graphviz DOT digraph with edges pointing from dependant to dependency.

use crate::domain::{Field, FieldDependency, FieldId, TableId};
use crate::error::Result;
use petgraph::dot::Dot;
use petgraph::graph::{Graph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A field as it appears in the exported graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Field ID
    pub id: FieldId,
    /// Table the field belongs to
    pub table_id: TableId,
    /// Field name
    pub name: String,
    /// Type name, e.g. `formula`
    pub field_type: String,
    /// Whether the field is trashed
    pub trashed: bool,
}

impl From<&Field> for GraphNode {
    fn from(field: &Field) -> Self {
        Self {
            id: field.id,
            table_id: field.table_id,
            name: field.name.clone(),
            field_type: field.kind.type_name().to_string(),
            trashed: field.trashed,
        }
    }
}

/// Nodes and edges of the whole dependency graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraphExport {
    /// Every field, ordered by ID
    pub nodes: Vec<GraphNode>,
    /// Every edge, ordered by dependant
    pub edges: Vec<FieldDependency>,
}

impl DependencyGraphExport {
    /// Build an export from fields and edges.
    pub fn new<'a>(
        fields: impl IntoIterator<Item = &'a Field>,
        edges: impl IntoIterator<Item = FieldDependency>,
    ) -> Self {
        let mut nodes: Vec<GraphNode> = fields.into_iter().map(GraphNode::from).collect();
        nodes.sort_by_key(|n| n.id);
        let mut edges: Vec<FieldDependency> = edges.into_iter().collect();
        edges.sort();
        Self { nodes, edges }
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Graphviz DOT source.
    ///
    /// Broken references are drawn as extra nodes labelled with the
    /// unresolved name, one per name and lookup scope: the dependant's table,
    /// or the link-row field a lookup goes through. Edges through a link-row
    /// field are labelled with it.
    pub fn to_dot(&self) -> String {
        let mut graph: Graph<String, String> = Graph::new();
        let mut index: HashMap<FieldId, NodeIndex> = HashMap::new();
        let names: HashMap<FieldId, &str> =
            self.nodes.iter().map(|n| (n.id, n.name.as_str())).collect();
        let tables: HashMap<FieldId, TableId> =
            self.nodes.iter().map(|n| (n.id, n.table_id)).collect();

        for node in &self.nodes {
            let mut label = format!("{} #{} ({})", node.name, node.id, node.field_type);
            if node.trashed {
                label.push_str(" [trashed]");
            }
            index.insert(node.id, graph.add_node(label));
        }

        let mut broken: BTreeMap<(TableId, Option<FieldId>, String), NodeIndex> = BTreeMap::new();
        for edge in &self.edges {
            let Some(&from) = index.get(&edge.dependant) else {
                continue;
            };
            let to = match (edge.dependency, &edge.broken_reference_field_name) {
                (Some(dependency), _) => match index.get(&dependency) {
                    Some(&to) => to,
                    None => continue,
                },
                (None, Some(name)) => {
                    let Some(&table_id) = tables.get(&edge.dependant) else {
                        continue;
                    };
                    *broken
                        .entry((table_id, edge.via, name.clone()))
                        .or_insert_with(|| graph.add_node(format!("<broken '{name}'>")))
                }
                (None, None) => continue,
            };
            let label = edge
                .via
                .map(|via| format!("via {}", names.get(&via).copied().unwrap_or("?")))
                .unwrap_or_default();
            graph.add_edge(from, to, label);
        }

        format!("{}", Dot::new(&graph))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldKind;

    fn field(id: u64, name: &str, kind: FieldKind) -> Field {
        Field {
            id: FieldId(id),
            table_id: TableId(1),
            name: name.to_string(),
            kind,
            trashed: false,
            trashed_at: None,
            formula_version: None,
        }
    }

    fn sample() -> DependencyGraphExport {
        let fields = vec![
            field(2, "tax", FieldKind::Number),
            field(1, "price", FieldKind::Number),
            field(
                3,
                "total",
                FieldKind::Formula {
                    expression: "field('price') + field('tax') + field('fee')".to_string(),
                },
            ),
        ];
        let edges = vec![
            FieldDependency::direct(FieldId(3), FieldId(2)),
            FieldDependency::direct(FieldId(3), FieldId(1)),
            FieldDependency::broken(FieldId(3), "fee", None),
        ];
        DependencyGraphExport::new(&fields, edges)
    }

    #[test]
    fn test_nodes_and_edges_are_sorted() {
        let export = sample();
        let ids: Vec<u64> = export.nodes.iter().map(|n| n.id.get()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(export.edges.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_json_contains_fields_and_broken_name() {
        let json = sample().to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["nodes"].as_array().unwrap().len(), 3);
        assert_eq!(parsed["edges"].as_array().unwrap().len(), 3);
        assert!(json.contains("\"fee\""));
    }

    #[test]
    fn test_dot_draws_broken_reference_node() {
        let dot = sample().to_dot();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("total #3 (formula)"));
        assert!(dot.contains("<broken 'fee'>"));
        assert_eq!(dot.matches(" -> ").count(), 3);
    }

    #[test]
    fn test_broken_nodes_are_shared_only_within_a_table() {
        let fee = |id: u64, table: u64| Field {
            table_id: TableId(table),
            ..field(
                id,
                &format!("f{id}"),
                FieldKind::Formula {
                    expression: "field('fee')".to_string(),
                },
            )
        };
        let fields = vec![fee(1, 1), fee(2, 1), fee(3, 2)];
        let edges = (1..=3).map(|id| FieldDependency::broken(FieldId(id), "fee", None));

        let dot = DependencyGraphExport::new(&fields, edges).to_dot();
        assert_eq!(dot.matches("<broken 'fee'>").count(), 2);
        assert_eq!(dot.matches(" -> ").count(), 3);
    }
}
