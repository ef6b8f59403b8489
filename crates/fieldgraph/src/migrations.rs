//! Formula version migrations.
//!
//! When the formula language advances a version, some existing formula
//! fields have to be brought up to date. Each [`FormulaMigration`] declares
//! four independent [`FieldSelector`]s, one per kind of work:
//!
//! 1. rebuilding dependency edges
//! 2. recalculating type attributes
//! 3. recalculating stored cell values
//! 4. dropping and recreating the backing column
//!
//! A field passing through several versions at once gets the OR of every
//! selector of every migration it passes. The resulting [`PendingWork`]
//! flags are cleared one phase at a time by the store's migration runner,
//! which processes fields in [`topological_order`].

use crate::domain::{Field, FieldDependency, FieldId, FieldKind};
use crate::error::{FieldFailure, MigrationPhase};
use crate::references::ExpressionParser;
use async_trait::async_trait;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::fmt;
use std::sync::Arc;

/// Predicate choosing which formula fields a migration applies to.
#[derive(Clone, Default)]
pub enum FieldSelector {
    /// No field
    #[default]
    None,

    /// Every formula-type field
    All,

    /// Formula fields calling any of these functions (case-insensitive).
    /// Lookup fields count as calling `lookup`.
    FormulasUsingFunctions(Vec<String>),

    /// Lookup fields
    LookupFields,

    /// Arbitrary predicate
    Custom(Arc<dyn Fn(&Field) -> bool + Send + Sync>),
}

impl FieldSelector {
    /// Selector matching formulas that call any of `names`
    pub fn using_functions<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::FormulasUsingFunctions(names.into_iter().map(Into::into).collect())
    }

    /// Selector backed by a closure
    pub fn custom(predicate: impl Fn(&Field) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(predicate))
    }

    /// Whether `field` is selected.
    ///
    /// A formula the parser cannot read is selected by function-based
    /// selectors, so that the run reports it instead of skipping it.
    pub fn matches(&self, field: &Field, parser: &dyn ExpressionParser) -> bool {
        if !field.kind.is_formula_type() {
            return false;
        }
        match self {
            Self::None => false,
            Self::All => true,
            Self::LookupFields => matches!(field.kind, FieldKind::Lookup { .. }),
            Self::FormulasUsingFunctions(names) => {
                let called = match &field.kind {
                    FieldKind::Formula { expression } => match parser.function_names(expression) {
                        Ok(called) => called,
                        Err(_) => return true,
                    },
                    FieldKind::Lookup { .. } => BTreeSet::from(["lookup".to_string()]),
                    _ => BTreeSet::new(),
                };
                names
                    .iter()
                    .any(|name| called.contains(&name.to_ascii_lowercase()))
            }
            Self::Custom(predicate) => predicate(field),
        }
    }
}

impl fmt::Debug for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::All => write!(f, "All"),
            Self::LookupFields => write!(f, "LookupFields"),
            Self::FormulasUsingFunctions(names) => {
                f.debug_tuple("FormulasUsingFunctions").field(names).finish()
            }
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Work required to bring fields up to one formula version.
#[derive(Debug, Clone)]
pub struct FormulaMigration {
    /// Version this migration upgrades to
    pub version: u32,
    /// Fields whose dependency edges must be rebuilt
    pub dependencies: FieldSelector,
    /// Fields whose type attributes must be recalculated
    pub attributes: FieldSelector,
    /// Fields whose cell values must be recalculated
    pub cell_values: FieldSelector,
    /// Fields whose column must be recreated
    pub recreate_column: FieldSelector,
}

impl FormulaMigration {
    /// A migration to `version` selecting nothing
    pub fn new(version: u32) -> Self {
        Self {
            version,
            dependencies: FieldSelector::None,
            attributes: FieldSelector::None,
            cell_values: FieldSelector::None,
            recreate_column: FieldSelector::None,
        }
    }

    /// Set the dependency rebuild selector
    #[must_use]
    pub fn rebuild_dependencies(mut self, selector: FieldSelector) -> Self {
        self.dependencies = selector;
        self
    }

    /// Set the attribute recalculation selector
    #[must_use]
    pub fn recalculate_attributes(mut self, selector: FieldSelector) -> Self {
        self.attributes = selector;
        self
    }

    /// Set the cell value recalculation selector
    #[must_use]
    pub fn recalculate_cell_values(mut self, selector: FieldSelector) -> Self {
        self.cell_values = selector;
        self
    }

    /// Set the column recreation selector
    #[must_use]
    pub fn recreate_columns(mut self, selector: FieldSelector) -> Self {
        self.recreate_column = selector;
        self
    }
}

/// The ordered list of every known formula migration.
#[derive(Debug, Clone, Default)]
pub struct FormulaMigrations {
    migrations: Vec<FormulaMigration>,
}

impl FormulaMigrations {
    /// Build the list, sorted by version
    pub fn new(mut migrations: Vec<FormulaMigration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        Self { migrations }
    }

    /// Highest known formula version, 0 without migrations
    pub fn current_version(&self) -> u32 {
        self.migrations.last().map_or(0, |m| m.version)
    }

    /// Migrations with `from < version <= to`
    pub fn between(&self, from: u32, to: u32) -> impl Iterator<Item = &FormulaMigration> {
        self.migrations
            .iter()
            .filter(move |m| m.version > from && m.version <= to)
    }

    /// Combined work for moving `field` from its stored version to `target`.
    pub fn pending_work(
        &self,
        field: &Field,
        parser: &dyn ExpressionParser,
        target: u32,
    ) -> PendingWork {
        let from = field.formula_version.unwrap_or(0);
        self.between(from, target)
            .fold(PendingWork::default(), |mut work, migration| {
                work.merge(PendingWork {
                    dependencies: migration.dependencies.matches(field, parser),
                    attributes: migration.attributes.matches(field, parser),
                    cell_values: migration.cell_values.matches(field, parser),
                    column: migration.recreate_column.matches(field, parser),
                });
                work
            })
    }
}

/// Independent "needs" flags of one field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingWork {
    /// Needs a dependency rebuild
    pub dependencies: bool,
    /// Needs attribute recalculation
    pub attributes: bool,
    /// Needs cell value recalculation
    pub cell_values: bool,
    /// Needs column recreation
    pub column: bool,
}

impl PendingWork {
    /// True when the field is up to date
    pub fn is_empty(&self) -> bool {
        !(self.dependencies || self.attributes || self.cell_values || self.column)
    }

    /// OR `other` into `self`
    pub fn merge(&mut self, other: PendingWork) {
        self.dependencies |= other.dependencies;
        self.attributes |= other.attributes;
        self.cell_values |= other.cell_values;
        self.column |= other.column;
    }

    /// Whether the flag for `phase` is set
    pub fn needs(&self, phase: MigrationPhase) -> bool {
        match phase {
            MigrationPhase::Dependencies => self.dependencies,
            MigrationPhase::Attributes => self.attributes,
            MigrationPhase::CellValues => self.cell_values,
            MigrationPhase::ColumnRecreation => self.column,
        }
    }

    /// Clear the flag for `phase`
    pub fn clear(&mut self, phase: MigrationPhase) {
        match phase {
            MigrationPhase::Dependencies => self.dependencies = false,
            MigrationPhase::Attributes => self.attributes = false,
            MigrationPhase::CellValues => self.cell_values = false,
            MigrationPhase::ColumnRecreation => self.column = false,
        }
    }
}

/// Outcome of a migration run.
///
/// Per-field failures do not abort the run; they are collected in
/// `failures` and the field keeps its unfinished flags for the next run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Version the run migrated to
    pub target_version: u32,
    /// Fields whose dependencies were rebuilt, in processing order
    pub dependencies_rebuilt: Vec<FieldId>,
    /// Fields whose attributes were recalculated, in processing order
    pub attributes_recalculated: Vec<FieldId>,
    /// Fields whose cell values were recalculated, in processing order
    pub cell_values_recalculated: Vec<FieldId>,
    /// Fields whose column was recreated, in processing order
    pub columns_recreated: Vec<FieldId>,
    /// Fields now stamped with `target_version`
    pub up_to_date: Vec<FieldId>,
    /// Non-fatal per-field failures
    pub failures: Vec<FieldFailure>,
}

impl MigrationReport {
    /// True if no field failed
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fields processed successfully in `phase`
    pub fn completed(&self, phase: MigrationPhase) -> &[FieldId] {
        match phase {
            MigrationPhase::Dependencies => &self.dependencies_rebuilt,
            MigrationPhase::Attributes => &self.attributes_recalculated,
            MigrationPhase::CellValues => &self.cell_values_recalculated,
            MigrationPhase::ColumnRecreation => &self.columns_recreated,
        }
    }

    pub(crate) fn completed_mut(&mut self, phase: MigrationPhase) -> &mut Vec<FieldId> {
        match phase {
            MigrationPhase::Dependencies => &mut self.dependencies_rebuilt,
            MigrationPhase::Attributes => &mut self.attributes_recalculated,
            MigrationPhase::CellValues => &mut self.cell_values_recalculated,
            MigrationPhase::ColumnRecreation => &mut self.columns_recreated,
        }
    }
}

/// Recomputes derived state of a formula field.
///
/// The engine only decides what has to happen and in which order; the
/// actual recalculation belongs to the caller (type inference, stored
/// values, physical columns).
#[async_trait]
pub trait FieldRecalculator: Send + Sync {
    /// Recompute type attributes of the field
    async fn recalculate_attributes(&self, field: &Field) -> anyhow::Result<()>;

    /// Recompute every stored cell value of the field
    async fn recalculate_cell_values(&self, field: &Field) -> anyhow::Result<()>;

    /// Drop and recreate the column backing the field
    async fn recreate_column(&self, field: &Field) -> anyhow::Result<()>;
}

/// A [`FieldRecalculator`] with nothing to recalculate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecalculator;

#[async_trait]
impl FieldRecalculator for NoopRecalculator {
    async fn recalculate_attributes(&self, _field: &Field) -> anyhow::Result<()> {
        Ok(())
    }

    async fn recalculate_cell_values(&self, _field: &Field) -> anyhow::Result<()> {
        Ok(())
    }

    async fn recreate_column(&self, _field: &Field) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Order `fields` so that every field comes after the fields it depends on.
///
/// The whole edge set is considered, so indirect dependencies through
/// fields outside `fields` are respected too. Ties are broken by ascending
/// field ID. Fields left over by a cycle are appended in ID order.
pub fn topological_order<'a>(
    fields: &BTreeSet<FieldId>,
    edges: impl IntoIterator<Item = &'a FieldDependency>,
) -> Vec<FieldId> {
    let mut graph: DiGraphMap<FieldId, ()> = DiGraphMap::new();
    for &field_id in fields {
        graph.add_node(field_id);
    }
    for edge in edges {
        if let Some(dependency) = edge.dependency {
            if dependency != edge.dependant {
                graph.add_edge(dependency, edge.dependant, ());
            }
        }
    }

    let mut in_degree: std::collections::HashMap<FieldId, usize> = graph
        .nodes()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();
    let mut ready: BinaryHeap<Reverse<FieldId>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(&n, _)| Reverse(n))
        .collect();

    let mut order = Vec::with_capacity(fields.len());
    let mut emitted = BTreeSet::new();
    while let Some(Reverse(next)) = ready.pop() {
        emitted.insert(next);
        if fields.contains(&next) {
            order.push(next);
        }
        for dependant in graph.neighbors_directed(next, Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&dependant) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(dependant));
                }
            }
        }
    }

    order.extend(fields.iter().copied().filter(|id| !emitted.contains(id)));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TableId;
    use crate::references::FieldCallParser;
    use rstest::rstest;

    fn formula(id: u64, expression: &str, version: Option<u32>) -> Field {
        Field {
            id: FieldId(id),
            table_id: TableId(1),
            name: format!("f{id}"),
            kind: FieldKind::Formula {
                expression: expression.to_string(),
            },
            trashed: false,
            trashed_at: None,
            formula_version: version,
        }
    }

    #[rstest]
    #[case::all(FieldSelector::All, true)]
    #[case::none(FieldSelector::None, false)]
    #[case::function_used(FieldSelector::using_functions(["TOTEXT"]), true)]
    #[case::function_unused(FieldSelector::using_functions(["upper"]), false)]
    #[case::lookups_only(FieldSelector::LookupFields, false)]
    #[case::custom(FieldSelector::custom(|f| f.name == "f1"), true)]
    fn test_selector_matches_formula(#[case] selector: FieldSelector, #[case] expected: bool) {
        let parser = FieldCallParser::default();
        let field = formula(1, "totext(field('a'))", Some(1));
        assert_eq!(selector.matches(&field, &parser), expected);
    }

    #[test]
    fn test_selector_ignores_non_formula_fields() {
        let parser = FieldCallParser::default();
        let mut field = formula(1, "1", None);
        field.kind = FieldKind::Number;
        assert!(!FieldSelector::All.matches(&field, &parser));
    }

    #[test]
    fn test_lookup_fields_count_as_calling_lookup() {
        let parser = FieldCallParser::default();
        let mut field = formula(1, "", None);
        field.kind = FieldKind::Lookup {
            through_field_name: "link".to_string(),
            target_field_name: "name".to_string(),
        };
        assert!(FieldSelector::using_functions(["lookup"]).matches(&field, &parser));
        assert!(FieldSelector::LookupFields.matches(&field, &parser));
    }

    #[test]
    fn test_pending_work_ors_passed_versions_only() {
        let parser = FieldCallParser::default();
        let migrations = FormulaMigrations::new(vec![
            FormulaMigration::new(3).recreate_columns(FieldSelector::All),
            FormulaMigration::new(2).recalculate_cell_values(FieldSelector::All),
            FormulaMigration::new(1).rebuild_dependencies(FieldSelector::All),
        ]);
        assert_eq!(migrations.current_version(), 3);

        let field = formula(1, "field('a')", Some(1));
        let work = migrations.pending_work(&field, &parser, 3);
        assert_eq!(
            work,
            PendingWork {
                dependencies: false,
                attributes: false,
                cell_values: true,
                column: true,
            }
        );

        let unversioned = formula(2, "field('a')", None);
        let work = migrations.pending_work(&unversioned, &parser, 2);
        assert!(work.dependencies && work.cell_values && !work.column);
    }

    #[test]
    fn test_pending_work_flags() {
        let mut work = PendingWork::default();
        assert!(work.is_empty());

        work.merge(PendingWork {
            attributes: true,
            ..PendingWork::default()
        });
        assert!(work.needs(MigrationPhase::Attributes));
        assert!(!work.needs(MigrationPhase::Dependencies));

        work.clear(MigrationPhase::Attributes);
        assert!(work.is_empty());
    }

    #[test]
    fn test_topological_order_dependencies_first() {
        // 4 -> 2 -> 1, 3 -> 1
        let edges = vec![
            FieldDependency::direct(FieldId(4), FieldId(2)),
            FieldDependency::direct(FieldId(2), FieldId(1)),
            FieldDependency::direct(FieldId(3), FieldId(1)),
        ];
        let fields: BTreeSet<FieldId> = [1, 2, 3, 4].into_iter().map(FieldId).collect();
        let order = topological_order(&fields, &edges);
        assert_eq!(order, vec![FieldId(1), FieldId(2), FieldId(3), FieldId(4)]);
    }

    #[test]
    fn test_topological_order_respects_fields_outside_the_set() {
        // 1 depends on 5 which depends on 9; only 1 and 9 are scheduled
        let edges = vec![
            FieldDependency::direct(FieldId(1), FieldId(5)),
            FieldDependency::direct(FieldId(5), FieldId(9)),
        ];
        let fields: BTreeSet<FieldId> = [1, 9].into_iter().map(FieldId).collect();
        let order = topological_order(&fields, &edges);
        assert_eq!(order, vec![FieldId(9), FieldId(1)]);
    }

    #[tokio::test]
    async fn test_noop_recalculator() {
        let field = formula(1, "1", Some(1));
        let recalculator = NoopRecalculator;
        assert!(recalculator.recalculate_attributes(&field).await.is_ok());
        assert!(recalculator.recalculate_cell_values(&field).await.is_ok());
        assert!(recalculator.recreate_column(&field).await.is_ok());
    }
}
