//! JSONL persistence for the in-memory engine.
//!
//! Each line is one record tagged with its kind:
//!
//! ```text
//! {"record":"table","id":1,"workspace_id":1,"name":"Orders","primary_field_id":1}
//! {"record":"field","id":1,"table_id":1,"name":"price","kind":{"type":"number"},...}
//! {"record":"dependency","dependant":3,"dependency":1,"via":null,...}
//! ```
//!
//! Loading is resilient: problems with individual lines are reported as
//! [`LoadWarning`]s and the offending record is skipped.

use super::edges::validate_edge;
use super::graph::compute_closure;
use super::inner::FieldGraphInner;
use super::InMemoryFieldStore;
use crate::config::EngineConfig;
use crate::domain::{Field, FieldDependency, FieldId, FieldKind, Table};
use crate::error::{Error, Result};
use crate::references::FieldCallParser;
use crate::storage::FieldDependencyStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

/// One line of the JSONL file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Record {
    Table(Table),
    Field(Field),
    Dependency(FieldDependency),
}

/// Warnings that can occur during JSONL file loading.
///
/// These are non-fatal: the load continues and the problematic record is
/// skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadWarning {
    /// Line that couldn't be parsed as a record
    MalformedJson {
        /// 1-based line number
        line_number: usize,
        /// Parser message
        error: String,
    },

    /// Edge whose dependant or dependency is not in the file
    OrphanedDependency {
        /// 1-based line number
        line_number: usize,
        /// The field that is missing
        missing: FieldId,
    },

    /// Edge that would close a loop. Skipped to break the cycle.
    CircularDependency {
        /// 1-based line number
        line_number: usize,
        /// Dependant of the skipped edge
        dependant: FieldId,
        /// Dependency of the skipped edge
        dependency: FieldId,
    },

    /// Record that parsed but violates the data model
    InvalidRecord {
        /// 1-based line number
        line_number: usize,
        /// What is wrong with it
        error: String,
    },
}

impl fmt::Display for LoadWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedJson { line_number, error } => {
                write!(f, "line {line_number}: malformed JSON: {error}")
            }
            Self::OrphanedDependency {
                line_number,
                missing,
            } => write!(f, "line {line_number}: dependency on missing field {missing}"),
            Self::CircularDependency {
                line_number,
                dependant,
                dependency,
            } => write!(
                f,
                "line {line_number}: dependency {dependant} -> {dependency} would be circular"
            ),
            Self::InvalidRecord { line_number, error } => {
                write!(f, "line {line_number}: invalid record: {error}")
            }
        }
    }
}

/// Read every parseable record, in file order
async fn read_records(
    path: &Path,
    warnings: &mut Vec<LoadWarning>,
) -> Result<Vec<(usize, Record)>> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    let mut line_number = 0;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(&line) {
            Ok(record) => records.push((line_number, record)),
            Err(e) => warnings.push(LoadWarning::MalformedJson {
                line_number,
                error: e.to_string(),
            }),
        }
    }
    Ok(records)
}

fn load_field(
    inner: &mut FieldGraphInner,
    line_number: usize,
    field: Field,
) -> Option<LoadWarning> {
    let invalid = |error: String| {
        Some(LoadWarning::InvalidRecord {
            line_number,
            error,
        })
    };
    let Some(table) = inner.tables.get(&field.table_id) else {
        return invalid(format!("field {} belongs to missing table {}", field.id, field.table_id));
    };
    if let FieldKind::LinkRow { linked_table_id } = field.kind {
        let same_workspace = inner
            .tables
            .get(&linked_table_id)
            .is_some_and(|linked| linked.workspace_id == table.workspace_id);
        if !same_workspace {
            return invalid(format!(
                "field {} links to table {} outside its workspace",
                field.id, linked_table_id
            ));
        }
    }
    if inner.fields.contains_key(&field.id) {
        return invalid(format!("duplicate field {}", field.id));
    }
    if !field.trashed {
        if let Err(e) = inner.ensure_name_available(field.table_id, &field.name, None) {
            return invalid(e.to_string());
        }
    }
    inner.fields.insert(field.id, field);
    None
}

fn load_edge(
    inner: &mut FieldGraphInner,
    line_number: usize,
    edge: FieldDependency,
) -> Option<LoadWarning> {
    for id in std::iter::once(edge.dependant).chain(edge.dependency) {
        if !inner.fields.contains_key(&id) {
            return Some(LoadWarning::OrphanedDependency {
                line_number,
                missing: id,
            });
        }
    }
    if let Err(e) = validate_edge(inner, edge.dependant, &edge) {
        return Some(LoadWarning::InvalidRecord {
            line_number,
            error: e.to_string(),
        });
    }

    let dependant = edge.dependant;
    let dependency = edge.dependency;
    let list = inner.edges.entry(dependant).or_default();
    if list.contains(&edge) {
        return None;
    }
    list.push(edge.clone());

    if let Some(dependency) = dependency {
        if compute_closure(&inner.edges, dependant, usize::MAX).is_err() {
            if let Some(list) = inner.edges.get_mut(&dependant) {
                list.retain(|e| *e != edge);
                if list.is_empty() {
                    inner.edges.remove(&dependant);
                }
            }
            return Some(LoadWarning::CircularDependency {
                line_number,
                dependant,
                dependency,
            });
        }
    }
    None
}

/// Load the engine from a JSONL file.
///
/// Records are applied tables first, then fields, then edges, so their
/// order within the file does not matter. Pending migration flags are not
/// persisted; fields behind the current formula version are picked up
/// again by the next migration run.
///
/// # Errors
///
/// Returns `Error::Io` if the file cannot be read and `Error::Config` if
/// `config` is invalid. Problems with individual records are returned as
/// warnings instead.
pub async fn load_from_jsonl(
    path: &Path,
    config: EngineConfig,
) -> Result<(Box<dyn FieldDependencyStore>, Vec<LoadWarning>)> {
    config.validate()?;
    let mut warnings = Vec::new();
    let records = read_records(path, &mut warnings).await?;

    let parser = Arc::new(FieldCallParser::new(config.max_formula_nesting_depth));
    let mut inner = FieldGraphInner::new(config, parser);

    let mut fields = Vec::new();
    let mut edges = Vec::new();
    for (line_number, record) in records {
        match record {
            Record::Table(table) => {
                inner.tables.insert(table.id, table);
            }
            Record::Field(field) => fields.push((line_number, field)),
            Record::Dependency(edge) => edges.push((line_number, edge)),
        }
    }

    warnings.extend(
        fields
            .into_iter()
            .filter_map(|(line_number, field)| load_field(&mut inner, line_number, field)),
    );

    // A primary field that didn't load is no primary field.
    let field_ids: Vec<FieldId> = inner.fields.keys().copied().collect();
    for table in inner.tables.values_mut() {
        if table
            .primary_field_id
            .is_some_and(|id| !field_ids.contains(&id))
        {
            table.primary_field_id = None;
        }
    }

    warnings.extend(
        edges
            .into_iter()
            .filter_map(|(line_number, edge)| load_edge(&mut inner, line_number, edge)),
    );

    for (field_id, list) in &mut inner.edges {
        list.sort();
        list.dedup();
        for target in list.iter().flat_map(|e| e.dependency.into_iter().chain(e.via)) {
            inner.dependants.entry(target).or_default().insert(*field_id);
        }
    }
    inner.bump_id_counters();

    tracing::debug!(
        path = %path.display(),
        tables = inner.tables.len(),
        fields = inner.fields.len(),
        warnings = warnings.len(),
        "Loaded field graph from JSONL"
    );

    Ok((Box::new(InMemoryFieldStore::from_inner(inner)), warnings))
}

/// Save a store to a JSONL file with atomic writes.
///
/// The file is written to a temporary sibling and renamed into place, so an
/// interrupted save leaves the previous file intact. Output is ordered by
/// ID for stable diffs.
pub async fn save_to_jsonl(store: &dyn FieldDependencyStore, path: &Path) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let snapshot = store.snapshot().await?;

    let file = File::create(&temp_path).await?;
    let mut writer = BufWriter::new(file);

    let records = snapshot
        .tables
        .into_iter()
        .map(Record::Table)
        .chain(snapshot.fields.into_iter().map(Record::Field))
        .chain(snapshot.dependencies.into_iter().map(Record::Dependency));

    for record in records {
        let json = serde_json::to_string(&record).map_err(Error::Json)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    writer.flush().await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}
