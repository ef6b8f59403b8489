//! Formula migration runner.
//!
//! Runs the four migration phases over every formula-type field that is
//! behind the target version or still carries flags from an earlier run.
//! Phases run in a fixed order, each over the fields in dependency order:
//!
//! 1. dependency rebuild
//! 2. attribute recalculation
//! 3. cell value recalculation
//! 4. column recreation
//!
//! A field that fails a phase keeps its remaining flags and sits out the
//! rest of the run. A field whose flags are all cleared is stamped with the
//! target version.

use super::inner::FieldGraphInner;
use super::rebuild::rebuild_dependencies_impl;
use crate::domain::FieldId;
use crate::error::{FieldFailure, MigrationPhase};
use crate::migrations::{
    topological_order, FieldRecalculator, FormulaMigrations, MigrationReport, PendingWork,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

const RECALCULATION_PHASES: [MigrationPhase; 3] = [
    MigrationPhase::Attributes,
    MigrationPhase::CellValues,
    MigrationPhase::ColumnRecreation,
];

/// Flags per field for this run, including leftovers from earlier runs
fn collect_work(
    inner: &mut FieldGraphInner,
    migrations: &FormulaMigrations,
    target: u32,
) -> BTreeMap<FieldId, PendingWork> {
    let mut work = BTreeMap::new();
    let candidates: Vec<FieldId> = inner
        .fields
        .values()
        .filter(|f| f.kind.is_formula_type())
        .map(|f| f.id)
        .collect();

    for field_id in candidates {
        let Some(field) = inner.fields.get(&field_id) else {
            continue;
        };
        let behind = field.formula_version.unwrap_or(0) < target;
        let mut flags = inner.pending.remove(&field_id).unwrap_or_default();
        if behind {
            flags.merge(migrations.pending_work(field, inner.parser.as_ref(), target));
        }
        if behind || !flags.is_empty() {
            work.insert(field_id, flags);
        }
    }
    work
}

fn record_failure(
    report: &mut MigrationReport,
    failed: &mut BTreeSet<FieldId>,
    field_id: FieldId,
    phase: MigrationPhase,
    message: String,
) {
    warn!(
        field_id = %field_id,
        phase = %phase,
        error = %message,
        "Formula migration failed for field"
    );
    failed.insert(field_id);
    report.failures.push(FieldFailure {
        field_id,
        phase,
        message,
    });
}

fn scheduled(inner: &FieldGraphInner, work: &BTreeMap<FieldId, PendingWork>) -> Vec<FieldId> {
    let ids: BTreeSet<FieldId> = work.keys().copied().collect();
    topological_order(&ids, inner.edges.values().flatten())
}

/// Run every phase for the fields that need it.
pub(super) async fn run_formula_migrations_impl(
    inner: &mut FieldGraphInner,
    migrations: &FormulaMigrations,
    recalculator: &dyn FieldRecalculator,
) -> MigrationReport {
    let target = migrations.current_version();
    let mut report = MigrationReport {
        target_version: target,
        ..MigrationReport::default()
    };
    let mut work = collect_work(inner, migrations, target);
    let mut failed: BTreeSet<FieldId> = BTreeSet::new();

    info!(target_version = target, fields = work.len(), "Starting formula migration");

    let phase = MigrationPhase::Dependencies;
    for field_id in scheduled(inner, &work) {
        if !work.get(&field_id).is_some_and(|w| w.needs(phase)) {
            continue;
        }
        match rebuild_dependencies_impl(inner, field_id) {
            Ok(_) => {
                if let Some(flags) = work.get_mut(&field_id) {
                    flags.clear(phase);
                }
                report.dependencies_rebuilt.push(field_id);
            }
            Err(e) => record_failure(&mut report, &mut failed, field_id, phase, e.to_string()),
        }
    }
    info!(
        phase = %phase,
        completed = report.dependencies_rebuilt.len(),
        failed = failed.len(),
        "Formula migration phase finished"
    );

    // Rebuilt edges can change the order.
    let order = scheduled(inner, &work);
    for phase in RECALCULATION_PHASES {
        for &field_id in &order {
            if failed.contains(&field_id)
                || !work.get(&field_id).is_some_and(|w| w.needs(phase))
            {
                continue;
            }
            let Some(field) = inner.fields.get(&field_id).cloned() else {
                continue;
            };
            let result = match phase {
                MigrationPhase::Attributes => recalculator.recalculate_attributes(&field).await,
                MigrationPhase::CellValues => recalculator.recalculate_cell_values(&field).await,
                MigrationPhase::ColumnRecreation => recalculator.recreate_column(&field).await,
                MigrationPhase::Dependencies => Ok(()),
            };
            match result {
                Ok(()) => {
                    if let Some(flags) = work.get_mut(&field_id) {
                        flags.clear(phase);
                    }
                    report.completed_mut(phase).push(field_id);
                }
                Err(e) => {
                    record_failure(&mut report, &mut failed, field_id, phase, format!("{e:#}"));
                }
            }
        }
        info!(
            phase = %phase,
            completed = report.completed(phase).len(),
            failed = failed.len(),
            "Formula migration phase finished"
        );
    }

    for (field_id, flags) in work {
        if flags.is_empty() {
            if let Some(field) = inner.fields.get_mut(&field_id) {
                field.formula_version = Some(target);
            }
            report.up_to_date.push(field_id);
        } else {
            inner.pending.insert(field_id, flags);
        }
    }

    info!(
        target_version = target,
        up_to_date = report.up_to_date.len(),
        failures = report.failures.len(),
        "Formula migration finished"
    );
    report
}
