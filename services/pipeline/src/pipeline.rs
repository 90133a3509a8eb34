//! One pipeline run: index -> load/normalize -> enrich -> join -> profile.

use chrono::NaiveDate;
use serde::Serialize;

use crate::batch::Batch;
use crate::enrich::enrich_all;
use crate::error::{PipelineError, PipelineFailure};
use crate::index::{compile, CompiledIndex};
use crate::join::build_views;
use crate::loader::load_all;
use crate::profile::{build_profiles, default_profiles, ProfileSpec};
use crate::source::SpreadsheetSource;
use crate::table::{NamedTables, Table};
use crate::warnings::{Warning, WarningKind, WarningLog, WarningSink};

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Reference date for ages and visit labels.
    pub today: NaiveDate,
    pub profiles: Vec<ProfileSpec>,
}

impl RunOptions {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today,
            profiles: default_profiles(),
        }
    }

    pub fn with_profiles(mut self, profiles: Vec<ProfileSpec>) -> Self {
        self.profiles = profiles;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    pub tables: NamedTables,
    pub warnings: Vec<Warning>,
}

/// Serializable summary of a run, for logs and `--report`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub ok: bool,
    pub error: Option<String>,
    pub tables: Vec<TableSummary>,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub rows: usize,
    pub columns: usize,
}

impl RunReport {
    pub fn from_result(result: &Result<PipelineOutput, PipelineFailure>) -> Self {
        match result {
            Ok(output) => Self {
                ok: true,
                error: None,
                tables: output
                    .tables
                    .iter()
                    .map(|(name, t)| TableSummary {
                        name: name.clone(),
                        rows: t.row_count(),
                        columns: t.columns().len(),
                    })
                    .collect(),
                warnings: output.warnings.clone(),
            },
            Err(failure) => Self {
                ok: false,
                error: Some(failure.error.to_string()),
                tables: Vec::new(),
                warnings: failure.warnings.clone(),
            },
        }
    }
}

fn read_index(batch: &Batch, source: &impl SpreadsheetSource) -> Result<Table, PipelineError> {
    let sheets = source
        .open_workbook(&batch.index.name, &batch.index.bytes)
        .map_err(|e| PipelineError::Configuration(format!("index unreadable: {}", e)))?;
    sheets
        .into_iter()
        .next()
        .map(|s| s.table)
        .ok_or_else(|| {
            PipelineError::Configuration(format!("index '{}' has no sheets", batch.index.name))
        })
}

fn compile_index(
    batch: &Batch,
    source: &impl SpreadsheetSource,
    warnings: &mut WarningLog,
) -> Result<CompiledIndex, PipelineError> {
    let table = read_index(batch, source)?;
    compile(&table, warnings)
}

/// Run the whole pipeline over one batch. Only configuration errors and a
/// missing patient table fail the run; everything else is a warning. Warnings
/// are returned on both paths.
pub fn run(
    batch: &Batch,
    source: &impl SpreadsheetSource,
    options: &RunOptions,
) -> Result<PipelineOutput, PipelineFailure> {
    let mut warnings = WarningLog::new();
    let fail = |error: PipelineError, warnings: WarningLog| PipelineFailure {
        error,
        warnings: warnings.into_vec(),
    };

    tracing::info!(
        index = %batch.index.name,
        index_hash = %batch.index.content_hash(),
        files = batch.data.len(),
        today = %options.today,
        "pipeline run started"
    );

    let index = match compile_index(batch, source, &mut warnings) {
        Ok(index) => index,
        Err(e) => return Err(fail(e, warnings)),
    };

    let mut loaded = load_all(source, &index, &batch.data, &mut warnings);
    let unrecognized = std::mem::take(&mut loaded.unrecognized);

    let enriched = match enrich_all(loaded, options.today, &mut warnings) {
        Ok(enriched) => enriched,
        Err(e) => return Err(fail(e, warnings)),
    };

    let views = build_views(&enriched, &mut warnings);

    let mut tables = enriched.into_named();
    tables.extend(views);
    let profiles = build_profiles(&tables, &options.profiles, options.today, &mut warnings);
    tables.extend(profiles);

    for (name, table) in unrecognized {
        if tables.contains_key(&name) {
            warnings.warn(
                WarningKind::DuplicateEntity,
                format!("unrecognized table '{}' clashes with an output table; not emitted", name),
            );
            continue;
        }
        tables.insert(name, table);
    }

    tracing::info!(tables = tables.len(), warnings = warnings.len(), "pipeline run finished");
    Ok(PipelineOutput {
        tables,
        warnings: warnings.into_vec(),
    })
}
