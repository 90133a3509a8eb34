//! Profile tables: distinct counts (and optional sums) grouped by reporting
//! dimensions. Null dimension values form their own group.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::schema::{col, tables};
use crate::table::{Column, NamedTables, Table, Value};
use crate::warnings::{WarningKind, WarningSink};

pub const SUM_ALIAS: &str = "monto_total";
pub const SHARE_ALIAS: &str = "porcentaje";

/// Row predicate applied before grouping. In JSON: `{"kind": "in", "column":
/// ..., "values": [...]}`, `{"kind": "is_true", "column": ...}` or
/// `{"kind": "current_month", "column": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowFilter {
    /// Cell matches one of `values`, compared as join keys ignoring case.
    In { column: String, values: Vec<String> },
    /// Cell reads as a true flag (`true`, `1`, `sí`, ...).
    IsTrue { column: String },
    /// Cell is a date in the same month as the run's reference date.
    CurrentMonth { column: String },
}

impl RowFilter {
    pub fn column(&self) -> &str {
        match self {
            RowFilter::In { column, .. }
            | RowFilter::IsTrue { column }
            | RowFilter::CurrentMonth { column } => column,
        }
    }

    fn matches(&self, value: &Value, today: NaiveDate) -> bool {
        match self {
            RowFilter::In { values, .. } => value
                .join_key()
                .map(|k| values.iter().any(|v| v.trim().eq_ignore_ascii_case(&k)))
                .unwrap_or(false),
            RowFilter::IsTrue { .. } => value.as_bool() == Some(true),
            RowFilter::CurrentMonth { .. } => value
                .as_date()
                .map(|d| d.year() == today.year() && d.month() == today.month())
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSpec {
    /// Output table name.
    pub name: String,
    /// Table to aggregate (entity or view name).
    pub source: String,
    pub dimensions: Vec<String>,
    /// Distinct values of this column are counted.
    pub count_column: String,
    #[serde(default)]
    pub count_alias: Option<String>,
    #[serde(default)]
    pub sum_column: Option<String>,
    /// All must match for a row to be counted.
    #[serde(default)]
    pub filters: Vec<RowFilter>,
}

impl ProfileSpec {
    pub fn new(name: &str, source: &str, dimensions: &[&str], count_column: &str) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
            count_column: count_column.to_string(),
            count_alias: None,
            sum_column: None,
            filters: Vec::new(),
        }
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.count_alias = Some(alias.to_string());
        self
    }

    pub fn summing(mut self, column: &str) -> Self {
        self.sum_column = Some(column.to_string());
        self
    }

    pub fn filtered(mut self, filter: RowFilter) -> Self {
        self.filters.push(filter);
        self
    }

    fn count_name(&self) -> String {
        self.count_alias
            .clone()
            .unwrap_or_else(|| format!("cantidad_{}", self.count_column))
    }
}

/// New patients of the reference month: attended appointments whose patient
/// was first attended this month, counted once per patient.
fn new_patients_this_month(name: &str, dimensions: &[&str]) -> ProfileSpec {
    ProfileSpec::new(name, tables::CONSOLIDATED, dimensions, col::PATIENT_ID)
        .alias("pacientes_nuevos")
        .filtered(RowFilter::IsTrue {
            column: col::ATTENDED.to_string(),
        })
        .filtered(RowFilter::CurrentMonth {
            column: col::FIRST_ATTENDED_DATE.to_string(),
        })
}

pub fn default_profiles() -> Vec<ProfileSpec> {
    let mut profiles = vec![
        ProfileSpec::new(
            "perfil_pacientes_edad_sexo",
            tables::PATIENTS,
            &[col::AGE, col::SEX],
            col::PATIENT_ID,
        )
        .alias("pacientes"),
        ProfileSpec::new(
            "perfil_pacientes_sucursal_sexo",
            tables::PATIENTS,
            &[col::BRANCH_ID, col::SEX],
            col::PATIENT_ID,
        )
        .alias("pacientes"),
        ProfileSpec::new(
            "perfil_pacientes_estado_civil_sexo",
            tables::PATIENTS,
            &[col::CIVIL_STATUS, col::SEX],
            col::PATIENT_ID,
        )
        .alias("pacientes"),
        ProfileSpec::new(
            "perfil_pacientes_origen_sexo",
            tables::PATIENTS,
            &[col::ORIGIN_CATEGORY, col::SEX],
            col::PATIENT_ID,
        )
        .alias("pacientes"),
        ProfileSpec::new(
            "perfil_citas_etiqueta_sexo",
            tables::CONSOLIDATED,
            &[col::VISIT_LABEL, col::SEX],
            col::PATIENT_ID,
        )
        .alias("pacientes"),
        ProfileSpec::new(
            "perfil_citas_etiqueta_edad",
            tables::CONSOLIDATED,
            &[col::VISIT_LABEL, col::AGE],
            col::PATIENT_ID,
        )
        .alias("pacientes"),
        ProfileSpec::new(
            "perfil_presupuestos_prestacion_sexo",
            tables::BUDGET_DETAIL,
            &[col::PROCEDURE_ID, col::SEX],
            col::PATIENT_ID,
        )
        .alias("pacientes")
        .summing(col::PATIENT_PRICE),
        ProfileSpec::new(
            "perfil_pagos_sucursal_medio",
            tables::PAYMENT_TRANSACTIONS,
            &[col::BRANCH_ID, col::PAYMENT_METHOD],
            col::PAYMENT_ID,
        )
        .alias("pagos")
        .summing(col::AMOUNT_PAID),
    ];
    profiles.extend([
        new_patients_this_month(
            "perfil_pacientes_nuevos_mes_sucursal_sexo",
            &[col::BRANCH_ID, col::SEX],
        ),
        new_patients_this_month(
            "perfil_pacientes_nuevos_mes_origen_sexo",
            &[col::ORIGIN_CATEGORY, col::SEX],
        ),
        new_patients_this_month(
            "perfil_pacientes_nuevos_mes_estado_civil_sexo",
            &[col::CIVIL_STATUS, col::SEX],
        ),
        new_patients_this_month("perfil_pacientes_nuevos_mes_edad_sexo", &[col::AGE, col::SEX]),
    ]);
    profiles
}

/// Read a JSON array of profile specs.
pub fn load_profiles(path: &Path) -> Result<Vec<ProfileSpec>, PipelineError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::Configuration(format!(
            "failed to read profiles file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        PipelineError::Configuration(format!("invalid profiles JSON in {}: {}", path.display(), e))
    })
}

#[derive(Default)]
struct Group {
    /// first value seen per dimension, kept for output typing
    values: Vec<Value>,
    members: BTreeSet<String>,
    sum: Option<f64>,
}

/// Rows passing every filter, or `None` (with a warning) when a filter column
/// is missing.
fn apply_filters(
    table: &Table,
    spec: &ProfileSpec,
    today: NaiveDate,
    warnings: &mut impl WarningSink,
) -> Option<Table> {
    let mut mask = vec![true; table.row_count()];
    for filter in &spec.filters {
        let Some(values) = table.values(filter.column()) else {
            warnings.warn(
                WarningKind::Aggregation,
                format!(
                    "{}: filter column '{}' missing, profile skipped",
                    spec.name,
                    filter.column()
                ),
            );
            return None;
        };
        for (keep, value) in mask.iter_mut().zip(values) {
            *keep = *keep && filter.matches(value, today);
        }
    }
    let filtered = table.filter_rows(&mask);
    if filtered.is_empty() && !table.is_empty() {
        warnings.warn(
            WarningKind::Aggregation,
            format!("{}: no rows of '{}' pass the filters", spec.name, spec.source),
        );
    }
    Some(filtered)
}

/// Aggregate one table. Returns `None` (with a warning) when fewer than two
/// requested dimensions exist, or when the count column or a filter column is
/// missing. `today` anchors date filters.
pub fn aggregate(
    table: &Table,
    spec: &ProfileSpec,
    today: NaiveDate,
    warnings: &mut impl WarningSink,
) -> Option<Table> {
    let filtered;
    let table = if spec.filters.is_empty() {
        table
    } else {
        filtered = apply_filters(table, spec, today, warnings)?;
        &filtered
    };

    let present: Vec<&str> = spec
        .dimensions
        .iter()
        .map(String::as_str)
        .filter(|d| table.has_column(d))
        .collect();
    if present.len() < 2 {
        warnings.warn(
            WarningKind::Aggregation,
            format!(
                "{}: only {:?} of dimensions {:?} present in '{}', profile skipped",
                spec.name, present, spec.dimensions, spec.source
            ),
        );
        return None;
    }
    if present.len() < spec.dimensions.len() {
        warnings.warn(
            WarningKind::Aggregation,
            format!("{}: grouping by {:?} only, other dimensions missing", spec.name, present),
        );
    }
    let Some(counted) = table.values(&spec.count_column) else {
        warnings.warn(
            WarningKind::Aggregation,
            format!(
                "{}: count column '{}' missing, profile skipped",
                spec.name, spec.count_column
            ),
        );
        return None;
    };
    let summed = match &spec.sum_column {
        Some(column) => {
            let values = table.values(column);
            if values.is_none() {
                warnings.warn(
                    WarningKind::Aggregation,
                    format!("{}: sum column '{}' missing, totals left null", spec.name, column),
                );
            }
            values
        }
        None => None,
    };

    let dimension_values: Vec<&[Value]> = present
        .iter()
        .map(|d| table.values(d).unwrap_or(&[]))
        .collect();

    // group key: join key per dimension, None for null
    let mut groups: BTreeMap<Vec<Option<String>>, Group> = BTreeMap::new();
    for row in 0..table.row_count() {
        let key: Vec<Option<String>> = dimension_values
            .iter()
            .map(|values| values.get(row).and_then(Value::join_key))
            .collect();
        let group = groups.entry(key).or_insert_with(|| Group {
            values: dimension_values
                .iter()
                .map(|values| values.get(row).cloned().unwrap_or(Value::Null))
                .collect(),
            ..Default::default()
        });
        if let Some(member) = counted.get(row).and_then(Value::join_key) {
            group.members.insert(member);
        }
        if let Some(amount) = summed.and_then(|s| s.get(row)).and_then(Value::as_f64) {
            group.sum = Some(group.sum.unwrap_or(0.0) + amount);
        }
    }

    let total: usize = groups.values().map(|g| g.members.len()).sum();
    let mut ordered: Vec<(Vec<Option<String>>, Group)> = groups.into_iter().collect();
    // count desc, then group key asc (already key-sorted, sort is stable)
    ordered.sort_by(|a, b| b.1.members.len().cmp(&a.1.members.len()));

    let mut columns: Vec<Column> = present.iter().map(|d| Column::new(*d, Vec::new())).collect();
    let mut counts = Vec::with_capacity(ordered.len());
    let mut sums = Vec::with_capacity(ordered.len());
    let mut shares = Vec::with_capacity(ordered.len());
    for (_, group) in ordered {
        for (column, value) in columns.iter_mut().zip(group.values) {
            column.values.push(normalize_null(value));
        }
        let count = group.members.len();
        counts.push(Value::Int(count as i64));
        sums.push(group.sum.map(Value::Float).unwrap_or(Value::Null));
        let share = if total == 0 {
            0.0
        } else {
            (count as f64 * 10_000.0 / total as f64).round() / 100.0
        };
        shares.push(Value::Float(share));
    }

    columns.push(Column::new(spec.count_name(), counts));
    if spec.sum_column.is_some() {
        columns.push(Column::new(SUM_ALIAS, sums));
    }
    columns.push(Column::new(SHARE_ALIAS, shares));
    Some(Table::from(columns))
}

fn normalize_null(value: Value) -> Value {
    if value.is_null() {
        Value::Null
    } else {
        value
    }
}

/// Build every profile whose source table exists.
pub fn build_profiles(
    sources: &NamedTables,
    specs: &[ProfileSpec],
    today: NaiveDate,
    warnings: &mut impl WarningSink,
) -> NamedTables {
    let mut profiles = NamedTables::new();
    for spec in specs {
        let Some(table) = sources.get(&spec.source) else {
            warnings.warn(
                WarningKind::Aggregation,
                format!(
                    "{}: source table '{}' not produced, profile skipped",
                    spec.name, spec.source
                ),
            );
            continue;
        };
        if let Some(profile) = aggregate(table, spec, today, warnings) {
            tracing::info!(profile = %spec.name, groups = profile.row_count(), "profile built");
            profiles.insert(spec.name.clone(), profile);
        }
    }
    profiles
}
