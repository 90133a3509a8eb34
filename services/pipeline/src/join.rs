//! Left joins between enriched entities and the consolidated views built
//! from them.

use std::collections::{BTreeSet, HashMap};

use crate::enrich::EnrichedEntities;
use crate::schema::{col, tables, EntityKind};
use crate::table::{Column, NamedTables, Table};
use crate::warnings::{WarningKind, WarningSink};

/// The right side of a join: the table and the label used to suffix its
/// colliding columns.
#[derive(Debug, Clone, Copy)]
pub struct JoinSide<'a> {
    pub table: &'a Table,
    pub label: &'a str,
}

impl<'a> JoinSide<'a> {
    pub fn new(table: &'a Table, label: &'a str) -> Self {
        Self { table, label }
    }
}

/// A view being built by successive joins. Each column remembers the label of
/// the entity it came from, so later collisions are suffixed with the right
/// source.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    label: String,
    table: Table,
    /// parallel to `table.columns()`
    origins: Vec<String>,
}

impl View {
    pub fn new(table: Table, label: &str) -> Self {
        let origins = vec![label.to_string(); table.columns().len()];
        Self {
            label: label.to_string(),
            table,
            origins,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Label of the entity a column came from.
    pub fn origin(&self, column: &str) -> Option<&str> {
        self.table
            .columns()
            .iter()
            .position(|c| c.name == column)
            .map(|i| self.origins[i].as_str())
    }

    pub fn into_table(self) -> Table {
        self.table
    }
}

/// Left join on `key`. The output has exactly the left side's rows in order.
/// Non-key columns present on both sides are renamed `<name>_<origin>` on each
/// side; any name still repeated afterwards gets `_2`, `_3`, ... When the
/// right side repeats a key, the first row wins.
pub fn left_join(
    left: &View,
    right: JoinSide<'_>,
    key: &str,
    warnings: &mut impl WarningSink,
) -> View {
    let mut first_row: HashMap<String, usize> = HashMap::new();
    let mut repeated = 0usize;
    for (row, value) in right.table.values(key).unwrap_or(&[]).iter().enumerate() {
        if let Some(k) = value.join_key() {
            if first_row.contains_key(&k) {
                repeated += 1;
            } else {
                first_row.insert(k, row);
            }
        }
    }
    if repeated > 0 {
        warnings.warn(
            WarningKind::Join,
            format!(
                "{} ⟕ {}: {} repeated '{}' keys on the right side, first match used",
                left.label, right.label, repeated, key
            ),
        );
    }

    let matches: Vec<Option<usize>> = left
        .table
        .values(key)
        .unwrap_or(&[])
        .iter()
        .map(|v| v.join_key().and_then(|k| first_row.get(&k).copied()))
        .collect();

    let collides = |name: &str, other: &Table| name != key && other.has_column(name);

    let width = left.origins.len() + right.table.columns().len();
    let mut columns: Vec<Column> = Vec::with_capacity(width);
    let mut origins: Vec<String> = Vec::with_capacity(width);
    for (c, origin) in left.table.columns().iter().zip(&left.origins) {
        let name = if collides(&c.name, right.table) {
            format!("{}_{}", c.name, origin)
        } else {
            c.name.clone()
        };
        columns.push(Column::new(name, c.values.clone()));
        origins.push(origin.clone());
    }

    for c in right.table.take_rows(&matches).into_columns() {
        if c.name == key {
            continue;
        }
        let name = if collides(&c.name, &left.table) {
            format!("{}_{}", c.name, right.label)
        } else {
            c.name
        };
        columns.push(Column::new(name, c.values));
        origins.push(right.label.to_string());
    }

    dedupe_names(&mut columns, &left.label, right.label, warnings);
    View {
        label: left.label.clone(),
        table: Table::from(columns),
        origins,
    }
}

fn dedupe_names(columns: &mut [Column], left: &str, right: &str, warnings: &mut impl WarningSink) {
    let mut used: BTreeSet<String> = BTreeSet::new();
    for column in columns.iter_mut() {
        if used.contains(&column.name) {
            let base = column.name.clone();
            let mut n = 2;
            while used.contains(&format!("{}_{}", base, n)) {
                n += 1;
            }
            column.name = format!("{}_{}", base, n);
            warnings.warn(
                WarningKind::Join,
                format!(
                    "{} ⟕ {}: column '{}' already taken; stored as '{}'",
                    left, right, base, column.name
                ),
            );
        }
        used.insert(column.name.clone());
    }
}

/// Join when both sides and the key are there; otherwise keep `left` as is and
/// record which enrichment could not happen.
pub fn join_if_possible(
    view_name: &str,
    left: View,
    right: Option<&Table>,
    right_label: &str,
    key: &str,
    warnings: &mut impl WarningSink,
) -> View {
    let Some(right) = right else {
        warnings.warn(
            WarningKind::Join,
            format!("{}: no {} table, join on '{}' skipped", view_name, right_label, key),
        );
        return left;
    };
    let missing_on = if !left.table.has_column(key) {
        Some(left.label.as_str())
    } else if !right.has_column(key) {
        Some(right_label)
    } else {
        None
    };
    if let Some(label) = missing_on {
        warnings.warn(
            WarningKind::Join,
            format!("{}: {} has no '{}' column, join skipped", view_name, label, key),
        );
        return left;
    }
    left_join(&left, JoinSide::new(right, right_label), key, warnings)
}

/// Build every consolidated view the enriched entities allow.
pub fn build_views(entities: &EnrichedEntities, warnings: &mut impl WarningSink) -> NamedTables {
    let mut views = NamedTables::new();
    let patients = Some(&entities.patients);
    let appointment = EntityKind::Appointment.label();

    match &entities.appointments {
        Some(appointments) => {
            let mut view = View::new(appointments.clone(), appointment);
            for (kind, key) in [
                (EntityKind::Branch, col::BRANCH_ID),
                (EntityKind::Treatment, col::TREATMENT_ID),
            ] {
                view = join_if_possible(
                    tables::CONSOLIDATED,
                    view,
                    entities.dimension(kind),
                    kind.label(),
                    key,
                    warnings,
                );
            }
            view = join_if_possible(
                tables::CONSOLIDATED,
                view,
                patients,
                EntityKind::Patient.label(),
                col::PATIENT_ID,
                warnings,
            );
            views.insert(tables::CONSOLIDATED.to_string(), view.into_table());
        }
        None => warnings.warn(
            WarningKind::Join,
            format!("{}: no appointment table, view not built", tables::CONSOLIDATED),
        ),
    }

    match &entities.budgets {
        Some(budgets) => {
            let view = join_if_possible(
                tables::BUDGET_DETAIL,
                View::new(budgets.clone(), EntityKind::Budget.label()),
                entities.dimension(EntityKind::Procedure),
                EntityKind::Procedure.label(),
                col::PROCEDURE_ID,
                warnings,
            );
            let view = join_if_possible(
                tables::BUDGET_DETAIL,
                view,
                patients,
                EntityKind::Patient.label(),
                col::PATIENT_ID,
                warnings,
            );
            views.insert(tables::BUDGET_DETAIL.to_string(), view.into_table());
        }
        None => warnings.warn(
            WarningKind::Join,
            format!("{}: no budget table, view not built", tables::BUDGET_DETAIL),
        ),
    }

    match &entities.payments {
        Some(payments) => {
            let view = join_if_possible(
                tables::PAYMENT_APPLICATION_DETAIL,
                View::new(payments.applications.clone(), "aplicacion"),
                Some(&payments.transactions),
                EntityKind::Payment.label(),
                col::PAYMENT_ID,
                warnings,
            );
            views.insert(tables::PAYMENT_APPLICATION_DETAIL.to_string(), view.into_table());
        }
        None => warnings.warn(
            WarningKind::Join,
            format!("{}: no payment table, view not built", tables::PAYMENT_APPLICATION_DETAIL),
        ),
    }

    for (name, view) in &views {
        tracing::info!(
            view = %name,
            rows = view.row_count(),
            columns = view.columns().len(),
            "view built"
        );
    }
    views
}
