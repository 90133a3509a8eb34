//! Per-entity enrichment.
//!
//! Missing optional columns never abort: they are replaced by null columns and
//! reported as enrichment warnings. Only a missing patient table is fatal.

pub mod appointment;
pub mod budget;
pub mod patient;
pub mod payment;

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;

use crate::error::PipelineError;
use crate::loader::LoadedEntities;
use crate::schema::{col, EntityKind};
use crate::table::{NamedTables, Table, Value};
use crate::warnings::{WarningKind, WarningSink};

pub use appointment::{classify_visit, enrich_appointments, VisitLabel};
pub use budget::enrich_budgets;
pub use patient::{age_on, enrich_patients};
pub use payment::{split_payments, PaymentTables};

/// Enriched entities ready for joining and persistence.
#[derive(Debug, Clone, Default)]
pub struct EnrichedEntities {
    pub patients: Table,
    pub appointments: Option<Table>,
    pub budgets: Option<Table>,
    pub payments: Option<PaymentTables>,
    pub expenses: Option<Table>,
    pub dimensions: BTreeMap<EntityKind, Table>,
}

impl EnrichedEntities {
    pub fn dimension(&self, kind: EntityKind) -> Option<&Table> {
        self.dimensions.get(&kind)
    }

    /// Every entity table under its output name.
    pub fn into_named(self) -> NamedTables {
        let mut named = NamedTables::new();
        named.insert(EntityKind::Patient.table_name().to_string(), self.patients);
        if let Some(t) = self.appointments {
            named.insert(EntityKind::Appointment.table_name().to_string(), t);
        }
        if let Some(t) = self.budgets {
            named.insert(EntityKind::Budget.table_name().to_string(), t);
        }
        if let Some(p) = self.payments {
            named.insert(crate::schema::tables::PAYMENT_TRANSACTIONS.to_string(), p.transactions);
            named.insert(crate::schema::tables::PAYMENT_APPLICATIONS.to_string(), p.applications);
        }
        if let Some(t) = self.expenses {
            named.insert(EntityKind::Expense.table_name().to_string(), t);
        }
        for (kind, table) in self.dimensions {
            named.insert(kind.table_name().to_string(), table);
        }
        named
    }
}

/// Enrich every loaded entity. Fails only when patients are unusable.
pub fn enrich_all(
    mut loaded: LoadedEntities,
    today: NaiveDate,
    warnings: &mut impl WarningSink,
) -> Result<EnrichedEntities, PipelineError> {
    let Some(raw_patients) = loaded.take(EntityKind::Patient) else {
        return Err(PipelineError::FatalData(
            "no patient table was loaded; check that a 'pacientes' file and its index rows are present"
                .to_string(),
        ));
    };
    if !raw_patients.has_column(col::PATIENT_ID) {
        return Err(PipelineError::FatalData(format!(
            "patient table has no '{}' column (found {:?})",
            col::PATIENT_ID,
            raw_patients.column_names()
        )));
    }

    let mut dimensions = BTreeMap::new();
    for kind in EntityKind::ALL.iter().filter(|k| k.is_dimension()) {
        if let Some(table) = loaded.take(*kind) {
            dimensions.insert(*kind, table);
        }
    }

    let patients = enrich_patients(
        raw_patients,
        dimensions.get(&EntityKind::PatientType),
        today,
        warnings,
    );
    let appointments = loaded
        .take(EntityKind::Appointment)
        .map(|t| enrich_appointments(t, today, warnings));
    let budgets = loaded.take(EntityKind::Budget).map(|t| enrich_budgets(t, warnings));
    let payments = loaded
        .take(EntityKind::Payment)
        .and_then(|t| split_payments(&t, warnings));
    let expenses = loaded.take(EntityKind::Expense).map(enrich_expenses);

    Ok(EnrichedEntities {
        patients,
        appointments,
        budgets,
        payments,
        expenses,
        dimensions,
    })
}

/// Expenses pass through with a synthetic 1-based `gasto_id`.
pub fn enrich_expenses(mut expenses: Table) -> Table {
    let ids = (1..=expenses.row_count() as i64).map(Value::Int).collect();
    expenses.set_column(col::EXPENSE_ID, ids);
    expenses
}

/// Add a null column when `column` is absent, with an enrichment warning.
/// Returns whether the column was already there.
pub(crate) fn require_column(
    table: &mut Table,
    column: &str,
    entity: &str,
    warnings: &mut impl WarningSink,
) -> bool {
    if table.has_column(column) {
        return true;
    }
    warnings.warn(
        WarningKind::Enrichment,
        format!("{}: column '{}' missing, filled with nulls", entity, column),
    );
    table.ensure_column(column);
    false
}

/// Keep the first row for each non-null key. Rows with a null key are kept.
pub(crate) fn dedupe_on(
    table: Table,
    key: &str,
    entity: &str,
    warnings: &mut impl WarningSink,
) -> Table {
    let Some(values) = table.values(key) else {
        return table;
    };
    let mut seen = HashSet::new();
    let mask: Vec<bool> = values
        .iter()
        .map(|v| match v.join_key() {
            Some(k) => seen.insert(k),
            None => true,
        })
        .collect();
    let removed = mask.iter().filter(|keep| !**keep).count();
    if removed == 0 {
        return table;
    }
    warnings.warn(
        WarningKind::Enrichment,
        format!("{}: removed {} duplicate rows on '{}'", entity, removed, key),
    );
    table.filter_rows(&mask)
}

/// Replace a column's values with parsed dates where they parse; anything
/// unparseable becomes null.
pub(crate) fn coerce_dates(table: &mut Table, column: &str) {
    if let Some(values) = table.values(column) {
        let parsed = values
            .iter()
            .map(|v| v.as_date().map(Value::Date).unwrap_or(Value::Null))
            .collect();
        table.set_column(column, parsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warnings::WarningLog;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
    }

    #[test]
    fn test_missing_patients_is_fatal() {
        let mut loaded = LoadedEntities::default();
        loaded.entities.insert(
            EntityKind::Appointment,
            Table::from_rows(vec![col::APPOINTMENT_ID.into()], vec![vec![Value::Int(1)]]),
        );
        let err = enrich_all(loaded, today(), &mut WarningLog::new()).unwrap_err();
        assert!(matches!(err, PipelineError::FatalData(_)));
    }

    #[test]
    fn test_patient_table_without_id_is_fatal() {
        let mut loaded = LoadedEntities::default();
        loaded.entities.insert(
            EntityKind::Patient,
            Table::from_rows(vec![col::SEX.into()], vec![vec![Value::text("F")]]),
        );
        assert!(enrich_all(loaded, today(), &mut WarningLog::new()).is_err());
    }

    #[test]
    fn test_expenses_get_sequential_ids() {
        let t = Table::from_rows(
            vec!["monto".into()],
            vec![vec![Value::Int(10)], vec![Value::Int(20)]],
        );
        let out = enrich_expenses(t);
        assert_eq!(out.values(col::EXPENSE_ID).unwrap(), &[Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_dedupe_keeps_first_and_null_keys() {
        let t = Table::from_rows(
            vec!["id".into(), "v".into()],
            vec![
                vec![Value::Int(1), Value::text("a")],
                vec![Value::Float(1.0), Value::text("b")],
                vec![Value::Null, Value::text("c")],
                vec![Value::Null, Value::text("d")],
            ],
        );
        let mut log = WarningLog::new();
        let out = dedupe_on(t, "id", "test", &mut log);
        assert_eq!(out.row_count(), 3);
        assert_eq!(out.get(0, "v"), Some(&Value::text("a")));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_dimensions_pass_through_to_named_output() {
        let mut loaded = LoadedEntities::default();
        loaded.entities.insert(
            EntityKind::Patient,
            Table::from_rows(vec![col::PATIENT_ID.into()], vec![vec![Value::Int(1)]]),
        );
        loaded.entities.insert(
            EntityKind::Branch,
            Table::from_rows(vec![col::BRANCH_ID.into()], vec![vec![Value::Int(3)]]),
        );
        let enriched = enrich_all(loaded, today(), &mut WarningLog::new()).unwrap();
        let named = enriched.into_named();
        assert!(named.contains_key("dimension_sucursales"));
        assert!(named.contains_key("hechos_pacientes"));
    }
}
