//! Payment lines -> transactions (one row per payment) and applications (one
//! row per line allocated to a budget detail).

use std::collections::HashMap;

use crate::schema::col;
use crate::table::{Column, Table, Value};
use crate::warnings::{WarningKind, WarningSink};

/// Summed per transaction.
const AMOUNT_COLUMNS: &[&str] = &[col::AMOUNT_PAID, col::AMOUNT_RETURNED];

/// Line-level columns that only belong in the applications table.
const APPLICATION_COLUMNS: &[&str] = &[col::BUDGET_DETAIL_ID, col::AMOUNT_APPLIED];

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentTables {
    pub transactions: Table,
    pub applications: Table,
}

/// Group payment lines by `pago_id`. Returns `None` when there is no
/// `pago_id` column to group on.
pub fn split_payments(lines: &Table, warnings: &mut impl WarningSink) -> Option<PaymentTables> {
    let Some(ids) = lines.values(col::PAYMENT_ID) else {
        warnings.warn(
            WarningKind::Enrichment,
            format!("payments: no '{}' column, payment tables not built", col::PAYMENT_ID),
        );
        return None;
    };

    // groups in order of first appearance
    let mut group_of: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut orphan_rows = 0usize;
    for (row, id) in ids.iter().enumerate() {
        let Some(key) = id.join_key() else {
            orphan_rows += 1;
            continue;
        };
        let next = groups.len();
        let group = *group_of.entry(key).or_insert(next);
        if group == next {
            groups.push(Vec::new());
        }
        groups[group].push(row);
    }
    if orphan_rows > 0 {
        warnings.warn(
            WarningKind::Enrichment,
            format!("payments: {} lines without '{}' ignored", orphan_rows, col::PAYMENT_ID),
        );
    }

    let transactions = build_transactions(lines, &groups);
    let applications = build_applications(lines, &groups, warnings);
    tracing::info!(
        lines = lines.row_count(),
        transactions = transactions.row_count(),
        "payments grouped"
    );
    Some(PaymentTables {
        transactions,
        applications,
    })
}

fn first_non_null(values: &[Value], rows: &[usize]) -> Value {
    rows.iter()
        .filter_map(|r| values.get(*r))
        .find(|v| !v.is_null())
        .cloned()
        .unwrap_or(Value::Null)
}

fn sum_of(values: &[Value], rows: &[usize]) -> Value {
    let numbers: Vec<f64> = rows
        .iter()
        .filter_map(|r| values.get(*r))
        .filter_map(Value::as_f64)
        .collect();
    if numbers.is_empty() {
        Value::Null
    } else {
        Value::Float(numbers.iter().sum())
    }
}

fn build_transactions(lines: &Table, groups: &[Vec<usize>]) -> Table {
    let mut columns: Vec<Column> = Vec::new();
    for column in lines.columns() {
        if APPLICATION_COLUMNS.contains(&column.name.as_str()) {
            continue;
        }
        let values = groups
            .iter()
            .map(|rows| {
                if AMOUNT_COLUMNS.contains(&column.name.as_str()) {
                    sum_of(&column.values, rows)
                } else {
                    first_non_null(&column.values, rows)
                }
            })
            .collect();
        columns.push(Column::new(column.name.clone(), values));
    }
    // pago_id leads
    if let Some(pos) = columns.iter().position(|c| c.name == col::PAYMENT_ID) {
        let id = columns.remove(pos);
        columns.insert(0, id);
    }
    columns.push(Column::new(
        col::PAYMENT_LINES,
        groups.iter().map(|rows| Value::Int(rows.len() as i64)).collect(),
    ));
    Table::from(columns)
}

fn build_applications(
    lines: &Table,
    groups: &[Vec<usize>],
    warnings: &mut impl WarningSink,
) -> Table {
    let missing: Vec<&str> = APPLICATION_COLUMNS
        .iter()
        .copied()
        .filter(|c| !lines.has_column(c))
        .collect();
    if !missing.is_empty() {
        warnings.warn(
            WarningKind::Enrichment,
            format!("payments: application columns {:?} missing, filled with nulls", missing),
        );
    }

    let mut ids = Vec::new();
    let mut line_numbers = Vec::new();
    let mut rows_in_order = Vec::new();
    for rows in groups {
        for (n, row) in rows.iter().enumerate() {
            ids.push(lines.get(*row, col::PAYMENT_ID).cloned().unwrap_or(Value::Null));
            line_numbers.push(Value::Int(n as i64 + 1));
            rows_in_order.push(*row);
        }
    }

    let mut applications = Table::from(vec![
        Column::new(col::PAYMENT_ID, ids),
        Column::new(col::LINE_NUMBER, line_numbers),
    ]);
    for name in APPLICATION_COLUMNS {
        let values = rows_in_order
            .iter()
            .map(|r| lines.get(*r, name).cloned().unwrap_or(Value::Null))
            .collect();
        applications.set_column(name, values);
    }
    applications
}
