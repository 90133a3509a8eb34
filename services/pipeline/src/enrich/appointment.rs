//! Appointment enrichment and per-visit labeling.

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use super::{coerce_dates, dedupe_on, require_column};
use crate::schema::col;
use crate::table::{Table, Value};
use crate::warnings::{WarningKind, WarningSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VisitLabel {
    NewScheduled,
    NewAttended,
    NewMissed,
    RecurringSameMonthAttended,
    RecurringSameMonthMissed,
    RecurringScheduled,
    RecurringAttended,
    RecurringMissed,
    Indeterminate,
}

impl VisitLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitLabel::NewScheduled => "New-Scheduled",
            VisitLabel::NewAttended => "New-Attended",
            VisitLabel::NewMissed => "New-Missed",
            VisitLabel::RecurringSameMonthAttended => "Recurring-SameMonthAttended",
            VisitLabel::RecurringSameMonthMissed => "Recurring-SameMonthMissed",
            VisitLabel::RecurringScheduled => "Recurring-Scheduled",
            VisitLabel::RecurringAttended => "Recurring-Attended",
            VisitLabel::RecurringMissed => "Recurring-Missed",
            VisitLabel::Indeterminate => "Indeterminate",
        }
    }
}

/// Label one appointment. First matching rule wins.
pub fn classify_visit(
    date: Option<NaiveDate>,
    first_attended: Option<NaiveDate>,
    attended: bool,
    today: NaiveDate,
) -> VisitLabel {
    let Some(date) = date else {
        return VisitLabel::Indeterminate;
    };

    let is_new = first_attended.map_or(true, |first| date == first);
    if is_new {
        return if date >= today {
            VisitLabel::NewScheduled
        } else if attended {
            VisitLabel::NewAttended
        } else {
            VisitLabel::NewMissed
        };
    }

    match first_attended {
        Some(first) if date > first => {
            let same_month = date.year() == first.year() && date.month() == first.month();
            match (same_month, date >= today, attended) {
                (true, _, true) => VisitLabel::RecurringSameMonthAttended,
                (true, _, false) => VisitLabel::RecurringSameMonthMissed,
                (false, true, _) => VisitLabel::RecurringScheduled,
                (false, false, true) => VisitLabel::RecurringAttended,
                (false, false, false) => VisitLabel::RecurringMissed,
            }
        }
        _ => VisitLabel::Indeterminate,
    }
}

/// Drop duplicated rows, compute each patient's first attended date, label
/// every visit and derive the duration in minutes when times are present.
pub fn enrich_appointments(
    appointments: Table,
    today: NaiveDate,
    warnings: &mut impl WarningSink,
) -> Table {
    let mut appointments = remove_flagged_duplicates(appointments, warnings);
    appointments = dedupe_on(appointments, col::APPOINTMENT_ID, "appointments", warnings);

    require_column(&mut appointments, col::PATIENT_ID, "appointments", warnings);
    require_column(&mut appointments, col::ATTENDED, "appointments", warnings);
    if require_column(&mut appointments, col::APPOINTMENT_DATE, "appointments", warnings) {
        coerce_dates(&mut appointments, col::APPOINTMENT_DATE);
    }
    if appointments.has_column(col::CREATION_DATE) {
        coerce_dates(&mut appointments, col::CREATION_DATE);
    }

    let rows = appointments.row_count();
    let patients = appointments.values(col::PATIENT_ID).unwrap_or(&[]);
    let dates: Vec<Option<NaiveDate>> = appointments
        .values(col::APPOINTMENT_DATE)
        .unwrap_or(&[])
        .iter()
        .map(Value::as_date)
        .collect();
    let attended: Vec<bool> = appointments
        .values(col::ATTENDED)
        .unwrap_or(&[])
        .iter()
        .map(|v| v.as_bool().unwrap_or(false))
        .collect();

    let mut first_attended: HashMap<String, NaiveDate> = HashMap::new();
    for row in 0..rows {
        let patient = patients.get(row).and_then(Value::join_key);
        let (Some(patient), Some(date)) = (patient, dates[row]) else {
            continue;
        };
        if attended[row] {
            first_attended
                .entry(patient)
                .and_modify(|first| *first = (*first).min(date))
                .or_insert(date);
        }
    }

    let mut firsts = Vec::with_capacity(rows);
    let mut labels = Vec::with_capacity(rows);
    for row in 0..rows {
        let first = patients
            .get(row)
            .and_then(Value::join_key)
            .and_then(|k| first_attended.get(&k).copied());
        let label = classify_visit(dates[row], first, attended[row], today);
        firsts.push(first.map(Value::Date).unwrap_or(Value::Null));
        labels.push(Value::text(label.as_str()));
    }
    appointments.set_column(col::FIRST_ATTENDED_DATE, firsts);
    appointments.set_column(col::VISIT_LABEL, labels);

    attach_duration(&mut appointments, warnings);
    appointments
}

fn remove_flagged_duplicates(appointments: Table, warnings: &mut impl WarningSink) -> Table {
    if !appointments.has_column(col::DUPLICATE) {
        warnings.warn(
            WarningKind::Enrichment,
            format!("appointments: no '{}' column, no rows filtered", col::DUPLICATE),
        );
        return appointments;
    }
    let flags = appointments.values(col::DUPLICATE).unwrap_or(&[]);
    let mask: Vec<bool> = flags.iter().map(|v| v.as_bool() != Some(true)).collect();
    let removed = mask.iter().filter(|keep| !**keep).count();
    if removed == 0 {
        return appointments;
    }
    tracing::info!(removed, "appointments flagged as duplicates removed");
    appointments.filter_rows(&mask)
}

fn attach_duration(appointments: &mut Table, warnings: &mut impl WarningSink) {
    let (Some(starts), Some(ends)) = (
        appointments.values(col::START_TIME),
        appointments.values(col::END_TIME),
    ) else {
        warnings.warn(
            WarningKind::Enrichment,
            format!(
                "appointments: '{}'/'{}' not both present, duration omitted",
                col::START_TIME,
                col::END_TIME
            ),
        );
        return;
    };

    let durations = starts
        .iter()
        .zip(ends)
        .map(|(start, end)| match (start.as_time(), end.as_time()) {
            (Some(s), Some(e)) if e >= s => Value::Int((e - s).num_minutes()),
            _ => Value::Null,
        })
        .collect();
    appointments.set_column(col::DURATION_MINUTES, durations);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warnings::WarningLog;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // -------------------------------------------------------------------------
    // CLASSIFICATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_first_and_recurring_attended() {
        let today = date(2024, 6, 1);
        let first = Some(date(2024, 1, 10));
        assert_eq!(
            classify_visit(Some(date(2024, 1, 10)), first, true, today),
            VisitLabel::NewAttended
        );
        assert_eq!(
            classify_visit(Some(date(2024, 2, 10)), first, true, today),
            VisitLabel::RecurringAttended
        );
    }

    #[test]
    fn test_only_future_appointment_is_new_scheduled() {
        let today = date(2024, 6, 1);
        assert_eq!(
            classify_visit(Some(date(2024, 7, 1)), None, false, today),
            VisitLabel::NewScheduled
        );
    }

    #[test]
    fn test_never_attended_past_is_new_missed() {
        let today = date(2024, 6, 1);
        assert_eq!(
            classify_visit(Some(date(2024, 5, 1)), None, false, today),
            VisitLabel::NewMissed
        );
    }

    #[test]
    fn test_same_month_recurring() {
        let today = date(2024, 6, 1);
        let first = Some(date(2024, 3, 2));
        assert_eq!(
            classify_visit(Some(date(2024, 3, 20)), first, false, today),
            VisitLabel::RecurringSameMonthMissed
        );
        assert_eq!(
            classify_visit(Some(date(2024, 3, 20)), first, true, today),
            VisitLabel::RecurringSameMonthAttended
        );
    }

    #[test]
    fn test_recurring_future_and_missed() {
        let today = date(2024, 6, 1);
        let first = Some(date(2024, 1, 10));
        assert_eq!(
            classify_visit(Some(date(2024, 8, 1)), first, false, today),
            VisitLabel::RecurringScheduled
        );
        assert_eq!(
            classify_visit(Some(date(2024, 4, 1)), first, false, today),
            VisitLabel::RecurringMissed
        );
    }

    #[test]
    fn test_before_first_attended_or_undated_is_indeterminate() {
        let today = date(2024, 6, 1);
        let first = Some(date(2024, 3, 1));
        assert_eq!(
            classify_visit(Some(date(2024, 2, 1)), first, false, today),
            VisitLabel::Indeterminate
        );
        assert_eq!(classify_visit(None, first, true, today), VisitLabel::Indeterminate);
    }

    // -------------------------------------------------------------------------
    // ENRICHMENT
    // -------------------------------------------------------------------------

    fn appointments() -> Table {
        let header = [
            col::APPOINTMENT_ID,
            col::PATIENT_ID,
            col::APPOINTMENT_DATE,
            col::ATTENDED,
            col::DUPLICATE,
            col::START_TIME,
            col::END_TIME,
        ];
        let rows = vec![
            vec![
                Value::Int(1),
                Value::Int(7),
                Value::text("2024-02-10"),
                Value::text("Sí"),
                Value::text("No"),
                Value::text("09:00"),
                Value::text("09:45"),
            ],
            vec![
                Value::Int(2),
                Value::Int(7),
                Value::text("2024-01-10"),
                Value::Bool(true),
                Value::Bool(false),
                Value::text("10:00"),
                Value::Null,
            ],
            vec![
                Value::Int(3),
                Value::Int(7),
                Value::text("2024-01-05"),
                Value::Bool(true),
                Value::Bool(true),
                Value::Null,
                Value::Null,
            ],
            vec![
                Value::Int(4),
                Value::Int(8),
                Value::text("2024-07-01"),
                Value::Bool(false),
                Value::Bool(false),
                Value::Null,
                Value::Null,
            ],
        ];
        Table::from_rows(header.iter().map(|h| h.to_string()).collect(), rows)
    }

    #[test]
    fn test_enrich_labels_and_first_attended() {
        let mut log = WarningLog::new();
        let out = enrich_appointments(appointments(), date(2024, 6, 1), &mut log);

        // the flagged duplicate (2024-01-05) is removed before computing first dates
        assert_eq!(out.row_count(), 3);
        assert_eq!(out.get(0, col::VISIT_LABEL), Some(&Value::text("Recurring-Attended")));
        assert_eq!(out.get(1, col::VISIT_LABEL), Some(&Value::text("New-Attended")));
        assert_eq!(out.get(2, col::VISIT_LABEL), Some(&Value::text("New-Scheduled")));
        assert_eq!(out.get(0, col::FIRST_ATTENDED_DATE), Some(&Value::Date(date(2024, 1, 10))));
        assert_eq!(out.get(2, col::FIRST_ATTENDED_DATE), Some(&Value::Null));
        assert_eq!(out.get(0, col::DURATION_MINUTES), Some(&Value::Int(45)));
        assert_eq!(out.get(1, col::DURATION_MINUTES), Some(&Value::Null));
        assert!(log.is_empty());
    }

    #[test]
    fn test_missing_time_columns_omit_duration() {
        let t = Table::from_rows(
            vec![
                col::PATIENT_ID.into(),
                col::APPOINTMENT_DATE.into(),
                col::ATTENDED.into(),
                col::DUPLICATE.into(),
            ],
            vec![vec![
                Value::Int(1),
                Value::text("2024-01-01"),
                Value::Bool(true),
                Value::Bool(false),
            ]],
        );
        let mut log = WarningLog::new();
        let out = enrich_appointments(t, date(2024, 6, 1), &mut log);
        assert!(!out.has_column(col::DURATION_MINUTES));
        assert_eq!(log.of_kind(WarningKind::Enrichment).count(), 1);
    }
}
