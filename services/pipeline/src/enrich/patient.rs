use std::collections::HashMap;

use chrono::NaiveDate;

use super::{coerce_dates, dedupe_on, require_column};
use crate::schema::col;
use crate::table::{whole_years_between, Table, Value};
use crate::warnings::{WarningKind, WarningSink};

const MAX_AGE: i64 = 120;

/// Age in whole years on `today`; `None` when outside `[0, 120]`.
pub fn age_on(birth: NaiveDate, today: NaiveDate) -> Option<i64> {
    let years = whole_years_between(birth, today);
    (0..=MAX_AGE).contains(&years).then_some(years)
}

/// Deduplicate on patient id, compute `edad` and look up `categoria_origen`.
pub fn enrich_patients(
    patients: Table,
    patient_types: Option<&Table>,
    today: NaiveDate,
    warnings: &mut impl WarningSink,
) -> Table {
    let mut patients = dedupe_on(patients, col::PATIENT_ID, "patients", warnings);
    require_column(&mut patients, col::SEX, "patients", warnings);
    require_column(&mut patients, col::BRANCH_ID, "patients", warnings);

    if require_column(&mut patients, col::BIRTH_DATE, "patients", warnings) {
        coerce_dates(&mut patients, col::BIRTH_DATE);
    }
    let mut out_of_range = 0usize;
    let ages: Vec<Value> = patients
        .values(col::BIRTH_DATE)
        .unwrap_or(&[])
        .iter()
        .map(|v| match v.as_date() {
            Some(birth) => match age_on(birth, today) {
                Some(age) => Value::Int(age),
                None => {
                    out_of_range += 1;
                    Value::Null
                }
            },
            None => Value::Null,
        })
        .collect();
    if out_of_range > 0 {
        warnings.warn(
            WarningKind::Enrichment,
            format!("patients: {} ages outside 0..={} set to null", out_of_range, MAX_AGE),
        );
    }
    patients.set_column(col::AGE, ages);

    attach_origin_category(&mut patients, patient_types, warnings);
    patients
}

fn attach_origin_category(
    patients: &mut Table,
    patient_types: Option<&Table>,
    warnings: &mut impl WarningSink,
) {
    let lookup = match patient_types {
        Some(types) => match (
            types.values(col::PATIENT_TYPE_ID),
            types.values(col::ORIGIN_CATEGORY),
        ) {
            (Some(ids), Some(categories)) => Some(
                ids.iter()
                    .zip(categories)
                    .filter_map(|(id, cat)| id.join_key().map(|k| (k, cat.clone())))
                    .fold(HashMap::new(), |mut map, (k, cat)| {
                        map.entry(k).or_insert(cat);
                        map
                    }),
            ),
            _ => {
                warnings.warn(
                    WarningKind::Enrichment,
                    format!(
                        "patient types: need '{}' and '{}' columns for origin lookup",
                        col::PATIENT_TYPE_ID,
                        col::ORIGIN_CATEGORY
                    ),
                );
                None
            }
        },
        None => {
            warnings.warn(
                WarningKind::Enrichment,
                "patients: no patient type table, origin category not looked up",
            );
            None
        }
    };

    let Some(lookup) = lookup else {
        // keep a category the patient file already carries
        patients.ensure_column(col::ORIGIN_CATEGORY);
        return;
    };
    if !require_column(patients, col::PATIENT_TYPE_ID, "patients", warnings) {
        patients.set_column(col::ORIGIN_CATEGORY, vec![Value::Null; patients.row_count()]);
        return;
    }

    let categories = patients
        .values(col::PATIENT_TYPE_ID)
        .unwrap_or(&[])
        .iter()
        .map(|code| {
            code.join_key()
                .and_then(|k| lookup.get(&k).cloned())
                .unwrap_or(Value::Null)
        })
        .collect();
    patients.set_column(col::ORIGIN_CATEGORY, categories);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warnings::WarningLog;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // -------------------------------------------------------------------------
    // AGE
    // -------------------------------------------------------------------------

    #[test]
    fn test_age_exactly_thirty() {
        let today = date(2026, 10, 16);
        assert_eq!(age_on(date(1996, 10, 16), today), Some(30));
        assert_eq!(age_on(date(1996, 10, 15), today), Some(30));
        assert_eq!(age_on(date(1996, 10, 17), today), Some(29));
    }

    #[test]
    fn test_age_out_of_range_is_none() {
        let today = date(2026, 10, 16);
        assert_eq!(age_on(date(2027, 1, 1), today), None);
        assert_eq!(age_on(date(1890, 1, 1), today), None);
        assert_eq!(age_on(date(1906, 10, 16), today), Some(120));
    }

    // -------------------------------------------------------------------------
    // ENRICHMENT
    // -------------------------------------------------------------------------

    fn patients() -> Table {
        Table::from_rows(
            vec![
                col::PATIENT_ID.into(),
                col::BIRTH_DATE.into(),
                col::SEX.into(),
                col::BRANCH_ID.into(),
                col::PATIENT_TYPE_ID.into(),
            ],
            vec![
                vec![
                    Value::Int(1),
                    Value::text("16/10/1996"),
                    Value::text("F"),
                    Value::Int(1),
                    Value::Int(10),
                ],
                vec![
                    Value::Int(2),
                    Value::text("sin dato"),
                    Value::text("M"),
                    Value::Int(1),
                    Value::Int(99),
                ],
                vec![
                    Value::Int(1),
                    Value::text("1990-01-01"),
                    Value::text("F"),
                    Value::Int(2),
                    Value::Int(10),
                ],
            ],
        )
    }

    fn patient_types() -> Table {
        Table::from_rows(
            vec![col::PATIENT_TYPE_ID.into(), col::ORIGIN_CATEGORY.into()],
            vec![vec![Value::Int(10), Value::text("Referido")]],
        )
    }

    #[test]
    fn test_enrich_patients_age_and_origin() {
        let mut log = WarningLog::new();
        let types = patient_types();
        let out = enrich_patients(patients(), Some(&types), date(2026, 10, 16), &mut log);

        assert_eq!(out.row_count(), 2);
        assert_eq!(out.get(0, col::AGE), Some(&Value::Int(30)));
        assert_eq!(out.get(1, col::AGE), Some(&Value::Null));
        assert_eq!(out.get(0, col::ORIGIN_CATEGORY), Some(&Value::text("Referido")));
        assert_eq!(out.get(1, col::ORIGIN_CATEGORY), Some(&Value::Null));
        // only the duplicate id is reported
        assert_eq!(log.of_kind(WarningKind::Enrichment).count(), 1);
    }

    #[test]
    fn test_missing_birth_date_degrades() {
        let t = Table::from_rows(vec![col::PATIENT_ID.into()], vec![vec![Value::Int(1)]]);
        let mut log = WarningLog::new();
        let out = enrich_patients(t, None, date(2026, 10, 16), &mut log);
        assert_eq!(out.get(0, col::AGE), Some(&Value::Null));
        assert!(out.has_column(col::ORIGIN_CATEGORY));
        assert!(log.entries().iter().any(|w| w.message.contains(col::BIRTH_DATE)));
    }
}
