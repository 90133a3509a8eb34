use super::require_column;
use crate::schema::col;
use crate::table::{Table, Value};
use crate::warnings::{WarningKind, WarningSink};

/// `monto_descuento = precio_original - precio_paciente`, null unless both
/// prices are numeric.
pub fn enrich_budgets(mut budgets: Table, warnings: &mut impl WarningSink) -> Table {
    require_column(&mut budgets, col::PATIENT_ID, "budgets", warnings);

    if !(budgets.has_column(col::ORIGINAL_PRICE) && budgets.has_column(col::PATIENT_PRICE)) {
        warnings.warn(
            WarningKind::Enrichment,
            format!(
                "budgets: '{}' and '{}' are both required for '{}'; left null",
                col::ORIGINAL_PRICE,
                col::PATIENT_PRICE,
                col::DISCOUNT_AMOUNT
            ),
        );
        budgets.ensure_column(col::DISCOUNT_AMOUNT);
        return budgets;
    }

    let original = budgets.values(col::ORIGINAL_PRICE).unwrap_or(&[]);
    let patient = budgets.values(col::PATIENT_PRICE).unwrap_or(&[]);
    let discounts = original
        .iter()
        .zip(patient)
        .map(|(o, p)| match (o.as_f64(), p.as_f64()) {
            (Some(o), Some(p)) => Value::Float(o - p),
            _ => Value::Null,
        })
        .collect();
    budgets.set_column(col::DISCOUNT_AMOUNT, discounts);
    budgets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warnings::WarningLog;

    #[test]
    fn test_discount_amount() {
        let t = Table::from_rows(
            vec![col::PATIENT_ID.into(), col::ORIGINAL_PRICE.into(), col::PATIENT_PRICE.into()],
            vec![
                vec![Value::Int(1), Value::Int(1000), Value::Int(750)],
                vec![Value::Int(1), Value::Int(1000), Value::Null],
                vec![Value::Int(2), Value::text("$ 500"), Value::text("no aplica")],
            ],
        );
        let out = enrich_budgets(t, &mut WarningLog::new());
        let discounts = out.values(col::DISCOUNT_AMOUNT).unwrap();
        assert_eq!(discounts[0].as_f64(), Some(250.0));
        assert_eq!(discounts[1], Value::Null);
        assert_eq!(discounts[2], Value::Null);
    }

    #[test]
    fn test_missing_price_column_warns() {
        let t = Table::from_rows(
            vec![col::PATIENT_ID.into(), col::ORIGINAL_PRICE.into()],
            vec![vec![Value::Int(1), Value::Int(1000)]],
        );
        let mut log = WarningLog::new();
        let out = enrich_budgets(t, &mut log);
        assert_eq!(out.get(0, col::DISCOUNT_AMOUNT), Some(&Value::Null));
        assert_eq!(log.len(), 1);
    }
}
