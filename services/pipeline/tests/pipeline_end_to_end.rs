//! Whole-run tests driven through an in-memory spreadsheet source.

use std::collections::HashMap;

use chrono::NaiveDate;
use pipeline::schema::tables;
use pipeline::{
    run, Batch, InboundFile, PipelineError, RunOptions, Sheet, SourceError, SpreadsheetSource,
    Table, Value, WarningKind,
};

/// Workbooks keyed by file name; unknown names fail like an unreadable file.
#[derive(Default)]
struct MemorySource {
    workbooks: HashMap<String, Vec<(String, Table)>>,
}

impl MemorySource {
    fn with(mut self, file: &str, sheet: &str, table: Table) -> Self {
        self.workbooks
            .entry(file.to_string())
            .or_default()
            .push((sheet.to_string(), table));
        self
    }
}

impl SpreadsheetSource for MemorySource {
    fn open_workbook(&self, file_name: &str, _bytes: &[u8]) -> Result<Vec<Sheet>, SourceError> {
        let sheets = self
            .workbooks
            .get(file_name)
            .ok_or_else(|| SourceError::UnsupportedFormat(file_name.to_string()))?;
        Ok(sheets
            .iter()
            .map(|(name, table)| Sheet {
                name: name.clone(),
                table: table.clone(),
            })
            .collect())
    }
}

fn table(header: &[&str], rows: Vec<Vec<Value>>) -> Table {
    Table::from_rows(header.iter().map(|h| h.to_string()).collect(), rows)
}

fn date(y: i32, m: u32, d: u32) -> Value {
    Value::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
}

fn index_table() -> Table {
    let rule = |file: &str, sheet: &str, source: &str, target: &str, action: &str| {
        vec![
            Value::text(file),
            Value::text(sheet),
            Value::text(source),
            if target.is_empty() { Value::Null } else { Value::text(target) },
            Value::text(action),
        ]
    };
    table(
        &["Archivo", "Hoja", "Columna", "Nombre unificado", "Acción"],
        vec![
            rule("Pacientes.xlsx", "Hoja1", "Id Paciente", "paciente_id", "Renombrar"),
            rule("Pacientes.xlsx", "Hoja1", "Fecha Nac", "fecha_nacimiento", "renombrar"),
            rule("Pacientes.xlsx", "Hoja1", "RUT", "", "Eliminar"),
            rule("citas.xlsx", "default", "Id Cita", "cita_id", "rename"),
            rule("presupuestos.csv", "default", "precio_original", "precio_original", "keep"),
        ],
    )
}

fn patients_sheet() -> Table {
    table(
        &["Id Paciente", "Fecha Nac", "Sexo", "RUT", "Sucursal_ID"],
        vec![
            vec![
                Value::Int(1),
                date(1994, 6, 1),
                Value::text("F"),
                Value::text("11-1"),
                Value::Int(1),
            ],
            vec![
                Value::Int(2),
                date(1994, 6, 2),
                Value::text("M"),
                Value::text("22-2"),
                Value::Int(1),
            ],
            vec![Value::Int(3), Value::Null, Value::Null, Value::text("33-3"), Value::Int(2)],
        ],
    )
}

fn appointments_sheet() -> Table {
    table(
        &["Id Cita", "paciente_id", "fecha_cita", "asistio", "duplicada"],
        vec![
            vec![
                Value::Int(1),
                Value::Int(1),
                date(2024, 1, 10),
                Value::Bool(true),
                Value::Bool(false),
            ],
            vec![
                Value::Int(2),
                Value::Int(1),
                date(2024, 3, 5),
                Value::Bool(true),
                Value::Bool(false),
            ],
            vec![
                Value::Int(3),
                Value::Int(2),
                date(2024, 7, 1),
                Value::Bool(false),
                Value::Bool(false),
            ],
            vec![
                Value::Int(4),
                Value::Int(2),
                date(2024, 7, 1),
                Value::Bool(false),
                Value::Bool(true),
            ],
        ],
    )
}

fn budgets_sheet() -> Table {
    table(
        &["presupuesto_id", "paciente_id", "precio_original", "precio_paciente"],
        vec![
            vec![Value::Int(1), Value::Int(1), Value::Float(1000.0), Value::Float(750.0)],
            vec![Value::Int(2), Value::Int(2), Value::Float(500.0), Value::Null],
        ],
    )
}

fn full_source() -> MemorySource {
    MemorySource::default()
        .with("indice.xlsx", "Hoja1", index_table())
        .with("Pacientes.xlsx", "Hoja1", patients_sheet())
        .with("Pacientes.xlsx", "Notas", table(&["x"], vec![vec![Value::Int(1)]]))
        .with("citas.xlsx", "Citas", appointments_sheet())
        .with("presupuestos.csv", "default", budgets_sheet())
}

fn batch(data: &[&str]) -> Batch {
    Batch::new(
        InboundFile::new("indice.xlsx", Vec::new()),
        data.iter().map(|name| InboundFile::new(*name, Vec::new())).collect(),
    )
}

// -----------------------------------------------------------------------------
// SUCCESSFUL RUN
// -----------------------------------------------------------------------------

#[test]
fn test_full_run_produces_enriched_tables() {
    let output = run(
        &batch(&["Pacientes.xlsx", "citas.xlsx", "presupuestos.csv"]),
        &full_source(),
        &RunOptions::new(today()),
    )
    .unwrap();

    let patients = &output.tables[tables::PATIENTS];
    assert!(patients.has_column("paciente_id"));
    assert!(patients.has_column("fecha_nacimiento"));
    assert_eq!(patients.get(0, "edad"), Some(&Value::Int(30)));
    assert_eq!(patients.get(1, "edad"), Some(&Value::Int(29)));
    assert_eq!(patients.get(2, "edad"), Some(&Value::Null));

    for (name, t) in &output.tables {
        assert!(!t.has_column("rut"), "dropped column leaked into {}", name);
    }

    let appointments = &output.tables[tables::APPOINTMENTS];
    assert_eq!(appointments.row_count(), 3);
    let labels: Vec<String> = appointments
        .values("etiqueta_visita")
        .unwrap()
        .iter()
        .map(|v| v.to_string())
        .collect();
    assert_eq!(labels, vec!["New-Attended", "Recurring-Attended", "New-Scheduled"]);

    let budgets = &output.tables[tables::BUDGETS];
    assert_eq!(budgets.get(0, "monto_descuento"), Some(&Value::Float(250.0)));
    assert_eq!(budgets.get(1, "monto_descuento"), Some(&Value::Null));

    let consolidated = &output.tables[tables::CONSOLIDATED];
    assert_eq!(consolidated.row_count(), 3);
    assert_eq!(consolidated.get(2, "sexo"), Some(&Value::text("M")));
}

#[test]
fn test_profile_keeps_null_group() {
    let output = run(
        &batch(&["Pacientes.xlsx", "citas.xlsx", "presupuestos.csv"]),
        &full_source(),
        &RunOptions::new(today()),
    )
    .unwrap();

    let profile = &output.tables["perfil_pacientes_sucursal_sexo"];
    assert_eq!(profile.row_count(), 3);
    let null_row = (0..profile.row_count())
        .find(|&row| profile.get(row, "sexo") == Some(&Value::Null))
        .expect("null sex group missing");
    assert_eq!(profile.get(null_row, "pacientes"), Some(&Value::Int(1)));
    assert_eq!(profile.get(null_row, "sucursal_id"), Some(&Value::Int(2)));

    let shares: f64 = profile
        .values("porcentaje")
        .unwrap()
        .iter()
        .filter_map(Value::as_f64)
        .sum();
    assert!((shares - 100.0).abs() < 0.05);
}

#[test]
fn test_missing_optional_entities_are_warnings() {
    let output = run(
        &batch(&["Pacientes.xlsx"]),
        &full_source(),
        &RunOptions::new(today()),
    )
    .unwrap();

    assert!(output.tables.contains_key(tables::PATIENTS));
    assert!(!output.tables.contains_key(tables::CONSOLIDATED));
    assert!(output.warnings.iter().any(|w| w.kind == WarningKind::Join));
    assert!(output.warnings.iter().any(|w| w.kind == WarningKind::Aggregation));
}

// -----------------------------------------------------------------------------
// FATAL RUNS
// -----------------------------------------------------------------------------

#[test]
fn test_index_without_action_column_fails_before_loading() {
    let bad_index = table(
        &["Archivo", "Hoja", "Columna", "Nombre unificado"],
        vec![vec![
            Value::text("Pacientes.xlsx"),
            Value::text("Hoja1"),
            Value::text("Id Paciente"),
            Value::text("paciente_id"),
        ]],
    );
    let source = MemorySource::default()
        .with("indice.xlsx", "Hoja1", bad_index)
        .with("Pacientes.xlsx", "Hoja1", patients_sheet());

    let failure = run(&batch(&["Pacientes.xlsx"]), &source, &RunOptions::new(today())).unwrap_err();
    assert!(matches!(failure.error, PipelineError::Configuration(_)));
    assert!(failure.warnings.iter().all(|w| w.kind != WarningKind::Load));
}

#[test]
fn test_missing_patients_is_fatal_and_keeps_warnings() {
    let failure = run(
        &batch(&["citas.xlsx", "notas.txt"]),
        &full_source(),
        &RunOptions::new(today()),
    )
    .unwrap_err();

    assert!(matches!(failure.error, PipelineError::FatalData(_)));
    assert!(failure
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::Load && w.message.contains("notas.txt")));
}
