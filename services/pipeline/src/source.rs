//! Spreadsheet sources: open an uploaded file and return all of its sheets.

use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, ExcelDateTime, Range, Reader};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::SourceError;
use crate::table::{Table, Value};

/// Name given to the single sheet of a CSV file.
pub const CSV_SHEET: &str = "default";

/// One sheet of a workbook, in workbook order.
#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub table: Table,
}

pub trait SpreadsheetSource {
    /// Open every sheet of `file_name`. The first row of each sheet is its header.
    fn open_workbook(&self, file_name: &str, bytes: &[u8]) -> Result<Vec<Sheet>, SourceError>;
}

/// Excel/ODS through calamine, CSV through the csv crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct CalamineSource;

impl SpreadsheetSource for CalamineSource {
    fn open_workbook(&self, file_name: &str, bytes: &[u8]) -> Result<Vec<Sheet>, SourceError> {
        let lower = file_name.trim().to_lowercase();
        if lower.ends_with(".csv") {
            return read_csv(file_name, bytes);
        }
        if !is_spreadsheet_name(&lower) {
            return Err(SourceError::UnsupportedFormat(file_name.to_string()));
        }

        let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).map_err(|e| {
            SourceError::Workbook {
                file: file_name.to_string(),
                detail: e.to_string(),
            }
        })?;

        let sheet_names = workbook.sheet_names().to_vec();
        let mut sheets = Vec::with_capacity(sheet_names.len());
        for name in sheet_names {
            let range = workbook
                .worksheet_range(&name)
                .map_err(|e| SourceError::Workbook {
                    file: file_name.to_string(),
                    detail: format!("sheet '{}': {}", name, e),
                })?;
            let table = range_to_table(&range);
            tracing::debug!(
                file = file_name,
                sheet = %name,
                rows = table.row_count(),
                "sheet read"
            );
            sheets.push(Sheet { name, table });
        }
        Ok(sheets)
    }
}

fn is_spreadsheet_name(lower: &str) -> bool {
    [".xlsx", ".xlsm", ".xlsb", ".xls", ".ods"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

fn header_name(raw: String, position: usize) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        format!("sin_nombre_{}", position + 1)
    } else {
        trimmed.to_string()
    }
}

fn range_to_table(range: &Range<Data>) -> Table {
    let mut rows = range.rows();
    let header: Vec<String> = match rows.next() {
        Some(first) => first
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let raw = match cell {
                    Data::String(s) => s.clone(),
                    Data::Empty => String::new(),
                    other => format!("{}", other),
                };
                header_name(raw, i)
            })
            .collect(),
        None => return Table::new(),
    };

    let data: Vec<Vec<Value>> = rows
        .map(|row| row.iter().map(cell_value).collect::<Vec<_>>())
        .filter(|row| row.iter().any(|v| !v.is_null()))
        .collect();

    Table::from_rows(header, data)
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Value::Null
            } else {
                Value::Text(trimmed.to_string())
            }
        }
        Data::Int(i) => Value::Int(*i),
        Data::Float(f) => Value::Float(*f),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => excel_datetime(dt),
        Data::DateTimeIso(s) => iso_datetime(s),
        Data::DurationIso(s) => Value::Text(s.clone()),
        Data::Error(_) => Value::Null,
    }
}

fn excel_datetime(dt: &ExcelDateTime) -> Value {
    if dt.is_duration() {
        return dt
            .as_duration()
            .and_then(|d| u32::try_from(d.num_seconds()).ok())
            .and_then(|secs| NaiveTime::from_num_seconds_from_midnight_opt(secs, 0))
            .map(Value::Time)
            .unwrap_or(Value::Null);
    }
    let Some(datetime) = dt.as_datetime() else {
        return Value::Null;
    };
    if dt.as_f64() < 1.0 {
        Value::Time(datetime.time())
    } else if datetime.time() == NaiveTime::MIN {
        Value::Date(datetime.date())
    } else {
        Value::DateTime(datetime)
    }
}

fn iso_datetime(raw: &str) -> Value {
    let s = raw.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Value::DateTime(dt);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Value::Date(d);
    }
    if let Ok(t) = NaiveTime::parse_from_str(s, "%H:%M:%S%.f") {
        return Value::Time(t);
    }
    Value::Text(s.to_string())
}

/// Decode CSV bytes: UTF-8 (BOM stripped) with a Windows-1252 fallback,
/// which is what spreadsheet exports on Spanish-locale Windows produce.
fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or("");
    let semicolons = header.matches(';').count();
    let commas = header.matches(',').count();
    let tabs = header.matches('\t').count();
    if tabs > semicolons && tabs > commas {
        b'\t'
    } else if semicolons > commas {
        b';'
    } else {
        b','
    }
}

fn read_csv(file_name: &str, bytes: &[u8]) -> Result<Vec<Sheet>, SourceError> {
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(&text))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let csv_error = |source| SourceError::Csv {
        file: file_name.to_string(),
        source,
    };

    let header: Vec<String> = reader
        .headers()
        .map_err(csv_error)?
        .iter()
        .enumerate()
        .map(|(i, h)| header_name(h.to_string(), i))
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        let row: Vec<Value> = record.iter().map(Value::infer).collect();
        if row.iter().any(|v| !v.is_null()) {
            rows.push(row);
        }
    }

    Ok(vec![Sheet {
        name: CSV_SHEET.to_string(),
        table: Table::from_rows(header, rows),
    }])
}
