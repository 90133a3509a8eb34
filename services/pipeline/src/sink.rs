//! Full-replace persistence of named tables.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{NaiveDateTime, NaiveTime};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::PersistenceError;
use crate::table::{NamedTables, Table, Value};
use crate::warnings::{WarningKind, WarningSink};

const MAX_ROWS_PER_INSERT: usize = 1000;
const MAX_BIND_PARAMS: usize = 65535;

/// Destination for output tables. Every write replaces the previous contents
/// of the table.
#[async_trait]
pub trait RelationalSink: Send + Sync {
    async fn write_table(&self, name: &str, table: &Table) -> Result<(), PersistenceError>;
}

/// Write every table, lowercasing names. Failures become persistence warnings
/// and the remaining tables are still written. Returns how many were written.
pub async fn persist_tables(
    sink: &dyn RelationalSink,
    tables: &NamedTables,
    warnings: &mut impl WarningSink,
) -> usize {
    let mut written = 0;
    for (name, table) in tables {
        let name = name.to_lowercase();
        let result = if table.columns().is_empty() {
            Err(PersistenceError::NoColumns(name.clone()))
        } else {
            sink.write_table(&name, table).await
        };
        match result {
            Ok(()) => {
                tracing::info!(table = %name, rows = table.row_count(), "table written");
                written += 1;
            }
            Err(e) => warnings.warn(WarningKind::Persistence, e.to_string()),
        }
    }
    written
}

// =============================================================================
// POSTGRES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    BigInt,
    Double,
    Boolean,
    Date,
    Timestamp,
    Time,
    Text,
}

impl SqlType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Date => "DATE",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Time => "TIME",
            SqlType::Text => "TEXT",
        }
    }

    /// Narrowest type holding every non-null value.
    pub fn infer(values: &[Value]) -> SqlType {
        let mut inferred: Option<SqlType> = None;
        for value in values.iter().filter(|v| !v.is_null()) {
            let this = match value {
                Value::Int(_) => SqlType::BigInt,
                Value::Float(_) => SqlType::Double,
                Value::Bool(_) => SqlType::Boolean,
                Value::Date(_) => SqlType::Date,
                Value::DateTime(_) => SqlType::Timestamp,
                Value::Time(_) => SqlType::Time,
                Value::Text(_) | Value::Null => return SqlType::Text,
            };
            inferred = Some(match (inferred, this) {
                (None, t) => t,
                (Some(a), b) if a == b => a,
                (Some(SqlType::BigInt), SqlType::Double)
                | (Some(SqlType::Double), SqlType::BigInt) => SqlType::Double,
                (Some(SqlType::Date), SqlType::Timestamp)
                | (Some(SqlType::Timestamp), SqlType::Date) => SqlType::Timestamp,
                _ => return SqlType::Text,
            });
        }
        inferred.unwrap_or(SqlType::Text)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn push_typed(
    builder: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>,
    sql_type: SqlType,
    value: &Value,
) {
    match sql_type {
        SqlType::BigInt => {
            builder.push_bind(match value {
                Value::Int(i) => Some(*i),
                _ => None,
            });
        }
        SqlType::Double => {
            builder.push_bind(value.as_f64());
        }
        SqlType::Boolean => {
            builder.push_bind(value.as_bool());
        }
        SqlType::Date => {
            builder.push_bind(value.as_date());
        }
        SqlType::Timestamp => {
            let ts: Option<NaiveDateTime> = match value {
                Value::DateTime(dt) => Some(*dt),
                Value::Date(d) => Some(d.and_time(NaiveTime::MIN)),
                _ => None,
            };
            builder.push_bind(ts);
        }
        SqlType::Time => {
            builder.push_bind(value.as_time());
        }
        SqlType::Text => {
            let text = (!value.is_null()).then(|| value.to_string());
            builder.push_bind(text);
        }
    }
}

pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelationalSink for PgSink {
    async fn write_table(&self, name: &str, table: &Table) -> Result<(), PersistenceError> {
        let db_err = |source| PersistenceError::Database {
            table: name.to_string(),
            source,
        };
        let types: Vec<SqlType> = table
            .columns()
            .iter()
            .map(|c| SqlType::infer(&c.values))
            .collect();
        let ident = quote_ident(name);

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {}", ident))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let definitions: Vec<String> = table
            .columns()
            .iter()
            .zip(&types)
            .map(|(c, t)| format!("{} {}", quote_ident(&c.name), t.as_sql()))
            .collect();
        sqlx::query(&format!("CREATE TABLE {} ({})", ident, definitions.join(", ")))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let column_list: Vec<String> = table
            .columns()
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect();
        let per_chunk = MAX_ROWS_PER_INSERT
            .min(MAX_BIND_PARAMS / table.columns().len().max(1))
            .max(1);
        let rows: Vec<usize> = (0..table.row_count()).collect();

        for chunk in rows.chunks(per_chunk) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", ident, column_list.join(", ")));
            builder.push_values(chunk, |mut b, row| {
                for (column, sql_type) in table.columns().iter().zip(&types) {
                    let value = column.values.get(*row).unwrap_or(&Value::Null);
                    push_typed(&mut b, *sql_type, value);
                }
            });
            builder.build().execute(&mut *tx).await.map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

// =============================================================================
// CSV DIRECTORY
// =============================================================================

/// Writes `<dir>/<name>.csv`, replacing any earlier file.
pub struct CsvDirSink {
    dir: PathBuf,
}

impl CsvDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", name))
    }

    fn write_sync(
        dir: &Path,
        path: &Path,
        name: &str,
        table: &Table,
    ) -> Result<(), PersistenceError> {
        let io_err = |source| PersistenceError::Io {
            table: name.to_string(),
            source,
        };
        let csv_err = |source| PersistenceError::Csv {
            table: name.to_string(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(io_err)?;
        let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
        writer.write_record(table.column_names()).map_err(csv_err)?;
        for row in 0..table.row_count() {
            writer
                .write_record(table.row(row).iter().map(|v| v.to_string()))
                .map_err(csv_err)?;
        }
        writer.flush().map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl RelationalSink for CsvDirSink {
    async fn write_table(&self, name: &str, table: &Table) -> Result<(), PersistenceError> {
        Self::write_sync(&self.dir, &self.path_for(name), name, table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warnings::WarningLog;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    // -------------------------------------------------------------------------
    // TYPE INFERENCE
    // -------------------------------------------------------------------------

    #[test]
    fn test_infer_sql_types() {
        assert_eq!(SqlType::infer(&[Value::Int(1), Value::Null]), SqlType::BigInt);
        assert_eq!(SqlType::infer(&[Value::Int(1), Value::Float(1.5)]), SqlType::Double);
        assert_eq!(SqlType::infer(&[Value::Int(1), Value::text("x")]), SqlType::Text);
        assert_eq!(SqlType::infer(&[Value::Null]), SqlType::Text);
        let d = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(
            SqlType::infer(&[Value::Date(d), Value::DateTime(d.and_time(NaiveTime::MIN))]),
            SqlType::Timestamp
        );
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("hechos_citas"), "\"hechos_citas\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    // -------------------------------------------------------------------------
    // CSV SINK
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_csv_sink_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvDirSink::new(dir.path());
        let first = Table::from_rows(
            vec!["a".into()],
            vec![vec![Value::Int(1)], vec![Value::Int(2)]],
        );
        let second = Table::from_rows(
            vec!["a".into(), "fecha".into()],
            vec![vec![Value::Int(3), Value::Date(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap())]],
        );

        sink.write_table("t", &first).await.unwrap();
        sink.write_table("t", &second).await.unwrap();

        let content = std::fs::read_to_string(sink.path_for("t")).unwrap();
        assert_eq!(content, "a,fecha\n3,2024-01-10\n");
    }

    // -------------------------------------------------------------------------
    // PERSIST TABLES
    // -------------------------------------------------------------------------

    /// Records written names and fails on one.
    struct RecordingSink {
        fail_on: &'static str,
        written: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RelationalSink for RecordingSink {
        async fn write_table(&self, name: &str, _table: &Table) -> Result<(), PersistenceError> {
            if name == self.fail_on {
                return Err(PersistenceError::NoColumns(name.to_string()));
            }
            self.written.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_persist_continues_after_failure() {
        let sink = RecordingSink {
            fail_on: "b",
            written: Mutex::new(Vec::new()),
        };
        let one = Table::from_rows(vec!["x".into()], vec![vec![Value::Int(1)]]);
        let mut tables = NamedTables::new();
        tables.insert("A".to_string(), one.clone());
        tables.insert("b".to_string(), one.clone());
        tables.insert("c".to_string(), one);
        tables.insert("d".to_string(), Table::new());

        let mut log = WarningLog::new();
        let written = persist_tables(&sink, &tables, &mut log).await;

        assert_eq!(written, 2);
        assert_eq!(*sink.written.lock().unwrap(), vec!["a", "c"]);
        assert_eq!(log.of_kind(WarningKind::Persistence).count(), 2);
    }
}
