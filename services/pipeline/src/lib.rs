//! Index-driven schema unification and enrichment for clinic spreadsheet
//! exports.
//!
//! A run compiles the index sheet into rename/drop rules, normalizes every
//! uploaded sheet the index references, enriches the resulting entities,
//! joins them into consolidated views and aggregates profile tables. Fatal
//! conditions are [`PipelineError`]s; everything else is collected as
//! [`Warning`]s and returned with the output.

pub mod batch;
pub mod config;
pub mod enrich;
pub mod error;
pub mod index;
pub mod join;
pub mod loader;
pub mod logging;
pub mod pipeline;
pub mod profile;
pub mod schema;
pub mod sink;
pub mod source;
pub mod table;
pub mod warnings;

pub use batch::{Batch, InboundBuffer, InboundFile};
pub use error::{BatchError, PersistenceError, PipelineError, PipelineFailure, SourceError};
pub use pipeline::{run, PipelineOutput, RunOptions, RunReport};
pub use sink::{persist_tables, CsvDirSink, PgSink, RelationalSink};
pub use source::{CalamineSource, Sheet, SpreadsheetSource};
pub use table::{NamedTables, Table, Value};
pub use warnings::{Warning, WarningKind, WarningLog, WarningSink};
