use thiserror::Error;

use crate::warnings::Warning;

/// Conditions that abort a pipeline run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// The index is unreadable or structurally invalid. Raised before any data
    /// file is opened.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A table the rest of the run depends on could not be produced.
    #[error("fatal data error: {0}")]
    FatalData(String),
}

/// A workbook could not be opened or one of its sheets could not be read.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("unsupported file type for '{0}'")]
    UnsupportedFormat(String),

    #[error("failed to read workbook '{file}': {detail}")]
    Workbook { file: String, detail: String },

    #[error("failed to read CSV '{file}': {source}")]
    Csv {
        file: String,
        #[source]
        source: csv::Error,
    },
}

/// One table failed to write. Other tables are still attempted.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database error writing '{table}': {source}")]
    Database {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("I/O error writing '{table}': {source}")]
    Io {
        table: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error writing '{table}': {source}")]
    Csv {
        table: String,
        #[source]
        source: csv::Error,
    },

    #[error("table '{0}' has no columns")]
    NoColumns(String),
}

/// The inbound buffer cannot form a batch yet.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    #[error("index file '{0}' has not been uploaded")]
    MissingIndex(String),

    #[error("no data files have been uploaded")]
    NoDataFiles,
}

/// A fatal error together with every warning recorded before it happened.
#[derive(Error, Debug, Clone)]
#[error("{error}")]
pub struct PipelineFailure {
    pub error: PipelineError,
    pub warnings: Vec<Warning>,
}
