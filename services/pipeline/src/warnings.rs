//! Typed, append-only warning accumulation.
//!
//! Every non-fatal condition in a run ends up here instead of being printed
//! and forgotten. The log keeps insertion order and also forwards each
//! warning to `tracing`.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Index row skipped or ambiguous.
    Index,
    /// Data file or sheet could not be loaded.
    Load,
    /// Rule references a column that is not in the sheet.
    Mapping,
    /// Two sources produced the same canonical entity.
    DuplicateEntity,
    /// Optional column missing or unusable during enrichment.
    Enrichment,
    Join,
    Aggregation,
    Persistence,
}

impl WarningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningKind::Index => "index",
            WarningKind::Load => "load",
            WarningKind::Mapping => "mapping",
            WarningKind::DuplicateEntity => "duplicate_entity",
            WarningKind::Enrichment => "enrichment",
            WarningKind::Join => "join",
            WarningKind::Aggregation => "aggregation",
            WarningKind::Persistence => "persistence",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)
    }
}

/// Receiver for non-fatal conditions. Recording never fails.
pub trait WarningSink {
    fn record(&mut self, warning: Warning);

    fn warn(&mut self, kind: WarningKind, message: impl Into<String>)
    where
        Self: Sized,
    {
        self.record(Warning::new(kind, message));
    }
}

#[derive(Debug, Default, Clone)]
pub struct WarningLog {
    entries: Vec<Warning>,
}

impl WarningLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[Warning] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn of_kind(&self, kind: WarningKind) -> impl Iterator<Item = &Warning> {
        self.entries.iter().filter(move |w| w.kind == kind)
    }

    pub fn into_vec(self) -> Vec<Warning> {
        self.entries
    }
}

impl WarningSink for WarningLog {
    fn record(&mut self, warning: Warning) {
        tracing::warn!(kind = warning.kind.as_str(), "{}", warning.message);
        self.entries.push(warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_keeps_order_and_filters_by_kind() {
        let mut log = WarningLog::new();
        log.warn(WarningKind::Mapping, "first");
        log.warn(WarningKind::Join, "second");
        log.warn(WarningKind::Mapping, "third");

        assert_eq!(log.len(), 3);
        assert_eq!(log.entries()[1].message, "second");
        let mapping: Vec<_> = log
            .of_kind(WarningKind::Mapping)
            .map(|w| w.message.as_str())
            .collect();
        assert_eq!(mapping, vec!["first", "third"]);
    }

    #[test]
    fn test_display_prefixes_kind() {
        let w = Warning::new(WarningKind::Aggregation, "not enough dimensions");
        assert_eq!(w.to_string(), "[aggregation] not enough dimensions");
    }
}
