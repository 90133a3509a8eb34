//! Sheet selection and column normalization.
//!
//! Every uploaded file is opened through a [`SpreadsheetSource`]; only sheets
//! named by the index (or the first sheet, when the file has a `default` rule)
//! are kept. Each kept sheet is renamed, pruned and brought to the canonical
//! naming convention, then filed under the entity its base name resolves to.

use std::collections::{BTreeMap, BTreeSet};

use crate::batch::InboundFile;
use crate::index::{base_name, CompiledIndex, SheetRules, TableKey};
use crate::schema::EntityKind;
use crate::source::{Sheet, SpreadsheetSource};
use crate::table::{canonical_name, Column, NamedTables, Table};
use crate::warnings::{WarningKind, WarningSink};

/// Normalized tables, resolved to entities once at load time.
#[derive(Debug, Default, Clone)]
pub struct LoadedEntities {
    pub entities: BTreeMap<EntityKind, Table>,
    /// Tables whose base name matches no known entity, keyed by canonical base name.
    pub unrecognized: NamedTables,
}

impl LoadedEntities {
    pub fn get(&self, kind: EntityKind) -> Option<&Table> {
        self.entities.get(&kind)
    }

    pub fn take(&mut self, kind: EntityKind) -> Option<Table> {
        self.entities.remove(&kind)
    }
}

/// Pick the sheets of one workbook that the index asks for. The exact
/// `(file, sheet)` key wins; otherwise a `default` rule claims the first sheet.
pub fn select_sheets(
    index: &CompiledIndex,
    file_name: &str,
    sheets: Vec<Sheet>,
) -> Vec<(TableKey, Table)> {
    let has_default = index.references(&TableKey::default_for(file_name));
    sheets
        .into_iter()
        .enumerate()
        .filter_map(|(position, sheet)| {
            let key = TableKey::new(file_name, &sheet.name);
            if index.references(&key) || (position == 0 && has_default) {
                Some((key, sheet.table))
            } else {
                tracing::debug!(
                    file = file_name,
                    sheet = %sheet.name,
                    "sheet not in index, skipped"
                );
                None
            }
        })
        .collect()
}

/// Apply rename and drop rules to one sheet and bring every column name to
/// canonical form.
///
/// Drops are resolved after renames: a column is removed when either its
/// original name or its renamed name is in the drop set.
pub fn normalize(
    table: Table,
    rules: &SheetRules,
    key: &TableKey,
    warnings: &mut impl WarningSink,
) -> Table {
    let mut matched: BTreeSet<String> = BTreeSet::new();
    let mut used: BTreeSet<String> = BTreeSet::new();
    let mut columns = Vec::new();

    for (position, column) in table.into_columns().into_iter().enumerate() {
        let source = canonical_name(&column.name);
        let renamed = match rules.renames.get(&source) {
            Some(target) => {
                matched.insert(source.clone());
                target.clone()
            }
            None => column.name.clone(),
        };

        let mut name = canonical_name(&renamed);
        if rules.drops.contains(&source) || rules.drops.contains(&name) {
            continue;
        }
        if name.is_empty() {
            name = format!("sin_nombre_{}", position + 1);
        }
        if used.contains(&name) {
            let base = name.clone();
            let mut n = 2;
            while used.contains(&format!("{}_{}", base, n)) {
                n += 1;
            }
            name = format!("{}_{}", base, n);
            warnings.warn(
                WarningKind::Mapping,
                format!(
                    "{}/{}: column '{}' collides with an earlier column named '{}'; stored as '{}'",
                    key.file, key.sheet, column.name, base, name
                ),
            );
        }
        used.insert(name.clone());
        columns.push(Column::new(name, column.values));
    }

    for (source, target) in &rules.renames {
        if matched.contains(source) {
            continue;
        }
        let expected = canonical_name(target);
        if !used.contains(&expected) {
            warnings.warn(
                WarningKind::Mapping,
                format!(
                    "{}/{}: column '{}' not found, expected target '{}' is missing",
                    key.file, key.sheet, source, expected
                ),
            );
        }
    }
    for source in rules.drops.iter().filter(|s| !matched.contains(*s)) {
        tracing::debug!(
            file = %key.file,
            sheet = %key.sheet,
            column = %source,
            "drop rule has no column to act on"
        );
    }

    Table::from(columns)
}

/// Open, select and normalize every data file. Unreadable files and files
/// with no indexed sheet are skipped with a load warning.
pub fn load_all(
    source: &impl SpreadsheetSource,
    index: &CompiledIndex,
    files: &[InboundFile],
    warnings: &mut impl WarningSink,
) -> LoadedEntities {
    let mut ordered: Vec<&InboundFile> = files.iter().collect();
    ordered.sort_by_key(|f| f.name.to_lowercase());

    let mut loaded = LoadedEntities::default();
    // canonical entity name -> "file/sheet" that produced it
    let mut origins: BTreeMap<String, String> = BTreeMap::new();

    for file in ordered {
        let sheets = match source.open_workbook(&file.name, &file.bytes) {
            Ok(sheets) => sheets,
            Err(e) => {
                warnings.warn(WarningKind::Load, format!("{}; file skipped", e));
                continue;
            }
        };

        let selected = select_sheets(index, &file.name, sheets);
        if selected.is_empty() {
            warnings.warn(
                WarningKind::Load,
                format!("'{}' has no sheet referenced by the index; file skipped", file.name),
            );
            continue;
        }

        let entity_name = canonical_name(base_name(&file.name));
        let kind = EntityKind::from_base_name(&entity_name);
        if kind.is_none() {
            warnings.warn(
                WarningKind::Load,
                format!(
                    "'{}' is not a known entity; passed through as '{}'",
                    file.name, entity_name
                ),
            );
        }
        let slot = kind.map(|k| k.table_name().to_string()).unwrap_or_else(|| entity_name.clone());

        for (key, table) in selected {
            let rules = index.rules_for(&key);
            let normalized = normalize(table, &rules, &key, warnings);
            tracing::info!(
                file = %file.name,
                sheet = %key.sheet,
                entity = %slot,
                rows = normalized.row_count(),
                columns = normalized.columns().len(),
                "sheet normalized"
            );

            let origin = format!("{}/{}", file.name, key.sheet);
            if let Some(previous) = origins.insert(slot.clone(), origin.clone()) {
                warnings.warn(
                    WarningKind::DuplicateEntity,
                    format!(
                        "'{}' from {} replaces the one loaded from {}; data from {} is discarded",
                        slot, origin, previous, previous
                    ),
                );
            }
            match kind {
                Some(kind) => {
                    loaded.entities.insert(kind, normalized);
                }
                None => {
                    loaded.unrecognized.insert(entity_name.clone(), normalized);
                }
            }
        }
    }

    loaded
}
