//! Index compiler: turns the declarative index sheet into rename and drop rules.
//!
//! Each index row says, for one `(file, sheet, column)`, whether the column is
//! renamed to a unified name or dropped. Structural problems with the index
//! itself (missing required columns) abort the run; problems with individual
//! rows are recorded as warnings and the row is skipped.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::PipelineError;
use crate::table::{canonical_name, Table, Value};
use crate::warnings::{WarningKind, WarningSink};

/// Sheet name that applies to a file's first sheet when no exact rule exists.
pub const DEFAULT_SHEET: &str = "default";

/// Known header spellings for each required index column (canonical form).
const SOURCE_FILE_COLUMNS: &[&str] =
    &["sourcefile", "source_file", "archivo", "archivobase", "archivo_base"];
const SHEET_COLUMNS: &[&str] = &["sheet", "hoja"];
const SOURCE_COLUMN_COLUMNS: &[&str] =
    &["sourcecolumn", "source_column", "columna", "campofuente", "campo_fuente"];
const TARGET_COLUMN_COLUMNS: &[&str] = &[
    "targetcolumn",
    "target_column",
    "nombre_unificado",
    "campodestino",
    "campo_destino",
];
const ACTION_COLUMNS: &[&str] = &["action", "acción", "accion"];

const RENAME_WORDS: &[&str] = &["rename", "keep", "homologar", "mantener", "renombrar"];
const DROP_WORDS: &[&str] = &["drop", "eliminar", "delete", "borrar"];

const SPREADSHEET_EXTENSIONS: &[&str] = &[".xlsx", ".xlsm", ".xlsb", ".xls", ".ods", ".csv"];

/// Strip a known spreadsheet extension from a file name.
pub fn base_name(file_name: &str) -> &str {
    let trimmed = file_name.trim();
    let lower = trimmed.to_lowercase();
    SPREADSHEET_EXTENSIONS
        .iter()
        .find(|ext| lower.ends_with(*ext))
        .map(|ext| &trimmed[..trimmed.len() - ext.len()])
        .unwrap_or(trimmed)
}

/// Identifies one physical sheet inside one physical file. Both parts are
/// stored trimmed and lowercased; the file part has no extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableKey {
    pub file: String,
    pub sheet: String,
}

impl TableKey {
    pub fn new(file: &str, sheet: &str) -> Self {
        Self {
            file: base_name(file).trim().to_lowercase(),
            sheet: sheet.trim().to_lowercase(),
        }
    }

    pub fn default_for(file: &str) -> Self {
        Self::new(file, DEFAULT_SHEET)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Rename,
    Drop,
}

impl Action {
    pub fn parse(raw: &str) -> Option<Action> {
        let word = raw.trim().to_lowercase();
        if RENAME_WORDS.contains(&word.as_str()) {
            Some(Action::Rename)
        } else if DROP_WORDS.contains(&word.as_str()) {
            Some(Action::Drop)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRule {
    pub key: TableKey,
    pub source_column: String,
    pub target_column: String,
    pub action: Action,
}

/// Rules that apply to one loaded sheet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetRules {
    /// canonical source column -> target column
    pub renames: BTreeMap<String, String>,
    /// canonical source columns
    pub drops: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CompiledIndex {
    pub rename_map: BTreeMap<TableKey, BTreeMap<String, String>>,
    pub drop_set: BTreeSet<(TableKey, String)>,
    keys: BTreeSet<TableKey>,
    rules: Vec<IndexRule>,
}

impl CompiledIndex {
    /// Whether any rule names this exact `(file, sheet)`.
    pub fn references(&self, key: &TableKey) -> bool {
        self.keys.contains(key)
    }

    pub fn rules(&self) -> &[IndexRule] {
        &self.rules
    }

    /// Rename rules for the exact key, falling back to the file's `default`
    /// sheet; drop rules from both.
    pub fn rules_for(&self, key: &TableKey) -> SheetRules {
        let default_key = TableKey {
            file: key.file.clone(),
            sheet: DEFAULT_SHEET.to_string(),
        };
        let renames = self
            .rename_map
            .get(key)
            .or_else(|| self.rename_map.get(&default_key))
            .cloned()
            .unwrap_or_default();
        let drops = self
            .drop_set
            .iter()
            .filter(|(k, _)| k == key || *k == default_key)
            .map(|(_, column)| column.clone())
            .collect();
        SheetRules { renames, drops }
    }

    fn insert(
        &mut self,
        rule: IndexRule,
        seen: &mut BTreeMap<(TableKey, String), Action>,
        row: usize,
        warnings: &mut impl WarningSink,
    ) {
        let source = canonical_name(&rule.source_column);
        let slot = (rule.key.clone(), source.clone());
        self.keys.insert(rule.key.clone());

        match (seen.get(&slot).copied(), rule.action) {
            (None, Action::Rename) => {
                self.rename_map
                    .entry(rule.key.clone())
                    .or_default()
                    .insert(source, rule.target_column.clone());
            }
            (None, Action::Drop) => {
                self.drop_set.insert(slot.clone());
            }
            (Some(Action::Rename), Action::Drop) => {
                if let Some(map) = self.rename_map.get_mut(&rule.key) {
                    map.remove(&source);
                }
                self.drop_set.insert(slot.clone());
                warnings.warn(
                    WarningKind::Index,
                    format!(
                        "Index row {}: column '{}' in {}/{} is both renamed and dropped; drop wins",
                        row, rule.source_column, rule.key.file, rule.key.sheet
                    ),
                );
            }
            (Some(Action::Drop), Action::Rename) => {
                warnings.warn(
                    WarningKind::Index,
                    format!(
                        "Index row {}: rename of '{}' in {}/{} ignored, column is already dropped",
                        row, rule.source_column, rule.key.file, rule.key.sheet
                    ),
                );
                return;
            }
            (Some(Action::Rename), Action::Rename) => {
                let existing = self
                    .rename_map
                    .get(&rule.key)
                    .and_then(|m| m.get(&source))
                    .cloned()
                    .unwrap_or_default();
                if existing != rule.target_column {
                    warnings.warn(
                        WarningKind::Index,
                        format!(
                            "Index row {}: '{}' in {}/{} already renamed to '{}'; '{}' ignored",
                            row,
                            rule.source_column,
                            rule.key.file,
                            rule.key.sheet,
                            existing,
                            rule.target_column
                        ),
                    );
                }
                return;
            }
            (Some(Action::Drop), Action::Drop) => return,
        }
        seen.insert(slot, rule.action);
        self.rules.push(rule);
    }
}

fn find_column<'a>(table: &'a Table, candidates: &[&str]) -> Option<&'a [Value]> {
    table
        .columns()
        .iter()
        .find(|c| candidates.contains(&canonical_name(&c.name).as_str()))
        .map(|c| c.values.as_slice())
}

fn cell_text(values: &[Value], row: usize) -> Option<String> {
    values
        .get(row)
        .filter(|v| !v.is_null())
        .map(|v| v.to_string().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Compile the index table into rename and drop rules.
pub fn compile(
    index: &Table,
    warnings: &mut impl WarningSink,
) -> Result<CompiledIndex, PipelineError> {
    let required: [(&str, &[&str]); 5] = [
        ("SourceFile", SOURCE_FILE_COLUMNS),
        ("Sheet", SHEET_COLUMNS),
        ("SourceColumn", SOURCE_COLUMN_COLUMNS),
        ("TargetColumn", TARGET_COLUMN_COLUMNS),
        ("Action", ACTION_COLUMNS),
    ];
    let missing: Vec<&str> = required
        .iter()
        .filter(|(_, candidates)| find_column(index, candidates).is_none())
        .map(|(name, _)| *name)
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "index is missing required columns {:?} (found {:?})",
            missing,
            index.column_names()
        )));
    }

    // Presence checked above.
    let column = |candidates: &[&str]| find_column(index, candidates).unwrap_or(&[]);
    let files = column(SOURCE_FILE_COLUMNS);
    let sheets = column(SHEET_COLUMNS);
    let sources = column(SOURCE_COLUMN_COLUMNS);
    let targets = column(TARGET_COLUMN_COLUMNS);
    let actions = column(ACTION_COLUMNS);

    let mut compiled = CompiledIndex::default();
    let mut seen = BTreeMap::new();

    for row in 0..index.row_count() {
        let line = row + 2; // header is line 1
        let file = cell_text(files, row);
        let sheet = cell_text(sheets, row);
        let source = cell_text(sources, row);
        let action_raw = cell_text(actions, row);

        let (file, sheet, source, action_raw) = match (file, sheet, source, action_raw) {
            (Some(f), Some(s), Some(c), Some(a)) => (f, s, c, a),
            (f, s, c, a) => {
                let blanks: Vec<&str> = [
                    ("SourceFile", f.is_none()),
                    ("Sheet", s.is_none()),
                    ("SourceColumn", c.is_none()),
                    ("Action", a.is_none()),
                ]
                .iter()
                    .filter(|(_, blank)| *blank)
                    .map(|(name, _)| *name)
                    .collect();
                // Fully blank rows are padding, not mistakes.
                if blanks.len() < 4 {
                    warnings.warn(
                        WarningKind::Index,
                        format!("Index row {}: blank {:?}, row skipped", line, blanks),
                    );
                }
                continue;
            }
        };

        let Some(action) = Action::parse(&action_raw) else {
            warnings.warn(
                WarningKind::Index,
                format!("Index row {}: unknown action '{}', row ignored", line, action_raw),
            );
            continue;
        };

        let target = match (action, cell_text(targets, row)) {
            (_, Some(target)) => target,
            (Action::Rename, None) => {
                warnings.warn(
                    WarningKind::Index,
                    format!(
                        "Index row {}: rename of '{}' has no target column, original name kept",
                        line, source
                    ),
                );
                source.clone()
            }
            (Action::Drop, None) => source.clone(),
        };

        let rule = IndexRule {
            key: TableKey::new(&file, &sheet),
            source_column: source,
            target_column: target,
            action,
        };
        compiled.insert(rule, &mut seen, line, warnings);
    }

    tracing::info!(
        sheets = compiled.keys.len(),
        renames = compiled.rename_map.values().map(|m| m.len()).sum::<usize>(),
        drops = compiled.drop_set.len(),
        "index compiled"
    );

    Ok(compiled)
}
