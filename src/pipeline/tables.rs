//! Table extraction: recover rectangular records from Markdown pipe tables.
//!
//! Detection is a line-scanning state machine rather than one big regex, so
//! back-to-back and malformed tables have a well-defined outcome:
//!
//! * A region opens on a `|`-delimited row immediately followed by a
//!   separator row (`| --- | :-: |`) with the same number of cells.
//! * It closes at the first blank line or line that is not a row.
//! * Inside a region, a row that is itself followed by a matching separator
//!   closes the current region and opens the next one. Any other separator
//!   row is stray and dropped.
//! * Lines inside fenced code blocks never open a region.
//!
//! Normalisation turns each region into a [`TabularRecord`]: unique column
//! names, every row exactly as wide as the header, cell markup stripped and
//! values kept as strings.

use crate::error::{MalformedTableError, Ocr2MdError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Value stored for a cell the source row did not have.
pub const EMPTY_CELL: &str = "";

/// Regions with a wider header than this are rejected as malformed.
pub const MAX_TABLE_COLUMNS: usize = 256;

/// A contiguous span of lines recognised as a table. Line numbers are 0-based
/// and inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRegion {
    pub start_line: usize,
    pub end_line: usize,
    pub header: String,
    pub body: Vec<String>,
}

/// A normalised, rectangular table.
///
/// Every row has exactly `columns.len()` cells, in column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabularRecord {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TabularRecord {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Cell at (`row`, `column`), by column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row).map(|r| r[col].as_str())
    }

    /// Row `i` as a column-name → value mapping.
    pub fn row_map(&self, i: usize) -> Option<HashMap<&str, &str>> {
        let row = self.rows.get(i)?;
        Some(
            self.columns
                .iter()
                .map(String::as_str)
                .zip(row.iter().map(String::as_str))
                .collect(),
        )
    }
}

/// Result of scanning one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableExtraction {
    /// One record per well-formed region, in document order.
    pub tables: Vec<TabularRecord>,
    /// Regions that could not be normalised.
    pub skipped: Vec<MalformedTableError>,
}

/// Scans Markdown for pipe tables and normalises them.
#[derive(Debug, Clone)]
pub struct TableExtractor {
    max_columns: usize,
}

impl Default for TableExtractor {
    fn default() -> Self {
        Self {
            max_columns: MAX_TABLE_COLUMNS,
        }
    }
}

impl TableExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_columns(max_columns: usize) -> Self {
        Self { max_columns }
    }

    /// Detect regions and normalise each one. Never fails as a whole:
    /// malformed regions are logged and reported in `skipped`.
    pub fn extract(&self, markdown: &str) -> TableExtraction {
        let mut out = TableExtraction::default();
        for (i, region) in self.detect(markdown).iter().enumerate() {
            match self.normalize(i, region) {
                Ok(record) => out.tables.push(record),
                Err(e) => {
                    warn!("{}", e);
                    out.skipped.push(e);
                }
            }
        }
        debug!(
            "Table extraction: {} tables, {} skipped",
            out.tables.len(),
            out.skipped.len()
        );
        out
    }

    /// Find table regions in document order.
    pub fn detect(&self, markdown: &str) -> Vec<TableRegion> {
        let lines: Vec<&str> = markdown.lines().collect();
        let mut regions = Vec::new();
        let mut current: Option<TableRegion> = None;
        let mut in_fence = false;
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];

            if let Some(region) = current.as_mut() {
                if !is_row(line) {
                    regions.extend(current.take());
                    // Re-examine this line outside the region.
                    continue;
                }
                if opens_table(&lines, i) {
                    regions.extend(current.take());
                    current = Some(open_region(&lines, i));
                    i += 2;
                    continue;
                }
                if is_separator(line) {
                    debug!("Dropping stray separator row at line {}", i);
                } else {
                    region.body.push(line.to_string());
                }
                region.end_line = i;
                i += 1;
                continue;
            }

            if is_fence(line) {
                in_fence = !in_fence;
            } else if !in_fence && opens_table(&lines, i) {
                current = Some(open_region(&lines, i));
                i += 2;
                continue;
            }
            i += 1;
        }
        regions.extend(current);
        regions
    }

    /// Turn one region into a rectangular record.
    ///
    /// `ordinal` is the region's position among all detected regions and
    /// only used for error reporting.
    pub fn normalize(
        &self,
        ordinal: usize,
        region: &TableRegion,
    ) -> Result<TabularRecord, MalformedTableError> {
        let malformed = |reason: String| MalformedTableError {
            region: ordinal,
            start_line: region.start_line,
            end_line: region.end_line,
            reason,
        };

        let header = split_cells(&region.header);
        if header.is_empty() {
            return Err(malformed("header row has no cells".into()));
        }
        if header.len() > self.max_columns {
            return Err(malformed(format!(
                "header has {} columns (limit {})",
                header.len(),
                self.max_columns
            )));
        }

        let columns = dedup_names(
            header
                .iter()
                .enumerate()
                .map(|(i, raw)| {
                    let name = clean_cell(raw);
                    if name.is_empty() {
                        format!("Column_{}", i + 1)
                    } else {
                        name
                    }
                })
                .collect(),
        );
        let width = columns.len();

        let mut rows = Vec::with_capacity(region.body.len());
        for raw in &region.body {
            let mut cells: Vec<String> = split_cells(raw).iter().map(|c| clean_cell(c)).collect();
            if cells.iter().all(|c| c.is_empty()) {
                continue;
            }
            if cells.len() > width {
                let overflow = cells.split_off(width);
                let last = &mut cells[width - 1];
                let joined = std::iter::once(last.as_str())
                    .chain(overflow.iter().map(String::as_str))
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");
                *last = joined;
            }
            cells.resize(width, EMPTY_CELL.to_string());
            rows.push(cells);
        }

        Ok(TabularRecord { columns, rows })
    }
}

/// Read a Markdown file and extract its tables.
pub fn extract_tables_from_path(path: &Path) -> Result<TableExtraction, Ocr2MdError> {
    let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Ocr2MdError::FileNotFound {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::PermissionDenied => Ocr2MdError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => Ocr2MdError::InvalidDocument {
            path: path.to_path_buf(),
            detail: e.to_string(),
        },
    })?;
    Ok(TableExtractor::new().extract(&text))
}

/// Write each table to `dir/table_<n>.csv` (1-based), header first.
///
/// Creates `dir` if needed. Returns the written paths in table order.
pub fn write_tables_csv(
    tables: &[TabularRecord],
    dir: &Path,
) -> Result<Vec<PathBuf>, Ocr2MdError> {
    std::fs::create_dir_all(dir).map_err(|e| Ocr2MdError::OutputWriteFailed {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut written = Vec::with_capacity(tables.len());
    for (i, table) in tables.iter().enumerate() {
        let path = dir.join(format!("table_{}.csv", i + 1));
        let export_err = |detail: String| Ocr2MdError::TableExportFailed {
            path: path.clone(),
            detail,
        };

        let mut writer = csv::Writer::from_path(&path).map_err(|e| export_err(e.to_string()))?;
        writer
            .write_record(&table.columns)
            .map_err(|e| export_err(e.to_string()))?;
        for row in &table.rows {
            writer
                .write_record(row)
                .map_err(|e| export_err(e.to_string()))?;
        }
        writer.flush().map_err(|e| export_err(e.to_string()))?;
        written.push(path);
    }

    info!("Wrote {} tables to {}", written.len(), dir.display());
    Ok(written)
}

// ── Row recognition ──────────────────────────────────────────────────────

fn is_fence(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("```") || t.starts_with("~~~")
}

/// A non-blank line with at least one unescaped pipe.
fn is_row(line: &str) -> bool {
    let mut escaped = false;
    for c in line.trim().chars() {
        match c {
            '\\' if !escaped => escaped = true,
            '|' if !escaped => return true,
            _ => escaped = false,
        }
    }
    false
}

/// At least three dashes, so `| - | - |` placeholder rows stay data.
static RE_SEPARATOR_CELL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^:?-{3,}:?$").unwrap());

fn is_separator(line: &str) -> bool {
    if !is_row(line) {
        return false;
    }
    let cells = split_cells(line);
    !cells.is_empty() && cells.iter().all(|c| RE_SEPARATOR_CELL.is_match(c.trim()))
}

/// Header row at `i` with a separator of the same arity at `i + 1`.
fn opens_table(lines: &[&str], i: usize) -> bool {
    let (Some(header), Some(sep)) = (lines.get(i), lines.get(i + 1)) else {
        return false;
    };
    is_row(header)
        && !is_separator(header)
        && is_separator(sep)
        && split_cells(header).len() == split_cells(sep).len()
}

fn open_region(lines: &[&str], i: usize) -> TableRegion {
    TableRegion {
        start_line: i,
        end_line: i + 1,
        header: lines[i].to_string(),
        body: Vec::new(),
    }
}

/// Split on unescaped pipes, dropping the empty cells produced by a leading
/// and a trailing pipe. `\|` becomes a literal `|` inside the cell.
fn split_cells(line: &str) -> Vec<String> {
    let t = line.trim();
    let mut cells = Vec::new();
    let mut cur = String::new();
    let mut chars = t.chars().peekable();
    let mut trailing_pipe = false;

    while let Some(c) = chars.next() {
        trailing_pipe = false;
        match c {
            '\\' if chars.peek() == Some(&'|') => {
                cur.push('|');
                chars.next();
            }
            '|' => {
                cells.push(std::mem::take(&mut cur));
                trailing_pipe = true;
            }
            _ => cur.push(c),
        }
    }
    if !trailing_pipe {
        cells.push(cur);
    }

    if t.starts_with('|') && !cells.is_empty() {
        cells.remove(0);
    }
    cells.into_iter().map(|c| c.trim().to_string()).collect()
}

// ── Cell cleanup ─────────────────────────────────────────────────────────

static RE_BR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static RE_BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static RE_BOLD_UNDERSCORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"__([^_]+)__").unwrap());
static RE_STRIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"~~([^~]+)~~").unwrap());
static RE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]*)`").unwrap());
static RE_ITALIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*([^*\s](?:[^*]*[^*\s])?)\*").unwrap());
static RE_ITALIC_UNDERSCORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|[^\w])_([^_\s](?:[^_]*[^_\s])?)_([^\w]|$)").unwrap());
static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Plain text of a cell: emphasis, code spans and `<br>` removed, whitespace
/// collapsed. Numbers are left exactly as written.
fn clean_cell(raw: &str) -> String {
    let s = RE_BR.replace_all(raw, " ");
    let s = RE_CODE.replace_all(&s, "$1");
    let s = RE_BOLD.replace_all(&s, "$1");
    let s = RE_BOLD_UNDERSCORE.replace_all(&s, "$1");
    let s = RE_STRIKE.replace_all(&s, "$1");
    let s = RE_ITALIC.replace_all(&s, "$1");
    let s = RE_ITALIC_UNDERSCORE.replace_all(&s, "$1$2$3");
    RE_SPACES.replace_all(s.trim(), " ").into_owned()
}

/// Make names unique: the second `Total` becomes `Total_2`, the third
/// `Total_3`, skipping any suffix already taken by a literal header.
fn dedup_names(names: Vec<String>) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::with_capacity(names.len());
    let mut next_suffix: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::with_capacity(names.len());

    for name in names {
        if taken.insert(name.clone()) {
            out.push(name);
            continue;
        }
        let counter = next_suffix.entry(name.clone()).or_insert(2);
        let unique = loop {
            let candidate = format!("{}_{}", name, counter);
            *counter += 1;
            if !taken.contains(&candidate) {
                break candidate;
            }
        };
        taken.insert(unique.clone());
        out.push(unique);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn single(md: &str) -> TabularRecord {
        let out = TableExtractor::new().extract(md);
        assert_eq!(out.tables.len(), 1, "expected one table in {md:?}");
        out.tables.into_iter().next().unwrap()
    }

    #[test]
    fn split_cells_handles_outer_pipes_and_escapes() {
        assert_eq!(split_cells("|A|B|C|"), vec!["A", "B", "C"]);
        assert_eq!(split_cells("A | B"), vec!["A", "B"]);
        assert_eq!(split_cells("| a \\| b | c |"), vec!["a | b", "c"]);
        assert_eq!(split_cells("| | x |"), vec!["", "x"]);
        assert!(split_cells("|").is_empty());
    }

    #[test]
    fn separator_recognition() {
        assert!(is_separator("|---|:---:|---:|"));
        assert!(is_separator("| --- | --- |"));
        assert!(!is_separator("| - | 5 |"));
        assert!(!is_separator("| - | - |"));
        assert!(!is_separator("|--|:-:|"));
        assert!(!is_separator("plain text"));
    }

    #[test]
    fn row_padding() {
        let t = single("|A|B|C|\n|---|---|---|\n|1|2|\n");
        assert_eq!(t.columns, vec!["A", "B", "C"]);
        let row = t.row_map(0).unwrap();
        assert_eq!(row["A"], "1");
        assert_eq!(row["B"], "2");
        assert_eq!(row["C"], EMPTY_CELL);
    }

    #[test]
    fn overflow_is_merged_into_last_column() {
        let t = single("|A|B|\n|---|---|\n|1|2|extra|\n");
        assert_eq!(t.rows, vec![vec!["1".to_string(), "2 extra".to_string()]]);
    }

    #[test]
    fn header_dedup() {
        let t = single("|Total|Total|\n|---|---|\n|1|2|\n");
        assert_eq!(t.columns, vec!["Total", "Total_2"]);
    }

    #[test]
    fn header_dedup_skips_taken_suffix() {
        let t = single("|Total|Total_2|Total|\n|---|---|---|\n|1|2|3|\n");
        assert_eq!(t.columns, vec!["Total", "Total_2", "Total_3"]);
    }

    #[test]
    fn empty_header_cells_are_named() {
        let t = single("| | Q1 | Q2 |\n|---|---|---|\n| Revenue | 10 | 12 |\n");
        assert_eq!(t.columns, vec!["Column_1", "Q1", "Q2"]);
        assert_eq!(t.get(0, "Column_1"), Some("Revenue"));
    }

    #[test]
    fn empty_rows_are_dropped_without_ending_region() {
        let t = single("|A|B|\n|---|---|\n|1|2|\n| | |\n|3|4|\n");
        assert_eq!(t.row_count(), 2);
        assert_eq!(t.get(1, "A"), Some("3"));
    }

    #[test]
    fn markup_stripped_numbers_kept_as_text() {
        let t = single(
            "| Item | Amount |\n|---|---|\n| **Net** _income_ | `1,234.50` |\n| line<br>two | 007 |\n| snake_case_name | ~~old~~ |\n",
        );
        assert_eq!(t.get(0, "Item"), Some("Net income"));
        assert_eq!(t.get(0, "Amount"), Some("1,234.50"));
        assert_eq!(t.get(1, "Item"), Some("line two"));
        assert_eq!(t.get(1, "Amount"), Some("007"));
        assert_eq!(t.get(2, "Item"), Some("snake_case_name"));
        assert_eq!(t.get(2, "Amount"), Some("old"));
    }

    #[test]
    fn region_ends_at_blank_or_text_line() {
        let md = "|A|B|\n|---|---|\n|1|2|\nSome prose.\n|3|4|\n\n|C|D|\n|---|---|\n|5|6|\n";
        let out = TableExtractor::new().extract(md);
        assert_eq!(out.tables.len(), 2);
        assert_eq!(out.tables[0].row_count(), 1);
        assert_eq!(out.tables[1].columns, vec!["C", "D"]);
    }

    #[test]
    fn back_to_back_tables_are_not_merged() {
        let md = "|A|B|\n|---|---|\n|1|2|\n|A|B|\n|---|---|\n|3|4|\n";
        let regions = TableExtractor::new().detect(md);
        assert_eq!(regions.len(), 2);
        assert_eq!((regions[0].start_line, regions[0].end_line), (0, 2));
        assert_eq!((regions[1].start_line, regions[1].end_line), (3, 5));
    }

    #[test]
    fn stray_separator_is_dropped() {
        let t = single("|A|B|\n|---|---|\n|---|---|\n|1|2|\n|3|4|\n");
        assert_eq!(t.row_count(), 2);
        assert_eq!(t.get(0, "A"), Some("1"));
    }

    #[test]
    fn row_followed_by_separator_starts_new_table() {
        let out = TableExtractor::new().extract("|A|B|\n|---|---|\n|1|2|\n|---|---|\n|3|4|\n");
        assert_eq!(out.tables.len(), 2);
        assert_eq!(out.tables[0].row_count(), 0);
        assert_eq!(out.tables[1].columns, vec!["1", "2"]);
    }

    #[test]
    fn dash_placeholder_row_stays_data() {
        let t = single(
            "| Item | Q1 | Q2 |\n|---|---|---|\n| Revenue | 10 | 12 |\n| - | - | - |\n| Costs | 4 | 5 |\n",
        );
        assert_eq!(t.columns, vec!["Item", "Q1", "Q2"]);
        assert_eq!(t.row_count(), 3);
        assert_eq!(t.rows[1], vec!["-", "-", "-"]);
        assert_eq!(t.get(2, "Item"), Some("Costs"));
    }

    #[test]
    fn dash_row_after_header_separator_is_kept() {
        let t = single("| A | B |\n|---|---|\n| - | - |\n| 1 | 2 |");
        assert_eq!(t.row_count(), 2);
        assert_eq!(t.get(0, "A"), Some("-"));
        assert_eq!(t.get(1, "B"), Some("2"));
    }

    #[test]
    fn header_without_separator_is_not_a_table() {
        let out = TableExtractor::new().extract("|A|B|\n|1|2|\n");
        assert!(out.tables.is_empty());
        assert!(out.skipped.is_empty());
    }

    #[test]
    fn separator_arity_must_match() {
        let out = TableExtractor::new().extract("|A|B|C|\n|---|---|\n|1|2|3|\n");
        assert!(out.tables.is_empty());
    }

    #[test]
    fn fenced_code_is_ignored() {
        let md = "```\n|A|B|\n|---|---|\n|1|2|\n```\n";
        assert!(TableExtractor::new().extract(md).tables.is_empty());
    }

    #[test]
    fn too_wide_region_is_skipped_not_fatal() {
        let md = "|A|B|C|\n|---|---|---|\n|1|2|3|\n\n|X|Y|\n|---|---|\n|9|8|\n";
        let out = TableExtractor::with_max_columns(2).extract(md);
        assert_eq!(out.tables.len(), 1);
        assert_eq!(out.tables[0].columns, vec!["X", "Y"]);
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].region, 0);
        assert_eq!(out.skipped[0].start_line, 0);
    }

    #[test]
    fn two_columns_three_rows() {
        let md = "# Report\n\nIntro.\n\n| Name | Score |\n|------|------:|\n| Ann | 91 |\n| Bob | 78 |\n| Cy | 85 |\n\nDone.\n";
        let t = single(md);
        assert_eq!((t.column_count(), t.row_count()), (2, 3));
    }

    #[test]
    fn no_tables_is_fine() {
        let out = TableExtractor::new().extract("# Title\n\nJust text.\n");
        assert_eq!(out, TableExtraction::default());
    }

    #[test]
    fn writes_csv_files() {
        let dir = TempDir::new().unwrap();
        let tables = vec![
            TabularRecord {
                columns: vec!["A".into(), "B".into()],
                rows: vec![vec!["1".into(), "x, y".into()]],
            },
            TabularRecord {
                columns: vec!["C".into()],
                rows: vec![],
            },
        ];
        let out_dir = dir.path().join("tables_csv_doc");
        let paths = write_tables_csv(&tables, &out_dir).unwrap();
        assert_eq!(paths, vec![out_dir.join("table_1.csv"), out_dir.join("table_2.csv")]);
        let first = std::fs::read_to_string(&paths[0]).unwrap();
        assert_eq!(first, "A,B\n1,\"x, y\"\n");
        assert_eq!(std::fs::read_to_string(&paths[1]).unwrap(), "C\n");
    }

    #[test]
    fn extract_from_missing_file() {
        assert!(matches!(
            extract_tables_from_path(Path::new("/no/such/file.md")),
            Err(Ocr2MdError::FileNotFound { .. })
        ));
    }
}
