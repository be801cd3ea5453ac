//! Reference workbook access
//!
//! The workbook holds the mapping sheets (merchant SKU to SKU, state name to
//! state code) plus any other sheets the dashboard shows as-is. Reads go
//! through calamine; writes rebuild the whole workbook with umya-spreadsheet
//! and swap it in with a rename, so a failed write never touches the file.
//! Writers are serialized per store, and every write gets its own temp file.

use calamine::{open_workbook_auto, Data, Reader};
use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

/// Lowercased sheet names treated as the state reference sheet.
const REGION_SHEET_VARIANTS: &[&str] = &["us state", "us_state", "usstate", "state"];

/// A single worksheet cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Empty,
    Bool(bool),
    Number(f64),
    Date(NaiveDateTime),
    Text(String),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    /// Empty cells and whitespace-only text are blank.
    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Cell rendered as a lookup key. Whole numbers lose their fraction so a
    /// SKU typed as `1234` in the workbook matches `"1234"` in an export.
    pub fn as_key(&self) -> Option<String> {
        match self {
            Cell::Empty => None,
            Cell::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Some(format!("{}", *n as i64)),
            Cell::Number(n) => Some(n.to_string()),
            Cell::Bool(b) => Some(b.to_string()),
            Cell::Date(dt) if dt.time() == NaiveTime::MIN => {
                Some(dt.format("%Y-%m-%d").to_string())
            }
            Cell::Date(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }
}

/// Serial day number of 1970-01-01 in the 1900 date system.
const UNIX_EPOCH_SERIAL: f64 = 25_569.0;

/// Serial day number for a date cell, matching how calamine reads it back
/// (serials below 60 sit before the phantom 1900-02-29).
fn excel_serial(dt: &NaiveDateTime) -> f64 {
    let millis = dt.and_utc().timestamp_millis() as f64;
    let serial = millis / 86_400_000.0 + UNIX_EPOCH_SERIAL;
    if serial < 61.0 {
        serial - 1.0
    } else {
        serial
    }
}

impl From<&Data> for Cell {
    fn from(data: &Data) -> Self {
        match data {
            Data::Empty => Cell::Empty,
            Data::String(s) => Cell::Text(s.clone()),
            Data::Float(f) => Cell::Number(*f),
            Data::Int(i) => Cell::Number(*i as f64),
            Data::Bool(b) => Cell::Bool(*b),
            Data::DateTime(dt) if dt.is_duration() => Cell::Number(dt.as_f64()),
            Data::DateTime(dt) => match dt.as_datetime() {
                Some(value) => Cell::Date(value),
                None => Cell::Number(dt.as_f64()),
            },
            other => Cell::Text(format!("{}", other)),
        }
    }
}

/// Tabular sheet contents: one header row plus data rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Sheet {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn with_row(mut self, row: Vec<Cell>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_columns(&self, names: &[&str]) -> bool {
        names.iter().all(|n| self.column_index(n).is_some())
    }

    pub fn cell(&self, row: usize, col: usize) -> &Cell {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&Cell::Empty)
    }

    /// Pairs of lookup keys from two columns, skipping rows where either is blank.
    pub fn key_pairs(&self, left: &str, right: &str) -> Vec<(String, String)> {
        let (Some(l), Some(r)) = (self.column_index(left), self.column_index(right)) else {
            return Vec::new();
        };
        (0..self.rows.len())
            .filter_map(|i| Some((self.cell(i, l).as_key()?, self.cell(i, r).as_key()?)))
            .collect()
    }

    /// Drop all-blank columns, trim text, drop all-blank rows.
    pub fn cleaned(&self) -> Sheet {
        let keep: Vec<usize> = (0..self.columns.len())
            .filter(|&col| (0..self.rows.len()).any(|row| !self.cell(row, col).is_blank()))
            .collect();

        let columns = keep.iter().map(|&c| self.columns[c].clone()).collect();
        let rows = (0..self.rows.len())
            .map(|row| {
                keep.iter()
                    .map(|&col| match self.cell(row, col) {
                        Cell::Text(s) if s.trim().is_empty() => Cell::Empty,
                        Cell::Text(s) => Cell::Text(s.trim().to_string()),
                        other => other.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|cells| cells.iter().any(|c| !c.is_blank()))
            .collect();

        Sheet { columns, rows }
    }
}

/// Case-insensitive lookup of the state reference sheet.
pub fn match_region_sheet(names: &[String]) -> Option<&str> {
    names
        .iter()
        .find(|name| {
            let lowered = name.trim().to_lowercase();
            REGION_SHEET_VARIANTS.contains(&lowered.as_str())
        })
        .map(String::as_str)
}

/// On-disk reference workbook. Clones share one write lock.
#[derive(Debug, Clone)]
pub struct ReferenceStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl ReferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the parent directory and an empty workbook if none exists.
    pub fn initialize(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        let book = umya_spreadsheet::new_file();
        self.persist(&book)?;
        info!(path = %self.path.display(), "Created empty reference workbook");
        Ok(())
    }

    /// Sheet names in workbook order. Empty when the workbook is unreadable.
    pub fn list_sheets(&self) -> Vec<String> {
        match self.try_list_sheets() {
            Ok(names) => names,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot list reference sheets");
                Vec::new()
            }
        }
    }

    pub fn try_list_sheets(&self) -> Result<Vec<String>> {
        self.initialize()?;
        self.sheet_names_on_disk()
    }

    fn sheet_names_on_disk(&self) -> Result<Vec<String>> {
        let workbook = open_workbook_auto(&self.path)?;
        Ok(workbook.sheet_names())
    }

    /// Cleaned sheet contents. Any read failure yields an empty sheet.
    pub fn read_sheet(&self, name: &str) -> Sheet {
        match self.try_read_raw(name) {
            Ok(sheet) => sheet.cleaned(),
            Err(e) => {
                warn!(sheet = name, error = %e, "Cannot read reference sheet");
                Sheet::default()
            }
        }
    }

    /// Like [`read_sheet`](Self::read_sheet), but `"us state"` resolves to
    /// whatever the state sheet is actually called.
    pub fn sheet(&self, name: &str) -> Sheet {
        if name.trim().eq_ignore_ascii_case("us state") {
            if let Some(actual) = self.region_sheet_name() {
                return self.read_sheet(&actual);
            }
        }
        self.read_sheet(name)
    }

    pub fn region_sheet_name(&self) -> Option<String> {
        match_region_sheet(&self.list_sheets()).map(str::to_string)
    }

    /// Uncleaned sheet contents, exactly as stored.
    pub fn try_read_raw(&self, name: &str) -> Result<Sheet> {
        self.initialize()?;
        self.raw_sheet_on_disk(name)
    }

    fn raw_sheet_on_disk(&self, name: &str) -> Result<Sheet> {
        let mut workbook = open_workbook_auto(&self.path)?;
        let range = workbook.worksheet_range(name)?;

        let mut rows = range.rows();
        let columns = match rows.next() {
            Some(header) => header
                .iter()
                .enumerate()
                .map(|(i, cell)| match Cell::from(cell).as_key() {
                    Some(name) => name,
                    None => format!("Unnamed: {}", i),
                })
                .collect(),
            None => Vec::new(),
        };
        let rows = rows
            .map(|row| row.iter().map(Cell::from).collect())
            .collect();

        Ok(Sheet { columns, rows })
    }

    /// Replace (or append) one sheet, keeping every other sheet as stored.
    /// Returns false on any failure; the workbook on disk is then unchanged.
    pub fn write_sheet(&self, name: &str, sheet: &Sheet) -> bool {
        match self.try_write_sheet(name, sheet) {
            Ok(()) => {
                info!(sheet = name, rows = sheet.rows.len(), "Saved reference sheet");
                true
            }
            Err(e) => {
                warn!(sheet = name, error = %e, "Failed to save reference sheet");
                false
            }
        }
    }

    fn try_write_sheet(&self, name: &str, sheet: &Sheet) -> Result<()> {
        if name.trim().is_empty() {
            return Err(PipelineError::Sheet("sheet name is empty".to_string()));
        }

        self.initialize()?;
        // Held from the read of the current sheets until the rename lands.
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut sheets = Vec::new();
        for existing in self.sheet_names_on_disk()? {
            if existing == name {
                sheets.push((existing, sheet.clone()));
            } else {
                let contents = self.raw_sheet_on_disk(&existing)?;
                sheets.push((existing, contents));
            }
        }
        if !sheets.iter().any(|(n, _)| n == name) {
            sheets.push((name.to_string(), sheet.clone()));
        }

        let mut book = umya_spreadsheet::new_file_empty_worksheet();
        for (sheet_name, contents) in &sheets {
            let worksheet = book.new_sheet(sheet_name).map_err(|e| {
                PipelineError::WorkbookWrite(format!("cannot create sheet '{}': {}", sheet_name, e))
            })?;
            fill_worksheet(worksheet, contents);
        }
        debug!(sheets = sheets.len(), "Rewriting reference workbook");
        self.persist(&book)
    }

    /// Write to a uniquely named sibling temp file, then rename over the
    /// target. The temp file is removed on any failure. Caller holds the lock.
    fn persist(&self, book: &umya_spreadsheet::Spreadsheet) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| PipelineError::io(dir, e))?;
        umya_spreadsheet::writer::xlsx::write_writer(book, &mut tmp)
            .map_err(|e| PipelineError::WorkbookWrite(e.to_string()))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| PipelineError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| PipelineError::io(&self.path, e.error))?;
        Ok(())
    }
}

fn fill_worksheet(worksheet: &mut umya_spreadsheet::Worksheet, sheet: &Sheet) {
    for (col, header) in sheet.columns.iter().enumerate() {
        worksheet
            .get_cell_mut((col as u32 + 1, 1))
            .set_value_string(header.clone());
    }
    for (row_idx, row) in sheet.rows.iter().enumerate() {
        let row_num = row_idx as u32 + 2;
        for (col, cell) in row.iter().enumerate() {
            let coordinate = (col as u32 + 1, row_num);
            match cell {
                Cell::Empty => {}
                Cell::Text(s) => {
                    worksheet.get_cell_mut(coordinate).set_value_string(s.clone());
                }
                Cell::Number(n) => {
                    worksheet.get_cell_mut(coordinate).set_value_number(*n);
                }
                Cell::Bool(b) => {
                    worksheet.get_cell_mut(coordinate).set_value_bool(*b);
                }
                Cell::Date(dt) => {
                    let target = worksheet.get_cell_mut(coordinate);
                    target.set_value_number(excel_serial(dt));
                    target
                        .get_style_mut()
                        .get_number_format_mut()
                        .set_format_code(umya_spreadsheet::NumberingFormat::FORMAT_DATE_YYYYMMDD);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sku_sheet() -> Sheet {
        Sheet::new(["SKU", "Merchant SKU"])
            .with_row(vec![Cell::text("WIDGET-A"), Cell::text("AB-1")])
            .with_row(vec![Cell::text("WIDGET-B"), Cell::text("AB-2")])
    }

    fn state_sheet() -> Sheet {
        Sheet::new(["State Code", "State Name"])
            .with_row(vec![Cell::text("CA"), Cell::text("California")])
            .with_row(vec![Cell::text("NY"), Cell::text("New York")])
    }

    fn store_in(dir: &tempfile::TempDir) -> ReferenceStore {
        ReferenceStore::new(dir.path().join("legend").join("legend.xlsx"))
    }

    // -------------------------------------------------------------------------
    // CELL TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_cell_keys() {
        assert_eq!(Cell::Number(1234.0).as_key(), Some("1234".to_string()));
        assert_eq!(Cell::Number(12.5).as_key(), Some("12.5".to_string()));
        assert_eq!(Cell::text("  AB-1 ").as_key(), Some("AB-1".to_string()));
        assert_eq!(Cell::text("   ").as_key(), None);
        assert_eq!(Cell::Empty.as_key(), None);
    }

    #[test]
    fn test_date_cell_keys() {
        let day = NaiveDate::from_ymd_opt(2023, 3, 14).unwrap();
        assert_eq!(
            Cell::Date(day.and_hms_opt(0, 0, 0).unwrap()).as_key(),
            Some("2023-03-14".to_string())
        );
        assert_eq!(
            Cell::Date(day.and_hms_opt(9, 30, 0).unwrap()).as_key(),
            Some("2023-03-14 09:30:00".to_string())
        );
        assert!(!Cell::Date(day.and_hms_opt(0, 0, 0).unwrap()).is_blank());
    }

    #[test]
    fn test_excel_serial_matches_calamine() {
        use calamine::{ExcelDateTime, ExcelDateTimeType};

        let launch = NaiveDate::from_ymd_opt(2023, 2, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(excel_serial(&launch), 44958.5);

        let data = Data::DateTime(ExcelDateTime::new(44958.5, ExcelDateTimeType::DateTime, false));
        assert_eq!(Cell::from(&data), Cell::Date(launch));

        let span = Data::DateTime(ExcelDateTime::new(1.5, ExcelDateTimeType::TimeDelta, false));
        assert_eq!(Cell::from(&span), Cell::Number(1.5));
    }

    // -------------------------------------------------------------------------
    // CLEANING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_clean_drops_blank_columns_and_rows() {
        let sheet = Sheet::new(["SKU", "Notes", "Merchant SKU", "Blank"])
            .with_row(vec![Cell::text(" WIDGET-A "), Cell::Empty, Cell::text("AB-1"), Cell::text(" ")])
            .with_row(vec![Cell::Empty, Cell::Empty, Cell::text("  "), Cell::Empty])
            .with_row(vec![Cell::text("WIDGET-B"), Cell::Empty, Cell::Number(42.0), Cell::Empty]);

        let cleaned = sheet.cleaned();
        assert_eq!(cleaned.columns, vec!["SKU", "Merchant SKU"]);
        assert_eq!(cleaned.rows.len(), 2);
        assert_eq!(cleaned.rows[0], vec![Cell::text("WIDGET-A"), Cell::text("AB-1")]);
        assert_eq!(cleaned.rows[1], vec![Cell::text("WIDGET-B"), Cell::Number(42.0)]);
    }

    #[test]
    fn test_key_pairs_skip_incomplete_rows() {
        let sheet = sku_sheet().with_row(vec![Cell::text("WIDGET-C"), Cell::Empty]);
        let pairs = sheet.key_pairs("Merchant SKU", "SKU");
        assert_eq!(
            pairs,
            vec![
                ("AB-1".to_string(), "WIDGET-A".to_string()),
                ("AB-2".to_string(), "WIDGET-B".to_string()),
            ]
        );
        assert!(sheet.key_pairs("Missing", "SKU").is_empty());
    }

    // -------------------------------------------------------------------------
    // REGION SHEET MATCHING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_region_sheet_variants() {
        for variant in ["us state", "US State", "US_STATE", "USState", "State"] {
            let names = vec!["Products".to_string(), variant.to_string()];
            assert_eq!(match_region_sheet(&names), Some(variant));
        }
    }

    #[test]
    fn test_region_sheet_first_match_wins() {
        let names = vec!["State".to_string(), "US State".to_string()];
        assert_eq!(match_region_sheet(&names), Some("State"));
    }

    #[test]
    fn test_region_sheet_absent() {
        let names = vec!["Products".to_string(), "States of mind".to_string()];
        assert_eq!(match_region_sheet(&names), None);
    }

    // -------------------------------------------------------------------------
    // STORE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_list_sheets_creates_empty_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(!store.path().exists());

        let sheets = store.list_sheets();
        assert!(store.path().exists());
        assert_eq!(sheets, vec!["Sheet1".to_string()]);
        assert!(store.read_sheet("Sheet1").is_empty());
    }

    #[test]
    fn test_read_missing_sheet_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let sheet = store.read_sheet("Nope");
        assert!(sheet.columns.is_empty());
        assert!(sheet.is_empty());
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert!(store.write_sheet("Products", &sku_sheet()));
        let read = store.read_sheet("Products");
        assert_eq!(read, sku_sheet());
    }

    #[test]
    fn test_write_preserves_other_sheets() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert!(store.write_sheet("Products", &sku_sheet()));
        assert!(store.write_sheet("US State", &state_sheet()));
        let before = store.read_sheet("US State");
        let order_before = store.list_sheets();

        let updated = sku_sheet().with_row(vec![Cell::text("WIDGET-C"), Cell::text("AB-3")]);
        assert!(store.write_sheet("Products", &updated));

        assert_eq!(store.list_sheets(), order_before);
        assert_eq!(store.read_sheet("US State"), before);
        assert_eq!(store.read_sheet("Products").rows.len(), 3);
    }

    #[test]
    fn test_write_keeps_numeric_and_text_types() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let sheet = Sheet::new(["Merchant SKU", "Units"])
            .with_row(vec![Cell::text("00123"), Cell::Number(4.0)]);

        assert!(store.write_sheet("Mixed", &sheet));
        let read = store.read_sheet("Mixed");
        assert_eq!(read.rows[0][0], Cell::text("00123"));
        assert_eq!(read.rows[0][1], Cell::Number(4.0));
    }

    #[test]
    fn test_date_cells_survive_rewrite_of_other_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let launched = NaiveDate::from_ymd_opt(2023, 3, 14)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let launches = Sheet::new(["SKU", "Launched"])
            .with_row(vec![Cell::text("WIDGET-A"), Cell::Date(launched)]);

        assert!(store.write_sheet("Launches", &launches));
        assert_eq!(store.read_sheet("Launches"), launches);

        assert!(store.write_sheet("Products", &sku_sheet()));
        assert!(store.write_sheet("Products", &sku_sheet()));
        assert_eq!(store.read_sheet("Launches").rows[0][1], Cell::Date(launched));
    }

    #[test]
    fn test_concurrent_writes_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.initialize().unwrap();

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let name = format!("Sheet{}", i + 10);
                    (name.clone(), store.write_sheet(&name, &sku_sheet()))
                })
            })
            .collect();
        let results: Vec<(String, bool)> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let names = store.list_sheets();
        for (name, saved) in &results {
            assert!(saved, "write of {} failed", name);
            assert!(names.contains(name), "{} missing from {:?}", name, names);
        }
        assert_eq!(names.len(), 7);
        let leftovers: Vec<_> = fs::read_dir(store.path().parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path() != store.path())
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_rejects_empty_name_without_touching_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.write_sheet("Products", &sku_sheet()));
        let bytes_before = fs::read(store.path()).unwrap();

        assert!(!store.write_sheet("  ", &sku_sheet()));
        assert_eq!(fs::read(store.path()).unwrap(), bytes_before);
    }

    #[test]
    fn test_write_fails_on_corrupt_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"not a workbook").unwrap();

        assert!(!store.write_sheet("Products", &sku_sheet()));
        assert_eq!(fs::read(store.path()).unwrap(), b"not a workbook");
        assert!(store.list_sheets().is_empty());
    }

    #[test]
    fn test_state_sheet_alias() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.write_sheet("US_STATE", &state_sheet()));

        assert_eq!(store.region_sheet_name(), Some("US_STATE".to_string()));
        assert_eq!(store.sheet("us state"), state_sheet());
    }
}
