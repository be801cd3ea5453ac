//! Order export ingestion
//!
//! Every `*.csv` under the source directory is parsed on its own. A file
//! that cannot be read or lacks a required column is reported and skipped;
//! rows with an unusable timestamp or a blank SKU are dropped silently.
//! Surviving rows are merged in file order (no dedup), enriched with
//! calendar fields and revenue, then passed through the mapping resolver.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::SOURCE_EXTENSION;
use crate::error::{PipelineError, Result};
use crate::mapping::MappingResolver;
use crate::model::{RawOrderRecord, UnifiedOrderRow, UnifiedTable};

pub const COL_MERCHANT_SKU: &str = "Merchant SKU";
pub const COL_PURCHASE_DATE: &str = "Purchase Date";
pub const COL_ITEM_PRICE: &str = "Item Price";
pub const COL_PROMO_DISCOUNT: &str = "Item Promo Discount";
pub const COL_SHIPPED_QUANTITY: &str = "Shipped Quantity";
pub const COL_SHIPPING_STATE: &str = "Shipping State";
pub const COL_COUNTRY_CODE: &str = "Shipping Country Code";

/// Timestamp layouts carrying an explicit offset.
const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %z",
];

/// Timestamp layouts without an offset; read as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// Why a load produced what it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Loaded,
    /// Source directory missing or holding no export files.
    SourceUnavailable,
    /// Files were found but none yielded a usable row.
    NoValidRows,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    SourceUnavailable { path: PathBuf, reason: String },
    FileParseFailure { path: PathBuf, reason: String },
}

impl Diagnostic {
    pub fn message(&self) -> String {
        match self {
            Diagnostic::SourceUnavailable { path, reason } => {
                format!("No order files in {}: {}", path.display(), reason)
            }
            Diagnostic::FileParseFailure { path, reason } => {
                format!("Error reading file {}: {}", path.display(), reason)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub status: LoadStatus,
    pub table: UnifiedTable,
    pub diagnostics: Vec<Diagnostic>,
    pub files_found: usize,
    pub files_parsed: usize,
    pub rows_read: usize,
    pub rows_rejected: usize,
}

impl LoadReport {
    fn unavailable(root: &Path, reason: impl Into<String>) -> Self {
        let diagnostic = Diagnostic::SourceUnavailable {
            path: root.to_path_buf(),
            reason: reason.into(),
        };
        warn!("{}", diagnostic.message());
        Self {
            status: LoadStatus::SourceUnavailable,
            table: UnifiedTable::default(),
            diagnostics: vec![diagnostic],
            files_found: 0,
            files_parsed: 0,
            rows_read: 0,
            rows_rejected: 0,
        }
    }
}

/// Rows parsed from one export file.
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub records: Vec<RawOrderRecord>,
    pub has_shipping_state: bool,
    pub rows_read: usize,
}

/// Export files directly under `root`, sorted by path.
pub fn discover_sources(root: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(root).map_err(|e| PipelineError::io(root, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| PipelineError::io(root, e))?.path();
        let is_export = path.is_file()
            && path.extension().and_then(|ext| ext.to_str()) == Some(SOURCE_EXTENSION);
        if is_export {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Parse a timestamp into UTC. Unzoned values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ZONED_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    let naive = s
        .strip_suffix(" UTC")
        .or_else(|| s.strip_suffix('Z'))
        .unwrap_or(s);
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Some(dt.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(naive, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}

/// Numeric coercion: anything unparsable or non-finite counts as zero.
pub fn parse_amount(raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => value,
        _ => 0.0,
    }
}

fn optional_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| raw.to_string())
}

/// Parse the contents of one export file.
pub fn parse_orders(content: &str) -> Result<ParsedFile> {
    // Remove UTF-8 BOM if present
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(content.as_bytes());

    let headers = reader.headers()?.clone();
    let column = |name: &'static str| headers.iter().position(|h| h == name);
    let required = |name: &'static str| column(name).ok_or(PipelineError::MissingColumn(name));

    let sku_col = required(COL_MERCHANT_SKU)?;
    let date_col = required(COL_PURCHASE_DATE)?;
    let price_col = required(COL_ITEM_PRICE)?;
    let discount_col = required(COL_PROMO_DISCOUNT)?;
    let quantity_col = required(COL_SHIPPED_QUANTITY)?;
    let state_col = column(COL_SHIPPING_STATE);
    let country_col = column(COL_COUNTRY_CODE);

    let mut parsed = ParsedFile {
        has_shipping_state: state_col.is_some(),
        ..ParsedFile::default()
    };

    for result in reader.records() {
        let record = result?;
        parsed.rows_read += 1;
        let field = |idx: usize| record.get(idx).unwrap_or("");

        let Some(purchased_at) = parse_timestamp(field(date_col)) else {
            continue;
        };

        parsed.records.push(RawOrderRecord {
            merchant_sku: field(sku_col).trim().to_string(),
            purchased_at,
            item_price: parse_amount(field(price_col)),
            promo_discount: parse_amount(field(discount_col)),
            shipped_quantity: parse_amount(field(quantity_col)),
            shipping_state: state_col.and_then(|c| optional_text(field(c))),
            country_code: country_col.and_then(|c| optional_text(field(c))),
        });
    }

    Ok(parsed)
}

pub fn parse_order_file(path: &Path) -> Result<ParsedFile> {
    let content = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    parse_orders(&content)
}

/// Run a full, uncached ingestion of `root`.
pub fn load(root: &Path, resolver: &MappingResolver) -> LoadReport {
    let files = match discover_sources(root) {
        Ok(files) if files.is_empty() => {
            return LoadReport::unavailable(root, "no .csv files found");
        }
        Ok(files) => files,
        Err(e) => return LoadReport::unavailable(root, e.to_string()),
    };

    let mut diagnostics = Vec::new();
    let mut has_shipping_state = false;
    let mut rows_read = 0;
    let mut files_parsed = 0;
    let mut rows = Vec::new();

    for path in &files {
        match parse_order_file(path) {
            Ok(parsed) => {
                debug!(
                    file = %path.display(),
                    rows = parsed.rows_read,
                    kept = parsed.records.len(),
                    "Parsed order file"
                );
                files_parsed += 1;
                rows_read += parsed.rows_read;
                has_shipping_state |= parsed.has_shipping_state;
                rows.extend(parsed.records.into_iter().map(UnifiedOrderRow::from));
            }
            Err(e) => {
                let diagnostic = Diagnostic::FileParseFailure {
                    path: path.clone(),
                    reason: e.to_string(),
                };
                warn!("{}", diagnostic.message());
                diagnostics.push(diagnostic);
            }
        }
    }

    rows.retain(|row| !row.merchant_sku.is_empty());

    let table = resolver.apply_to(UnifiedTable {
        rows,
        has_shipping_state,
    });

    let status = if table.is_empty() {
        LoadStatus::NoValidRows
    } else {
        LoadStatus::Loaded
    };

    info!(
        files = files.len(),
        parsed = files_parsed,
        rows_read,
        rows = table.len(),
        ?status,
        "Loaded order data"
    );

    LoadReport {
        status,
        rows_rejected: rows_read - table.len(),
        table,
        diagnostics,
        files_found: files.len(),
        files_parsed,
        rows_read,
    }
}
