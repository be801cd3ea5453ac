use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Calendar quarter. Ordered as an ordinal, never as a label string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Quarter {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quarter {
    /// `((month - 1) / 3) + 1`. Month must be 1..=12.
    pub fn from_month(month: u32) -> Option<Self> {
        match month {
            1..=3 => Some(Quarter::Q1),
            4..=6 => Some(Quarter::Q2),
            7..=9 => Some(Quarter::Q3),
            10..=12 => Some(Quarter::Q4),
            _ => None,
        }
    }

    pub fn number(self) -> u32 {
        match self {
            Quarter::Q1 => 1,
            Quarter::Q2 => 2,
            Quarter::Q3 => 3,
            Quarter::Q4 => 4,
        }
    }
}

impl fmt::Display for Quarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}", self.number())
    }
}

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// English month name for 1..=12, "Unknown" otherwise.
pub fn month_name(month: u32) -> &'static str {
    match month {
        1..=12 => MONTH_NAMES[(month - 1) as usize],
        _ => "Unknown",
    }
}

/// One order line as parsed from a single export file.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOrderRecord {
    pub merchant_sku: String,
    pub purchased_at: DateTime<Utc>,
    pub item_price: f64,
    pub promo_discount: f64,
    pub shipped_quantity: f64,
    pub shipping_state: Option<String>,
    pub country_code: Option<String>,
}

/// An order line after merge, calendar derivation and mapping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedOrderRow {
    pub merchant_sku: String,
    /// Canonical SKU; equals `merchant_sku` when no mapping exists.
    pub sku: String,
    pub purchased_at: DateTime<Utc>,
    pub date: NaiveDate,
    pub month: u32,
    pub month_name: &'static str,
    pub year: i32,
    pub quarter: Quarter,
    pub item_price: f64,
    pub promo_discount: f64,
    /// `item_price - promo_discount`; may be negative.
    pub revenue: f64,
    pub shipped_quantity: f64,
    pub shipping_state: Option<String>,
    pub country_code: Option<String>,
}

impl From<RawOrderRecord> for UnifiedOrderRow {
    fn from(raw: RawOrderRecord) -> Self {
        let date = raw.purchased_at.date_naive();
        let month = date.month();
        Self {
            sku: raw.merchant_sku.clone(),
            merchant_sku: raw.merchant_sku,
            purchased_at: raw.purchased_at,
            date,
            month,
            month_name: month_name(month),
            year: date.year(),
            // chrono months are always 1..=12
            quarter: Quarter::from_month(month).unwrap_or(Quarter::Q1),
            item_price: raw.item_price,
            promo_discount: raw.promo_discount,
            revenue: raw.item_price - raw.promo_discount,
            shipped_quantity: raw.shipped_quantity,
            shipping_state: raw.shipping_state,
            country_code: raw.country_code,
        }
    }
}

/// The merged output of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnifiedTable {
    pub rows: Vec<UnifiedOrderRow>,
    /// True when at least one parsed file carried a `Shipping State` column.
    pub has_shipping_state: bool,
}

impl UnifiedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
