//! Dashboard filters and the options offered for them
//!
//! Filters are applied in a fixed order: date range, relative-year periods,
//! SKUs, months, years, regions. An empty selection means "all".

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::mapping::MappingResolver;
use crate::model::{month_name, UnifiedOrderRow, UnifiedTable};

/// Length of one relative-year period in days.
pub const PERIOD_DAYS: i64 = 365;

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// First to last order date. `None` for no rows.
    pub fn spanning(rows: &[UnifiedOrderRow]) -> Option<Self> {
        let start = rows.iter().map(|r| r.date).min()?;
        let end = rows.iter().map(|r| r.date).max()?;
        Some(Self { start, end })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderFilter {
    pub skus: Vec<String>,
    pub months: Vec<u32>,
    pub years: Vec<i32>,
    pub regions: Vec<String>,
    pub date_range: Option<DateRange>,
    /// 1-based relative-year periods; only honored for a single SKU.
    pub relative_years: Vec<usize>,
}

impl OrderFilter {
    /// The selected SKU when exactly one is selected.
    pub fn single_sku(&self) -> Option<&str> {
        match self.skus.as_slice() {
            [sku] => Some(sku.as_str()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Rows that pass every active filter, in input order.
    ///
    /// Relative-year periods are measured against `rows` as given, before
    /// any other filter narrows them.
    pub fn apply(&self, rows: &[UnifiedOrderRow]) -> Vec<UnifiedOrderRow> {
        let periods: Vec<RelativePeriod> = match self.single_sku() {
            Some(sku) if !self.relative_years.is_empty() => relative_periods(rows, sku)
                .into_iter()
                .filter(|p| self.relative_years.contains(&p.index))
                .collect(),
            _ => Vec::new(),
        };
        let use_periods = self.single_sku().is_some() && !self.relative_years.is_empty();

        rows.iter()
            .filter(|row| self.date_range.map_or(true, |range| range.contains(row.date)))
            .filter(|row| !use_periods || periods.iter().any(|p| p.contains(row.purchased_at)))
            .filter(|row| self.skus.is_empty() || self.skus.contains(&row.sku))
            .filter(|row| self.months.is_empty() || self.months.contains(&row.month))
            .filter(|row| self.years.is_empty() || self.years.contains(&row.year))
            .filter(|row| {
                self.regions.is_empty()
                    || row
                        .shipping_state
                        .as_ref()
                        .is_some_and(|state| self.regions.contains(state))
            })
            .cloned()
            .collect()
    }

    /// Human-readable summary such as `Years: 2023 | Months: March`.
    pub fn describe(&self) -> String {
        self.describe_within(None)
    }

    /// Like [`describe`](Self::describe), but a date range equal to `bounds`
    /// (the whole loaded table) is not a narrowing and is left out.
    pub fn describe_within(&self, bounds: Option<DateRange>) -> String {
        let mut parts = Vec::new();
        if let Some(range) = self.date_range.filter(|r| Some(*r) != bounds) {
            parts.push(format!("Date Range: {} to {}", range.start, range.end));
        }
        if self.single_sku().is_some() && !self.relative_years.is_empty() {
            let labels: Vec<String> = self.relative_years.iter().map(|i| ordinal_label(*i)).collect();
            parts.push(format!("Relative Years: {}", labels.join(", ")));
        }
        if !self.years.is_empty() {
            let years: Vec<String> = self.years.iter().map(|y| y.to_string()).collect();
            parts.push(format!("Years: {}", years.join(", ")));
        }
        if !self.months.is_empty() {
            let months: Vec<&str> = self.months.iter().map(|m| month_name(*m)).collect();
            parts.push(format!("Months: {}", months.join(", ")));
        }
        if parts.is_empty() {
            "All Time".to_string()
        } else {
            parts.join(" | ")
        }
    }
}

/// `1st Year`, `2nd Year`, `11th Year`, ...
pub fn ordinal_label(index: usize) -> String {
    let suffix = match (index % 10, index % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{} Year", index, suffix)
}

/// First and last sale instants of one SKU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SkuDateRange {
    pub first_sale: DateTime<Utc>,
    pub last_sale: DateTime<Utc>,
}

pub fn sku_date_range(rows: &[UnifiedOrderRow], sku: &str) -> Option<SkuDateRange> {
    let mut instants = rows.iter().filter(|r| r.sku == sku).map(|r| r.purchased_at);
    let first = instants.next()?;
    let (first_sale, last_sale) = instants.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t)));
    Some(SkuDateRange { first_sale, last_sale })
}

/// One 365-day window counted from a SKU's first sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelativePeriod {
    /// 1-based.
    pub index: usize,
    pub label: String,
    pub start: DateTime<Utc>,
    /// Inclusive; clipped to the last sale.
    pub end: DateTime<Utc>,
}

impl RelativePeriod {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }
}

/// Consecutive 365-day periods covering a SKU's sales history.
pub fn relative_periods(rows: &[UnifiedOrderRow], sku: &str) -> Vec<RelativePeriod> {
    let Some(range) = sku_date_range(rows, sku) else {
        return Vec::new();
    };
    let total_days = (range.last_sale - range.first_sale).num_days();
    let count = total_days / PERIOD_DAYS + 1;

    (0..count)
        .map(|i| {
            let start = range.first_sale + Duration::days(i * PERIOD_DAYS);
            let end = (start + Duration::days(PERIOD_DAYS - 1)).min(range.last_sale);
            let index = i as usize + 1;
            RelativePeriod {
                index,
                label: ordinal_label(index),
                start,
                end,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthOption {
    pub month: u32,
    pub name: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionOption {
    pub code: String,
    pub name: String,
}

/// Choices offered by the filter panel for a loaded table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterOptions {
    pub skus: Vec<String>,
    pub months: Vec<MonthOption>,
    pub years: Vec<i32>,
    /// Empty when the table has no shipping state column.
    pub regions: Vec<RegionOption>,
    pub date_bounds: Option<DateRange>,
}

impl FilterOptions {
    pub fn build(table: &UnifiedTable, resolver: &MappingResolver) -> Self {
        let skus: BTreeSet<&str> = table.rows.iter().map(|r| r.sku.as_str()).collect();
        let months: BTreeSet<u32> = table.rows.iter().map(|r| r.month).collect();
        let years: BTreeSet<i32> = table.rows.iter().map(|r| r.year).collect();

        let regions = if table.has_shipping_state {
            let names = resolver.region_names();
            resolver
                .valid_regions()
                .into_iter()
                .map(|code| RegionOption {
                    name: names.get(&code).cloned().unwrap_or_else(|| code.clone()),
                    code,
                })
                .collect()
        } else {
            Vec::new()
        };

        let date_bounds = table
            .rows
            .iter()
            .map(|r| r.date)
            .fold(None, |acc: Option<DateRange>, date| {
                Some(match acc {
                    None => DateRange { start: date, end: date },
                    Some(range) => DateRange {
                        start: range.start.min(date),
                        end: range.end.max(date),
                    },
                })
            });

        Self {
            skus: skus.into_iter().map(str::to_string).collect(),
            months: months
                .into_iter()
                .map(|month| MonthOption { month, name: month_name(month) })
                .collect(),
            years: years.into_iter().collect(),
            regions,
            date_bounds,
        }
    }
}
