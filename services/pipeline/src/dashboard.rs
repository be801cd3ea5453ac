//! One filtered dashboard, computed in a single pass over the loaded table

use serde::Serialize;

use crate::aggregate::{
    daily_sales_by_year, geo_metrics, monthly_breakdown, quarterly_metrics, sku_metrics,
    sku_yearly_sales, top_line_metrics, DailyRow, GeoRow, MonthlyRow, QuarterlyMetricRow,
    SkuMetricRow, SkuYearRow, TopLineMetrics,
};
use crate::filter::{
    relative_periods, sku_date_range, DateRange, OrderFilter, RelativePeriod, SkuDateRange,
};
use crate::model::UnifiedTable;

/// Sales section: a single SKU's monthly series, or every SKU by year.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum SkuSales {
    Single {
        sku: String,
        monthly: Vec<MonthlyRow>,
        /// Measured on the unfiltered table.
        date_range: Option<SkuDateRange>,
        /// Selected relative-year periods, if any.
        periods: Vec<RelativePeriod>,
    },
    ByYear {
        rows: Vec<SkuYearRow>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardView {
    pub title: String,
    pub row_count: usize,
    pub top_line: TopLineMetrics,
    pub sku_sales: SkuSales,
    /// Absent when specific months are selected.
    pub quarterly: Option<Vec<QuarterlyMetricRow>>,
    /// Absent when specific months are selected.
    pub monthly: Option<Vec<MonthlyRow>>,
    pub daily: Vec<DailyRow>,
    /// Absent when no export carried a shipping state column.
    pub geo: Option<Vec<GeoRow>>,
    pub sku_metrics: Vec<SkuMetricRow>,
}

impl DashboardView {
    pub fn build(table: &UnifiedTable, filter: &OrderFilter) -> Self {
        let rows = filter.apply(&table.rows);
        let by_sku = !filter.skus.is_empty();

        let sku_sales = match filter.single_sku() {
            Some(sku) => SkuSales::Single {
                sku: sku.to_string(),
                monthly: monthly_breakdown(&rows, false),
                date_range: sku_date_range(&table.rows, sku),
                periods: relative_periods(&table.rows, sku)
                    .into_iter()
                    .filter(|p| filter.relative_years.contains(&p.index))
                    .collect(),
            },
            None => SkuSales::ByYear {
                rows: sku_yearly_sales(&rows),
            },
        };

        let (quarterly, monthly) = if filter.months.is_empty() {
            (
                Some(quarterly_metrics(&rows, by_sku)),
                Some(monthly_breakdown(&rows, by_sku)),
            )
        } else {
            (None, None)
        };

        Self {
            title: filter.describe_within(DateRange::spanning(&table.rows)),
            row_count: rows.len(),
            top_line: top_line_metrics(&rows),
            sku_sales,
            quarterly,
            monthly,
            daily: daily_sales_by_year(&rows),
            geo: table.has_shipping_state.then(|| geo_metrics(&rows)),
            sku_metrics: sku_metrics(&rows),
        }
    }
}
