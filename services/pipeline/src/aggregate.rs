//! Aggregations over unified order rows
//!
//! Every function here is pure: it reads a slice of rows and returns new
//! rows. Empty input never fails; it yields zeros or an empty result.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::model::{month_name, Quarter, UnifiedOrderRow};

/// Label of the synthetic summary row appended by [`sku_metrics`].
pub const TOTAL_LABEL: &str = "TOTAL";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TopLineMetrics {
    pub total_revenue: f64,
    pub order_count: usize,
    pub avg_order_value: f64,
    pub total_units: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuarterlyMetricRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub year: i32,
    pub quarter: Quarter,
    pub total_revenue: f64,
    pub units_sold: f64,
    /// Distinct SKUs in the quarter; only set when not grouped by SKU.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_skus: Option<usize>,
    pub revenue_growth: Option<f64>,
    pub units_growth: Option<f64>,
}

impl QuarterlyMetricRow {
    /// Display label such as `2023 Q1`.
    pub fn label(&self) -> String {
        format!("{} {}", self.year, self.quarter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub year: i32,
    pub month: u32,
    pub month_name: &'static str,
    pub revenue: f64,
    pub units: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRow {
    pub year: i32,
    pub date: NaiveDate,
    pub revenue: f64,
    pub units: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkuMetricRow {
    pub sku: String,
    pub total_revenue: f64,
    pub avg_revenue_per_order: f64,
    pub units_sold: f64,
}

impl SkuMetricRow {
    pub fn is_total(&self) -> bool {
        self.sku == TOTAL_LABEL
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoRow {
    pub region: String,
    pub revenue: f64,
    pub units: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkuYearRow {
    pub sku: String,
    pub year: i32,
    pub revenue: f64,
    pub units: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    revenue: f64,
    units: f64,
    orders: usize,
}

impl Totals {
    fn add(&mut self, row: &UnifiedOrderRow) {
        self.revenue += row.revenue;
        self.units += row.shipped_quantity;
        self.orders += 1;
    }
}

/// Percentage change from `previous` to `current`; absent without a
/// usable previous value.
fn growth(current: f64, previous: Option<f64>) -> Option<f64> {
    match previous {
        Some(prev) if prev != 0.0 => {
            let pct = (current - prev) / prev * 100.0;
            pct.is_finite().then_some(pct)
        }
        _ => None,
    }
}

pub fn top_line_metrics(rows: &[UnifiedOrderRow]) -> TopLineMetrics {
    let mut totals = Totals::default();
    for row in rows {
        totals.add(row);
    }
    let avg_order_value = if totals.orders > 0 {
        totals.revenue / totals.orders as f64
    } else {
        0.0
    };
    TopLineMetrics {
        total_revenue: totals.revenue,
        order_count: totals.orders,
        avg_order_value,
        total_units: totals.units,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GrowthPartition {
    Sku(String),
    Year(i32),
}

/// Revenue and units per (SKU?, year, quarter), sorted by (year, quarter),
/// with quarter-over-quarter growth.
///
/// Growth is computed within a partition: per SKU when `by_sku`, otherwise
/// per calendar year, so the first quarter of every year has no growth.
pub fn quarterly_metrics(rows: &[UnifiedOrderRow], by_sku: bool) -> Vec<QuarterlyMetricRow> {
    let mut groups: BTreeMap<(Option<String>, i32, Quarter), (Totals, BTreeSet<&str>)> =
        BTreeMap::new();
    for row in rows {
        let sku = by_sku.then(|| row.sku.clone());
        let entry = groups.entry((sku, row.year, row.quarter)).or_default();
        entry.0.add(row);
        entry.1.insert(row.sku.as_str());
    }

    let mut out: Vec<QuarterlyMetricRow> = groups
        .into_iter()
        .map(|((sku, year, quarter), (totals, skus))| QuarterlyMetricRow {
            sku,
            year,
            quarter,
            total_revenue: totals.revenue,
            units_sold: totals.units,
            unique_skus: (!by_sku).then_some(skus.len()),
            revenue_growth: None,
            units_growth: None,
        })
        .collect();
    out.sort_by_key(|row| (row.year, row.quarter));

    let mut previous: HashMap<GrowthPartition, (f64, f64)> = HashMap::new();
    for row in &mut out {
        let partition = match (&row.sku, by_sku) {
            (Some(sku), true) => GrowthPartition::Sku(sku.clone()),
            _ => GrowthPartition::Year(row.year),
        };
        let prev = previous.insert(partition, (row.total_revenue, row.units_sold));
        row.revenue_growth = growth(row.total_revenue, prev.map(|p| p.0));
        row.units_growth = growth(row.units_sold, prev.map(|p| p.1));
    }
    out
}

/// Revenue and units per (SKU?, year, month), sorted by (year, month).
pub fn monthly_breakdown(rows: &[UnifiedOrderRow], by_sku: bool) -> Vec<MonthlyRow> {
    let mut groups: BTreeMap<(Option<String>, i32, u32), Totals> = BTreeMap::new();
    for row in rows {
        let sku = by_sku.then(|| row.sku.clone());
        groups.entry((sku, row.year, row.month)).or_default().add(row);
    }

    let mut out: Vec<MonthlyRow> = groups
        .into_iter()
        .map(|((sku, year, month), totals)| MonthlyRow {
            sku,
            year,
            month,
            month_name: month_name(month),
            revenue: totals.revenue,
            units: totals.units,
        })
        .collect();
    out.sort_by_key(|row| (row.year, row.month));
    out
}

/// Revenue and units per (year, date), sorted.
pub fn daily_sales_by_year(rows: &[UnifiedOrderRow]) -> Vec<DailyRow> {
    let mut groups: BTreeMap<(i32, NaiveDate), Totals> = BTreeMap::new();
    for row in rows {
        groups.entry((row.year, row.date)).or_default().add(row);
    }
    groups
        .into_iter()
        .map(|((year, date), totals)| DailyRow {
            year,
            date,
            revenue: totals.revenue,
            units: totals.units,
        })
        .collect()
}

/// Per-SKU revenue, mean revenue per order and units, highest revenue
/// first, followed by a `TOTAL` row.
///
/// The total's average is total revenue over the total order count, not
/// the mean of the per-SKU averages.
pub fn sku_metrics(rows: &[UnifiedOrderRow]) -> Vec<SkuMetricRow> {
    let mut groups: BTreeMap<&str, Totals> = BTreeMap::new();
    for row in rows {
        groups.entry(row.sku.as_str()).or_default().add(row);
    }

    let mut out: Vec<SkuMetricRow> = groups
        .into_iter()
        .map(|(sku, totals)| SkuMetricRow {
            sku: sku.to_string(),
            total_revenue: totals.revenue,
            avg_revenue_per_order: totals.revenue / totals.orders as f64,
            units_sold: totals.units,
        })
        .collect();
    out.sort_by(|a, b| b.total_revenue.total_cmp(&a.total_revenue));

    let total_revenue: f64 = out.iter().map(|r| r.total_revenue).sum();
    let units_sold: f64 = out.iter().map(|r| r.units_sold).sum();
    let avg_revenue_per_order = if rows.is_empty() {
        0.0
    } else {
        total_revenue / rows.len() as f64
    };
    out.push(SkuMetricRow {
        sku: TOTAL_LABEL.to_string(),
        total_revenue,
        avg_revenue_per_order,
        units_sold,
    });
    out
}

/// Revenue and units per state code. Rows without a state are left out.
pub fn geo_metrics(rows: &[UnifiedOrderRow]) -> Vec<GeoRow> {
    let mut groups: BTreeMap<&str, Totals> = BTreeMap::new();
    for row in rows {
        if let Some(region) = row.shipping_state.as_deref() {
            groups.entry(region).or_default().add(row);
        }
    }
    groups
        .into_iter()
        .map(|(region, totals)| GeoRow {
            region: region.to_string(),
            revenue: totals.revenue,
            units: totals.units,
        })
        .collect()
}

/// Revenue and units per (SKU, year). SKUs are ordered by overall revenue,
/// highest first; years ascend within each SKU.
pub fn sku_yearly_sales(rows: &[UnifiedOrderRow]) -> Vec<SkuYearRow> {
    let mut by_year: BTreeMap<(&str, i32), Totals> = BTreeMap::new();
    let mut by_sku: BTreeMap<&str, f64> = BTreeMap::new();
    for row in rows {
        by_year.entry((row.sku.as_str(), row.year)).or_default().add(row);
        *by_sku.entry(row.sku.as_str()).or_default() += row.revenue;
    }

    let mut ranked: Vec<(&str, f64)> = by_sku.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    let rank: HashMap<&str, usize> = ranked
        .iter()
        .enumerate()
        .map(|(i, (sku, _))| (*sku, i))
        .collect();

    let mut out: Vec<SkuYearRow> = by_year
        .into_iter()
        .map(|((sku, year), totals)| SkuYearRow {
            sku: sku.to_string(),
            year,
            revenue: totals.revenue,
            units: totals.units,
        })
        .collect();
    out.sort_by_key(|row| (rank.get(row.sku.as_str()).copied(), row.year));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawOrderRecord;
    use chrono::{TimeZone, Utc};

    fn order(sku: &str, y: i32, m: u32, d: u32, revenue: f64, units: f64) -> UnifiedOrderRow {
        UnifiedOrderRow::from(RawOrderRecord {
            merchant_sku: sku.to_string(),
            purchased_at: Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap(),
            item_price: revenue,
            promo_discount: 0.0,
            shipped_quantity: units,
            shipping_state: None,
            country_code: None,
        })
    }

    fn in_state(mut row: UnifiedOrderRow, state: &str) -> UnifiedOrderRow {
        row.shipping_state = Some(state.to_string());
        row
    }

    // -------------------------------------------------------------------------
    // TOP LINE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_top_line_empty() {
        assert_eq!(
            top_line_metrics(&[]),
            TopLineMetrics {
                total_revenue: 0.0,
                order_count: 0,
                avg_order_value: 0.0,
                total_units: 0.0,
            }
        );
    }

    #[test]
    fn test_top_line_totals() {
        let rows = vec![
            order("A", 2023, 1, 1, 10.0, 1.0),
            order("B", 2023, 1, 2, 20.0, 3.0),
            order("A", 2023, 2, 1, -6.0, 0.0),
        ];
        let metrics = top_line_metrics(&rows);
        assert_eq!(metrics.total_revenue, 24.0);
        assert_eq!(metrics.order_count, 3);
        assert_eq!(metrics.avg_order_value, 8.0);
        assert_eq!(metrics.total_units, 4.0);
    }

    // -------------------------------------------------------------------------
    // QUARTERLY TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_quarterly_growth_resets_each_year() {
        let rows = vec![
            order("A", 2023, 2, 1, 100.0, 10.0),
            order("A", 2023, 5, 1, 150.0, 5.0),
            order("A", 2024, 1, 10, 80.0, 4.0),
            order("A", 2024, 4, 10, 120.0, 4.0),
        ];
        let quarterly = quarterly_metrics(&rows, false);
        let labels: Vec<_> = quarterly.iter().map(|q| q.label()).collect();
        assert_eq!(labels, vec!["2023 Q1", "2023 Q2", "2024 Q1", "2024 Q2"]);

        assert_eq!(quarterly[0].revenue_growth, None);
        assert_eq!(quarterly[1].revenue_growth, Some(50.0));
        assert_eq!(quarterly[1].units_growth, Some(-50.0));
        assert_eq!(quarterly[2].revenue_growth, None);
        assert_eq!(quarterly[2].units_growth, None);
        assert_eq!(quarterly[3].revenue_growth, Some(50.0));
        assert_eq!(quarterly[3].units_growth, Some(0.0));
    }

    #[test]
    fn test_quarterly_unique_skus() {
        let rows = vec![
            order("A", 2023, 1, 1, 10.0, 1.0),
            order("B", 2023, 2, 1, 10.0, 1.0),
            order("A", 2023, 3, 1, 10.0, 1.0),
            order("A", 2023, 4, 1, 10.0, 1.0),
        ];
        let quarterly = quarterly_metrics(&rows, false);
        assert_eq!(quarterly[0].unique_skus, Some(2));
        assert_eq!(quarterly[0].total_revenue, 30.0);
        assert_eq!(quarterly[1].unique_skus, Some(1));
        assert!(quarterly.iter().all(|q| q.sku.is_none()));
    }

    #[test]
    fn test_quarterly_by_sku_growth_spans_years() {
        let rows = vec![
            order("A", 2023, 11, 1, 100.0, 1.0),
            order("B", 2023, 11, 1, 40.0, 1.0),
            order("A", 2024, 1, 1, 200.0, 1.0),
            order("B", 2024, 2, 1, 20.0, 2.0),
        ];
        let quarterly = quarterly_metrics(&rows, true);
        let keys: Vec<_> = quarterly
            .iter()
            .map(|q| (q.sku.clone().unwrap(), q.label()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("A".to_string(), "2023 Q4".to_string()),
                ("B".to_string(), "2023 Q4".to_string()),
                ("A".to_string(), "2024 Q1".to_string()),
                ("B".to_string(), "2024 Q1".to_string()),
            ]
        );
        assert_eq!(quarterly[0].revenue_growth, None);
        assert_eq!(quarterly[1].revenue_growth, None);
        assert_eq!(quarterly[2].revenue_growth, Some(100.0));
        assert_eq!(quarterly[3].revenue_growth, Some(-50.0));
        assert_eq!(quarterly[3].units_growth, Some(100.0));
        assert!(quarterly.iter().all(|q| q.unique_skus.is_none()));
    }

    #[test]
    fn test_quarterly_sorts_quarters_as_ordinals() {
        let rows = vec![
            order("A", 2023, 12, 1, 1.0, 1.0),
            order("A", 2023, 1, 1, 1.0, 1.0),
            order("A", 2022, 7, 1, 1.0, 1.0),
        ];
        let labels: Vec<_> = quarterly_metrics(&rows, false)
            .iter()
            .map(|q| q.label())
            .collect();
        assert_eq!(labels, vec!["2022 Q3", "2023 Q1", "2023 Q4"]);
    }

    #[test]
    fn test_quarterly_zero_previous_has_no_growth() {
        let rows = vec![
            order("A", 2023, 1, 1, 0.0, 0.0),
            order("A", 2023, 4, 1, 50.0, 2.0),
        ];
        let quarterly = quarterly_metrics(&rows, false);
        assert_eq!(quarterly[1].revenue_growth, None);
        assert_eq!(quarterly[1].units_growth, None);
    }

    #[test]
    fn test_quarterly_empty() {
        assert!(quarterly_metrics(&[], false).is_empty());
        assert!(quarterly_metrics(&[], true).is_empty());
    }

    // -------------------------------------------------------------------------
    // MONTHLY / DAILY TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_monthly_breakdown_sorted() {
        let rows = vec![
            order("B", 2024, 1, 5, 5.0, 1.0),
            order("A", 2023, 3, 5, 2.0, 1.0),
            order("A", 2023, 3, 9, 3.0, 2.0),
            order("A", 2023, 1, 5, 1.0, 1.0),
        ];
        let monthly = monthly_breakdown(&rows, false);
        let keys: Vec<_> = monthly.iter().map(|m| (m.year, m.month_name)).collect();
        assert_eq!(keys, vec![(2023, "January"), (2023, "March"), (2024, "January")]);
        assert_eq!(monthly[1].revenue, 5.0);
        assert_eq!(monthly[1].units, 3.0);

        let by_sku = monthly_breakdown(&rows, true);
        assert_eq!(by_sku.len(), 3);
        assert_eq!(by_sku[2].sku.as_deref(), Some("B"));
    }

    #[test]
    fn test_daily_sales_by_year() {
        let rows = vec![
            order("A", 2024, 1, 1, 5.0, 1.0),
            order("A", 2023, 6, 1, 2.0, 1.0),
            order("B", 2023, 6, 1, 3.0, 1.0),
        ];
        let daily = daily_sales_by_year(&rows);
        assert_eq!(daily.len(), 2);
        assert_eq!(daily[0].date, NaiveDate::from_ymd_opt(2023, 6, 1).unwrap());
        assert_eq!(daily[0].revenue, 5.0);
        assert_eq!(daily[1].year, 2024);
        assert!(daily_sales_by_year(&[]).is_empty());
    }

    // -------------------------------------------------------------------------
    // SKU METRICS TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_sku_metrics_sorted_with_total() {
        let rows = vec![
            order("A", 2023, 1, 1, 10.0, 1.0),
            order("A", 2023, 1, 2, 20.0, 1.0),
            order("B", 2023, 1, 3, 45.0, 3.0),
            order("C", 2023, 1, 4, 0.1, 1.0),
            order("C", 2023, 1, 5, 0.2, 1.0),
        ];
        let metrics = sku_metrics(&rows);
        let skus: Vec<_> = metrics.iter().map(|m| m.sku.as_str()).collect();
        assert_eq!(skus, vec!["B", "A", "C", "TOTAL"]);
        assert_eq!(metrics[1].avg_revenue_per_order, 15.0);

        let total = metrics.last().unwrap();
        assert!(total.is_total());
        let listed: f64 = metrics[..3].iter().map(|m| m.total_revenue).sum();
        assert_eq!(total.total_revenue, listed);
        assert_eq!(total.avg_revenue_per_order, listed / 5.0);
        assert_eq!(total.units_sold, 7.0);
    }

    #[test]
    fn test_sku_metrics_empty_has_zero_total() {
        let metrics = sku_metrics(&[]);
        assert_eq!(metrics.len(), 1);
        assert_eq!(
            metrics[0],
            SkuMetricRow {
                sku: "TOTAL".to_string(),
                total_revenue: 0.0,
                avg_revenue_per_order: 0.0,
                units_sold: 0.0,
            }
        );
    }

    // -------------------------------------------------------------------------
    // GEO / SKU-YEAR TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_geo_metrics_skips_missing_state() {
        let rows = vec![
            in_state(order("A", 2023, 1, 1, 10.0, 1.0), "NY"),
            in_state(order("A", 2023, 1, 2, 5.0, 2.0), "CA"),
            in_state(order("B", 2023, 1, 3, 1.0, 1.0), "CA"),
            order("B", 2023, 1, 4, 100.0, 1.0),
        ];
        let geo = geo_metrics(&rows);
        assert_eq!(
            geo,
            vec![
                GeoRow { region: "CA".to_string(), revenue: 6.0, units: 3.0 },
                GeoRow { region: "NY".to_string(), revenue: 10.0, units: 1.0 },
            ]
        );
        assert!(geo_metrics(&[]).is_empty());
    }

    #[test]
    fn test_sku_yearly_sales_ranked_by_revenue() {
        let rows = vec![
            order("A", 2023, 1, 1, 10.0, 1.0),
            order("B", 2022, 1, 1, 30.0, 1.0),
            order("B", 2023, 1, 1, 5.0, 1.0),
            order("A", 2022, 1, 1, 1.0, 1.0),
        ];
        let keys: Vec<_> = sku_yearly_sales(&rows)
            .iter()
            .map(|r| (r.sku.clone(), r.year))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("B".to_string(), 2022),
                ("B".to_string(), 2023),
                ("A".to_string(), 2022),
                ("A".to_string(), 2023),
            ]
        );
    }
}
