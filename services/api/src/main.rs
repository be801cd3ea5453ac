//! API Service - Sales dashboard over the order exports
//!
//! Endpoints:
//! - GET /health - Health check and cache counters
//! - GET /dashboard - Filtered dashboard (metrics, quarterly, monthly, daily, geo, SKU)
//! - GET /filters - Options for the filter panel
//! - GET /reference/sheets - List reference sheets
//! - GET /reference/sheets/:name - Read one reference sheet
//! - PUT /reference/sheets/:name - Replace one reference sheet

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use pipeline::aggregate::{QuarterlyMetricRow, SkuMetricRow, TopLineMetrics};
use pipeline::config::{DEFAULT_LEGEND_PATH, DEFAULT_SOURCE_DIR};
use pipeline::filter::DateRange;
use pipeline::{
    CacheStats, DashboardView, Diagnostic, FilterOptions, IngestCache, LoadReport, LoadStatus,
    MappingRegistry, OrderFilter, PipelineConfig, ReferenceStore, Sheet,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// State
// ============================================================================

struct AppState {
    config: PipelineConfig,
    registry: Arc<MappingRegistry>,
    cache: Arc<IngestCache>,
}

impl AppState {
    /// Current report, served from the cache unless sources or mappings changed.
    fn current_report(&self) -> Arc<LoadReport> {
        let resolver = self.registry.resolver();
        self.cache.load(&self.config.source_dir, &resolver)
    }
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
    cache: CacheStats,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

#[derive(Serialize)]
struct DashboardResponse {
    status: LoadStatus,
    diagnostics: Vec<Diagnostic>,
    /// Display strings keyed by metric name.
    metrics: BTreeMap<&'static str, String>,
    quarterly_display: Option<Vec<QuarterlyDisplayRow>>,
    sku_display: Vec<SkuDisplayRow>,
    #[serde(flatten)]
    view: DashboardView,
}

#[derive(Debug, PartialEq, Serialize)]
struct QuarterlyDisplayRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    sku: Option<String>,
    quarter: String,
    revenue: String,
    revenue_growth: String,
    units_sold: String,
    units_growth: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    unique_skus: Option<usize>,
}

#[derive(Debug, PartialEq, Serialize)]
struct SkuDisplayRow {
    sku: String,
    total_revenue: String,
    avg_revenue_per_order: String,
    units_sold: String,
}

#[derive(Serialize)]
struct FiltersResponse {
    status: LoadStatus,
    #[serde(flatten)]
    options: FilterOptions,
}

#[derive(Serialize)]
struct SheetsResponse {
    sheets: Vec<String>,
    region_sheet: Option<String>,
}

#[derive(Serialize)]
struct SaveSheetResponse {
    saved: bool,
    sheet: String,
    mappings_version: String,
}

// ============================================================================
// Query params
// ============================================================================

/// Comma-separated lists; absent or empty means "all".
#[derive(Debug, Default, Deserialize)]
struct DashboardQuery {
    skus: Option<String>,
    months: Option<String>,
    years: Option<String>,
    states: Option<String>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    relative_years: Option<String>,
}

impl DashboardQuery {
    /// Build the filter; open date bounds are closed with the table's own.
    fn to_filter(&self, bounds: Option<DateRange>) -> Result<OrderFilter, String> {
        let months: Vec<u32> = parse_list(self.months.as_deref(), "months")?;
        if let Some(bad) = months.iter().find(|m| !(1..=12).contains(*m)) {
            return Err(format!("invalid month {} (expected 1-12)", bad));
        }
        Ok(OrderFilter {
            skus: parse_list(self.skus.as_deref(), "skus")?,
            months,
            years: parse_list(self.years.as_deref(), "years")?,
            regions: parse_list(self.states.as_deref(), "states")?,
            date_range: resolve_date_range(self.start, self.end, bounds),
            relative_years: parse_list(self.relative_years.as_deref(), "relative_years")?,
        })
    }
}

fn parse_list<T: FromStr>(raw: Option<&str>, field: &str) -> Result<Vec<T>, String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<T>()
                .map_err(|_| format!("invalid value '{}' in {}", item, field))
        })
        .collect()
}

fn resolve_date_range(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    bounds: Option<DateRange>,
) -> Option<DateRange> {
    match (start, end, bounds) {
        (None, None, _) => None,
        (Some(start), Some(end), _) => Some(DateRange { start, end }),
        (start, end, Some(bounds)) => Some(DateRange {
            start: start.unwrap_or(bounds.start),
            end: end.unwrap_or(bounds.end),
        }),
        // Nothing loaded, so there is nothing to narrow
        (_, _, None) => None,
    }
}

// ============================================================================
// Formatting
// ============================================================================

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Format amount as US dollars, e.g. `$1,234.56`
fn format_currency(amount: f64) -> String {
    let fixed = format!("{:.2}", amount.abs());
    let (whole, cents) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let sign = if amount < 0.0 && fixed != "0.00" { "-" } else { "" };
    format!("{}${}.{}", sign, group_thousands(whole), cents)
}

/// Format a count with thousands separators, e.g. `1,234`
fn format_count(value: f64) -> String {
    let whole = format!("{:.0}", value.abs());
    let sign = if value < 0.0 && whole != "0" { "-" } else { "" };
    format!("{}{}", sign, group_thousands(&whole))
}

fn format_percent(value: Option<f64>) -> String {
    match value {
        Some(pct) => format!("{:.1}%", pct),
        None => "N/A".to_string(),
    }
}

fn format_metrics(top_line: &TopLineMetrics) -> BTreeMap<&'static str, String> {
    BTreeMap::from([
        ("Total Revenue", format_currency(top_line.total_revenue)),
        ("Total Orders", format_count(top_line.order_count as f64)),
        ("Average Order Value", format_currency(top_line.avg_order_value)),
        ("Units Sold", format_count(top_line.total_units)),
    ])
}

fn format_quarterly(rows: &[QuarterlyMetricRow]) -> Vec<QuarterlyDisplayRow> {
    rows.iter()
        .map(|row| QuarterlyDisplayRow {
            sku: row.sku.clone(),
            quarter: row.label(),
            revenue: format_currency(row.total_revenue),
            revenue_growth: format_percent(row.revenue_growth),
            units_sold: format_count(row.units_sold),
            units_growth: format_percent(row.units_growth),
            unique_skus: row.unique_skus,
        })
        .collect()
}

fn format_sku_metrics(rows: &[SkuMetricRow]) -> Vec<SkuDisplayRow> {
    rows.iter()
        .map(|row| SkuDisplayRow {
            sku: row.sku.clone(),
            total_revenue: format_currency(row.total_revenue),
            avg_revenue_per_order: format_currency(row.avg_revenue_per_order),
            units_sold: format_count(row.units_sold),
        })
        .collect()
}

// ============================================================================
// Handlers
// ============================================================================

fn error_response(status: StatusCode, error: impl Into<String>, details: Vec<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            details,
        }),
    )
        .into_response()
}

fn no_data(report: &LoadReport) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "No data available. Please check the source directory for CSV files.",
        report.diagnostics.iter().map(Diagnostic::message).collect(),
    )
}

fn join_failed(e: tokio::task::JoinError) -> Response {
    warn!(error = %e, "Blocking task failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), Vec::new())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
        cache: state.cache.stats(),
    })
}

async fn dashboard_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DashboardQuery>,
) -> Response {
    let result = tokio::task::spawn_blocking(move || {
        let report = state.current_report();
        if report.status != LoadStatus::Loaded {
            return no_data(&report);
        }

        let bounds = DateRange::spanning(&report.table.rows);
        let filter = match params.to_filter(bounds) {
            Ok(filter) => filter,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e, Vec::new()),
        };

        let view = DashboardView::build(&report.table, &filter);
        Json(DashboardResponse {
            status: report.status,
            diagnostics: report.diagnostics.clone(),
            metrics: format_metrics(&view.top_line),
            quarterly_display: view.quarterly.as_deref().map(format_quarterly),
            sku_display: format_sku_metrics(&view.sku_metrics),
            view,
        })
        .into_response()
    })
    .await;

    result.unwrap_or_else(join_failed)
}

async fn filters_handler(State(state): State<Arc<AppState>>) -> Response {
    let result = tokio::task::spawn_blocking(move || {
        let report = state.current_report();
        if report.status != LoadStatus::Loaded {
            return no_data(&report);
        }
        let resolver = state.registry.resolver();
        Json(FiltersResponse {
            status: report.status,
            options: FilterOptions::build(&report.table, &resolver),
        })
        .into_response()
    })
    .await;

    result.unwrap_or_else(join_failed)
}

async fn list_sheets_handler(State(state): State<Arc<AppState>>) -> Response {
    let result = tokio::task::spawn_blocking(move || {
        let store = state.registry.store();
        Json(SheetsResponse {
            sheets: store.list_sheets(),
            region_sheet: store.region_sheet_name(),
        })
        .into_response()
    })
    .await;

    result.unwrap_or_else(join_failed)
}

async fn get_sheet_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let result = tokio::task::spawn_blocking(move || {
        let known = state.registry.sheet_names();
        let is_alias = name.trim().eq_ignore_ascii_case("us state")
            && state.registry.store().region_sheet_name().is_some();
        if !known.contains(&name) && !is_alias {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("Sheet '{}' not found", name),
                Vec::new(),
            );
        }
        Json(state.registry.sheet(&name)).into_response()
    })
    .await;

    result.unwrap_or_else(join_failed)
}

async fn put_sheet_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(sheet): Json<Sheet>,
) -> Response {
    let result = tokio::task::spawn_blocking(move || {
        if !state.registry.save_sheet(&name, &sheet) {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to save sheet '{}'", name),
                Vec::new(),
            );
        }
        let resolver = state.registry.resolver();
        info!(sheet = %name, version = %resolver.version(), "Reference sheet updated");
        Json(SaveSheetResponse {
            saved: true,
            sheet: name,
            mappings_version: resolver.version().to_string(),
        })
        .into_response()
    })
    .await;

    result.unwrap_or_else(join_failed)
}

// ============================================================================
// Main
// ============================================================================

fn env_path(key: &str, default: &str) -> std::path::PathBuf {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
        .into()
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = PipelineConfig::new(
        env_path("SOURCE_DIR", DEFAULT_SOURCE_DIR),
        env_path("LEGEND_PATH", DEFAULT_LEGEND_PATH),
    );
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== Sales Dashboard API ===");
    println!("Source dir: {}", config.source_dir.display());
    println!("Legend: {}", config.legend_path.display());

    let store = ReferenceStore::new(&config.legend_path);
    store
        .initialize()
        .with_context(|| format!("Failed to create {}", config.legend_path.display()))?;
    let registry = Arc::new(MappingRegistry::open(store));
    println!(
        "Mappings loaded: {} SKUs, {} states",
        registry.resolver().sku_mapping_count(),
        registry.resolver().valid_regions().len()
    );

    let state = Arc::new(AppState {
        config,
        registry,
        cache: Arc::new(IngestCache::new()),
    });

    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/dashboard", get(dashboard_handler))
        .route("/filters", get(filters_handler))
        .route("/reference/sheets", get(list_sheets_handler))
        .route(
            "/reference/sheets/:name",
            get(get_sheet_handler).put(put_sheet_handler),
        )
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /dashboard?skus=&months=&years=&states=&start=&end=&relative_years=");
    println!("  GET /filters");
    println!("  GET /reference/sheets");
    println!("  GET /reference/sheets/:name");
    println!("  PUT /reference/sheets/:name");

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    axum::serve(listener, app).await?;

    Ok(())
}
