//! Loader - Runs the ingestion pipeline once from the command line
//!
//! Responsibilities:
//! - Resolve the source directory and reference workbook (flag, env, default)
//! - Load and merge every order export with the current mappings
//! - Print a summary of files, rows and top-line metrics
//! - Optionally dump the dashboard as JSON or list the reference sheets
//!
//! Same source files + same reference workbook = same output.
//! `--verify` checks exactly that: a cache hit plus a fresh load that agrees.

use anyhow::{Context, Result};
use clap::Parser;
use pipeline::aggregate::{sku_metrics, top_line_metrics};
use pipeline::config::{DEFAULT_LEGEND_PATH, DEFAULT_SOURCE_DIR};
use pipeline::{
    DashboardView, IngestCache, LoadStatus, MappingRegistry, OrderFilter, PipelineConfig,
    ReferenceStore,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads order exports into a unified sales table")]
struct Args {
    /// Directory holding the order CSV exports (default: $SOURCE_DIR or ./source)
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Reference workbook path (default: $LEGEND_PATH or ./legend/legend.xlsx)
    #[arg(long)]
    legend_path: Option<PathBuf>,

    /// Verify mode - reload through the cache and from scratch, require identical output
    #[arg(long, default_value = "false")]
    verify: bool,

    /// List the reference sheets and exit
    #[arg(long, default_value = "false")]
    sheets: bool,

    /// Print the load summary and unfiltered dashboard as JSON
    #[arg(long, default_value = "false")]
    json: bool,

    /// How many SKUs to show in the summary
    #[arg(long, default_value = "10")]
    top: usize,
}

/// Flag wins over env var, env var over the built-in default.
fn pick_path(flag: Option<PathBuf>, env: Option<String>, default: &str) -> PathBuf {
    flag.or_else(|| env.filter(|v| !v.trim().is_empty()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(default))
}

fn resolve_config(args: &Args) -> PipelineConfig {
    PipelineConfig::new(
        pick_path(
            args.source_dir.clone(),
            std::env::var("SOURCE_DIR").ok(),
            DEFAULT_SOURCE_DIR,
        ),
        pick_path(
            args.legend_path.clone(),
            std::env::var("LEGEND_PATH").ok(),
            DEFAULT_LEGEND_PATH,
        ),
    )
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .try_init();
}

fn list_sheets(store: &ReferenceStore) -> Result<()> {
    let names = store
        .try_list_sheets()
        .with_context(|| format!("Failed to open reference workbook {}", store.path().display()))?;
    println!("Reference sheets ({}):", names.len());
    for name in &names {
        let sheet = store.read_sheet(name);
        println!(
            "  - {} | {} columns | {} rows",
            name,
            sheet.columns.len(),
            sheet.rows.len()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();
    let config = resolve_config(&args);

    // Keep stdout clean for JSON output
    let banner = !args.json;
    if banner {
        println!("=== Sales Pipeline Loader ===");
        println!("Source dir: {}", config.source_dir.display());
        println!("Legend: {}", config.legend_path.display());
    }

    let store = ReferenceStore::new(&config.legend_path);
    store
        .initialize()
        .with_context(|| format!("Failed to create {}", config.legend_path.display()))?;

    if args.sheets {
        return list_sheets(&store);
    }

    let registry = MappingRegistry::open(store);
    let resolver = registry.resolver();
    if banner {
        println!(
            "Mappings: {} SKUs, {} states (version {})",
            resolver.sku_mapping_count(),
            resolver.valid_regions().len(),
            resolver.version()
        );
    }

    let cache = IngestCache::new();
    let report = cache.load(&config.source_dir, &resolver);

    if args.verify {
        let cached = cache.load(&config.source_dir, &resolver);
        if cache.stats().hits != 1 {
            anyhow::bail!("Verification failed: unchanged inputs missed the cache");
        }
        let fresh = pipeline::load(&config.source_dir, &resolver);
        if *cached != fresh {
            anyhow::bail!("Verification failed: two loads of the same inputs differ");
        }
        if banner {
            println!("Verified: cache hit and fresh load produced identical tables");
        }
    }

    if args.json {
        let view = DashboardView::build(&report.table, &OrderFilter::default());
        let dump = serde_json::json!({
            "status": report.status,
            "diagnostics": report.diagnostics,
            "files_found": report.files_found,
            "files_parsed": report.files_parsed,
            "rows_read": report.rows_read,
            "rows_rejected": report.rows_rejected,
            "dashboard": view,
        });
        let json = serde_json::to_string_pretty(&dump).context("Failed to serialize report")?;
        println!("{}", json);
        return Ok(());
    }

    println!("\nFiles found: {}", report.files_found);
    println!("Files parsed: {}", report.files_parsed);
    println!("Rows read: {}", report.rows_read);
    println!("Rows rejected: {}", report.rows_rejected);
    for diagnostic in &report.diagnostics {
        println!("  ! {}", diagnostic.message());
    }

    match report.status {
        LoadStatus::SourceUnavailable => {
            println!("\nNo data available. Check the source directory for CSV files.");
            return Ok(());
        }
        LoadStatus::NoValidRows => {
            println!("\nFiles were read but no rows survived validation and mapping.");
            return Ok(());
        }
        LoadStatus::Loaded => {}
    }

    let rows = &report.table.rows;
    let top_line = top_line_metrics(rows);
    println!("\n=== Load Complete ===");
    println!("Orders: {}", top_line.order_count);
    println!("Revenue: {:.2}", top_line.total_revenue);
    println!("Avg order value: {:.2}", top_line.avg_order_value);
    println!("Units: {}", top_line.total_units);

    let metrics = sku_metrics(rows);
    let (total, listed) = metrics.split_last().context("SKU metrics missing total row")?;
    println!("\nTop SKUs:");
    for (i, row) in listed.iter().take(args.top).enumerate() {
        println!(
            "  [{}] {} | {:.2} | {} units",
            i + 1,
            row.sku,
            row.total_revenue,
            row.units_sold
        );
    }
    if listed.len() > args.top {
        println!("  ... and {} more", listed.len() - args.top);
    }
    println!("  {} | {:.2} | {} units", total.sku, total.total_revenue, total.units_sold);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // CONFIG RESOLUTION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_flag_beats_env() {
        let path = pick_path(
            Some(PathBuf::from("/data/exports")),
            Some("/env/exports".to_string()),
            DEFAULT_SOURCE_DIR,
        );
        assert_eq!(path, PathBuf::from("/data/exports"));
    }

    #[test]
    fn test_env_beats_default() {
        let path = pick_path(None, Some("/env/legend.xlsx".to_string()), DEFAULT_LEGEND_PATH);
        assert_eq!(path, PathBuf::from("/env/legend.xlsx"));
    }

    #[test]
    fn test_blank_env_falls_back_to_default() {
        assert_eq!(
            pick_path(None, Some("  ".to_string()), DEFAULT_SOURCE_DIR),
            PathBuf::from("source")
        );
        assert_eq!(
            pick_path(None, None, DEFAULT_LEGEND_PATH),
            PathBuf::from("legend/legend.xlsx")
        );
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["loader", "--source-dir", "exports", "--verify"]);
        assert_eq!(args.source_dir, Some(PathBuf::from("exports")));
        assert!(args.verify);
        assert!(!args.json);
        assert_eq!(args.top, 10);
    }
}
