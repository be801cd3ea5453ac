//! Sales pipeline - turns raw order exports into dashboard-ready aggregates
//!
//! Responsibilities:
//! - Read and persist the reference workbook (SKU and state mapping sheets)
//! - Resolve merchant SKUs and shipping states to canonical codes
//! - Parse every order CSV under the source directory, one file at a time
//! - Memoize the unified table by a fingerprint of the source files
//! - Compute top-line, quarterly, monthly, daily, SKU and geographic rollups
//!
//! Same source files + same reference workbook = same output.

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod filter;
pub mod ingest;
pub mod mapping;
pub mod model;
pub mod reference;

pub use cache::{CacheKey, CacheStats, IngestCache};
pub use config::PipelineConfig;
pub use dashboard::DashboardView;
pub use error::{PipelineError, Result};
pub use filter::{FilterOptions, OrderFilter};
pub use ingest::{load, Diagnostic, LoadReport, LoadStatus};
pub use mapping::{MappingRegistry, MappingResolver};
pub use model::{Quarter, RawOrderRecord, UnifiedOrderRow, UnifiedTable};
pub use reference::{Cell, ReferenceStore, Sheet};
