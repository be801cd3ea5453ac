//! Fingerprint-keyed memoization of ingestion results
//!
//! The key combines a hash of the discovered source files (path, mtime,
//! size) with the resolver's content version, so either a changed export or
//! a saved reference sheet forces a reload. Only the latest entry is kept;
//! there is no TTL.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::UNIX_EPOCH;
use tracing::{debug, info};

use crate::ingest::{self, discover_sources, LoadReport};
use crate::mapping::MappingResolver;

/// Fingerprint used when the source directory cannot be listed.
const ABSENT_SOURCES: &str = "absent";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub sources: String,
    pub resolver: String,
}

impl CacheKey {
    pub fn new(root: &Path, resolver: &MappingResolver) -> Self {
        Self {
            sources: fingerprint_sources(root),
            resolver: resolver.version().to_string(),
        }
    }
}

/// sha256 over sorted `path:mtime:size` lines of every export under `root`.
pub fn fingerprint_sources(root: &Path) -> String {
    let Ok(files) = discover_sources(root) else {
        return ABSENT_SOURCES.to_string();
    };

    let mut lines: Vec<String> = files
        .iter()
        .filter_map(|path| {
            let meta = fs::metadata(path).ok()?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            Some(format!("{}:{}:{}", path.display(), mtime, meta.len()))
        })
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("sha256:{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
struct CacheEntry {
    key: CacheKey,
    report: Arc<LoadReport>,
}

/// Injected cache; share it behind an `Arc` across requests.
#[derive(Debug, Default)]
pub struct IngestCache {
    entry: RwLock<Option<CacheEntry>>,
    compute: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl IngestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached report for `root`, loading only when the key changed.
    pub fn load(&self, root: &Path, resolver: &MappingResolver) -> Arc<LoadReport> {
        let key = CacheKey::new(root, resolver);
        if let Some(report) = self.lookup(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(sources = %key.sources, "Ingestion cache hit");
            return report;
        }

        // One recompute at a time; whoever waited re-checks first
        let _guard = self.compute.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(report) = self.lookup(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return report;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        info!(sources = %key.sources, "Ingestion cache miss, reloading");
        let report = Arc::new(ingest::load(root, resolver));
        *self.entry.write().unwrap_or_else(PoisonError::into_inner) = Some(CacheEntry {
            key,
            report: report.clone(),
        });
        report
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<LoadReport>> {
        let entry = self.entry.read().unwrap_or_else(PoisonError::into_inner);
        entry
            .as_ref()
            .filter(|e| &e.key == key)
            .map(|e| e.report.clone())
    }

    /// Drop the cached entry.
    pub fn clear(&self) {
        *self.entry.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn current_key(&self) -> Option<CacheKey> {
        let entry = self.entry.read().unwrap_or_else(PoisonError::into_inner);
        entry.as_ref().map(|e| e.key.clone())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
