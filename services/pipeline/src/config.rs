use std::path::{Path, PathBuf};

/// Default directory scanned for order exports.
pub const DEFAULT_SOURCE_DIR: &str = "source";
/// Default location of the reference workbook.
pub const DEFAULT_LEGEND_PATH: &str = "legend/legend.xlsx";
/// Only files with this extension are treated as order exports.
pub const SOURCE_EXTENSION: &str = "csv";

/// Filesystem layout the pipeline reads from.
///
/// The library never consults the environment; binaries build this from
/// flags or env vars and pass it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub source_dir: PathBuf,
    pub legend_path: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from(DEFAULT_SOURCE_DIR),
            legend_path: PathBuf::from(DEFAULT_LEGEND_PATH),
        }
    }
}

impl PipelineConfig {
    pub fn new(source_dir: impl Into<PathBuf>, legend_path: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            legend_path: legend_path.into(),
        }
    }

    /// Conventional layout (`source/`, `legend/legend.xlsx`) under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            source_dir: root.join(DEFAULT_SOURCE_DIR),
            legend_path: root.join(DEFAULT_LEGEND_PATH),
        }
    }
}
