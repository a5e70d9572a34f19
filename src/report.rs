//! JSON persistence of the latest analysis
//!
//! Only one report is kept; each analysis overwrites `results.json` in the
//! cache directory.

use crate::models::MeasurementReport;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Store for the most recent measurement report
pub struct ReportStore {
    path: PathBuf,
}

impl ReportStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure the report directory exists
    fn ensure_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create report directory {}", parent.display())
            })?;
        }
        Ok(())
    }

    /// Load the stored report, if any
    pub fn load(&self) -> Result<Option<MeasurementReport>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let report = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(Some(report))
    }

    /// Replace the stored report
    pub fn save(&self, report: &MeasurementReport) -> Result<()> {
        self.ensure_dir()?;

        let contents =
            serde_json::to_string_pretty(report).context("Failed to serialize report")?;
        fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}
