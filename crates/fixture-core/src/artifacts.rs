//! Per-run artifact directory

use crate::error::Result;
use crate::fsutil::copy_path;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the captured test output
pub const TEST_LOG_FILE: &str = "test-output.log";
/// Name of the serialized run report
pub const REPORT_FILE: &str = "report.json";

/// Collects the artifacts of one run under `<base>/<run_id>`
#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    dir: PathBuf,
}

impl ArtifactCollector {
    /// Create the run directory
    pub fn new(base: &Path, run_id: &str) -> Result<Self> {
        let dir = base.join(run_id);
        std::fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "Created artifact directory");
        Ok(Self { dir })
    }

    /// The run directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the test output is written
    pub fn log_path(&self) -> PathBuf {
        self.dir.join(TEST_LOG_FILE)
    }

    /// Copy checkout-relative `paths` into the run directory. Missing paths
    /// are skipped; returns the paths that were copied.
    pub fn collect(&self, checkout: &Path, paths: &[String]) -> Result<Vec<String>> {
        let mut collected = Vec::new();
        for path in paths {
            let source = checkout.join(path);
            if !source.exists() {
                warn!(path = %path, "Artifact path does not exist, skipping");
                continue;
            }
            copy_path(&source, &self.dir.join(path))?;
            collected.push(path.clone());
        }
        info!(
            dir = %self.dir.display(),
            "Collected {} of {} artifact paths",
            collected.len(),
            paths.len()
        );
        Ok(collected)
    }

    /// Write `report` as pretty JSON
    pub fn write_report<T: Serialize>(&self, report: &T) -> Result<PathBuf> {
        let path = self.dir.join(REPORT_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(report)?)?;
        info!(path = %path.display(), "Wrote run report");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_existing_paths_only() {
        let checkout = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(checkout.path().join("test-results/unit")).unwrap();
        std::fs::write(checkout.path().join("test-results/unit/junit.xml"), "<testsuite/>").unwrap();

        let base = tempfile::tempdir().unwrap();
        let collector = ArtifactCollector::new(base.path(), "run-1").unwrap();
        let collected = collector
            .collect(
                checkout.path(),
                &["test-results".to_string(), "coverage.xml".to_string()],
            )
            .unwrap();

        assert_eq!(collected, vec!["test-results"]);
        assert!(base.path().join("run-1/test-results/unit/junit.xml").is_file());
        assert_eq!(collector.log_path(), base.path().join("run-1/test-output.log"));
    }

    #[test]
    fn test_write_report() {
        let base = tempfile::tempdir().unwrap();
        let collector = ArtifactCollector::new(base.path(), "run-2").unwrap();
        let path = collector
            .write_report(&serde_json::json!({ "exit_code": 1 }))
            .unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["exit_code"], 1);
    }
}
