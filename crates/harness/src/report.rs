//! JSON result reports, one per test file, merged by the orchestrator

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::HarnessResult;
use crate::matcher::slugify;
use crate::snapshot::{SnapshotStatus, VisualDiff};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub name: String,
    pub status: SnapshotStatus,
    pub matches: bool,
    pub diff_percent: f64,
    pub diff_image_path: Option<String>,
}

impl From<&VisualDiff> for SnapshotRecord {
    fn from(diff: &VisualDiff) -> Self {
        Self {
            name: diff.name.clone(),
            status: diff.status,
            matches: diff.matches,
            diff_percent: diff.diff_percent,
            diff_image_path: diff
                .diff_image_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        }
    }
}

/// Result of running a single case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub snapshots: Vec<SnapshotRecord>,
    pub error: Option<String>,
}

/// Result of running every case in a test file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResult {
    pub file: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
    /// Set when the environment could not be set up and no case ran
    pub setup_error: Option<String>,
    /// The setup error means global setup never ran, so every other file
    /// fails the same way
    #[serde(default)]
    pub setup_fatal: bool,
    pub cases: Vec<CaseResult>,
}

impl FileResult {
    pub fn passed(&self) -> usize {
        self.cases.iter().filter(|c| c.success).count()
    }

    pub fn failed(&self) -> usize {
        self.cases.len() - self.passed()
    }

    pub fn success(&self) -> bool {
        self.setup_error.is_none() && self.cases.iter().all(|c| c.success)
    }
}

/// Totals across every file of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub files: usize,
    pub setup_failures: usize,
    /// Files that found no shared browser at all
    pub fatal_setup_failures: usize,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl Summary {
    pub fn from_results(results: &[FileResult]) -> Self {
        let mut summary = Summary {
            files: results.len(),
            ..Default::default()
        };
        for file in results {
            if file.setup_error.is_some() {
                summary.setup_failures += 1;
                if file.setup_fatal {
                    summary.fatal_setup_failures += 1;
                }
            }
            summary.total += file.cases.len();
            summary.passed += file.passed();
            summary.failed += file.failed();
            summary.duration_ms += file.duration_ms;
        }
        summary
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && self.setup_failures == 0
    }
}

/// Write `<dir>/<slug of file>.json`
pub fn write_file_result(dir: &Path, result: &FileResult) -> HarnessResult<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let path = dir.join(format!("{}.json", slugify(&result.file)));
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(&path, json)?;

    info!("Results written to: {}", path.display());
    Ok(path)
}

/// Every report under `dir`, ordered by file name. Unreadable reports are
/// skipped with a warning.
pub fn load_results(dir: &Path) -> HarnessResult<Vec<FileResult>> {
    let mut results = Vec::new();
    if !dir.exists() {
        return Ok(results);
    }

    for entry in WalkDir::new(dir)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().map(|e| e != "json").unwrap_or(true) {
            continue;
        }

        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<FileResult>(&content) {
            Ok(result) => results.push(result),
            Err(e) => warn!("Skipping unreadable report {}: {}", path.display(), e),
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn case(name: &str, success: bool) -> CaseResult {
        CaseResult {
            name: name.to_string(),
            success,
            duration_ms: 12,
            snapshots: vec![],
            error: (!success).then(|| "Snapshot mismatch".to_string()),
        }
    }

    fn file(name: &str, cases: Vec<CaseResult>) -> FileResult {
        FileResult {
            file: name.to_string(),
            started_at: chrono::Utc::now(),
            duration_ms: 100,
            setup_error: None,
            setup_fatal: false,
            cases,
        }
    }

    #[test]
    fn test_write_and_load() {
        let dir = TempDir::new().unwrap();
        write_file_result(dir.path(), &file("tests/breaks.rs", vec![case("a", true)])).unwrap();
        write_file_result(
            dir.path(),
            &file("tests/floats.rs", vec![case("b", true), case("c", false)]),
        )
        .unwrap();
        std::fs::write(dir.path().join("garbage.json"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let results = load_results(dir.path()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].file, "tests/breaks.rs");

        let summary = Summary::from_results(&results);
        assert_eq!(summary.files, 2);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
        assert!(!summary.success());
    }

    #[test]
    fn test_setup_failure_fails_summary() {
        let mut result = file("tests/breaks.rs", vec![]);
        result.setup_error = Some("Endpoint record not found".to_string());
        assert!(!result.success());

        let summary = Summary::from_results(&[result]);
        assert_eq!(summary.setup_failures, 1);
        assert_eq!(summary.fatal_setup_failures, 0);
        assert!(!summary.success());
    }

    #[test]
    fn test_fatal_setup_failures_counted_separately() {
        let mut missing = file("tests/breaks.rs", vec![]);
        missing.setup_error = Some("Endpoint record not found".to_string());
        missing.setup_fatal = true;
        let mut unreachable = file("tests/floats.rs", vec![]);
        unreachable.setup_error = Some("Failed to attach".to_string());

        let passing = file("tests/a.rs", vec![case("a", true)]);
        let summary = Summary::from_results(&[missing, unreachable, passing]);
        assert_eq!(summary.setup_failures, 2);
        assert_eq!(summary.fatal_setup_failures, 1);
        assert_eq!(summary.passed, 1);
    }

    #[test]
    fn test_report_without_fatal_flag_loads() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("tests-breaks-rs.json"),
            r#"{"file":"tests/breaks.rs","started_at":"2026-01-05T10:00:00Z","duration_ms":5,"setup_error":null,"cases":[]}"#,
        )
        .unwrap();
        let results = load_results(dir.path()).unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].setup_fatal);
    }

    #[test]
    fn test_load_missing_dir() {
        assert!(load_results(Path::new("/nonexistent/results")).unwrap().is_empty());
    }
}
