//! `match_pdf`: rasterize one page of a rendered PDF and compare it with the
//! stored baseline.
//!
//! Snapshots are named `<test file stem>-<case>-page-<N>` and live in a
//! snapshots directory next to the test file. Intermediate PDF and PNG files
//! go to a per-test-file scratch directory under the working directory and
//! are removed once the comparison has its image, whatever the outcome,
//! unless debug mode is on.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::rasterize::{png_path, Rasterizer};
use crate::report::SnapshotRecord;
use crate::snapshot::{SnapshotStore, VisualDiff};

pub struct SnapshotMatcher {
    file_stem: String,
    case_slug: String,
    scratch_dir: PathBuf,
    dpi: u32,
    debug: bool,
    store: SnapshotStore,
    rasterizer: Arc<dyn Rasterizer>,
    records: Mutex<Vec<SnapshotRecord>>,
}

impl SnapshotMatcher {
    pub fn new(
        config: &HarnessConfig,
        test_file: &Path,
        case_name: &str,
        rasterizer: Arc<dyn Rasterizer>,
    ) -> Self {
        let file_stem = test_file
            .file_stem()
            .map(|s| slugify(&s.to_string_lossy()))
            .unwrap_or_else(|| "snapshot".to_string());
        let snapshots_dir = test_file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&config.snapshot.snapshots_dir_name);

        Self {
            file_stem,
            case_slug: slugify(case_name),
            scratch_dir: scratch_dir_for(&config.work_dir, test_file),
            dpi: config.snapshot.dpi,
            debug: config.debug,
            store: SnapshotStore::new(snapshots_dir, &config.snapshot),
            rasterizer,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn snapshot_name(&self, page: u32) -> String {
        format!("{}-{}-page-{}", self.file_stem, self.case_slug, page)
    }

    /// Compare page `page` (1-based, default 1) of `pdf` against its
    /// baseline. A mismatch is an error carrying the diff image path.
    pub async fn match_pdf(&self, pdf: impl AsRef<[u8]>, page: Option<u32>) -> HarnessResult<VisualDiff> {
        let page = page.unwrap_or(1);
        if page == 0 {
            return Err(HarnessError::PageOutOfRange(page));
        }

        let name = self.snapshot_name(page);
        let png = self.rasterize_page(pdf.as_ref(), page, &name).await?;
        let diff = self.store.compare(&name, &png)?;
        self.record(&diff);

        if !diff.matches {
            return Err(HarnessError::SnapshotMismatch {
                name,
                diff_percent: diff.diff_percent,
                threshold: self.store.threshold(),
                diff_path: diff.diff_image_path.unwrap_or_default(),
            });
        }
        Ok(diff)
    }

    /// Comparisons made so far, in order
    pub fn records(&self) -> Vec<SnapshotRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn rasterize_page(&self, pdf: &[u8], page: u32, name: &str) -> HarnessResult<Vec<u8>> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;

        let pdf_path = self.scratch_dir.join(format!("{}.pdf", name));
        let out_prefix = self.scratch_dir.join(name);
        let mut scratch = ScratchFiles::new(self.debug);
        scratch.track(pdf_path.clone());
        scratch.track(png_path(&out_prefix));

        tokio::fs::write(&pdf_path, pdf).await?;

        let produced = self
            .rasterizer
            .rasterize(&pdf_path, page, self.dpi, &out_prefix)
            .await
            .map_err(|e| attribute(e, name, page))?;
        scratch.track(produced.clone());

        Ok(tokio::fs::read(&produced).await?)
    }

    fn record(&self, diff: &VisualDiff) {
        let record = SnapshotRecord::from(diff);
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

/// Rasterizer failures name the snapshot and page they belong to
fn attribute(err: HarnessError, name: &str, page: u32) -> HarnessError {
    let reason = match err {
        HarnessError::Rasterize { reason, .. } => reason,
        HarnessError::PageOutOfRange(page) => return HarnessError::PageOutOfRange(page),
        other => other.to_string(),
    };
    HarnessError::Rasterize {
        name: name.to_string(),
        page,
        reason,
    }
}

/// Scratch files removed on drop unless kept for debugging
pub struct ScratchFiles {
    paths: Vec<PathBuf>,
    keep: bool,
}

impl ScratchFiles {
    pub fn new(keep: bool) -> Self {
        Self {
            paths: Vec::new(),
            keep,
        }
    }

    pub fn track(&mut self, path: PathBuf) {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        if self.keep {
            for path in self.paths.iter().filter(|p| p.exists()) {
                debug!("Keeping scratch file {}", path.display());
            }
            return;
        }
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove scratch file {}: {}", path.display(), e),
            }
        }
    }
}

/// Scratch directory owned by one test file
pub fn scratch_dir_for(work_dir: &Path, test_file: &Path) -> PathBuf {
    work_dir.join(slugify(&test_file.to_string_lossy()))
}

/// Lowercase ASCII alphanumerics, everything else collapsed to single dashes
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("renders five pages", "renders-five-pages")]
    #[test_case("Break  after: page!", "break-after-page")]
    #[test_case("/root/tests/breaks.rs", "root-tests-breaks-rs")]
    #[test_case("--", "")]
    fn test_slugify(input: &str, expected: &str) {
        assert_eq!(slugify(input), expected);
    }

    #[test]
    fn test_scratch_dirs_differ_per_file() {
        let work = Path::new("/tmp/ph");
        let a = scratch_dir_for(work, Path::new("/repo/tests/breaks.rs"));
        let b = scratch_dir_for(work, Path::new("/repo/tests/floats.rs"));
        assert_ne!(a, b);
        assert!(a.starts_with(work));
    }

    #[test]
    fn test_scratch_files_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page-1.pdf");
        std::fs::write(&path, b"%PDF").unwrap();
        {
            let mut scratch = ScratchFiles::new(false);
            scratch.track(path.clone());
            scratch.track(dir.path().join("never-written.png"));
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_scratch_files_kept_in_debug() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page-1.pdf");
        std::fs::write(&path, b"%PDF").unwrap();
        {
            let mut scratch = ScratchFiles::new(true);
            scratch.track(path.clone());
        }
        assert!(path.exists());
    }

    #[test]
    fn test_rasterize_errors_attributed() {
        let err = attribute(
            HarnessError::Rasterize {
                name: "tmp.pdf".to_string(),
                page: 3,
                reason: "boom".to_string(),
            },
            "breaks-case-page-3",
            3,
        );
        match err {
            HarnessError::Rasterize { name, page, reason } => {
                assert_eq!(name, "breaks-case-page-3");
                assert_eq!(page, 3);
                assert_eq!(reason, "boom");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
