//! Snapshot matcher behaviour, with a rasterizer that paints solid colours
//! instead of shelling out to poppler.

use async_trait::async_trait;
use image::{ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use pagination_harness::config::BaselineMode;
use pagination_harness::rasterize::png_path;
use pagination_harness::{
    HarnessConfig, HarnessError, HarnessResult, Rasterizer, SnapshotMatcher, SnapshotStatus,
};

/// Treats the "PDF" as `SOLID:<hex>,<hex>,...`, one colour per page
struct SolidRasterizer;

impl SolidRasterizer {
    fn pages(pdf: &Path) -> HarnessResult<Vec<[u8; 4]>> {
        let content = std::fs::read_to_string(pdf)?;
        let colours = content
            .strip_prefix("SOLID:")
            .ok_or_else(|| HarnessError::CaseFailed("not a solid pdf".to_string()))?;
        Ok(colours
            .split(',')
            .map(|hex| {
                let v = u32::from_str_radix(hex.trim(), 16).unwrap_or(0);
                [(v >> 16) as u8, (v >> 8) as u8, v as u8, 255]
            })
            .collect())
    }
}

#[async_trait]
impl Rasterizer for SolidRasterizer {
    async fn rasterize(
        &self,
        pdf: &Path,
        page: u32,
        dpi: u32,
        out_prefix: &Path,
    ) -> HarnessResult<PathBuf> {
        let pages = Self::pages(pdf)?;
        let colour = pages
            .get(page as usize - 1)
            .ok_or_else(|| HarnessError::Rasterize {
                name: pdf.display().to_string(),
                page,
                reason: format!("document has {} page(s)", pages.len()),
            })?;

        let side = dpi / 8;
        let img = RgbaImage::from_pixel(side, side, Rgba(*colour));
        let out = png_path(out_prefix);
        img.save_with_format(&out, ImageFormat::Png)?;
        Ok(out)
    }

    async fn page_count(&self, pdf: &Path) -> HarnessResult<u32> {
        Ok(Self::pages(pdf)?.len() as u32)
    }
}

struct Fixture {
    dir: TempDir,
    config: HarnessConfig,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = HarnessConfig::default();
        config.work_dir = dir.path().join("work");
        Self { dir, config }
    }

    fn test_file(&self, name: &str) -> PathBuf {
        self.dir.path().join("tests").join(name)
    }

    fn matcher(&self, file: &str, case: &str) -> SnapshotMatcher {
        SnapshotMatcher::new(&self.config, &self.test_file(file), case, Arc::new(SolidRasterizer))
    }

    fn scratch_files(&self, matcher: &SnapshotMatcher) -> Vec<PathBuf> {
        match std::fs::read_dir(matcher.scratch_dir()) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => vec![],
        }
    }
}

#[tokio::test]
async fn missing_baseline_is_created_then_matched() {
    let fx = Fixture::new();
    let matcher = fx.matcher("breaks.rs", "two pages");
    let pdf = b"SOLID:ff0000,00ff00".to_vec();

    let first = matcher.match_pdf(&pdf, Some(2)).await.unwrap();
    assert_eq!(first.status, SnapshotStatus::Created);
    assert_eq!(first.name, "breaks-two-pages-page-2");
    assert!(first.baseline_path.exists());
    assert!(first
        .baseline_path
        .starts_with(fx.dir.path().join("tests/__image_snapshots__")));

    let second = matcher.match_pdf(&pdf, Some(2)).await.unwrap();
    assert_eq!(second.status, SnapshotStatus::Compared);
    assert!(second.matches);
    assert_eq!(second.diff_pixels, 0);

    assert_eq!(matcher.records().len(), 2);
}

#[tokio::test]
async fn default_page_is_first() {
    let fx = Fixture::new();
    let matcher = fx.matcher("breaks.rs", "default");

    let diff = matcher.match_pdf(b"SOLID:0000ff", None).await.unwrap();
    assert_eq!(diff.name, "breaks-default-page-1");
}

#[tokio::test]
async fn changed_page_fails_with_diff_image() {
    let fx = Fixture::new();
    let matcher = fx.matcher("breaks.rs", "regression");

    matcher.match_pdf(b"SOLID:ffffff", Some(1)).await.unwrap();
    let err = matcher.match_pdf(b"SOLID:000000", Some(1)).await.unwrap_err();

    match err {
        HarnessError::SnapshotMismatch {
            name,
            diff_percent,
            diff_path,
            ..
        } => {
            assert_eq!(name, "breaks-regression-page-1");
            assert_eq!(diff_percent, 100.0);
            assert!(diff_path.exists());
            assert!(diff_path.ends_with("__diff_output__/breaks-regression-page-1-diff.png"));
        }
        other => panic!("expected mismatch, got {}", other),
    }

    // The baseline is not replaced by a failing run
    let again = matcher.match_pdf(b"SOLID:ffffff", Some(1)).await.unwrap();
    assert!(again.matches);
    assert!(!matcher.store().diff_path("breaks-regression-page-1").exists());
}

fn solid_png(side: u32, colour: [u8; 4]) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    RgbaImage::from_pixel(side, side, Rgba(colour))
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

#[tokio::test]
async fn second_page_differing_from_committed_baseline_fails() {
    let fx = Fixture::new();
    let matcher = fx.matcher("breaks.rs", "forced break");
    let side = fx.config.snapshot.dpi / 8;

    // Baseline from an earlier run, where page 2 was white
    let name = matcher.snapshot_name(2);
    matcher
        .store()
        .update_baseline(&name, &solid_png(side, [255, 255, 255, 255]))
        .unwrap();

    let err = matcher
        .match_pdf(b"SOLID:ffffff,000000", Some(2))
        .await
        .unwrap_err();

    match err {
        HarnessError::SnapshotMismatch {
            name: failed,
            diff_percent,
            threshold,
            diff_path,
        } => {
            assert_eq!(failed, "breaks-forced-break-page-2");
            assert!(diff_percent > threshold);
            assert!(diff_path.exists());
        }
        other => panic!("expected mismatch, got {}", other),
    }
    assert!(fx.scratch_files(&matcher).is_empty());

    // Page 1 has no baseline yet and is unaffected
    let first = matcher.match_pdf(b"SOLID:ffffff,000000", Some(1)).await.unwrap();
    assert_eq!(first.status, SnapshotStatus::Created);
}

#[tokio::test]
async fn repeated_runs_agree() {
    let fx = Fixture::new();
    let matcher = fx.matcher("breaks.rs", "stable");
    let pdf = b"SOLID:336699,996633";

    matcher.match_pdf(pdf, Some(1)).await.unwrap();
    for _ in 0..3 {
        let diff = matcher.match_pdf(pdf, Some(1)).await.unwrap();
        assert!(diff.matches);
        assert_eq!(diff.actual_hash, diff.baseline_hash);
    }
}

#[tokio::test]
async fn scratch_files_removed_on_success_and_failure() {
    let fx = Fixture::new();
    let matcher = fx.matcher("breaks.rs", "cleanup");

    matcher.match_pdf(b"SOLID:ffffff", Some(1)).await.unwrap();
    assert!(fx.scratch_files(&matcher).is_empty());

    matcher.match_pdf(b"SOLID:000000", Some(1)).await.unwrap_err();
    assert!(fx.scratch_files(&matcher).is_empty());

    let err = matcher.match_pdf(b"SOLID:ffffff", Some(3)).await.unwrap_err();
    match err {
        HarnessError::Rasterize { name, page, reason } => {
            assert_eq!(name, "breaks-cleanup-page-3");
            assert_eq!(page, 3);
            assert!(reason.contains("1 page"));
        }
        other => panic!("expected rasterize error, got {}", other),
    }
    assert!(fx.scratch_files(&matcher).is_empty());
}

#[tokio::test]
async fn debug_mode_keeps_scratch_files() {
    let mut fx = Fixture::new();
    fx.config.debug = true;
    let matcher = fx.matcher("breaks.rs", "inspect");

    matcher.match_pdf(b"SOLID:ffffff", Some(1)).await.unwrap();

    let mut names: Vec<String> = fx
        .scratch_files(&matcher)
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["breaks-inspect-page-1.pdf", "breaks-inspect-page-1.png"]
    );
}

#[tokio::test]
async fn page_zero_rejected() {
    let fx = Fixture::new();
    let matcher = fx.matcher("breaks.rs", "zero");
    let err = matcher.match_pdf(b"SOLID:ffffff", Some(0)).await.unwrap_err();
    assert!(matches!(err, HarnessError::PageOutOfRange(0)));
}

#[tokio::test]
async fn required_baseline_missing_fails() {
    let mut fx = Fixture::new();
    fx.config.snapshot.baseline_mode = BaselineMode::Require;
    let matcher = fx.matcher("breaks.rs", "gated");

    let err = matcher.match_pdf(b"SOLID:ffffff", Some(1)).await.unwrap_err();
    assert!(matches!(err, HarnessError::BaselineMissing(_)));
    assert!(matcher.store().list_baselines().unwrap().is_empty());
    assert!(fx.scratch_files(&matcher).is_empty());
}

#[tokio::test]
async fn concurrent_files_do_not_collide() {
    let fx = Fixture::new();
    let a = fx.matcher("breaks.rs", "same case");
    let b = fx.matcher("floats.rs", "same case");
    assert_ne!(a.scratch_dir(), b.scratch_dir());

    let pdf_a = b"SOLID:ff0000,ff0000,ff0000";
    let pdf_b = b"SOLID:0000ff,0000ff,0000ff";

    let (ra, rb) = tokio::join!(
        async {
            for page in 1..=3 {
                a.match_pdf(pdf_a, Some(page)).await?;
            }
            Ok::<_, HarnessError>(())
        },
        async {
            for page in 1..=3 {
                b.match_pdf(pdf_b, Some(page)).await?;
            }
            Ok::<_, HarnessError>(())
        }
    );
    ra.unwrap();
    rb.unwrap();

    let baselines = a.store().list_baselines().unwrap();
    assert_eq!(baselines.len(), 6);
    assert!(baselines.contains(&"breaks-same-case-page-3".to_string()));
    assert!(baselines.contains(&"floats-same-case-page-3".to_string()));

    // Each file still matches its own baselines afterwards
    a.match_pdf(pdf_a, Some(2)).await.unwrap();
    b.match_pdf(pdf_b, Some(2)).await.unwrap();
}
