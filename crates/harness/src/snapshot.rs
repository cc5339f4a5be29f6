//! Baseline storage and pixel comparison for page snapshots

use image::{Pixel, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{BaselineMode, SnapshotConfig};
use crate::error::{HarnessError, HarnessResult};

/// How a comparison was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    /// No baseline existed; the image became the baseline
    Created,
    /// Compared against the baseline
    Compared,
    /// The baseline was overwritten with the image
    Updated,
}

/// Result of a snapshot comparison
#[derive(Debug, Clone)]
pub struct VisualDiff {
    pub name: String,

    pub status: SnapshotStatus,

    /// Whether the images match (within threshold)
    pub matches: bool,

    /// Percentage of pixels that differ
    pub diff_percent: f64,

    pub diff_pixels: u64,

    /// Pixels in the union of both images
    pub total_pixels: u64,

    pub baseline_path: PathBuf,

    /// Only written when the comparison fails
    pub diff_image_path: Option<PathBuf>,

    pub actual_hash: String,

    pub baseline_hash: String,
}

/// Baselines and diff images for one snapshots directory
pub struct SnapshotStore {
    /// Directory containing baseline images
    snapshots_dir: PathBuf,

    /// Directory for diff images
    diff_dir: PathBuf,

    /// Allowed share of differing pixels (0.0 - 100.0 percent)
    threshold: f64,

    /// Per-channel difference treated as equal
    channel_tolerance: u8,

    mode: BaselineMode,
}

impl SnapshotStore {
    /// Directories are created lazily on first write
    pub fn new(snapshots_dir: PathBuf, config: &SnapshotConfig) -> Self {
        let diff_dir = snapshots_dir.join(&config.diff_dir_name);
        Self {
            snapshots_dir,
            diff_dir,
            threshold: config.threshold_percent,
            channel_tolerance: config.channel_tolerance,
            mode: config.baseline_mode,
        }
    }

    pub fn snapshots_dir(&self) -> &Path {
        &self.snapshots_dir
    }

    pub fn diff_dir(&self) -> &Path {
        &self.diff_dir
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn baseline_path(&self, name: &str) -> PathBuf {
        self.snapshots_dir.join(format!("{}.png", name))
    }

    pub fn diff_path(&self, name: &str) -> PathBuf {
        self.diff_dir.join(format!("{}-diff.png", name))
    }

    /// Compare PNG bytes against the baseline called `name`.
    ///
    /// A missing baseline is created unless the store runs in
    /// [`BaselineMode::Require`]. A failed comparison leaves a diff image
    /// behind; a passing one removes any diff left from an earlier run.
    pub fn compare(&self, name: &str, actual_png: &[u8]) -> HarnessResult<VisualDiff> {
        let baseline_path = self.baseline_path(name);
        let diff_path = self.diff_path(name);
        let actual_hash = hash_bytes(actual_png);

        if !baseline_path.exists() {
            if self.mode == BaselineMode::Require {
                return Err(HarnessError::BaselineMissing(baseline_path));
            }

            let actual = image::load_from_memory(actual_png)?;
            write_atomic(&baseline_path, actual_png)?;
            info!("No baseline for '{}', created {}", name, baseline_path.display());

            return Ok(VisualDiff {
                name: name.to_string(),
                status: SnapshotStatus::Created,
                matches: true,
                diff_percent: 0.0,
                diff_pixels: 0,
                total_pixels: (actual.width() as u64) * (actual.height() as u64),
                baseline_path,
                diff_image_path: None,
                actual_hash: actual_hash.clone(),
                baseline_hash: actual_hash,
            });
        }

        let baseline_png = std::fs::read(&baseline_path)?;
        let baseline_hash = hash_bytes(&baseline_png);
        let actual_img = image::load_from_memory(actual_png)?.to_rgba8();

        // Quick hash comparison
        if actual_hash == baseline_hash {
            debug!("Snapshot '{}' matches exactly (same hash)", name);
            remove_if_exists(&diff_path)?;
            return Ok(VisualDiff {
                name: name.to_string(),
                status: SnapshotStatus::Compared,
                matches: true,
                diff_percent: 0.0,
                diff_pixels: 0,
                total_pixels: (actual_img.width() as u64) * (actual_img.height() as u64),
                baseline_path,
                diff_image_path: None,
                actual_hash,
                baseline_hash,
            });
        }

        let baseline_img = image::load_from_memory(&baseline_png)?.to_rgba8();
        if actual_img.dimensions() != baseline_img.dimensions() {
            warn!(
                "Snapshot '{}' dimensions differ: actual {:?} vs baseline {:?}",
                name,
                actual_img.dimensions(),
                baseline_img.dimensions()
            );
        }

        let comparison = compare_images(&actual_img, &baseline_img, self.channel_tolerance);
        let diff_percent = comparison.diff_percent();
        let matches = diff_percent <= self.threshold;

        if matches {
            remove_if_exists(&diff_path)?;
            debug!("Snapshot '{}' within threshold ({:.3}% differ)", name, diff_percent);
            return Ok(VisualDiff {
                name: name.to_string(),
                status: SnapshotStatus::Compared,
                matches,
                diff_percent,
                diff_pixels: comparison.diff_pixels,
                total_pixels: comparison.total_pixels,
                baseline_path,
                diff_image_path: None,
                actual_hash,
                baseline_hash,
            });
        }

        if self.mode == BaselineMode::Update {
            debug!("'{}' differs by {:.2}%, replacing baseline", name, diff_percent);
            let baseline_path = self.update_baseline(name, actual_png)?;
            return Ok(VisualDiff {
                name: name.to_string(),
                status: SnapshotStatus::Updated,
                matches: true,
                diff_percent,
                diff_pixels: comparison.diff_pixels,
                total_pixels: comparison.total_pixels,
                baseline_path,
                diff_image_path: None,
                actual_hash: actual_hash.clone(),
                baseline_hash: actual_hash,
            });
        }

        std::fs::create_dir_all(&self.diff_dir)?;
        comparison.image.save(&diff_path)?;
        warn!(
            "Visual regression detected in '{}': {:.2}% pixels differ (threshold: {:.2}%)",
            name, diff_percent, self.threshold
        );

        Ok(VisualDiff {
            name: name.to_string(),
            status: SnapshotStatus::Compared,
            matches: false,
            diff_percent,
            diff_pixels: comparison.diff_pixels,
            total_pixels: comparison.total_pixels,
            baseline_path,
            diff_image_path: Some(diff_path),
            actual_hash,
            baseline_hash,
        })
    }

    /// Replace the baseline called `name`
    pub fn update_baseline(&self, name: &str, png: &[u8]) -> HarnessResult<PathBuf> {
        image::load_from_memory(png)?;
        let path = self.baseline_path(name);
        write_atomic(&path, png)?;
        remove_if_exists(&self.diff_path(name))?;
        info!("Updated baseline for '{}'", name);
        Ok(path)
    }

    /// List all baselines
    pub fn list_baselines(&self) -> HarnessResult<Vec<String>> {
        let mut baselines = Vec::new();

        let entries = match std::fs::read_dir(&self.snapshots_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(baselines),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().map(|e| e == "png").unwrap_or(false) {
                if let Some(name) = path.file_stem() {
                    baselines.push(name.to_string_lossy().to_string());
                }
            }
        }

        baselines.sort();
        Ok(baselines)
    }

    /// Remove every diff image, returning how many were deleted
    pub fn clean_diffs(&self) -> HarnessResult<usize> {
        let entries = match std::fs::read_dir(&self.diff_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.is_file() {
                std::fs::remove_file(path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Pixel comparison of two images
pub struct ImageComparison {
    /// Differing pixels in red over a dimmed copy of the actual image
    pub image: RgbaImage,
    pub diff_pixels: u64,
    pub total_pixels: u64,
}

impl ImageComparison {
    pub fn diff_percent(&self) -> f64 {
        if self.total_pixels == 0 {
            return 0.0;
        }
        (self.diff_pixels as f64 / self.total_pixels as f64) * 100.0
    }
}

/// Compare pixel by pixel over the union of both images. Pixels present in
/// only one of them count as differing.
pub fn compare_images(actual: &RgbaImage, baseline: &RgbaImage, tolerance: u8) -> ImageComparison {
    let width = actual.width().max(baseline.width());
    let height = actual.height().max(baseline.height());

    let mut image = RgbaImage::new(width, height);
    let mut diff_pixels = 0u64;

    for y in 0..height {
        for x in 0..width {
            let a = in_bounds(actual, x, y);
            let b = in_bounds(baseline, x, y);

            let differs = match (a, b) {
                (Some(a), Some(b)) => pixels_differ(a, b, tolerance),
                _ => true,
            };

            if differs {
                diff_pixels += 1;
                image.put_pixel(x, y, Rgba([255, 0, 0, 255]));
            } else if let Some(pixel) = a {
                let channels = pixel.channels();
                image.put_pixel(
                    x,
                    y,
                    Rgba([channels[0] / 2, channels[1] / 2, channels[2] / 2, 128]),
                );
            }
        }
    }

    ImageComparison {
        image,
        diff_pixels,
        total_pixels: (width as u64) * (height as u64),
    }
}

fn in_bounds(img: &RgbaImage, x: u32, y: u32) -> Option<&Rgba<u8>> {
    if x < img.width() && y < img.height() {
        Some(img.get_pixel(x, y))
    } else {
        None
    }
}

/// Check if two pixels differ beyond the per-channel tolerance
fn pixels_differ(a: &Rgba<u8>, b: &Rgba<u8>, tolerance: u8) -> bool {
    a.channels()
        .iter()
        .zip(b.channels())
        .any(|(x, y)| x.abs_diff(*y) > tolerance)
}

fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> HarnessResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> HarnessResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
