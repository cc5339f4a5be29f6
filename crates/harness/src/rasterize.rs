//! PDF page rasterization through an external tool

use async_trait::async_trait;
use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::config::SnapshotConfig;
use crate::error::{HarnessError, HarnessResult};

/// Converts one page of a PDF into a PNG
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Render 1-based `page` of `pdf` at `dpi` and return the path of the PNG
    /// written next to `out_prefix`
    async fn rasterize(
        &self,
        pdf: &Path,
        page: u32,
        dpi: u32,
        out_prefix: &Path,
    ) -> HarnessResult<PathBuf>;

    async fn page_count(&self, pdf: &Path) -> HarnessResult<u32>;
}

/// `pdftoppm` and `pdfinfo` from poppler-utils
#[derive(Debug, Clone)]
pub struct PopplerRasterizer {
    pdftoppm: PathBuf,
    pdfinfo: PathBuf,
}

impl PopplerRasterizer {
    pub fn new(config: &SnapshotConfig) -> Self {
        Self {
            pdftoppm: config.rasterizer.clone(),
            pdfinfo: config.pdfinfo.clone(),
        }
    }
}

impl Default for PopplerRasterizer {
    fn default() -> Self {
        Self::new(&SnapshotConfig::default())
    }
}

#[async_trait]
impl Rasterizer for PopplerRasterizer {
    async fn rasterize(
        &self,
        pdf: &Path,
        page: u32,
        dpi: u32,
        out_prefix: &Path,
    ) -> HarnessResult<PathBuf> {
        if page == 0 {
            return Err(HarnessError::PageOutOfRange(page));
        }
        let fail = |reason: String| HarnessError::Rasterize {
            name: file_label(pdf),
            page,
            reason,
        };

        let page_arg = page.to_string();
        let output = Command::new(&self.pdftoppm)
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(&page_arg)
            .arg("-l")
            .arg(&page_arg)
            .arg("-singlefile")
            .arg(pdf)
            .arg(out_prefix)
            .output()
            .await
            .map_err(|e| fail(format!("cannot run {}: {}", self.pdftoppm.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!("{} exited with {}: {}", self.pdftoppm.display(), output.status, stderr.trim())));
        }

        let png = png_path(out_prefix);
        if !png.exists() {
            return Err(fail(format!("no output at {}", png.display())));
        }

        debug!("Rasterized page {} of {} to {}", page, pdf.display(), png.display());
        Ok(png)
    }

    async fn page_count(&self, pdf: &Path) -> HarnessResult<u32> {
        let fail = |reason: String| HarnessError::Rasterize {
            name: file_label(pdf),
            page: 0,
            reason,
        };

        let output = Command::new(&self.pdfinfo)
            .arg(pdf)
            .output()
            .await
            .map_err(|e| fail(format!("cannot run {}: {}", self.pdfinfo.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!("{} exited with {}: {}", self.pdfinfo.display(), output.status, stderr.trim())));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_page_count(&stdout).ok_or_else(|| fail("no page count in pdfinfo output".to_string()))
    }
}

/// `<prefix>.png`, without touching dots already in the prefix
pub fn png_path(out_prefix: &Path) -> PathBuf {
    let mut name = OsString::from(out_prefix.as_os_str());
    name.push(".png");
    PathBuf::from(name)
}

/// Read the `Pages:` line from `pdfinfo` output
pub fn parse_page_count(pdfinfo_output: &str) -> Option<u32> {
    let re = Regex::new(r"(?m)^Pages:\s+(\d+)\s*$").ok()?;
    re.captures(pdfinfo_output)?.get(1)?.as_str().parse().ok()
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
