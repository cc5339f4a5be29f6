//! Error types for the pagination harness

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Browser failed to start: {0}")]
    BrowserLaunch(String),

    #[error("No Chrome/Chromium executable found. Set CHROME_PATH or browser.executable")]
    BrowserNotFound,

    #[error("Fixture server failed to start: {0}")]
    FixtureServer(String),

    #[error("Endpoint record not found at {} (was global setup run?)", .path.display())]
    EndpointMissing { path: PathBuf },

    #[error("Endpoint record at {} is empty (was global setup run?)", .path.display())]
    EndpointEmpty { path: PathBuf },

    #[error("Failed to attach to shared browser at {endpoint}: {reason}")]
    Attach { endpoint: String, reason: String },

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Rasterizing page {page} of {name} failed: {reason}")]
    Rasterize {
        name: String,
        page: u32,
        reason: String,
    },

    #[error("Page index must be 1 or greater, got {0}")]
    PageOutOfRange(u32),

    #[error("Snapshot mismatch: {name} differs by {diff_percent:.2}% (threshold: {threshold:.2}%), diff written to {}", .diff_path.display())]
    SnapshotMismatch {
        name: String,
        diff_percent: f64,
        threshold: f64,
        diff_path: PathBuf,
    },

    #[error("Baseline not found: {} (baseline creation is disabled)", .0.display())]
    BaselineMissing(PathBuf),

    #[error("Timeout after {seconds:.1}s: {what}")]
    Timeout { what: String, seconds: f64 },

    #[error("Case failed: {0}")]
    CaseFailed(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl HarnessError {
    /// Errors that mean global setup never happened or did not finish, as
    /// opposed to a browser that was running and went away.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            HarnessError::EndpointMissing { .. } | HarnessError::EndpointEmpty { .. }
        )
    }

    /// Errors that abort the whole run rather than a single file or case.
    pub fn is_fatal(&self) -> bool {
        self.is_setup_error()
            || matches!(
                self,
                HarnessError::BrowserLaunch(_)
                    | HarnessError::BrowserNotFound
                    | HarnessError::FixtureServer(_)
            )
    }
}

impl From<chromiumoxide::error::CdpError> for HarnessError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        HarnessError::Browser(e.to_string())
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
