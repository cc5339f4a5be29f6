//! Harness configuration
//!
//! One [`HarnessConfig`] is resolved per process and handed to the launcher,
//! the test environment, the snapshot matcher and the teardown. The process
//! environment is only consulted in [`HarnessConfig::apply_env_with`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{HarnessError, HarnessResult};

pub const ENV_DEBUG: &str = "PAGINATION_HARNESS_DEBUG";
pub const ENV_WORK_DIR: &str = "PAGINATION_HARNESS_WORK_DIR";
pub const ENV_ENDPOINT_FILE: &str = "PAGINATION_HARNESS_ENDPOINT_FILE";
pub const ENV_ORIGIN: &str = "PAGINATION_HARNESS_ORIGIN";
pub const ENV_RESULTS_DIR: &str = "PAGINATION_HARNESS_RESULTS_DIR";
pub const ENV_BASELINES: &str = "PAGINATION_HARNESS_BASELINES";
pub const ENV_CASE_TIMEOUT_MS: &str = "PAGINATION_HARNESS_CASE_TIMEOUT_MS";
pub const ENV_SKIP_WITHOUT_BROWSER: &str = "PAGINATION_HARNESS_SKIP_WITHOUT_BROWSER";
pub const ENV_CHROME_PATH: &str = "CHROME_PATH";

/// Full resolved configuration as JSON, handed from the orchestrator to
/// test processes; individual variables above still override it
pub const ENV_CONFIG: &str = "PAGINATION_HARNESS_CONFIG";

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Keep scratch files, leave pages open and keep the shared browser alive
    pub debug: bool,

    /// Run-scoped scratch directory
    pub work_dir: PathBuf,

    /// Endpoint record location (defaults to `<work_dir>/ws-endpoint`)
    pub endpoint_file: Option<PathBuf>,

    /// Where per-file JSON result reports are written, if anywhere
    pub results_dir: Option<PathBuf>,

    /// Static fixture server
    pub fixtures: FixtureConfig,

    /// Shared browser process
    pub browser: BrowserConfig,

    /// Page loading behaviour
    pub page: PageConfig,

    /// Rasterization and image comparison
    pub snapshot: SnapshotConfig,

    /// Per test case timeout in milliseconds
    pub case_timeout_ms: u64,

    /// Report browser-backed test files as skipped instead of failing them
    /// when no shared browser was started
    pub skip_without_browser: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            debug: false,
            work_dir: std::env::temp_dir().join("pagination-harness"),
            endpoint_file: None,
            results_dir: None,
            fixtures: FixtureConfig::default(),
            browser: BrowserConfig::default(),
            page: PageConfig::default(),
            snapshot: SnapshotConfig::default(),
            case_timeout_ms: 10_000,
            skip_without_browser: false,
        }
    }
}

/// Fixture server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureConfig {
    /// Directory served at the fixture origin
    pub root: PathBuf,

    /// Bind host
    pub host: String,

    /// Bind port (0 = pick a free port)
    pub port: u16,

    /// Origin as seen by test files, set by the run orchestrator
    pub origin: Option<String>,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("fixtures"),
            host: "127.0.0.1".to_string(),
            port: 9090,
            origin: None,
        }
    }
}

impl FixtureConfig {
    /// Base URL for fixture resolution
    pub fn origin(&self) -> String {
        match &self.origin {
            Some(origin) => origin.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

/// Browser process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Chrome/Chromium binary (None = search PATH)
    pub executable: Option<PathBuf>,

    pub viewport_width: u32,
    pub viewport_height: u32,

    /// Pass `--no-sandbox` (needed in most containers)
    pub no_sandbox: bool,

    /// Additional command line flags
    pub extra_args: Vec<String>,

    /// How long to wait for the DevTools endpoint, in milliseconds
    pub launch_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            viewport_width: 800,
            viewport_height: 600,
            no_sandbox: true,
            extra_args: Vec::new(),
            launch_timeout_ms: 30_000,
        }
    }
}

impl BrowserConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }
}

/// Page loading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    /// Installed before any document script runs, so the completion hook
    /// sees the layout engine's configuration before the engine does
    pub init_script: String,

    /// JavaScript expression evaluated after navigation; a returned promise
    /// is awaited, and its resolution means pagination has finished
    pub ready_expression: String,

    /// Selector matching one element per rendered page
    pub page_selector: String,

    /// Navigation plus readiness timeout in milliseconds
    pub navigation_timeout_ms: u64,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            init_script: DEFAULT_INIT_SCRIPT.to_string(),
            ready_expression: DEFAULT_READY_EXPRESSION.to_string(),
            page_selector: ".pagedjs_page".to_string(),
            navigation_timeout_ms: 10_000,
        }
    }
}

impl PageConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }
}

/// Wraps whatever `PagedConfig` the document assigns so its `after` hook
/// also records completion. A document that assigns nothing gets
/// `{ auto: true }`, which is the engine's own default.
const DEFAULT_INIT_SCRIPT: &str = r#"(() => {
  let release;
  window.__paginationComplete = false;
  window.__paginationDone = new Promise((resolve) => { release = resolve; });
  const finish = () => { window.__paginationComplete = true; release(true); };
  const wrap = (config) => {
    const target = Object.assign({}, config);
    const after = target.after;
    target.after = function (...args) {
      const result = after ? after.apply(this, args) : undefined;
      finish();
      return result;
    };
    return target;
  };
  let current = wrap({ auto: true });
  Object.defineProperty(window, 'PagedConfig', {
    configurable: true,
    get: () => current,
    set: (value) => { current = wrap(value); },
  });
  document.addEventListener('pagedjs:rendered', finish, { once: true });
})()"#;

/// Resolves once the completion hook fired, or immediately for documents
/// that do not load a layout engine.
const DEFAULT_READY_EXPRESSION: &str = r#"(() => {
  if (window.__paginationComplete) { return true; }
  if (!window.PagedPolyfill && !window.Paged) { return true; }
  return window.__paginationDone;
})()"#;

/// What to do when a snapshot has no baseline, or differs from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaselineMode {
    /// Missing baselines are written and the comparison passes
    #[default]
    Create,
    /// Missing baselines fail the comparison
    Require,
    /// Missing or differing baselines are overwritten
    Update,
}

impl FromStr for BaselineMode {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" | "" => Ok(BaselineMode::Create),
            "require" | "ci" => Ok(BaselineMode::Require),
            "update" => Ok(BaselineMode::Update),
            other => Err(HarnessError::Config(format!(
                "unknown baseline mode '{}' (expected create, require or update)",
                other
            ))),
        }
    }
}

impl BaselineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaselineMode::Create => "create",
            BaselineMode::Require => "require",
            BaselineMode::Update => "update",
        }
    }
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Rasterization resolution
    pub dpi: u32,

    /// Allowed share of differing pixels (0.0 - 100.0 percent)
    pub threshold_percent: f64,

    /// Per-channel difference still considered equal
    pub channel_tolerance: u8,

    pub baseline_mode: BaselineMode,

    /// `pdftoppm` binary
    pub rasterizer: PathBuf,

    /// `pdfinfo` binary
    pub pdfinfo: PathBuf,

    /// Directory next to each test file holding its baselines
    pub snapshots_dir_name: String,

    /// Directory inside the snapshots directory holding diff images
    pub diff_dir_name: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dpi: 144,
            threshold_percent: 0.5,
            channel_tolerance: 5,
            baseline_mode: BaselineMode::Create,
            rasterizer: PathBuf::from("pdftoppm"),
            pdfinfo: PathBuf::from("pdfinfo"),
            snapshots_dir_name: "__image_snapshots__".to_string(),
            diff_dir_name: "__diff_output__".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> HarnessResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Defaults overridden by the process environment
    pub fn from_env() -> HarnessResult<Self> {
        Self::default().apply_env()
    }

    pub fn apply_env(self) -> HarnessResult<Self> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup
    pub fn apply_env_with<F>(mut self, lookup: F) -> HarnessResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(json) = lookup(ENV_CONFIG).filter(|v| !v.trim().is_empty()) {
            self = serde_json::from_str(&json).map_err(|e| {
                HarnessError::Config(format!("{} is not a valid configuration: {}", ENV_CONFIG, e))
            })?;
        }
        if let Some(value) = lookup(ENV_DEBUG) {
            self.debug = parse_flag(&value);
        }
        if let Some(dir) = lookup(ENV_WORK_DIR).filter(|v| !v.is_empty()) {
            self.work_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup(ENV_ENDPOINT_FILE).filter(|v| !v.is_empty()) {
            self.endpoint_file = Some(PathBuf::from(file));
        }
        if let Some(origin) = lookup(ENV_ORIGIN).filter(|v| !v.is_empty()) {
            self.fixtures.origin = Some(origin);
        }
        if let Some(dir) = lookup(ENV_RESULTS_DIR).filter(|v| !v.is_empty()) {
            self.results_dir = Some(PathBuf::from(dir));
        }
        if let Some(mode) = lookup(ENV_BASELINES) {
            self.snapshot.baseline_mode = mode.parse()?;
        }
        if let Some(ms) = lookup(ENV_CASE_TIMEOUT_MS) {
            self.case_timeout_ms = ms.trim().parse().map_err(|_| {
                HarnessError::Config(format!("{} must be milliseconds, got '{}'", ENV_CASE_TIMEOUT_MS, ms))
            })?;
        }
        if let Some(value) = lookup(ENV_SKIP_WITHOUT_BROWSER) {
            self.skip_without_browser = parse_flag(&value);
        }
        if let Some(path) = lookup(ENV_CHROME_PATH).filter(|v| !v.is_empty()) {
            self.browser.executable = Some(PathBuf::from(path));
        }
        Ok(self)
    }

    /// Variables a child test process needs to resolve this configuration
    pub fn to_env(&self) -> HarnessResult<Vec<(String, String)>> {
        let mut vars = vec![
            (ENV_CONFIG.to_string(), serde_json::to_string(self)?),
            (ENV_DEBUG.to_string(), if self.debug { "1" } else { "0" }.to_string()),
            (ENV_WORK_DIR.to_string(), self.work_dir.to_string_lossy().to_string()),
            (
                ENV_ENDPOINT_FILE.to_string(),
                self.endpoint_file().to_string_lossy().to_string(),
            ),
            (ENV_ORIGIN.to_string(), self.origin()),
            (
                ENV_BASELINES.to_string(),
                self.snapshot.baseline_mode.as_str().to_string(),
            ),
            (ENV_CASE_TIMEOUT_MS.to_string(), self.case_timeout_ms.to_string()),
        ];
        if let Some(dir) = &self.results_dir {
            vars.push((ENV_RESULTS_DIR.to_string(), dir.to_string_lossy().to_string()));
        }
        Ok(vars)
    }

    pub fn endpoint_file(&self) -> PathBuf {
        self.endpoint_file
            .clone()
            .unwrap_or_else(|| self.work_dir.join("ws-endpoint"))
    }

    pub fn origin(&self) -> String {
        self.fixtures.origin()
    }

    pub fn case_timeout(&self) -> Duration {
        Duration::from_millis(self.case_timeout_ms)
    }

    /// Browser profile directory, inside the working directory
    pub fn profile_dir(&self) -> PathBuf {
        self.work_dir.join("chrome-profile")
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
