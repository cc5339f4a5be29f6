//! Per-test-file runner
//!
//! Each browser test file is a `harness = false` test binary whose `main`
//! builds a [`TestFile`] and calls [`TestFile::run`]:
//!
//! ```ignore
//! use pagination_harness::{test_file, PdfOptions};
//!
//! fn main() -> std::process::ExitCode {
//!     test_file!()
//!         .case("renders five pages", |ctx| async move {
//!             let page = ctx.open("specs/five-pages.html").await?;
//!             let pdf = page.pdf(&PdfOptions::paged()).await?;
//!             ctx.match_pdf(&pdf, 1).await?;
//!             page.close().await
//!         })
//!         .run()
//! }
//! ```
//!
//! The environment is set up once per file, cases run one after another
//! under a timeout, tabs a case opened are closed when it ends, and the
//! environment is torn down before the process exits. Files run as separate processes, so they run concurrently against
//! the same shared browser.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::environment::{BrowserEnvironment, TestEnvironment};
use crate::error::{HarnessError, HarnessResult};
use crate::matcher::SnapshotMatcher;
use crate::page::{FixturePage, OpenPages, RenderedArtifact};
use crate::rasterize::{PopplerRasterizer, Rasterizer};
use crate::report::{write_file_result, CaseResult, FileResult};
use crate::snapshot::VisualDiff;

type CaseFn = Box<dyn Fn(Arc<CaseContext>) -> BoxFuture<'static, HarnessResult<()>> + Send + Sync>;

struct Case {
    name: String,
    timeout: Option<Duration>,
    run: CaseFn,
}

/// What a running case can reach: the file's environment and a matcher
/// scoped to the case. Tabs opened through it are closed when the case ends.
pub struct CaseContext {
    name: String,
    env: Arc<BrowserEnvironment>,
    matcher: SnapshotMatcher,
    pages: Arc<OpenPages>,
}

impl CaseContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &BrowserEnvironment {
        &self.env
    }

    pub fn matcher(&self) -> &SnapshotMatcher {
        &self.matcher
    }

    pub fn origin(&self) -> &str {
        self.env.origin()
    }

    pub fn debug(&self) -> bool {
        self.env.debug()
    }

    /// Open a blank tab owned by this case
    pub async fn new_page(&self) -> HarnessResult<FixturePage> {
        let page = self.env.new_page().await?;
        self.pages.track(Box::new(page.inner().clone()));
        Ok(page)
    }

    /// Open a fixture and wait for pagination
    pub async fn open(&self, path: &str) -> HarnessResult<FixturePage> {
        let page = self.new_page().await?;
        page.goto(path).await?;
        Ok(page)
    }

    /// Snapshot-compare one page of a rendered PDF
    pub async fn match_pdf(
        &self,
        pdf: &RenderedArtifact,
        page: impl Into<Option<u32>>,
    ) -> HarnessResult<VisualDiff> {
        self.matcher.match_pdf(pdf, page.into()).await
    }
}

/// The cases of one test file
pub struct TestFile {
    path: PathBuf,
    cases: Vec<Case>,
    timeout: Option<Duration>,
    rasterizer: Option<Arc<dyn Rasterizer>>,
}

impl TestFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cases: Vec::new(),
            timeout: None,
            rasterizer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn case<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Arc<CaseContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HarnessResult<()>> + Send + 'static,
    {
        self.cases.push(Case {
            name: name.to_string(),
            timeout: None,
            run: Box::new(move |ctx| f(ctx).boxed()),
        });
        self
    }

    /// Timeout for the most recently added case
    pub fn timeout(mut self, timeout: Duration) -> Self {
        match self.cases.last_mut() {
            Some(case) => case.timeout = Some(timeout),
            None => self.timeout = Some(timeout),
        }
        self
    }

    pub fn rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    /// Run every case with the configuration from the environment. See
    /// [`TestFile::run_configured`] for exit codes.
    pub fn run(self) -> ExitCode {
        let config = match HarnessConfig::from_env() {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::from(2);
            }
        };
        crate::init_tracing(config.debug);
        self.run_configured(&config)
    }

    /// Run every case and exit with 0 (all passed), 1 (a case failed or the
    /// shared browser could not be reached) or 2 (global setup never ran).
    ///
    /// With `skip_without_browser` set and no endpoint record, the file is
    /// skipped instead.
    pub fn run_configured(self, config: &HarnessConfig) -> ExitCode {
        if config.skip_without_browser && !config.endpoint_file().exists() {
            warn!(
                "Skipping {}: no shared browser (run through `pagination-harness run`)",
                self.path.display()
            );
            return ExitCode::SUCCESS;
        }

        let runtime = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Failed to create tokio runtime: {}", e);
                return ExitCode::from(2);
            }
        };

        let result = runtime.block_on(self.run_with(config));

        if let Some(dir) = &config.results_dir {
            if let Err(e) = write_file_result(dir, &result) {
                warn!("Failed to write results: {}", e);
            }
        }

        exit_code(&result)
    }

    /// Set up the environment, run the cases, tear the environment down
    pub async fn run_with(self, config: &HarnessConfig) -> FileResult {
        let started_at = chrono::Utc::now();
        let start = Instant::now();
        let file = self.path.display().to_string();

        let env = match BrowserEnvironment::setup(config).await {
            Ok(env) => Arc::new(env),
            Err(e) => {
                error!("Environment setup failed for {}: {}", file, e);
                return FileResult {
                    file,
                    started_at,
                    duration_ms: start.elapsed().as_millis() as u64,
                    setup_error: Some(e.to_string()),
                    setup_fatal: e.is_fatal(),
                    cases: Vec::new(),
                };
            }
        };

        let rasterizer = self
            .rasterizer
            .clone()
            .unwrap_or_else(|| Arc::new(PopplerRasterizer::new(&config.snapshot)));
        let default_timeout = self.timeout.unwrap_or_else(|| config.case_timeout());

        info!("Running {} case(s) from {}", self.cases.len(), file);

        let mut cases = Vec::with_capacity(self.cases.len());
        for case in &self.cases {
            let ctx = Arc::new(CaseContext {
                name: case.name.clone(),
                env: Arc::clone(&env),
                matcher: SnapshotMatcher::new(config, &self.path, &case.name, Arc::clone(&rasterizer)),
                pages: Arc::new(OpenPages::new()),
            });
            let result = run_case(case, ctx, case.timeout.unwrap_or(default_timeout)).await;
            if result.success {
                info!("✓ {} ({} ms)", result.name, result.duration_ms);
            } else {
                error!(
                    "✗ {} - {}",
                    result.name,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            cases.push(result);
        }

        match Arc::try_unwrap(env) {
            Ok(env) => {
                if let Err(e) = env.teardown().await {
                    warn!("Environment teardown failed: {}", e);
                }
            }
            Err(_) => warn!("Environment still in use after the last case; dropping it"),
        }

        let result = FileResult {
            file,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            setup_error: None,
            setup_fatal: false,
            cases,
        };
        info!(
            "{}: {} passed, {} failed ({} ms)",
            result.file,
            result.passed(),
            result.failed(),
            result.duration_ms
        );
        result
    }
}

async fn run_case(case: &Case, ctx: Arc<CaseContext>, timeout: Duration) -> CaseResult {
    let start = Instant::now();
    let error = settle_case(
        &case.name,
        (case.run)(Arc::clone(&ctx)),
        timeout,
        &ctx.pages,
        ctx.debug(),
    )
    .await;

    CaseResult {
        name: case.name.clone(),
        success: error.is_none(),
        duration_ms: start.elapsed().as_millis() as u64,
        snapshots: ctx.matcher.records(),
        error,
    }
}

/// Drive a case body until it returns, panics or times out, then close the
/// tabs it opened unless they are kept for inspection
async fn settle_case(
    name: &str,
    body: BoxFuture<'static, HarnessResult<()>>,
    timeout: Duration,
    pages: &OpenPages,
    keep_pages: bool,
) -> Option<String> {
    let mut handle = tokio::spawn(body);

    let error = match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(()))) => None,
        Ok(Ok(Err(e))) => Some(e.to_string()),
        Ok(Err(join)) if join.is_panic() => Some(panic_message(join.into_panic())),
        Ok(Err(join)) => Some(join.to_string()),
        Err(_) => {
            handle.abort();
            let _ = handle.await;
            Some(
                HarnessError::Timeout {
                    what: format!("case '{}'", name),
                    seconds: timeout.as_secs_f64(),
                }
                .to_string(),
            )
        }
    };

    if keep_pages {
        if !pages.is_empty() {
            info!("Debug mode: leaving {} page(s) of '{}' open", pages.len(), name);
        }
    } else {
        let closed = pages.close_all().await;
        if closed > 0 {
            debug!("Closed {} page(s) left open by '{}'", closed, name);
        }
    }

    error
}

/// 2 when global setup never ran, 1 for any other failure
fn exit_code(result: &FileResult) -> ExitCode {
    if result.setup_error.is_some() && result.setup_fatal {
        ExitCode::from(2)
    } else if result.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "case panicked".to_string()
    };
    HarnessError::CaseFailed(message).to_string()
}

/// Locate a test source file from `env!("CARGO_MANIFEST_DIR")` and `file!()`.
/// `file!()` may be relative to the package or to the workspace root.
pub fn resolve_test_path(manifest_dir: &str, file: &str) -> PathBuf {
    let file = Path::new(file);
    if file.is_absolute() {
        return file.to_path_buf();
    }
    Path::new(manifest_dir)
        .ancestors()
        .map(|dir| dir.join(file))
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| Path::new(manifest_dir).join(file))
}

/// A [`TestFile`] for the calling source file
#[macro_export]
macro_rules! test_file {
    () => {
        $crate::suite::TestFile::new($crate::suite::resolve_test_path(
            env!("CARGO_MANIFEST_DIR"),
            file!(),
        ))
    };
}
