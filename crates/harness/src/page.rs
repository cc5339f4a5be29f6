//! Fixture pages: navigation, evaluation and PDF export on the shared browser

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, PrintToPdfParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::config::PageConfig;
use crate::error::{HarnessError, HarnessResult};

/// PDF bytes produced by printing a paginated page
#[derive(Clone, PartialEq, Eq)]
pub struct RenderedArtifact(Vec<u8>);

impl RenderedArtifact {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl AsRef<[u8]> for RenderedArtifact {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for RenderedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RenderedArtifact({} bytes)", self.0.len())
    }
}

/// Page margins in inches
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PdfMargins {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

/// Print options forwarded verbatim to the browser's PDF export
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PdfOptions {
    pub print_background: Option<bool>,
    pub margin: Option<PdfMargins>,
    /// e.g. `"1-3, 5"`
    pub page_ranges: Option<String>,
    pub landscape: Option<bool>,
    pub prefer_css_page_size: Option<bool>,
    pub scale: Option<f64>,
}

impl PdfOptions {
    /// Backgrounds on, no margins, page size taken from `@page` rules
    pub fn paged() -> Self {
        Self {
            print_background: Some(true),
            margin: Some(PdfMargins::default()),
            prefer_css_page_size: Some(true),
            ..Default::default()
        }
    }

    pub fn to_params(&self) -> PrintToPdfParams {
        let mut builder = PrintToPdfParams::builder();
        if let Some(print_background) = self.print_background {
            builder = builder.print_background(print_background);
        }
        if let Some(margin) = self.margin {
            builder = builder
                .margin_top(margin.top)
                .margin_right(margin.right)
                .margin_bottom(margin.bottom)
                .margin_left(margin.left);
        }
        if let Some(ranges) = &self.page_ranges {
            builder = builder.page_ranges(ranges.clone());
        }
        if let Some(landscape) = self.landscape {
            builder = builder.landscape(landscape);
        }
        if let Some(prefer) = self.prefer_css_page_size {
            builder = builder.prefer_css_page_size(prefer);
        }
        if let Some(scale) = self.scale {
            builder = builder.scale(scale);
        }
        builder.build()
    }
}

/// A tab on the shared browser, bound to the fixture origin
pub struct FixturePage {
    page: Page,
    origin: String,
    config: PageConfig,
    debug: bool,
}

impl FixturePage {
    pub(crate) fn new(page: Page, origin: String, config: PageConfig, debug: bool) -> Self {
        Self {
            page,
            origin,
            config,
            debug,
        }
    }

    /// Install the completion hook so it runs before any script of the next
    /// document
    pub(crate) async fn install_init_script(&self) -> HarnessResult<()> {
        if self.config.init_script.trim().is_empty() {
            return Ok(());
        }
        self.page
            .evaluate_on_new_document(AddScriptToEvaluateOnNewDocumentParams::new(
                self.config.init_script.clone(),
            ))
            .await?;
        Ok(())
    }

    /// The underlying CDP page, for assertions the helpers do not cover
    pub fn inner(&self) -> &Page {
        &self.page
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Navigate to a fixture path and wait until pagination has finished
    pub async fn goto(&self, path: &str) -> HarnessResult<()> {
        let url = resolve_fixture_url(&self.origin, path)?;
        let timeout = self.config.navigation_timeout();
        debug!("Loading fixture {}", url);

        let load = async {
            self.page.goto(url.as_str()).await?;
            self.evaluate::<serde_json::Value>(&self.config.ready_expression)
                .await?;
            Ok::<(), HarnessError>(())
        };

        match tokio::time::timeout(timeout, load).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HarnessError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(timeout_error(format!("loading {}", url), timeout)),
        }
    }

    /// Evaluate an expression, awaiting it if it is a promise
    pub async fn evaluate<T: DeserializeOwned>(&self, expression: &str) -> HarnessResult<T> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(HarnessError::Browser)?;

        let result = self.page.evaluate_expression(params).await?;
        Ok(result.into_value()?)
    }

    /// Number of rendered pages in the DOM
    pub async fn page_count(&self) -> HarnessResult<u32> {
        let selector = serde_json::to_string(&self.config.page_selector)?;
        self.evaluate(&format!("document.querySelectorAll({}).length", selector))
            .await
    }

    /// Print the current document
    pub async fn pdf(&self, options: &PdfOptions) -> HarnessResult<RenderedArtifact> {
        let bytes = self.page.pdf(options.to_params()).await?;
        debug!("Printed {} bytes of PDF", bytes.len());
        Ok(RenderedArtifact::new(bytes))
    }

    /// Close the tab. In debug mode the tab is left open for inspection.
    pub async fn close(self) -> HarnessResult<()> {
        if self.debug {
            info!("Debug mode: leaving page open");
            return Ok(());
        }
        self.page.close().await?;
        Ok(())
    }
}

/// A browser tab the harness can close once a case is over
#[async_trait]
pub trait Tab: Send + Sync {
    async fn close_tab(&self) -> HarnessResult<()>;
}

#[async_trait]
impl Tab for Page {
    async fn close_tab(&self) -> HarnessResult<()> {
        self.clone().close().await?;
        Ok(())
    }
}

/// Tabs opened on behalf of one case
#[derive(Default)]
pub struct OpenPages {
    tabs: Mutex<Vec<Box<dyn Tab>>>,
}

impl OpenPages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, tab: Box<dyn Tab>) {
        if let Ok(mut tabs) = self.tabs.lock() {
            tabs.push(tab);
        }
    }

    pub fn len(&self) -> usize {
        self.tabs.lock().map(|tabs| tabs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every tracked tab. Tabs the case already closed fail quietly.
    pub async fn close_all(&self) -> usize {
        let tabs = match self.tabs.lock() {
            Ok(mut tabs) => std::mem::take(&mut *tabs),
            Err(_) => return 0,
        };

        let mut closed = 0;
        for tab in tabs {
            match tab.close_tab().await {
                Ok(()) => closed += 1,
                Err(e) => debug!("Tab already gone: {}", e),
            }
        }
        closed
    }
}

/// Resolve a fixture path (or absolute URL) against the origin
pub fn resolve_fixture_url(origin: &str, path: &str) -> HarnessResult<Url> {
    let base = Url::parse(&format!("{}/", origin.trim_end_matches('/')))
        .map_err(|e| HarnessError::Config(format!("invalid fixture origin '{}': {}", origin, e)))?;
    base.join(path.trim_start_matches('/'))
        .map_err(|e| HarnessError::Config(format!("invalid fixture path '{}': {}", path, e)))
}

fn timeout_error(what: String, timeout: Duration) -> HarnessError {
    HarnessError::Timeout {
        what,
        seconds: timeout.as_secs_f64(),
    }
}
