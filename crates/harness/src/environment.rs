//! Per test file environment attached to the shared browser

use async_trait::async_trait;
use chromiumoxide::Browser;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::endpoint::EndpointRecord;
use crate::error::{HarnessError, HarnessResult};
use crate::page::FixturePage;

/// Values every test in a file can read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvContext {
    pub endpoint: String,
    pub origin: String,
    pub debug: bool,
}

/// Lifecycle of a test file's environment: `setup` attaches, `teardown`
/// releases the connection. An environment never owns the resources it
/// attaches to.
#[async_trait]
pub trait TestEnvironment: Sized + Send + Sync {
    async fn setup(config: &HarnessConfig) -> HarnessResult<Self>;

    fn context(&self) -> &EnvContext;

    async fn teardown(self) -> HarnessResult<()>;
}

/// Connection to the shared browser for one test file
pub struct BrowserEnvironment {
    context: EnvContext,
    config: HarnessConfig,
    browser: Browser,
    handler: JoinHandle<()>,
}

impl BrowserEnvironment {
    /// The shared browser. Only a shared reference is handed out so tests
    /// cannot close it.
    pub fn browser(&self) -> &Browser {
        &self.browser
    }

    pub fn origin(&self) -> &str {
        &self.context.origin
    }

    pub fn debug(&self) -> bool {
        self.context.debug
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Open a blank tab with the completion hook installed for the next
    /// navigation
    pub async fn new_page(&self) -> HarnessResult<FixturePage> {
        let page = self.browser.new_page("about:blank").await?;
        let page = FixturePage::new(
            page,
            self.context.origin.clone(),
            self.config.page.clone(),
            self.context.debug,
        );
        if let Err(e) = page.install_init_script().await {
            let _ = page.inner().clone().close().await;
            return Err(e);
        }
        Ok(page)
    }

    /// Open a tab on a fixture and wait for pagination to finish
    pub async fn open_fixture(&self, path: &str) -> HarnessResult<FixturePage> {
        let page = self.new_page().await?;
        page.goto(path).await?;
        Ok(page)
    }
}

#[async_trait]
impl TestEnvironment for BrowserEnvironment {
    async fn setup(config: &HarnessConfig) -> HarnessResult<Self> {
        let endpoint = EndpointRecord::read(&config.endpoint_file())?;

        let (browser, mut handler) =
            Browser::connect(endpoint.clone())
                .await
                .map_err(|e| HarnessError::Attach {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler: {}", e);
                }
            }
        });

        info!("Attached to shared browser at {}", endpoint);

        Ok(Self {
            context: EnvContext {
                endpoint,
                origin: config.origin(),
                debug: config.debug,
            },
            config: config.clone(),
            browser,
            handler,
        })
    }

    fn context(&self) -> &EnvContext {
        &self.context
    }

    /// Drop the connection. The browser keeps running for other files.
    async fn teardown(self) -> HarnessResult<()> {
        let Self {
            context,
            browser,
            handler,
            ..
        } = self;

        drop(browser);
        handler.abort();
        let _ = handler.await;

        debug!("Detached from {}", context.endpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &std::path::Path) -> HarnessConfig {
        HarnessConfig {
            work_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_setup_without_record_is_setup_error() {
        let dir = TempDir::new().unwrap();
        let err = BrowserEnvironment::setup(&config_in(dir.path()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::EndpointMissing { .. }));
        assert!(err.is_setup_error());
    }

    #[tokio::test]
    async fn test_setup_with_blank_record_is_setup_error() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        std::fs::write(config.endpoint_file(), "  \n").unwrap();

        let err = BrowserEnvironment::setup(&config).await.err().unwrap();
        assert!(matches!(err, HarnessError::EndpointEmpty { .. }));
    }

    #[tokio::test]
    async fn test_dead_endpoint_is_attach_error() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let endpoint = format!("ws://127.0.0.1:{}/devtools/browser/gone", port);
        EndpointRecord::write(&config.endpoint_file(), &endpoint).unwrap();

        let err = BrowserEnvironment::setup(&config).await.err().unwrap();
        match err {
            HarnessError::Attach { endpoint: e, .. } => assert_eq!(e, endpoint),
            other => panic!("expected attach error, got {}", other),
        }
    }
}
