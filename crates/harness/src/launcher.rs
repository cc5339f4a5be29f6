//! Global setup: one browser and one fixture server for the whole run

use tracing::{info, warn};

use crate::browser::BrowserProcess;
use crate::config::HarnessConfig;
use crate::endpoint::EndpointRecord;
use crate::error::HarnessResult;
use crate::fixtures::FixtureServer;

/// The run-wide resources created by [`GlobalSetup::run`]. Only the launcher
/// creates one and only the global teardown consumes it.
pub struct SharedSession {
    config: HarnessConfig,
    child_env: Vec<(String, String)>,
    browser: BrowserProcess,
    server: FixtureServer,
}

impl SharedSession {
    /// Websocket address of the shared browser
    pub fn endpoint(&self) -> &str {
        self.browser.endpoint()
    }

    /// Origin of the running fixture server
    pub fn origin(&self) -> String {
        self.server.origin()
    }

    /// Configuration with the actual origin filled in
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn browser_pid(&self) -> Option<u32> {
        self.browser.pid()
    }

    /// Environment for test processes that attach to this session
    pub fn child_env(&self) -> &[(String, String)] {
        &self.child_env
    }

    /// Stop the browser and the fixture server
    pub async fn close(mut self) {
        self.browser.stop().await;
        self.server.stop().await;
    }

    /// Stop the fixture server but leave the browser process running. The
    /// server lives in this process and cannot outlive it.
    pub async fn detach(mut self) -> Option<u32> {
        info!("Stopping fixture server at {}", self.server.origin());
        self.server.stop().await;
        self.browser.detach()
    }
}

pub struct GlobalSetup;

impl GlobalSetup {
    /// Create the working directory, start the fixture server, launch the
    /// browser and persist its endpoint. Anything started before a failure is
    /// shut down again; the error is fatal for the run.
    pub async fn run(config: &HarnessConfig) -> HarnessResult<SharedSession> {
        std::fs::create_dir_all(&config.work_dir)?;

        let mut server = FixtureServer::start(&config.fixtures).await?;

        let mut resolved = config.clone();
        resolved.fixtures.origin = Some(server.origin());
        let child_env = match resolved.to_env() {
            Ok(vars) => vars,
            Err(e) => {
                server.stop().await;
                return Err(e);
            }
        };

        let browser = match BrowserProcess::launch(&config.browser, &config.profile_dir()).await {
            Ok(browser) => browser,
            Err(e) => {
                server.stop().await;
                return Err(e);
            }
        };

        let endpoint_file = config.endpoint_file();
        if endpoint_file.exists() {
            warn!(
                "Replacing stale endpoint record at {}",
                endpoint_file.display()
            );
        }
        if let Err(e) = EndpointRecord::write(&endpoint_file, browser.endpoint()) {
            drop(browser);
            server.stop().await;
            return Err(e);
        }

        info!("Shared browser ready at {}", browser.endpoint());
        info!("Endpoint record: {}", endpoint_file.display());

        Ok(SharedSession {
            config: resolved,
            child_env,
            browser,
            server,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_browser_launch_failure_aborts_setup() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("fixtures")).unwrap();

        let mut config = HarnessConfig::default();
        config.work_dir = dir.path().join("work");
        config.fixtures.root = dir.path().join("fixtures");
        config.fixtures.port = 0;
        config.browser.executable = Some(PathBuf::from("/nonexistent/bin/chrome"));

        let err = GlobalSetup::run(&config).await.err().unwrap();
        assert!(matches!(err, HarnessError::BrowserLaunch(_)));
        assert!(err.is_fatal());
        assert!(!config.endpoint_file().exists());
    }
}
