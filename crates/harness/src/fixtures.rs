//! Static fixture server

use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::FixtureConfig;
use crate::error::{HarnessError, HarnessResult};

/// Handle to the in-process fixture server
pub struct FixtureServer {
    addr: SocketAddr,
    root: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl FixtureServer {
    /// Bind the configured address and start serving the fixture root
    pub async fn start(config: &FixtureConfig) -> HarnessResult<Self> {
        if !config.root.is_dir() {
            return Err(HarnessError::FixtureServer(format!(
                "fixture root is not a directory: {}",
                config.root.display()
            )));
        }

        let bind = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| HarnessError::FixtureServer(format!("cannot bind {}: {}", bind, e)))?;
        let addr = listener.local_addr()?;

        let router = Router::new()
            .fallback_service(ServeDir::new(&config.root).append_index_html_on_directories(true))
            .layer(TraceLayer::new_for_http());

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            if let Err(e) = result {
                error!("Fixture server error: {}", e);
            }
        });

        info!(
            "Serving fixtures from {} at http://{}",
            config.root.display(),
            addr
        );

        Ok(Self {
            addr,
            root: config.root.clone(),
            shutdown: Some(tx),
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Base URL fixtures are resolved against
    pub fn origin(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop serving. Safe to call more than once.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            info!("Stopping fixture server at {}", self.addr);
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FixtureServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_for(root: &std::path::Path) -> FixtureConfig {
        FixtureConfig {
            root: root.to_path_buf(),
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_serves_fixture_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("specs")).unwrap();
        std::fs::write(dir.path().join("specs/breaks.html"), "<p>hello</p>").unwrap();

        let mut server = FixtureServer::start(&config_for(dir.path())).await.unwrap();
        let body = reqwest::get(format!("{}/specs/breaks.html", server.origin()))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "<p>hello</p>");

        let missing = reqwest::get(format!("{}/specs/nope.html", server.origin()))
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        server.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_origin_unreachable_once_stopped() {
        let dir = TempDir::new().unwrap();
        let mut server = FixtureServer::start(&config_for(dir.path())).await.unwrap();
        let origin = server.origin();

        server.stop().await;

        let err = reqwest::get(format!("{}/", origin)).await.unwrap_err();
        assert!(err.is_connect());
    }

    #[tokio::test]
    async fn test_missing_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = FixtureServer::start(&config_for(&dir.path().join("absent")))
            .await
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }
}
