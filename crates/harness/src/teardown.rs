//! Global teardown

use std::path::Path;
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::endpoint::EndpointRecord;
use crate::error::HarnessResult;
use crate::launcher::SharedSession;

/// Reclaim the shared browser, the fixture server and the working directory.
///
/// In debug mode the browser is left running and nothing is deleted. Running
/// it again, or without a session, only repeats the directory cleanup.
pub async fn global_teardown(
    config: &HarnessConfig,
    session: Option<SharedSession>,
) -> HarnessResult<()> {
    if config.debug {
        if let Some(session) = session {
            let endpoint = session.endpoint().to_string();
            let pid = session.detach().await;
            info!(
                "Debug mode: leaving browser running (pid: {:?}) at {}",
                pid, endpoint
            );
        }
        info!(
            "Debug mode: keeping working directory {}",
            config.work_dir.display()
        );
        return Ok(());
    }

    if let Some(session) = session {
        session.close().await;
    }

    EndpointRecord::remove(&config.endpoint_file())?;
    remove_work_dir(&config.work_dir).await
}

async fn remove_work_dir(dir: &Path) -> HarnessResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            info!("Removed working directory {}", dir.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!("Failed to remove working directory {}: {}", dir.display(), e);
            Err(e.into())
        }
    }
}
