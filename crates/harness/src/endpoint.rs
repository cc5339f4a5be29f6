//! Endpoint record: the shared browser's DevTools address, persisted once by
//! global setup and read by every test environment.

use std::io::Write;
use std::path::Path;
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};

pub struct EndpointRecord;

impl EndpointRecord {
    /// Persist the endpoint. The content is written to a sibling temp file and
    /// renamed into place so readers never observe a partial address.
    pub fn write(path: &Path, endpoint: &str) -> HarnessResult<()> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(HarnessError::EndpointEmpty {
                path: path.to_path_buf(),
            });
        }

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(endpoint.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| e.error)?;

        debug!("Endpoint record written to {}", path.display());
        Ok(())
    }

    pub fn read(path: &Path) -> HarnessResult<String> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HarnessError::EndpointMissing {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let endpoint = content.trim();
        if endpoint.is_empty() {
            return Err(HarnessError::EndpointEmpty {
                path: path.to_path_buf(),
            });
        }
        Ok(endpoint.to_string())
    }

    pub fn remove(path: &Path) -> HarnessResult<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
