//! Single-poller lock file.
//!
//! The file holds the UTC time it was taken. Its presence blocks another
//! poller from starting until it is removed, either by the owning
//! [`PollLock`] being dropped or by a forced acquire.

use chrono::Utc;
use log::{info, warn};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Error)]
pub enum LockError {
    /// Another poller holds the lock.
    #[error(
        "found a lock file {} from {held_since}; another poller may be running (use --force to clear it)",
        .path.display()
    )]
    Conflict { path: PathBuf, held_since: String },
    #[error("lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Holder timestamp from an existing lock file; unreadable contents are reported, not fatal.
fn read_holder(path: &Path) -> String {
    match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
        Err(e) => format!("<unreadable: {}>", e),
    }
}

#[derive(Debug)]
pub struct PollLock {
    path: PathBuf,
}

impl PollLock {
    /// Take the lock, removing a stale one first when `force` is set.
    pub fn acquire(path: impl AsRef<Path>, force: bool) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        if path.exists() {
            let held_since = read_holder(&path);
            if !force {
                return Err(LockError::Conflict {
                    path: path.clone(),
                    held_since,
                });
            }
            warn!("Removing stale lock {} from {}", path.display(), held_since);
            fs::remove_file(&path).map_err(io_err)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let held_since = read_holder(&path);
                return Err(LockError::Conflict {
                    path: path.clone(),
                    held_since,
                });
            }
            Err(e) => return Err(io_err(e)),
        };
        file.write_all(Utc::now().format(TIMESTAMP_FORMAT).to_string().as_bytes())
            .map_err(io_err)?;
        info!("Obtained lock at {}", path.display());
        Ok(PollLock { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PollLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("Removed lock {}", self.path.display()),
            Err(e) => warn!("Failed to remove lock {}: {}", self.path.display(), e),
        }
    }
}
