//! Advisory build marker.
//!
//! A builder creates `modules.idx.lock` with `create_new` and removes it when
//! done. The file records the owner's pid and start time so that a lock left
//! behind by a crashed builder can be reclaimed instead of blocking every
//! future build. Reclaim and release only delete the file if it still holds
//! the bytes the caller last saw, so a newer builder's lock is never removed.

use crate::error::IndexError;
use crate::index::types::LOCK_FILE_NAME;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    /// Seconds since the epoch
    created_at: u64,
}

/// Held for the duration of a build; released on drop
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
    /// Exact bytes written at acquire, used to recognise our own lock
    body: Vec<u8>,
}

impl BuildLock {
    /// Take the lock for `dir`, reclaiming it first if its owner is gone or
    /// it is older than `timeout`. Fails with [`IndexError::Building`] while
    /// another live builder holds it.
    pub fn acquire(dir: &Path, timeout: Duration) -> Result<Self, IndexError> {
        let path = dir.join(LOCK_FILE_NAME);

        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        created_at: now_secs(),
                    };
                    let body = serde_json::to_vec(&info).map_err(io::Error::other)?;
                    file.write_all(&body)?;
                    file.flush()?;
                    debug!(lock = %path.display(), "acquired build lock");
                    return Ok(Self { path, body });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt == 0 {
                        if let Some(stale) = abandoned_snapshot(&path, timeout) {
                            warn!(lock = %path.display(), "reclaiming abandoned build lock");
                            if remove_if_unchanged(&path, &stale)? {
                                continue;
                            }
                        }
                    }
                    return Err(IndexError::Building(dir.to_path_buf()));
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(IndexError::Building(dir.to_path_buf()))
    }

    /// Whether a live builder currently holds the lock for `dir`
    pub fn is_held(dir: &Path, timeout: Duration) -> bool {
        let path = dir.join(LOCK_FILE_NAME);
        path.exists() && abandoned_snapshot(&path, timeout).is_none()
    }

    /// Remove the lock for `dir` only if its owner is gone or it has expired.
    /// Returns whether an abandoned lock was cleared.
    pub fn remove_abandoned(dir: &Path, timeout: Duration) -> io::Result<bool> {
        let path = dir.join(LOCK_FILE_NAME);
        match abandoned_snapshot(&path, timeout) {
            Some(stale) => remove_if_unchanged(&path, &stale),
            None => Ok(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        match remove_if_unchanged(&self.path, &self.body) {
            Ok(true) => debug!(lock = %self.path.display(), "released build lock"),
            Ok(false) => {
                warn!(lock = %self.path.display(), "build lock was taken over by another builder; leaving it")
            }
            Err(err) => {
                warn!(lock = %self.path.display(), error = %err, "failed to release build lock")
            }
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The lock's current bytes when it is abandoned, `None` when it is live or absent.
fn abandoned_snapshot(path: &Path, timeout: Duration) -> Option<Vec<u8>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(_) => Vec::new(),
    };

    let abandoned = match serde_json::from_slice::<LockInfo>(&bytes) {
        Ok(info) => {
            let age = now_secs().saturating_sub(info.created_at);
            age > timeout.as_secs() || !process_alive(info.pid)
        }
        // Unreadable or still being written: judge by the file's age alone.
        Err(_) => fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > timeout),
    };
    abandoned.then_some(bytes)
}

/// Remove the lock at `path` if it still holds `expected`.
///
/// The file is first renamed aside so that only one caller can take it, then
/// checked. A lock that was replaced in the meantime is put back. Returns
/// `false` when a different lock occupies the path afterwards.
fn remove_if_unchanged(path: &Path, expected: &[u8]) -> io::Result<bool> {
    let aside = path.with_file_name(format!(
        "{LOCK_FILE_NAME}.stale-{}-{}",
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ));

    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(err),
    }

    if fs::read(&aside).unwrap_or_default() == expected {
        fs::remove_file(&aside)?;
        return Ok(true);
    }

    // hard_link will not clobber a lock created after the rename.
    match fs::hard_link(&aside, path) {
        Err(err) if err.kind() != io::ErrorKind::AlreadyExists => fs::rename(&aside, path)?,
        _ => fs::remove_file(&aside)?,
    }
    Ok(false)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks for existence; EPERM means it exists under another user.
    unsafe {
        libc::kill(pid, 0) == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
