//! Single-writer lock for index builds and imports.
//!
//! An advisory exclusive lock (`flock`/`LockFileEx` via `fs2`) on
//! `<db>.lock`. The lock belongs to the open file, so it is released when
//! [`IndexLock`] drops or the process dies. The holder's pid and start time
//! are written into the file for diagnostics.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use fs2::FileExt;
use tracing::{debug, warn};

use threadline_core::error::IndexError;

/// An acquired build lock. Released automatically on drop.
#[derive(Debug)]
pub struct IndexLock {
    file: File,
    path: PathBuf,
}

impl IndexLock {
    /// Take the lock without waiting.
    ///
    /// Fails with [`IndexError::BuildInProgress`] when another writer holds it.
    pub fn try_acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                file.set_len(0)?;
                file.seek(SeekFrom::Start(0))?;
                writeln!(
                    file,
                    "pid={} started_at={}",
                    std::process::id(),
                    chrono::Utc::now().to_rfc3339()
                )?;
                debug!(path = %path.display(), "acquired index lock");
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if is_contended(&e) => {
                let mut holder = String::new();
                let _ = file.read_to_string(&mut holder);
                warn!(path = %path.display(), holder = holder.trim(), "index lock is held");
                Err(IndexError::BuildInProgress {
                    path: path.display().to_string(),
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release index lock");
        } else {
            debug!(path = %self.path.display(), "released index lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_writer_is_refused() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.sqlite.lock");

        let first = IndexLock::try_acquire(&path).unwrap();
        let err = IndexLock::try_acquire(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::BuildInProgress { .. })
        ));
        assert_eq!(first.path(), path.as_path());
    }

    #[test]
    fn test_release_allows_reacquire() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.sqlite.lock");

        drop(IndexLock::try_acquire(&path).unwrap());
        let again = IndexLock::try_acquire(&path).unwrap();
        let content = std::fs::read_to_string(again.path()).unwrap();
        assert!(content.starts_with(&format!("pid={}", std::process::id())));
    }
}
