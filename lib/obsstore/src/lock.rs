/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use fs2::FileExt;

/// RAII advisory lock on a filesystem path.
///
/// The lock file is created on demand. Dropping the handle releases the
/// lock.
#[derive(Debug)]
pub struct PathLock {
    file: File,
}

impl PathLock {
    /// Take an exclusive lock on `path`, blocking until it is free.
    pub fn exclusive<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = open_lockfile(path.as_ref())?;
        file.lock_exclusive()?;
        Ok(PathLock { file })
    }

    /// Take a shared lock on `path`, blocking until no exclusive lock
    /// is held.
    pub fn shared<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = open_lockfile(path.as_ref())?;
        file.lock_shared()?;
        Ok(PathLock { file })
    }

    pub fn unlock(&self) -> io::Result<()> {
        self.file.unlock()
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if let Err(err) = self.unlock() {
            tracing::error!("unlock error: {}", err);
        }
    }
}

fn open_lockfile(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_blocks_second_try() -> io::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("lock");

        let first = PathLock::exclusive(&path)?;
        // A second exclusive lock through an independent handle must
        // not be grantable while the first is held.
        let second = open_lockfile(&path)?;
        assert!(second.try_lock_exclusive().is_err());

        drop(first);
        assert!(second.try_lock_exclusive().is_ok());
        Ok(())
    }

    #[test]
    fn test_shared_locks_coexist() -> io::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("lock");

        let _a = PathLock::shared(&path)?;
        let _b = PathLock::shared(&path)?;
        Ok(())
    }
}
