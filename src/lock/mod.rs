//! Host-wide lock serializing uplink VLAN changes across plugin processes.

use nix::fcntl::{flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub trait IpcLock {
    /// Blocks until the lock is held.
    fn lock(&self) -> Result<()>;
    /// Releases the lock. Unlocking a lock that is not held is a no-op.
    fn unlock(&self) -> Result<()>;
}

/// Exclusive advisory `flock` on a file.
pub struct FileLock {
    path: PathBuf,
    held: Mutex<Option<File>>,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn err(&self, op: &'static str) -> impl FnOnce(std::io::Error) -> Error + '_ {
        move |source| Error::Lock {
            op,
            path: self.path.clone(),
            source,
        }
    }
}

impl IpcLock for FileLock {
    fn lock(&self) -> Result<()> {
        let mut held = self.held.lock().map_err(|_| Error::Lock {
            op: "acquire",
            path: self.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "lock state poisoned"),
        })?;
        if held.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(self.err("create directory for"))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(self.err("open"))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive)
            .map_err(|errno| std::io::Error::from(errno))
            .map_err(self.err("acquire"))?;

        debug!(path = %self.path.display(), "lock acquired");
        *held = Some(file);
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        let mut held = self.held.lock().map_err(|_| Error::Lock {
            op: "release",
            path: self.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "lock state poisoned"),
        })?;
        let Some(file) = held.take() else {
            return Ok(());
        };
        flock(file.as_raw_fd(), FlockArg::Unlock)
            .map_err(|errno| std::io::Error::from(errno))
            .map_err(self.err("release"))?;
        debug!(path = %self.path.display(), "lock released");
        Ok(())
    }
}

/// Holds an [`IpcLock`] until dropped.
pub struct LockGuard<'a> {
    lock: &'a dyn IpcLock,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(lock: &'a dyn IpcLock) -> Result<Self> {
        lock.lock()?;
        Ok(Self { lock })
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            warn!(error = %e, "failed to release uplink lock");
        }
    }
}
