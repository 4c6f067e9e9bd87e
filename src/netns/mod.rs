//! Network namespace handles and thread-scoped namespace entry.

use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use tracing::error;

use crate::error::{Error, Result};

// setns is per thread, the process-wide link may point elsewhere
const THREAD_NS: &str = "/proc/thread-self/ns/net";

#[derive(Debug, thiserror::Error)]
pub enum NsError {
    #[error("network namespace {0} does not exist")]
    PathNotExist(String),
    #[error("failed to open network namespace {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<NsError> for Error {
    fn from(e: NsError) -> Self {
        let path = match &e {
            NsError::PathNotExist(path) | NsError::Open { path, .. } => path.clone(),
        };
        Error::Netns {
            path,
            reason: e.to_string(),
        }
    }
}

/// An open network namespace.
pub trait NetNs {
    fn fd(&self) -> RawFd;
    fn path(&self) -> &str;
    /// Runs `f` with the calling thread inside this namespace, then switches
    /// back, whether `f` failed or not.
    fn run_in(&self, f: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

pub trait Namespaces {
    fn get_ns(&self, path: &str) -> std::result::Result<Arc<dyn NetNs>, NsError>;
    /// The namespace the calling thread is in.
    fn current(&self) -> std::result::Result<Arc<dyn NetNs>, NsError>;
}

/// Namespaces of the running host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostNamespaces;

impl Namespaces for HostNamespaces {
    fn get_ns(&self, path: &str) -> std::result::Result<Arc<dyn NetNs>, NsError> {
        Ok(Arc::new(NetNsHandle::open(path)?))
    }

    fn current(&self) -> std::result::Result<Arc<dyn NetNs>, NsError> {
        Ok(Arc::new(NetNsHandle::open(THREAD_NS)?))
    }
}

#[derive(Debug)]
pub struct NetNsHandle {
    file: File,
    path: String,
}

impl NetNsHandle {
    pub fn open(path: &str) -> std::result::Result<Self, NsError> {
        let file = File::open(path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => NsError::PathNotExist(path.to_string()),
            _ => NsError::Open {
                path: path.to_string(),
                source,
            },
        })?;
        Ok(Self {
            file,
            path: path.to_string(),
        })
    }

    fn enter(&self) -> Result<()> {
        setns(self.fd(), CloneFlags::CLONE_NEWNET).map_err(|e| Error::Netns {
            path: self.path.clone(),
            reason: format!("setns failed: {}", e),
        })
    }
}

impl NetNs for NetNsHandle {
    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn run_in(&self, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let origin = NetNsHandle::open(THREAD_NS)?;

        self.enter()?;
        let result = f();
        if let Err(e) = origin.enter() {
            error!(error = %e, "failed to switch back to the original network namespace");
            return Err(e);
        }
        result
    }
}
