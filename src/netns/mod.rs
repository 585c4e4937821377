//! Network namespace handles and scoped namespace switching.
//!
//! `setns(2)` changes the namespace of the calling thread only, so every
//! namespace-scoped block runs on its own scoped OS thread and the original
//! namespace is restored before that thread exits, on every path.

use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, error};

use crate::error::{CniError, Result};

/// Namespace of the calling thread
pub const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Open handle to a network namespace
#[derive(Debug)]
pub struct NetNs {
    file: File,
    path: PathBuf,
}

impl NetNs {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            CniError::Namespace(format!(
                "failed to open network namespace {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRawFd for NetNs {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Reads and changes the namespace association of the current thread
pub trait NamespaceSwitch {
    fn current(&self) -> Result<NetNs>;
    fn enter(&self, ns: &NetNs) -> Result<()>;
}

/// The kernel's per-thread namespace association
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadNamespace;

impl NamespaceSwitch for ThreadNamespace {
    fn current(&self) -> Result<NetNs> {
        NetNs::open(Path::new(THREAD_NETNS))
    }

    fn enter(&self, ns: &NetNs) -> Result<()> {
        setns(ns.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
            CniError::Namespace(format!(
                "failed to enter network namespace {}: {}",
                ns.path().display(),
                e
            ))
        })
    }
}

/// Switches back to the saved namespace when dropped
struct RestoreGuard<'a, S: NamespaceSwitch> {
    switch: &'a S,
    original: NetNs,
    armed: bool,
}

impl<S: NamespaceSwitch> RestoreGuard<'_, S> {
    fn restore(mut self) -> Result<()> {
        self.armed = false;
        self.switch.enter(&self.original)
    }
}

impl<S: NamespaceSwitch> Drop for RestoreGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.switch.enter(&self.original) {
                error!(error = %e, "failed to restore original network namespace");
            }
        }
    }
}

/// Run `f` inside `target` on the current thread using `switch`, restoring
/// the previous namespace afterwards, including when `f` fails or panics.
pub fn with_namespace_using<S, T, F>(switch: &S, target: &NetNs, f: F) -> Result<T>
where
    S: NamespaceSwitch,
    F: FnOnce() -> Result<T>,
{
    let original = switch.current()?;
    switch.enter(target)?;

    let guard = RestoreGuard {
        switch,
        original,
        armed: true,
    };

    let result = f();
    let restored = guard.restore();

    match (result, restored) {
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Ok(value), Ok(())) => Ok(value),
    }
}

/// Run `f` on a dedicated OS thread that is joined before returning.
pub fn on_dedicated_thread<T, F>(label: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send,
    T: Send,
{
    thread::scope(|scope| {
        scope
            .spawn(f)
            .join()
            .unwrap_or_else(|_| Err(CniError::Namespace(format!("worker in {} panicked", label))))
    })
}

/// Run `f` inside `target` on a dedicated OS thread.
pub fn with_namespace<T, F>(target: &NetNs, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send,
    T: Send,
{
    let label = target.path().display().to_string();
    debug!(netns = %label, "entering network namespace");

    on_dedicated_thread(&label, || {
        with_namespace_using(&ThreadNamespace, target, f)
    })
}
