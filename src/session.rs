//! Process-wide lifecycle of native Bluetooth libraries
//!
//! Native stacks are typically backed by a library that must be loaded once per process and released before the
//! process exits. A [`Session`] holds that resource: it is created lazily on first use and released exactly once by
//! [`Session::teardown`], either called directly or through the guard returned by [`Session::teardown_guard`].
//!
//! ```rust,no_run
//!# use webble::session::{Release, Session};
//!# struct Library;
//!# impl Library { async fn load() -> webble::Result<Self> { Ok(Library) } }
//!# impl Release for Library { fn release(&self) {} }
//!static LIBRARY: Session<Library> = Session::new();
//!
//!# async fn run() -> webble::Result<()> {
//!let _teardown = LIBRARY.teardown_guard();
//!let library = LIBRARY.get_or_init(Library::load).await?;
//!# Ok(())
//!# }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::OnceCell;
use tracing::info;

use crate::error::ErrorKind;
use crate::{Error, Result};

/// A native resource that must be released explicitly.
pub trait Release {
    /// Releases the resource. Called at most once per [`Session`].
    fn release(&self);
}

/// A lazily initialized, process-wide native resource.
pub struct Session<T> {
    cell: OnceCell<Arc<T>>,
    released: AtomicBool,
}

impl<T> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("initialized", &self.cell.is_initialized())
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

impl<T> Default for Session<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Session<T> {
    /// Creates an empty session.
    pub const fn new() -> Self {
        Session {
            cell: OnceCell::new(),
            released: AtomicBool::new(false),
        }
    }

    /// The resource, if it has been initialized and not released.
    pub fn get(&self) -> Option<Arc<T>> {
        if self.released.load(Ordering::Acquire) {
            return None;
        }
        self.cell.get().cloned()
    }

    /// Returns the resource, running `init` first if this is the first use.
    ///
    /// Concurrent callers wait for a single initialization. Fails once the session has been torn down.
    pub async fn get_or_init<F, Fut>(&self, init: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::new(
                ErrorKind::AdapterUnavailable,
                None,
                "native library has been released",
            ));
        }

        let resource = self
            .cell
            .get_or_try_init(|| async {
                let resource = init().await?;
                info!("native library loaded");
                Ok::<_, Error>(Arc::new(resource))
            })
            .await?;
        Ok(resource.clone())
    }
}

impl<T: Release> Session<T> {
    /// Releases the resource if it was initialized. Later calls do nothing.
    pub fn teardown(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(resource) = self.cell.get() {
            resource.release();
            info!("native library released");
        }
    }

    /// A guard running [`teardown`][Self::teardown] when dropped, meant to live for the whole of `main`.
    pub fn teardown_guard(&self) -> TeardownGuard<'_, T> {
        TeardownGuard(self)
    }
}

/// Tears a [`Session`] down when dropped.
#[must_use = "the session is torn down as soon as the guard is dropped"]
#[derive(Debug)]
pub struct TeardownGuard<'a, T: Release>(&'a Session<T>);

impl<T: Release> Drop for TeardownGuard<'_, T> {
    fn drop(&mut self) {
        self.0.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Debug, Default)]
    struct Library {
        releases: AtomicUsize,
    }

    impl Release for Library {
        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn initializes_once_and_releases_once() {
        let session = Session::<Library>::new();
        let loads = AtomicUsize::new(0);

        let first = session
            .get_or_init(|| async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(Library::default())
            })
            .await
            .unwrap();
        let second = session
            .get_or_init(|| async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(Library::default())
            })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        {
            let _guard = session.teardown_guard();
        }
        session.teardown();
        assert_eq!(first.releases.load(Ordering::SeqCst), 1);
        assert!(session.get().is_none());

        let err = session.get_or_init(|| async { Ok(Library::default()) }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdapterUnavailable);
    }

    #[tokio::test]
    async fn failed_initialization_can_be_retried() {
        let session = Session::<Library>::new();
        let err = session
            .get_or_init(|| async { Err(ErrorKind::AdapterUnavailable.into()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdapterUnavailable);

        assert!(session.get_or_init(|| async { Ok(Library::default()) }).await.is_ok());
    }
}
