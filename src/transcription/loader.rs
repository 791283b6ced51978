//! Single-flight lazy loader for an expensive shared resource.
//!
//! [`ResourceLoader::acquire`] constructs the resource at most once no matter how
//! many callers race on it. Construction runs on the blocking pool inside its own
//! task, so it completes even if every caller that was waiting on it goes away.
//! A failed construction is handed to every waiter of that attempt and then
//! forgotten; the next `acquire` starts a fresh attempt.
//!
//! The load timeout bounds how long a caller waits, not the construction. A
//! caller that gives up leaves the attempt in `Loading` until the factory
//! returns, so a second construction never overlaps the first.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Builds the shared resource. Called on a blocking thread.
pub trait ResourceFactory<R: ?Sized>: Send + Sync {
    /// Human-readable name used in logs and errors
    fn name(&self) -> &str;

    /// Construct the resource
    ///
    /// # Errors
    /// Returns error if the resource cannot be constructed (missing weights, bad device, ...)
    fn create(&self) -> anyhow::Result<Arc<R>>;
}

/// Failure to construct the shared resource
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// The factory returned an error
    #[error("failed to load {resource}: {cause:#}")]
    Failed {
        /// Resource name
        resource: String,
        /// Underlying error
        cause: Arc<anyhow::Error>,
    },

    /// The caller stopped waiting; the attempt itself keeps running
    #[error("loading {resource} timed out after {timeout:?}")]
    TimedOut {
        /// Resource name
        resource: String,
        /// Configured bound
        timeout: Duration,
    },

    /// The construction task panicked or was cancelled
    #[error("loading {resource} aborted: {reason}")]
    Aborted {
        /// Resource name
        resource: String,
        /// Join error description
        reason: String,
    },
}

/// Observable load state, reported without triggering a load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// No resource and no attempt in flight
    Unloaded,
    /// A construction attempt is in flight
    Loading,
    /// Resource is cached
    Loaded,
}

impl LoadStatus {
    /// Wire name reported by `/health`
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type LoadOutcome<R> = Result<Arc<R>, LoadError>;
type PendingLoad<R> = Shared<BoxFuture<'static, LoadOutcome<R>>>;

enum LoadState<R: ?Sized> {
    Unloaded,
    Loading(PendingLoad<R>),
    Loaded(Arc<R>),
}

struct Inner<R: ?Sized> {
    factory: Arc<dyn ResourceFactory<R>>,
    timeout: Duration,
    state: Mutex<LoadState<R>>,
}

/// Lazily constructs and caches one shared resource
///
/// Cloning is cheap; clones share the same cache.
pub struct ResourceLoader<R: ?Sized> {
    inner: Arc<Inner<R>>,
}

impl<R: ?Sized> Clone for ResourceLoader<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: ?Sized + Send + Sync + 'static> ResourceLoader<R> {
    /// Creates an unloaded loader; nothing is constructed until [`Self::acquire`]
    pub fn new(factory: Arc<dyn ResourceFactory<R>>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                timeout,
                state: Mutex::new(LoadState::Unloaded),
            }),
        }
    }

    /// Name of the managed resource
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.factory.name()
    }

    /// Current state; never starts a load
    #[must_use]
    pub fn status(&self) -> LoadStatus {
        match &*self.inner.lock_state() {
            LoadState::Unloaded => LoadStatus::Unloaded,
            LoadState::Loading(_) => LoadStatus::Loading,
            LoadState::Loaded(_) => LoadStatus::Loaded,
        }
    }

    /// Returns the shared resource, constructing it on first use
    ///
    /// Concurrent callers share one construction attempt and observe the same
    /// resource or the same error.
    ///
    /// # Errors
    /// Returns [`LoadError`] if the attempt this call joined failed or panicked,
    /// or if it did not finish within the load timeout
    pub async fn acquire(&self) -> Result<Arc<R>, LoadError> {
        let pending = {
            let mut state = self.inner.lock_state();
            match &*state {
                LoadState::Loaded(resource) => return Ok(Arc::clone(resource)),
                LoadState::Loading(pending) => {
                    tracing::debug!(resource = self.name(), "waiting on in-flight load");
                    pending.clone()
                }
                LoadState::Unloaded => {
                    let pending = Self::start_load(Arc::clone(&self.inner));
                    *state = LoadState::Loading(pending.clone());
                    pending
                }
            }
        };

        tokio::time::timeout(self.inner.timeout, pending)
            .await
            .unwrap_or_else(|_| {
                tracing::warn!(
                    resource = self.name(),
                    "gave up waiting on load, construction continues"
                );
                Err(LoadError::TimedOut {
                    resource: self.name().to_owned(),
                    timeout: self.inner.timeout,
                })
            })
    }

    /// Construct the resource ahead of the first request
    ///
    /// # Errors
    /// Returns [`LoadError`] if construction fails
    pub async fn preload(&self) -> Result<(), LoadError> {
        let started = Instant::now();
        self.acquire().await?;
        tracing::info!(
            resource = self.name(),
            load_ms = started.elapsed().as_millis(),
            "preloaded"
        );
        Ok(())
    }

    fn start_load(inner: Arc<Inner<R>>) -> PendingLoad<R> {
        let resource = inner.factory.name().to_owned();
        let task = tokio::spawn(inner.load());

        async move {
            task.await.unwrap_or_else(|e| {
                Err(LoadError::Aborted {
                    resource,
                    reason: e.to_string(),
                })
            })
        }
        .boxed()
        .shared()
    }
}

impl<R: ?Sized + Send + Sync + 'static> Inner<R> {
    fn lock_state(&self) -> MutexGuard<'_, LoadState<R>> {
        // State transitions are single assignments, a poisoned guard is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn load(self: Arc<Self>) -> LoadOutcome<R> {
        let resource = self.factory.name().to_owned();
        let start = Instant::now();
        tracing::info!(resource = %resource, "loading resource");

        let factory = Arc::clone(&self.factory);
        let construction = tokio::task::spawn_blocking(move || factory.create());

        // Blocking work cannot be interrupted, so the slot stays `Loading` until it returns
        let outcome = match construction.await {
            Ok(Ok(loaded)) => Ok(loaded),
            Ok(Err(cause)) => Err(LoadError::Failed {
                resource: resource.clone(),
                cause: Arc::new(cause),
            }),
            Err(join_error) => Err(LoadError::Aborted {
                resource: resource.clone(),
                reason: join_error.to_string(),
            }),
        };

        // Only the task that owns the `Loading` state leaves it
        *self.lock_state() = match &outcome {
            Ok(loaded) => LoadState::Loaded(Arc::clone(loaded)),
            Err(_) => LoadState::Unloaded,
        };

        match &outcome {
            Ok(_) => tracing::info!(
                resource = %resource,
                load_ms = start.elapsed().as_millis(),
                "resource loaded"
            ),
            Err(e) => tracing::error!(
                resource = %resource,
                load_ms = start.elapsed().as_millis(),
                "{e}"
            ),
        }

        outcome
    }
}
