//! Bounded worker pool backing every transport instance.
//!
//! [`WorkerPool`] owns a dedicated multi-threaded Tokio runtime. The gRPC
//! accept loop and connection tasks run on its worker threads, and controller
//! calls are handed to its blocking threads. Both are capped at
//! `max_workers`, which bounds how many controller calls run in parallel.
//!
//! The pool outlives individual transport instances: a server that is stopped
//! and restarted keeps submitting to the same pool. Shutdown is idempotent at
//! this level; ownership rules (who may call it) live in the service server.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::runtime::{Builder, Handle, Runtime};
use tradegate_core::{Error, Result};

/// Cheaply clonable handle to a shared worker runtime.
///
/// Clones refer to the same runtime; shutting down one clone shuts down all
/// of them.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    max_workers: usize,
    shut_down: AtomicBool,
    shutdown_calls: AtomicUsize,
}

impl WorkerPool {
    /// Creates a pool with `max_workers` worker and blocking threads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `max_workers` is zero and
    /// [`Error::Transport`] if the runtime cannot be created.
    pub fn new(max_workers: usize) -> Result<Self> {
        if max_workers == 0 {
            return Err(Error::InvalidConfig {
                key: "max_workers".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(max_workers)
            .max_blocking_threads(max_workers)
            .thread_name("tradegate-worker")
            .enable_all()
            .build()
            .map_err(|e| Error::Transport {
                reason: format!("failed to build worker runtime: {e}"),
            })?;

        tracing::debug!(max_workers, "Worker pool created");

        Ok(Self {
            inner: Arc::new(PoolInner {
                handle: runtime.handle().clone(),
                runtime: Mutex::new(Some(runtime)),
                max_workers,
                shut_down: AtomicBool::new(false),
                shutdown_calls: AtomicUsize::new(0),
            }),
        })
    }

    /// Number of execution units in this pool.
    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Handle used to submit work onto the pool.
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Shuts the pool down.
    ///
    /// With `wait_for_completion` the call blocks until the worker threads
    /// have exited; otherwise they are released in the background. Returns
    /// `true` if this call performed the shutdown and `false` if the pool was
    /// already shut down.
    ///
    /// Blocking is not allowed on an async thread, so a waiting shutdown
    /// requested from inside a runtime falls back to a background shutdown.
    pub fn shutdown(&self, wait_for_completion: bool) -> bool {
        self.inner.shutdown_calls.fetch_add(1, Ordering::AcqRel);

        let Some(runtime) = self.inner.runtime.lock().take() else {
            return false;
        };
        self.inner.shut_down.store(true, Ordering::Release);

        if wait_for_completion && Handle::try_current().is_err() {
            tracing::debug!("Shutting down worker pool and waiting for workers");
            // Dropping joins the worker and blocking threads.
            drop(runtime);
        } else {
            if wait_for_completion {
                tracing::warn!(
                    "Worker pool shutdown requested from an async context, releasing in background"
                );
            }
            runtime.shutdown_background();
        }

        tracing::info!(max_workers = self.inner.max_workers, "Worker pool shut down");
        true
    }

    /// Number of times [`WorkerPool::shutdown`] has been invoked, including
    /// calls that found the pool already shut down.
    #[cfg(test)]
    pub(crate) fn shutdown_calls(&self) -> usize {
        self.inner.shutdown_calls.load(Ordering::Acquire)
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Last handle gone without an explicit shutdown. Never block here:
        // the final clone may be dropped on an async thread.
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.inner.max_workers)
            .field("shut_down", &self.is_shutdown())
            .finish()
    }
}
