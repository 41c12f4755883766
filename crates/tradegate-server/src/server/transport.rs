//! A single gRPC transport instance and its drain signalling.
//!
//! [`TransportServer`] is created bound and registered, serves at most once,
//! and is discarded after it stops. The service server replaces it wholesale
//! on restart instead of mutating it.
//!
//! ## States
//!
//! ```text
//! Bound --start--> Running --stop--> Stopping --drained--> Stopped
//!   \______________________stop_______________________________/
//! ```
//!
//! `stop` cancels the shutdown token: the accept loop closes, connections
//! receive GOAWAY and new calls are rejected. When the grace period expires
//! the force token is cancelled, in-flight calls return `CANCELLED` and the
//! serve task is aborted. Full termination is published through a
//! [`StopHandle`].

use crate::server::{
    credentials::ServerCredentials,
    net::is_private,
    pool::manager::WorkerPool,
    service::{controller::Controller, handler::ControlHandler},
};
use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Server, server::Router};
use tonic_health::server::HealthReporter;
use tradegate_core::{
    Error, Result,
    proto::{FILE_DESCRIPTOR_SET, control_service_server::ControlServiceServer},
};

/// Time given to cancelled calls to flush their status before the remaining
/// connections are torn down.
const FORCE_FLUSH: Duration = Duration::from_millis(250);

/// Lifecycle state of one transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Bound and registered, not yet accepting connections.
    Bound,
    /// Accepting connections.
    Running,
    /// Stop requested, in-flight calls are draining.
    Stopping,
    /// Fully drained.
    Stopped,
}

/// Security mode a transport was bound with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSecurity {
    /// Plaintext. `private` records whether the host only resolves to
    /// loopback or private-use addresses.
    Insecure { private: bool },
    /// TLS using the server credentials.
    Tls,
}

/// Admission control shared between a transport and its request handler.
#[derive(Clone)]
pub(crate) struct CallGate {
    pub(crate) shutdown: CancellationToken,
    pub(crate) force: CancellationToken,
    pub(crate) permits: Arc<Semaphore>,
}

impl CallGate {
    pub(crate) fn new(max_workers: usize) -> Self {
        Self {
            shutdown: CancellationToken::new(),
            force: CancellationToken::new(),
            permits: Arc::new(Semaphore::new(max_workers)),
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// One-shot latch set when a transport has fully terminated.
#[derive(Clone, Default)]
struct Termination {
    inner: Arc<TerminationInner>,
}

#[derive(Default)]
struct TerminationInner {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Termination {
    fn set(&self) {
        let mut done = self.inner.done.lock();
        if !*done {
            *done = true;
            self.inner.cond.notify_all();
        }
    }

    fn is_set(&self) -> bool {
        *self.inner.done.lock()
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut done = self.inner.done.lock();
        while !*done {
            match deadline {
                Some(deadline) => {
                    if self.inner.cond.wait_until(&mut done, deadline).timed_out() {
                        return *done;
                    }
                }
                None => self.inner.cond.wait(&mut done),
            }
        }
        true
    }
}

/// Sets the latch when dropped. Moved into the supervisor task so the latch
/// is also set when the runtime discards the task without polling it.
struct TerminationGuard(Termination);

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

/// Handle returned by `stop`, observing when the transport has drained.
#[derive(Clone)]
pub struct StopHandle {
    termination: Termination,
}

impl StopHandle {
    pub(crate) fn already_terminated() -> Self {
        let termination = Termination::default();
        termination.set();
        Self { termination }
    }

    /// Blocks until the transport has drained or `timeout` elapses. Returns
    /// whether termination was observed.
    ///
    /// Must not be called from an async context.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.termination.wait(timeout)
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.is_set()
    }
}

impl core::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StopHandle")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Everything needed to build one transport instance.
pub(crate) struct TransportSpec<'a> {
    pub(crate) generation: u64,
    pub(crate) host: &'a str,
    pub(crate) port: u16,
    pub(crate) address: &'a str,
    pub(crate) max_workers: usize,
    pub(crate) credentials: Option<&'a ServerCredentials>,
    pub(crate) controller: Arc<dyn Controller>,
    pub(crate) pool: &'a WorkerPool,
}

pub(crate) struct TransportServer {
    generation: u64,
    address: String,
    local_addr: SocketAddr,
    security: TransportSecurity,
    pool: WorkerPool,
    listener: Option<std::net::TcpListener>,
    router: Option<Router>,
    health: HealthReporter,
    gate: CallGate,
    termination: Termination,
    started: bool,
    stop_requested: bool,
}

impl TransportServer {
    /// Builds a transport, registers the handler and binds the listener.
    ///
    /// # Errors
    ///
    /// - [`Error::Tls`] if the credentials cannot be loaded.
    /// - [`Error::Transport`] if the reflection service cannot be built.
    /// - [`Error::Bind`] if the address cannot be bound.
    pub(crate) fn bind(spec: TransportSpec<'_>) -> Result<Self> {
        let gate = CallGate::new(spec.max_workers);
        let handler = ControlHandler::new(spec.controller, gate.clone(), spec.generation);

        let mut server = Server::builder();
        let security = match spec.credentials {
            Some(credentials) => {
                server = server
                    .tls_config(credentials.tls_config())
                    .map_err(|e| Error::Tls {
                        reason: e.to_string(),
                    })?;
                TransportSecurity::Tls
            }
            None => {
                let private = is_private(spec.host);
                if !private {
                    tracing::warn!(
                        "Adding insecure port {} to server, but the address is not private.",
                        spec.address
                    );
                }
                TransportSecurity::Insecure { private }
            }
        };

        let (health, health_service) = tonic_health::server::health_reporter();
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| Error::Transport {
                reason: format!("failed to build reflection service: {e}"),
            })?;

        let router = handler
            .register(&mut server)
            .add_service(health_service)
            .add_service(reflection);

        let bind_err = |e: std::io::Error| Error::Bind {
            address: spec.address.to_string(),
            reason: e.to_string(),
        };
        let listener = std::net::TcpListener::bind((spec.host, spec.port)).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        tracing::debug!(
            generation = spec.generation,
            address = spec.address,
            %local_addr,
            ?security,
            "Transport bound"
        );

        Ok(Self {
            generation: spec.generation,
            address: spec.address.to_string(),
            local_addr,
            security,
            pool: spec.pool.clone(),
            listener: Some(listener),
            router: Some(router),
            health,
            gate,
            termination: Termination::default(),
            started: false,
            stop_requested: false,
        })
    }

    pub(crate) fn state(&self) -> TransportState {
        if self.termination.is_set() {
            TransportState::Stopped
        } else if self.stop_requested {
            TransportState::Stopping
        } else if self.started {
            TransportState::Running
        } else {
            TransportState::Bound
        }
    }

    pub(crate) fn security(&self) -> TransportSecurity {
        self.security
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections. Starting a running transport is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the transport was stopped before it
    /// started or the worker pool has been shut down, and [`Error::Bind`] if
    /// the listener cannot be registered with the pool.
    pub(crate) fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        if self.pool.is_shutdown() {
            return Err(Error::Transport {
                reason: "worker pool has been shut down".to_string(),
            });
        }
        let (Some(listener), Some(router)) = (self.listener.take(), self.router.take()) else {
            return Err(Error::Transport {
                reason: format!("transport {} was stopped before it started", self.generation),
            });
        };

        let handle = self.pool.handle().clone();
        let listener = {
            let _enter = handle.enter();
            tokio::net::TcpListener::from_std(listener).map_err(|e| Error::Bind {
                address: self.address.clone(),
                reason: e.to_string(),
            })?
        };

        let incoming = TcpListenerStream::new(listener);
        let shutdown = self.gate.shutdown.clone();
        let mut serve = handle.spawn(async move {
            router
                .serve_with_incoming_shutdown(incoming, async move { shutdown.cancelled().await })
                .await
        });

        let force = self.gate.force.clone();
        let terminated = TerminationGuard(self.termination.clone());
        let generation = self.generation;
        handle.spawn(async move {
            let _terminated = terminated;
            let finished = tokio::select! {
                res = &mut serve => Some(res),
                () = force.cancelled() => None,
            };
            let outcome = match finished {
                Some(res) => res,
                None => match tokio::time::timeout(FORCE_FLUSH, &mut serve).await {
                    Ok(res) => res,
                    Err(_) => {
                        serve.abort();
                        serve.await
                    }
                },
            };

            match outcome {
                Ok(Ok(())) => tracing::debug!(generation, "Transport drained"),
                Ok(Err(e)) => tracing::error!(generation, "Transport failed: {e}"),
                Err(e) if e.is_cancelled() => {
                    tracing::debug!(generation, "Transport terminated after grace period");
                }
                Err(e) => tracing::error!(generation, "Transport task panicked: {e}"),
            }

            // Releases any pending grace timer.
            force.cancel();
        });

        let health = self.health.clone();
        handle.spawn(async move {
            health
                .set_serving::<ControlServiceServer<ControlHandler>>()
                .await;
        });

        self.started = true;
        Ok(())
    }

    /// Requests shutdown. In-flight calls may run for `grace` before they are
    /// cancelled; `None` cancels them immediately. Repeated calls may shorten
    /// the grace period but never extend it.
    pub(crate) fn stop(&mut self, grace: Option<Duration>) -> StopHandle {
        let first = !self.stop_requested;
        self.stop_requested = true;

        if !self.started {
            self.listener = None;
            self.router = None;
            self.gate.shutdown.cancel();
            self.gate.force.cancel();
            self.termination.set();
            return self.stop_handle();
        }

        // A shut down pool has already dropped the serve tasks, which sets
        // the latch through their guard.
        if self.termination.is_set() || self.pool.is_shutdown() {
            self.gate.shutdown.cancel();
            self.gate.force.cancel();
            return self.stop_handle();
        }

        if first {
            tracing::debug!(generation = self.generation, ?grace, "Stopping transport");
            self.gate.shutdown.cancel();
            let health = self.health.clone();
            self.pool.handle().spawn(async move {
                health
                    .set_not_serving::<ControlServiceServer<ControlHandler>>()
                    .await;
            });
        }

        match grace {
            None => self.gate.force.cancel(),
            Some(grace) => {
                let force = self.gate.force.clone();
                self.pool.handle().spawn(async move {
                    tokio::select! {
                        () = tokio::time::sleep(grace) => force.cancel(),
                        () = force.cancelled() => {}
                    }
                });
            }
        }

        self.stop_handle()
    }

    pub(crate) fn stop_handle(&self) -> StopHandle {
        StopHandle {
            termination: self.termination.clone(),
        }
    }

    pub(crate) fn wait_for_termination(&self, timeout: Option<Duration>) -> bool {
        self.termination.wait(timeout)
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        // An abandoned transport must not keep serving in the background.
        self.gate.shutdown.cancel();
        self.gate.force.cancel();
        if !self.started {
            self.termination.set();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_wait_times_out_until_set() {
        let termination = Termination::default();
        assert!(!termination.wait(Some(Duration::from_millis(20))));

        let setter = termination.clone();
        let waiter = std::thread::spawn(move || termination.wait(None));
        std::thread::sleep(Duration::from_millis(20));
        setter.set();

        assert!(waiter.join().unwrap());
        assert!(setter.wait(Some(Duration::ZERO)));
    }

    #[test]
    fn huge_timeouts_do_not_overflow() {
        let termination = Termination::default();
        termination.set();
        assert!(termination.wait(Some(Duration::MAX)));
    }

    #[test]
    fn handle_clones_share_one_termination() {
        let handle = StopHandle {
            termination: Termination::default(),
        };
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let handle = handle.clone();
                std::thread::spawn(move || handle.wait(Some(Duration::from_secs(5))))
            })
            .collect();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_terminated());
        handle.termination.set();

        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
        assert!(handle.is_terminated());
    }

    #[test]
    fn guard_sets_latch_when_dropped() {
        let termination = Termination::default();
        drop(TerminationGuard(termination.clone()));
        assert!(termination.is_set());
    }

    #[test]
    fn already_terminated_handle_never_blocks() {
        let handle = StopHandle::already_terminated();
        assert!(handle.is_terminated());
        assert!(handle.wait(None));
    }
}
