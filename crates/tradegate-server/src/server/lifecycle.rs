//! Restartable gRPC server around a single controller.
//!
//! [`ServiceServer`] owns the resolved address, the worker pool and the
//! current [`TransportServer`]. A transport serves at most once, so a
//! restart replaces it with a fresh instance bound to the same address on the
//! same pool.
//!
//! ## Lifecycle
//!
//! ```text
//! build ──► reinitialize ──► start ──► stop ──► start (reinitializes) ──► ...
//!                                          └──► shutdown / drop (pool released once)
//! ```
//!
//! All lifecycle operations take `&mut self` and block the calling thread.
//! They must not be called from inside an async runtime; the server drives
//! its own runtime through the [`WorkerPool`].

use crate::server::{
    config::{ConfigStore, EnvConfig, resolve_host, resolve_max_workers, resolve_port},
    credentials::ServerCredentials,
    net::find_free_port,
    pool::manager::WorkerPool,
    service::controller::Controller,
    telemetry::increment_transport_generations,
    transport::{
        StopHandle, TransportSecurity, TransportServer, TransportSpec, TransportState,
    },
};
use core::time::Duration;
use std::net::SocketAddr;
use std::sync::Arc;
use tradegate_core::{Error, Result, types::AUTO_PORT};

/// Window used by [`ServiceServer::is_running`] unless configured otherwise.
pub const DEFAULT_PROBE_WINDOW: Duration = Duration::from_secs(1);

/// How long a restart or teardown waits for the previous transport to drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Wait until the previous transport has terminated.
    #[default]
    Unbounded,
    /// Wait at most `timeout`, then escalate.
    Bounded {
        timeout: Duration,
        on_timeout: DrainEscalation,
    },
}

/// What to do when a bounded drain times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainEscalation {
    /// Return [`Error::DrainTimeout`] and keep the previous transport.
    Fail,
    /// Log the timeout, detach the previous transport and continue.
    Abandon,
}

/// Formats `host:port`, bracketing IPv6 literals.
pub fn format_address(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Builder for [`ServiceServer`].
///
/// Every setting left unset is resolved from the configuration store
/// (the environment unless [`ServiceServerBuilder::config`] is used).
pub struct ServiceServerBuilder {
    controller: Arc<dyn Controller>,
    host: Option<String>,
    port: Option<u16>,
    max_workers: Option<usize>,
    credentials: Option<ServerCredentials>,
    worker_pool: Option<WorkerPool>,
    config: Option<Box<dyn ConfigStore>>,
    probe_window: Duration,
    drain_policy: DrainPolicy,
}

impl ServiceServerBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Port to bind. `0` picks a free port once, at build time.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    /// Serves over TLS instead of plaintext.
    pub fn credentials(mut self, credentials: ServerCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Runs on a caller-owned pool. The server never shuts it down.
    pub fn worker_pool(mut self, pool: WorkerPool) -> Self {
        self.worker_pool = Some(pool);
        self
    }

    /// Store consulted for settings not given explicitly.
    pub fn config(mut self, store: impl ConfigStore + 'static) -> Self {
        self.config = Some(Box::new(store));
        self
    }

    pub fn probe_window(mut self, window: Duration) -> Self {
        self.probe_window = window;
        self
    }

    pub fn drain_policy(mut self, policy: DrainPolicy) -> Self {
        self.drain_policy = policy;
        self
    }

    /// Resolves addressing, prepares the worker pool and binds the first
    /// transport.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] for unparseable or zero-valued settings, a
    ///   supplied pool that was already shut down, or a `max_workers` that
    ///   differs from the supplied pool's bound.
    /// - [`Error::Bind`] if the address cannot be bound.
    /// - [`Error::Tls`] if the credentials are rejected.
    pub fn build(self) -> Result<ServiceServer> {
        let store: &dyn ConfigStore = match &self.config {
            Some(store) => store.as_ref(),
            None => &EnvConfig,
        };

        let host = resolve_host(self.host, store);
        if host.trim().is_empty() {
            return Err(Error::InvalidConfig {
                key: "host".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let mut port = resolve_port(self.port, store)?;
        if port == AUTO_PORT {
            port = find_free_port(&host)?;
            tracing::info!(
                "Using one of the free ports, final address would be {}",
                format_address(&host, port)
            );
        }
        let address = format_address(&host, port);

        // A supplied pool fixes the worker bound.
        let max_workers = match &self.worker_pool {
            Some(pool) => match self.max_workers {
                Some(requested) if requested != pool.max_workers() => {
                    return Err(Error::InvalidConfig {
                        key: "max_workers".to_string(),
                        reason: format!(
                            "{requested} does not match the supplied pool's {} workers",
                            pool.max_workers()
                        ),
                    });
                }
                _ => pool.max_workers(),
            },
            None => resolve_max_workers(self.max_workers, store)?,
        };

        let (pool, release) = match self.worker_pool {
            Some(pool) if pool.is_shutdown() => {
                return Err(Error::InvalidConfig {
                    key: "worker_pool".to_string(),
                    reason: "pool has already been shut down".to_string(),
                });
            }
            Some(pool) => (pool, None),
            None => {
                let pool = WorkerPool::new(max_workers)?;
                (pool.clone(), Some(pool))
            }
        };

        let mut server = ServiceServer {
            controller: self.controller,
            owns_pool: release.is_some(),
            host,
            port,
            address,
            max_workers,
            credentials: self.credentials,
            pool,
            release,
            transport: None,
            generation: 0,
            started: false,
            stopped: false,
            torn_down: false,
            probe_window: self.probe_window,
            drain_policy: self.drain_policy,
        };
        server.reinitialize()?;

        tracing::debug!(
            address = %server.address,
            max_workers,
            owns_pool = server.owns_pool,
            "Service server created"
        );
        Ok(server)
    }
}

/// A gRPC server exposing one [`Controller`] that can be stopped and
/// restarted on the same address.
///
/// An owned worker pool is released exactly once: by
/// [`ServiceServer::shutdown`], or on drop if no explicit teardown happened.
///
/// ```no_run
/// use std::time::Duration;
/// use tradegate_server::server::{lifecycle::ServiceServer, service::controller::EchoController};
///
/// let mut server = ServiceServer::builder(EchoController::new())
///     .host("127.0.0.1")
///     .build()?;
/// server.start()?;
/// println!("listening on {}", server.address());
///
/// server.stop(Some(Duration::from_secs(5))).wait(None);
/// server.shutdown(None)?;
/// # Ok::<(), tradegate_core::Error>(())
/// ```
pub struct ServiceServer {
    controller: Arc<dyn Controller>,
    host: String,
    port: u16,
    address: String,
    max_workers: usize,
    credentials: Option<ServerCredentials>,
    pool: WorkerPool,
    /// Owned pool awaiting release; taken exactly once.
    release: Option<WorkerPool>,
    owns_pool: bool,
    transport: Option<TransportServer>,
    generation: u64,
    started: bool,
    stopped: bool,
    torn_down: bool,
    probe_window: Duration,
    drain_policy: DrainPolicy,
}

impl ServiceServer {
    pub fn builder(controller: impl Controller) -> ServiceServerBuilder {
        ServiceServerBuilder {
            controller: Arc::new(controller),
            host: None,
            port: None,
            max_workers: None,
            credentials: None,
            worker_pool: None,
            config: None,
            probe_window: DEFAULT_PROBE_WINDOW,
            drain_policy: DrainPolicy::default(),
        }
    }

    /// Replaces the current transport with a fresh one bound to the same
    /// address.
    ///
    /// The previous transport is stopped without grace and drained according
    /// to the drain policy before the new one is bound.
    ///
    /// # Errors
    ///
    /// - [`Error::TornDown`] after [`ServiceServer::shutdown`].
    /// - [`Error::DrainTimeout`] if a bounded drain fails; the previous
    ///   transport is kept.
    /// - [`Error::Bind`] / [`Error::Tls`] if the new transport cannot be
    ///   bound.
    pub fn reinitialize(&mut self) -> Result<()> {
        self.ensure_alive()?;

        if let Some(mut previous) = self.transport.take() {
            previous.stop(None);
            self.stopped = true;
            if let Err(e) = self.drain(&previous) {
                self.transport = Some(previous);
                return Err(e);
            }
        }

        let generation = self.generation + 1;
        let transport = TransportServer::bind(TransportSpec {
            generation,
            host: &self.host,
            port: self.port,
            address: &self.address,
            max_workers: self.max_workers,
            credentials: self.credentials.as_ref(),
            controller: Arc::clone(&self.controller),
            pool: &self.pool,
        })?;
        increment_transport_generations();

        self.transport = Some(transport);
        self.generation = generation;
        self.started = false;
        self.stopped = false;
        Ok(())
    }

    /// Starts serving. A stopped server is reinitialized first; starting a
    /// running server does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TornDown`] after teardown, any error of
    /// [`ServiceServer::reinitialize`], and [`Error::Transport`] if the worker
    /// pool is no longer usable.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_alive()?;

        if self.stopped || self.transport.is_none() {
            self.reinitialize()?;
        }
        if self.started {
            return Ok(());
        }

        if let Some(transport) = self.transport.as_mut() {
            transport.start()?;
        }
        self.started = true;
        tracing::info!(
            generation = self.generation,
            "Server listening on {}",
            self.address
        );
        Ok(())
    }

    /// Stops accepting calls. In-flight calls may run for `grace` before
    /// they are cancelled; `None` cancels them immediately.
    ///
    /// Stopping a stopped server returns a handle to the same termination.
    /// After teardown the returned handle is already terminated.
    pub fn stop(&mut self, grace: Option<Duration>) -> StopHandle {
        match self.transport.as_mut() {
            Some(transport) => {
                if !self.stopped {
                    tracing::info!(
                        generation = self.generation,
                        ?grace,
                        "Stopping server on {}",
                        self.address
                    );
                }
                self.stopped = true;
                transport.stop(grace)
            }
            None => StopHandle::already_terminated(),
        }
    }

    /// Blocks until the current transport has drained or `timeout` elapses.
    /// Returns whether termination was observed.
    pub fn wait_for_termination(&self, timeout: Option<Duration>) -> bool {
        self.transport
            .as_ref()
            .is_none_or(|t| t.wait_for_termination(timeout))
    }

    /// Liveness probe: `true` unless the current transport terminates within
    /// the probe window.
    ///
    /// A bound transport that was never started also reports `true`.
    pub fn is_running(&self) -> bool {
        !self.wait_for_termination(Some(self.probe_window))
    }

    /// Tears the server down: stops the transport, waits for it to drain per
    /// the drain policy and shuts down an owned worker pool, waiting for its
    /// threads. Idempotent.
    ///
    /// The pool is released even if the drain fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DrainTimeout`] if a bounded drain with
    /// [`DrainEscalation::Fail`] timed out.
    pub fn shutdown(&mut self, grace: Option<Duration>) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        let drained = match self.transport.take() {
            Some(mut transport) => {
                transport.stop(grace);
                self.stopped = true;
                self.drain(&transport)
            }
            None => Ok(()),
        };

        if let Some(pool) = self.release.take() {
            pool.shutdown(true);
        }
        tracing::info!("Server on {} torn down", self.address);
        drained
    }

    fn drain(&self, transport: &TransportServer) -> Result<()> {
        match self.drain_policy {
            DrainPolicy::Unbounded => {
                transport.wait_for_termination(None);
                Ok(())
            }
            DrainPolicy::Bounded {
                timeout,
                on_timeout,
            } => {
                if transport.wait_for_termination(Some(timeout)) {
                    return Ok(());
                }
                match on_timeout {
                    DrainEscalation::Fail => {
                        tracing::warn!(
                            "Transport on {} did not drain within {:?}",
                            self.address,
                            timeout
                        );
                        Err(Error::DrainTimeout {
                            address: self.address.clone(),
                            timeout_ms: timeout.as_millis(),
                        })
                    }
                    DrainEscalation::Abandon => {
                        tracing::error!(
                            "Transport on {} did not drain within {:?}, abandoning it",
                            self.address,
                            timeout
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.torn_down {
            return Err(Error::TornDown);
        }
        Ok(())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` as resolved at construction. Never changes.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// State of the current transport. `Stopped` after teardown.
    pub fn state(&self) -> TransportState {
        self.transport
            .as_ref()
            .map_or(TransportState::Stopped, TransportServer::state)
    }

    /// Number of transports created so far, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn transport_security(&self) -> Option<TransportSecurity> {
        self.transport.as_ref().map(TransportServer::security)
    }

    /// Socket address the current transport is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(TransportServer::local_addr)
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn owns_worker_pool(&self) -> bool {
        self.owns_pool
    }

    pub fn probe_window(&self) -> Duration {
        self.probe_window
    }

    pub fn drain_policy(&self) -> DrainPolicy {
        self.drain_policy
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}

impl Drop for ServiceServer {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.stop(None);
        }
        if let Some(pool) = self.release.take() {
            tracing::debug!("Releasing worker pool of {} on drop", self.address);
            pool.shutdown(false);
        }
    }
}

impl core::fmt::Debug for ServiceServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServiceServer")
            .field("address", &self.address)
            .field("max_workers", &self.max_workers)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .field("owns_pool", &self.owns_pool)
            .field("torn_down", &self.torn_down)
            .finish()
    }
}
