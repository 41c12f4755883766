//! Configuration sources for the service server.
//!
//! Two layers feed a [`ServiceServer`](crate::server::lifecycle::ServiceServer):
//!
//! - [`ConfigStore`] - a key/value lookup consulted by the builder for any
//!   setting the caller left unset. [`EnvConfig`] maps dotted keys onto
//!   environment variables (`tradegate.grpc.server.host` →
//!   `TRADEGATE_GRPC_SERVER_HOST`); maps implement the trait directly.
//! - [`CliArgs`] / [`ServerConfig`] - the binary's command line, parsed with
//!   `clap` and validated before any socket is opened.

use clap::Parser;
use core::str::FromStr;
use core::time::Duration;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tradegate_core::{
    Error, Result,
    types::{
        DEFAULT_HOST, DEFAULT_MAX_WORKERS, HOST_KEY, MAX_WORKERS_KEY, PORT_KEY, SERVER_HOST_KEY,
        SERVER_PORT_KEY,
    },
};

/// Read-only key/value configuration lookup.
pub trait ConfigStore {
    /// Returns the raw value for `key`, if set.
    fn get(&self, key: &str) -> Option<String>;
}

/// Configuration read from process environment variables.
///
/// A key is upper-cased and every `.` replaced with `_`. Empty variables are
/// treated as unset.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConfig;

impl EnvConfig {
    pub fn var_name(key: &str) -> String {
        key.replace('.', "_").to_ascii_uppercase()
    }
}

impl ConfigStore for EnvConfig {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(Self::var_name(key))
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

impl ConfigStore for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

impl ConfigStore for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned()
    }
}

impl<S: ConfigStore + ?Sized> ConfigStore for &S {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }
}

/// Parses the value stored under `key`.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] if the value is set but does not parse.
pub fn get_parsed<T>(store: &dyn ConfigStore, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match store.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| Error::InvalidConfig {
                key: key.to_string(),
                reason: format!("`{raw}`: {e}"),
            }),
    }
}

/// Resolves the host: explicit value, then [`SERVER_HOST_KEY`], then
/// [`HOST_KEY`], then [`DEFAULT_HOST`].
pub fn resolve_host(explicit: Option<String>, store: &dyn ConfigStore) -> String {
    explicit
        .or_else(|| store.get(SERVER_HOST_KEY))
        .or_else(|| store.get(HOST_KEY))
        .unwrap_or_else(|| DEFAULT_HOST.to_string())
}

/// Resolves the port: explicit value, then [`SERVER_PORT_KEY`], then
/// [`PORT_KEY`], then `0` (auto-allocate).
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] if a consulted key does not hold a port.
pub fn resolve_port(explicit: Option<u16>, store: &dyn ConfigStore) -> Result<u16> {
    if let Some(port) = explicit {
        return Ok(port);
    }
    if let Some(port) = get_parsed::<u16>(store, SERVER_PORT_KEY)? {
        return Ok(port);
    }
    Ok(get_parsed::<u16>(store, PORT_KEY)?.unwrap_or(0))
}

/// Resolves the worker bound: explicit value, then [`MAX_WORKERS_KEY`], then
/// [`DEFAULT_MAX_WORKERS`].
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] if the value does not parse or is zero.
pub fn resolve_max_workers(explicit: Option<usize>, store: &dyn ConfigStore) -> Result<usize> {
    let max_workers = match explicit {
        Some(n) => n,
        None => get_parsed::<usize>(store, MAX_WORKERS_KEY)?.unwrap_or(DEFAULT_MAX_WORKERS),
    };
    if max_workers == 0 {
        return Err(Error::InvalidConfig {
            key: MAX_WORKERS_KEY.to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(max_workers)
}

/// Command line of the `tradegate-server` binary.
///
/// Every setting is optional; unset values fall through to the
/// `tradegate.grpc.*` configuration keys read from the environment (and
/// `.env`), then to built-in defaults.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tradegate-server",
    version,
    about = "A gRPC server exposing a single domain controller"
)]
pub struct CliArgs {
    /// Host or interface to bind.
    ///
    /// Falls back to `TRADEGATE_GRPC_SERVER_HOST`, then `TRADEGATE_GRPC_HOST`,
    /// then `localhost`.
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port to bind, `0` picks a free port.
    ///
    /// Falls back to `TRADEGATE_GRPC_SERVER_PORT`, then `TRADEGATE_GRPC_PORT`,
    /// then `0`.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum number of controller calls executing in parallel.
    ///
    /// Falls back to `TRADEGATE_GRPC_SERVER_MAX_WORKERS`, then `8`.
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// PEM certificate chain. Enables TLS together with `--tls-key`.
    ///
    /// Environment variable: `TLS_CERT`
    #[arg(long, env = "TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching `--tls-cert`.
    ///
    /// Environment variable: `TLS_KEY`
    #[arg(long, env = "TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// PEM CA bundle used to require and verify client certificates.
    ///
    /// Environment variable: `TLS_CLIENT_CA`
    #[arg(long, env = "TLS_CLIENT_CA", requires = "tls_cert")]
    pub tls_client_ca: Option<PathBuf>,

    /// Seconds in-flight calls may keep running after a shutdown signal.
    ///
    /// Environment variable: `SHUTDOWN_GRACE_SECS`
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Upper bound, in seconds, on waiting for a previous transport to drain
    /// during a restart. `0` waits without bound.
    ///
    /// Environment variable: `DRAIN_TIMEOUT_SECS`
    #[arg(long, env = "DRAIN_TIMEOUT_SECS", default_value_t = 0)]
    pub drain_timeout_secs: u64,
}

/// TLS material locations for the binary.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub client_ca: Option<PathBuf>,
}

/// Validated binary configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_workers: Option<usize>,
    pub tls: Option<TlsPaths>,
    pub shutdown_grace: Duration,
    pub drain_timeout: Option<Duration>,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> core::result::Result<Self, Self::Error> {
        if args.max_workers == Some(0) {
            anyhow::bail!("--max-workers must be greater than 0");
        }

        if let Some(host) = &args.host {
            if host.trim().is_empty() {
                anyhow::bail!("--host must not be empty");
            }
        }

        let tls = match (args.tls_cert, args.tls_key) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert,
                key,
                client_ca: args.tls_client_ca,
            }),
            (None, None) => None,
            _ => anyhow::bail!("--tls-cert and --tls-key must be given together"),
        };

        let drain_timeout =
            (args.drain_timeout_secs > 0).then(|| Duration::from_secs(args.drain_timeout_secs));

        Ok(Self {
            host: args.host,
            port: args.port,
            max_workers: args.max_workers,
            tls,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            drain_timeout,
        })
    }
}
