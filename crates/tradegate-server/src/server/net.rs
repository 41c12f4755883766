//! Address reachability and port selection helpers.
//!
//! - [`is_private`] decides whether a host only resolves to loopback or
//!   private-use addresses. It drives the warning emitted when a plaintext
//!   transport is bound to an address reachable from other networks.
//! - [`find_free_port`] asks the OS for an unused TCP port on an interface.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, TcpListener, ToSocketAddrs};
use tradegate_core::{Error, Result};

/// Returns `true` iff `host` resolves to at least one address and every
/// resolved address is loopback or private-use.
///
/// Hosts that fail to resolve are reported as not private. The unspecified
/// address (`0.0.0.0`, `::`) listens on every interface and is not private.
pub fn is_private(host: &str) -> bool {
    let Ok(addrs) = (host, 0).to_socket_addrs() else {
        tracing::debug!(host, "Host did not resolve, treating it as public");
        return false;
    };

    let mut resolved = false;
    for addr in addrs {
        resolved = true;
        if !is_private_ip(addr.ip()) {
            return false;
        }
    }
    resolved
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => is_private_ipv4(ip),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(mapped) => is_private_ipv4(mapped),
            None => is_private_ipv6(ip),
        },
    }
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()           // 127.0.0.0/8
        || ip.is_private()     // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
        || ip.is_link_local() // 169.254.0.0/16
}

fn is_private_ipv6(ip: Ipv6Addr) -> bool {
    ip.is_loopback()                   // ::1
        || ip.is_unique_local()        // fc00::/7
        || ip.is_unicast_link_local() // fe80::/10
}

/// Finds a TCP port that is currently unused on `host`.
///
/// The port is released before returning, so another process may claim it in
/// the meantime. A later bind failure on the returned port is reported by the
/// caller, not prevented here.
///
/// # Errors
///
/// Returns [`Error::Bind`] if no socket could be bound on `host`.
pub fn find_free_port(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0)).map_err(|e| Error::Bind {
        address: format!("{host}:0"),
        reason: e.to_string(),
    })?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Bind {
            address: format!("{host}:0"),
            reason: e.to_string(),
        })?
        .port();
    Ok(port)
}
