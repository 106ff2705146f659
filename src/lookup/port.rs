//! Ephemeral port discovery.
//!
//! A listener is bound to `<addr>:0`, the port the OS picked is read back and
//! the listener is dropped again before returning.  The port is free at the
//! moment of the call, nothing more: another process may take it before the
//! caller binds it.  Callers that cannot tolerate that race should bind port 0
//! themselves and keep the socket.

use std::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV6};

use log::debug;
use nix::net::if_::if_nametoindex;
use tokio::net::{TcpListener, UdpSocket};

use super::address;
use crate::error::BindError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Finds a currently unused `address:port` on the given interface, or on the
/// default interface when `interface` is `None` or empty.
pub async fn find_open_address(
    interface: Option<&str>,
    ipv4_only: bool,
    protocol: Protocol,
) -> Result<SocketAddr, BindError> {
    let (name, ip) = match interface.filter(|name| !name.is_empty()) {
        Some(name) => (name.to_string(), address::first_address(name, ipv4_only)?),
        None => address::default_interface_address(ipv4_only)?,
    };
    let base = bind_target(&name, ip);
    let failed = |source| BindError::Bind { addr: base, source };

    // The socket is dropped at the end of each arm.
    let found = match protocol {
        Protocol::Tcp => {
            let listener = TcpListener::bind(base).await.map_err(failed)?;
            listener.local_addr().map_err(failed)?
        }
        Protocol::Udp => {
            let socket = UdpSocket::bind(base).await.map_err(failed)?;
            socket.local_addr().map_err(failed)?
        }
    };

    debug!("found open {} address {} on {}", protocol, found, name);
    Ok(found)
}

/// Like [`find_open_address`], returning only the port.
pub async fn find_open_port(
    interface: Option<&str>,
    ipv4_only: bool,
    protocol: Protocol,
) -> Result<u16, BindError> {
    find_open_address(interface, ipv4_only, protocol)
        .await
        .map(|addr| addr.port())
}

/// Link-local IPv6 addresses cannot be bound without the interface scope.
fn bind_target(interface: &str, ip: IpAddr) -> SocketAddr {
    match ip {
        IpAddr::V6(v6) if (v6.segments()[0] & 0xffc0) == 0xfe80 => {
            let scope_id = if_nametoindex(interface).unwrap_or(0);
            SocketAddrV6::new(v6, 0, 0, scope_id).into()
        }
        _ => SocketAddr::new(ip, 0),
    }
}
