//! Local address discovery.
//!
//! Interface information is read from the OS (`getifaddrs`) on every call and
//! never cached.  Interfaces are reported in the order the OS enumerates them,
//! which differs between platforms, so "first" below means "first in OS
//! order" rather than any stable ranking.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use hickory_resolver::TokioAsyncResolver;
use log::debug;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use nix::sys::socket::SockaddrStorage;
use tokio::net::UdpSocket;

use crate::error::LookupError;

/// Port appended to a dial target that does not carry one.
const DEFAULT_TARGET_PORT: u16 = 80;

/// Snapshot of one network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub flags: InterfaceFlags,
    pub addresses: Vec<IpAddr>,
}

impl NetworkInterface {
    /// First bound address, optionally restricted to IPv4.
    pub fn first_address(&self, ipv4_only: bool) -> Option<IpAddr> {
        self.addresses
            .iter()
            .copied()
            .find(|ip| !ipv4_only || ip.is_ipv4())
    }
}

/// Returns the local address the OS would use to reach `target`.
///
/// `target` may be a URL (`http://etcd:2379/...`), a `host:port` pair or a
/// bare host, in which case port 80 is assumed.  A connected UDP socket is
/// used, so no packet is sent: only the routing table is consulted.  The
/// socket is closed before returning.
pub async fn local_outbound_address(target: &str) -> Result<IpAddr, LookupError> {
    let (host, port) = split_target(target)?;
    let remote = SocketAddr::new(resolve_host(&host).await?, port);
    let unspecified: SocketAddr = match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let dial = |source| LookupError::Dial {
        target: remote,
        source,
    };
    let socket = UdpSocket::bind(unspecified).await.map_err(dial)?;
    socket.connect(remote).await.map_err(dial)?;
    let local = socket.local_addr().map_err(dial)?;

    debug!("route to {} leaves through {}", remote, local.ip());
    Ok(local.ip())
}

/// Splits a dial target into host and port, dropping any `scheme://` prefix,
/// path and userinfo.
pub(crate) fn split_target(target: &str) -> Result<(String, u16), LookupError> {
    let invalid = || LookupError::InvalidTarget(target.to_string());

    let trimmed = target.trim();
    let rest = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    let authority = rest.split('/').next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
        match tail.strip_prefix(':') {
            Some(port) => (host, port.parse().map_err(|_| invalid())?),
            None if tail.is_empty() => (host, DEFAULT_TARGET_PORT),
            None => return Err(invalid()),
        }
    } else {
        match authority.split_once(':') {
            Some((host, port)) if !port.contains(':') => {
                (host, port.parse().map_err(|_| invalid())?)
            }
            // Bare IPv6 literal.
            Some(_) => (authority, DEFAULT_TARGET_PORT),
            None => (authority, DEFAULT_TARGET_PORT),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

async fn resolve_host(host: &str) -> Result<IpAddr, LookupError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let failed = |reason: String| LookupError::Resolve {
        host: host.to_string(),
        reason,
    };
    let resolver =
        TokioAsyncResolver::tokio_from_system_conf().map_err(|e| failed(e.to_string()))?;
    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| failed(e.to_string()))?;
    lookup
        .iter()
        .next()
        .ok_or_else(|| failed("no addresses returned".into()))
}

/// Lists every interface on the host, in OS enumeration order.
pub fn interfaces() -> Result<Vec<NetworkInterface>, LookupError> {
    let entries = getifaddrs()?.map(|ifa| {
        let ip = ifa.address.as_ref().and_then(sockaddr_ip);
        (ifa.interface_name, ifa.flags, ip)
    });
    Ok(group_interfaces(entries))
}

fn sockaddr_ip(addr: &SockaddrStorage) -> Option<IpAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Some(IpAddr::V4(*SocketAddrV4::from(*v4).ip()));
    }
    addr.as_sockaddr_in6()
        .map(|v6| IpAddr::V6(*SocketAddrV6::from(*v6).ip()))
}

/// `getifaddrs` yields one entry per (interface, address) pair, plus a
/// link-level entry without an IP.  Fold them into one record per interface,
/// keeping interfaces that have no IP at all.
fn group_interfaces<I>(entries: I) -> Vec<NetworkInterface>
where
    I: IntoIterator<Item = (String, InterfaceFlags, Option<IpAddr>)>,
{
    let mut interfaces: Vec<NetworkInterface> = Vec::new();
    for (name, flags, ip) in entries {
        let idx = match interfaces.iter().position(|iface| iface.name == name) {
            Some(idx) => idx,
            None => {
                interfaces.push(NetworkInterface {
                    name,
                    flags: InterfaceFlags::empty(),
                    addresses: Vec::new(),
                });
                interfaces.len() - 1
            }
        };
        let iface = &mut interfaces[idx];
        iface.flags |= flags;
        if let Some(ip) = ip {
            if !iface.addresses.contains(&ip) {
                iface.addresses.push(ip);
            }
        }
    }
    interfaces
}

fn find_interface(name: &str) -> Result<NetworkInterface, LookupError> {
    interfaces()?
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| LookupError::InterfaceNotFound(name.to_string()))
}

/// All addresses bound to the named interface.  An interface without
/// addresses yields an empty list, an unknown one an error.
pub fn interface_addresses(name: &str) -> Result<Vec<IpAddr>, LookupError> {
    find_interface(name).map(|iface| iface.addresses)
}

/// First address of the named interface, optionally restricted to IPv4.
pub fn first_address(name: &str, ipv4_only: bool) -> Result<IpAddr, LookupError> {
    find_interface(name)?
        .first_address(ipv4_only)
        .ok_or_else(|| LookupError::NoAddress {
            interface: name.to_string(),
            ipv4_only,
        })
}

/// Interfaces carrying every flag in `flags`.  Empty `flags` matches all.
pub fn interfaces_matching(flags: InterfaceFlags) -> Result<Vec<NetworkInterface>, LookupError> {
    Ok(interfaces()?
        .into_iter()
        .filter(|iface| iface.flags.contains(flags))
        .collect())
}

/// First address of the first interface that is up and supports broadcast.
///
/// This is intentionally naive: it does not look at the routing table.
pub fn default_address(ipv4_only: bool) -> Result<IpAddr, LookupError> {
    default_interface_address(ipv4_only).map(|(_, ip)| ip)
}

pub(crate) fn default_interface_address(ipv4_only: bool) -> Result<(String, IpAddr), LookupError> {
    let iface = interfaces_matching(InterfaceFlags::IFF_UP | InterfaceFlags::IFF_BROADCAST)?
        .into_iter()
        .next()
        .ok_or(LookupError::NoInterface)?;
    let ip = iface
        .first_address(ipv4_only)
        .ok_or_else(|| LookupError::NoAddress {
            interface: iface.name.clone(),
            ipv4_only,
        })?;
    Ok((iface.name, ip))
}
