//! Multicast UDP socket setup.
//!
//! Sockets are built with `socket2` (reuse flags and hop limits must be set before binding) and
//! then converted into plain [`std::net::UdpSocket`]s for I/O.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
};

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::{error::Error, MDNS_GROUP_V4, MDNS_GROUP_V6, MDNS_PORT};

/// An address family a socket can be bound in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// The mDNS group address and port for this family.
    pub fn group_addr(self) -> SocketAddr {
        match self {
            Family::V4 => (IpAddr::V4(MDNS_GROUP_V4), MDNS_PORT).into(),
            Family::V6 => (IpAddr::V6(MDNS_GROUP_V6), MDNS_PORT).into(),
        }
    }

    /// The wildcard address of this family at `port`.
    pub fn wildcard(self, port: u16) -> SocketAddr {
        match self {
            Family::V4 => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into(),
            Family::V6 => (IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into(),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("IPv4"),
            Family::V6 => f.write_str("IPv6"),
        }
    }
}

/// Options applied to every socket the responder and querier open.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Sets `SO_REUSEADDR`, letting several mDNS participants share port 5353.
    pub reuse_addr: bool,
    /// Sets `SO_REUSEPORT` where the platform has it.
    pub reuse_port: bool,
    /// Multicast TTL (IPv4) or hop limit (IPv6) for outgoing datagrams.
    pub multicast_hops: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reuse_addr: true,
            reuse_port: true,
            multicast_hops: 1,
        }
    }
}

/// Creates a UDP socket bound to `addr` with the given options applied.
pub fn bind_udp(family: Family, addr: SocketAddr, opts: &SocketOptions) -> Result<UdpSocket, Error> {
    let domain = match family {
        Family::V4 => Domain::IPV4,
        Family::V6 => Domain::IPV6,
    };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::Bind)?;
    if opts.reuse_addr {
        sock.set_reuse_address(true).map_err(Error::Bind)?;
    }
    #[cfg(unix)]
    if opts.reuse_port {
        sock.set_reuse_port(true).map_err(Error::Bind)?;
    }
    match family {
        Family::V4 => sock
            .set_multicast_ttl_v4(opts.multicast_hops)
            .map_err(Error::Bind)?,
        Family::V6 => {
            sock.set_only_v6(true).map_err(Error::Bind)?;
            sock.set_multicast_hops_v6(opts.multicast_hops)
                .map_err(Error::Bind)?;
        }
    }
    sock.bind(&addr.into()).map_err(Error::Bind)?;
    Ok(sock.into())
}

/// Joins the mDNS multicast group of `family` on `sock`.
pub fn join_group(sock: &UdpSocket, family: Family) -> Result<(), Error> {
    match family {
        Family::V4 => sock
            .join_multicast_v4(&MDNS_GROUP_V4, &Ipv4Addr::UNSPECIFIED)
            .map_err(Error::Join),
        Family::V6 => sock
            .join_multicast_v6(&MDNS_GROUP_V6, 0)
            .map_err(Error::Join),
    }
}

/// Creates a socket bound to the mDNS port on the wildcard address and joins the group.
pub fn bind_multicast(family: Family, opts: &SocketOptions) -> Result<UdpSocket, Error> {
    let sock = bind_udp(family, family.wildcard(MDNS_PORT), opts)?;
    join_group(&sock, family)?;
    Ok(sock)
}

/// Routes outgoing multicast datagrams of `sock` through the named interface.
///
/// The appropriate `MULTICAST_IF` option is applied for every address of the interface whose
/// family matches the socket's. Having no matching address is not an error; the OS default
/// interface remains in effect then.
pub fn set_outgoing_interface(
    sock: &UdpSocket,
    family: Family,
    interface: &str,
) -> Result<(), Error> {
    let ifaces = if_addrs::get_if_addrs().map_err(Error::Bind)?;
    let sref = SockRef::from(sock);
    let mut applied = false;
    for iface in ifaces.iter().filter(|i| i.name == interface) {
        match (family, iface.ip()) {
            (Family::V4, IpAddr::V4(ip)) => {
                sref.set_multicast_if_v4(&ip).map_err(Error::Bind)?;
                applied = true;
            }
            (Family::V6, IpAddr::V6(_)) => {
                if let Some(index) = iface.index {
                    sref.set_multicast_if_v6(index).map_err(Error::Bind)?;
                    applied = true;
                }
            }
            _ => {}
        }
    }
    if !applied {
        log::debug!(
            "interface '{}' has no {} address, keeping default outgoing interface",
            interface,
            family
        );
    }
    Ok(())
}

/// Returns the first IPv4 address of the named interface, if any.
pub fn interface_ipv4(interface: &str) -> Option<Ipv4Addr> {
    if_addrs::get_if_addrs()
        .ok()?
        .into_iter()
        .filter(|i| i.name == interface)
        .find_map(|i| match i.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_addrs() {
        assert_eq!(
            Family::V4.group_addr().to_string(),
            "224.0.0.251:5353"
        );
        assert_eq!(Family::V6.group_addr().to_string(), "[ff02::fb]:5353");
    }

    #[test]
    fn ephemeral_bind() {
        let sock = bind_udp(
            Family::V4,
            Family::V4.wildcard(0),
            &SocketOptions::default(),
        )
        .unwrap();
        assert_ne!(sock.local_addr().unwrap().port(), 0);
    }
}
