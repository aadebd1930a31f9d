//! Multicast DNS service advertisement and discovery.
//!
//! This crate implements the two halves of mDNS-based DNS-SD:
//!
//! - a [`responder`] that authoritatively answers queries for a configured set of services, and
//! - a [`query`] side that browses for a service type and streams completed
//!   [`ServiceEntry`](query::ServiceEntry) values to the caller.
//!
//! Both are built on the wire codec in [`packet`].

use std::net::{Ipv4Addr, Ipv6Addr};

mod error;
mod hex;
pub mod name;
pub mod packet;
pub mod query;
pub mod responder;
pub mod socket;
pub mod zone;

pub use error::Error;

/// The UDP port mDNS operates on.
pub const MDNS_PORT: u16 = 5353;

/// The IPv4 mDNS multicast group.
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// The IPv6 mDNS multicast group.
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// Size of mDNS message buffers.
///
/// Unicast DNS messages are limited to 512 bytes, but mDNS stays within the local link and can
/// use messages up to the interface MTU.
pub const MDNS_BUFFER_SIZE: usize = 1500;
