//! Authoritative DHCPv4 server for a single broadcast segment.
//!
//! The server answers `DISCOVER → OFFER → REQUEST → ACK` exchanges (plus
//! `DECLINE`, `RELEASE` and `INFORM`) for one contiguous IPv4 pool on one
//! directly connected interface, tracks handed-out addresses in a
//! fixed-capacity lease table, and persists that table across restarts.
//!
//! # Warning
//!
//! Please review the code before use in a production environment.
//! This code has been tested, but only against a small number of client
//! implementations.
//!
//! # Limitations
//!
//! * No relay semantics beyond preserving `giaddr`; the server expects to
//!   share a segment with its clients.
//! * No per-host static reservations.
//! * No DHCPv6.
//!
//! # Relevant Specifications
//!
//! * [RFC 2131](https://www.rfc-editor.org/rfc/rfc2131)
//! * [RFC 2132](https://www.rfc-editor.org/rfc/rfc2132)
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod arp;
pub mod config;
pub mod handler;
pub mod leases;
pub mod options;
pub mod pidfile;
pub mod pkt;
pub mod server;

use std::time::{SystemTime, UNIX_EPOCH};

/// DHCP server port.
pub const SERVER_PORT: u16 = 67;

/// DHCP client port.
pub const CLIENT_PORT: u16 = 68;

/// Seconds since the Unix epoch.
///
/// Lease bookkeeping passes this in explicitly so that tests can pin the
/// clock.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
