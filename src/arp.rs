//! Address-conflict probing.
//!
//! Before an address leaves the pool the allocator asks whether some host on
//! the segment already answers for it. The prober itself (raw sockets,
//! retry cadence, timeout) lives outside this crate; the allocator only
//! depends on this trait.

use std::net::Ipv4Addr;

/// Outcome of probing a candidate address.
///
/// A probe that errors out reports [`Probe::Free`]: a transient send
/// failure must not wedge allocation, and a false positive only risks the
/// same conflict the probe exists to reduce.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Probe {
    /// Nobody answered; the address is assignable.
    Free,
    /// A host replied; the address is in use on the segment.
    Taken,
}

/// An ARP-style conflict prober.
pub trait ArpProbe {
    /// Probe `target`, sending from `source_ip`/`source_mac` on the
    /// interface identified by `ifindex`.
    ///
    /// Implementations bound their own timeout; the event loop blocks for
    /// the duration.
    fn probe(&self, target: Ipv4Addr, source_ip: Ipv4Addr, source_mac: [u8; 6], ifindex: u32) -> Probe;
}

/// A prober that reports every address free.
///
/// For segments where conflict detection is delegated to an external
/// prober, or disabled deliberately.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeFree;

impl ArpProbe for AssumeFree {
    fn probe(&self, _target: Ipv4Addr, _source_ip: Ipv4Addr, _source_mac: [u8; 6], _ifindex: u32) -> Probe {
        Probe::Free
    }
}
