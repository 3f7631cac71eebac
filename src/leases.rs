//! The lease table: lookup, recycling, allocation and persistence.
//!
//! A fixed-capacity array of records, zeroed at startup, rehydrated from
//! the lease file, mutated only by the message handler and checkpointed by
//! the event loop. Empty slots carry `expires == 0` and therefore look
//! maximally expired to the recycler.

use crate::arp::{ArpProbe, Probe};
use crate::config::ServerConfig;
use log::{info, warn};
use std::fs::File;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::path::Path;

/// Sentinel hardware address for conflict reservations: the owner answered
/// an ARP probe but never spoke DHCP, so its MAC is unknown.
pub const BLANK_CHADDR: [u8; 16] = [0; 16];

/// Size of one persisted record: chaddr, yiaddr, lease time.
const RECORD_LEN: usize = 16 + 4 + 4;

/// One slot of the lease table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// Client hardware address; all-zero marks a conflict reservation.
    pub chaddr: [u8; 16],
    /// Leased address; `0.0.0.0` marks an empty slot.
    pub yiaddr: Ipv4Addr,
    /// Expiry, seconds since the Unix epoch.
    pub expires: u64,
}

impl Default for Lease {
    fn default() -> Self {
        Self {
            chaddr: [0; 16],
            yiaddr: Ipv4Addr::UNSPECIFIED,
            expires: 0,
        }
    }
}

impl Lease {
    /// True once the lease has lapsed.
    #[inline]
    pub fn expired(&self, now: u64) -> bool {
        self.expires < now
    }
}

/// Fixed-capacity table of address bindings.
#[derive(Debug)]
pub struct LeaseTable {
    slots: Vec<Lease>,
}

impl LeaseTable {
    /// A table of `max_leases` empty slots.
    pub fn new(max_leases: usize) -> Self {
        Self {
            slots: vec![Lease::default(); max_leases],
        }
    }

    /// Iterate the live (non-empty) records.
    pub fn iter(&self) -> impl Iterator<Item = &Lease> {
        self.slots.iter().filter(|l| !l.yiaddr.is_unspecified())
    }

    /// First record whose hardware address matches.
    ///
    /// [`BLANK_CHADDR`] is not a client and never matches.
    pub fn find_by_chaddr(&self, chaddr: &[u8; 16]) -> Option<&Lease> {
        if chaddr == &BLANK_CHADDR {
            return None;
        }
        self.slots.iter().find(|l| &l.chaddr == chaddr)
    }

    /// Mutable variant of [`find_by_chaddr`](Self::find_by_chaddr).
    pub fn find_by_chaddr_mut(&mut self, chaddr: &[u8; 16]) -> Option<&mut Lease> {
        if chaddr == &BLANK_CHADDR {
            return None;
        }
        self.slots.iter_mut().find(|l| &l.chaddr == chaddr)
    }

    /// First record bound to a non-zero address.
    pub fn find_by_yiaddr(&self, yiaddr: Ipv4Addr) -> Option<&Lease> {
        if yiaddr.is_unspecified() {
            return None;
        }
        self.slots.iter().find(|l| l.yiaddr == yiaddr)
    }

    /// Mutable variant of [`find_by_yiaddr`](Self::find_by_yiaddr).
    pub fn find_by_yiaddr_mut(&mut self, yiaddr: Ipv4Addr) -> Option<&mut Lease> {
        if yiaddr.is_unspecified() {
            return None;
        }
        self.slots.iter_mut().find(|l| l.yiaddr == yiaddr)
    }

    /// Zero every slot matching `chaddr` or `yiaddr`.
    ///
    /// An all-zero `chaddr` only matches by address, so a conflict
    /// reservation never causes spurious clears of other reservations.
    pub fn clear(&mut self, chaddr: &[u8; 16], yiaddr: Ipv4Addr) {
        let match_mac = chaddr.iter().any(|b| *b != 0);
        for slot in &mut self.slots {
            let mac_hit = match_mac && &slot.chaddr == chaddr;
            let ip_hit = !yiaddr.is_unspecified() && slot.yiaddr == yiaddr;
            if mac_hit || ip_hit {
                *slot = Lease::default();
            }
        }
    }

    fn oldest_expired_idx(&self, now: u64) -> Option<usize> {
        let mut oldest: Option<(usize, u64)> = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.expires < now && oldest.map_or(true, |(_, expires)| slot.expires < expires) {
                oldest = Some((idx, slot.expires));
            }
        }
        oldest.map(|(idx, _)| idx)
    }

    /// The already-expired slot with the smallest expiry, ties to the
    /// lowest index; `None` when every slot holds a live lease.
    pub fn oldest_expired(&self, now: u64) -> Option<&Lease> {
        self.oldest_expired_idx(now).map(|idx| &self.slots[idx])
    }

    /// Bind `yiaddr` to `chaddr` for `lease_secs`, recycling the oldest
    /// expired slot.
    ///
    /// Existing entries keyed by either `chaddr` or `yiaddr` are cleared
    /// first, so the table never holds two live records for one client or
    /// one address. Returns `None` iff the table is full of live leases.
    pub fn add(
        &mut self,
        chaddr: [u8; 16],
        yiaddr: Ipv4Addr,
        lease_secs: u64,
        now: u64,
    ) -> Option<&Lease> {
        self.clear(&chaddr, yiaddr);
        let idx = self.oldest_expired_idx(now)?;
        let slot = &mut self.slots[idx];
        slot.chaddr = chaddr;
        slot.yiaddr = yiaddr;
        slot.expires = now.saturating_add(lease_secs);
        Some(&self.slots[idx])
    }

    /// Checkpoint every live record to `path`, truncating it first.
    ///
    /// Record layout: `chaddr[16] ‖ yiaddr[4] ‖ lease_time[4]`, big-endian
    /// time. With `remaining` the time field is what is left of the lease
    /// (zero once expired), otherwise the absolute expiry.
    pub fn save(&self, path: &Path, remaining: bool, now: u64) -> std::io::Result<()> {
        let mut file = File::create(path)?;
        let mut buf: Vec<u8> = Vec::with_capacity(self.iter().count() * RECORD_LEN);
        for lease in self.iter() {
            let lease_time: u32 = if remaining {
                lease.expires.saturating_sub(now).try_into().unwrap_or(u32::MAX)
            } else {
                lease.expires.try_into().unwrap_or(u32::MAX)
            };
            buf.extend_from_slice(&lease.chaddr);
            buf.extend_from_slice(&lease.yiaddr.octets());
            buf.extend_from_slice(&lease_time.to_be_bytes());
        }
        file.write_all(&buf)
    }

    /// Rehydrate from `path`, dropping records outside the pool and
    /// stopping with a warning once the table fills.
    ///
    /// Returns the number of records restored.
    pub fn load(
        &mut self,
        path: &Path,
        cfg: &ServerConfig,
        now: u64,
    ) -> std::io::Result<usize> {
        let mut file = File::open(path)?;
        let mut record: [u8; RECORD_LEN] = [0; RECORD_LEN];
        let mut restored: usize = 0;

        while restored < self.slots.len() {
            match file.read_exact(&mut record) {
                Ok(()) => (),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let mut chaddr: [u8; 16] = [0; 16];
            chaddr.copy_from_slice(&record[..16]);
            let mut quad: [u8; 4] = [0; 4];
            quad.copy_from_slice(&record[16..20]);
            let yiaddr = Ipv4Addr::from(quad);
            quad.copy_from_slice(&record[20..24]);
            let lease_time = u64::from(u32::from_be_bytes(quad));

            if !cfg.in_pool(yiaddr) {
                continue;
            }
            let lease_secs = if cfg.remaining {
                lease_time
            } else {
                lease_time.saturating_sub(now)
            };
            if self.add(chaddr, yiaddr, lease_secs, now).is_none() {
                warn!("too many leases while loading {}", path.display());
                break;
            }
            restored += 1;
        }
        Ok(restored)
    }
}

/// Scan the pool for an assignable address.
///
/// Addresses ending in `.0` or `.255` are skipped. A candidate that a host
/// already answers for is reserved under the blank sentinel for
/// `conflict_time` so it is not probed again immediately. With
/// `check_expired`, addresses held by lapsed leases are eligible too.
pub fn find_address(
    table: &mut LeaseTable,
    cfg: &ServerConfig,
    probe: &dyn ArpProbe,
    check_expired: bool,
    now: u64,
) -> Option<Ipv4Addr> {
    for addr in u32::from(cfg.start)..=u32::from(cfg.end) {
        let low = addr & 0xff;
        if low == 0 || low == 0xff {
            continue;
        }
        let candidate = Ipv4Addr::from(addr);
        if let Some(lease) = table.find_by_yiaddr(candidate) {
            if !(check_expired && lease.expired(now)) {
                continue;
            }
        }
        match probe.probe(candidate, cfg.server_ip, cfg.server_mac, cfg.ifindex) {
            Probe::Taken => {
                info!(
                    "{candidate} belongs to someone, reserving it for {} seconds",
                    cfg.conflict_time
                );
                table.add(BLANK_CHADDR, candidate, u64::from(cfg.conflict_time), now);
            }
            Probe::Free => return Some(candidate),
        }
    }
    None
}
