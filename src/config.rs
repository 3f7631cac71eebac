//! Server configuration.
//!
//! Compiled defaults, the line-oriented `key value` config file, and the
//! interface probe that resolves the configured interface name to an
//! address, MAC and index.

use crate::options::{self, OptionSet, OptionType};
use log::error;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fatal configuration problems; everything else reverts to defaults.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("unable to read config file {}: {source}", path.display())]
    Read {
        /// Path that failed to open.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The pool is inverted or empty.
    #[error("pool start {start} is above pool end {end}")]
    BadPool {
        /// Configured pool start.
        start: Ipv4Addr,
        /// Configured pool end.
        end: Ipv4Addr,
    },
    /// The configured interface has no usable IPv4 address.
    #[error("interface {0} does not exist or has no IPv4 address")]
    NoInterface(String),
}

/// Server parameters, immutable once the daemon is up.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// First address of the pool.
    pub start: Ipv4Addr,
    /// Last address of the pool, inclusive.
    pub end: Ipv4Addr,
    /// Interface to serve on.
    pub interface: String,
    /// Our address on `interface`, used as the server identifier.
    pub server_ip: Ipv4Addr,
    /// Our MAC on `interface`, handed to the conflict prober.
    pub server_mac: [u8; 6],
    /// Interface index, handed to the conflict prober.
    pub ifindex: u32,
    /// Lease duration granted when the client does not negotiate one.
    pub lease_secs: u32,
    /// Capacity of the lease table.
    pub max_leases: usize,
    /// Persist remaining lease time instead of absolute expiry.
    pub remaining: bool,
    /// Seconds between periodic lease-table flushes; zero disables.
    pub auto_time: u32,
    /// Quarantine after a DHCPDECLINE.
    pub decline_time: u32,
    /// Reservation after an ARP probe finds an address in use.
    pub conflict_time: u32,
    /// Reservation between OFFER and the client's REQUEST.
    pub offer_time: u32,
    /// Client lease requests below this fall back to `lease_secs`.
    pub min_lease: u32,
    /// Lease table persistence file.
    pub lease_file: PathBuf,
    /// PID file path.
    pub pidfile: PathBuf,
    /// Program run with the lease file path after every flush.
    pub notify_file: Option<PathBuf>,
    /// `siaddr` for netbooting clients.
    pub siaddr: Ipv4Addr,
    /// `sname` BOOTP field.
    pub sname: String,
    /// `file` BOOTP field.
    pub boot_file: String,
    /// Options echoed in OFFER, ACK and INFORM replies.
    pub options: OptionSet,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut cfg = Self {
            start: Ipv4Addr::UNSPECIFIED,
            end: Ipv4Addr::UNSPECIFIED,
            interface: String::new(),
            server_ip: Ipv4Addr::UNSPECIFIED,
            server_mac: [0; 6],
            ifindex: 0,
            lease_secs: DEFAULT_LEASE_SECS,
            max_leases: 0,
            remaining: false,
            auto_time: 0,
            decline_time: 0,
            conflict_time: 0,
            offer_time: 0,
            min_lease: 0,
            lease_file: PathBuf::new(),
            pidfile: PathBuf::new(),
            notify_file: None,
            siaddr: Ipv4Addr::UNSPECIFIED,
            sname: String::new(),
            boot_file: String::new(),
            options: OptionSet::new(),
        };
        for kw in KEYWORDS {
            if !kw.default.is_empty() {
                (kw.parse)(&mut cfg, kw.default);
            }
        }
        cfg
    }
}

impl ServerConfig {
    /// Load the config file on top of the defaults.
    ///
    /// A malformed line logs an error and reverts its key to the default;
    /// an unreadable file or an inverted pool is fatal.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut cfg = Self::default();
        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or("");
            let line = line.trim_matches(trim_ws);
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once(|c: char| c.is_ascii_whitespace() || c == '=')
            {
                Some((key, rest)) => (key, rest.trim_matches(|c| trim_ws(c) || c == '=')),
                None => continue,
            };
            let Some(kw) = KEYWORDS.iter().find(|kw| kw.name.eq_ignore_ascii_case(key)) else {
                continue;
            };
            if !(kw.parse)(&mut cfg, value) {
                error!("unable to parse '{line}'");
                if !kw.default.is_empty() {
                    (kw.parse)(&mut cfg, kw.default);
                }
            }
        }

        // a lease option in the config overrides the compiled default and
        // must not shadow the negotiated time in replies
        if let Some(value) = cfg.options.remove(options::DHCP_LEASE_TIME) {
            if let Ok(bytes) = <[u8; 4]>::try_from(value.as_slice()) {
                cfg.lease_secs = u32::from_be_bytes(bytes);
            }
        }

        if u32::from(cfg.start) > u32::from(cfg.end) {
            return Err(ConfigError::BadPool {
                start: cfg.start,
                end: cfg.end,
            });
        }
        Ok(cfg)
    }

    /// Resolve the configured interface to its address, MAC and index.
    ///
    /// Must run before the server starts; failure is a fatal startup error.
    pub fn probe_interface(&mut self) -> Result<(), ConfigError> {
        let missing = || ConfigError::NoInterface(self.interface.clone());
        let ifindex = nix::net::if_::if_nametoindex(self.interface.as_str()).map_err(|_| missing())?;

        let mut ip: Option<Ipv4Addr> = None;
        let mut mac: Option<[u8; 6]> = None;
        for ifa in nix::ifaddrs::getifaddrs().map_err(|_| missing())? {
            if ifa.interface_name != self.interface {
                continue;
            }
            if let Some(addr) = ifa.address {
                if let Some(sin) = addr.as_sockaddr_in() {
                    ip.get_or_insert(sin.ip());
                }
                if let Some(link) = addr.as_link_addr() {
                    if let Some(octets) = link.addr() {
                        mac.get_or_insert(octets);
                    }
                }
            }
        }

        self.server_ip = ip.ok_or_else(missing)?;
        self.server_mac = mac.unwrap_or_default();
        self.ifindex = ifindex;
        Ok(())
    }

    /// True if `ip` is an assignable pool address: inside `[start, end]`
    /// and not a network or broadcast host (low octet 0 or 255).
    pub fn in_pool(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        if addr < u32::from(self.start) || addr > u32::from(self.end) {
            return false;
        }
        let low = addr & 0xff;
        low != 0 && low != 0xff
    }
}

fn trim_ws(c: char) -> bool {
    c == ' ' || c == '\t'
}

struct Keyword {
    name: &'static str,
    default: &'static str,
    parse: fn(&mut ServerConfig, &str) -> bool,
}

const KEYWORDS: &[Keyword] = &[
    Keyword { name: "start", default: "192.168.0.20", parse: set_start },
    Keyword { name: "end", default: "192.168.0.254", parse: set_end },
    Keyword { name: "interface", default: "eth0", parse: set_interface },
    Keyword { name: "option", default: "", parse: set_option },
    Keyword { name: "opt", default: "", parse: set_option },
    Keyword { name: "max_leases", default: "254", parse: set_max_leases },
    Keyword { name: "remaining", default: "yes", parse: set_remaining },
    Keyword { name: "auto_time", default: "7200", parse: set_auto_time },
    Keyword { name: "decline_time", default: "3600", parse: set_decline_time },
    Keyword { name: "conflict_time", default: "3600", parse: set_conflict_time },
    Keyword { name: "offer_time", default: "60", parse: set_offer_time },
    Keyword { name: "min_lease", default: "60", parse: set_min_lease },
    Keyword { name: "lease_file", default: "/var/lib/misc/udhcpd.leases", parse: set_lease_file },
    Keyword { name: "pidfile", default: "/var/run/udhcpd.pid", parse: set_pidfile },
    Keyword { name: "notify_file", default: "", parse: set_notify_file },
    Keyword { name: "siaddr", default: "0.0.0.0", parse: set_siaddr },
    Keyword { name: "sname", default: "", parse: set_sname },
    Keyword { name: "boot_file", default: "", parse: set_boot_file },
];

/// Compiled default lease duration: ten days.
const DEFAULT_LEASE_SECS: u32 = 60 * 60 * 24 * 10;

fn set_start(cfg: &mut ServerConfig, v: &str) -> bool {
    parse_ip(v).map(|ip| cfg.start = ip).is_some()
}

fn set_end(cfg: &mut ServerConfig, v: &str) -> bool {
    parse_ip(v).map(|ip| cfg.end = ip).is_some()
}

fn set_interface(cfg: &mut ServerConfig, v: &str) -> bool {
    cfg.interface = v.to_string();
    true
}

fn set_option(cfg: &mut ServerConfig, v: &str) -> bool {
    parse_option_line(&mut cfg.options, v)
}

fn set_max_leases(cfg: &mut ServerConfig, v: &str) -> bool {
    match parse_u32(v) {
        Some(n) if n > 0 => {
            cfg.max_leases = n as usize;
            true
        }
        _ => false,
    }
}

fn set_remaining(cfg: &mut ServerConfig, v: &str) -> bool {
    parse_yn(v).map(|b| cfg.remaining = b).is_some()
}

fn set_auto_time(cfg: &mut ServerConfig, v: &str) -> bool {
    parse_u32(v).map(|n| cfg.auto_time = n).is_some()
}

fn set_decline_time(cfg: &mut ServerConfig, v: &str) -> bool {
    parse_u32(v).map(|n| cfg.decline_time = n).is_some()
}

fn set_conflict_time(cfg: &mut ServerConfig, v: &str) -> bool {
    parse_u32(v).map(|n| cfg.conflict_time = n).is_some()
}

fn set_offer_time(cfg: &mut ServerConfig, v: &str) -> bool {
    parse_u32(v).map(|n| cfg.offer_time = n).is_some()
}

fn set_min_lease(cfg: &mut ServerConfig, v: &str) -> bool {
    parse_u32(v).map(|n| cfg.min_lease = n).is_some()
}

fn set_lease_file(cfg: &mut ServerConfig, v: &str) -> bool {
    cfg.lease_file = PathBuf::from(v);
    true
}

fn set_pidfile(cfg: &mut ServerConfig, v: &str) -> bool {
    cfg.pidfile = PathBuf::from(v);
    true
}

fn set_notify_file(cfg: &mut ServerConfig, v: &str) -> bool {
    cfg.notify_file = if v.is_empty() {
        None
    } else {
        Some(PathBuf::from(v))
    };
    true
}

fn set_siaddr(cfg: &mut ServerConfig, v: &str) -> bool {
    parse_ip(v).map(|ip| cfg.siaddr = ip).is_some()
}

fn set_sname(cfg: &mut ServerConfig, v: &str) -> bool {
    cfg.sname = v.to_string();
    true
}

fn set_boot_file(cfg: &mut ServerConfig, v: &str) -> bool {
    cfg.boot_file = v.to_string();
    true
}

/// Dotted quad, or a hostname put through the resolver.
fn parse_ip(v: &str) -> Option<Ipv4Addr> {
    if let Ok(ip) = v.parse::<Ipv4Addr>() {
        return Some(ip);
    }
    (v, 0u16).to_socket_addrs().ok()?.find_map(|addr| match addr {
        SocketAddr::V4(v4) => Some(*v4.ip()),
        SocketAddr::V6(_) => None,
    })
}

/// Unsigned integer with auto base: `0x` hex, leading `0` octal, else
/// decimal.
fn parse_u32(v: &str) -> Option<u32> {
    if let Some(hex) = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if v.len() > 1 && v.starts_with('0') {
        u32::from_str_radix(&v[1..], 8).ok()
    } else {
        v.parse().ok()
    }
}

fn parse_i32(v: &str) -> Option<i32> {
    if let Some(rest) = v.strip_prefix('-') {
        parse_u32(rest).and_then(|n| i32::try_from(n).ok()).map(|n| -n)
    } else {
        parse_u32(v).and_then(|n| i32::try_from(n).ok())
    }
}

fn parse_yn(v: &str) -> Option<bool> {
    if v.eq_ignore_ascii_case("yes") {
        Some(true)
    } else if v.eq_ignore_ascii_case("no") {
        Some(false)
    } else {
        None
    }
}

/// Encode one config value according to its registry type.
fn encode_value(kind: OptionType, v: &str) -> Option<Vec<u8>> {
    match kind {
        OptionType::Ip => Some(parse_ip(v)?.octets().to_vec()),
        OptionType::IpPair => {
            let (a, b) = v.split_once(['/', '-'])?;
            let mut out = parse_ip(a)?.octets().to_vec();
            out.extend_from_slice(&parse_ip(b)?.octets());
            Some(out)
        }
        OptionType::Str => {
            let bytes = v.as_bytes();
            if bytes.is_empty() {
                None
            } else {
                Some(bytes[..bytes.len().min(254)].to_vec())
            }
        }
        OptionType::Bool => Some(vec![u8::from(parse_yn(v)?)]),
        OptionType::U8 => Some(vec![u8::try_from(parse_u32(v)?).ok()?]),
        OptionType::U16 => Some(u16::try_from(parse_u32(v)?).ok()?.to_be_bytes().to_vec()),
        OptionType::S16 => Some(i16::try_from(parse_i32(v)?).ok()?.to_be_bytes().to_vec()),
        OptionType::U32 => Some(parse_u32(v)?.to_be_bytes().to_vec()),
        OptionType::S32 => Some(parse_i32(v)?.to_be_bytes().to_vec()),
    }
}

/// Parse `option <name> <value>[,<value>...]` into the echoed set.
fn parse_option_line(set: &mut OptionSet, line: &str) -> bool {
    let line = line.trim_matches(trim_ws);
    let Some((name, rest)) = line.split_once(|c: char| c.is_ascii_whitespace() || c == '=') else {
        return false;
    };
    let Some(def) = options::find(name) else {
        return false;
    };

    let mut attached = false;
    for value in rest
        .split([',', ' ', '\t'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        match encode_value(def.kind, value) {
            Some(bytes) => {
                set.attach(def, &bytes);
                attached = true;
            }
            None => return false,
        }
        if !def.repeatable {
            break;
        }
    }
    attached
}
