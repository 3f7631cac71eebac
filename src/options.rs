//! DHCP option registry and ordered option sets.
//!
//! The registry is the static schema used by the configuration loader to
//! turn `option <name> <value>` lines into encoded bytes; the handler only
//! ever deals in raw codes.
//!
//! # References
//!
//! * [RFC 2132](https://www.rfc-editor.org/rfc/rfc2132)

use log::warn;

/// Subnet mask, option 1.
pub const DHCP_SUBNET: u8 = 1;
/// Time offset, option 2.
pub const DHCP_TIME_OFFSET: u8 = 2;
/// Routers, option 3.
pub const DHCP_ROUTER: u8 = 3;
/// Time servers, option 4.
pub const DHCP_TIME_SERVER: u8 = 4;
/// IEN-116 name servers, option 5.
pub const DHCP_NAME_SERVER: u8 = 5;
/// DNS servers, option 6.
pub const DHCP_DNS_SERVER: u8 = 6;
/// Log servers, option 7.
pub const DHCP_LOG_SERVER: u8 = 7;
/// Cookie servers, option 8.
pub const DHCP_COOKIE_SERVER: u8 = 8;
/// LPR servers, option 9.
pub const DHCP_LPR_SERVER: u8 = 9;
/// Client host name, option 12.
pub const DHCP_HOST_NAME: u8 = 12;
/// Boot file size, option 13.
pub const DHCP_BOOT_SIZE: u8 = 13;
/// Domain name, option 15.
pub const DHCP_DOMAIN_NAME: u8 = 15;
/// Swap server, option 16.
pub const DHCP_SWAP_SERVER: u8 = 16;
/// Root path, option 17.
pub const DHCP_ROOT_PATH: u8 = 17;
/// Default IP TTL, option 23.
pub const DHCP_IP_TTL: u8 = 23;
/// Interface MTU, option 26.
pub const DHCP_MTU: u8 = 26;
/// Broadcast address, option 28.
pub const DHCP_BROADCAST: u8 = 28;
/// NTP servers, option 42.
pub const DHCP_NTP_SERVER: u8 = 42;
/// NetBIOS name servers, option 44.
pub const DHCP_WINS_SERVER: u8 = 44;
/// Requested IP address, option 50.
pub const DHCP_REQUESTED_IP: u8 = 50;
/// Address lease time, option 51.
pub const DHCP_LEASE_TIME: u8 = 51;
/// DHCP message type, option 53.
pub const DHCP_MESSAGE_TYPE: u8 = 53;
/// Server identifier, option 54.
pub const DHCP_SERVER_ID: u8 = 54;
/// Parameter request list, option 55.
pub const DHCP_PARAM_REQ: u8 = 55;
/// Free-form message, option 56.
pub const DHCP_MESSAGE: u8 = 56;
/// TFTP server name, option 66.
pub const DHCP_TFTP_SERVER: u8 = 66;
/// Boot file name, option 67.
pub const DHCP_BOOT_FILE: u8 = 67;

/// Semantic type of an option value.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OptionType {
    /// A single IPv4 address, 4 bytes.
    Ip,
    /// Two IPv4 addresses, 8 bytes (e.g. a static route destination/gateway).
    IpPair,
    /// A string of 1..=254 bytes.
    Str,
    /// `00` or `01`, 1 byte.
    Bool,
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer, big-endian.
    U16,
    /// Signed 16-bit integer, big-endian.
    S16,
    /// Unsigned 32-bit integer, big-endian.
    U32,
    /// Signed 32-bit integer, big-endian.
    S32,
}

impl OptionType {
    /// Encoded length of one element, `None` for variable-length strings.
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            OptionType::Ip => Some(4),
            OptionType::IpPair => Some(8),
            OptionType::Str => None,
            OptionType::Bool | OptionType::U8 => Some(1),
            OptionType::U16 | OptionType::S16 => Some(2),
            OptionType::U32 | OptionType::S32 => Some(4),
        }
    }
}

/// One registry entry: code, config-file name, type and whether multiple
/// values concatenate under a single TLV.
#[derive(Debug)]
pub struct OptionDef {
    /// Option code.
    pub code: u8,
    /// Name accepted in `option` config lines.
    pub name: &'static str,
    /// Semantic value type.
    pub kind: OptionType,
    /// Whether repeated values concatenate.
    pub repeatable: bool,
}

/// The supported options, ordered by code.
pub const REGISTRY: &[OptionDef] = &[
    OptionDef { code: DHCP_SUBNET, name: "subnet", kind: OptionType::Ip, repeatable: false },
    OptionDef { code: DHCP_TIME_OFFSET, name: "timezone", kind: OptionType::S32, repeatable: false },
    OptionDef { code: DHCP_ROUTER, name: "router", kind: OptionType::Ip, repeatable: true },
    OptionDef { code: DHCP_TIME_SERVER, name: "timesvr", kind: OptionType::Ip, repeatable: true },
    OptionDef { code: DHCP_NAME_SERVER, name: "namesvr", kind: OptionType::Ip, repeatable: true },
    OptionDef { code: DHCP_DNS_SERVER, name: "dns", kind: OptionType::Ip, repeatable: true },
    OptionDef { code: DHCP_LOG_SERVER, name: "logsvr", kind: OptionType::Ip, repeatable: true },
    OptionDef { code: DHCP_COOKIE_SERVER, name: "cookiesvr", kind: OptionType::Ip, repeatable: true },
    OptionDef { code: DHCP_LPR_SERVER, name: "lprsvr", kind: OptionType::Ip, repeatable: true },
    OptionDef { code: DHCP_HOST_NAME, name: "hostname", kind: OptionType::Str, repeatable: false },
    OptionDef { code: DHCP_BOOT_SIZE, name: "bootsize", kind: OptionType::U16, repeatable: false },
    OptionDef { code: DHCP_DOMAIN_NAME, name: "domain", kind: OptionType::Str, repeatable: false },
    OptionDef { code: DHCP_SWAP_SERVER, name: "swapsvr", kind: OptionType::Ip, repeatable: false },
    OptionDef { code: DHCP_ROOT_PATH, name: "rootpath", kind: OptionType::Str, repeatable: false },
    OptionDef { code: DHCP_IP_TTL, name: "ipttl", kind: OptionType::U8, repeatable: false },
    OptionDef { code: DHCP_MTU, name: "mtu", kind: OptionType::U16, repeatable: false },
    OptionDef { code: DHCP_BROADCAST, name: "broadcast", kind: OptionType::Ip, repeatable: false },
    OptionDef { code: DHCP_NTP_SERVER, name: "ntpsrv", kind: OptionType::Ip, repeatable: true },
    OptionDef { code: DHCP_WINS_SERVER, name: "wins", kind: OptionType::Ip, repeatable: true },
    OptionDef { code: DHCP_REQUESTED_IP, name: "requestip", kind: OptionType::Ip, repeatable: false },
    OptionDef { code: DHCP_LEASE_TIME, name: "lease", kind: OptionType::U32, repeatable: false },
    OptionDef { code: DHCP_MESSAGE_TYPE, name: "dhcptype", kind: OptionType::U8, repeatable: false },
    OptionDef { code: DHCP_SERVER_ID, name: "serverid", kind: OptionType::Ip, repeatable: false },
    OptionDef { code: DHCP_MESSAGE, name: "message", kind: OptionType::Str, repeatable: false },
    OptionDef { code: DHCP_TFTP_SERVER, name: "tftp", kind: OptionType::Str, repeatable: false },
    OptionDef { code: DHCP_BOOT_FILE, name: "bootfile", kind: OptionType::Str, repeatable: false },
];

/// Registry entry for a config-file name.
pub fn find(name: &str) -> Option<&'static OptionDef> {
    REGISTRY.iter().find(|def| def.name.eq_ignore_ascii_case(name))
}

/// Registry entry for an option code.
pub fn def_for(code: u8) -> Option<&'static OptionDef> {
    REGISTRY.iter().find(|def| def.code == code)
}

/// Largest value a single TLV can carry.
const MAX_VALUE_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    code: u8,
    data: Vec<u8>,
}

/// An ordered sequence of encoded options.
///
/// Codes are kept in ascending order so that serialization is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    entries: Vec<Entry>,
}

impl OptionSet {
    /// An empty set.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// True if the set holds no options.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value bytes for `code`, if present.
    pub fn get(&self, code: u8) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.code == code)
            .map(|e| e.data.as_slice())
    }

    /// Iterate `(code, value)` pairs in ascending code order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.entries.iter().map(|e| (e.code, e.data.as_slice()))
    }

    fn position(&self, code: u8) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&code, |e| e.code)
    }

    /// Insert `value` for `code`, replacing any existing value.
    pub fn insert(&mut self, code: u8, value: &[u8]) {
        match self.position(code) {
            Ok(at) => self.entries[at].data = value.to_vec(),
            Err(at) => self.entries.insert(
                at,
                Entry {
                    code,
                    data: value.to_vec(),
                },
            ),
        }
    }

    /// Insert `value` for `code`, appending to any existing value.
    ///
    /// This is the parse-time rule: duplicate TLVs merge in order of
    /// appearance. A merge that would exceed the one-byte length field is
    /// dropped.
    pub fn concat(&mut self, code: u8, value: &[u8]) {
        match self.position(code) {
            Ok(at) => {
                let entry = &mut self.entries[at];
                if entry.data.len() + value.len() > MAX_VALUE_LEN {
                    warn!("option {code} overflows 255 bytes, dropping extra value");
                    return;
                }
                entry.data.extend_from_slice(value);
            }
            Err(at) => self.entries.insert(
                at,
                Entry {
                    code,
                    data: value.to_vec(),
                },
            ),
        }
    }

    /// Insert a config-supplied value, honoring the registry schema:
    /// repeatable codes concatenate, anything else is last-write-wins.
    pub fn attach(&mut self, def: &OptionDef, value: &[u8]) {
        if def.repeatable {
            self.concat(def.code, value);
        } else {
            self.insert(def.code, value);
        }
    }

    /// Remove and return the value for `code`.
    pub fn remove(&mut self, code: u8) -> Option<Vec<u8>> {
        match self.position(code) {
            Ok(at) => Some(self.entries.remove(at).data),
            Err(_) => None,
        }
    }
}
