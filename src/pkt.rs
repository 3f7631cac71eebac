//! DHCP message codec.
//!
//! A frame is the fixed 236-byte BOOTP header, the 4-byte magic cookie, and
//! a 308-byte options region holding a type-length-value stream terminated
//! by [`OPT_END`].
//!
//! # References
//!
//! * [RFC 951 Section 3](https://www.rfc-editor.org/rfc/rfc951#section-3)
//! * [RFC 2131 Section 2](https://www.rfc-editor.org/rfc/rfc2131#section-2)

use crate::options::OptionSet;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Fixed BOOTP header length.
const HDR_LEN: usize = 236;

/// Length of the options region on the wire.
const OPTS_LEN: usize = 308;

/// Serialized frame length: header, cookie and the full options region.
pub const FRAME_LEN: usize = HDR_LEN + 4 + OPTS_LEN;

/// Shortest parseable datagram: header plus cookie.
pub const MIN_FRAME_LEN: usize = HDR_LEN + 4;

const MAGIC_COOKIE: u32 = 0x6382_5363;

// Field offsets, RFC 2131 figure 1.
const OP: usize = 0;
const HTYPE: usize = 1;
const HLEN: usize = 2;
const HOPS: usize = 3;
const XID: usize = 4;
const SECS: usize = 8;
const FLAGS: usize = 10;
const CIADDR: usize = 12;
const YIADDR: usize = 16;
const SIADDR: usize = 20;
const GIADDR: usize = 24;
const CHADDR: usize = 28;
const SNAME: usize = 44;
const FILE: usize = 108;
const COOKIE: usize = 236;
const OPTIONS: usize = 240;

/// Pad byte in the options stream; carries no length or value.
pub const OPT_PAD: u8 = 0;

/// End marker of the options stream.
pub const OPT_END: u8 = 255;

/// Broadcast-requested bit of the `flags` field.
pub const FLAG_BROADCAST: u16 = 0x8000;

/// Hardware type for Ethernet, RFC 1700.
pub const HTYPE_ETHERNET: u8 = 1;

/// Hardware address length for Ethernet.
pub const HLEN_ETHERNET: u8 = 6;

/// Reasons a datagram is rejected before it reaches the handler.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    /// The datagram is shorter than the fixed header plus cookie.
    #[error("datagram of {0} bytes is shorter than the BOOTP header")]
    ShortFrame(usize),
    /// The four bytes after the fixed header are not the DHCP magic cookie.
    #[error("bad magic cookie {0:#010x}")]
    BadCookie(u32),
    /// An option's declared length runs past the end of the datagram.
    #[error("option {code} with length {len} overruns the frame")]
    TruncatedOption {
        /// Option code of the offending triple.
        code: u8,
        /// Declared value length.
        len: u8,
    },
}

/// DHCP op code.
///
/// From [RFC 2131 Section 2](https://www.rfc-editor.org/rfc/rfc2131#section-2)
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Op {
    /// Client to server.
    BootRequest = 1,
    /// Server to client.
    BootReply = 2,
}

impl From<Op> for u8 {
    fn from(val: Op) -> u8 {
        val as u8
    }
}

/// DHCP message types.
///
/// From [RFC 2132 Section 9.6](https://www.rfc-editor.org/rfc/rfc2132#section-9.6)
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MsgType {
    /// DHCPDISCOVER
    Discover = 1,
    /// DHCPOFFER
    Offer = 2,
    /// DHCPREQUEST
    Request = 3,
    /// DHCPDECLINE
    Decline = 4,
    /// DHCPACK
    Ack = 5,
    /// DHCPNAK
    Nak = 6,
    /// DHCPRELEASE
    Release = 7,
    /// DHCPINFORM
    Inform = 8,
}

impl From<MsgType> for u8 {
    fn from(val: MsgType) -> u8 {
        val as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            x if x == MsgType::Discover as u8 => Ok(MsgType::Discover),
            x if x == MsgType::Offer as u8 => Ok(MsgType::Offer),
            x if x == MsgType::Request as u8 => Ok(MsgType::Request),
            x if x == MsgType::Decline as u8 => Ok(MsgType::Decline),
            x if x == MsgType::Ack as u8 => Ok(MsgType::Ack),
            x if x == MsgType::Nak as u8 => Ok(MsgType::Nak),
            x if x == MsgType::Release as u8 => Ok(MsgType::Release),
            x if x == MsgType::Inform as u8 => Ok(MsgType::Inform),
            x => Err(x),
        }
    }
}

/// A decoded DHCP message.
///
/// Fixed fields mirror the wire layout; parsed options live in an
/// [`OptionSet`] with duplicate codes already concatenated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message op code, [`Op`].
    pub op: u8,
    /// Hardware address type, [`HTYPE_ETHERNET`] for Ethernet.
    pub htype: u8,
    /// Hardware address length, 6 for Ethernet.
    pub hlen: u8,
    /// Relay hop count, zero on the local segment.
    pub hops: u8,
    /// Transaction ID, echoed unchanged in replies.
    pub xid: u32,
    /// Seconds since the client began acquisition.
    pub secs: u16,
    /// Flags; bit 15 requests a broadcast reply.
    pub flags: u16,
    /// Client's current address, non-zero only when it holds a binding.
    pub ciaddr: Ipv4Addr,
    /// "Your" address, filled by the server in OFFER and ACK.
    pub yiaddr: Ipv4Addr,
    /// Next-server address for netboot.
    pub siaddr: Ipv4Addr,
    /// Relay agent address; preserved, never interpreted.
    pub giaddr: Ipv4Addr,
    /// Client hardware address, zero-padded past `hlen`.
    pub chaddr: [u8; 16],
    /// Server host name, zero-padded.
    pub sname: [u8; 64],
    /// Boot file name, zero-padded.
    pub file: [u8; 128],
    /// Options, sorted by code.
    pub options: OptionSet,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            op: 0,
            htype: 0,
            hlen: 0,
            hops: 0,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0; 16],
            sname: [0; 64],
            file: [0; 128],
            options: OptionSet::new(),
        }
    }
}

fn be32(buf: &[u8], at: usize) -> u32 {
    let mut b: [u8; 4] = [0; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(b)
}

fn be16(buf: &[u8], at: usize) -> u16 {
    let mut b: [u8; 2] = [0; 2];
    b.copy_from_slice(&buf[at..at + 2]);
    u16::from_be_bytes(b)
}

impl Message {
    /// Decode a datagram payload.
    ///
    /// Everything from the end of the cookie to the end of the datagram is
    /// walked as `(code, length, value)` triples; pad bytes are skipped and
    /// the end marker stops the walk. Duplicate codes concatenate in order
    /// of appearance.
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < MIN_FRAME_LEN {
            return Err(ParseError::ShortFrame(buf.len()));
        }
        let cookie: u32 = be32(buf, COOKIE);
        if cookie != MAGIC_COOKIE {
            return Err(ParseError::BadCookie(cookie));
        }

        let mut msg = Message {
            op: buf[OP],
            htype: buf[HTYPE],
            hlen: buf[HLEN],
            hops: buf[HOPS],
            xid: be32(buf, XID),
            secs: be16(buf, SECS),
            flags: be16(buf, FLAGS),
            ciaddr: Ipv4Addr::from(be32(buf, CIADDR)),
            yiaddr: Ipv4Addr::from(be32(buf, YIADDR)),
            siaddr: Ipv4Addr::from(be32(buf, SIADDR)),
            giaddr: Ipv4Addr::from(be32(buf, GIADDR)),
            ..Message::default()
        };
        msg.chaddr.copy_from_slice(&buf[CHADDR..CHADDR + 16]);
        msg.sname.copy_from_slice(&buf[SNAME..SNAME + 64]);
        msg.file.copy_from_slice(&buf[FILE..FILE + 128]);

        let mut idx: usize = OPTIONS;
        while idx < buf.len() {
            let code: u8 = buf[idx];
            if code == OPT_PAD {
                idx += 1;
                continue;
            }
            if code == OPT_END {
                break;
            }
            let len: u8 = match buf.get(idx + 1) {
                Some(len) => *len,
                None => return Err(ParseError::TruncatedOption { code, len: 0 }),
            };
            let end: usize = idx + 2 + usize::from(len);
            let value: &[u8] = buf
                .get(idx + 2..end)
                .ok_or(ParseError::TruncatedOption { code, len })?;
            msg.options.concat(code, value);
            idx = end;
        }

        Ok(msg)
    }

    /// Encode to the canonical wire form.
    ///
    /// Options are written in ascending code order, followed by the end
    /// marker and zero padding out to the full options region. Options that
    /// would not fit are dropped; the server's own templates never come
    /// close to the limit.
    pub fn serialize(&self) -> [u8; FRAME_LEN] {
        let mut buf: [u8; FRAME_LEN] = [0; FRAME_LEN];
        buf[OP] = self.op;
        buf[HTYPE] = self.htype;
        buf[HLEN] = self.hlen;
        buf[HOPS] = self.hops;
        buf[XID..XID + 4].copy_from_slice(&self.xid.to_be_bytes());
        buf[SECS..SECS + 2].copy_from_slice(&self.secs.to_be_bytes());
        buf[FLAGS..FLAGS + 2].copy_from_slice(&self.flags.to_be_bytes());
        buf[CIADDR..CIADDR + 4].copy_from_slice(&self.ciaddr.octets());
        buf[YIADDR..YIADDR + 4].copy_from_slice(&self.yiaddr.octets());
        buf[SIADDR..SIADDR + 4].copy_from_slice(&self.siaddr.octets());
        buf[GIADDR..GIADDR + 4].copy_from_slice(&self.giaddr.octets());
        buf[CHADDR..CHADDR + 16].copy_from_slice(&self.chaddr);
        buf[SNAME..SNAME + 64].copy_from_slice(&self.sname);
        buf[FILE..FILE + 128].copy_from_slice(&self.file);
        buf[COOKIE..COOKIE + 4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());

        let mut idx: usize = OPTIONS;
        for (code, value) in self.options.iter() {
            // leave room for the end marker
            if idx + 2 + value.len() > FRAME_LEN - 1 {
                log::warn!("option {code} does not fit in the options region, dropping");
                continue;
            }
            buf[idx] = code;
            buf[idx + 1] = value.len() as u8;
            buf[idx + 2..idx + 2 + value.len()].copy_from_slice(value);
            idx += 2 + value.len();
        }
        buf[idx] = OPT_END;
        buf
    }

    /// First (merged) value of an option, if present.
    #[inline]
    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options.get(code)
    }

    /// A four-byte option decoded as a big-endian `u32`.
    ///
    /// The value buffer has no alignment guarantee; the bytes are copied
    /// into an aligned temporary before conversion.
    pub fn option_u32(&self, code: u8) -> Option<u32> {
        let value: &[u8] = self.option(code)?;
        let bytes: [u8; 4] = value.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// A four-byte option decoded as an IPv4 address.
    pub fn option_ipv4(&self, code: u8) -> Option<Ipv4Addr> {
        self.option_u32(code).map(Ipv4Addr::from)
    }

    /// The DHCP message type option, if present and valid.
    pub fn msg_type(&self) -> Option<MsgType> {
        let value: &[u8] = self.option(crate::options::DHCP_MESSAGE_TYPE)?;
        MsgType::try_from(*value.first()?).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{DHCP_LEASE_TIME, DHCP_MESSAGE_TYPE, DHCP_REQUESTED_IP, DHCP_SERVER_ID};

    fn frame_with_options(options: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; MIN_FRAME_LEN];
        buf[OP] = Op::BootRequest.into();
        buf[HTYPE] = HTYPE_ETHERNET;
        buf[HLEN] = HLEN_ETHERNET;
        buf[COOKIE..COOKIE + 4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(options);
        buf
    }

    #[test]
    fn short_frame() {
        assert_eq!(
            Message::parse(&[0u8; 239]),
            Err(ParseError::ShortFrame(239))
        );
    }

    #[test]
    fn bad_cookie() {
        let mut buf = frame_with_options(&[OPT_END]);
        buf[COOKIE] = 0x12;
        assert!(matches!(
            Message::parse(&buf),
            Err(ParseError::BadCookie(_))
        ));
    }

    #[test]
    fn truncated_option() {
        let buf = frame_with_options(&[DHCP_REQUESTED_IP, 4, 192, 168]);
        assert_eq!(
            Message::parse(&buf),
            Err(ParseError::TruncatedOption {
                code: DHCP_REQUESTED_IP,
                len: 4
            })
        );
    }

    #[test]
    fn pad_skipped_end_stops() {
        let buf = frame_with_options(&[
            OPT_PAD,
            OPT_PAD,
            DHCP_MESSAGE_TYPE,
            1,
            MsgType::Discover.into(),
            OPT_END,
            // garbage after the end marker is ignored
            DHCP_SERVER_ID,
            99,
        ]);
        let msg = Message::parse(&buf).unwrap();
        assert_eq!(msg.msg_type(), Some(MsgType::Discover));
        assert_eq!(msg.option(DHCP_SERVER_ID), None);
    }

    #[test]
    fn duplicate_options_concatenate() {
        let buf = frame_with_options(&[
            DHCP_REQUESTED_IP,
            2,
            192,
            168,
            DHCP_REQUESTED_IP,
            2,
            0,
            20,
            OPT_END,
        ]);
        let msg = Message::parse(&buf).unwrap();
        assert_eq!(msg.option(DHCP_REQUESTED_IP), Some([192, 168, 0, 20].as_slice()));
    }

    #[test]
    fn roundtrip() {
        let mut msg = Message {
            op: Op::BootRequest.into(),
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            xid: 0xdead_beef,
            secs: 3,
            flags: FLAG_BROADCAST,
            ciaddr: Ipv4Addr::new(192, 168, 0, 21),
            ..Message::default()
        };
        msg.chaddr[..6].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        msg.options.concat(DHCP_MESSAGE_TYPE, &[MsgType::Request.into()]);
        msg.options.concat(DHCP_REQUESTED_IP, &[192, 168, 0, 21]);
        msg.options.concat(DHCP_LEASE_TIME, &600u32.to_be_bytes());

        let wire = msg.serialize();
        assert_eq!(wire.len(), FRAME_LEN);
        let back = Message::parse(&wire).unwrap();
        assert_eq!(back, msg);
        // canonical frames survive a second pass byte-for-byte
        assert_eq!(back.serialize(), wire);
    }

    #[test]
    fn serialize_pads_with_zeros() {
        let msg = Message::default();
        let wire = msg.serialize();
        assert_eq!(wire[OPTIONS], OPT_END);
        assert!(wire[OPTIONS + 1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn option_u32_needs_four_bytes() {
        let buf = frame_with_options(&[DHCP_LEASE_TIME, 2, 1, 2, OPT_END]);
        let msg = Message::parse(&buf).unwrap();
        assert_eq!(msg.option_u32(DHCP_LEASE_TIME), None);
    }
}
