//! Black-box exchanges against the message handler.
//!
//! Client frames are built and server frames are checked with `dhcproto`,
//! so the codec under test never validates itself.

use dhcpd4::arp::{ArpProbe, AssumeFree, Probe};
use dhcpd4::config::ServerConfig;
use dhcpd4::handler::{self, Route};
use dhcpd4::leases::{LeaseTable, BLANK_CHADDR};
use dhcpd4::pkt;
use dhcproto::v4::{
    Decodable, Decoder, DhcpOption, Encodable, Encoder, Flags, HType, Message, MessageType,
    Opcode, OptionCode,
};
use std::io::Write;
use std::net::Ipv4Addr;

const NOW: u64 = 1000;
const XID: u32 = 0x3903_f326;
const SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);
const MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];

fn chaddr16(mac: [u8; 6]) -> [u8; 16] {
    let mut chaddr = [0u8; 16];
    chaddr[..6].copy_from_slice(&mac);
    chaddr
}

/// Pool `.20`–`.22`, 600 s leases, 60 s offers, loaded through the real
/// config-file path.
fn server_cfg() -> ServerConfig {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        b"start 192.168.0.20\n\
          end 192.168.0.22\n\
          option lease 600\n\
          offer_time 60\n\
          decline_time 3600\n\
          conflict_time 3600\n\
          option subnet 255.255.255.0\n\
          option dns 192.168.0.1\n",
    )
    .unwrap();
    let mut cfg = ServerConfig::load(file.path()).unwrap();
    cfg.server_ip = SERVER_IP;
    cfg.server_mac = [0x02, 0x00, 0x11, 0x22, 0x33, 0x44];
    cfg.ifindex = 1;
    cfg
}

fn encode(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2048);
    let mut e = Encoder::new(&mut buf);
    msg.encode(&mut e).expect("failed to encode client message");
    buf
}

fn client_frame(msg_type: MessageType, mac: [u8; 6]) -> Message {
    let mut msg = Message::default();
    msg.set_opcode(Opcode::BootRequest)
        .set_htype(HType::Eth)
        .set_xid(XID)
        .set_flags(Flags::default().set_broadcast())
        .set_chaddr(&mac)
        .opts_mut()
        .insert(DhcpOption::MessageType(msg_type));
    msg
}

/// Push one client frame through parse → handle → serialize, decoding any
/// reply with `dhcproto`.
fn exchange(
    cfg: &ServerConfig,
    table: &mut LeaseTable,
    probe: &dyn ArpProbe,
    client: &Message,
) -> Option<(Message, Route)> {
    let wire = encode(client);
    let inbound = pkt::Message::parse(&wire).expect("client frame failed to parse");
    let reply = handler::handle(cfg, table, probe, &inbound, NOW)?;
    let frame = reply.msg.serialize();
    let decoded =
        Message::decode(&mut Decoder::new(&frame)).expect("server frame failed to decode");
    Some((decoded, reply.route))
}

fn assert_is_reply_shell(msg: &Message) {
    assert_eq!(msg.opcode(), Opcode::BootReply);
    assert_eq!(msg.htype(), HType::Eth);
    assert_eq!(msg.hlen(), 6);
    assert_eq!(msg.hops(), 0);
    assert_eq!(msg.xid(), XID);
    assert_eq!(msg.chaddr()[..6], MAC);
    assert_eq!(
        msg.opts().get(OptionCode::ServerIdentifier),
        Some(&DhcpOption::ServerIdentifier(SERVER_IP))
    );
}

#[test]
fn discover_offer_request_ack() {
    let cfg = server_cfg();
    let mut table = LeaseTable::new(4);

    // fresh DISCOVER
    let (offer, route) = exchange(
        &cfg,
        &mut table,
        &AssumeFree,
        &client_frame(MessageType::Discover, MAC),
    )
    .expect("DISCOVER deserves an OFFER");
    assert_is_reply_shell(&offer);
    assert_eq!(route, Route::Broadcast);
    assert_eq!(
        offer.opts().get(OptionCode::MessageType),
        Some(&DhcpOption::MessageType(MessageType::Offer))
    );
    assert_eq!(offer.yiaddr(), Ipv4Addr::new(192, 168, 0, 20));
    assert_eq!(
        offer.opts().get(OptionCode::AddressLeaseTime),
        Some(&DhcpOption::AddressLeaseTime(600))
    );
    assert_eq!(
        offer.opts().get(OptionCode::SubnetMask),
        Some(&DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)))
    );
    assert_eq!(
        offer.opts().get(OptionCode::DomainNameServer),
        Some(&DhcpOption::DomainNameServer(vec![SERVER_IP]))
    );

    // the offer is reserved for offer_time
    let held = *table.find_by_chaddr(&chaddr16(MAC)).unwrap();
    assert_eq!(held.yiaddr, Ipv4Addr::new(192, 168, 0, 20));
    assert_eq!(held.expires, NOW + 60);

    // follow-up REQUEST, SELECTING state
    let mut request = client_frame(MessageType::Request, MAC);
    request
        .opts_mut()
        .insert(DhcpOption::RequestedIpAddress(offer.yiaddr()));
    request
        .opts_mut()
        .insert(DhcpOption::ServerIdentifier(SERVER_IP));
    let (ack, _) = exchange(&cfg, &mut table, &AssumeFree, &request).expect("REQUEST deserves an ACK");
    assert_is_reply_shell(&ack);
    assert_eq!(
        ack.opts().get(OptionCode::MessageType),
        Some(&DhcpOption::MessageType(MessageType::Ack))
    );
    assert_eq!(ack.yiaddr(), Ipv4Addr::new(192, 168, 0, 20));

    // the binding is committed for the full lease
    assert_eq!(
        table.find_by_chaddr(&chaddr16(MAC)).unwrap().expires,
        NOW + 600
    );
}

#[test]
fn request_to_another_server_is_dropped() {
    let cfg = server_cfg();
    let mut table = LeaseTable::new(4);
    table
        .add(chaddr16(MAC), Ipv4Addr::new(192, 168, 0, 20), 60, NOW)
        .unwrap();

    let mut request = client_frame(MessageType::Request, MAC);
    request
        .opts_mut()
        .insert(DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 0, 20)));
    request
        .opts_mut()
        .insert(DhcpOption::ServerIdentifier(Ipv4Addr::new(192, 168, 0, 9)));
    assert!(exchange(&cfg, &mut table, &AssumeFree, &request).is_none());
}

#[test]
fn init_reboot_mismatch_naks() {
    let cfg = server_cfg();
    let mut table = LeaseTable::new(4);
    let mac2: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02];
    table
        .add(chaddr16(mac2), Ipv4Addr::new(192, 168, 0, 21), 600, NOW)
        .unwrap();

    let mut request = client_frame(MessageType::Request, mac2);
    request
        .opts_mut()
        .insert(DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 0, 99)));
    let (nak, route) = exchange(&cfg, &mut table, &AssumeFree, &request).expect("mismatch deserves a NAK");
    assert_eq!(
        nak.opts().get(OptionCode::MessageType),
        Some(&DhcpOption::MessageType(MessageType::Nak))
    );
    assert_eq!(nak.yiaddr(), Ipv4Addr::UNSPECIFIED);
    assert_eq!(nak.opts().get(OptionCode::AddressLeaseTime), None);
    assert_eq!(route, Route::Broadcast);

    // table unchanged
    assert_eq!(
        table.find_by_chaddr(&chaddr16(mac2)).unwrap().yiaddr,
        Ipv4Addr::new(192, 168, 0, 21)
    );
}

#[test]
fn renewal_acks_in_place() {
    let cfg = server_cfg();
    let mut table = LeaseTable::new(4);
    let mac2: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02];
    let ip = Ipv4Addr::new(192, 168, 0, 21);
    table.add(chaddr16(mac2), ip, 300, 500).unwrap();

    let mut request = client_frame(MessageType::Request, mac2);
    request.set_ciaddr(ip);
    let (ack, route) = exchange(&cfg, &mut table, &AssumeFree, &request).expect("renewal deserves an ACK");
    assert_eq!(
        ack.opts().get(OptionCode::MessageType),
        Some(&DhcpOption::MessageType(MessageType::Ack))
    );
    assert_eq!(ack.yiaddr(), ip);
    assert_eq!(ack.ciaddr(), ip);
    assert_eq!(route, Route::Unicast(ip));
    assert_eq!(table.find_by_chaddr(&chaddr16(mac2)).unwrap().expires, NOW + 600);
}

#[test]
fn exhausted_pool_stays_silent() {
    let cfg = server_cfg();
    let mut table = LeaseTable::new(4);
    for (i, last) in (20u8..=22).enumerate() {
        let mut mac = MAC;
        mac[5] = 0x10 + i as u8;
        table
            .add(chaddr16(mac), Ipv4Addr::new(192, 168, 0, last), 600, NOW)
            .unwrap();
    }
    assert!(exchange(
        &cfg,
        &mut table,
        &AssumeFree,
        &client_frame(MessageType::Discover, MAC)
    )
    .is_none());
}

struct Taken(Ipv4Addr);

impl ArpProbe for Taken {
    fn probe(&self, target: Ipv4Addr, _: Ipv4Addr, _: [u8; 6], _: u32) -> Probe {
        if target == self.0 {
            Probe::Taken
        } else {
            Probe::Free
        }
    }
}

#[test]
fn conflicted_address_is_skipped_and_reserved() {
    let cfg = server_cfg();
    let mut table = LeaseTable::new(4);
    let probe = Taken(Ipv4Addr::new(192, 168, 0, 20));

    let (offer, _) = exchange(
        &cfg,
        &mut table,
        &probe,
        &client_frame(MessageType::Discover, MAC),
    )
    .expect("the rest of the pool is free");
    assert_eq!(offer.yiaddr(), Ipv4Addr::new(192, 168, 0, 21));

    let conflict = *table
        .find_by_yiaddr(Ipv4Addr::new(192, 168, 0, 20))
        .unwrap();
    assert_eq!(conflict.chaddr, BLANK_CHADDR);
    assert_eq!(conflict.expires, NOW + 3600);
}

#[test]
fn inform_gets_configuration_only() {
    let cfg = server_cfg();
    let mut table = LeaseTable::new(4);

    let mut inform = client_frame(MessageType::Inform, MAC);
    inform.set_ciaddr(Ipv4Addr::new(192, 168, 0, 77));
    let (reply, route) = exchange(&cfg, &mut table, &AssumeFree, &inform).expect("INFORM deserves a reply");
    assert_eq!(
        reply.opts().get(OptionCode::MessageType),
        Some(&DhcpOption::MessageType(MessageType::Ack))
    );
    assert_eq!(reply.yiaddr(), Ipv4Addr::UNSPECIFIED);
    assert_eq!(reply.opts().get(OptionCode::AddressLeaseTime), None);
    assert_eq!(
        reply.opts().get(OptionCode::SubnetMask),
        Some(&DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)))
    );
    assert_eq!(route, Route::Unicast(Ipv4Addr::new(192, 168, 0, 77)));
    assert_eq!(table.iter().count(), 0);
}

#[test]
fn bindings_survive_a_restart() {
    let cfg = server_cfg();
    let dir = tempfile::tempdir().unwrap();
    let lease_file = dir.path().join("leases");

    let mut table = LeaseTable::new(4);
    let (offer, _) = exchange(
        &cfg,
        &mut table,
        &AssumeFree,
        &client_frame(MessageType::Discover, MAC),
    )
    .unwrap();
    let mut request = client_frame(MessageType::Request, MAC);
    request
        .opts_mut()
        .insert(DhcpOption::RequestedIpAddress(offer.yiaddr()));
    request
        .opts_mut()
        .insert(DhcpOption::ServerIdentifier(SERVER_IP));
    exchange(&cfg, &mut table, &AssumeFree, &request).unwrap();
    table.save(&lease_file, cfg.remaining, NOW).unwrap();

    // restart: a fresh table rehydrated from disk
    let mut table = LeaseTable::new(4);
    table.load(&lease_file, &cfg, NOW).unwrap();

    // a renewing DISCOVER gets its old address back
    let (offer, _) = exchange(
        &cfg,
        &mut table,
        &AssumeFree,
        &client_frame(MessageType::Discover, MAC),
    )
    .unwrap();
    assert_eq!(offer.yiaddr(), Ipv4Addr::new(192, 168, 0, 20));
}
