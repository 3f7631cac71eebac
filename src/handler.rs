//! The per-message state machine.
//!
//! One inbound message plus the current table state produce at most one
//! reply and a handful of table mutations. The client's state (SELECTING,
//! INIT-REBOOT, RENEWING/REBINDING) is inferred from which of `server-id`,
//! `requested-ip` and `ciaddr` it filled in, per RFC 2131 section 4.3.2.

use crate::arp::ArpProbe;
use crate::config::ServerConfig;
use crate::leases::{self, Lease, LeaseTable};
use crate::options::{DHCP_LEASE_TIME, DHCP_MESSAGE_TYPE, DHCP_REQUESTED_IP, DHCP_SERVER_ID};
use crate::pkt::{Message, MsgType, Op, HLEN_ETHERNET, HTYPE_ETHERNET};
use log::{debug, info, warn};
use std::net::Ipv4Addr;

/// Where the event loop should send a reply.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Route {
    /// Through the relay agent, server port.
    Relay(Ipv4Addr),
    /// Directly to the client's current address, client port.
    Unicast(Ipv4Addr),
    /// To the local broadcast address, client port.
    Broadcast,
}

/// A reply and its destination.
#[derive(Debug)]
pub struct Reply {
    /// The outbound message.
    pub msg: Message,
    /// Destination selection per the inbound message's fields.
    pub route: Route,
}

/// Process one inbound message.
///
/// Returns `None` when the protocol calls for silence; every drop is
/// logged. `now` is the wall clock in seconds since the epoch, sampled
/// once per datagram by the event loop.
pub fn handle(
    cfg: &ServerConfig,
    table: &mut LeaseTable,
    probe: &dyn ArpProbe,
    msg: &Message,
    now: u64,
) -> Option<Reply> {
    if msg.op != u8::from(Op::BootRequest) {
        debug!("not a BOOTREQUEST, ignoring");
        return None;
    }
    let Some(msg_type) = msg.msg_type() else {
        debug!("couldn't get message type from packet, ignoring");
        return None;
    };
    let lease: Option<Lease> = table.find_by_chaddr(&msg.chaddr).copied();

    match msg_type {
        MsgType::Discover => {
            debug!("received DISCOVER");
            discover(cfg, table, probe, msg, lease, now)
        }
        MsgType::Request => {
            debug!("received REQUEST");
            request(cfg, table, msg, lease, now)
        }
        MsgType::Decline => {
            debug!("received DECLINE");
            if let Some(slot) = table.find_by_chaddr_mut(&msg.chaddr) {
                info!("{} declined by its owner, quarantining", slot.yiaddr);
                slot.chaddr = [0; 16];
                slot.expires = now.saturating_add(u64::from(cfg.decline_time));
            }
            None
        }
        MsgType::Release => {
            debug!("received RELEASE");
            if let Some(slot) = table.find_by_chaddr_mut(&msg.chaddr) {
                info!("released {}", slot.yiaddr);
                slot.expires = now;
            }
            None
        }
        MsgType::Inform => {
            debug!("received INFORM");
            Some(inform(cfg, msg))
        }
        other => {
            warn!("unsupported DHCP message type {other:?}, ignoring");
            None
        }
    }
}

fn discover(
    cfg: &ServerConfig,
    table: &mut LeaseTable,
    probe: &dyn ArpProbe,
    msg: &Message,
    lease: Option<Lease>,
    now: u64,
) -> Option<Reply> {
    let requested = msg
        .option_ipv4(DHCP_REQUESTED_IP)
        .filter(|req| cfg.in_pool(*req) && requestable(table, *req, &msg.chaddr, now));

    let yiaddr: Ipv4Addr = if let Some(req) = requested {
        req
    } else if let Some(lease) = lease {
        lease.yiaddr
    } else {
        match leases::find_address(table, cfg, probe, false, now)
            .or_else(|| leases::find_address(table, cfg, probe, true, now))
        {
            Some(addr) => addr,
            None => {
                warn!("no IP addresses to give, OFFER abandoned");
                return None;
            }
        }
    };

    // hold the address until the REQUEST arrives so a concurrent DISCOVER
    // cannot race onto it
    if table
        .add(msg.chaddr, yiaddr, u64::from(cfg.offer_time), now)
        .is_none()
    {
        warn!("lease table is full, OFFER abandoned");
        return None;
    }

    info!("sending OFFER of {yiaddr}");
    let mut reply = reply_template(cfg, msg, MsgType::Offer);
    reply.yiaddr = yiaddr;
    fill_bootp(cfg, &mut reply);
    reply
        .options
        .insert(DHCP_LEASE_TIME, &granted_lease(cfg, msg).to_be_bytes());
    append_config_options(cfg, &mut reply);
    Some(Reply {
        msg: reply,
        route: route(msg, false),
    })
}

/// True when `req` can be offered to `chaddr`: nobody holds it, its holder
/// has lapsed, or the holder is this very client.
fn requestable(table: &LeaseTable, req: Ipv4Addr, chaddr: &[u8; 16], now: u64) -> bool {
    match table.find_by_yiaddr(req) {
        None => true,
        Some(holder) => &holder.chaddr == chaddr || holder.expired(now),
    }
}

fn request(
    cfg: &ServerConfig,
    table: &mut LeaseTable,
    msg: &Message,
    lease: Option<Lease>,
    now: u64,
) -> Option<Reply> {
    let requested = msg.option_ipv4(DHCP_REQUESTED_IP);
    let server_id = msg.option_ipv4(DHCP_SERVER_ID);

    if let Some(lease) = lease {
        if let Some(sid) = server_id {
            // SELECTING
            if sid == cfg.server_ip && requested == Some(lease.yiaddr) {
                return Some(ack(cfg, table, msg, lease.yiaddr, now));
            }
            debug!("client chose server {sid}, staying silent");
            None
        } else if let Some(req) = requested {
            // INIT-REBOOT
            if req == lease.yiaddr {
                Some(ack(cfg, table, msg, lease.yiaddr, now))
            } else {
                info!("client requested {req} but holds {}, NAKing", lease.yiaddr);
                Some(nak(cfg, msg))
            }
        } else {
            // RENEWING or REBINDING
            if msg.ciaddr == lease.yiaddr {
                Some(ack(cfg, table, msg, lease.yiaddr, now))
            } else {
                info!("renewal from {} does not match {}, NAKing", msg.ciaddr, lease.yiaddr);
                Some(nak(cfg, msg))
            }
        }
    } else if server_id.is_some() {
        // SELECTING a server we have no record of the client with
        debug!("REQUEST names a server id but we hold no lease, staying silent");
        None
    } else if let Some(req) = requested {
        // INIT-REBOOT from a client we have no record of
        if let Some(holder) = table.find_by_yiaddr_mut(req) {
            if holder.expired(now) {
                // the binding lapsed; free the address for contention
                holder.chaddr = [0; 16];
            } else {
                info!("{req} is held by another client, NAKing");
                return Some(nak(cfg, msg));
            }
            None
        } else if !cfg.in_pool(req) {
            info!("{req} is outside the pool, NAKing");
            Some(nak(cfg, msg))
        } else {
            None
        }
    } else {
        // RENEWING or REBINDING, but we know nothing about the client
        debug!("renewal from unknown client, staying silent");
        None
    }
}

fn ack(
    cfg: &ServerConfig,
    table: &mut LeaseTable,
    msg: &Message,
    yiaddr: Ipv4Addr,
    now: u64,
) -> Reply {
    let lease_secs = granted_lease(cfg, msg);
    if table
        .add(msg.chaddr, yiaddr, u64::from(lease_secs), now)
        .is_none()
    {
        warn!("lease table is full, {yiaddr} not recorded");
    }

    info!("sending ACK to {yiaddr}");
    let mut reply = reply_template(cfg, msg, MsgType::Ack);
    reply.yiaddr = yiaddr;
    fill_bootp(cfg, &mut reply);
    reply
        .options
        .insert(DHCP_LEASE_TIME, &lease_secs.to_be_bytes());
    append_config_options(cfg, &mut reply);
    Reply {
        msg: reply,
        route: route(msg, false),
    }
}

fn nak(cfg: &ServerConfig, msg: &Message) -> Reply {
    let reply = reply_template(cfg, msg, MsgType::Nak);
    Reply {
        msg: reply,
        route: route(msg, true),
    }
}

fn inform(cfg: &ServerConfig, msg: &Message) -> Reply {
    let mut reply = reply_template(cfg, msg, MsgType::Ack);
    fill_bootp(cfg, &mut reply);
    append_config_options(cfg, &mut reply);
    Reply {
        msg: reply,
        route: route(msg, false),
    }
}

/// The common shape of every reply: echoed client fields, our identity,
/// the message type.
fn reply_template(cfg: &ServerConfig, msg: &Message, msg_type: MsgType) -> Message {
    let mut reply = Message {
        op: Op::BootReply.into(),
        htype: HTYPE_ETHERNET,
        hlen: HLEN_ETHERNET,
        xid: msg.xid,
        flags: msg.flags,
        ciaddr: msg.ciaddr,
        giaddr: msg.giaddr,
        siaddr: cfg.siaddr,
        chaddr: msg.chaddr,
        ..Message::default()
    };
    reply
        .options
        .insert(DHCP_MESSAGE_TYPE, &[u8::from(msg_type)]);
    reply
        .options
        .insert(DHCP_SERVER_ID, &cfg.server_ip.octets());
    reply
}

/// Copy the configured `sname` and boot file into the BOOTP string fields.
fn fill_bootp(cfg: &ServerConfig, reply: &mut Message) {
    let sname = cfg.sname.as_bytes();
    let n = sname.len().min(reply.sname.len() - 1);
    reply.sname[..n].copy_from_slice(&sname[..n]);

    let file = cfg.boot_file.as_bytes();
    let n = file.len().min(reply.file.len() - 1);
    reply.file[..n].copy_from_slice(&file[..n]);
}

fn append_config_options(cfg: &ServerConfig, reply: &mut Message) {
    for (code, value) in cfg.options.iter() {
        reply.options.insert(code, value);
    }
}

/// The lease duration granted to this client.
///
/// The client may ask for less than the configured time; asking below the
/// floor gets the full configured time instead.
fn granted_lease(cfg: &ServerConfig, msg: &Message) -> u32 {
    match msg.option_u32(DHCP_LEASE_TIME) {
        Some(req) if req < cfg.min_lease => cfg.lease_secs,
        Some(req) => req.min(cfg.lease_secs),
        None => cfg.lease_secs,
    }
}

/// Destination selection, RFC 2131 section 4.1.
fn route(msg: &Message, force_broadcast: bool) -> Route {
    if !msg.giaddr.is_unspecified() {
        Route::Relay(msg.giaddr)
    } else if force_broadcast {
        Route::Broadcast
    } else if !msg.ciaddr.is_unspecified() {
        Route::Unicast(msg.ciaddr)
    } else {
        Route::Broadcast
    }
}
