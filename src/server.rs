//! The event loop.
//!
//! Strictly single-threaded: one readiness wait over the server socket and
//! the read end of a self-pipe, with a soft deadline for the periodic
//! lease-table flush. Signal handlers do exactly one thing (write a byte
//! to the pipe), so every semantic action runs in normal context.

use crate::arp::ArpProbe;
use crate::config::ServerConfig;
use crate::handler::{self, Route};
use crate::leases::LeaseTable;
use crate::pkt::Message;
use crate::{unix_now, CLIENT_PORT, SERVER_PORT};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use signal_hook::consts::{SIGTERM, SIGUSR1};
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The server: configuration, lease table and the descriptors the loop
/// waits on.
pub struct Server {
    cfg: ServerConfig,
    leases: LeaseTable,
    probe: Box<dyn ArpProbe>,
    socket: Option<UdpSocket>,
    sig_rx: UnixStream,
    flush_requested: Arc<AtomicBool>,
    term_requested: Arc<AtomicBool>,
}

impl Server {
    /// Set up the signal bridge and wrap the server state.
    ///
    /// The socket is created lazily by [`run`](Self::run) so that a
    /// transient bind failure and a runtime socket error share one
    /// recovery path.
    pub fn new(
        cfg: ServerConfig,
        leases: LeaseTable,
        probe: Box<dyn ArpProbe>,
    ) -> io::Result<Self> {
        let (sig_rx, sig_tx) = UnixStream::pair()?;
        sig_rx.set_nonblocking(true)?;
        sig_tx.set_nonblocking(true)?;

        let flush_requested = Arc::new(AtomicBool::new(false));
        let term_requested = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGUSR1, Arc::clone(&flush_requested))?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&term_requested))?;
        signal_hook::low_level::pipe::register(SIGUSR1, sig_tx.try_clone()?)?;
        signal_hook::low_level::pipe::register(SIGTERM, sig_tx)?;

        Ok(Self {
            cfg,
            leases,
            probe,
            socket: None,
            sig_rx,
            flush_requested,
            term_requested,
        })
    }

    /// Run until SIGTERM.
    ///
    /// Returns `Err` only when the listening socket cannot be created at
    /// all; read and send errors recreate the socket and carry on.
    pub fn run(&mut self) -> io::Result<()> {
        let mut next_flush: u64 = unix_now().saturating_add(u64::from(self.cfg.auto_time));
        let mut buf: [u8; 1500] = [0; 1500];

        loop {
            if self.socket.is_none() {
                self.socket = Some(listen_socket(&self.cfg)?);
            }

            let now = unix_now();
            if self.cfg.auto_time != 0 && now >= next_flush {
                self.flush_leases(now);
                next_flush = now.saturating_add(u64::from(self.cfg.auto_time));
                continue;
            }
            let timeout: PollTimeout = if self.cfg.auto_time == 0 {
                PollTimeout::NONE
            } else {
                let ms = next_flush
                    .saturating_sub(now)
                    .saturating_mul(1000)
                    .min(i32::MAX as u64) as i32;
                PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
            };

            let (socket_ready, signal_ready) = {
                let Some(socket) = self.socket.as_ref() else {
                    continue;
                };
                let mut fds = [
                    PollFd::new(socket.as_fd(), PollFlags::POLLIN),
                    PollFd::new(self.sig_rx.as_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, timeout) {
                    Ok(0) => {
                        let now = unix_now();
                        self.flush_leases(now);
                        next_flush = now.saturating_add(u64::from(self.cfg.auto_time));
                        continue;
                    }
                    Ok(_) => (
                        fds[0].any().unwrap_or(false),
                        fds[1].any().unwrap_or(false),
                    ),
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        debug!("error on poll: {e}");
                        continue;
                    }
                }
            };

            // signals first; the datagram stays queued for the next pass
            if signal_ready {
                self.drain_signal_pipe();
                if self.term_requested.swap(false, Ordering::SeqCst) {
                    info!("received SIGTERM");
                    return Ok(());
                }
                if self.flush_requested.swap(false, Ordering::SeqCst) {
                    info!("received SIGUSR1");
                    let now = unix_now();
                    self.flush_leases(now);
                    next_flush = now.saturating_add(u64::from(self.cfg.auto_time));
                }
                continue;
            }
            if !socket_ready {
                continue;
            }

            let len = {
                let Some(socket) = self.socket.as_ref() else {
                    continue;
                };
                match socket.recv_from(&mut buf) {
                    Ok((len, _)) => len,
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted =>
                    {
                        continue;
                    }
                    Err(e) => {
                        debug!("error on read: {e}, reopening socket");
                        self.socket = None;
                        continue;
                    }
                }
            };

            let msg = match Message::parse(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("dropping datagram: {e}");
                    continue;
                }
            };

            let now = unix_now();
            if let Some(reply) =
                handler::handle(&self.cfg, &mut self.leases, self.probe.as_ref(), &msg, now)
            {
                self.send_reply(&reply);
            }
        }
    }

    fn send_reply(&mut self, reply: &handler::Reply) {
        let dst: SocketAddrV4 = match reply.route {
            Route::Relay(ip) => SocketAddrV4::new(ip, SERVER_PORT),
            Route::Unicast(ip) => SocketAddrV4::new(ip, CLIENT_PORT),
            Route::Broadcast => SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT),
        };
        let frame = reply.msg.serialize();
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        if let Err(e) = socket.send_to(&frame, dst) {
            warn!("error sending to {dst}: {e}, reopening socket");
            self.socket = None;
        }
    }

    /// Checkpoint the lease table and run the notify hook.
    fn flush_leases(&self, now: u64) {
        debug!("writing {}", self.cfg.lease_file.display());
        if let Err(e) = self.leases.save(&self.cfg.lease_file, self.cfg.remaining, now) {
            error!("unable to write {}: {e}", self.cfg.lease_file.display());
            return;
        }
        if let Some(notify) = &self.cfg.notify_file {
            match Command::new(notify).arg(&self.cfg.lease_file).status() {
                Ok(status) if !status.success() => {
                    warn!("{} exited with {status}", notify.display());
                }
                Ok(_) => (),
                Err(e) => warn!("unable to run {}: {e}", notify.display()),
            }
        }
    }

    fn drain_signal_pipe(&mut self) {
        let mut scratch: [u8; 64] = [0; 64];
        while matches!(self.sig_rx.read(&mut scratch), Ok(n) if n > 0) {}
    }

    /// Checkpoint once, outside the loop.
    ///
    /// Called on clean shutdown so a TERM delivered between flush
    /// intervals does not lose recent bindings.
    pub fn flush_now(&self) {
        self.flush_leases(unix_now());
    }
}

/// Create the listening socket: broadcast-capable UDP on the server port,
/// bound to the configured interface.
fn listen_socket(cfg: &ServerConfig) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    if !cfg.interface.is_empty() {
        socket.bind_device(Some(cfg.interface.as_bytes()))?;
    }
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SERVER_PORT).into())?;
    socket.set_nonblocking(true)?;
    info!(
        "listening on {}:{} ({})",
        cfg.server_ip, SERVER_PORT, cfg.interface
    );
    Ok(socket.into())
}
