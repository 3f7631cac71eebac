//! The `dhcpd4` daemon.

use dhcpd4::arp::AssumeFree;
use dhcpd4::config::ServerConfig;
use dhcpd4::leases::LeaseTable;
use dhcpd4::pidfile;
use dhcpd4::server::Server;
use dhcpd4::unix_now;
use log::{error, info, warn};
use std::path::Path;
use std::process::ExitCode;

const DEFAULT_CONFIG: &str = "/etc/dhcpd4.conf";

fn usage() {
    eprintln!("usage: dhcpd4 [-v]... [CONFIG]");
    eprintln!("  -v  increase log verbosity (repeatable)");
    eprintln!("  CONFIG defaults to {DEFAULT_CONFIG}");
}

fn main() -> ExitCode {
    let mut verbosity: usize = 2;
    let mut config_path: String = DEFAULT_CONFIG.to_string();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-v" => verbosity += 1,
            "-h" | "--help" => {
                usage();
                return ExitCode::SUCCESS;
            }
            flag if flag.starts_with('-') => {
                usage();
                return ExitCode::FAILURE;
            }
            path => config_path = path.to_string(),
        }
    }

    if stderrlog::new().verbosity(verbosity).init().is_err() {
        eprintln!("unable to install the logger");
        return ExitCode::FAILURE;
    }
    info!("dhcpd4 (v{}) started", env!("CARGO_PKG_VERSION"));

    let mut cfg = match ServerConfig::load(Path::new(&config_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = cfg.probe_interface() {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    let mut leases = LeaseTable::new(cfg.max_leases);
    match leases.load(&cfg.lease_file, &cfg, unix_now()) {
        Ok(n) => info!("restored {n} leases from {}", cfg.lease_file.display()),
        Err(e) => warn!("unable to read {}: {e}", cfg.lease_file.display()),
    }

    let pidfile_path = cfg.pidfile.clone();
    if let Err(e) = pidfile::write(&pidfile_path) {
        warn!("unable to write {}: {e}", pidfile_path.display());
    }

    let rc = match Server::new(cfg, leases, Box::new(AssumeFree)) {
        Ok(mut server) => match server.run() {
            Ok(()) => {
                server.flush_now();
                info!("exiting");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("FATAL: couldn't create server socket, {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            error!("FATAL: couldn't set up signal handling, {e}");
            ExitCode::FAILURE
        }
    };
    pidfile::remove(&pidfile_path);
    rc
}
