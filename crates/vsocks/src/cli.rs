//! `clap`-derived argument parsing and process-entry ambient stack (§4.J).

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::addr::{self, Address};
use crate::error::AddrError;

#[derive(Parser, Debug)]
#[command(name = "vsocks", version, about = "Transparent TCP proxy relaying redirected connections through an upstream SOCKS5 server")]
pub struct Args {
    /// Raise logging verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Daemonize after startup (seam only; this platform layer does not
    /// fork/setsid on its own).
    #[arg(short, long)]
    pub daemonize: bool,

    /// Address the proxy listens on, e.g. `0.0.0.0:1080` or `[::]:1080`.
    pub listen_addr: String,

    /// Upstream SOCKS5 relay address, e.g. `127.0.0.1:1081`.
    pub socks5_addr: String,
}

impl Args {
    pub fn listen_address(&self) -> Result<Address, AddrError> {
        addr::decode(&self.listen_addr)
    }

    pub fn socks5_address(&self) -> Result<Address, AddrError> {
        addr::decode(&self.socks5_addr)
    }

    fn filter_directive(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Initializes the global `tracing` subscriber at a level derived from
/// repeated `-v` flags.
pub fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.filter_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Daemonization seam. Out of scope per the full spec's Non-goals beyond
/// this named stub: a real platform layer would `fork`/`setsid` here.
pub fn daemonize() {
    tracing::debug!("daemonize requested but not implemented on this platform layer");
}
