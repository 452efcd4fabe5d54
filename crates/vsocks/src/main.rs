use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use tracing::error;

use vsocks::cli::{self, Args};
use vsocks::reactor::Reactor;

fn main() -> ExitCode {
    let args = Args::parse();
    cli::init_logging(&args);

    if args.daemonize {
        cli::daemonize();
    }

    let listen_addr = match args.listen_address() {
        Ok(addr) => addr,
        Err(err) => {
            error!(%err, "invalid listen address");
            return ExitCode::FAILURE;
        }
    };
    let socks5_addr = match args.socks5_address() {
        Ok(addr) => addr,
        Err(err) => {
            error!(%err, "invalid socks5 address");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            error!(%err, signal, "failed to install signal handler");
            return ExitCode::FAILURE;
        }
    }

    let mut reactor: Reactor = match Reactor::new(listen_addr, socks5_addr) {
        Ok(reactor) => reactor,
        Err(err) => {
            error!(%err, "failed to start reactor");
            return ExitCode::FAILURE;
        }
    };

    match reactor.run(&shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "reactor exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}
