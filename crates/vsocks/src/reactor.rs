//! Single-threaded cycle: sweep, build readiness, wait, dispatch, sweep
//! again (§4.H).

use tracing::{error, info};

use crate::addr::Address;
use crate::error::{Error, ReadinessError};
use crate::pool::{Pool, SlotId, POOL_CAPACITY};
use crate::readiness::{EventSet, PollBackend, Readiness};
use crate::relation::{self, accept_new_stream, drive_forwarding};
use crate::socket;
use crate::socks5;
use crate::stream::{Level, Role, Stream};

#[cfg(target_os = "linux")]
use crate::readiness::EpollBackend;

/// Readiness wait timeout (§5): the only suspension point in the reactor.
const WAIT_TIMEOUT_MS: i32 = 16_000;

enum Backend<const N: usize> {
    Poll(PollBackend<N>),
    #[cfg(target_os = "linux")]
    Epoll(EpollBackend<N>),
}

impl<const N: usize> Backend<N> {
    fn build() -> Result<Self, ReadinessError> {
        #[cfg(target_os = "linux")]
        {
            match EpollBackend::new() {
                Ok(backend) => return Ok(Backend::Epoll(backend)),
                Err(err) => {
                    tracing::warn!(?err, "epoll unavailable, falling back to poll");
                }
            }
        }
        Ok(Backend::Poll(PollBackend::new()))
    }
}

impl<const N: usize> Readiness<N> for Backend<N> {
    fn wait(&mut self, pool: &mut Pool<Stream, N>, timeout_ms: i32) -> Result<usize, ReadinessError> {
        match self {
            Backend::Poll(b) => b.wait(pool, timeout_ms),
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.wait(pool, timeout_ms),
        }
    }

    fn forget(&mut self, id: SlotId) {
        match self {
            Backend::Poll(b) => b.forget(id),
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.forget(id),
        }
    }
}

pub struct Reactor<const N: usize = POOL_CAPACITY> {
    pool: Pool<Stream, N>,
    backend: Backend<N>,
    upstream: Address,
}

impl<const N: usize> Reactor<N> {
    pub fn new(listen_addr: Address, upstream: Address) -> Result<Self, Error> {
        let listen_fd = socket::listen_socket(listen_addr).map_err(Error::Bind)?;
        let mut pool = Pool::new();
        pool.insert(Stream::listen(listen_fd))
            .unwrap_or_else(|_| unreachable!("listen stream is the first insertion into an empty pool"));
        let backend = Backend::build()?;
        info!(%listen_addr, %upstream, "listening");
        Ok(Self { pool, backend, upstream })
    }

    /// Runs the reactor loop until either a fatal error occurs or
    /// `shutdown` is observed set, checked once per cycle (so the loop
    /// notices termination signals within one `WAIT_TIMEOUT_MS` window at
    /// worst, since that is the only blocking point).
    pub fn run(&mut self, shutdown: &std::sync::atomic::AtomicBool) -> Result<(), Error> {
        use std::sync::atomic::Ordering;

        while !shutdown.load(Ordering::Relaxed) {
            relation::cleanup_streams(&mut self.pool);

            let nfds = self.backend.wait(&mut self.pool, WAIT_TIMEOUT_MS)?;
            if nfds == 0 {
                relation::remove_pending_streams(&mut self.pool);
                relation::cleanup_streams(&mut self.pool);
                continue;
            }

            let ready: Vec<SlotId> = self
                .pool
                .iter()
                .filter(|(_, s)| !s.abandoned && !s.returned_events.is_empty())
                .map(|(id, _)| id)
                .collect();

            for id in ready {
                self.dispatch(id);
            }
        }
        info!("shutdown signal observed, exiting cleanly");
        Ok(())
    }

    fn dispatch(&mut self, id: SlotId) {
        let Some(stream) = self.pool.get(id) else { return };
        let (returned_events, level, role, fd, peer) =
            (stream.returned_events, stream.level, stream.role, stream.fd, stream.peer);

        if returned_events.intersects(EventSet::ERROR | EventSet::HANGUP) {
            relation::remove_relation(&mut self.pool, id);
            return;
        }

        match level {
            Level::Forwarding => drive_forwarding(&mut self.pool, id),
            _ => match role {
                Role::Listen => accept_new_stream(&mut self.pool, fd, self.upstream),
                Role::UpstreamSide => {
                    let Some(peer) = peer else {
                        relation::remove_relation(&mut self.pool, id);
                        return;
                    };
                    if let Err(err) = socks5::advance(&mut self.pool, peer, id) {
                        tracing::warn!(?err, "handshake abandoned");
                        relation::remove_relation(&mut self.pool, id);
                    }
                }
                Role::ClientSide => {
                    // The client side stays silent (requested_events = ∅)
                    // until its peer reaches FORWARDING; a ready event
                    // here outside FORWARDING is a protocol violation.
                    relation::remove_relation(&mut self.pool, id);
                }
            },
        }
    }
}

impl<const N: usize> Drop for Reactor<N> {
    fn drop(&mut self) {
        let ids: Vec<SlotId> = self.pool.iter().map(|(id, _)| id).collect();
        for id in ids {
            if let Some(stream) = self.pool.get(id) {
                self.backend.forget(id);
                socket::shutdown_then_close(stream.fd);
            }
        }
        error!("reactor shut down");
    }
}
