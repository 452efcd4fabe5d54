//! Relation lifecycle: accept, pair, forwarding, abandonment, sweep and
//! forced eviction (§4.G).

use std::os::fd::RawFd;

use tracing::{debug, warn};

use crate::addr::Address;
use crate::pool::{Pool, SlotId};
use crate::readiness::EventSet;
use crate::socket::{self, ForwardOutcome};
use crate::stream::{Level, Role, Stream};

/// Accepts one new client connection on the listen stream, pairs it with
/// a fresh async connect to `upstream`, and cross-links both sides. Each
/// of the two insertions is retried once after forced eviction if the
/// pool was full; a second failure drops the accept rather than erroring
/// out the reactor.
pub fn accept_new_stream<const N: usize>(pool: &mut Pool<Stream, N>, listen_fd: RawFd, upstream: Address) {
    let Some(client_fd) = accept_one(listen_fd) else { return };

    if let Err(err) = socket::set_nonblocking(client_fd) {
        warn!(?err, "failed to set accepted socket non-blocking");
        socket::shutdown_then_close(client_fd);
        return;
    }

    let Some(a) = insert_evicting(pool, Stream::new(Role::ClientSide, client_fd), None) else {
        warn!("stream pool exhausted, dropping accepted connection");
        socket::shutdown_then_close(client_fd);
        return;
    };
    if let Some(stream) = pool.get_mut(a) {
        stream.level = Level::Awaiting;
        stream.requested_events = EventSet::empty();
    }

    let upstream_fd = match socket::connect_async(upstream) {
        Ok(fd) => fd,
        Err(err) => {
            warn!(?err, "connect to upstream relay failed");
            remove_stream(pool, a);
            return;
        }
    };

    let Some(b) = insert_evicting(pool, Stream::new(Role::UpstreamSide, upstream_fd), Some(a)) else {
        warn!("stream pool exhausted, dropping paired upstream connection");
        socket::shutdown_then_close(upstream_fd);
        remove_stream(pool, a);
        return;
    };

    if let Some(stream) = pool.get_mut(a) {
        stream.peer = Some(b);
    }
    if let Some(stream) = pool.get_mut(b) {
        stream.peer = Some(a);
        stream.level = Level::Connecting;
        stream.requested_events = EventSet::READABLE | EventSet::WRITABLE;
    }
    debug!(a = a.index(), b = b.index(), "accepted and paired new relation");
}

fn accept_one(listen_fd: RawFd) -> Option<RawFd> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let fd = unsafe { libc::accept(listen_fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if fd < 0 {
        return None;
    }
    Some(fd)
}

/// Inserts `stream`, running `force_cleanup` and retrying exactly once if
/// the arena was full.
fn insert_evicting<const N: usize>(
    pool: &mut Pool<Stream, N>,
    stream: Stream,
    excluding: Option<SlotId>,
) -> Option<SlotId> {
    match pool.insert(stream) {
        Ok(id) => Some(id),
        Err(stream) => {
            force_cleanup(pool, excluding);
            pool.insert(stream).ok()
        }
    }
}

/// Removes a stream outright: closes its fd and frees the slot. Used only
/// on paths where the relation never fully formed (no peer yet).
fn remove_stream<const N: usize>(pool: &mut Pool<Stream, N>, id: SlotId) {
    if let Some(stream) = pool.remove(id) {
        socket::shutdown_then_close(stream.fd);
    }
}

/// Marks both sides of a relation abandoned without freeing them; actual
/// freeing happens in the next `cleanup_streams` sweep.
pub fn remove_relation<const N: usize>(pool: &mut Pool<Stream, N>, id: SlotId) {
    let peer = pool.get(id).and_then(|s| s.peer);
    if let Some(stream) = pool.get_mut(id) {
        stream.abandoned = true;
        stream.requested_events = EventSet::empty();
    }
    if let Some(peer_id) = peer {
        if let Some(stream) = pool.get_mut(peer_id) {
            stream.abandoned = true;
            stream.requested_events = EventSet::empty();
        }
    }
}

/// Frees every slot marked abandoned. Run at the top of every reactor
/// cycle and after timeout-triggered pruning.
pub fn cleanup_streams<const N: usize>(pool: &mut Pool<Stream, N>) {
    let abandoned: Vec<SlotId> = pool.iter().filter(|(_, s)| s.abandoned).map(|(id, _)| id).collect();
    for id in abandoned {
        remove_stream(pool, id);
    }
}

/// Called when the readiness wait timed out: every non-listen stream not
/// yet forwarding is considered stalled and abandoned.
pub fn remove_pending_streams<const N: usize>(pool: &mut Pool<Stream, N>) {
    let pending: Vec<SlotId> = pool
        .iter()
        .filter(|(_, s)| s.role != Role::Listen && s.level != Level::Forwarding)
        .map(|(id, _)| id)
        .collect();
    for id in pending {
        remove_relation(pool, id);
    }
}

/// Evicts one stream to make room for a new relation: oldest-first pass
/// over already-abandoned streams, falling back to the oldest non-listen
/// stream if none are abandoned. `excluding` (the relation currently being
/// built) is never evicted.
///
/// `Pool::insert` links new entries at `tail`, so `head`/`iter()` walks
/// oldest-first (see `Pool::oldest`) — both passes below must use that
/// order, not `iter_rev()`, or the *newest* candidate would be evicted
/// instead of the oldest one the LRU-by-insertion policy requires.
pub fn force_cleanup<const N: usize>(pool: &mut Pool<Stream, N>, excluding: Option<SlotId>) {
    let victim = pool
        .iter()
        .find(|(id, s)| Some(*id) != excluding && s.abandoned)
        .map(|(id, _)| id)
        .or_else(|| {
            pool.iter()
                .find(|(id, s)| Some(*id) != excluding && s.role != Role::Listen)
                .map(|(id, _)| id)
        });

    if let Some(id) = victim {
        remove_relation(pool, id);
        cleanup_streams(pool);
    }
}

/// Applies the forwarding gating rule for a stream reported ready while
/// its relation is in `Forwarding` (§4.G). Alternates clearing/setting R
/// and W across the pair so a single in-flight chunk drives natural
/// backpressure.
pub fn drive_forwarding<const N: usize>(pool: &mut Pool<Stream, N>, s: SlotId) {
    let Some(peer) = pool.get(s).and_then(|stream| stream.peer) else {
        remove_relation(pool, s);
        return;
    };
    let Some(stream) = pool.get(s) else { return };
    let returned = stream.returned_events;
    let fd = stream.fd;
    let peer_fd = match pool.get(peer) {
        Some(p) => p.fd,
        None => {
            remove_relation(pool, s);
            return;
        }
    };

    if returned.contains(EventSet::WRITABLE) {
        match socket::forward_chunk(peer_fd, fd) {
            Ok(ForwardOutcome::Moved(_)) | Ok(ForwardOutcome::Backpressure) => {}
            Err(_) => {
                remove_relation(pool, s);
                return;
            }
        }
        if let Some(stream) = pool.get_mut(s) {
            stream.requested_events.remove(EventSet::WRITABLE);
        }
        if let Some(peer_stream) = pool.get_mut(peer) {
            peer_stream.requested_events.insert(EventSet::READABLE);
        }
    } else if returned.contains(EventSet::READABLE) {
        if let Some(stream) = pool.get_mut(s) {
            stream.requested_events.remove(EventSet::READABLE);
        }
        if let Some(peer_stream) = pool.get_mut(peer) {
            peer_stream.requested_events.insert(EventSet::WRITABLE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_pool() -> (Pool<Stream, 8>, SlotId, SlotId) {
        let mut pool: Pool<Stream, 8> = Pool::new();
        let a = pool.insert(Stream::new(Role::ClientSide, 10)).unwrap();
        let b = pool.insert(Stream::new(Role::UpstreamSide, 11)).unwrap();
        pool.get_mut(a).unwrap().peer = Some(b);
        pool.get_mut(b).unwrap().peer = Some(a);
        pool.get_mut(a).unwrap().level = Level::Forwarding;
        pool.get_mut(b).unwrap().level = Level::Forwarding;
        (pool, a, b)
    }

    #[test]
    fn remove_relation_marks_both_sides_abandoned() {
        let (mut pool, a, b) = paired_pool();
        remove_relation(&mut pool, a);
        assert!(pool.get(a).unwrap().abandoned);
        assert!(pool.get(b).unwrap().abandoned);
    }

    #[test]
    fn cleanup_frees_abandoned_slots() {
        let (mut pool, a, _b) = paired_pool();
        remove_relation(&mut pool, a);
        cleanup_streams(&mut pool);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn force_cleanup_never_evicts_excluded_slot() {
        let mut pool: Pool<Stream, 2> = Pool::new();
        let a = pool.insert(Stream::new(Role::ClientSide, 10)).unwrap();
        force_cleanup(&mut pool, Some(a));
        assert!(pool.contains(a));
    }

    #[test]
    fn force_cleanup_prefers_abandoned_over_oldest() {
        let mut pool: Pool<Stream, 8> = Pool::new();
        let a = pool.insert(Stream::new(Role::ClientSide, 10)).unwrap();
        let b = pool.insert(Stream::new(Role::ClientSide, 11)).unwrap();
        pool.get_mut(b).unwrap().abandoned = true;
        force_cleanup(&mut pool, None);
        assert!(pool.contains(a));
        assert!(!pool.contains(b));
    }

    #[test]
    fn remove_pending_streams_spares_forwarding_relations() {
        let (mut pool, a, b) = paired_pool();
        remove_pending_streams(&mut pool);
        assert!(!pool.get(a).unwrap().abandoned);
        assert!(!pool.get(b).unwrap().abandoned);
    }

    #[test]
    fn remove_pending_streams_reaps_stalled_handshake() {
        let mut pool: Pool<Stream, 8> = Pool::new();
        let a = pool.insert(Stream::new(Role::ClientSide, 10)).unwrap();
        pool.get_mut(a).unwrap().level = Level::Awaiting;
        remove_pending_streams(&mut pool);
        assert!(pool.get(a).unwrap().abandoned);
    }

    #[test]
    fn force_cleanup_pass_two_evicts_oldest_of_several_live_candidates() {
        let mut pool: Pool<Stream, 8> = Pool::new();
        let a = pool.insert(Stream::new(Role::ClientSide, 10)).unwrap();
        let b = pool.insert(Stream::new(Role::ClientSide, 11)).unwrap();
        let c = pool.insert(Stream::new(Role::ClientSide, 12)).unwrap();
        force_cleanup(&mut pool, None);
        assert!(!pool.contains(a), "oldest live stream should be evicted, not a newer one");
        assert!(pool.contains(b));
        assert!(pool.contains(c));
    }
}
