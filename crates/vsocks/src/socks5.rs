//! SOCKS5 client state machine driven on the upstream-side stream of a
//! relation (§4.F). Only the subset this proxy needs: no-auth greeting and
//! a CONNECT request with a numeric address.

use thiserror::Error;

use crate::addr::Address;
use crate::error::{QueueError, Socks5Error, SocketError};
use crate::pool::{Pool, SlotId};
use crate::readiness::EventSet;
use crate::socket;
use crate::stream::{Level, Stream};

const GREETING: [u8; 3] = [0x05, 0x01, 0x00];
const ATYP_V4: u8 = 0x01;
const ATYP_V6: u8 = 0x04;

#[derive(Debug, Error)]
pub enum HandshakeFailure {
    #[error(transparent)]
    Protocol(#[from] Socks5Error),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Advances the upstream-side stream `b` by one step, given that it was
/// reported ready this cycle. `a` is its peer, needed in `VerSent` to
/// recover the original destination. No-ops outside the handshake states.
pub fn advance<const N: usize>(
    pool: &mut Pool<Stream, N>,
    a: SlotId,
    b: SlotId,
) -> Result<(), HandshakeFailure> {
    let level = pool.get(b).ok_or(Socks5Error::ProtocolViolation)?.level;
    match level {
        Level::Connecting => advance_connecting(pool, b),
        Level::VerSent => advance_ver_sent(pool, a, b),
        Level::ReqSent => advance_req_sent(pool, b),
        _ => Ok(()),
    }
}

/// Drains a handshake-state stream's outgoing queue if it is both
/// non-empty and writable, flipping to read-only interest once drained.
/// Shared by `VerSent` and `ReqSent`, which both sit in a "flush then
/// await reply" posture.
fn drain_if_ready<const N: usize>(pool: &mut Pool<Stream, N>, b: SlotId) -> Result<bool, HandshakeFailure> {
    let stream = pool.get_mut(b).ok_or(Socks5Error::ProtocolViolation)?;
    if stream.queue.is_empty() {
        return Ok(true);
    }
    if !stream.returned_events.contains(EventSet::WRITABLE) {
        return Ok(false);
    }
    stream.queue.drain_to(stream.fd)?;
    let drained = stream.queue.is_empty();
    if drained {
        stream.requested_events = EventSet::READABLE;
    }
    Ok(drained)
}

fn advance_connecting<const N: usize>(pool: &mut Pool<Stream, N>, b: SlotId) -> Result<(), HandshakeFailure> {
    let stream = pool.get(b).ok_or(Socks5Error::ProtocolViolation)?;
    if !stream.returned_events.contains(EventSet::WRITABLE) {
        return Ok(());
    }
    let fd = stream.fd;
    let failed = socket::socket_has_error(fd).map_err(SocketError::Transport)?;
    if failed {
        return Err(SocketError::Transport(std::io::Error::new(std::io::ErrorKind::Other, "connect failed")).into());
    }

    let stream = pool.get_mut(b).ok_or(Socks5Error::ProtocolViolation)?;
    stream.queue.set(&GREETING)?;
    stream.requested_events = EventSet::WRITABLE;
    stream.level = Level::VerSent;
    Ok(())
}

fn advance_ver_sent<const N: usize>(
    pool: &mut Pool<Stream, N>,
    a: SlotId,
    b: SlotId,
) -> Result<(), HandshakeFailure> {
    if !drain_if_ready(pool, b)? {
        return Ok(());
    }

    let stream = pool.get(b).ok_or(Socks5Error::ProtocolViolation)?;
    if !stream.returned_events.contains(EventSet::READABLE) {
        return Ok(());
    }
    let fd = stream.fd;

    let mut buf = [0u8; 2];
    let n = socket::peek_nonblocking(fd, &mut buf)?;
    if n < 2 {
        return Ok(());
    }
    socket::recv_exact_nonblocking(fd, &mut buf)?;
    if buf != [0x05, 0x00] {
        return Err(Socks5Error::ProtocolViolation.into());
    }

    let peer_fd = pool.get(a).ok_or(Socks5Error::ProtocolViolation)?.fd;
    let dest = socket::query_original_destination(peer_fd)?;

    let request = build_connect_request(dest);
    let stream = pool.get_mut(b).ok_or(Socks5Error::ProtocolViolation)?;
    stream.original_dst = Some(dest);
    stream.queue.set(&request)?;
    stream.requested_events = EventSet::WRITABLE;
    stream.level = Level::ReqSent;
    Ok(())
}

fn advance_req_sent<const N: usize>(pool: &mut Pool<Stream, N>, b: SlotId) -> Result<(), HandshakeFailure> {
    if !drain_if_ready(pool, b)? {
        return Ok(());
    }

    let stream = pool.get(b).ok_or(Socks5Error::ProtocolViolation)?;
    if !stream.returned_events.contains(EventSet::READABLE) {
        return Ok(());
    }
    let fd = stream.fd;

    let mut head = [0u8; 4];
    let n = socket::peek_nonblocking(fd, &mut head)?;
    if n < 4 {
        return Ok(());
    }
    if head[0] != 0x05 || head[1] != 0x00 {
        return Err(Socks5Error::ProtocolViolation.into());
    }
    let addr_len = match head[3] {
        ATYP_V4 => 4,
        ATYP_V6 => 16,
        _ => return Err(Socks5Error::UnsupportedAddressFamily.into()),
    };
    let total = 4 + addr_len + 2;

    let mut reply = vec![0u8; total];
    let n = socket::peek_nonblocking(fd, &mut reply)?;
    if n < total {
        return Ok(());
    }
    socket::recv_exact_nonblocking(fd, &mut reply)?;

    let Some(peer) = pool.get(b).and_then(|s| s.peer) else {
        return Err(Socks5Error::ProtocolViolation.into());
    };
    for id in [b, peer] {
        if let Some(s) = pool.get_mut(id) {
            s.level = Level::Forwarding;
            s.requested_events = EventSet::READABLE;
        }
    }
    Ok(())
}

fn build_connect_request(dest: Address) -> Vec<u8> {
    let mut req = vec![0x05, 0x01, 0x00];
    match dest {
        Address::V4(ip, port) => {
            req.push(ATYP_V4);
            req.extend_from_slice(&ip.octets());
            req.extend_from_slice(&port.to_be_bytes());
        }
        Address::V6(ip, port) => {
            req.push(ATYP_V6);
            req.extend_from_slice(&ip.octets());
            req.extend_from_slice(&port.to_be_bytes());
        }
    }
    req
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn connect_request_encodes_v4() {
        let req = build_connect_request(Address::V4(Ipv4Addr::new(10, 0, 0, 1), 80));
        assert_eq!(req, vec![0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0, 80]);
    }

    #[test]
    fn connect_request_encodes_v6() {
        let req = build_connect_request(Address::V6(Ipv6Addr::LOCALHOST, 443));
        assert_eq!(req[0..4], [0x05, 0x01, 0x00, 0x04]);
        assert_eq!(req.len(), 4 + 16 + 2);
        assert_eq!(&req[req.len() - 2..], &443u16.to_be_bytes());
    }
}
