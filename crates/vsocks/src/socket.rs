//! Non-blocking socket primitives built directly on `libc` (§4.D).
//!
//! Nothing here goes through a higher-level networking crate: the reactor
//! needs raw control over non-blocking connect, kernel queue introspection
//! (`FIONREAD`/`TIOCOUTQ`) and `MSG_PEEK`/`MSG_NOSIGNAL` semantics that a
//! portable socket abstraction would hide.

use std::io;
use std::mem;
use std::net::Ipv6Addr;
use std::os::fd::RawFd;

use crate::addr::Address;
use crate::error::SocketError;

/// Max bytes moved by a single `forward_chunk` call (§4.D).
pub const CHUNK: usize = 16_384;

/// Outcome of a successful `forward_chunk` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Moved(usize),
    Backpressure,
}

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

fn would_block(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK))
}

fn sockaddr_from(addr: Address) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: `sockaddr_storage` is a plain-old-data type; zeroing it is a
    // valid sockaddr_storage, and we overwrite the fields each variant
    // needs before handing it to a syscall.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        Address::V4(ip, port) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: port.to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(ip.octets()) },
                sin_zero: [0; 8],
                #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
                sin_len: 0,
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        Address::V6(ip, port) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: port.to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr { s6_addr: ip.octets() },
                sin6_scope_id: 0,
                #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
                sin6_len: 0,
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn family_of(addr: Address) -> libc::c_int {
    match addr {
        Address::V4(..) => libc::AF_INET,
        Address::V6(..) => libc::AF_INET6,
    }
}

/// Creates a non-blocking stream socket of the matching family.
fn new_stream_socket(family: libc::c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(last_os_error());
    }
    set_nonblocking(fd)?;
    Ok(fd)
}

/// Makes `fd` non-blocking.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

/// Creates, binds and listens a socket for `address` with backlog 4.
pub fn listen_socket(address: Address) -> io::Result<RawFd> {
    let fd = new_stream_socket(family_of(address))?;
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let (storage, len) = sockaddr_from(address);
    let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        let err = last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let rc = unsafe { libc::listen(fd, 4) };
    if rc < 0 {
        let err = last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

/// Starts a non-blocking connect to `address`.
///
/// The contract requires that `connect` either signals "in progress"
/// (`EINPROGRESS`) or fails outright — an immediate successful connect is
/// treated as an error (defensive interpretation retained per §9). Callers
/// must follow up with [`socket_has_error`] once the socket becomes
/// writable.
pub fn connect_async(address: Address) -> io::Result<RawFd> {
    let fd = new_stream_socket(family_of(address))?;
    let (storage, len) = sockaddr_from(address);
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc == 0 {
        unsafe { libc::close(fd) };
        return Err(io::Error::new(io::ErrorKind::Other, "connect completed synchronously"));
    }
    let err = last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

/// Reads and clears any pending asynchronous error on `fd`. Returns `true`
/// if an error is (or was) pending.
pub fn socket_has_error(fd: RawFd) -> io::Result<bool> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(last_os_error());
    }
    Ok(err != 0)
}

/// Shuts down both directions, then closes `fd`.
pub fn shutdown_then_close(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
        libc::close(fd);
    }
}

/// Queries the kernel receive-queue length (`FIONREAD`).
pub fn bytes_readable(fd: RawFd) -> io::Result<usize> {
    let mut n: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n) };
    if rc < 0 {
        return Err(last_os_error());
    }
    Ok(n.max(0) as usize)
}

/// Queries bytes still queued for send on `fd` (`TIOCOUTQ`/`SIOCOUTQ`).
///
/// Linux-only; on other platforms there is no portable equivalent, so this
/// conservatively reports zero bytes pending (a known platform limit — the
/// backpressure signal degrades to `SO_SNDBUF` alone there).
#[cfg(target_os = "linux")]
fn bytes_pending_send(fd: RawFd) -> io::Result<usize> {
    let mut n: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut n) };
    if rc < 0 {
        return Err(last_os_error());
    }
    Ok(n.max(0) as usize)
}

#[cfg(not(target_os = "linux"))]
fn bytes_pending_send(_fd: RawFd) -> io::Result<usize> {
    Ok(0)
}

/// Queries the destination's `SO_SNDBUF` size.
fn send_buffer_size(fd: RawFd) -> io::Result<usize> {
    let mut n: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &mut n as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(last_os_error());
    }
    Ok(n.max(0) as usize)
}

/// Sets `SO_SNDBUF`/`SO_RCVBUF` on `fd`.
pub fn set_socket_buf_size(fd: RawFd, size: usize) {
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Non-consuming peek of up to `buf.len()` bytes, used by the handshake
/// state machine to check for a complete reply before committing to parse
/// it.
pub fn peek_nonblocking(fd: RawFd, buf: &mut [u8]) -> Result<usize, SocketError> {
    let rc = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), libc::MSG_PEEK) };
    if rc < 0 {
        let err = last_os_error();
        if would_block(&err) {
            return Ok(0);
        }
        return Err(SocketError::Transport(err));
    }
    if rc == 0 {
        return Err(SocketError::PeerClosed);
    }
    Ok(rc as usize)
}

/// Consumes exactly `buf.len()` bytes already confirmed present by a prior
/// peek.
pub fn recv_exact_nonblocking(fd: RawFd, buf: &mut [u8]) -> Result<(), SocketError> {
    let rc = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if rc < 0 {
        return Err(SocketError::Transport(last_os_error()));
    }
    if rc as usize != buf.len() {
        return Err(SocketError::Transport(io::Error::new(io::ErrorKind::UnexpectedEof, "short read consuming peeked bytes")));
    }
    Ok(())
}

/// Single non-blocking send with no-signal semantics, used both by the
/// handshake queue and by `forward_chunk`.
pub fn send_nonblocking(fd: RawFd, bytes: &[u8]) -> Result<usize, SocketError> {
    let rc = unsafe {
        libc::send(fd, bytes.as_ptr() as *const libc::c_void, bytes.len(), libc::MSG_NOSIGNAL)
    };
    if rc < 0 {
        let err = last_os_error();
        if would_block(&err) {
            return Ok(0);
        }
        return Err(SocketError::Transport(err));
    }
    Ok(rc as usize)
}

/// The hot-path forwarding primitive (§4.D). Peeks `src`, sends to `dst`,
/// then consumes exactly what was sent — never dropping a byte even when
/// `dst` accepts fewer bytes than anticipated.
pub fn forward_chunk(src: RawFd, dst: RawFd) -> Result<ForwardOutcome, SocketError> {
    let available = bytes_readable(src).map_err(SocketError::Transport)?;
    if available == 0 {
        return Err(SocketError::PeerClosed);
    }
    let mut len = available.min(CHUNK);

    let pending = bytes_pending_send(dst).map_err(SocketError::Transport)?;
    let sndbuf = send_buffer_size(dst).map_err(SocketError::Transport)?;
    let send_room = sndbuf.saturating_sub(pending);
    if send_room == 0 {
        return Ok(ForwardOutcome::Backpressure);
    }
    len = len.min(send_room);

    let mut buf = vec![0u8; len];
    let peeked = unsafe {
        libc::recv(src, buf.as_mut_ptr() as *mut libc::c_void, len, libc::MSG_PEEK)
    };
    if peeked < 0 {
        let err = last_os_error();
        if would_block(&err) {
            return Ok(ForwardOutcome::Backpressure);
        }
        return Err(SocketError::Transport(err));
    }
    let peeked = peeked as usize;
    if peeked == 0 {
        return Err(SocketError::PeerClosed);
    }

    let sent = send_nonblocking(dst, &buf[..peeked])?;
    if sent == 0 {
        return Ok(ForwardOutcome::Backpressure);
    }

    let consumed = unsafe {
        libc::recv(src, buf.as_mut_ptr() as *mut libc::c_void, sent, 0)
    };
    if consumed < 0 || consumed as usize != sent {
        return Err(SocketError::Transport(last_os_error()));
    }

    Ok(ForwardOutcome::Moved(sent))
}

/// Retrieves the pre-NAT destination of an accepted, redirected client
/// socket (§4.I). On Linux this reads the netfilter `SO_ORIGINAL_DST`
/// socket option; there is no portable equivalent, so other targets always
/// report `NoRedirectInfo`.
#[cfg(target_os = "linux")]
pub fn query_original_destination(fd: RawFd) -> Result<Address, SocketError> {
    const SO_ORIGINAL_DST: libc::c_int = 80;

    // Try the IPv4 form first: a sockaddr_in is a valid prefix of
    // sockaddr_in6, but the kernel only fills in what the accepted
    // socket's family actually requires, so dispatch on `getsockname`'s
    // reported family instead of guessing.
    let mut local: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut local_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut local as *mut _ as *mut libc::sockaddr, &mut local_len)
    };
    if rc < 0 {
        return Err(SocketError::NoRedirectInfo);
    }

    match local.ss_family as libc::c_int {
        libc::AF_INET => {
            let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_IP,
                    SO_ORIGINAL_DST,
                    &mut sin as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            if rc < 0 {
                return Err(SocketError::NoRedirectInfo);
            }
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(Address::V4(ip, u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_IPV6,
                    SO_ORIGINAL_DST,
                    &mut sin6 as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            if rc < 0 {
                return Err(SocketError::NoRedirectInfo);
            }
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(Address::V6(ip, u16::from_be(sin6.sin6_port)))
        }
        _ => Err(SocketError::NoRedirectInfo),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn query_original_destination(_fd: RawFd) -> Result<Address, SocketError> {
    Err(SocketError::NoRedirectInfo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn connect_async_reports_in_progress_not_error() {
        // Connecting to a closed loopback port should either fail outright
        // or report in-progress; it must never silently succeed.
        let addr = Address::V4(Ipv4Addr::LOCALHOST, 1);
        match connect_async(addr) {
            Ok(fd) => unsafe {
                libc::close(fd);
            },
            Err(_) => {}
        }
    }

    #[test]
    fn nonblocking_round_trips_through_fcntl() {
        let fd = new_stream_socket(libc::AF_INET).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);
        unsafe { libc::close(fd) };
    }
}
