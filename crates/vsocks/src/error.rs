use std::io;

use thiserror::Error;

/// Failure parsing or formatting a `host:port` address (§4.A).
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("malformed address")]
    Malformed,
    #[error("port out of range")]
    PortOutOfRange,
}

/// Failure writing into the fixed-capacity handshake queue (§4.B).
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("handshake queue capacity exceeded")]
    Overflow,
}

/// Failure allocating or releasing a stream pool slot (§4.C).
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("stream pool exhausted")]
    Exhausted,
}

/// Failure in a non-blocking socket operation (§4.D).
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
    #[error("could not retrieve original destination")]
    NoRedirectInfo,
}

/// Failure building or waiting on a readiness back-end (§4.E).
#[derive(Error, Debug)]
pub enum ReadinessError {
    #[error("readiness registration failed: {0}")]
    BuildFailed(#[source] io::Error),
}

/// Failure advancing the SOCKS5 client state machine (§4.F).
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Socks5Error {
    #[error("unexpected byte in SOCKS5 reply")]
    ProtocolViolation,
    #[error("unsupported address family in SOCKS5 reply")]
    UnsupportedAddressFamily,
}

/// Top-level error returned by the reactor. Only the `ReadinessError` variant
/// is fatal (`BuildFailed` in the spec's taxonomy); every other kind is
/// handled locally by abandoning the offending relation and is never
/// constructed at the reactor's own boundary.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Readiness(#[from] ReadinessError),
    #[error(transparent)]
    Addr(#[from] AddrError),
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
