//! The `Stream` record (§3): one socket plus its role and protocol state.
//! List links (`prev`/`next`) and the generation counter live in the pool's
//! own slot representation rather than duplicated here — the arena already
//! owns placement, so the value type only needs to know what it is, not
//! where it sits.

use std::os::fd::RawFd;

use crate::addr::Address;
use crate::pool::SlotId;
use crate::queue::HandshakeQueue;
use crate::readiness::{EventSet, ReadinessHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listen,
    ClientSide,
    UpstreamSide,
}

/// Protocol position, driven by the SOCKS5 client state machine (§4.F) for
/// `UpstreamSide` streams; `ClientSide` mirrors its peer via `Awaiting` and
/// `Forwarding`; `Listen` is permanently `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    None,
    Awaiting,
    Connecting,
    VerSent,
    ReqSent,
    Forwarding,
}

pub struct Stream {
    pub role: Role,
    pub fd: RawFd,
    pub level: Level,
    pub abandoned: bool,
    pub requested_events: EventSet,
    pub last_registered_events: EventSet,
    pub returned_events: EventSet,
    pub readiness_handle: ReadinessHandle,
    pub peer: Option<SlotId>,
    pub queue: HandshakeQueue,
    /// Original destination recovered via `query_original_destination`,
    /// populated lazily when the upstream side reaches `VerSent`.
    pub original_dst: Option<Address>,
}

impl Stream {
    pub fn new(role: Role, fd: RawFd) -> Self {
        Self {
            role,
            fd,
            level: Level::None,
            abandoned: false,
            requested_events: EventSet::empty(),
            last_registered_events: EventSet::empty(),
            returned_events: EventSet::empty(),
            readiness_handle: ReadinessHandle::Unregistered,
            peer: None,
            queue: HandshakeQueue::default(),
            original_dst: None,
        }
    }

    pub fn listen(fd: RawFd) -> Self {
        let mut s = Self::new(Role::Listen, fd);
        s.requested_events = EventSet::READABLE;
        s
    }
}
