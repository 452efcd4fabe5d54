//! Uniform readiness abstraction shared by the poll and epoll back-ends (§4.E).

mod epoll_backend;
mod poll_backend;

pub use poll_backend::PollBackend;

#[cfg(target_os = "linux")]
pub use epoll_backend::EpollBackend;

use crate::error::ReadinessError;
use crate::pool::{Pool, SlotId};
use crate::stream::Stream;

bitflags::bitflags! {
    /// Bitset of readiness conditions, independent of back-end representation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventSet: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const ERROR    = 0b0100;
        const HANGUP   = 0b1000;
    }
}

impl Default for EventSet {
    fn default() -> Self {
        EventSet::empty()
    }
}

/// Opaque back-reference from a stream to its registration in whichever
/// back-end is active, replacing a raw pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadinessHandle {
    #[default]
    Unregistered,
    PollSlot(usize),
    EpollRegistered,
}

/// Translates the reactor's requested-event bitset into `libc::poll`'s
/// event mask.
fn translate_to_poll(events: EventSet) -> libc::c_short {
    let mut mask = 0;
    if events.contains(EventSet::READABLE) {
        mask |= libc::POLLIN;
    }
    if events.contains(EventSet::WRITABLE) {
        mask |= libc::POLLOUT;
    }
    mask as libc::c_short
}

/// Translates a `libc::poll` returned event mask back into an `EventSet`.
fn translate_from_poll(mask: libc::c_short) -> EventSet {
    let mask = mask as libc::c_int;
    let mut events = EventSet::empty();
    if mask & libc::POLLIN != 0 {
        events |= EventSet::READABLE;
    }
    if mask & libc::POLLOUT != 0 {
        events |= EventSet::WRITABLE;
    }
    if mask & libc::POLLERR != 0 {
        events |= EventSet::ERROR;
    }
    if mask & libc::POLLHUP != 0 {
        events |= EventSet::HANGUP;
    }
    events
}

/// Uniform interface implemented by both readiness back-ends. `N` is the
/// pool's fixed capacity, needed to size internal scratch arrays.
pub trait Readiness<const N: usize> {
    /// Rebuilds the back-end's registration state from the pool's current
    /// `requested_events`, then blocks up to `timeout_ms` for events.
    /// Returns the number of streams with nonzero `returned_events`.
    fn wait(&mut self, pool: &mut Pool<Stream, N>, timeout_ms: i32) -> Result<usize, ReadinessError>;

    /// Clears the back-end's registration for a stream about to be freed.
    /// No-op for the poll back-end, which holds no per-fd state between
    /// calls.
    fn forget(&mut self, id: SlotId);
}
