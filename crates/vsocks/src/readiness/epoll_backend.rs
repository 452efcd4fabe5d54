//! Persistent-registration back-end built directly on
//! `epoll_create1`/`epoll_ctl`/`epoll_wait`. Linux-only.

use std::array;
use std::io;
use std::os::fd::RawFd;

use vsocks_utils::ArrayVec;

use super::{EventSet, Readiness, ReadinessHandle};
use crate::error::ReadinessError;
use crate::pool::{Pool, SlotId};
use crate::stream::Stream;

fn translate_to_epoll(events: EventSet) -> u32 {
    let mut mask = 0u32;
    if events.contains(EventSet::READABLE) {
        mask |= libc::EPOLLIN as u32;
    }
    if events.contains(EventSet::WRITABLE) {
        mask |= libc::EPOLLOUT as u32;
    }
    mask | libc::EPOLLERR as u32 | libc::EPOLLHUP as u32
}

fn translate_from_epoll(mask: u32) -> EventSet {
    let mask = mask as i32;
    let mut events = EventSet::empty();
    if mask & libc::EPOLLIN != 0 {
        events |= EventSet::READABLE;
    }
    if mask & libc::EPOLLOUT != 0 {
        events |= EventSet::WRITABLE;
    }
    if mask & libc::EPOLLERR != 0 {
        events |= EventSet::ERROR;
    }
    if mask & libc::EPOLLHUP != 0 {
        events |= EventSet::HANGUP;
    }
    events
}

/// Packs a slot handle into an epoll event payload so the event itself
/// carries enough information to look the stream back up, generation and
/// all, without a side table.
fn encode_payload(id: SlotId) -> u64 {
    (u64::from(id.generation()) << 32) | id.index() as u64
}

fn decode_payload(payload: u64) -> SlotId {
    let index = (payload & 0xFFFF_FFFF) as u32;
    let generation = (payload >> 32) as u32;
    SlotId::from_raw(index, generation)
}

fn epoll_event_for(events: EventSet, id: SlotId) -> libc::epoll_event {
    libc::epoll_event { events: translate_to_epoll(events), u64: encode_payload(id) }
}

pub struct EpollBackend<const N: usize> {
    epfd: RawFd,
    events: Box<[libc::epoll_event; N]>,
}

impl<const N: usize> EpollBackend<N> {
    pub fn new() -> Result<Self, ReadinessError> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(ReadinessError::BuildFailed(io::Error::last_os_error()));
        }
        let events = Box::new(array::from_fn(|_| libc::epoll_event { events: 0, u64: 0 }));
        Ok(Self { epfd, events })
    }
}

impl<const N: usize> Drop for EpollBackend<N> {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

impl<const N: usize> Readiness<N> for EpollBackend<N> {
    fn wait(&mut self, pool: &mut Pool<Stream, N>, timeout_ms: i32) -> Result<usize, ReadinessError> {
        let ids: ArrayVec<SlotId, N> = {
            let mut ids = ArrayVec::new();
            for (id, _) in pool.iter() {
                ids.push(id);
            }
            ids
        };

        for id in ids.iter() {
            let Some(stream) = pool.get_mut(*id) else { continue };
            let registered = matches!(stream.readiness_handle, ReadinessHandle::EpollRegistered);

            if stream.requested_events.is_empty() {
                if registered {
                    let mut ev = epoll_event_for(EventSet::empty(), *id);
                    let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, stream.fd, &mut ev) };
                    if rc < 0 {
                        return Err(ReadinessError::BuildFailed(io::Error::last_os_error()));
                    }
                    stream.readiness_handle = ReadinessHandle::Unregistered;
                    stream.last_registered_events = EventSet::empty();
                }
                continue;
            }

            if !registered || stream.last_registered_events != stream.requested_events {
                let op = if registered { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_ADD };
                let mut ev = epoll_event_for(stream.requested_events, *id);
                let rc = unsafe { libc::epoll_ctl(self.epfd, op, stream.fd, &mut ev) };
                if rc < 0 {
                    return Err(ReadinessError::BuildFailed(io::Error::last_os_error()));
                }
                stream.last_registered_events = stream.requested_events;
                stream.readiness_handle = ReadinessHandle::EpollRegistered;
            }
        }

        for id in ids.iter() {
            if let Some(stream) = pool.get_mut(*id) {
                stream.returned_events = EventSet::empty();
            }
        }

        let n = unsafe { libc::epoll_wait(self.epfd, self.events.as_mut_ptr(), N as i32, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(ReadinessError::BuildFailed(err));
        }

        let mut ready = 0usize;
        for i in 0..n as usize {
            let ev = self.events[i];
            let id = decode_payload(ev.u64);
            let events = translate_from_epoll(ev.events);
            if events.is_empty() {
                continue;
            }
            ready += 1;
            if let Some(stream) = pool.get_mut(id) {
                stream.returned_events = events;
            }
        }
        Ok(ready)
    }

    fn forget(&mut self, _id: SlotId) {
        // No explicit EPOLL_CTL_DEL needed: callers always close the fd
        // before freeing the slot, and the kernel drops an fd's epoll
        // registrations the moment its last reference is closed.
    }
}
