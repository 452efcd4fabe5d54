//! Level-triggered back-end built directly on `libc::poll`. Stateless
//! across calls: the pollfd array is rebuilt from the pool every cycle.

use std::io;

use vsocks_utils::ArrayVec;

use super::{translate_from_poll, translate_to_poll, EventSet, Readiness, ReadinessHandle};
use crate::error::ReadinessError;
use crate::pool::{Pool, SlotId};
use crate::stream::Stream;

pub struct PollBackend<const N: usize> {
    fds: ArrayVec<libc::pollfd, N>,
    slots: ArrayVec<SlotId, N>,
}

impl<const N: usize> Default for PollBackend<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> PollBackend<N> {
    pub fn new() -> Self {
        Self { fds: ArrayVec::new(), slots: ArrayVec::new() }
    }
}

impl<const N: usize> Readiness<N> for PollBackend<N> {
    fn wait(&mut self, pool: &mut Pool<Stream, N>, timeout_ms: i32) -> Result<usize, ReadinessError> {
        self.fds.clear();
        self.slots.clear();

        let ids: ArrayVec<SlotId, N> = {
            let mut ids = ArrayVec::new();
            for (id, _) in pool.iter() {
                ids.push(id);
            }
            ids
        };

        // Reset transient state before rebuilding; any stream that ends up
        // with no pollfd entry keeps a zero return mask and an
        // unregistered handle.
        for id in ids.iter() {
            if let Some(stream) = pool.get_mut(*id) {
                stream.returned_events = EventSet::empty();
                stream.readiness_handle = ReadinessHandle::Unregistered;
            }
        }

        for id in ids.iter() {
            let Some(stream) = pool.get(*id) else { continue };
            if stream.requested_events.is_empty() {
                continue;
            }
            let events = translate_to_poll(stream.requested_events) | libc::POLLERR | libc::POLLHUP;
            if self.fds.try_push(libc::pollfd { fd: stream.fd, events, revents: 0 }).is_some() {
                return Err(ReadinessError::BuildFailed(io::Error::new(
                    io::ErrorKind::Other,
                    "poll set capacity exceeded",
                )));
            }
            self.slots.push(*id);
        }

        let nfds = self.fds.len() as libc::nfds_t;
        let rc = unsafe { libc::poll(self.fds.as_mut_slice().as_mut_ptr(), nfds, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(ReadinessError::BuildFailed(err));
        }

        let mut ready = 0usize;
        for (i, id) in self.slots.iter().enumerate() {
            let revents = self.fds.get(i).unwrap().revents;
            let events = translate_from_poll(revents);
            if !events.is_empty() {
                ready += 1;
            }
            if let Some(stream) = pool.get_mut(*id) {
                stream.returned_events = events;
                stream.readiness_handle = ReadinessHandle::PollSlot(i);
            }
        }
        Ok(ready)
    }

    fn forget(&mut self, _id: SlotId) {
        // Stateless: the array is rebuilt from scratch on the next wait.
    }
}
