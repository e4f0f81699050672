// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Edge-triggered readiness sets.
//!
//! Each shard owns two epoll instances, one for its UDP listeners and
//! one for TCP (listeners and established connections). Registration
//! is always edge-triggered, and polls are non-blocking with a
//! per-set cap on returned events: the vectorloop never sleeps inside
//! a stage.
//!
//! The user-data slot of each registration carries the connection's
//! token in the shard's connection arena.

use std::io;
use std::os::unix::io::RawFd;

use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::unistd::close;

/// One edge-triggered readiness set with its event buffer.
pub struct EventSet {
    fd: RawFd,
    events: Vec<EpollEvent>,
}

/// One readiness event: the registered token and the directions that
/// became ready.
#[derive(Clone, Copy, Debug)]
pub struct Readiness {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
}

impl EventSet {
    /// Creates a readiness set returning at most `max_events` events
    /// per poll.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            fd,
            events: vec![EpollEvent::empty(); max_events],
        })
    }

    /// Registers a socket for edge-triggered read readiness.
    pub fn register_read_et(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut event = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, token);
        epoll_ctl(self.fd, EpollOp::EpollCtlAdd, fd, &mut event)?;
        Ok(())
    }

    /// Registers a socket for edge-triggered read and write readiness.
    pub fn register_readwrite_et(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut event = EpollEvent::new(
            EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT | EpollFlags::EPOLLET,
            token,
        );
        epoll_ctl(self.fd, EpollOp::EpollCtlAdd, fd, &mut event)?;
        Ok(())
    }

    /// Removes a socket from the set.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        epoll_ctl(self.fd, EpollOp::EpollCtlDel, fd, None)?;
        Ok(())
    }

    /// Polls with zero timeout, returning the number of events now
    /// available through [`EventSet::event`].
    pub fn poll(&mut self) -> io::Result<usize> {
        loop {
            match epoll_wait(self.fd, &mut self.events, 0) {
                Ok(count) => return Ok(count),
                // epoll_wait is not restarted for us even with
                // SA_RESTART handlers installed.
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Returns event `i` of the last poll.
    pub fn event(&self, i: usize) -> Readiness {
        let event = &self.events[i];
        Readiness {
            token: event.data(),
            readable: event.events().contains(EpollFlags::EPOLLIN),
            writable: event.events().contains(EpollFlags::EPOLLOUT),
        }
    }
}

impl Drop for EventSet {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::write;

    #[test]
    fn edge_triggered_readiness_reports_once_per_edge() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .unwrap();
        let mut set = EventSet::new(8).unwrap();
        set.register_read_et(b, 7).unwrap();

        // Nothing readable yet.
        assert_eq!(set.poll().unwrap(), 0);

        write(a, b"hi").unwrap();
        assert_eq!(set.poll().unwrap(), 1);
        let readiness = set.event(0);
        assert_eq!(readiness.token, 7);
        assert!(readiness.readable);

        // Edge triggering: without draining the socket, a new poll
        // reports nothing.
        assert_eq!(set.poll().unwrap(), 0);

        set.deregister(b).unwrap();
        let _ = close(a);
        let _ = close(b);
    }
}
