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

//! Connection FIFO queues.
//!
//! The vectorloop moves connections between pipeline stages through
//! FIFO queues of connection tokens (slot indices into the shard's
//! connection arena). Read, write, and release queues track membership
//! with a per-connection flag, which makes re-enqueueing idempotent: a
//! connection is in at most one read queue, one write queue, and one
//! release queue at any time. The general queues between the parse,
//! resolve, pack, and log stages need no flag, since a connection
//! flows through them linearly within a single iteration.

use std::collections::VecDeque;

use slab::Slab;

use crate::conn::Conn;

/// A FIFO queue of connection tokens.
#[derive(Debug, Default)]
pub struct ConnFifo {
    queue: VecDeque<usize>,
}

impl ConnFifo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Enqueues for reading. A no-op when the connection is already in
    /// a read queue.
    pub fn enqueue_read(&mut self, conns: &mut Slab<Conn>, token: usize) {
        let conn = &mut conns[token];
        if !conn.in_read_queue {
            conn.in_read_queue = true;
            self.queue.push_back(token);
        }
    }

    pub fn dequeue_read(&mut self, conns: &mut Slab<Conn>) -> Option<usize> {
        let token = self.queue.pop_front()?;
        conns[token].in_read_queue = false;
        Some(token)
    }

    /// Enqueues for writing. A no-op when the connection is already in
    /// a write queue.
    pub fn enqueue_write(&mut self, conns: &mut Slab<Conn>, token: usize) {
        let conn = &mut conns[token];
        if !conn.in_write_queue {
            conn.in_write_queue = true;
            self.queue.push_back(token);
        }
    }

    pub fn dequeue_write(&mut self, conns: &mut Slab<Conn>) -> Option<usize> {
        let token = self.queue.pop_front()?;
        conns[token].in_write_queue = false;
        Some(token)
    }

    /// Enqueues for release. A no-op when the connection is already
    /// awaiting release.
    pub fn enqueue_release(&mut self, conns: &mut Slab<Conn>, token: usize) {
        let conn = &mut conns[token];
        if !conn.in_release_queue {
            conn.in_release_queue = true;
            self.queue.push_back(token);
        }
    }

    pub fn dequeue_release(&mut self, conns: &mut Slab<Conn>) -> Option<usize> {
        let token = self.queue.pop_front()?;
        conns[token].in_release_queue = false;
        Some(token)
    }

    /// Enqueues on a general (inter-stage) queue, which has no
    /// membership flag.
    pub fn enqueue(&mut self, token: usize) {
        self.queue.push_back(token);
    }

    pub fn dequeue(&mut self) -> Option<usize> {
        self.queue.pop_front()
    }

    /// Removes a connection from this read queue, if it is in one.
    /// Used when a connection is released while queued.
    pub fn remove_read(&mut self, conns: &mut Slab<Conn>, token: usize) {
        if conns[token].in_read_queue {
            self.queue.retain(|&t| t != token);
            conns[token].in_read_queue = false;
        }
    }

    /// Removes a connection from this write queue, if it is in one.
    pub fn remove_write(&mut self, conns: &mut Slab<Conn>, token: usize) {
        if conns[token].in_write_queue {
            self.queue.retain(|&t| t != token);
            conns[token].in_write_queue = false;
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{Conn, ConnKind};

    fn arena(n: usize) -> (Slab<Conn>, Vec<usize>) {
        let mut conns = Slab::new();
        let tokens = (0..n)
            .map(|_| conns.insert(Conn::new(-1, false, ConnKind::TcpListener)))
            .collect();
        (conns, tokens)
    }

    #[test]
    fn read_queue_is_fifo_and_idempotent() {
        let (mut conns, tokens) = arena(3);
        let mut fifo = ConnFifo::new();
        for &t in &tokens {
            fifo.enqueue_read(&mut conns, t);
        }
        // A second enqueue of an already-queued connection is a no-op.
        fifo.enqueue_read(&mut conns, tokens[0]);
        assert_eq!(fifo.len(), 3);
        assert_eq!(fifo.dequeue_read(&mut conns), Some(tokens[0]));
        assert!(!conns[tokens[0]].in_read_queue);
        assert_eq!(fifo.dequeue_read(&mut conns), Some(tokens[1]));
        assert_eq!(fifo.dequeue_read(&mut conns), Some(tokens[2]));
        assert_eq!(fifo.dequeue_read(&mut conns), None);
    }

    #[test]
    fn a_connection_can_sit_in_one_queue_of_each_kind() {
        let (mut conns, tokens) = arena(1);
        let token = tokens[0];
        let mut read = ConnFifo::new();
        let mut write = ConnFifo::new();
        let mut release = ConnFifo::new();
        read.enqueue_read(&mut conns, token);
        write.enqueue_write(&mut conns, token);
        release.enqueue_release(&mut conns, token);
        assert!(conns[token].in_read_queue);
        assert!(conns[token].in_write_queue);
        assert!(conns[token].in_release_queue);
        assert_eq!(read.len(), 1);
        assert_eq!(write.len(), 1);
        assert_eq!(release.len(), 1);
    }

    #[test]
    fn removal_scrubs_only_the_matching_kind() {
        let (mut conns, tokens) = arena(2);
        let mut read = ConnFifo::new();
        let mut write = ConnFifo::new();
        read.enqueue_read(&mut conns, tokens[0]);
        read.enqueue_read(&mut conns, tokens[1]);
        write.enqueue_write(&mut conns, tokens[0]);

        read.remove_read(&mut conns, tokens[0]);
        assert!(!conns[tokens[0]].in_read_queue);
        assert!(conns[tokens[0]].in_write_queue);
        assert_eq!(read.dequeue_read(&mut conns), Some(tokens[1]));
        assert_eq!(read.dequeue_read(&mut conns), None);

        // Removing from the write queue checks the write flag, not the
        // read flag.
        write.remove_write(&mut conns, tokens[0]);
        assert!(!conns[tokens[0]].in_write_queue);
        assert!(write.is_empty());
    }

    #[test]
    fn general_queues_have_no_membership_flag() {
        let (conns, tokens) = arena(1);
        let mut general = ConnFifo::new();
        general.enqueue(tokens[0]);
        assert!(!conns[tokens[0]].in_read_queue);
        assert_eq!(general.dequeue(), Some(tokens[0]));
        assert_eq!(general.dequeue(), None);
    }
}
