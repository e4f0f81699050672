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

//! Bounded single-producer/single-consumer channels.
//!
//! Shards never block, so every cross-thread exchange goes through a
//! lock-free bounded ring: `send` fails when the ring is full and
//! `try_recv` returns [`None`] when it is empty. There are two channel
//! shapes built on the ring:
//!
//! * A **control channel** between one shard and one support thread:
//!   two rings of capacity [`CONTROL_QUEUE_LEN`], one per direction.
//!   Usage is strictly request/response (at most one transaction
//!   outstanding per direction), which is why such a small bound
//!   suffices. Messages are boxed; whichever side dequeues a message
//!   owns it and everything it carries.
//! * A **log channel** from each thread to the application-log
//!   thread: a single ring of capacity [`LOG_QUEUE_LEN`]. These are
//!   fire-and-forget; on overflow the message is dropped and the
//!   caller counts the drop.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::resolver::Resource;

/// The capacity of each direction of a control channel. Control
/// traffic is request/response with a single outstanding transaction,
/// so two slots are already one more than strictly needed.
pub const CONTROL_QUEUE_LEN: usize = 2;

/// The capacity of an application-log channel.
pub const LOG_QUEUE_LEN: usize = 1024;

////////////////////////////////////////////////////////////////////////
// THE SPSC RING                                                      //
////////////////////////////////////////////////////////////////////////

struct Ring<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    mask: usize,
    capacity: usize,

    /// The consumer cursor. Only the receiver stores to it.
    head: AtomicUsize,

    /// The producer cursor. Only the sender stores to it.
    tail: AtomicUsize,
}

// SAFETY: the ring is shared between exactly one producer and one
// consumer. A slot is written by the producer strictly before the
// tail store that publishes it (Release), and read by the consumer
// only after observing that store (Acquire); the mirror-image argument
// covers slot reuse via the head cursor. No slot is ever accessed by
// both sides at once.
unsafe impl<T: Send> Sync for Ring<T> {}

/// The producing half of an SPSC ring. Not cloneable: there is exactly
/// one producer.
pub struct SpscSender<T> {
    ring: Arc<Ring<T>>,
}

/// The consuming half of an SPSC ring. Not cloneable: there is exactly
/// one consumer.
pub struct SpscReceiver<T> {
    ring: Arc<Ring<T>>,
}

/// Creates a bounded SPSC channel. The capacity is rounded up to a
/// power of two.
pub fn spsc<T: Send>(capacity: usize) -> (SpscSender<T>, SpscReceiver<T>) {
    let capacity = capacity.next_power_of_two();
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(None))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let ring = Arc::new(Ring {
        slots,
        mask: capacity - 1,
        capacity,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        SpscSender { ring: ring.clone() },
        SpscReceiver { ring },
    )
}

impl<T: Send> SpscSender<T> {
    /// Enqueues a value. Fails, returning the value, when the ring is
    /// full. Never blocks.
    pub fn send(&self, value: T) -> Result<(), T> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        let head = ring.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) == ring.capacity {
            return Err(value);
        }
        // SAFETY: this slot is past the consumer's cursor, and we are
        // the only producer; see the Sync impl above.
        unsafe {
            *ring.slots[tail & ring.mask].get() = Some(value);
        }
        ring.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }
}

impl<T: Send> SpscReceiver<T> {
    /// Dequeues a value, or returns [`None`] when the ring is empty.
    /// Never blocks.
    pub fn try_recv(&self) -> Option<T> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: the producer published this slot with the tail
        // store we just observed, and we are the only consumer.
        let value = unsafe { (*ring.slots[head & ring.mask].get()).take() };
        ring.head.store(head.wrapping_add(1), Ordering::Release);
        value
    }
}

////////////////////////////////////////////////////////////////////////
// CONTROL CHANNELS                                                   //
////////////////////////////////////////////////////////////////////////

/// The operation a control message requests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlOp {
    /// Publish a new resource artifact to the shard. The shard swaps
    /// its reference and acknowledges with the payload cleared.
    SetResource,

    /// Flip the shard's query-log double buffer. The shard replies
    /// with the filled buffer; the requester returns the drained one
    /// on the next flip.
    QueryLogFlip,
}

/// A message exchanged over a control channel. Whoever dequeues the
/// box owns it and its payload.
#[derive(Debug)]
pub struct ControlMsg {
    pub id: u64,
    pub op: ControlOp,

    /// The resource artifact in flight ([`ControlOp::SetResource`]).
    pub resource: Option<Arc<Resource>>,

    /// The query-log buffer in flight ([`ControlOp::QueryLogFlip`]):
    /// a drained buffer on the request, the filled buffer on the
    /// reply.
    pub buf: Option<Vec<u8>>,

    /// Whether the requested operation succeeded (set on the reply).
    pub ok: bool,
}

impl ControlMsg {
    pub fn new(id: u64, op: ControlOp) -> Box<Self> {
        Box::new(Self {
            id,
            op,
            resource: None,
            buf: None,
            ok: false,
        })
    }
}

/// One side of a bidirectional control channel.
pub struct ControlEndpoint {
    tx: SpscSender<Box<ControlMsg>>,
    rx: SpscReceiver<Box<ControlMsg>>,
}

impl ControlEndpoint {
    /// Sends a message to the peer. Fails, returning the message,
    /// when the peer has not drained its ring; with request/response
    /// usage this indicates a logic error on the caller's side.
    pub fn send(&self, msg: Box<ControlMsg>) -> Result<(), Box<ControlMsg>> {
        self.tx.send(msg)
    }

    /// Receives a message from the peer, if one is pending.
    pub fn try_recv(&self) -> Option<Box<ControlMsg>> {
        self.rx.try_recv()
    }
}

/// Creates a control channel, returning the two endpoints. By
/// convention the first goes to the support thread and the second to
/// the shard.
pub fn control_channel() -> (ControlEndpoint, ControlEndpoint) {
    let (to_shard_tx, to_shard_rx) = spsc(CONTROL_QUEUE_LEN);
    let (to_worker_tx, to_worker_rx) = spsc(CONTROL_QUEUE_LEN);
    (
        ControlEndpoint {
            tx: to_shard_tx,
            rx: to_worker_rx,
        },
        ControlEndpoint {
            tx: to_worker_tx,
            rx: to_shard_rx,
        },
    )
}

/// Assigns the next message id from a per-thread base.
pub fn assign_msg_id(base: &mut u64) -> u64 {
    *base += 1;
    *base
}

////////////////////////////////////////////////////////////////////////
// LOG CHANNELS                                                       //
////////////////////////////////////////////////////////////////////////

/// A message for the application-log thread.
#[derive(Debug)]
pub struct LogMsg {
    pub text: String,

    /// A fatal message makes the application-log thread exit the
    /// process after writing it.
    pub fatal: bool,
}

impl LogMsg {
    pub fn new(text: impl Into<String>, fatal: bool) -> Box<Self> {
        Box::new(Self {
            text: text.into(),
            fatal,
        })
    }
}

pub type LogSender = SpscSender<Box<LogMsg>>;
pub type LogReceiver = SpscReceiver<Box<LogMsg>>;

/// Creates an application-log channel.
pub fn log_channel() -> (LogSender, LogReceiver) {
    spsc(LOG_QUEUE_LEN)
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn spsc_delivers_in_order() {
        let (tx, rx) = spsc(4);
        for i in 0..4 {
            tx.send(i).unwrap();
        }
        for i in 0..4 {
            assert_eq!(rx.try_recv(), Some(i));
        }
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn spsc_rejects_when_full() {
        let (tx, rx) = spsc(2);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(tx.send(3), Err(3));
        assert_eq!(rx.try_recv(), Some(1));
        tx.send(3).unwrap();
        assert_eq!(rx.try_recv(), Some(2));
        assert_eq!(rx.try_recv(), Some(3));
    }

    #[test]
    fn spsc_works_across_threads() {
        let (tx, rx) = spsc::<u64>(64);
        let producer = thread::spawn(move || {
            for i in 0..10_000u64 {
                loop {
                    if tx.send(i).is_ok() {
                        break;
                    }
                    thread::yield_now();
                }
            }
        });
        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(v) = rx.try_recv() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn control_channel_round_trips_a_transaction() {
        let (worker, shard) = control_channel();
        let mut id_base = 0;
        let msg = ControlMsg::new(assign_msg_id(&mut id_base), ControlOp::QueryLogFlip);
        worker.send(msg).unwrap();

        let mut msg = shard.try_recv().unwrap();
        assert_eq!(msg.op, ControlOp::QueryLogFlip);
        msg.ok = true;
        msg.buf = Some(vec![1, 2, 3]);
        shard.send(msg).unwrap();

        let reply = worker.try_recv().unwrap();
        assert!(reply.ok);
        assert_eq!(reply.buf.as_deref(), Some(&[1u8, 2, 3][..]));
        assert!(worker.try_recv().is_none());
    }

    #[test]
    fn log_channel_carries_fatal_flags() {
        let (tx, rx) = log_channel();
        tx.send(LogMsg::new("plain", false)).unwrap();
        tx.send(LogMsg::new("fatal", true)).unwrap();
        assert!(!rx.try_recv().unwrap().fatal);
        assert!(rx.try_recv().unwrap().fatal);
    }
}
