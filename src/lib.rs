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

//! Quiver: a sharded, vectorized authoritative DNS server.
//!
//! Quiver answers DNS queries over UDP and TCP using a set of
//! independent, single-threaded processing loops ("vectorloops"), one
//! per shard. Each shard owns its own listening sockets (bound with
//! `SO_REUSEPORT` so that the kernel distributes flows between shards),
//! its own TCP connections, and its own query-log buffers. Shards never
//! share mutable state with one another; the only cross-thread
//! communication is through bounded single-producer/single-consumer
//! channels to three support threads (application log, query log, and
//! resource loading).
//!
//! The crate is organized as follows:
//!
//! * [`name`] and [`message`] implement the DNS wire format.
//! * [`query`] holds the in-flight query object along with request
//!   parsing, response serialization, and query-log rendering.
//! * [`resolver`] defines the resolution seam and a trivial reference
//!   implementation.
//! * [`conn`] implements connection objects, the per-shard FIFO queues,
//!   the TCP LRU set, and listener provisioning.
//! * [`vectorloop`] is the per-shard processing loop itself.
//! * [`channel`] provides the SPSC channels used between shards and the
//!   support threads found in [`workers`].
//! * [`supervisor`] wires everything together and manages threads.

pub mod channel;
pub mod config;
pub mod conn;
pub mod message;
pub mod metrics;
pub mod name;
pub mod query;
pub mod resolver;
pub mod supervisor;
pub mod util;
pub mod vectorloop;
pub mod workers;
