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

//! Connection objects.
//!
//! A shard owns up to four listener connections (UDP/TCP over
//! IPv4/IPv6) plus one connection per established TCP session. All of
//! them live in the shard's connection arena and are addressed by
//! token (slot index) from the FIFO queues and the readiness sets.
//! Established TCP connections are additionally tracked in the shard's
//! [`LruSet`](lru::LruSet), keyed by a shard-unique connection id,
//! which drives timeout enforcement.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{Instant, SystemTime};

use crate::config::Config;
use crate::message::{read_u16, PACKETSZ};
use crate::metrics::Metrics;
use crate::query::Query;

pub mod fifo;
pub mod listener;
pub mod lru;
pub mod udp;

pub use fifo::ConnFifo;
pub use lru::LruSet;
pub use udp::UdpListenerState;

////////////////////////////////////////////////////////////////////////
// TCP CONNECTION STATE MACHINE                                       //
////////////////////////////////////////////////////////////////////////

/// The state of an established TCP connection. The first three states
/// are live (each with its own timeout clock); the rest are terminal
/// and route the connection to the release stage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TcpState {
    /// Partial query data is buffered; the receive-timeout clock runs.
    WaitForQueryData,

    /// Idle between queries; the keepalive clock runs.
    WaitForQuery,

    /// The response is not fully flushed; the send-timeout clock runs.
    WaitForWrite,

    /// The peer closed its sending side.
    ClosedForRead,

    /// The peer closed its receiving side before the response was
    /// fully written.
    ClosedForWrite,

    /// A socket read failed.
    ReadErr,

    /// A socket write failed.
    WriteErr,

    /// No connection id could be assigned.
    AssignConnIdErr,

    /// A frame's length prefix exceeded the maximum query size.
    QuerySizeTooLarge,
}

impl TcpState {
    /// Whether the state routes the connection to release.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            Self::WaitForQueryData | Self::WaitForQuery | Self::WaitForWrite
        )
    }
}

/// What frame segmentation found in a TCP read buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Segmentation {
    /// This many complete frames were copied into query slots.
    Frames(usize),

    /// No complete frame yet; more data must arrive.
    Partial,

    /// A frame's length prefix exceeded the maximum query size.
    FrameTooLarge,
}

/// The per-connection state of an established TCP session.
#[derive(Debug)]
pub struct TcpConn {
    pub client_addr: SocketAddr,
    pub local_addr: SocketAddr,

    /// Buffered inbound bytes, sized for the configured number of
    /// simultaneous maximum-size frames.
    pub read_buffer: Box<[u8]>,
    pub read_buffer_len: usize,

    /// The query slot the write stage resumes from.
    pub query_write_index: usize,

    /// The offset within that query's response already written.
    pub write_index: usize,

    /// Query slots, one per simultaneous query.
    pub queries: Vec<Query>,

    /// Populated query slots this round.
    pub queries_count: usize,

    /// Queries processed over the connection's lifetime.
    pub queries_total: u64,

    pub state: TcpState,

    /// When the connection was accepted.
    pub start_time: Instant,

    /// When the state's timeout clock expires.
    pub timeout: Instant,
}

impl TcpConn {
    pub fn new(cfg: &Config, client_addr: SocketAddr, local_addr: SocketAddr, now: Instant) -> Self {
        Self {
            client_addr,
            local_addr,
            read_buffer: vec![0; cfg.tcp_readbuff_size()].into_boxed_slice(),
            read_buffer_len: 0,
            query_write_index: 0,
            write_index: 0,
            queries: (0..cfg.tcp_conn_simultaneous_queries_count)
                .map(|_| Query::new_tcp())
                .collect(),
            queries_count: 0,
            queries_total: 0,
            state: TcpState::WaitForQueryData,
            start_time: now,
            timeout: now + cfg.tcp_query_recv_timeout(),
        }
    }

    /// Segments the read buffer into length-prefixed frames, copying
    /// up to the simultaneous-query limit into query slots. Query
    /// slots from the previous round are reset first. Leftover bytes
    /// stay in the read buffer for the next round.
    pub fn segment_frames(&mut self, now: SystemTime) -> Segmentation {
        for query in &mut self.queries[..self.queries_count] {
            query.reset();
        }
        self.queries_count = 0;

        let mut offset = 0;
        let mut count = 0;
        while count < self.queries.len() {
            let remaining = self.read_buffer_len - offset;
            if remaining < 2 {
                break;
            }
            let frame_len = read_u16(&self.read_buffer, offset).unwrap() as usize;
            if frame_len > PACKETSZ {
                return Segmentation::FrameTooLarge;
            }
            if remaining < 2 + frame_len {
                break;
            }
            self.queries[count].request_buffer[..2 + frame_len]
                .copy_from_slice(&self.read_buffer[offset..offset + 2 + frame_len]);
            self.queries[count].request_len = frame_len;
            self.queries[count].client_addr = Some(self.client_addr);
            self.queries[count].local_addr = Some(self.local_addr);
            self.queries[count].recv_time = now;
            offset += 2 + frame_len;
            count += 1;
        }

        if count == 0 {
            return Segmentation::Partial;
        }
        self.queries_count = count;
        self.queries_total += count as u64;
        Segmentation::Frames(count)
    }

    /// The read-buffer bytes consumed by this round's frames.
    pub fn consumed_bytes(&self) -> usize {
        self.queries[..self.queries_count]
            .iter()
            .map(|q| 2 + q.request_len)
            .sum()
    }

    /// Reports the release-time counter for the state the connection
    /// ended in. For the live states this means the matching timeout
    /// fired.
    pub fn report_release_metrics(&self, metrics: &Metrics) {
        match self.state {
            TcpState::AssignConnIdErr => metrics.tcp.conn_id_unavailable.inc(),
            TcpState::QuerySizeTooLarge => metrics.tcp.query_len_toolarge.inc(),
            TcpState::ClosedForRead => {
                if self.read_buffer_len != 0 {
                    metrics.tcp.closed_partial_query.inc();
                } else if self.queries_total == 0 {
                    metrics.tcp.closed_no_query.inc();
                }
            }
            TcpState::ClosedForWrite => metrics.tcp.sock_closed_for_write.inc(),
            TcpState::ReadErr => metrics.tcp.sock_read_err.inc(),
            TcpState::WriteErr => metrics.tcp.sock_write_err.inc(),
            TcpState::WaitForQuery => metrics.tcp.keepalive_timeout.inc(),
            TcpState::WaitForQueryData => metrics.tcp.query_recv_timeout.inc(),
            TcpState::WaitForWrite => metrics.tcp.sock_write_timeout.inc(),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// THE CONNECTION OBJECT                                              //
////////////////////////////////////////////////////////////////////////

/// The role-specific half of a connection.
#[derive(Debug)]
pub enum ConnKind {
    UdpListener(Box<UdpListenerState>),
    TcpListener,
    TcpConn(Box<TcpConn>),
}

/// A connection: one listener or one established TCP session.
#[derive(Debug)]
pub struct Conn {
    /// The connection id; meaningful only for established TCP
    /// connections, where it keys the shard's LRU set.
    pub cid: u64,

    /// The socket, or -1 once closed.
    pub fd: RawFd,

    pub ipv6: bool,

    /// Set when the socket returned would-block on read; the next
    /// read-readiness edge clears it and requeues the connection.
    pub waiting_for_read: bool,

    /// Set when the socket returned would-block on write.
    pub waiting_for_write: bool,

    pub in_read_queue: bool,
    pub in_write_queue: bool,
    pub in_release_queue: bool,

    /// Whether the connection currently sits in the shard's LRU set.
    pub in_lru: bool,

    pub kind: ConnKind,
}

impl Conn {
    pub fn new(fd: RawFd, ipv6: bool, kind: ConnKind) -> Self {
        Self {
            cid: 0,
            fd,
            ipv6,
            waiting_for_read: false,
            waiting_for_write: false,
            in_read_queue: false,
            in_write_queue: false,
            in_release_queue: false,
            in_lru: false,
            kind,
        }
    }

    pub fn is_udp_listener(&self) -> bool {
        matches!(self.kind, ConnKind::UdpListener(_))
    }

    pub fn is_tcp_listener(&self) -> bool {
        matches!(self.kind, ConnKind::TcpListener)
    }

    pub fn is_tcp_conn(&self) -> bool {
        matches!(self.kind, ConnKind::TcpConn(_))
    }

    /// The TCP session state; panics if this is not an established TCP
    /// connection (an invariant violation).
    pub fn tcp(&self) -> &TcpConn {
        match &self.kind {
            ConnKind::TcpConn(tcp) => tcp,
            _ => panic!("connection is not an established TCP connection"),
        }
    }

    pub fn tcp_mut(&mut self) -> &mut TcpConn {
        match &mut self.kind {
            ConnKind::TcpConn(tcp) => tcp,
            _ => panic!("connection is not an established TCP connection"),
        }
    }

    /// The UDP listener state; panics if this is not a UDP listener.
    pub fn udp(&mut self) -> &mut UdpListenerState {
        match &mut self.kind {
            ConnKind::UdpListener(udp) => udp,
            _ => panic!("connection is not a UDP listener"),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// CONNECTION ID ASSIGNMENT                                           //
////////////////////////////////////////////////////////////////////////

/// Assigns a connection id unique within the shard: the first id not
/// in the LRU set, scanning forward from the base and wrapping. The
/// base advances to each assigned id, so consecutive accepts get
/// consecutive ids. Failure would require every 64-bit id to be in
/// use.
pub fn tcp_id_assign(lru: &LruSet, base: &mut u64) -> Option<u64> {
    for id in base.wrapping_add(1)..u64::MAX {
        if !lru.contains(id) {
            *base = id;
            return Some(id);
        }
    }
    for id in 0..*base {
        if !lru.contains(id) {
            *base = id;
            return Some(id);
        }
    }
    None
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::put_u16;

    fn test_conn(cfg: &Config) -> TcpConn {
        TcpConn::new(
            cfg,
            "192.0.2.1:40000".parse().unwrap(),
            "127.0.0.1:53".parse().unwrap(),
            Instant::now(),
        )
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0; 2];
        put_u16(&mut out, 0, payload.len() as u16);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn segmentation_splits_pipelined_frames() {
        let cfg = Config::default();
        let mut conn = test_conn(&cfg);
        let mut data = frame(&[1; 20]);
        data.extend_from_slice(&frame(&[2; 30]));
        conn.read_buffer[..data.len()].copy_from_slice(&data);
        conn.read_buffer_len = data.len();

        let outcome = conn.segment_frames(SystemTime::now());
        assert_eq!(outcome, Segmentation::Frames(2));
        assert_eq!(conn.queries_count, 2);
        assert_eq!(conn.queries[0].request_len, 20);
        assert_eq!(conn.queries[1].request_len, 30);
        assert_eq!(conn.queries[1].request(), &[2; 30]);
        assert_eq!(conn.consumed_bytes(), data.len());
        assert_eq!(conn.queries_total, 2);
    }

    #[test]
    fn segmentation_caps_frames_at_the_simultaneous_query_count() {
        let mut cfg = Config::default();
        cfg.tcp_conn_simultaneous_queries_count = 2;
        let mut conn = test_conn(&cfg);
        let mut data = Vec::new();
        for _ in 0..3 {
            data.extend_from_slice(&frame(&[7; 12]));
        }
        conn.read_buffer[..data.len()].copy_from_slice(&data);
        conn.read_buffer_len = data.len();

        assert_eq!(
            conn.segment_frames(SystemTime::now()),
            Segmentation::Frames(2)
        );
        // The third frame's bytes remain for the next round.
        assert_eq!(conn.consumed_bytes(), 2 * 14);
        assert_eq!(conn.read_buffer_len - conn.consumed_bytes(), 14);
    }

    #[test]
    fn segmentation_reports_partial_frames() {
        let cfg = Config::default();
        let mut conn = test_conn(&cfg);
        // Length prefix of 30 but only 10 payload bytes buffered.
        let mut data = frame(&[9; 30]);
        data.truncate(12);
        conn.read_buffer[..data.len()].copy_from_slice(&data);
        conn.read_buffer_len = data.len();
        assert_eq!(conn.segment_frames(SystemTime::now()), Segmentation::Partial);
        assert_eq!(conn.queries_count, 0);
    }

    #[test]
    fn segmentation_rejects_oversized_frames() {
        let cfg = Config::default();
        let mut conn = test_conn(&cfg);
        put_u16(&mut conn.read_buffer, 0, 513);
        conn.read_buffer_len = 2;
        assert_eq!(
            conn.segment_frames(SystemTime::now()),
            Segmentation::FrameTooLarge
        );
    }

    #[test]
    fn id_assignment_skips_live_ids_and_advances_the_base() {
        let mut lru = LruSet::new();
        let mut base = 0u64;
        assert_eq!(tcp_id_assign(&lru, &mut base), Some(1));
        lru.insert(1, 0);
        assert_eq!(tcp_id_assign(&lru, &mut base), Some(2));
        lru.insert(2, 1);
        // With 3 free, a bumped base lands there.
        base = 2;
        assert_eq!(tcp_id_assign(&lru, &mut base), Some(3));
        assert_eq!(base, 3);
    }

    #[test]
    fn id_assignment_wraps_past_the_end_of_the_space() {
        let mut lru = LruSet::new();
        let mut base = u64::MAX - 2;
        lru.insert(u64::MAX - 1, 0);
        assert_eq!(tcp_id_assign(&lru, &mut base), Some(0));
        assert_eq!(base, 0);
    }

    #[test]
    fn terminal_states_are_classified() {
        assert!(!TcpState::WaitForQuery.is_terminal());
        assert!(!TcpState::WaitForQueryData.is_terminal());
        assert!(!TcpState::WaitForWrite.is_terminal());
        assert!(TcpState::ClosedForRead.is_terminal());
        assert!(TcpState::QuerySizeTooLarge.is_terminal());
    }
}
