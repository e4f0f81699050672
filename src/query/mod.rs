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

//! The in-flight query object.
//!
//! A [`Query`] holds one DNS transaction from receipt through
//! response transmission and logging. Query objects are created once,
//! together with the connection that owns them (one per UDP vector
//! slot, or one per simultaneous-query slot of a TCP connection), and
//! reset between uses; nothing on the per-query path allocates.
//!
//! Parsing lives in [`parse`], response serialization in [`pack`],
//! and query-log rendering in [`log`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use arrayvec::ArrayVec;

use crate::message::{
    Class, EndCode, Type, MAXMSG, PACKETSZ, RESP_MAX_ADDITIONAL, RESP_MAX_ANSWER,
    RESP_MAX_AUTHORITY, UDP_MAXMSG,
};
use crate::name::{CompressionTable, WireName};
use crate::resolver::RrRecord;

pub mod log;
pub mod pack;
pub mod parse;

////////////////////////////////////////////////////////////////////////
// TRANSPORT                                                          //
////////////////////////////////////////////////////////////////////////

/// The transport a query arrived over.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Transport {
    Udp,
    Tcp,
}

////////////////////////////////////////////////////////////////////////
// EDNS STATE                                                         //
////////////////////////////////////////////////////////////////////////

/// Parsed EDNS Client Subnet option state (RFC 7871).
#[derive(Clone, Debug)]
pub struct EdnsClientSubnet {
    /// Whether a valid Client Subnet option is present and should be
    /// echoed in the response.
    pub valid: bool,

    /// Address family: 1 for IPv4, 2 for IPv6.
    pub family: u16,

    /// The prefix length the client asked about.
    pub source_mask: u8,

    /// The prefix length the answer covers. Zero in requests; the
    /// resolution policy sets it for the response.
    pub scope_mask: u8,

    /// The (possibly truncated) client network address.
    pub addr: std::net::IpAddr,
}

impl Default for EdnsClientSubnet {
    fn default() -> Self {
        Self {
            valid: false,
            family: 0,
            source_mask: 0,
            scope_mask: 0,
            addr: std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Parsed EDNS(0) OPT pseudo-RR state (RFC 6891).
#[derive(Clone, Debug, Default)]
pub struct Edns {
    /// Whether a complete, valid OPT record was parsed. An OPT record
    /// is appended to the response only when this is set (or when the
    /// request is answered with BADVERS).
    pub valid: bool,

    /// Whether an OPT record was seen at all.
    pub present: bool,

    /// The upper eight bits of the extended RCODE for the response.
    pub extended_rcode: u8,

    /// The EDNS version from the request. Only version 0 is served.
    pub version: u8,

    /// The advertised maximum UDP response size, clamped to
    /// `[512, 4096]`.
    pub udp_resp_len: u16,

    /// The DO bit (DNSSEC OK).
    pub dnssec: bool,

    /// Client Subnet option state.
    pub client_subnet: EdnsClientSubnet,
}

////////////////////////////////////////////////////////////////////////
// RESPONSE SECTION ENTRIES                                           //
////////////////////////////////////////////////////////////////////////

/// One record placed in a response section by the resolver.
///
/// When `owner_is_question` is set, the record is emitted with the
/// query's question name as its owner; otherwise the record's own name
/// is used.
#[derive(Clone, Debug)]
pub struct SectionEntry {
    pub owner_is_question: bool,
    pub record: Arc<RrRecord>,
}

impl SectionEntry {
    pub fn at_question(record: Arc<RrRecord>) -> Self {
        Self {
            owner_is_question: true,
            record,
        }
    }

    pub fn at_record_name(record: Arc<RrRecord>) -> Self {
        Self {
            owner_is_question: false,
            record,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// THE QUERY OBJECT                                                   //
////////////////////////////////////////////////////////////////////////

/// The size of the presentation-form question name buffer.
pub const QUESTION_NAME_BUF: usize = 256;

/// The size of a UDP request buffer. One octet larger than the largest
/// legal UDP query so that oversized datagrams are detectable rather
/// than silently truncated.
pub const UDP_REQUEST_BUF: usize = PACKETSZ + 1;

/// The size of a TCP request buffer: the two-octet length prefix plus
/// the largest frame the server accepts.
pub const TCP_REQUEST_BUF: usize = 2 + PACKETSZ;

/// The initial size of a TCP response buffer. The buffer grows on
/// demand (see [`Query::grow_response_buffer`]) up to the maximum
/// frame size.
pub const TCP_RESPONSE_BUF_INITIAL: usize = 2 + UDP_MAXMSG;

/// One DNS transaction.
#[derive(Debug)]
pub struct Query {
    /// The transport the query arrived over.
    pub transport: Transport,

    /// The client's address, for logging and (over UDP) for
    /// addressing the reply.
    pub client_addr: Option<SocketAddr>,

    /// The local address the query arrived at.
    pub local_addr: Option<SocketAddr>,

    /// The raw request. For TCP this includes the two-octet length
    /// prefix at offset 0; the DNS message begins at offset 2.
    pub request_buffer: Box<[u8]>,

    /// The length of the DNS message in the request buffer (excluding
    /// any TCP length prefix).
    pub request_len: usize,

    /// The question name in uncompressed wire form.
    pub question_wire: WireName,

    /// The question name in presentation form (dot-separated ASCII
    /// with escapes, absolute).
    pub question_name: Box<[u8]>,

    /// The length of the presentation-form question name.
    pub question_name_len: usize,

    pub qtype: Type,
    pub qclass: Class,

    /// Parsed EDNS state.
    pub edns: Edns,

    /// The response under construction. For TCP, bytes 0-1 hold the
    /// length prefix and the DNS header begins at offset 2.
    pub response_buffer: Vec<u8>,

    /// The number of response octets to transmit (including any TCP
    /// length prefix).
    pub response_len: usize,

    /// Answer section records chosen by the resolver.
    pub answer: ArrayVec<SectionEntry, RESP_MAX_ANSWER>,

    /// Authority section records chosen by the resolver.
    pub authority: ArrayVec<SectionEntry, RESP_MAX_AUTHORITY>,

    /// Additional section records chosen by the resolver, excluding
    /// the OPT pseudo-RR (which the serializer appends itself).
    pub additional: ArrayVec<SectionEntry, RESP_MAX_ADDITIONAL>,

    /// Names already packed into the response, for compression.
    pub compression: CompressionTable,

    /// When the request was read from the socket.
    pub recv_time: SystemTime,

    /// When the response was written to the socket.
    pub send_time: Option<SystemTime>,

    /// The disposition of the query (see [`EndCode`]).
    pub end_code: EndCode,
}

impl Query {
    /// Creates a query slot for a UDP vector entry.
    pub fn new_udp() -> Self {
        Self::new(Transport::Udp)
    }

    /// Creates a query slot for a TCP connection.
    pub fn new_tcp() -> Self {
        Self::new(Transport::Tcp)
    }

    fn new(transport: Transport) -> Self {
        let (request_size, response_size) = match transport {
            Transport::Udp => (UDP_REQUEST_BUF, UDP_MAXMSG),
            Transport::Tcp => (TCP_REQUEST_BUF, TCP_RESPONSE_BUF_INITIAL),
        };
        Self {
            transport,
            client_addr: None,
            local_addr: None,
            request_buffer: vec![0; request_size].into_boxed_slice(),
            request_len: 0,
            question_wire: WireName::new(),
            question_name: vec![0; QUESTION_NAME_BUF].into_boxed_slice(),
            question_name_len: 0,
            qtype: Type::default(),
            qclass: Class::default(),
            edns: Edns::default(),
            response_buffer: vec![0; response_size],
            response_len: 0,
            answer: ArrayVec::new(),
            authority: ArrayVec::new(),
            additional: ArrayVec::new(),
            compression: CompressionTable::new(),
            recv_time: SystemTime::UNIX_EPOCH,
            send_time: None,
            end_code: EndCode::Unknown,
        }
    }

    /// Resets the query for reuse. Buffers keep their allocations.
    pub fn reset(&mut self) {
        self.request_len = 0;
        self.question_wire.clear();
        self.question_name_len = 0;
        self.qtype = Type::default();
        self.qclass = Class::default();
        self.edns = Edns::default();
        self.response_len = 0;
        self.clear_sections();
        self.compression.reset();
        self.send_time = None;
        self.end_code = EndCode::Unknown;
    }

    /// Drops the resolver record references held in the response
    /// sections. Called once the query has been logged, so that the
    /// shard retains no reference into a resource artifact between
    /// iterations.
    pub fn clear_sections(&mut self) {
        self.answer.clear();
        self.authority.clear();
        self.additional.clear();
    }

    /// Returns the offset of the DNS message within the request and
    /// response buffers (two for TCP's length prefix, zero for UDP).
    pub fn message_offset(&self) -> usize {
        match self.transport {
            Transport::Udp => 0,
            Transport::Tcp => 2,
        }
    }

    /// Returns the received DNS message.
    pub fn request(&self) -> &[u8] {
        let off = self.message_offset();
        &self.request_buffer[off..off + self.request_len]
    }

    /// Returns the serialized response, including any TCP length
    /// prefix, ready for transmission.
    pub fn response(&self) -> &[u8] {
        &self.response_buffer[..self.response_len]
    }

    /// Returns the presentation-form question name.
    pub fn question_name(&self) -> &[u8] {
        &self.question_name[..self.question_name_len]
    }

    /// Grows a TCP response buffer by one increment, up to the
    /// maximum frame size. Returns whether the buffer grew.
    pub fn grow_response_buffer(&mut self) -> bool {
        if self.transport != Transport::Tcp {
            return false;
        }
        let max = 2 + MAXMSG;
        let current = self.response_buffer.len();
        if current >= max {
            return false;
        }
        let new = usize::min(current + UDP_MAXMSG, max);
        self.response_buffer.resize(new, 0);
        true
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_parse_state() {
        let mut query = Query::new_udp();
        query.request_len = 40;
        query.question_name_len = 3;
        query.qtype = Type::A;
        query.edns.valid = true;
        query.end_code = EndCode::NoError;
        query.response_len = 64;
        query.reset();
        assert_eq!(query.request_len, 0);
        assert_eq!(query.question_name_len, 0);
        assert_eq!(query.qtype, Type::default());
        assert!(!query.edns.valid);
        assert_eq!(query.end_code, EndCode::Unknown);
        assert_eq!(query.response_len, 0);
    }

    #[test]
    fn message_offset_accounts_for_tcp_prefix() {
        assert_eq!(Query::new_udp().message_offset(), 0);
        assert_eq!(Query::new_tcp().message_offset(), 2);
    }

    #[test]
    fn tcp_response_buffer_grows_to_frame_limit() {
        let mut query = Query::new_tcp();
        let mut size = query.response_buffer.len();
        assert_eq!(size, TCP_RESPONSE_BUF_INITIAL);
        while query.grow_response_buffer() {
            assert!(query.response_buffer.len() > size);
            size = query.response_buffer.len();
        }
        assert_eq!(size, 2 + MAXMSG);
    }

    #[test]
    fn udp_response_buffer_does_not_grow() {
        let mut query = Query::new_udp();
        assert!(!query.grow_response_buffer());
        assert_eq!(query.response_buffer.len(), UDP_MAXMSG);
    }
}
