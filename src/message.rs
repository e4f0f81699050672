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

//! DNS message primitives: header field access, opcodes, end codes,
//! RR types and classes, and big-endian integer helpers.
//!
//! Messages are handled as raw octet buffers throughout the server; the
//! [`header`] submodule reads and writes the fixed twelve-octet header
//! in place, and the enumerations here give names to the wire values
//! the rest of the crate works with.

use std::fmt;

////////////////////////////////////////////////////////////////////////
// WIRE CONSTANTS                                                     //
////////////////////////////////////////////////////////////////////////

/// The size of the DNS message header.
pub const HEADER_SIZE: usize = 12;

/// The maximum size of a DNS message received over UDP.
pub const PACKETSZ: usize = 512;

/// The maximum size of a UDP response message (with EDNS).
pub const UDP_MAXMSG: usize = 4096;

/// The maximum size of any DNS message.
pub const MAXMSG: usize = 65535;

/// The number of octets of fixed data in a question.
pub const QFIXEDSZ: usize = 4;

/// The number of octets of fixed data in a resource record (type,
/// class, TTL, and RDLENGTH).
pub const RRFIXEDSZ: usize = 10;

/// The maximum number of records accepted into a response's answer
/// section.
pub const RESP_MAX_ANSWER: usize = 128;

/// The maximum number of records accepted into a response's authority
/// section.
pub const RESP_MAX_AUTHORITY: usize = 16;

/// The maximum number of records accepted into a response's additional
/// section, excluding the OPT pseudo-RR.
pub const RESP_MAX_ADDITIONAL: usize = 128;

/// The maximum number of names tracked for compression while packing a
/// single response. This bounds the compression table, not the number
/// of names in the response.
pub const COMPRESSED_NAMES_MAX: usize = 64;

/// The EDNS option code for the Client Subnet option (RFC 7871).
pub const EDNS_OPT_CLIENT_SUBNET: u16 = 8;

////////////////////////////////////////////////////////////////////////
// BIG-ENDIAN INTEGER HELPERS                                         //
////////////////////////////////////////////////////////////////////////

/// Reads a network-byte-order `u16` at `offset` of `buf`. Returns
/// [`None`] when the buffer is too short.
pub fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let octets = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([octets[0], octets[1]]))
}

/// Reads a network-byte-order `u32` at `offset` of `buf`. Returns
/// [`None`] when the buffer is too short.
pub fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let octets = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]]))
}

/// Writes a `u16` in network byte order at `offset` of `buf`. The
/// caller must have checked that the buffer is long enough.
pub fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Writes a `u32` in network byte order at `offset` of `buf`. The
/// caller must have checked that the buffer is long enough.
pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

////////////////////////////////////////////////////////////////////////
// HEADER FIELD ACCESS                                                //
////////////////////////////////////////////////////////////////////////

/// In-place access to the fields of a DNS message header.
///
/// All functions operate on a buffer whose first twelve octets are the
/// header; callers are responsible for the length check (the parser
/// rejects short messages before any accessor runs, and response
/// buffers are always allocated larger than the header).
pub mod header {
    const ID_START: usize = 0;
    const FLAGS_HI: usize = 2;
    const FLAGS_LO: usize = 3;
    const QR_MASK: u8 = 0x80;
    const OPCODE_MASK: u8 = 0x78;
    const OPCODE_SHIFT: usize = 3;
    const AA_MASK: u8 = 0x04;
    const TC_MASK: u8 = 0x02;
    const RD_MASK: u8 = 0x01;
    const RCODE_MASK: u8 = 0x0f;
    const QDCOUNT_START: usize = 4;
    const ANCOUNT_START: usize = 6;
    const NSCOUNT_START: usize = 8;
    const ARCOUNT_START: usize = 10;

    pub fn id(msg: &[u8]) -> u16 {
        u16::from_be_bytes([msg[ID_START], msg[ID_START + 1]])
    }

    pub fn set_id(msg: &mut [u8], id: u16) {
        msg[ID_START..ID_START + 2].copy_from_slice(&id.to_be_bytes());
    }

    pub fn qr(msg: &[u8]) -> bool {
        msg[FLAGS_HI] & QR_MASK != 0
    }

    pub fn set_qr(msg: &mut [u8], qr: bool) {
        set_flag(msg, FLAGS_HI, QR_MASK, qr);
    }

    pub fn opcode(msg: &[u8]) -> u8 {
        (msg[FLAGS_HI] & OPCODE_MASK) >> OPCODE_SHIFT
    }

    pub fn set_opcode(msg: &mut [u8], opcode: u8) {
        msg[FLAGS_HI] = (msg[FLAGS_HI] & !OPCODE_MASK) | ((opcode << OPCODE_SHIFT) & OPCODE_MASK);
    }

    pub fn aa(msg: &[u8]) -> bool {
        msg[FLAGS_HI] & AA_MASK != 0
    }

    pub fn set_aa(msg: &mut [u8], aa: bool) {
        set_flag(msg, FLAGS_HI, AA_MASK, aa);
    }

    pub fn tc(msg: &[u8]) -> bool {
        msg[FLAGS_HI] & TC_MASK != 0
    }

    pub fn set_tc(msg: &mut [u8], tc: bool) {
        set_flag(msg, FLAGS_HI, TC_MASK, tc);
    }

    pub fn rd(msg: &[u8]) -> bool {
        msg[FLAGS_HI] & RD_MASK != 0
    }

    pub fn set_rd(msg: &mut [u8], rd: bool) {
        set_flag(msg, FLAGS_HI, RD_MASK, rd);
    }

    pub fn rcode(msg: &[u8]) -> u8 {
        msg[FLAGS_LO] & RCODE_MASK
    }

    pub fn set_rcode(msg: &mut [u8], rcode: u8) {
        msg[FLAGS_LO] = (msg[FLAGS_LO] & !RCODE_MASK) | (rcode & RCODE_MASK);
    }

    pub fn qdcount(msg: &[u8]) -> u16 {
        u16::from_be_bytes([msg[QDCOUNT_START], msg[QDCOUNT_START + 1]])
    }

    pub fn ancount(msg: &[u8]) -> u16 {
        u16::from_be_bytes([msg[ANCOUNT_START], msg[ANCOUNT_START + 1]])
    }

    pub fn set_ancount(msg: &mut [u8], count: u16) {
        msg[ANCOUNT_START..ANCOUNT_START + 2].copy_from_slice(&count.to_be_bytes());
    }

    pub fn nscount(msg: &[u8]) -> u16 {
        u16::from_be_bytes([msg[NSCOUNT_START], msg[NSCOUNT_START + 1]])
    }

    pub fn set_nscount(msg: &mut [u8], count: u16) {
        msg[NSCOUNT_START..NSCOUNT_START + 2].copy_from_slice(&count.to_be_bytes());
    }

    pub fn arcount(msg: &[u8]) -> u16 {
        u16::from_be_bytes([msg[ARCOUNT_START], msg[ARCOUNT_START + 1]])
    }

    pub fn set_arcount(msg: &mut [u8], count: u16) {
        msg[ARCOUNT_START..ARCOUNT_START + 2].copy_from_slice(&count.to_be_bytes());
    }

    /// Clears every header field.
    pub fn clear(msg: &mut [u8]) {
        msg[..super::HEADER_SIZE].fill(0);
    }

    fn set_flag(msg: &mut [u8], byte: usize, mask: u8, value: bool) {
        if value {
            msg[byte] |= mask;
        } else {
            msg[byte] &= !mask;
        }
    }
}

////////////////////////////////////////////////////////////////////////
// OPCODES                                                            //
////////////////////////////////////////////////////////////////////////

/// The OPCODE field of the DNS message header.
///
/// Only [`Opcode::Query`] is served; every other opcode is answered
/// with NOTIMP.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Opcode {
    Query,
    IQuery,
    Status,
    Notify,
    Update,
    Unassigned(u8),
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Query,
            1 => Self::IQuery,
            2 => Self::Status,
            4 => Self::Notify,
            5 => Self::Update,
            v => Self::Unassigned(v),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        match value {
            Opcode::Query => 0,
            Opcode::IQuery => 1,
            Opcode::Status => 2,
            Opcode::Notify => 4,
            Opcode::Update => 5,
            Opcode::Unassigned(v) => v,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// END CODES                                                          //
////////////////////////////////////////////////////////////////////////

/// The disposition of a query as it moves through the processing
/// pipeline.
///
/// Non-negative values correspond to DNS RCODEs and mean that a
/// response is to be packed and sent. [`EndCode::Unknown`] means the
/// query is still in flight and no decision has been made. The
/// remaining negative values are internal terminations for which no
/// response is emitted: the request is dropped (or, for the TCP write
/// codes, the response could not be delivered).
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(i32)]
pub enum EndCode {
    /// Still in flight; no decision made yet.
    Unknown = -1,

    /// The request was shorter than a DNS header. Dropped.
    ShortHeader = -2,

    /// A UDP request exceeded 512 octets. Dropped.
    TooLarge = -3,

    /// The request had the TC bit set. Dropped.
    QueryTc = -4,

    /// Writing the response to a TCP socket failed.
    TcpWriteErr = -6,

    /// The TCP connection closed before the response was written.
    TcpWriteClose = -7,

    NoError = 0,
    FormErr = 1,
    ServFail = 2,
    NxDomain = 3,
    NotImpl = 4,
    Refused = 5,

    /// EDNS version not supported; sent via the extended RCODE.
    BadVers = 16,
}

impl EndCode {
    /// Returns the code as a signed integer, preserving the sign
    /// convention of the pipeline (negative: no response).
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Returns whether a response is to be packed and sent for a query
    /// ending with this code.
    pub fn responds(self) -> bool {
        self.as_i32() >= 0
    }

    /// Returns whether the code fits in the four-bit header RCODE
    /// field. Larger codes are carried by the EDNS extended RCODE.
    pub fn fits_in_header(self) -> bool {
        (0..16).contains(&self.as_i32())
    }

    /// Returns the low four bits of the RCODE for the header, valid
    /// only for responding codes.
    pub fn header_rcode(self) -> u8 {
        (self.as_i32() & 0x0f) as u8
    }

    /// Returns the upper eight bits of the twelve-bit extended RCODE.
    pub fn extended_rcode(self) -> u8 {
        (self.as_i32() >> 4) as u8
    }
}

impl fmt::Display for EndCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::ShortHeader => "shortheader",
            Self::TooLarge => "toolarge",
            Self::QueryTc => "querytc",
            Self::TcpWriteErr => "tcpwriteerr",
            Self::TcpWriteClose => "tcpwriteclose",
            Self::NoError => "noerror",
            Self::FormErr => "formerr",
            Self::ServFail => "servfail",
            Self::NxDomain => "nxdomain",
            Self::NotImpl => "notimpl",
            Self::Refused => "refused",
            Self::BadVers => "badvers",
        };
        f.write_str(name)
    }
}

////////////////////////////////////////////////////////////////////////
// RR TYPES                                                           //
////////////////////////////////////////////////////////////////////////

/// A DNS RR type or QTYPE.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Type(pub u16);

impl Type {
    pub const A: Self = Self(1);
    pub const NS: Self = Self(2);
    pub const CNAME: Self = Self(5);
    pub const SOA: Self = Self(6);
    pub const PTR: Self = Self(12);
    pub const MX: Self = Self(15);
    pub const TXT: Self = Self(16);
    pub const AAAA: Self = Self(28);
    pub const SRV: Self = Self(33);
    pub const OPT: Self = Self(41);

    /// Returns whether this QTYPE is one the server resolves. The
    /// supported set is currently A only; everything else is answered
    /// with NOTIMP.
    pub fn supported(self) -> bool {
        self == Self::A
    }

    /// Returns the presentation-format name of the type, used by the
    /// query log.
    pub fn to_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::NS => "NS",
            Self::CNAME => "CNAME",
            Self::SOA => "SOA",
            Self::PTR => "PTR",
            Self::MX => "MX",
            Self::TXT => "TXT",
            Self::AAAA => "AAAA",
            Self::SRV => "SRV",
            Self::OPT => "OPT",
            _ => "unknown",
        }
    }
}

impl From<u16> for Type {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

////////////////////////////////////////////////////////////////////////
// RR CLASSES                                                         //
////////////////////////////////////////////////////////////////////////

/// A DNS RR class or QCLASS.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Class(pub u16);

impl Class {
    pub const IN: Self = Self(1);
    pub const CH: Self = Self(3);
    pub const HS: Self = Self(4);
    pub const ANY: Self = Self(255);

    /// Returns whether this QCLASS is one the server resolves.
    /// Currently IN only.
    pub fn supported(self) -> bool {
        self == Self::IN
    }

    /// Returns the presentation-format name of the class, used by the
    /// query log.
    pub fn to_str(self) -> &'static str {
        match self {
            Self::IN => "IN",
            Self::CH => "CH",
            Self::HS => "HS",
            Self::ANY => "ANY",
            _ => "invalid",
        }
    }
}

impl From<u16> for Class {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
