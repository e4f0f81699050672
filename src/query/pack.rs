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

//! Response serialization.
//!
//! [`pack_response`] writes the query's response into its response
//! buffer: header, answer/authority/additional sections with name
//! compression, and finally the EDNS OPT pseudo-RR when one is owed.
//! If a section runs out of room, the TC bit is set, the remaining
//! sections are skipped, and the header is still finalized so that the
//! (truncated) response can be sent.

use crate::message::{
    header, put_u16, put_u32, EndCode, Type, EDNS_OPT_CLIENT_SUBNET, HEADER_SIZE, PACKETSZ,
    RRFIXEDSZ,
};
use crate::name::{self, CompressionTable, WireName};
use crate::query::{Edns, Query, SectionEntry, Transport};
use crate::resolver::RrRecord;

/// Serializes the response for a query whose end code calls for one.
///
/// Returns [`Error::Truncation`] when the response did not fit; the
/// truncated response is still complete and sendable. For TCP, the
/// caller may grow the response buffer and pack again.
pub fn pack_response(query: &mut Query) -> Result<(), Error> {
    let msg_off = query.message_offset();

    // The response size limit: over UDP, 512 octets unless the request
    // carried a valid EDNS advertisement; over TCP, the current
    // response buffer less the length prefix.
    let limit = match query.transport {
        Transport::Udp => {
            if query.edns.valid {
                query.edns.udp_resp_len as usize
            } else {
                PACKETSZ
            }
        }
        Transport::Tcp => query.response_buffer.len() - 2,
    };
    let limit = usize::min(limit, query.response_buffer.len() - msg_off);

    // Header: copy the id and RD flag from the request, mark the
    // message an authoritative response.
    let id = header::id(&query.request_buffer[msg_off..]);
    let rd = header::rd(&query.request_buffer[msg_off..]);
    {
        let msg = &mut query.response_buffer[msg_off..msg_off + limit];
        header::clear(msg);
        header::set_id(msg, id);
        header::set_qr(msg, true);
        header::set_aa(msg, true);
        header::set_opcode(msg, 0);
        header::set_rd(msg, rd);
        if query.end_code.fits_in_header() {
            header::set_rcode(msg, query.end_code.header_rcode());
        }
    }
    if !query.end_code.fits_in_header() {
        // The upper bits travel in the OPT record's TTL field.
        query.edns.extended_rcode = query.end_code.extended_rcode();
    }

    query.compression.reset();
    let mut cursor = HEADER_SIZE;
    let mut truncated = false;

    let msg = &mut query.response_buffer[msg_off..msg_off + limit];

    let (an_packed, after_answer, tc) = pack_section(
        msg,
        cursor,
        &query.answer,
        &query.question_wire,
        &mut query.compression,
    );
    cursor = after_answer;
    truncated |= tc;

    let (ns_packed, after_authority, tc) = if truncated {
        (0, cursor, false)
    } else {
        pack_section(
            msg,
            cursor,
            &query.authority,
            &query.question_wire,
            &mut query.compression,
        )
    };
    cursor = after_authority;
    truncated |= tc;

    let (mut ar_packed, after_additional, tc) = if truncated {
        (0, cursor, false)
    } else {
        pack_section(
            msg,
            cursor,
            &query.additional,
            &query.question_wire,
            &mut query.compression,
        )
    };
    cursor = after_additional;
    truncated |= tc;

    // The OPT pseudo-RR goes last. It is owed whenever the request
    // carried valid EDNS, and also on BADVERS (where it carries the
    // extended RCODE that says so).
    if !truncated && (query.edns.valid || query.end_code == EndCode::BadVers) {
        match pack_edns(msg, cursor, &query.edns) {
            Some(n) => {
                cursor += n;
                ar_packed += 1;
            }
            None => truncated = true,
        }
    }

    header::set_ancount(msg, an_packed);
    header::set_nscount(msg, ns_packed);
    header::set_arcount(msg, ar_packed);
    if truncated {
        header::set_tc(msg, true);
    }

    // For TCP, the two-octet length prefix precedes the message.
    match query.transport {
        Transport::Udp => query.response_len = cursor,
        Transport::Tcp => {
            put_u16(&mut query.response_buffer, 0, cursor as u16);
            query.response_len = cursor + 2;
        }
    }

    if truncated {
        Err(Error::Truncation)
    } else {
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// SECTION PACKING                                                    //
////////////////////////////////////////////////////////////////////////

/// Packs the records of one section, stopping at the first record that
/// does not fit. Returns the packed count, the new cursor, and whether
/// packing was cut short.
fn pack_section(
    msg: &mut [u8],
    mut cursor: usize,
    entries: &[SectionEntry],
    question: &WireName,
    table: &mut CompressionTable,
) -> (u16, usize, bool) {
    let mut packed = 0u16;
    let mut scratch = WireName::new();
    for entry in entries {
        let result = if entry.owner_is_question {
            pack_rr(msg, cursor, question, &entry.record, table)
        } else {
            match name::from_ascii(&entry.record.name, &mut scratch) {
                Ok(()) => pack_rr(msg, cursor, &scratch, &entry.record, table),
                Err(e) => Err(e),
            }
        };
        match result {
            Ok(n) => {
                cursor += n;
                packed += 1;
            }
            Err(_) => return (packed, cursor, true),
        }
    }
    (packed, cursor, false)
}

/// Packs one resource record at `at`, compressing the owner name.
fn pack_rr(
    msg: &mut [u8],
    at: usize,
    owner: &[u8],
    record: &RrRecord,
    table: &mut CompressionTable,
) -> name::Result<usize> {
    let name_len = name::pack(owner, msg, at, table)?;
    let fixed = at + name_len;
    let rdlen = record.rdata.len();
    if fixed + RRFIXEDSZ + rdlen > msg.len() {
        return Err(name::Error::BufferTooSmall);
    }
    put_u16(msg, fixed, record.rtype.0);
    put_u16(msg, fixed + 2, record.class.0);
    put_u32(msg, fixed + 4, record.ttl);
    put_u16(msg, fixed + 8, rdlen as u16);
    msg[fixed + RRFIXEDSZ..fixed + RRFIXEDSZ + rdlen].copy_from_slice(&record.rdata);
    Ok(name_len + RRFIXEDSZ + rdlen)
}

////////////////////////////////////////////////////////////////////////
// EDNS PACKING                                                       //
////////////////////////////////////////////////////////////////////////

/// Packs the OPT pseudo-RR, echoing the Client Subnet option when the
/// request carried a valid one. Returns [`None`] when there is no
/// room.
fn pack_edns(msg: &mut [u8], at: usize, edns: &Edns) -> Option<usize> {
    let cs = &edns.client_subnet;
    let cs_addr_len = (cs.source_mask as usize + 7) / 8;
    let rdlen = if cs.valid { 4 + 4 + cs_addr_len } else { 0 };
    let total = 1 + RRFIXEDSZ + rdlen;
    if at + total > msg.len() {
        return None;
    }

    msg[at] = 0; // root owner
    put_u16(msg, at + 1, Type::OPT.0);
    put_u16(msg, at + 3, edns.udp_resp_len);
    msg[at + 5] = edns.extended_rcode;
    msg[at + 6] = 0; // the version we speak
    msg[at + 7] = if edns.dnssec { 0x80 } else { 0 };
    msg[at + 8] = 0;
    put_u16(msg, at + 9, rdlen as u16);

    if cs.valid {
        let opt = at + 1 + RRFIXEDSZ;
        put_u16(msg, opt, EDNS_OPT_CLIENT_SUBNET);
        put_u16(msg, opt + 2, (4 + cs_addr_len) as u16);
        put_u16(msg, opt + 4, cs.family);
        msg[opt + 6] = cs.source_mask;
        msg[opt + 7] = cs.scope_mask;
        match cs.addr {
            std::net::IpAddr::V4(a) => {
                msg[opt + 8..opt + 8 + cs_addr_len].copy_from_slice(&a.octets()[..cs_addr_len]);
            }
            std::net::IpAddr::V6(a) => {
                msg[opt + 8..opt + 8 + cs_addr_len].copy_from_slice(&a.octets()[..cs_addr_len]);
            }
        }
    }

    Some(total)
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error from response serialization.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The response did not fit and was truncated; the TC bit is set.
    Truncation,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Truncation => f.write_str("response truncated"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::message::Class;
    use crate::query::parse;
    use crate::resolver::{Resolver, StaticResolver};

    const WWW_EXAMPLE_COM: &[u8] =
        b"\x1f\xf9\x01\x20\x00\x01\x00\x00\x00\x00\x00\x00\
          \x03www\x07example\x03com\x00\x00\x01\x00\x01";

    const ROOT_QUERY: &[u8] =
        b"\x43\xcf\x01\x20\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x01\x00\x01";

    fn run_pipeline(bytes: &[u8], transport: Transport) -> Query {
        let mut query = match transport {
            Transport::Udp => Query::new_udp(),
            Transport::Tcp => Query::new_tcp(),
        };
        query.reset();
        let off = query.message_offset();
        if transport == Transport::Tcp {
            put_u16(&mut query.request_buffer, 0, bytes.len() as u16);
        }
        query.request_buffer[off..off + bytes.len()].copy_from_slice(bytes);
        query.request_len = bytes.len();
        parse::parse(&mut query);
        if query.end_code == EndCode::Unknown {
            StaticResolver::new().resolve(&mut query);
        }
        if query.end_code.responds() {
            let _ = pack_response(&mut query);
        }
        query
    }

    #[test]
    fn pack_builds_the_reference_answer() {
        let query = run_pipeline(WWW_EXAMPLE_COM, Transport::Udp);
        let resp = query.response();
        assert_eq!(resp.len(), 118);

        // Header: same id; QR, AA, RD; RCODE 0; one answer, one
        // authority, two additional records, no question echo.
        assert_eq!(
            &resp[..HEADER_SIZE],
            b"\x1f\xf9\x85\x00\x00\x00\x00\x01\x00\x01\x00\x02"
        );

        // Answer: www.example.com. 60 IN A 127.0.0.1, name in full.
        assert_eq!(&resp[12..29], b"\x03www\x07example\x03com\x00");
        assert_eq!(
            &resp[29..43],
            b"\x00\x01\x00\x01\x00\x00\x00\x3c\x00\x04\x7f\x00\x00\x01"
        );

        // Authority: the owner compresses to a pointer at the answer
        // name; NS RDATA is the nameserver in uncompressed wire form.
        assert_eq!(&resp[43..45], b"\xc0\x0c");
        assert_eq!(
            &resp[45..55],
            b"\x00\x02\x00\x01\x00\x00\x00\x3c\x00\x10"
        );
        assert_eq!(&resp[55..71], b"\x02ns\x07example\x03com\x00");

        // Additional A: "ns" plus a pointer to "example.com".
        assert_eq!(&resp[71..76], b"\x02ns\xc0\x10");
        assert_eq!(
            &resp[76..90],
            b"\x00\x01\x00\x01\x00\x00\x00\x3c\x00\x04\x7f\x00\x00\x01"
        );

        // Additional AAAA: a bare pointer to the glue owner above.
        assert_eq!(&resp[90..92], b"\xc0\x47");
        assert_eq!(&resp[92..102], b"\x00\x1c\x00\x01\x00\x00\x00\x3c\x00\x10");
        let mut loopback6 = [0u8; 16];
        loopback6[15] = 1;
        assert_eq!(&resp[102..118], &loopback6);
    }

    #[test]
    fn pack_answers_a_root_question() {
        let query = run_pipeline(ROOT_QUERY, Transport::Udp);
        let resp = query.response();
        assert_eq!(
            &resp[..HEADER_SIZE],
            b"\x43\xcf\x85\x00\x00\x00\x00\x01\x00\x01\x00\x02"
        );
        // The answer's owner is the root name.
        assert_eq!(resp[12], 0);
        assert_eq!(&resp[13..17], b"\x00\x01\x00\x01");
    }

    #[test]
    fn pack_prefixes_tcp_responses_with_their_length() {
        let query = run_pipeline(WWW_EXAMPLE_COM, Transport::Tcp);
        let resp = query.response();
        let prefixed = u16::from_be_bytes([resp[0], resp[1]]) as usize;
        assert_eq!(prefixed + 2, resp.len());
        assert_eq!(query.response_len, prefixed + 2);
        // The DNS payload matches the UDP rendering.
        let udp = run_pipeline(WWW_EXAMPLE_COM, Transport::Udp);
        assert_eq!(&resp[2..], udp.response());
    }

    #[test]
    fn pack_sends_badvers_through_the_extended_rcode() {
        // A request with EDNS version 1.
        let mut msg = WWW_EXAMPLE_COM.to_vec();
        put_u16(&mut msg, 10, 1);
        msg.extend_from_slice(b"\x00\x00\x29\x10\x00\x00\x01\x00\x00\x00\x00");
        let query = run_pipeline(&msg, Transport::Udp);
        assert_eq!(query.end_code, EndCode::BadVers);

        let resp = query.response();
        // Header RCODE is the low nibble (0); no sections but the OPT.
        assert_eq!(header::rcode(resp), 0);
        assert_eq!(header::ancount(resp), 0);
        assert_eq!(header::arcount(resp), 1);
        // OPT: root owner, type 41, size forced to 512, extended
        // RCODE 1, version 0, empty RDATA.
        assert_eq!(
            &resp[12..23],
            b"\x00\x00\x29\x02\x00\x01\x00\x00\x00\x00\x00"
        );
    }

    #[test]
    fn pack_echoes_the_client_subnet() {
        let mut msg = WWW_EXAMPLE_COM.to_vec();
        put_u16(&mut msg, 10, 1);
        // OPT with a 24-bit IPv4 client subnet option.
        msg.extend_from_slice(b"\x00\x00\x29\x10\x00\x00\x00\x00\x00\x00\x0b");
        msg.extend_from_slice(b"\x00\x08\x00\x07\x00\x01\x18\x00\xc0\x00\x02");
        let query = run_pipeline(&msg, Transport::Udp);
        assert_eq!(query.end_code, EndCode::NoError);

        let resp = query.response();
        assert_eq!(header::arcount(resp), 3);
        // The OPT is the final 22 octets: 11 fixed plus the echoed
        // option with scope set to the served prefix.
        let opt = &resp[resp.len() - 22..];
        assert_eq!(&opt[..11], b"\x00\x00\x29\x10\x00\x00\x00\x00\x00\x00\x0b");
        assert_eq!(&opt[11..], b"\x00\x08\x00\x07\x00\x01\x18\x18\xc0\x00\x02");
    }

    #[test]
    fn pack_truncates_when_the_response_does_not_fit() {
        let mut query = Query::new_udp();
        query.reset();
        query.request_buffer[..WWW_EXAMPLE_COM.len()].copy_from_slice(WWW_EXAMPLE_COM);
        query.request_len = WWW_EXAMPLE_COM.len();
        parse::parse(&mut query);

        // Fill the answer section with enough large TXT records to
        // blow through the 512-octet UDP limit.
        let record = Arc::new(RrRecord::new(
            "",
            Type::TXT,
            Class::IN,
            60,
            vec![b'x'; 100],
        ));
        query.end_code = EndCode::NoError;
        for _ in 0..8 {
            query
                .answer
                .push(crate::query::SectionEntry::at_question(record.clone()));
        }

        assert_eq!(pack_response(&mut query), Err(Error::Truncation));
        let resp = query.response();
        assert!(resp.len() <= 512);
        assert!(header::tc(resp));
        assert!(header::ancount(resp) < 8);
    }
}
