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

//! Request parsing.
//!
//! [`parse`] validates a received DNS message and fills in the query's
//! question and EDNS state. Failures never panic and never allocate;
//! they set the query's end code, which either short-circuits the rest
//! of the pipeline (negative codes: the request is dropped) or selects
//! the error RCODE of the response.

use crate::message::{
    header, read_u16, Class, EndCode, Opcode, Type, EDNS_OPT_CLIENT_SUBNET, HEADER_SIZE, PACKETSZ,
    RRFIXEDSZ, UDP_MAXMSG,
};
use crate::name::{self, WireName};
use crate::query::{Edns, EdnsClientSubnet, Query};

/// Parses the request in `query.request_buffer`, populating the
/// question and EDNS state and setting `end_code` on failure. On
/// success `end_code` remains [`EndCode::Unknown`] and the query
/// proceeds to resolution.
pub fn parse(query: &mut Query) {
    let off = query.message_offset();
    let len = query.request_len;

    // Anything shorter than a header is dropped without a response.
    if len < HEADER_SIZE {
        query.end_code = EndCode::ShortHeader;
        return;
    }
    let msg = &query.request_buffer[off..off + len];

    // A truncated query is not answerable.
    if header::tc(msg) {
        query.end_code = EndCode::QueryTc;
        return;
    }

    // Only standard queries are served.
    if Opcode::from(header::opcode(msg)) != Opcode::Query {
        query.end_code = EndCode::NotImpl;
        return;
    }

    // Responses are not queries.
    if header::qr(msg) {
        query.end_code = EndCode::FormErr;
        return;
    }

    // Exactly one question; multiple questions are unsupported rather
    // than malformed.
    match header::qdcount(msg) {
        1 => (),
        0 => {
            query.end_code = EndCode::FormErr;
            return;
        }
        _ => {
            query.end_code = EndCode::NotImpl;
            return;
        }
    }

    // Answer or authority records in a query are malformed.
    if header::ancount(msg) != 0 || header::nscount(msg) != 0 {
        query.end_code = EndCode::FormErr;
        return;
    }

    // The question itself.
    let question = match parse_question(msg, &mut query.question_wire, &mut query.question_name) {
        Ok(q) => q,
        Err(code) => {
            query.end_code = code;
            return;
        }
    };
    query.question_name_len = question.name_len;
    query.qtype = question.qtype;
    query.qclass = question.qclass;
    if !question.qtype.supported() || !question.qclass.supported() {
        query.end_code = EndCode::NotImpl;
        return;
    }

    // Additional records, looking for the first OPT pseudo-RR.
    let arcount = header::arcount(msg);
    if arcount > 0 {
        if let Err(code) =
            parse_additional(msg, HEADER_SIZE + question.consumed, arcount, &mut query.edns)
        {
            query.end_code = code;
            return;
        }
    }

    // Trailing octets past the consumed region are tolerated.
}

////////////////////////////////////////////////////////////////////////
// QUESTION SECTION                                                   //
////////////////////////////////////////////////////////////////////////

struct Question {
    name_len: usize,
    qtype: Type,
    qclass: Class,
    consumed: usize,
}

fn parse_question(
    msg: &[u8],
    wire: &mut WireName,
    label: &mut [u8],
) -> Result<Question, EndCode> {
    let consumed = name::unpack(msg, HEADER_SIZE, wire).map_err(|_| EndCode::FormErr)?;
    let name_len = name::to_ascii(wire, label).map_err(|_| EndCode::FormErr)?;
    let after_name = HEADER_SIZE + consumed;
    let qtype = read_u16(msg, after_name).ok_or(EndCode::FormErr)?;
    let qclass = read_u16(msg, after_name + 2).ok_or(EndCode::FormErr)?;
    Ok(Question {
        name_len,
        qtype: qtype.into(),
        qclass: qclass.into(),
        consumed: consumed + 4,
    })
}

////////////////////////////////////////////////////////////////////////
// ADDITIONAL SECTION AND EDNS                                        //
////////////////////////////////////////////////////////////////////////

/// Walks the additional section starting at `start`, parsing the
/// first root-owned OPT pseudo-RR into `edns` and skipping every
/// other record. Exactly `arcount` records must be present. Returns
/// the cursor after the section.
fn parse_additional(
    msg: &[u8],
    start: usize,
    arcount: u16,
    edns: &mut Edns,
) -> Result<usize, EndCode> {
    let mut cursor = start;
    let mut scratch = WireName::new();
    let mut rr_count = 0u16;

    while rr_count < arcount && cursor < msg.len() {
        let consumed = name::unpack(msg, cursor, &mut scratch).map_err(|_| EndCode::FormErr)?;
        let fixed = cursor + consumed;
        if fixed + RRFIXEDSZ > msg.len() {
            return Err(EndCode::FormErr);
        }
        let rtype = Type::from(read_u16(msg, fixed).unwrap());
        // Only a literal root label (one octet, not a pointer to one)
        // can own an OPT record.
        let owner_is_root = consumed == 1 && scratch.len() == 1;

        if owner_is_root && rtype == Type::OPT && !edns.present {
            edns.present = true;

            // The CLASS field advertises the client's maximum UDP
            // response size.
            let advertised = read_u16(msg, fixed + 2).unwrap();
            edns.udp_resp_len = advertised.clamp(PACKETSZ as u16, UDP_MAXMSG as u16);

            // The TTL field holds the extended RCODE, the version,
            // the DO bit, and reserved zero bits.
            edns.version = msg[fixed + 5];
            if edns.version != 0 {
                // RFC 6891 requires a BADVERS response.
                edns.udp_resp_len = PACKETSZ as u16;
                return Err(EndCode::BadVers);
            }
            edns.dnssec = msg[fixed + 6] & 0x80 != 0;

            let rdlen = read_u16(msg, fixed + 8).unwrap() as usize;
            cursor = fixed + RRFIXEDSZ;
            if rdlen > 0 {
                if cursor + rdlen > msg.len() {
                    return Err(EndCode::FormErr);
                }
                if parse_options(&msg[cursor..cursor + rdlen], edns).is_err() {
                    return Err(EndCode::FormErr);
                }
                cursor += rdlen;
            }
            edns.valid = true;
        } else {
            // Not the OPT record we are looking for; skip it whole.
            let rdlen = read_u16(msg, fixed + 8).unwrap() as usize;
            cursor = fixed + RRFIXEDSZ;
            if cursor + rdlen > msg.len() {
                return Err(EndCode::FormErr);
            }
            cursor += rdlen;
        }
        rr_count += 1;
    }

    if rr_count != arcount {
        return Err(EndCode::FormErr);
    }
    Ok(cursor)
}

/// Walks the option list in an OPT record's RDATA. The only option
/// understood is Client Subnet; unknown options are skipped.
fn parse_options(data: &[u8], edns: &mut Edns) -> Result<(), ()> {
    let mut cursor = 0;
    while cursor < data.len() {
        if cursor + 4 > data.len() {
            return Err(());
        }
        let code = read_u16(data, cursor).unwrap();
        let length = read_u16(data, cursor + 2).unwrap() as usize;
        cursor += 4;
        if cursor + length > data.len() {
            return Err(());
        }
        if code == EDNS_OPT_CLIENT_SUBNET {
            parse_client_subnet(&data[cursor..cursor + length], &mut edns.client_subnet)?;
        }
        cursor += length;
    }
    Ok(())
}

/// Parses a Client Subnet option body (RFC 7871):
///
/// ```text
/// 2 octets          family
/// 1 octet           source prefix length
/// 1 octet           scope prefix length (must be 0 in queries)
/// remaining octets  address, truncated to the source prefix
/// ```
///
/// A wrongly formatted option must be rejected with FORMERR, which the
/// caller arranges; this function reports the failure and leaves the
/// option marked invalid.
fn parse_client_subnet(data: &[u8], cs: &mut EdnsClientSubnet) -> Result<(), ()> {
    cs.valid = false;

    if data.len() < 4 {
        return Err(());
    }
    let family = read_u16(data, 0).unwrap();
    let source_mask = data[2];
    let scope_mask = data[3];
    let addr_bytes = &data[4..];

    let addr = match family {
        1 => {
            if source_mask > 32 || scope_mask != 0 || addr_bytes.len() > 4 {
                return Err(());
            }
            let mut octets = [0u8; 4];
            octets[..addr_bytes.len()].copy_from_slice(addr_bytes);
            std::net::IpAddr::V4(octets.into())
        }
        2 => {
            if source_mask > 128 || scope_mask != 0 || addr_bytes.len() > 16 {
                return Err(());
            }
            let mut octets = [0u8; 16];
            octets[..addr_bytes.len()].copy_from_slice(addr_bytes);
            std::net::IpAddr::V6(octets.into())
        }
        // Unknown families must be rejected (RFC 7871 § 7.1.2).
        _ => return Err(()),
    };

    // The address must be exactly as many octets as the source prefix
    // covers, and bits past the prefix in the last octet must be zero.
    let expected = (source_mask as usize + 7) / 8;
    if addr_bytes.len() != expected {
        return Err(());
    }
    let partial_bits = source_mask % 8;
    if partial_bits > 0 {
        let last = addr_bytes[expected - 1];
        let mask = 0xffu8 << (8 - partial_bits);
        if last & mask != last {
            return Err(());
        }
    }

    cs.valid = true;
    cs.family = family;
    cs.source_mask = source_mask;
    cs.scope_mask = scope_mask;
    cs.addr = addr;
    Ok(())
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::put_u16;

    /// The example A IN www.example.com request, byte for byte.
    const WWW_EXAMPLE_COM: &[u8] =
        b"\x1f\xf9\x01\x20\x00\x01\x00\x00\x00\x00\x00\x00\
          \x03www\x07example\x03com\x00\x00\x01\x00\x01";

    /// An A IN . request.
    const ROOT_QUERY: &[u8] =
        b"\x43\xcf\x01\x20\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x01\x00\x01";

    fn parse_udp(bytes: &[u8]) -> Query {
        let mut query = Query::new_udp();
        query.reset();
        query.request_buffer[..bytes.len()].copy_from_slice(bytes);
        query.request_len = bytes.len();
        parse(&mut query);
        query
    }

    /// Appends an OPT record to a request, patching ARCOUNT.
    fn with_opt(base: &[u8], size: u16, version: u8, do_bit: bool, options: &[u8]) -> Vec<u8> {
        let mut msg = base.to_vec();
        put_u16(&mut msg, 10, 1);
        msg.push(0); // root owner
        msg.extend_from_slice(&Type::OPT.0.to_be_bytes());
        msg.extend_from_slice(&size.to_be_bytes());
        msg.push(0); // extended rcode
        msg.push(version);
        msg.push(if do_bit { 0x80 } else { 0 });
        msg.push(0);
        msg.extend_from_slice(&(options.len() as u16).to_be_bytes());
        msg.extend_from_slice(options);
        msg
    }

    /// Builds a Client Subnet option body wrapped as an option.
    fn cs_option(family: u16, source: u8, scope: u8, addr: &[u8]) -> Vec<u8> {
        let mut opt = Vec::new();
        opt.extend_from_slice(&EDNS_OPT_CLIENT_SUBNET.to_be_bytes());
        opt.extend_from_slice(&((4 + addr.len()) as u16).to_be_bytes());
        opt.extend_from_slice(&family.to_be_bytes());
        opt.push(source);
        opt.push(scope);
        opt.extend_from_slice(addr);
        opt
    }

    #[test]
    fn parse_accepts_a_plain_query() {
        let query = parse_udp(WWW_EXAMPLE_COM);
        assert_eq!(query.end_code, EndCode::Unknown);
        assert_eq!(query.question_name(), b"www.example.com.");
        assert_eq!(query.qtype, Type::A);
        assert_eq!(query.qclass, Class::IN);
        assert!(!query.edns.present);
    }

    #[test]
    fn parse_accepts_a_root_query() {
        let query = parse_udp(ROOT_QUERY);
        assert_eq!(query.end_code, EndCode::Unknown);
        assert_eq!(query.question_name(), b".");
        assert_eq!(query.qtype, Type::A);
    }

    #[test]
    fn parse_rejects_short_headers() {
        let query = parse_udp(&WWW_EXAMPLE_COM[..11]);
        assert_eq!(query.end_code, EndCode::ShortHeader);
    }

    #[test]
    fn parse_rejects_truncated_requests() {
        let mut msg = WWW_EXAMPLE_COM.to_vec();
        msg[2] |= 0x02; // TC
        assert_eq!(parse_udp(&msg).end_code, EndCode::QueryTc);
    }

    #[test]
    fn parse_rejects_responses() {
        let mut msg = WWW_EXAMPLE_COM.to_vec();
        msg[2] |= 0x80; // QR
        assert_eq!(parse_udp(&msg).end_code, EndCode::FormErr);
    }

    #[test]
    fn parse_rejects_non_query_opcodes() {
        let mut msg = WWW_EXAMPLE_COM.to_vec();
        msg[2] = (msg[2] & !0x78) | (1 << 3); // IQUERY
        assert_eq!(parse_udp(&msg).end_code, EndCode::NotImpl);
    }

    #[test]
    fn parse_rejects_bad_question_counts() {
        let mut msg = WWW_EXAMPLE_COM.to_vec();
        put_u16(&mut msg, 4, 2);
        assert_eq!(parse_udp(&msg).end_code, EndCode::NotImpl);
        put_u16(&mut msg, 4, 0);
        assert_eq!(parse_udp(&msg).end_code, EndCode::FormErr);
    }

    #[test]
    fn parse_rejects_answer_and_authority_records() {
        let mut msg = WWW_EXAMPLE_COM.to_vec();
        put_u16(&mut msg, 6, 1);
        assert_eq!(parse_udp(&msg).end_code, EndCode::FormErr);
        put_u16(&mut msg, 6, 0);
        put_u16(&mut msg, 8, 1);
        assert_eq!(parse_udp(&msg).end_code, EndCode::FormErr);
    }

    #[test]
    fn parse_rejects_unsupported_qtypes_and_qclasses() {
        let mut msg = WWW_EXAMPLE_COM.to_vec();
        let qtype_at = msg.len() - 4;
        put_u16(&mut msg, qtype_at, Type::AAAA.0);
        let query = parse_udp(&msg);
        assert_eq!(query.end_code, EndCode::NotImpl);
        assert_eq!(query.qtype, Type::AAAA);

        let mut msg = WWW_EXAMPLE_COM.to_vec();
        let qclass_at = msg.len() - 2;
        put_u16(&mut msg, qclass_at, Class::CH.0);
        assert_eq!(parse_udp(&msg).end_code, EndCode::NotImpl);
    }

    #[test]
    fn parse_accepts_edns_and_clamps_the_advertised_size() {
        let query = parse_udp(&with_opt(WWW_EXAMPLE_COM, 1400, 0, true, &[]));
        assert_eq!(query.end_code, EndCode::Unknown);
        assert!(query.edns.valid);
        assert!(query.edns.dnssec);
        assert_eq!(query.edns.udp_resp_len, 1400);

        let small = parse_udp(&with_opt(WWW_EXAMPLE_COM, 100, 0, false, &[]));
        assert_eq!(small.edns.udp_resp_len, 512);
        let large = parse_udp(&with_opt(WWW_EXAMPLE_COM, 0xffff, 0, false, &[]));
        assert_eq!(large.edns.udp_resp_len, 4096);
    }

    #[test]
    fn parse_rejects_unsupported_edns_versions() {
        let query = parse_udp(&with_opt(WWW_EXAMPLE_COM, 4096, 1, false, &[]));
        assert_eq!(query.end_code, EndCode::BadVers);
        assert!(!query.edns.valid);
        assert_eq!(query.edns.version, 1);
        assert_eq!(query.edns.udp_resp_len, 512);
    }

    #[test]
    fn parse_skips_unknown_edns_options() {
        let mut options = Vec::new();
        options.extend_from_slice(&10u16.to_be_bytes()); // COOKIE
        options.extend_from_slice(&4u16.to_be_bytes());
        options.extend_from_slice(&[1, 2, 3, 4]);
        let query = parse_udp(&with_opt(WWW_EXAMPLE_COM, 4096, 0, false, &options));
        assert_eq!(query.end_code, EndCode::Unknown);
        assert!(query.edns.valid);
        assert!(!query.edns.client_subnet.valid);
    }

    #[test]
    fn parse_accepts_a_valid_client_subnet() {
        let options = cs_option(1, 24, 0, &[192, 0, 2]);
        let query = parse_udp(&with_opt(WWW_EXAMPLE_COM, 4096, 0, false, &options));
        assert_eq!(query.end_code, EndCode::Unknown);
        let cs = &query.edns.client_subnet;
        assert!(cs.valid);
        assert_eq!(cs.family, 1);
        assert_eq!(cs.source_mask, 24);
        assert_eq!(cs.scope_mask, 0);
        assert_eq!(cs.addr, std::net::IpAddr::V4([192, 0, 2, 0].into()));
    }

    #[test]
    fn parse_rejects_client_subnet_with_unknown_family() {
        let options = cs_option(3, 24, 0, &[192, 0, 2]);
        let query = parse_udp(&with_opt(WWW_EXAMPLE_COM, 4096, 0, false, &options));
        assert_eq!(query.end_code, EndCode::FormErr);
        assert!(!query.edns.client_subnet.valid);
    }

    #[test]
    fn parse_rejects_client_subnet_with_nonzero_scope() {
        let options = cs_option(1, 24, 8, &[192, 0, 2]);
        assert_eq!(
            parse_udp(&with_opt(WWW_EXAMPLE_COM, 4096, 0, false, &options)).end_code,
            EndCode::FormErr
        );
    }

    #[test]
    fn parse_rejects_client_subnet_with_wrong_address_length() {
        let options = cs_option(1, 24, 0, &[192, 0, 2, 1]);
        assert_eq!(
            parse_udp(&with_opt(WWW_EXAMPLE_COM, 4096, 0, false, &options)).end_code,
            EndCode::FormErr
        );
    }

    #[test]
    fn parse_rejects_client_subnet_with_trailing_bits() {
        // /20 with the low four bits of the third octet set.
        let options = cs_option(1, 20, 0, &[192, 0, 0x2f]);
        assert_eq!(
            parse_udp(&with_opt(WWW_EXAMPLE_COM, 4096, 0, false, &options)).end_code,
            EndCode::FormErr
        );
        // The same bits inside the mask are fine.
        let options = cs_option(1, 20, 0, &[192, 0, 0x20]);
        assert_eq!(
            parse_udp(&with_opt(WWW_EXAMPLE_COM, 4096, 0, false, &options)).end_code,
            EndCode::Unknown
        );
    }

    #[test]
    fn parse_accepts_an_ipv6_client_subnet() {
        let options = cs_option(2, 56, 0, &[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0]);
        let query = parse_udp(&with_opt(WWW_EXAMPLE_COM, 4096, 0, false, &options));
        assert_eq!(query.end_code, EndCode::Unknown);
        assert!(query.edns.client_subnet.valid);
        assert_eq!(query.edns.client_subnet.family, 2);
    }

    #[test]
    fn parse_counts_additional_records() {
        // ARCOUNT of two but only one (OPT) record present.
        let mut msg = with_opt(WWW_EXAMPLE_COM, 4096, 0, false, &[]);
        put_u16(&mut msg, 10, 2);
        assert_eq!(parse_udp(&msg).end_code, EndCode::FormErr);
    }

    #[test]
    fn parse_skips_non_opt_additional_records() {
        // An additional A record ahead of the OPT.
        let mut msg = WWW_EXAMPLE_COM.to_vec();
        put_u16(&mut msg, 10, 2);
        msg.extend_from_slice(b"\x01x\x00"); // owner x.
        msg.extend_from_slice(&Type::A.0.to_be_bytes());
        msg.extend_from_slice(&Class::IN.0.to_be_bytes());
        msg.extend_from_slice(&60u32.to_be_bytes());
        msg.extend_from_slice(&4u16.to_be_bytes());
        msg.extend_from_slice(&[127, 0, 0, 1]);
        msg.push(0); // root owner for OPT
        msg.extend_from_slice(&Type::OPT.0.to_be_bytes());
        msg.extend_from_slice(&4096u16.to_be_bytes());
        msg.extend_from_slice(&[0, 0, 0, 0]);
        msg.extend_from_slice(&0u16.to_be_bytes());
        let query = parse_udp(&msg);
        assert_eq!(query.end_code, EndCode::Unknown);
        assert!(query.edns.valid);
    }

    #[test]
    fn parse_tolerates_trailing_bytes() {
        let mut msg = WWW_EXAMPLE_COM.to_vec();
        msg.extend_from_slice(b"junk");
        assert_eq!(parse_udp(&msg).end_code, EndCode::Unknown);
    }
}
