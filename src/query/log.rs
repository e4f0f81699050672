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

//! Query-log rendering.
//!
//! Each completed query becomes one newline-terminated JSON object in
//! the shard's active query-log buffer. The buffer is written to disk
//! by the query-log thread after a double-buffer flip (see
//! [`crate::workers::query_log`]); rendering itself never touches the
//! file system.
//!
//! Failed queries log progressively less: format-level failures stop
//! after the timestamps, and SERVFAIL omits the response section.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::message::{EndCode, Type};
use crate::query::Query;
use crate::util::rfc3339_nano;

/// The headroom a single query-log entry may need. Rendering is
/// refused when the active buffer has less than this much room left,
/// which spares every append below from its own bounds check.
pub const MIN_SPACE: usize = 0xffff;

/// The maximum number of answer records a single entry logs.
const MAX_LOGGED_ANSWERS: usize = 10;

/// Appends one query-log entry to `buf`, whose capacity budget is
/// `capacity`. Returns `false` (leaving the buffer untouched) when
/// there is not enough room; the caller counts the dropped entry.
pub fn render(buf: &mut Vec<u8>, capacity: usize, query: &Query) -> bool {
    if capacity.saturating_sub(buf.len()) < MIN_SPACE {
        return false;
    }

    let (c_ip, c_port) = split_addr(query.client_addr);
    let (l_ip, l_port) = split_addr(query.local_addr);
    let _ = write!(
        buf,
        "{{\"c_ip\":\"{}\",\"c_port\":\"{}\",\"l_ip\":\"{}\",\"l_port\":\"{}\"",
        c_ip, c_port, l_ip, l_port
    );
    let _ = write!(buf, ",\"recv_time\":\"{}\"", rfc3339_nano(query.recv_time));
    if query.end_code.responds() {
        let send = query.send_time.unwrap_or(query.recv_time);
        let _ = write!(buf, ",\"send_time\":\"{}\"", rfc3339_nano(send));
    }

    // Format-level failures (and every dropped request) log nothing
    // further.
    if query.end_code != EndCode::NoError && query.end_code.as_i32() <= EndCode::FormErr.as_i32() {
        buf.extend_from_slice(b"}\n");
        return true;
    }

    // The request: header flags, EDNS, and the question.
    let msg = query.request();
    let _ = write!(
        buf,
        ",\"request\":{{\"rd\":\"{}\",\"tc\":\"{}\",\"opcode\":\"query\"",
        flag(crate::message::header::rd(msg)),
        flag(crate::message::header::tc(msg)),
    );

    if query.edns.valid || query.end_code == EndCode::BadVers {
        let _ = write!(
            buf,
            ",\"edns\":{{\"resp_size\":\"{}\",\"ver\":\"{}\"",
            query.edns.udp_resp_len, query.edns.version
        );
        if query.edns.valid {
            let _ = write!(buf, ",\"do\":\"{}\"", flag(query.edns.dnssec));
            let cs = &query.edns.client_subnet;
            if cs.valid {
                let _ = write!(
                    buf,
                    ",\"cs\":{{\"ip\":\"{}\",\"source\":\"{}\",\"scope\":\"{}\"}}",
                    cs.addr, cs.source_mask, cs.scope_mask
                );
            }
        }
        buf.push(b'}');
    }

    let _ = write!(
        buf,
        ",\"q_name\":\"{}\",\"q_class\":\"{}\",\"q_type\":\"{}\"}}",
        String::from_utf8_lossy(query.question_name()),
        query.qclass.to_str(),
        query.qtype.to_str(),
    );

    if query.end_code == EndCode::ServFail {
        // A server failure has no meaningful response to log.
        buf.extend_from_slice(b"}\n");
        return true;
    }

    // The response: the answer section, capped.
    if !query.answer.is_empty() || !query.authority.is_empty() || !query.additional.is_empty() {
        buf.extend_from_slice(b",\"response\":{");
        if !query.answer.is_empty() {
            buf.extend_from_slice(b"\"answer\":[");
            for (i, entry) in query.answer.iter().take(MAX_LOGGED_ANSWERS).enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                let name = if entry.owner_is_question {
                    String::from_utf8_lossy(query.question_name()).into_owned()
                } else {
                    String::from_utf8_lossy(&entry.record.name).into_owned()
                };
                let _ = write!(
                    buf,
                    "{{\"name\":\"{}\",\"class\":\"{}\",\"type\":\"{}\",\"rdata\":\"{}\"}}",
                    name,
                    entry.record.class.to_str(),
                    entry.record.rtype.to_str(),
                    rdata_string(entry.record.rtype, &entry.record.rdata),
                );
            }
            buf.push(b']');
        }
        buf.push(b'}');
    }

    buf.extend_from_slice(b"}\n");
    true
}

fn flag(value: bool) -> char {
    if value {
        '1'
    } else {
        '0'
    }
}

fn split_addr(addr: Option<SocketAddr>) -> (IpAddr, u16) {
    match addr {
        Some(a) => (a.ip(), a.port()),
        None => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
    }
}

/// Renders RDATA for the log: address records as addresses, anything
/// else as lowercase hex.
fn rdata_string(rtype: Type, rdata: &[u8]) -> String {
    match rtype {
        Type::A if rdata.len() == 4 => {
            Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string()
        }
        Type::AAAA if rdata.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            std::net::Ipv6Addr::from(octets).to_string()
        }
        _ => rdata.iter().map(|b| format!("{:02x}", b)).collect(),
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::query::{parse, Query};
    use crate::resolver::{Resolver, StaticResolver};

    const WWW_EXAMPLE_COM: &[u8] =
        b"\x1f\xf9\x01\x20\x00\x01\x00\x00\x00\x00\x00\x00\
          \x03www\x07example\x03com\x00\x00\x01\x00\x01";

    const RECV: &str = "2023-11-14T22:13:20.000000001Z";
    const SEND: &str = "2023-11-14T22:13:20.000000002Z";

    fn timed_query(bytes: &[u8]) -> Query {
        let mut query = Query::new_udp();
        query.reset();
        query.request_buffer[..bytes.len()].copy_from_slice(bytes);
        query.request_len = bytes.len();
        query.client_addr = Some("192.0.2.1:5353".parse().unwrap());
        query.local_addr = Some("127.0.0.1:53".parse().unwrap());
        query.recv_time = SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 1);
        query.send_time = Some(SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 2));
        query
    }

    fn rendered(query: &Query) -> String {
        let mut buf = Vec::new();
        assert!(render(&mut buf, 1 << 20, query));
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn formerr_entries_stop_after_the_timestamps() {
        let mut query = timed_query(WWW_EXAMPLE_COM);
        query.end_code = EndCode::FormErr;
        assert_eq!(
            rendered(&query),
            format!(
                "{{\"c_ip\":\"192.0.2.1\",\"c_port\":\"5353\",\
                 \"l_ip\":\"127.0.0.1\",\"l_port\":\"53\",\
                 \"recv_time\":\"{RECV}\",\"send_time\":\"{SEND}\"}}\n"
            )
        );
    }

    #[test]
    fn dropped_requests_log_no_send_time() {
        let mut query = timed_query(WWW_EXAMPLE_COM);
        query.end_code = EndCode::TooLarge;
        let line = rendered(&query);
        assert!(line.contains("recv_time"));
        assert!(!line.contains("send_time"));
        assert!(line.ends_with("}\n"));
    }

    #[test]
    fn successful_entries_log_request_and_response() {
        let mut query = timed_query(WWW_EXAMPLE_COM);
        parse::parse(&mut query);
        StaticResolver::new().resolve(&mut query);
        assert_eq!(
            rendered(&query),
            format!(
                "{{\"c_ip\":\"192.0.2.1\",\"c_port\":\"5353\",\
                 \"l_ip\":\"127.0.0.1\",\"l_port\":\"53\",\
                 \"recv_time\":\"{RECV}\",\"send_time\":\"{SEND}\",\
                 \"request\":{{\"rd\":\"1\",\"tc\":\"0\",\"opcode\":\"query\",\
                 \"q_name\":\"www.example.com.\",\"q_class\":\"IN\",\"q_type\":\"A\"}},\
                 \"response\":{{\"answer\":[{{\"name\":\"www.example.com.\",\
                 \"class\":\"IN\",\"type\":\"A\",\"rdata\":\"127.0.0.1\"}}]}}}}\n"
            )
        );
    }

    #[test]
    fn servfail_entries_omit_the_response() {
        let mut query = timed_query(WWW_EXAMPLE_COM);
        parse::parse(&mut query);
        StaticResolver::new().resolve(&mut query);
        query.end_code = EndCode::ServFail;
        let line = rendered(&query);
        assert!(line.contains("\"request\""));
        assert!(!line.contains("\"response\""));
    }

    #[test]
    fn edns_entries_include_the_negotiated_state() {
        let mut bytes = WWW_EXAMPLE_COM.to_vec();
        crate::message::put_u16(&mut bytes, 10, 1);
        bytes.extend_from_slice(b"\x00\x00\x29\x10\x00\x00\x00\x80\x00\x00\x0b");
        bytes.extend_from_slice(b"\x00\x08\x00\x07\x00\x01\x18\x00\xc0\x00\x02");
        let mut query = timed_query(&bytes);
        parse::parse(&mut query);
        StaticResolver::new().resolve(&mut query);
        let line = rendered(&query);
        assert!(line.contains(
            ",\"edns\":{\"resp_size\":\"4096\",\"ver\":\"0\",\"do\":\"1\",\
             \"cs\":{\"ip\":\"192.0.2.0\",\"source\":\"24\",\"scope\":\"24\"}}"
        ));
    }

    #[test]
    fn render_refuses_a_nearly_full_buffer() {
        let query = timed_query(WWW_EXAMPLE_COM);
        let mut buf = Vec::new();
        assert!(!render(&mut buf, MIN_SPACE - 1, &query));
        assert!(buf.is_empty());
    }
}
