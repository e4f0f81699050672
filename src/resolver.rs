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

//! The resolution seam.
//!
//! The vectorloop treats resolution as a black box behind the
//! [`Resolver`] trait: given a parsed query, populate the response
//! sections with record references and set a successful end code.
//! Records are shared through [`Arc`] so that an in-flight query can
//! never outlive the records it references, even across a resource
//! hot-swap.
//!
//! [`StaticResolver`] is the reference implementation: it answers
//! every supported question with `A 127.0.0.1` and supplies a static
//! nameserver with its glue.

use std::sync::Arc;

use crate::message::{Class, EndCode, Type};
use crate::name::{self, WireName};
use crate::query::{Query, SectionEntry};

////////////////////////////////////////////////////////////////////////
// RESOURCE RECORDS                                                   //
////////////////////////////////////////////////////////////////////////

/// One resource record as served.
///
/// The owner name is kept in presentation form (dot-separated ASCII);
/// the serializer converts it to wire form, which lets it participate
/// in name compression like any other name. RDATA is raw wire octets.
#[derive(Clone, Debug)]
pub struct RrRecord {
    pub name: Box<[u8]>,
    pub rtype: Type,
    pub class: Class,
    pub ttl: u32,
    pub rdata: Box<[u8]>,
}

impl RrRecord {
    pub fn new(name: &str, rtype: Type, class: Class, ttl: u32, rdata: Vec<u8>) -> Self {
        Self {
            name: name.as_bytes().to_vec().into_boxed_slice(),
            rtype,
            class,
            ttl,
            rdata: rdata.into_boxed_slice(),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// THE RESOLVER SEAM                                                  //
////////////////////////////////////////////////////////////////////////

/// The resolution policy.
///
/// `resolve` is called exactly once per query whose end code is still
/// undecided after parsing. It must populate the query's response
/// sections and set `end_code` to a responding value (usually
/// [`EndCode::NoError`]). Record references placed in the sections
/// remain valid for the remainder of the loop iteration; the query-log
/// stage drops them.
pub trait Resolver: Send + Sync {
    fn resolve(&self, query: &mut Query);
}

////////////////////////////////////////////////////////////////////////
// REFERENCE IMPLEMENTATION                                           //
////////////////////////////////////////////////////////////////////////

/// The trivial resolver: every supported question gets
/// `A 127.0.0.1`, authority `NS ns.example.com`, and A/AAAA glue for
/// the nameserver.
pub struct StaticResolver {
    a: Arc<RrRecord>,
    ns: Arc<RrRecord>,
    ns_glue_a: Arc<RrRecord>,
    ns_glue_aaaa: Arc<RrRecord>,
}

const NS_NAME: &str = "ns.example.com";
const STATIC_TTL: u32 = 60;

impl StaticResolver {
    pub fn new() -> Self {
        // The NS RDATA is the nameserver's name in wire form.
        let mut ns_wire = WireName::new();
        name::from_ascii(NS_NAME.as_bytes(), &mut ns_wire)
            .expect("static nameserver name is valid");

        Self {
            // The owner of the answer and authority records is the
            // question name; see SectionEntry::at_question.
            a: Arc::new(RrRecord::new(
                "",
                Type::A,
                Class::IN,
                STATIC_TTL,
                vec![127, 0, 0, 1],
            )),
            ns: Arc::new(RrRecord::new(
                "",
                Type::NS,
                Class::IN,
                STATIC_TTL,
                ns_wire.to_vec(),
            )),
            ns_glue_a: Arc::new(RrRecord::new(
                NS_NAME,
                Type::A,
                Class::IN,
                STATIC_TTL,
                vec![127, 0, 0, 1],
            )),
            ns_glue_aaaa: Arc::new(RrRecord::new(
                NS_NAME,
                Type::AAAA,
                Class::IN,
                STATIC_TTL,
                std::net::Ipv6Addr::LOCALHOST.octets().to_vec(),
            )),
        }
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, query: &mut Query) {
        query.end_code = EndCode::NoError;

        query.answer.push(SectionEntry::at_question(self.a.clone()));
        query
            .authority
            .push(SectionEntry::at_question(self.ns.clone()));
        query
            .additional
            .push(SectionEntry::at_record_name(self.ns_glue_a.clone()));
        query
            .additional
            .push(SectionEntry::at_record_name(self.ns_glue_aaaa.clone()));

        // Echo the client subnet, answering for exactly the prefix
        // that was asked about.
        if query.edns.client_subnet.valid {
            query.edns.client_subnet.scope_mask = query.edns.client_subnet.source_mask;
        }
    }
}

////////////////////////////////////////////////////////////////////////
// LOADABLE RESOURCES                                                 //
////////////////////////////////////////////////////////////////////////

/// A read-only artifact loaded from disk and published to every shard
/// by the resource thread.
///
/// The reference configuration carries a single opaque resource; a
/// real resolution policy would parse it into whatever form it serves
/// from. Shards hold the artifact through an [`Arc`] and replace their
/// reference when a resource-update message arrives, so an old
/// artifact is freed once the last shard has acknowledged the swap.
#[derive(Debug)]
pub struct Resource {
    pub name: String,
    pub data: Box<[u8]>,
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse;

    const WWW_EXAMPLE_COM: &[u8] =
        b"\x1f\xf9\x01\x20\x00\x01\x00\x00\x00\x00\x00\x00\
          \x03www\x07example\x03com\x00\x00\x01\x00\x01";

    #[test]
    fn static_resolver_answers_with_loopback() {
        let mut query = Query::new_udp();
        query.reset();
        query.request_buffer[..WWW_EXAMPLE_COM.len()].copy_from_slice(WWW_EXAMPLE_COM);
        query.request_len = WWW_EXAMPLE_COM.len();
        parse::parse(&mut query);
        assert_eq!(query.end_code, EndCode::Unknown);

        StaticResolver::new().resolve(&mut query);
        assert_eq!(query.end_code, EndCode::NoError);
        assert_eq!(query.answer.len(), 1);
        assert_eq!(query.authority.len(), 1);
        assert_eq!(query.additional.len(), 2);
        assert_eq!(&*query.answer[0].record.rdata, &[127, 0, 0, 1]);
        assert_eq!(query.authority[0].record.rtype, Type::NS);
        assert_eq!(
            &*query.authority[0].record.rdata,
            b"\x02ns\x07example\x03com\x00"
        );
        assert_eq!(query.additional[1].record.rtype, Type::AAAA);
    }
}
