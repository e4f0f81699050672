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

//! Process-wide metrics.
//!
//! Metrics are monotonic counters updated with relaxed atomic adds
//! from every thread. There are no invariants across counters, so no
//! ordering stronger than [`Ordering::Relaxed`] is needed. One
//! [`Metrics`] structure is shared by all shards and support threads.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::{EndCode, Type};
use crate::query::{Query, Transport};

/// A single monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

////////////////////////////////////////////////////////////////////////
// METRIC GROUPS                                                      //
////////////////////////////////////////////////////////////////////////

/// TCP transport counters.
#[derive(Debug, Default)]
pub struct TcpMetrics {
    /// New connections accepted.
    pub connections: Counter,

    /// Queries received over TCP.
    pub queries: Counter,

    /// Connections accepted with an unsupported client socket family.
    /// Should never trigger, since the server binds only IPv4 and
    /// IPv6.
    pub unknown_client_ip_soc_family: Counter,

    /// `getsockname` failures on accepted sockets.
    pub getsockname_err: Counter,

    /// Connections accepted with an unsupported local socket family.
    pub unknown_local_ip_soc_family: Counter,

    /// Failures to assign a connection id.
    pub conn_id_unavailable: Counter,

    /// Frames whose length prefix exceeded 512 octets.
    pub query_len_toolarge: Counter,

    /// Connections released while waiting for the rest of a partially
    /// received query. Deviation from steady state can indicate a
    /// slow-sender denial of service.
    pub query_recv_timeout: Counter,

    /// Connections released by the idle (keepalive) timeout.
    pub keepalive_timeout: Counter,

    /// Connections closed by the peer before any query arrived.
    pub closed_no_query: Counter,

    /// Connections closed by the peer mid-query.
    pub closed_partial_query: Counter,

    /// Connections released after a socket read error.
    pub sock_read_err: Counter,

    /// Connections released after a socket write error.
    pub sock_write_err: Counter,

    /// Connections released by the send timeout.
    pub sock_write_timeout: Counter,

    /// Connections closed for write by the peer before the response
    /// was fully sent.
    pub sock_closed_for_write: Counter,
}

/// UDP transport counters.
#[derive(Debug, Default)]
pub struct UdpMetrics {
    /// Queries received over UDP.
    pub queries: Counter,
}

/// DNS protocol counters.
#[derive(Debug, Default)]
pub struct DnsMetrics {
    pub queries_rcode_noerror: Counter,
    pub queries_rcode_formerr: Counter,
    pub queries_rcode_servfail: Counter,
    pub queries_rcode_nxdomain: Counter,
    pub queries_rcode_notimpl: Counter,
    pub queries_rcode_refused: Counter,
    pub queries_rcode_shortheader: Counter,
    pub queries_rcode_toolarge: Counter,
    pub queries_rcode_badversion: Counter,

    pub queries_type_invalid: Counter,
    pub queries_type_a: Counter,
    pub queries_type_ns: Counter,
    pub queries_type_cname: Counter,
    pub queries_type_soa: Counter,
    pub queries_type_ptr: Counter,
    pub queries_type_mx: Counter,
    pub queries_type_txt: Counter,
    pub queries_type_aaaa: Counter,
    pub queries_type_srv: Counter,

    pub queries_edns_present: Counter,
    pub queries_edns_valid: Counter,
    pub queries_edns_dobit: Counter,
    pub queries_clientsubnet: Counter,
}

/// Application-level counters.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Failures to open the application log file.
    pub app_log_open_error: Counter,

    /// Failures to write to the application log file, including
    /// messages dropped because the channel or file was unavailable.
    pub app_log_write_error: Counter,

    /// Queries that could not be logged because the active query-log
    /// buffer had no room. Expected under extreme overload; if it
    /// moves under normal traffic, the query-log buffer size should be
    /// increased.
    pub query_log_buf_no_space: Counter,

    /// Failures to check or reload a resource. An increase means the
    /// server may be serving stale data.
    pub resource_reload_error: Counter,

    /// Failures to open a query log file.
    pub query_log_open_error: Counter,
}

/// The complete metric set shared across the process.
#[derive(Debug, Default)]
pub struct Metrics {
    pub tcp: TcpMetrics,
    pub udp: UdpMetrics,
    pub dns: DnsMetrics,
    pub app: AppMetrics,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

////////////////////////////////////////////////////////////////////////
// PER-QUERY REPORTING                                                //
////////////////////////////////////////////////////////////////////////

/// Reports the counters for one completed query. Called from the
/// query-log pipeline stage.
pub fn report_query(query: &Query, metrics: &Metrics) {
    match query.transport {
        Transport::Udp => metrics.udp.queries.inc(),
        Transport::Tcp => metrics.tcp.queries.inc(),
    }

    let rcode_counter = match query.end_code {
        EndCode::NoError => Some(&metrics.dns.queries_rcode_noerror),
        EndCode::FormErr => Some(&metrics.dns.queries_rcode_formerr),
        EndCode::ServFail => Some(&metrics.dns.queries_rcode_servfail),
        EndCode::NxDomain => Some(&metrics.dns.queries_rcode_nxdomain),
        EndCode::NotImpl => Some(&metrics.dns.queries_rcode_notimpl),
        EndCode::Refused => Some(&metrics.dns.queries_rcode_refused),
        EndCode::BadVers => Some(&metrics.dns.queries_rcode_badversion),
        EndCode::ShortHeader => Some(&metrics.dns.queries_rcode_shortheader),
        EndCode::TooLarge => Some(&metrics.dns.queries_rcode_toolarge),
        _ => None,
    };
    if let Some(counter) = rcode_counter {
        counter.inc();
    }

    let type_counter = match query.qtype {
        Type(0) => Some(&metrics.dns.queries_type_invalid),
        Type::A => Some(&metrics.dns.queries_type_a),
        Type::NS => Some(&metrics.dns.queries_type_ns),
        Type::CNAME => Some(&metrics.dns.queries_type_cname),
        Type::SOA => Some(&metrics.dns.queries_type_soa),
        Type::PTR => Some(&metrics.dns.queries_type_ptr),
        Type::MX => Some(&metrics.dns.queries_type_mx),
        Type::TXT => Some(&metrics.dns.queries_type_txt),
        Type::AAAA => Some(&metrics.dns.queries_type_aaaa),
        Type::SRV => Some(&metrics.dns.queries_type_srv),
        _ => None,
    };
    if let Some(counter) = type_counter {
        counter.inc();
    }

    if query.edns.present {
        metrics.dns.queries_edns_present.inc();
    }
    if query.edns.valid {
        metrics.dns.queries_edns_valid.inc();
    }
    if query.edns.dnssec {
        metrics.dns.queries_edns_dobit.inc();
    }
    if query.edns.client_subnet.valid {
        metrics.dns.queries_clientsubnet.inc();
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.dns.queries_rcode_noerror.inc();
        metrics.dns.queries_rcode_noerror.add(2);
        assert_eq!(metrics.dns.queries_rcode_noerror.get(), 3);
        assert_eq!(metrics.dns.queries_rcode_formerr.get(), 0);
    }

    #[test]
    fn report_query_classifies_end_codes_and_types() {
        let metrics = Metrics::new();
        let mut query = Query::new_udp();
        query.end_code = EndCode::NoError;
        query.qtype = Type::A;
        query.edns.present = true;
        query.edns.valid = true;
        report_query(&query, &metrics);
        assert_eq!(metrics.udp.queries.get(), 1);
        assert_eq!(metrics.dns.queries_rcode_noerror.get(), 1);
        assert_eq!(metrics.dns.queries_type_a.get(), 1);
        assert_eq!(metrics.dns.queries_edns_present.get(), 1);
        assert_eq!(metrics.dns.queries_edns_valid.get(), 1);
        assert_eq!(metrics.dns.queries_edns_dobit.get(), 0);
    }
}
