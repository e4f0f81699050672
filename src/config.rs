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

//! Server configuration.
//!
//! A [`Config`] carries every tunable the server recognizes, with the
//! defaults a bare start uses. The daemon builds one from its command
//! line and/or TOML configuration file and validates it once with
//! [`Config::validate`] before any thread starts; afterwards it is
//! shared read-only.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::message::PACKETSZ;

////////////////////////////////////////////////////////////////////////
// VALIDATION BOUNDS                                                  //
////////////////////////////////////////////////////////////////////////

pub const UDP_SOCK_RECVBUFF_MIN: usize = 518;
pub const UDP_SOCK_RECVBUFF_MAX: usize = 0xffffff;
pub const UDP_SOCK_SENDBUFF_MIN: usize = 512;
pub const UDP_SOCK_SENDBUFF_MAX: usize = 0xffffff;
pub const UDP_CONN_VECTOR_LEN_MIN: usize = 1;
pub const UDP_CONN_VECTOR_LEN_MAX: usize = 0xffff;
pub const TCP_LISTENER_PENDING_CONNS_MIN: usize = 1;
pub const TCP_LISTENER_PENDING_CONNS_MAX: usize = 0xffff;
pub const TCP_LISTENER_MAX_ACCEPT_MIN: usize = 1;
pub const TCP_LISTENER_MAX_ACCEPT_MAX: usize = 1024;
pub const TCP_CONN_SO_BUFF_MIN: usize = 514;
pub const TCP_CONN_SO_RECVBUFF_MAX: usize = 0xffff;
pub const TCP_CONN_SO_SENDBUFF_MAX: usize = 0xfffff;
pub const TCP_CONN_SIM_QUERIES_MIN: usize = 1;
pub const TCP_CONN_SIM_QUERIES_MAX: usize = 0xff;
pub const TCP_KEEPALIVE_MIN: u64 = 1000;
pub const TCP_KEEPALIVE_MAX: u64 = 600_000;
pub const TCP_QUERY_TIMEOUT_MIN: u64 = 1;
pub const TCP_QUERY_TIMEOUT_MAX: u64 = 600_000;
pub const EPOLL_NUM_EVENTS_MIN: usize = 3;
pub const EPOLL_NUM_EVENTS_MAX: usize = 1024;
pub const PROCESS_THREAD_COUNT_MIN: usize = 1;
pub const PROCESS_THREAD_COUNT_MAX: usize = 1024;
pub const LOOP_SLOWDOWN_MIN: u64 = 1;
pub const LOOP_SLOWDOWN_MAX: u64 = 10_000;

/// The smallest usable query-log buffer: enough headroom for one
/// maximal entry on each side of the double buffer.
pub const QUERY_LOG_BUFFER_SIZE_MIN: usize = 2 * 0xffff;

////////////////////////////////////////////////////////////////////////
// THE CONFIGURATION OBJECT                                           //
////////////////////////////////////////////////////////////////////////

/// The complete server configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Whether to serve DNS over UDP.
    pub udp_enable: bool,

    /// The UDP listener port.
    pub udp_listener_port: u16,

    /// `SO_RCVBUF` for UDP listener sockets.
    pub udp_socket_recvbuff_size: usize,

    /// `SO_SNDBUF` for UDP listener sockets.
    pub udp_socket_sendbuff_size: usize,

    /// The number of slots in each shard's UDP receive vector. The
    /// same count sizes the query array and the send vector.
    pub udp_conn_vector_len: usize,

    /// Whether to serve DNS over TCP.
    pub tcp_enable: bool,

    /// The TCP listener port.
    pub tcp_listener_port: u16,

    /// The TCP listen backlog.
    pub tcp_listener_pending_conns_max: usize,

    /// The cap on concurrently established TCP connections per shard.
    pub tcp_conns_per_vl_max: usize,

    /// The cap on connections accepted per loop iteration.
    pub tcp_listener_max_accept_new_conn: usize,

    /// `SO_RCVBUF` for accepted TCP sockets.
    pub tcp_conn_socket_recvbuff_size: usize,

    /// `SO_SNDBUF` for accepted TCP sockets.
    pub tcp_conn_socket_sendbuff_size: usize,

    /// How many pipelined queries a TCP connection processes per read.
    /// Also sizes the connection read buffer (see
    /// [`Config::tcp_readbuff_size`]).
    pub tcp_conn_simultaneous_queries_count: usize,

    /// Idle connection timeout, in milliseconds.
    pub tcp_keepalive: u64,

    /// How long a connection may take to deliver a complete query
    /// frame, in milliseconds.
    pub tcp_query_recv_timeout: u64,

    /// How long a blocked response write may take, in milliseconds.
    pub tcp_query_send_timeout: u64,

    /// The readiness batch size for the TCP event set.
    pub epoll_num_events_tcp: usize,

    /// The readiness batch size for the UDP event set.
    pub epoll_num_events_udp: usize,

    /// The number of shard (vectorloop) threads.
    pub process_thread_count: usize,

    /// One entry per shard: the 1-based CPU to pin the shard to, or 0
    /// to leave it unpinned. Shards beyond the end of the list are
    /// unpinned.
    pub process_thread_masks: Vec<usize>,

    /// Idle back-off sleep for the first stage, in microseconds.
    pub loop_slowdown_one: u64,

    /// Idle back-off sleep for the second stage, in microseconds.
    pub loop_slowdown_two: u64,

    /// Idle back-off sleep for the third stage, in microseconds.
    pub loop_slowdown_three: u64,

    /// The application log file name.
    pub app_log_name: String,

    /// The directory holding the application log.
    pub app_log_path: PathBuf,

    /// The size of each per-shard query-log buffer (there are two).
    pub query_log_buffer_size: usize,

    /// The base name of query log files; a timestamp is appended.
    pub query_log_base_name: String,

    /// The directory holding query logs.
    pub query_log_path: PathBuf,

    /// Cumulative bytes after which the query log rotates to a new
    /// file.
    pub query_log_rotate_size: u64,

    /// The display name of the loadable resource.
    pub resource_name: String,

    /// The file backing the loadable resource.
    pub resource_filepath: PathBuf,

    /// How often to check the resource for changes, in seconds.
    pub resource_update_freq: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp_enable: true,
            udp_listener_port: 53,
            udp_socket_recvbuff_size: 0xfffff,
            udp_socket_sendbuff_size: 0xfffff,
            udp_conn_vector_len: 8,
            tcp_enable: true,
            tcp_listener_port: 53,
            tcp_listener_pending_conns_max: 1024,
            tcp_conns_per_vl_max: 100_000,
            tcp_listener_max_accept_new_conn: 8,
            tcp_conn_socket_recvbuff_size: 0x800,
            tcp_conn_socket_sendbuff_size: 0x3000,
            tcp_conn_simultaneous_queries_count: 3,
            tcp_keepalive: 10_000,
            tcp_query_recv_timeout: 2000,
            tcp_query_send_timeout: 2000,
            epoll_num_events_tcp: 8,
            epoll_num_events_udp: 8,
            process_thread_count: 1,
            process_thread_masks: Vec::new(),
            loop_slowdown_one: 1,
            loop_slowdown_two: 50,
            loop_slowdown_three: 100,
            app_log_name: "quiver.log".to_owned(),
            app_log_path: PathBuf::from("."),
            query_log_buffer_size: 6_553_500,
            query_log_base_name: "dns_query_log".to_owned(),
            query_log_path: PathBuf::from("logs"),
            query_log_rotate_size: 50_000_000,
            resource_name: "Resource_1".to_owned(),
            resource_filepath: PathBuf::from("resource1.txt"),
            resource_update_freq: 5,
        }
    }
}

impl Config {
    /// The size of a TCP connection's read buffer: room for the
    /// configured number of simultaneous queries, each a length prefix
    /// plus a maximum-size query.
    pub fn tcp_readbuff_size(&self) -> usize {
        self.tcp_conn_simultaneous_queries_count * (2 + PACKETSZ)
    }

    pub fn tcp_keepalive(&self) -> Duration {
        Duration::from_millis(self.tcp_keepalive)
    }

    pub fn tcp_query_recv_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_query_recv_timeout)
    }

    pub fn tcp_query_send_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_query_send_timeout)
    }

    /// The full path of the application log file.
    pub fn app_log_file(&self) -> PathBuf {
        self.app_log_path.join(&self.app_log_name)
    }

    /// The CPU (1-based) a shard is pinned to, or [`None`] for
    /// unpinned.
    pub fn thread_mask(&self, shard: usize) -> Option<usize> {
        match self.process_thread_masks.get(shard) {
            Some(0) | None => None,
            Some(&cpu) => Some(cpu),
        }
    }

    /// Checks every option against its permitted range.
    pub fn validate(&self) -> Result<(), Error> {
        fn range<T: PartialOrd + std::fmt::Display + Copy>(
            field: &'static str,
            value: T,
            min: T,
            max: T,
        ) -> Result<(), Error> {
            if value < min || value > max {
                Err(Error {
                    field,
                    message: format!("{} is outside the range {}..={}", value, min, max),
                })
            } else {
                Ok(())
            }
        }

        if self.udp_listener_port == 0 {
            return Err(Error {
                field: "udp_listener_port",
                message: "port 0 cannot be listened on".to_owned(),
            });
        }
        if self.tcp_listener_port == 0 {
            return Err(Error {
                field: "tcp_listener_port",
                message: "port 0 cannot be listened on".to_owned(),
            });
        }
        range(
            "udp_socket_recvbuff_size",
            self.udp_socket_recvbuff_size,
            UDP_SOCK_RECVBUFF_MIN,
            UDP_SOCK_RECVBUFF_MAX,
        )?;
        range(
            "udp_socket_sendbuff_size",
            self.udp_socket_sendbuff_size,
            UDP_SOCK_SENDBUFF_MIN,
            UDP_SOCK_SENDBUFF_MAX,
        )?;
        range(
            "udp_conn_vector_len",
            self.udp_conn_vector_len,
            UDP_CONN_VECTOR_LEN_MIN,
            UDP_CONN_VECTOR_LEN_MAX,
        )?;
        range(
            "tcp_listener_pending_conns_max",
            self.tcp_listener_pending_conns_max,
            TCP_LISTENER_PENDING_CONNS_MIN,
            TCP_LISTENER_PENDING_CONNS_MAX,
        )?;
        range(
            "tcp_listener_max_accept_new_conn",
            self.tcp_listener_max_accept_new_conn,
            TCP_LISTENER_MAX_ACCEPT_MIN,
            TCP_LISTENER_MAX_ACCEPT_MAX,
        )?;
        if self.tcp_conns_per_vl_max == 0 {
            return Err(Error {
                field: "tcp_conns_per_vl_max",
                message: "at least one TCP connection per shard is required".to_owned(),
            });
        }
        range(
            "tcp_conn_socket_recvbuff_size",
            self.tcp_conn_socket_recvbuff_size,
            TCP_CONN_SO_BUFF_MIN,
            TCP_CONN_SO_RECVBUFF_MAX,
        )?;
        range(
            "tcp_conn_socket_sendbuff_size",
            self.tcp_conn_socket_sendbuff_size,
            TCP_CONN_SO_BUFF_MIN,
            TCP_CONN_SO_SENDBUFF_MAX,
        )?;
        range(
            "tcp_conn_simultaneous_queries_count",
            self.tcp_conn_simultaneous_queries_count,
            TCP_CONN_SIM_QUERIES_MIN,
            TCP_CONN_SIM_QUERIES_MAX,
        )?;
        range(
            "tcp_keepalive",
            self.tcp_keepalive,
            TCP_KEEPALIVE_MIN,
            TCP_KEEPALIVE_MAX,
        )?;
        range(
            "tcp_query_recv_timeout",
            self.tcp_query_recv_timeout,
            TCP_QUERY_TIMEOUT_MIN,
            TCP_QUERY_TIMEOUT_MAX,
        )?;
        range(
            "tcp_query_send_timeout",
            self.tcp_query_send_timeout,
            TCP_QUERY_TIMEOUT_MIN,
            TCP_QUERY_TIMEOUT_MAX,
        )?;
        range(
            "epoll_num_events_tcp",
            self.epoll_num_events_tcp,
            EPOLL_NUM_EVENTS_MIN,
            EPOLL_NUM_EVENTS_MAX,
        )?;
        range(
            "epoll_num_events_udp",
            self.epoll_num_events_udp,
            EPOLL_NUM_EVENTS_MIN,
            EPOLL_NUM_EVENTS_MAX,
        )?;
        range(
            "process_thread_count",
            self.process_thread_count,
            PROCESS_THREAD_COUNT_MIN,
            PROCESS_THREAD_COUNT_MAX,
        )?;
        range(
            "loop_slowdown_one",
            self.loop_slowdown_one,
            LOOP_SLOWDOWN_MIN,
            LOOP_SLOWDOWN_MAX,
        )?;
        range(
            "loop_slowdown_two",
            self.loop_slowdown_two,
            LOOP_SLOWDOWN_MIN,
            LOOP_SLOWDOWN_MAX,
        )?;
        range(
            "loop_slowdown_three",
            self.loop_slowdown_three,
            LOOP_SLOWDOWN_MIN,
            LOOP_SLOWDOWN_MAX,
        )?;
        if self.query_log_buffer_size < QUERY_LOG_BUFFER_SIZE_MIN {
            return Err(Error {
                field: "query_log_buffer_size",
                message: format!(
                    "{} is too small; at least {} bytes are required",
                    self.query_log_buffer_size, QUERY_LOG_BUFFER_SIZE_MIN
                ),
            });
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// A configuration option outside its permitted range.
#[derive(Debug)]
pub struct Error {
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.field, self.message)
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut config = Config::default();
        config.tcp_keepalive = 1;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "tcp_keepalive");

        let mut config = Config::default();
        config.epoll_num_events_udp = 2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.udp_listener_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn derived_sizes_follow_the_simultaneous_query_count() {
        let mut config = Config::default();
        config.tcp_conn_simultaneous_queries_count = 5;
        assert_eq!(config.tcp_readbuff_size(), 5 * 514);
    }

    #[test]
    fn thread_masks_treat_zero_as_unpinned() {
        let mut config = Config::default();
        config.process_thread_masks = vec![0, 3];
        assert_eq!(config.thread_mask(0), None);
        assert_eq!(config.thread_mask(1), Some(3));
        assert_eq!(config.thread_mask(2), None);
    }

    #[test]
    fn deserializes_from_toml_with_defaults() {
        let config: Config =
            toml::from_str("udp_listener_port = 5353\ntcp_enable = false\n").unwrap();
        assert_eq!(config.udp_listener_port, 5353);
        assert!(!config.tcp_enable);
        assert_eq!(config.process_thread_count, 1);
    }
}
