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

//! Listener socket provisioning.
//!
//! Every shard binds its own listening sockets with `SO_REUSEPORT`,
//! so the kernel hashes flows across shards and no connection state is
//! ever shared between them. UDP sockets additionally enable
//! `IP_PKTINFO` (or `IPV6_RECVPKTINFO`), which is how a reply can be
//! sent from the exact local address the request arrived at even
//! though the socket is bound to the unspecified address.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;

use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockProtocol, SockType,
    SockaddrStorage,
};
use nix::unistd::close;

use crate::config::Config;

/// The transport to provision a listener for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Proto {
    Udp,
    Tcp,
}

/// Creates, configures, binds, and (for TCP) starts listening on a
/// socket for one shard. The socket is non-blocking and bound to the
/// unspecified address of the requested family.
pub fn provision(cfg: &Config, ipv6: bool, proto: Proto) -> Result<RawFd, Error> {
    let family = if ipv6 {
        AddressFamily::Inet6
    } else {
        AddressFamily::Inet
    };
    let (sock_type, sock_proto, rcvbuf, sndbuf, port) = match proto {
        Proto::Udp => (
            SockType::Datagram,
            SockProtocol::Udp,
            cfg.udp_socket_recvbuff_size,
            cfg.udp_socket_sendbuff_size,
            cfg.udp_listener_port,
        ),
        Proto::Tcp => (
            SockType::Stream,
            SockProtocol::Tcp,
            cfg.tcp_conn_socket_recvbuff_size,
            cfg.tcp_conn_socket_sendbuff_size,
            cfg.tcp_listener_port,
        ),
    };

    let fd = socket(
        family,
        sock_type,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        sock_proto,
    )
    .map_err(|e| Error::new("create socket", e))?;

    let result = configure_and_bind(cfg, fd, ipv6, proto, rcvbuf, sndbuf, port);
    if let Err(e) = result {
        let _ = close(fd);
        return Err(e);
    }
    Ok(fd)
}

fn configure_and_bind(
    cfg: &Config,
    fd: RawFd,
    ipv6: bool,
    proto: Proto,
    rcvbuf: usize,
    sndbuf: usize,
    port: u16,
) -> Result<(), Error> {
    setsockopt(fd, sockopt::RcvBuf, &rcvbuf).map_err(|e| Error::new("set SO_RCVBUF", e))?;
    setsockopt(fd, sockopt::SndBuf, &sndbuf).map_err(|e| Error::new("set SO_SNDBUF", e))?;
    setsockopt(fd, sockopt::ReuseAddr, &true).map_err(|e| Error::new("set SO_REUSEADDR", e))?;
    setsockopt(fd, sockopt::ReusePort, &true).map_err(|e| Error::new("set SO_REUSEPORT", e))?;

    if ipv6 {
        // Keep IPv4-mapped traffic on the IPv4 listener.
        setsockopt(fd, sockopt::Ipv6V6Only, &true)
            .map_err(|e| Error::new("set IPV6_V6ONLY", e))?;
        if proto == Proto::Udp {
            setsockopt(fd, sockopt::Ipv6RecvPacketInfo, &true)
                .map_err(|e| Error::new("set IPV6_RECVPKTINFO", e))?;
        }
    } else if proto == Proto::Udp {
        setsockopt(fd, sockopt::Ipv4PacketInfo, &true)
            .map_err(|e| Error::new("set IP_PKTINFO", e))?;
    }

    let ip = if ipv6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    let addr = SockaddrStorage::from(SocketAddr::new(ip, port));
    bind(fd, &addr).map_err(|e| Error::new("bind", e))?;

    if proto == Proto::Tcp {
        listen(fd, cfg.tcp_listener_pending_conns_max)
            .map_err(|e| Error::new("listen", e))?;
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// A listener provisioning failure, naming the step that failed.
#[derive(Debug)]
pub struct Error {
    pub step: &'static str,
    pub source: nix::Error,
}

impl Error {
    fn new(step: &'static str, source: nix::Error) -> Self {
        Self { step, source }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "failed to {}: {}", self.step, self.source)
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
    fn udp_listener_binds_on_a_high_port() {
        let mut cfg = Config::default();
        cfg.udp_listener_port = 35353;
        let fd = provision(&cfg, false, Proto::Udp).unwrap();
        assert!(fd >= 0);
        let _ = close(fd);
    }

    #[test]
    fn tcp_listener_binds_and_listens_on_a_high_port() {
        let mut cfg = Config::default();
        cfg.tcp_listener_port = 35354;
        let fd = provision(&cfg, false, Proto::Tcp).unwrap();
        assert!(fd >= 0);
        // A second shard can bind the same port thanks to
        // SO_REUSEPORT.
        let fd2 = provision(&cfg, false, Proto::Tcp).unwrap();
        let _ = close(fd);
        let _ = close(fd2);
    }
}
