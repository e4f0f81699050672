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

//! UDP batched I/O vectors.
//!
//! Each UDP listener owns a receive vector, a parallel array of query
//! slots, and a send vector, all sized by `udp_conn_vector_len`.
//! Datagrams are received in batches with `recvmmsg` and responses
//! sent with `sendmmsg`. The send vector reuses the receive vector's
//! peer-address and ancillary-data storage, so a reply naturally
//! returns to the peer from the local address the request arrived at
//! (the kernel reads the echoed `IP_PKTINFO`/`IPV6_PKTINFO` control
//! message when sending).
//!
//! `nix` has no safe wrapper that permits this storage sharing, so the
//! message headers are managed as raw `libc` structures, confined to
//! this module. All referenced storage is heap-allocated at
//! construction and never reallocated, so the recorded pointers stay
//! valid for the listener's lifetime.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::ptr;

use crate::config::Config;
use crate::query::Query;

/// The size of each slot's ancillary-data buffer. Must fit the packet
/// info control message of either address family.
pub const UDP_MSG_CONTROL_LEN: usize = 64;

////////////////////////////////////////////////////////////////////////
// RAW VECTOR STORAGE                                                 //
////////////////////////////////////////////////////////////////////////

struct MsgVectors {
    names: Box<[libc::sockaddr_storage]>,
    controls: Box<[[u8; UDP_MSG_CONTROL_LEN]]>,
    read_iovs: Box<[libc::iovec]>,
    write_iovs: Box<[libc::iovec]>,
    read_msgs: Box<[libc::mmsghdr]>,
    write_msgs: Box<[libc::mmsghdr]>,
}

// SAFETY: the raw pointers inside the message headers refer only to
// heap allocations owned by the same UdpListenerState (the name,
// control, and iovec boxes here, and the per-query buffers), which
// move with it between threads. Only the owning shard thread ever
// touches them.
unsafe impl Send for MsgVectors {}

impl std::fmt::Debug for MsgVectors {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MsgVectors")
            .field("len", &self.read_msgs.len())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// UDP LISTENER STATE                                                 //
////////////////////////////////////////////////////////////////////////

/// The per-listener batching state: receive vector, query slots, and
/// send vector.
#[derive(Debug)]
pub struct UdpListenerState {
    /// The number of slots in each vector.
    pub vector_len: usize,

    /// One query slot per vector entry.
    pub queries: Vec<Query>,

    /// Datagrams received by the last batch receive.
    pub read_vector_count: usize,

    /// Populated entries in the send vector.
    pub write_vector_count: usize,

    /// The send-vector entry the next batch send starts from; advanced
    /// on partial sends.
    pub write_vector_write_index: usize,

    /// The port this listener is bound to, used to reconstruct the
    /// local address from packet info (which carries no port).
    port: u16,

    ipv6: bool,

    /// Maps send-vector slots back to query slots.
    write_slot_query: Box<[usize]>,

    vectors: MsgVectors,
}

impl UdpListenerState {
    pub fn new(cfg: &Config, ipv6: bool) -> Self {
        let n = cfg.udp_conn_vector_len;
        let mut queries: Vec<Query> = (0..n).map(|_| Query::new_udp()).collect();

        // SAFETY: sockaddr_storage, iovec, and mmsghdr are plain C
        // structures for which zeroes are a valid (empty) value.
        let mut names: Box<[libc::sockaddr_storage]> =
            vec![unsafe { mem::zeroed() }; n].into_boxed_slice();
        let mut controls: Box<[[u8; UDP_MSG_CONTROL_LEN]]> =
            vec![[0; UDP_MSG_CONTROL_LEN]; n].into_boxed_slice();
        let mut read_iovs: Box<[libc::iovec]> =
            vec![unsafe { mem::zeroed() }; n].into_boxed_slice();
        let mut write_iovs: Box<[libc::iovec]> =
            vec![unsafe { mem::zeroed() }; n].into_boxed_slice();
        let mut read_msgs: Box<[libc::mmsghdr]> =
            vec![unsafe { mem::zeroed() }; n].into_boxed_slice();
        let mut write_msgs: Box<[libc::mmsghdr]> =
            vec![unsafe { mem::zeroed() }; n].into_boxed_slice();

        for i in 0..n {
            read_iovs[i].iov_base = queries[i].request_buffer.as_mut_ptr().cast();
            read_iovs[i].iov_len = queries[i].request_buffer.len();

            let mh = &mut read_msgs[i].msg_hdr;
            mh.msg_name = ptr::addr_of_mut!(names[i]).cast();
            mh.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            mh.msg_iov = ptr::addr_of_mut!(read_iovs[i]);
            mh.msg_iovlen = 1;
            mh.msg_control = controls[i].as_mut_ptr().cast();
            mh.msg_controllen = UDP_MSG_CONTROL_LEN as _;

            let mh = &mut write_msgs[i].msg_hdr;
            mh.msg_iov = ptr::addr_of_mut!(write_iovs[i]);
            mh.msg_iovlen = 1;
        }

        Self {
            vector_len: n,
            queries,
            read_vector_count: 0,
            write_vector_count: 0,
            write_vector_write_index: 0,
            port: cfg.udp_listener_port,
            ipv6,
            write_slot_query: vec![0; n].into_boxed_slice(),
            vectors: MsgVectors {
                names,
                controls,
                read_iovs,
                write_iovs,
                read_msgs,
                write_msgs,
            },
        }
    }

    /// Resets the vectors and query slots for the next batch receive.
    pub fn reset_vectors(&mut self) {
        for i in 0..self.vector_len {
            let mh = &mut self.vectors.read_msgs[i].msg_hdr;
            mh.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            mh.msg_controllen = UDP_MSG_CONTROL_LEN as _;
            self.queries[i].reset();
        }
        self.read_vector_count = 0;
        self.write_vector_count = 0;
        self.write_vector_write_index = 0;
    }

    /// Receives a batch of datagrams. On success the receive-vector
    /// count is updated and returned.
    pub fn recv(&mut self, fd: RawFd) -> io::Result<usize> {
        // SAFETY: the message headers and all storage they point at
        // were set up in new() and stay valid; see MsgVectors.
        let ret = unsafe {
            libc::recvmmsg(
                fd,
                self.vectors.read_msgs.as_mut_ptr(),
                self.vector_len as libc::c_uint,
                libc::MSG_DONTWAIT,
                ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        self.read_vector_count = ret as usize;
        Ok(ret as usize)
    }

    /// Returns the length of the datagram in receive slot `i`.
    pub fn datagram_len(&self, i: usize) -> usize {
        self.vectors.read_msgs[i].msg_len as usize
    }

    /// Returns the peer address of receive slot `i`.
    pub fn client_addr(&self, i: usize) -> Option<SocketAddr> {
        sockaddr_storage_to_addr(&self.vectors.names[i])
    }

    /// Extracts the destination (local) address of receive slot `i`
    /// from its packet-info control message. The port is the
    /// listener's, which the control message does not carry.
    pub fn local_addr(&self, i: usize) -> Option<SocketAddr> {
        let ip = dest_addr_from_cmsgs(&self.vectors.read_msgs[i].msg_hdr, self.ipv6)?;
        Some(SocketAddr::new(ip, self.port))
    }

    /// Points send slot `i`'s peer-address and ancillary storage at
    /// receive slot `i`'s, so the reply goes back the way the request
    /// came.
    pub fn mirror_write_slot(&mut self, i: usize) {
        let read = self.vectors.read_msgs[i].msg_hdr;
        let mh = &mut self.vectors.write_msgs[i].msg_hdr;
        mh.msg_name = read.msg_name;
        mh.msg_namelen = read.msg_namelen;
        mh.msg_control = read.msg_control;
        mh.msg_controllen = read.msg_controllen;
    }

    /// Builds the send vector from the queries that have a response to
    /// send, compacting over dropped ones.
    pub fn populate_write_vector(&mut self) {
        let mut count = 0;
        for i in 0..self.read_vector_count {
            if !self.queries[i].end_code.responds() {
                continue;
            }
            self.vectors.write_iovs[count].iov_base =
                self.queries[i].response_buffer.as_mut_ptr().cast();
            self.vectors.write_iovs[count].iov_len = self.queries[i].response_len;

            let read = self.vectors.read_msgs[i].msg_hdr;
            let mh = &mut self.vectors.write_msgs[count].msg_hdr;
            mh.msg_name = read.msg_name;
            mh.msg_namelen = read.msg_namelen;
            mh.msg_control = read.msg_control;
            mh.msg_controllen = read.msg_controllen;
            mh.msg_flags = 0;
            // Note: the iovec pointer for this slot was fixed at
            // construction and indexes write_iovs[count], which is why
            // the iovec above is filled at `count`, not `i`.

            self.write_slot_query[count] = i;
            count += 1;
        }
        self.write_vector_count = count;
        self.write_vector_write_index = 0;
    }

    /// Sends the unsent tail of the send vector. Returns how many
    /// messages the kernel accepted.
    pub fn send(&mut self, fd: RawFd) -> io::Result<usize> {
        let index = self.write_vector_write_index;
        let remaining = self.write_vector_count - index;
        // SAFETY: as for recv(); the populated send slots reference
        // live response buffers and the shared name/control storage.
        let ret = unsafe {
            libc::sendmmsg(
                fd,
                self.vectors.write_msgs.as_mut_ptr().add(index),
                remaining as libc::c_uint,
                0,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    /// Maps a send-vector slot back to the query slot it carries.
    pub fn query_for_write_slot(&self, slot: usize) -> usize {
        self.write_slot_query[slot]
    }
}

////////////////////////////////////////////////////////////////////////
// RAW SOCKADDR AND CMSG DECODING                                     //
////////////////////////////////////////////////////////////////////////

fn sockaddr_storage_to_addr(ss: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match ss.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: the kernel filled this storage for an AF_INET
            // peer, so reinterpreting as sockaddr_in is valid.
            let sin = unsafe { &*(ss as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: as above, for AF_INET6.
            let sin6 =
                unsafe { &*(ss as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Walks the control messages of a received datagram looking for the
/// packet info that names the destination address.
fn dest_addr_from_cmsgs(mh: &libc::msghdr, ipv6: bool) -> Option<IpAddr> {
    // SAFETY: mh describes a received message whose control buffer is
    // owned storage of at least msg_controllen bytes; CMSG_* walk it
    // per the kernel's layout rules.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(mh);
        while !cmsg.is_null() {
            if !ipv6
                && (*cmsg).cmsg_level == libc::IPPROTO_IP
                && (*cmsg).cmsg_type == libc::IP_PKTINFO
            {
                let info = libc::CMSG_DATA(cmsg).cast::<libc::in_pktinfo>();
                return Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(
                    (*info).ipi_addr.s_addr,
                ))));
            }
            if ipv6
                && (*cmsg).cmsg_level == libc::IPPROTO_IPV6
                && (*cmsg).cmsg_type == libc::IPV6_PKTINFO
            {
                let info = libc::CMSG_DATA(cmsg).cast::<libc::in6_pktinfo>();
                return Some(IpAddr::V6(Ipv6Addr::from((*info).ipi6_addr.s6_addr)));
            }
            cmsg = libc::CMSG_NXTHDR(mh as *const libc::msghdr as *mut libc::msghdr, cmsg);
        }
    }
    None
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
