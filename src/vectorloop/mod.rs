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

//! The per-shard processing loop.
//!
//! A [`Vectorloop`] owns everything one shard needs: its listening
//! sockets, its established TCP connections, two edge-triggered
//! readiness sets, the inter-stage FIFO queues, the query-log double
//! buffer, and its ends of the channels to the support threads. The
//! loop body is a strictly serial sweep of pipeline stages; every
//! stage drains its input queue in one pass, no stage blocks, and all
//! socket I/O is non-blocking. When an iteration performs no work at
//! all, the loop backs off with a short sleep that grows over
//! consecutive idle iterations.
//!
//! Within a connection, queries move through the stages in arrival
//! order; across connections, ordering is by stage (all reads happen
//! before any parse, and so on). Nothing here is shared with other
//! shards.

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use nix::errno::Errno;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::sys::socket::{accept4, getpeername, getsockname, SockFlag, SockaddrStorage};
use nix::unistd::Pid;
use slab::Slab;

use crate::channel::{ControlEndpoint, ControlOp, LogMsg, LogSender};
use crate::config::Config;
use crate::conn::{
    listener, tcp_id_assign, Conn, ConnFifo, ConnKind, LruSet, Segmentation, TcpConn, TcpState,
    UdpListenerState,
};
use crate::message::{EndCode, PACKETSZ};
use crate::metrics::{self, Metrics};
use crate::query::{log as query_log, pack, parse};
use crate::resolver::{Resolver, Resource};

pub mod epoll;

use epoll::EventSet;

////////////////////////////////////////////////////////////////////////
// THE VECTORLOOP                                                     //
////////////////////////////////////////////////////////////////////////

pub struct Vectorloop {
    id: usize,
    cfg: Arc<Config>,
    metrics: Arc<Metrics>,
    resolver: Arc<dyn Resolver>,

    resource_channel: ControlEndpoint,
    query_log_channel: ControlEndpoint,
    app_log: LogSender,
    shutdown: Arc<AtomicBool>,

    udp_events: EventSet,
    tcp_events: EventSet,

    /// The connection arena. Tokens (slot indices) address
    /// connections from the queues and the readiness sets.
    conns: Slab<Conn>,

    udp_read_queue: ConnFifo,
    udp_write_queue: ConnFifo,
    tcp_accept_queue: ConnFifo,
    tcp_read_queue: ConnFifo,
    tcp_write_queue: ConnFifo,
    parse_queue: ConnFifo,
    resolve_queue: ConnFifo,
    pack_queue: ConnFifo,
    log_queue: ConnFifo,
    release_queue: ConnFifo,

    /// Established TCP connections in recency order, keyed by
    /// connection id.
    lru: LruSet,
    conn_tcp_id_base: u64,
    conns_tcp_active: usize,

    /// The active query-log slab and, until the query-log thread
    /// borrows it, the spare one.
    query_log_active: Vec<u8>,
    query_log_spare: Option<Vec<u8>>,

    /// The currently published resource artifact.
    resource: Option<Arc<Resource>>,

    /// Monotonic snapshot taken at the top of each iteration; all
    /// timeout arithmetic uses it.
    loop_mono: Instant,

    /// Wall-clock snapshot taken alongside, for log timestamps.
    loop_wall: SystemTime,

    idle_count: u32,
}

impl Vectorloop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        cfg: Arc<Config>,
        metrics: Arc<Metrics>,
        resolver: Arc<dyn Resolver>,
        resource_channel: ControlEndpoint,
        query_log_channel: ControlEndpoint,
        app_log: LogSender,
        shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let udp_events = EventSet::new(cfg.epoll_num_events_udp)?;
        let tcp_events = EventSet::new(cfg.epoll_num_events_tcp)?;
        let buffer_size = cfg.query_log_buffer_size;
        Ok(Self {
            id,
            cfg,
            metrics,
            resolver,
            resource_channel,
            query_log_channel,
            app_log,
            shutdown,
            udp_events,
            tcp_events,
            conns: Slab::new(),
            udp_read_queue: ConnFifo::new(),
            udp_write_queue: ConnFifo::new(),
            tcp_accept_queue: ConnFifo::new(),
            tcp_read_queue: ConnFifo::new(),
            tcp_write_queue: ConnFifo::new(),
            parse_queue: ConnFifo::new(),
            resolve_queue: ConnFifo::new(),
            pack_queue: ConnFifo::new(),
            log_queue: ConnFifo::new(),
            release_queue: ConnFifo::new(),
            lru: LruSet::new(),
            conn_tcp_id_base: 0,
            conns_tcp_active: 0,
            query_log_active: Vec::with_capacity(buffer_size),
            query_log_spare: Some(Vec::with_capacity(buffer_size)),
            resource: None,
            loop_mono: Instant::now(),
            loop_wall: SystemTime::now(),
            idle_count: 0,
        })
    }

    /// Runs the loop until shutdown is requested.
    pub fn run(mut self) {
        self.set_affinity();
        self.register_listeners();

        while !self.shutdown.load(Ordering::Relaxed) {
            let work = self.iterate();

            if work == 0 {
                self.idle_count += 1;
                let micros = if self.idle_count < 8 {
                    self.cfg.loop_slowdown_one
                } else if self.idle_count < 16 {
                    self.cfg.loop_slowdown_two
                } else {
                    self.cfg.loop_slowdown_three
                };
                std::thread::sleep(Duration::from_micros(micros));
            } else if self.idle_count != 0 {
                self.idle_count = 0;
            }
        }
    }

    /// One full sweep of the pipeline stages. Returns the amount of
    /// work performed, for the idle back-off.
    fn iterate(&mut self) -> usize {
        self.loop_mono = Instant::now();
        self.loop_wall = SystemTime::now();

        let mut work = 0;
        work += self.stage_channel_messages();
        work += self.stage_epoll();
        work += self.stage_udp_read();
        work += self.stage_tcp_accept();
        work += self.stage_tcp_read();
        self.stage_query_parse();
        self.stage_query_resolve();
        self.stage_query_pack();
        work += self.stage_udp_write();
        work += self.stage_tcp_write();
        self.stage_query_log();
        self.stage_tcp_timeouts();
        self.stage_tcp_release();
        work
    }

    ////////////////////////////////////////////////////////////////////
    // SET-UP                                                         //
    ////////////////////////////////////////////////////////////////////

    fn set_affinity(&self) {
        if let Some(cpu) = self.cfg.thread_mask(self.id) {
            let mut cpu_set = CpuSet::new();
            let pin = cpu_set
                .set(cpu - 1)
                .and_then(|()| sched_setaffinity(Pid::from_raw(0), &cpu_set));
            if pin.is_err() {
                self.log_app(
                    format!(
                        "shard {}: could not set CPU affinity; performance may be impacted",
                        self.id
                    ),
                    false,
                );
            }
        }
    }

    /// Provisions and registers this shard's listeners. A provisioning
    /// failure is fatal to the process (reported through the
    /// application log).
    fn register_listeners(&mut self) {
        if self.cfg.udp_enable {
            for ipv6 in [false, true] {
                match listener::provision(&self.cfg, ipv6, listener::Proto::Udp) {
                    Ok(fd) => {
                        let state = UdpListenerState::new(&self.cfg, ipv6);
                        let token = self.conns.insert(Conn::new(
                            fd,
                            ipv6,
                            ConnKind::UdpListener(Box::new(state)),
                        ));
                        if let Err(e) = self.udp_events.register_readwrite_et(fd, token as u64) {
                            self.log_app(
                                format!("shard {}: failed to register UDP listener: {}", self.id, e),
                                true,
                            );
                            return;
                        }
                        self.udp_read_queue.enqueue_read(&mut self.conns, token);
                    }
                    Err(e) => {
                        self.log_app(
                            format!(
                                "shard {}: could not start UDP {} listener: {}",
                                self.id,
                                if ipv6 { "IPv6" } else { "IPv4" },
                                e
                            ),
                            true,
                        );
                        return;
                    }
                }
            }
        }

        if self.cfg.tcp_enable {
            for ipv6 in [false, true] {
                match listener::provision(&self.cfg, ipv6, listener::Proto::Tcp) {
                    Ok(fd) => {
                        let token =
                            self.conns
                                .insert(Conn::new(fd, ipv6, ConnKind::TcpListener));
                        if let Err(e) = self.tcp_events.register_readwrite_et(fd, token as u64) {
                            self.log_app(
                                format!("shard {}: failed to register TCP listener: {}", self.id, e),
                                true,
                            );
                            return;
                        }
                        self.tcp_accept_queue.enqueue_read(&mut self.conns, token);
                    }
                    Err(e) => {
                        self.log_app(
                            format!(
                                "shard {}: could not start TCP {} listener: {}",
                                self.id,
                                if ipv6 { "IPv6" } else { "IPv4" },
                                e
                            ),
                            true,
                        );
                        return;
                    }
                }
            }
        }
    }

    ////////////////////////////////////////////////////////////////////
    // STAGE 1: CONTROL CHANNELS                                      //
    ////////////////////////////////////////////////////////////////////

    /// Drains the control channels: resource pointer updates and
    /// query-log buffer flips. Both are request/response: the reply
    /// goes back on the same channel, payload ownership transferring
    /// with it.
    fn stage_channel_messages(&mut self) -> usize {
        let mut work = 0;

        if let Some(mut msg) = self.resource_channel.try_recv() {
            match msg.op {
                ControlOp::SetResource => {
                    // Adopt the new artifact; the reference to the old
                    // one drops here, before the acknowledgment.
                    self.resource = msg.resource.take();
                    msg.ok = true;
                    if self.resource_channel.send(msg).is_err() {
                        self.log_app(
                            format!("shard {}: resource acknowledgment channel full", self.id),
                            true,
                        );
                    }
                    work += 1;
                }
                _ => {
                    self.log_app(
                        format!(
                            "shard {}: unexpected op {:?} on resource channel",
                            self.id, msg.op
                        ),
                        true,
                    );
                }
            }
        }

        if let Some(mut msg) = self.query_log_channel.try_recv() {
            match msg.op {
                ControlOp::QueryLogFlip => {
                    // Take the drained buffer the writer returned (or
                    // the startup spare), make it the active one, and
                    // surrender the filled buffer in the reply.
                    let mut incoming = msg
                        .buf
                        .take()
                        .or_else(|| self.query_log_spare.take())
                        .unwrap_or_else(|| Vec::with_capacity(self.cfg.query_log_buffer_size));
                    incoming.clear();
                    let filled = std::mem::replace(&mut self.query_log_active, incoming);
                    msg.buf = Some(filled);
                    msg.ok = true;
                    if self.query_log_channel.send(msg).is_err() {
                        self.log_app(
                            format!("shard {}: query log reply channel full", self.id),
                            true,
                        );
                    }
                    work += 1;
                }
                _ => {
                    self.log_app(
                        format!(
                            "shard {}: unexpected op {:?} on query log channel",
                            self.id, msg.op
                        ),
                        true,
                    );
                }
            }
        }

        work
    }

    ////////////////////////////////////////////////////////////////////
    // STAGE 2-3: READINESS                                           //
    ////////////////////////////////////////////////////////////////////

    /// Drains both readiness sets, moving ready connections into the
    /// read/write/accept queues. A readiness edge only requeues a
    /// connection that declared itself waiting; everything else is
    /// already queued or mid-pipeline.
    fn stage_epoll(&mut self) -> usize {
        let mut event_count = 0;

        let count = self
            .udp_events
            .poll()
            .expect("epoll_wait failed on the UDP readiness set");
        event_count += count;
        for i in 0..count {
            let readiness = self.udp_events.event(i);
            let token = readiness.token as usize;
            let Some(conn) = self.conns.get(token) else { continue };
            if !conn.is_udp_listener() {
                self.log_app(
                    format!("shard {}: non-UDP event on the UDP readiness set", self.id),
                    true,
                );
                continue;
            }
            if readiness.readable && self.conns[token].waiting_for_read {
                self.conns[token].waiting_for_read = false;
                self.udp_read_queue.enqueue_read(&mut self.conns, token);
            }
            if readiness.writable && self.conns[token].waiting_for_write {
                self.conns[token].waiting_for_write = false;
                self.udp_write_queue.enqueue_write(&mut self.conns, token);
            }
        }

        let count = self
            .tcp_events
            .poll()
            .expect("epoll_wait failed on the TCP readiness set");
        event_count += count;
        for i in 0..count {
            let readiness = self.tcp_events.event(i);
            let token = readiness.token as usize;
            let Some(conn) = self.conns.get(token) else { continue };
            if conn.is_tcp_listener() {
                self.conns[token].waiting_for_read = false;
                self.tcp_accept_queue.enqueue_read(&mut self.conns, token);
            } else if conn.is_tcp_conn() {
                if readiness.readable && self.conns[token].waiting_for_read {
                    self.conns[token].waiting_for_read = false;
                    self.tcp_read_queue.enqueue_read(&mut self.conns, token);
                }
                if readiness.writable && self.conns[token].waiting_for_write {
                    self.conns[token].waiting_for_write = false;
                    self.tcp_write_queue.enqueue_write(&mut self.conns, token);
                }
            } else {
                self.log_app(
                    format!("shard {}: UDP event on the TCP readiness set", self.id),
                    true,
                );
            }
        }

        event_count
    }

    ////////////////////////////////////////////////////////////////////
    // STAGE 4: UDP READ                                              //
    ////////////////////////////////////////////////////////////////////

    fn stage_udp_read(&mut self) -> usize {
        enum Outcome {
            Received(usize),
            WouldBlock,
            Failed(std::io::Error),
        }

        let mut received = 0;
        let mut requeue = Vec::new();
        while let Some(token) = self.udp_read_queue.dequeue_read(&mut self.conns) {
            let outcome = {
                let conn = &mut self.conns[token];
                let fd = conn.fd;
                let udp = conn.udp();
                udp.reset_vectors();
                match udp.recv(fd) {
                    Ok(n) => Outcome::Received(n),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Outcome::WouldBlock,
                    Err(e) => Outcome::Failed(e),
                }
            };
            match outcome {
                Outcome::Received(n) => {
                    received += n;
                    self.parse_queue.enqueue(token);
                }
                Outcome::WouldBlock => self.conns[token].waiting_for_read = true,
                Outcome::Failed(e) => {
                    // EHOSTUNREACH and friends surface here; log and
                    // keep the listener in the read queue.
                    self.log_app(format!("shard {}: UDP read error: {}", self.id, e), false);
                    requeue.push(token);
                }
            }
        }
        for token in requeue {
            self.udp_read_queue.enqueue_read(&mut self.conns, token);
        }
        received
    }

    ////////////////////////////////////////////////////////////////////
    // STAGE 5: TCP ACCEPT                                            //
    ////////////////////////////////////////////////////////////////////

    fn stage_tcp_accept(&mut self) -> usize {
        let mut accepted = 0;
        let mut requeue = Vec::new();

        while let Some(listener_token) = self.tcp_accept_queue.dequeue_read(&mut self.conns) {
            let listener_fd = self.conns[listener_token].fd;

            // Never exceed the per-iteration accept cap (shared by all
            // listeners) nor the per-shard connection cap.
            let room = self
                .cfg
                .tcp_conns_per_vl_max
                .saturating_sub(self.conns_tcp_active);
            let cap = usize::min(
                self.cfg
                    .tcp_listener_max_accept_new_conn
                    .saturating_sub(accepted),
                room,
            );

            let mut exhausted = false;
            let mut taken = 0;
            while taken < cap {
                match accept4(
                    listener_fd,
                    SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
                ) {
                    Ok(fd) => {
                        taken += 1;
                        accepted += 1;
                        self.admit_tcp_conn(fd);
                    }
                    Err(Errno::EAGAIN) => {
                        exhausted = true;
                        break;
                    }
                    Err(e) => {
                        self.log_app(
                            format!("shard {}: TCP listener error: {}", self.id, e),
                            true,
                        );
                        exhausted = true;
                        break;
                    }
                }
            }

            if exhausted {
                // Re-armed by the next readiness edge.
                self.conns[listener_token].waiting_for_read = true;
            } else {
                // More connections pending (or the caps cut us off);
                // continue next iteration.
                requeue.push(listener_token);
            }
        }

        for token in requeue {
            self.tcp_accept_queue.enqueue_read(&mut self.conns, token);
        }
        accepted
    }

    /// Sets up one freshly accepted TCP socket: addresses, connection
    /// object, id, LRU membership, and readiness registration.
    fn admit_tcp_conn(&mut self, fd: RawFd) {
        let client_addr = match getpeername::<SockaddrStorage>(fd)
            .ok()
            .and_then(|ss| sockaddr_to_std(&ss))
        {
            Some(addr) => addr,
            None => {
                let _ = nix::unistd::close(fd);
                self.metrics.tcp.unknown_client_ip_soc_family.inc();
                self.log_app(
                    format!("shard {}: unsupported client socket family", self.id),
                    false,
                );
                return;
            }
        };
        let local_addr = match getsockname::<SockaddrStorage>(fd) {
            Ok(ss) => match sockaddr_to_std(&ss) {
                Some(addr) => addr,
                None => {
                    let _ = nix::unistd::close(fd);
                    self.metrics.tcp.unknown_local_ip_soc_family.inc();
                    self.log_app(
                        format!("shard {}: unsupported local socket family", self.id),
                        false,
                    );
                    return;
                }
            },
            Err(e) => {
                let _ = nix::unistd::close(fd);
                self.metrics.tcp.getsockname_err.inc();
                self.log_app(format!("shard {}: getsockname failed: {}", self.id, e), false);
                return;
            }
        };
        self.metrics.tcp.connections.inc();

        let tcp = TcpConn::new(&self.cfg, client_addr, local_addr, self.loop_mono);
        let ipv6 = client_addr.is_ipv6();
        let token = self
            .conns
            .insert(Conn::new(fd, ipv6, ConnKind::TcpConn(Box::new(tcp))));

        match tcp_id_assign(&self.lru, &mut self.conn_tcp_id_base) {
            Some(cid) => {
                self.conns[token].cid = cid;
                self.conns[token].in_lru = true;
                self.lru.insert(cid, token);
                self.conns[token].waiting_for_read = true;
                self.conns_tcp_active += 1;
                if let Err(e) = self.tcp_events.register_readwrite_et(fd, token as u64) {
                    self.log_app(
                        format!("shard {}: failed to register TCP connection: {}", self.id, e),
                        true,
                    );
                    self.release_queue.enqueue_release(&mut self.conns, token);
                }
            }
            None => {
                // Requires every 64-bit id to be in use; close and
                // release immediately.
                let _ = nix::unistd::close(fd);
                self.conns[token].fd = -1;
                self.conns[token].tcp_mut().state = TcpState::AssignConnIdErr;
                self.conns_tcp_active += 1;
                self.release_queue.enqueue_release(&mut self.conns, token);
            }
        }
    }

    ////////////////////////////////////////////////////////////////////
    // STAGE 6: TCP READ                                              //
    ////////////////////////////////////////////////////////////////////

    fn stage_tcp_read(&mut self) -> usize {
        enum Outcome {
            Release,
            WouldBlock,
            Parse,
            Partial,
        }

        let mut read_count = 0;
        let mut requeue = Vec::new();
        while let Some(token) = self.tcp_read_queue.dequeue_read(&mut self.conns) {
            read_count += 1;

            // A readable connection is live: promote it.
            let cid = self.conns[token].cid;
            assert_eq!(
                self.lru.get(cid),
                Some(token),
                "TCP connection missing from the LRU set"
            );

            let loop_mono = self.loop_mono;
            let loop_wall = self.loop_wall;
            let keepalive = self.cfg.tcp_keepalive();
            let recv_timeout = self.cfg.tcp_query_recv_timeout();

            let outcome = {
                let conn = &mut self.conns[token];
                let fd = conn.fd;
                let tcp = conn.tcp_mut();
                let buffered = tcp.read_buffer_len;
                match nix::unistd::read(fd, &mut tcp.read_buffer[buffered..]) {
                    Ok(0) => {
                        // Half close by the peer. No writes are
                        // pending (reads only happen with no queries
                        // in flight), so release directly.
                        tcp.state = TcpState::ClosedForRead;
                        Outcome::Release
                    }
                    Ok(n) => {
                        tcp.read_buffer_len += n;
                        match tcp.segment_frames(loop_wall) {
                            Segmentation::Frames(_) => Outcome::Parse,
                            Segmentation::Partial => {
                                tcp.state = TcpState::WaitForQueryData;
                                tcp.timeout = loop_mono + recv_timeout;
                                Outcome::Partial
                            }
                            Segmentation::FrameTooLarge => {
                                tcp.state = TcpState::QuerySizeTooLarge;
                                Outcome::Release
                            }
                        }
                    }
                    Err(Errno::EAGAIN) => {
                        if tcp.read_buffer_len == 0 {
                            // Nothing buffered: the connection is idle
                            // and the keepalive clock takes over.
                            tcp.state = TcpState::WaitForQuery;
                            tcp.timeout = loop_mono + keepalive;
                            Outcome::WouldBlock
                        } else {
                            // Bytes carried over from a round that hit
                            // the per-read query cap may already hold
                            // complete frames; no new data is needed to
                            // serve them.
                            match tcp.segment_frames(loop_wall) {
                                Segmentation::Frames(_) => Outcome::Parse,
                                Segmentation::Partial => Outcome::WouldBlock,
                                Segmentation::FrameTooLarge => {
                                    tcp.state = TcpState::QuerySizeTooLarge;
                                    Outcome::Release
                                }
                            }
                        }
                    }
                    Err(_) => {
                        tcp.state = TcpState::ReadErr;
                        Outcome::Release
                    }
                }
            };

            match outcome {
                Outcome::Release => self.release_queue.enqueue_release(&mut self.conns, token),
                Outcome::Parse => self.parse_queue.enqueue(token),
                Outcome::Partial => {
                    self.conns[token].waiting_for_read = true;
                    requeue.push(token);
                }
                Outcome::WouldBlock => self.conns[token].waiting_for_read = true,
            }
        }
        for token in requeue {
            self.tcp_read_queue.enqueue_read(&mut self.conns, token);
        }
        read_count
    }

    ////////////////////////////////////////////////////////////////////
    // STAGE 7: PARSE                                                 //
    ////////////////////////////////////////////////////////////////////

    fn stage_query_parse(&mut self) {
        let loop_wall = self.loop_wall;
        while let Some(token) = self.parse_queue.dequeue() {
            let conn = &mut self.conns[token];
            match &mut conn.kind {
                ConnKind::UdpListener(udp) => {
                    for i in 0..udp.read_vector_count {
                        let client = udp.client_addr(i);
                        let local = udp.local_addr(i);
                        let datagram_len = udp.datagram_len(i);
                        // Reuse the peer-address and ancillary storage
                        // for the reply.
                        udp.mirror_write_slot(i);

                        let query = &mut udp.queries[i];
                        query.client_addr = client;
                        query.local_addr = local;
                        query.recv_time = loop_wall;
                        if datagram_len > PACKETSZ {
                            query.end_code = EndCode::TooLarge;
                            continue;
                        }
                        query.request_len = datagram_len;
                        parse::parse(query);
                    }
                }
                ConnKind::TcpConn(tcp) => {
                    for i in 0..tcp.queries_count {
                        parse::parse(&mut tcp.queries[i]);
                    }
                }
                ConnKind::TcpListener => unreachable!("TCP listener in the parse queue"),
            }
            self.resolve_queue.enqueue(token);
        }
    }

    ////////////////////////////////////////////////////////////////////
    // STAGE 8: RESOLVE                                               //
    ////////////////////////////////////////////////////////////////////

    fn stage_query_resolve(&mut self) {
        let resolver = self.resolver.clone();
        while let Some(token) = self.resolve_queue.dequeue() {
            let conn = &mut self.conns[token];
            match &mut conn.kind {
                ConnKind::UdpListener(udp) => {
                    for i in 0..udp.read_vector_count {
                        let query = &mut udp.queries[i];
                        if query.end_code == EndCode::Unknown {
                            resolver.resolve(query);
                        }
                    }
                }
                ConnKind::TcpConn(tcp) => {
                    for i in 0..tcp.queries_count {
                        let query = &mut tcp.queries[i];
                        if query.end_code == EndCode::Unknown {
                            resolver.resolve(query);
                        }
                    }
                }
                ConnKind::TcpListener => unreachable!("TCP listener in the resolve queue"),
            }
            self.pack_queue.enqueue(token);
        }
    }

    ////////////////////////////////////////////////////////////////////
    // STAGE 9: PACK                                                  //
    ////////////////////////////////////////////////////////////////////

    fn stage_query_pack(&mut self) {
        let loop_mono = self.loop_mono;
        let send_timeout = self.cfg.tcp_query_send_timeout();
        while let Some(token) = self.pack_queue.dequeue() {
            let is_udp = self.conns[token].is_udp_listener();
            {
                let conn = &mut self.conns[token];
                match &mut conn.kind {
                    ConnKind::UdpListener(udp) => {
                        for i in 0..udp.read_vector_count {
                            let query = &mut udp.queries[i];
                            if query.end_code.responds() {
                                let _ = pack::pack_response(query);
                            }
                        }
                    }
                    ConnKind::TcpConn(tcp) => {
                        for i in 0..tcp.queries_count {
                            let query = &mut tcp.queries[i];
                            if !query.end_code.responds() {
                                continue;
                            }
                            // Grow the response buffer rather than
                            // truncate, up to the frame limit.
                            while pack::pack_response(query) == Err(pack::Error::Truncation) {
                                if !query.grow_response_buffer() {
                                    break;
                                }
                            }
                        }
                        tcp.state = TcpState::WaitForWrite;
                        tcp.timeout = loop_mono + send_timeout;
                        tcp.query_write_index = 0;
                        tcp.write_index = 0;
                    }
                    ConnKind::TcpListener => unreachable!("TCP listener in the pack queue"),
                }
            }
            if is_udp {
                self.udp_write_queue.enqueue_write(&mut self.conns, token);
            } else {
                self.tcp_write_queue.enqueue_write(&mut self.conns, token);
            }
        }
    }

    ////////////////////////////////////////////////////////////////////
    // STAGE 10: UDP WRITE                                            //
    ////////////////////////////////////////////////////////////////////

    fn stage_udp_write(&mut self) -> usize {
        enum Outcome {
            AllSent,
            Partial,
            WouldBlock,
            Failed(std::io::Error),
        }

        let mut sent_total = 0;
        let mut requeue = Vec::new();
        while let Some(token) = self.udp_write_queue.dequeue_write(&mut self.conns) {
            let outcome = {
                let conn = &mut self.conns[token];
                let fd = conn.fd;
                let udp = conn.udp();
                if udp.write_vector_count == 0 && udp.write_vector_write_index == 0 {
                    udp.populate_write_vector();
                }
                if udp.write_vector_write_index == udp.write_vector_count {
                    // Every query was dropped without a response.
                    Outcome::AllSent
                } else {
                    match udp.send(fd) {
                        Ok(sent) => {
                            let now = SystemTime::now();
                            let start = udp.write_vector_write_index;
                            for slot in start..start + sent {
                                let qi = udp.query_for_write_slot(slot);
                                udp.queries[qi].send_time = Some(now);
                            }
                            udp.write_vector_write_index += sent;
                            sent_total += sent;
                            if udp.write_vector_write_index == udp.write_vector_count {
                                Outcome::AllSent
                            } else {
                                Outcome::Partial
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Outcome::WouldBlock,
                        Err(e) => Outcome::Failed(e),
                    }
                }
            };
            match outcome {
                Outcome::AllSent => self.log_queue.enqueue(token),
                Outcome::Partial => requeue.push(token),
                Outcome::WouldBlock => self.conns[token].waiting_for_write = true,
                Outcome::Failed(e) => {
                    self.log_app(format!("shard {}: UDP write error: {}", self.id, e), false);
                    requeue.push(token);
                }
            }
        }
        for token in requeue {
            self.udp_write_queue.enqueue_write(&mut self.conns, token);
        }
        sent_total
    }

    ////////////////////////////////////////////////////////////////////
    // STAGE 11: TCP WRITE                                            //
    ////////////////////////////////////////////////////////////////////

    fn stage_tcp_write(&mut self) -> usize {
        enum Outcome {
            Done,
            Partial,
            WouldBlock,
        }

        let mut write_count = 0;
        let mut requeue = Vec::new();
        while let Some(token) = self.tcp_write_queue.dequeue_write(&mut self.conns) {
            let outcome = {
                let conn = &mut self.conns[token];
                let fd = conn.fd;
                let tcp = conn.tcp_mut();
                let mut outcome = Outcome::Done;
                let mut i = tcp.query_write_index;
                while i < tcp.queries_count {
                    if !tcp.queries[i].end_code.responds() {
                        i += 1;
                        continue;
                    }
                    write_count += 1;
                    let response_len = tcp.queries[i].response_len;
                    let remaining = response_len - tcp.write_index;
                    let window = &tcp.queries[i].response_buffer[tcp.write_index..response_len];
                    match nix::unistd::write(fd, window) {
                        Ok(n) if n == remaining => {
                            tcp.queries[i].send_time = Some(SystemTime::now());
                            tcp.write_index = 0;
                            i += 1;
                        }
                        Ok(0) => {
                            // The peer closed before the response was
                            // delivered.
                            tcp.queries[i].end_code = EndCode::TcpWriteClose;
                            tcp.state = TcpState::ClosedForWrite;
                            break;
                        }
                        Ok(n) => {
                            // Short write; resume here next round.
                            tcp.write_index += n;
                            tcp.query_write_index = i;
                            outcome = Outcome::Partial;
                            break;
                        }
                        Err(Errno::EAGAIN) => {
                            tcp.query_write_index = i;
                            outcome = Outcome::WouldBlock;
                            break;
                        }
                        Err(_) => {
                            tcp.queries[i].end_code = EndCode::TcpWriteErr;
                            tcp.state = TcpState::WriteErr;
                            break;
                        }
                    }
                }
                outcome
            };
            match outcome {
                // Done covers both full success and terminal write
                // states; the log stage routes terminal connections to
                // release.
                Outcome::Done => self.log_queue.enqueue(token),
                Outcome::Partial => requeue.push(token),
                Outcome::WouldBlock => self.conns[token].waiting_for_write = true,
            }
        }
        for token in requeue {
            self.tcp_write_queue.enqueue_write(&mut self.conns, token);
        }
        write_count
    }

    ////////////////////////////////////////////////////////////////////
    // STAGE 12: QUERY LOG                                            //
    ////////////////////////////////////////////////////////////////////

    fn stage_query_log(&mut self) {
        let loop_mono = self.loop_mono;
        let keepalive = self.cfg.tcp_keepalive();
        let recv_timeout = self.cfg.tcp_query_recv_timeout();
        let capacity = self.cfg.query_log_buffer_size;

        while let Some(token) = self.log_queue.dequeue() {
            let is_udp = self.conns[token].is_udp_listener();
            if is_udp {
                {
                    let Self {
                        conns,
                        query_log_active,
                        metrics,
                        ..
                    } = self;
                    let udp = conns[token].udp();
                    for i in 0..udp.read_vector_count {
                        let query = &mut udp.queries[i];
                        if !query_log::render(query_log_active, capacity, query) {
                            metrics.app.query_log_buf_no_space.inc();
                        }
                        metrics::report_query(query, metrics);
                        // Drop the record references now; no resource
                        // artifact may be pinned past this iteration.
                        query.clear_sections();
                    }
                }
                self.udp_read_queue.enqueue_read(&mut self.conns, token);
                continue;
            }

            let terminal = {
                let Self {
                    conns,
                    query_log_active,
                    metrics,
                    ..
                } = self;
                let tcp = conns[token].tcp_mut();
                for i in 0..tcp.queries_count {
                    let query = &mut tcp.queries[i];
                    if !query_log::render(query_log_active, capacity, query) {
                        metrics.app.query_log_buf_no_space.inc();
                    }
                    metrics::report_query(query, metrics);
                    query.clear_sections();
                }
                tcp.state.is_terminal()
            };
            if terminal {
                self.release_queue.enqueue_release(&mut self.conns, token);
                continue;
            }

            // All responses are out. Move any leftover bytes (the
            // start of the next query) to the front of the read
            // buffer and pick the matching state and timeout.
            {
                let tcp = self.conns[token].tcp_mut();
                let consumed = tcp.consumed_bytes();
                let extra = tcp.read_buffer_len - consumed;
                if extra > 0 {
                    tcp.read_buffer.copy_within(consumed..consumed + extra, 0);
                    tcp.state = TcpState::WaitForQueryData;
                    tcp.timeout = loop_mono + recv_timeout;
                } else {
                    tcp.state = TcpState::WaitForQuery;
                    tcp.timeout = loop_mono + keepalive;
                }
                tcp.read_buffer_len = extra;
            }
            self.tcp_read_queue.enqueue_read(&mut self.conns, token);
        }
    }

    ////////////////////////////////////////////////////////////////////
    // STAGE 13: TCP TIMEOUTS                                         //
    ////////////////////////////////////////////////////////////////////

    /// Walks the LRU set from the least-recent end; every expired
    /// connection goes to release, and the walk stops at the first
    /// live one (everything behind it is necessarily newer).
    fn stage_tcp_timeouts(&mut self) {
        let now = self.loop_mono;
        let mut expired = Vec::new();
        for (_, token) in self.lru.iter_lru() {
            if self.conns[token].tcp().timeout < now {
                expired.push(token);
            } else {
                break;
            }
        }
        for token in expired {
            self.release_queue.enqueue_release(&mut self.conns, token);
        }
    }

    ////////////////////////////////////////////////////////////////////
    // STAGE 14: TCP RELEASE                                          //
    ////////////////////////////////////////////////////////////////////

    fn stage_tcp_release(&mut self) {
        while let Some(token) = self.release_queue.dequeue_release(&mut self.conns) {
            if self.conns[token].in_lru {
                let cid = self.conns[token].cid;
                self.lru.remove(cid);
                self.conns[token].in_lru = false;
            }

            let fd = self.conns[token].fd;
            if fd >= 0 {
                let _ = self.tcp_events.deregister(fd);
                let _ = nix::unistd::close(fd);
                self.conns[token].fd = -1;
            }

            // The connection may still sit in a read or write queue if
            // it was released by timeout.
            self.tcp_read_queue.remove_read(&mut self.conns, token);
            self.tcp_write_queue.remove_write(&mut self.conns, token);

            self.conns[token].tcp().report_release_metrics(&self.metrics);

            self.conns.remove(token);
            self.conns_tcp_active -= 1;
        }
    }

    ////////////////////////////////////////////////////////////////////
    // HELPERS                                                        //
    ////////////////////////////////////////////////////////////////////

    fn log_app(&self, text: String, fatal: bool) {
        if self.app_log.send(LogMsg::new(text, fatal)).is_err() {
            self.metrics.app.app_log_write_error.inc();
        }
    }
}

fn sockaddr_to_std(ss: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = ss.as_sockaddr_in() {
        Some(SocketAddr::V4(SocketAddrV4::from(*sin)))
    } else {
        ss.as_sockaddr_in6()
            .map(|sin6| SocketAddr::V6(SocketAddrV6::from(*sin6)))
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpStream, UdpSocket};

    use super::*;
    use crate::channel::{control_channel, log_channel, ControlMsg};
    use crate::resolver::StaticResolver;

    const WWW_EXAMPLE_COM: &[u8] =
        b"\x1f\xf9\x01\x20\x00\x01\x00\x00\x00\x00\x00\x00\
          \x03www\x07example\x03com\x00\x00\x01\x00\x01";

    struct Harness {
        vl: Vectorloop,
        resource_end: crate::channel::ControlEndpoint,
        query_log_end: crate::channel::ControlEndpoint,
        _log_rx: crate::channel::LogReceiver,
        metrics: Arc<Metrics>,
    }

    fn harness(cfg: Config) -> Harness {
        let cfg = Arc::new(cfg);
        let metrics = Arc::new(Metrics::new());
        let (resource_end, resource_shard) = control_channel();
        let (query_log_end, query_log_shard) = control_channel();
        let (log_tx, log_rx) = log_channel();
        let mut vl = Vectorloop::new(
            0,
            cfg,
            metrics.clone(),
            Arc::new(StaticResolver::new()),
            resource_shard,
            query_log_shard,
            log_tx,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        vl.register_listeners();
        Harness {
            vl,
            resource_end,
            query_log_end,
            _log_rx: log_rx,
            metrics,
        }
    }

    fn pump(vl: &mut Vectorloop, iterations: usize) {
        for _ in 0..iterations {
            vl.iterate();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn serves_a_udp_query_end_to_end() {
        let mut cfg = Config::default();
        cfg.udp_listener_port = 36953;
        cfg.tcp_enable = false;
        let mut h = harness(cfg);

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.connect("127.0.0.1:36953").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        client.send(WWW_EXAMPLE_COM).unwrap();

        let mut buf = [0u8; 4096];
        let mut response = None;
        for _ in 0..200 {
            h.vl.iterate();
            match client.recv(&mut buf) {
                Ok(n) => {
                    response = Some(buf[..n].to_vec());
                    break;
                }
                Err(_) => continue,
            }
        }
        let response = response.expect("no response received");
        assert_eq!(&response[..2], &WWW_EXAMPLE_COM[..2]);
        assert_eq!(response.len(), 118);
        assert_eq!(crate::message::header::ancount(&response), 1);
        assert_eq!(crate::message::header::nscount(&response), 1);
        assert_eq!(crate::message::header::arcount(&response), 2);

        // The query was counted and logged to the active buffer.
        pump(&mut h.vl, 2);
        assert_eq!(h.metrics.udp.queries.get(), 1);
        assert_eq!(h.metrics.dns.queries_rcode_noerror.get(), 1);

        // Flip the query log: the reply surrenders the filled buffer.
        let msg = ControlMsg::new(1, ControlOp::QueryLogFlip);
        h.query_log_end.send(msg).unwrap();
        pump(&mut h.vl, 2);
        let reply = h.query_log_end.try_recv().expect("no flip reply");
        assert!(reply.ok);
        let filled = reply.buf.unwrap();
        let text = String::from_utf8_lossy(&filled);
        assert!(text.contains("\"q_name\":\"www.example.com.\""));

        // Publish a resource and collect the acknowledgment.
        let mut msg = ControlMsg::new(2, ControlOp::SetResource);
        msg.resource = Some(Arc::new(Resource {
            name: "test".to_owned(),
            data: vec![1, 2, 3].into_boxed_slice(),
        }));
        h.resource_end.send(msg).unwrap();
        pump(&mut h.vl, 2);
        let ack = h.resource_end.try_recv().expect("no resource ack");
        assert!(ack.ok);
        assert!(ack.resource.is_none());
        assert!(h.vl.resource.is_some());
    }

    #[test]
    fn serves_pipelined_tcp_queries_in_order() {
        let mut cfg = Config::default();
        cfg.tcp_listener_port = 36955;
        cfg.udp_enable = false;
        let mut h = harness(cfg);

        let mut frame = Vec::new();
        frame.extend_from_slice(&(WWW_EXAMPLE_COM.len() as u16).to_be_bytes());
        frame.extend_from_slice(WWW_EXAMPLE_COM);

        let mut client = TcpStream::connect("127.0.0.1:36955").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        // Two pipelined queries in a single write.
        let mut both = frame.clone();
        both.extend_from_slice(&frame);
        client.write_all(&both).unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        for _ in 0..200 {
            h.vl.iterate();
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(_) => {}
            }
            // Two full responses: each is a length prefix plus the
            // 118-octet reference answer.
            if received.len() >= 2 * 120 {
                break;
            }
        }
        assert_eq!(received.len(), 240);
        for chunk in received.chunks(120) {
            assert_eq!(u16::from_be_bytes([chunk[0], chunk[1]]), 118);
            assert_eq!(&chunk[2..4], &WWW_EXAMPLE_COM[..2]);
        }
        assert_eq!(h.metrics.tcp.connections.get(), 1);
        pump(&mut h.vl, 2);
        assert_eq!(h.metrics.tcp.queries.get(), 2);
    }

    #[test]
    fn serves_frames_beyond_the_per_read_cap_from_buffered_bytes() {
        let mut cfg = Config::default();
        cfg.tcp_listener_port = 36954;
        cfg.udp_enable = false;
        cfg.tcp_conn_simultaneous_queries_count = 2;
        let mut h = harness(cfg);

        let mut frame = Vec::new();
        frame.extend_from_slice(&(WWW_EXAMPLE_COM.len() as u16).to_be_bytes());
        frame.extend_from_slice(WWW_EXAMPLE_COM);

        let mut client = TcpStream::connect("127.0.0.1:36954").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        // Three pipelined queries in one write: one more than a single
        // read round may process. The third is answered from the
        // buffered leftover without any further bytes from the client.
        let burst: Vec<u8> = frame.iter().copied().cycle().take(3 * frame.len()).collect();
        client.write_all(&burst).unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        for _ in 0..300 {
            h.vl.iterate();
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(_) => {}
            }
            if received.len() >= 3 * 120 {
                break;
            }
        }
        assert_eq!(received.len(), 360);
        for chunk in received.chunks(120) {
            assert_eq!(u16::from_be_bytes([chunk[0], chunk[1]]), 118);
            assert_eq!(&chunk[2..4], &WWW_EXAMPLE_COM[..2]);
        }
        pump(&mut h.vl, 2);
        assert_eq!(h.metrics.tcp.queries.get(), 3);
        assert_eq!(h.vl.conns_tcp_active, 1);
    }

    #[test]
    fn releases_a_tcp_connection_that_never_completes_its_query() {
        let mut cfg = Config::default();
        cfg.tcp_listener_port = 36956;
        cfg.udp_enable = false;
        cfg.tcp_query_recv_timeout = 50;
        let mut h = harness(cfg);

        let mut client = TcpStream::connect("127.0.0.1:36956").unwrap();
        // A partial frame: claims 30 octets, delivers 10.
        let mut partial = Vec::new();
        partial.extend_from_slice(&30u16.to_be_bytes());
        partial.extend_from_slice(&[0u8; 10]);
        client.write_all(&partial).unwrap();

        // Give the receive timeout time to fire.
        for _ in 0..150 {
            h.vl.iterate();
            std::thread::sleep(Duration::from_millis(1));
            if h.metrics.tcp.query_recv_timeout.get() > 0 {
                break;
            }
        }
        assert_eq!(h.metrics.tcp.query_recv_timeout.get(), 1);
        assert_eq!(h.vl.conns_tcp_active, 0);

        // The server closed the socket.
        client
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(client.read(&mut buf), Ok(0)));
    }

    #[test]
    fn rejects_a_tcp_frame_longer_than_a_maximum_query() {
        let mut cfg = Config::default();
        cfg.tcp_listener_port = 36957;
        cfg.udp_enable = false;
        let mut h = harness(cfg);

        let mut client = TcpStream::connect("127.0.0.1:36957").unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&513u16.to_be_bytes());
        frame.extend_from_slice(&[0u8; 32]);
        client.write_all(&frame).unwrap();

        for _ in 0..100 {
            h.vl.iterate();
            std::thread::sleep(Duration::from_millis(1));
            if h.metrics.tcp.query_len_toolarge.get() > 0 {
                break;
            }
        }
        assert_eq!(h.metrics.tcp.query_len_toolarge.get(), 1);
        assert_eq!(h.vl.conns_tcp_active, 0);
    }

    #[test]
    fn drops_oversized_udp_datagrams_without_a_response() {
        let mut cfg = Config::default();
        cfg.udp_listener_port = 36958;
        cfg.tcp_enable = false;
        let mut h = harness(cfg);

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.connect("127.0.0.1:36958").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        // A 513-octet datagram whose header would otherwise be valid.
        let mut big = WWW_EXAMPLE_COM.to_vec();
        big.resize(513, 0);
        client.send(&big).unwrap();

        let mut buf = [0u8; 4096];
        for _ in 0..50 {
            h.vl.iterate();
            if client.recv(&mut buf).is_ok() {
                panic!("oversized datagram must not be answered");
            }
            if h.metrics.dns.queries_rcode_toolarge.get() > 0 {
                break;
            }
        }
        assert_eq!(h.metrics.dns.queries_rcode_toolarge.get(), 1);
    }
}
