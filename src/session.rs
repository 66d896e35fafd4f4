// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The session registry (C6): binds an application session to a network
//! interface and owns its queues and sockets (spec.md §4.6). This is also
//! where the three work-cycle functions (`get_interval`, `process_receive`,
//! `process_send`) come together, since they all operate on one session's
//! state.

use crate::clock::Clock;
use crate::codec::header::Tail;
use crate::codec::{decode_pd, encode_pd, Header};
use crate::config::{MdConfig, PdConfig, ProcessConfig};
use crate::constant::{MsgType, MD_PORT, PD_UDP_PORT};
use crate::dataset::{self, DatasetValue, Registry as DatasetRegistry};
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::log::{Category, Location, LogSink};
use crate::md::{self, framing::Accumulator};
use crate::multiplex::{self, FdSet};
use crate::pd;
use crate::stats::{Counters, PdStatistics, Statistics};
use crate::uri::{Destination, UriResolver};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A session's topo-count epoch, stamped onto every publication and
/// subscription it owns (spec.md §4.2 matching rule 1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopoCounts {
    pub etb: u32,
    pub op_trn: u32,
}

struct TcpPeer {
    stream: TcpStream,
    accumulator: Accumulator,
}

/// The top-level handle: owns interface IP, send/receive queues, the MD
/// session list, a socket pool, statistics, and the default configs
/// (spec.md §3 "Application session").
pub struct Session {
    pub own_ip: Ipv4Addr,
    pub leader_ip: Option<Ipv4Addr>,
    pub topo: TopoCounts,
    pub pd_config: PdConfig,
    pub md_config: MdConfig,
    pub process_config: ProcessConfig,
    pub publications: pd::PublicationTable,
    pub subscriptions: pd::SubscriptionTable,
    pub md_sessions: md::SessionTable,
    pub md_listeners: md::ListenerTable,
    pub datasets: DatasetRegistry,
    pub stats: Counters,
    clock: Arc<dyn Clock>,
    log_sink: Arc<dyn LogSink>,
    pd_socket: UdpSocket,
    md_socket: UdpSocket,
    md_listener: Option<TcpListener>,
    tcp_peers: HashMap<RawFd, TcpPeer>,
    com_id_index: HashMap<u32, crate::handle::Handle<pd::publication::Publication>>,
    closed: bool,
}

impl Session {
    /// `open_session`: binds the PD UDP socket and, when `accept_md_tcp`
    /// is set, a listening MD TCP socket. All sockets are non-blocking —
    /// the work functions never block (spec.md §4.5).
    pub fn open(
        own_ip: Ipv4Addr,
        leader_ip: Option<Ipv4Addr>,
        pd_config: PdConfig,
        md_config: MdConfig,
        process_config: ProcessConfig,
        clock: Arc<dyn Clock>,
        log_sink: Arc<dyn LogSink>,
        accept_md_tcp: bool,
    ) -> Result<Session> {
        let pd_socket = UdpSocket::bind(SocketAddrV4::new(own_ip, PD_UDP_PORT))?;
        pd_socket.set_nonblocking(true)?;
        pd_socket.set_ttl(pd_config.default_ttl as u32)?;
        pd_socket.set_multicast_ttl_v4(pd_config.default_ttl as u32)?;
        let md_socket = UdpSocket::bind(SocketAddrV4::new(own_ip, MD_PORT))?;
        md_socket.set_nonblocking(true)?;
        md_socket.set_ttl(md_config.default_ttl as u32)?;
        let md_listener = if accept_md_tcp {
            let listener = TcpListener::bind(SocketAddrV4::new(own_ip, MD_PORT))?;
            listener.set_nonblocking(true)?;
            Some(listener)
        } else {
            None
        };
        Ok(Session {
            own_ip,
            leader_ip,
            topo: TopoCounts::default(),
            pd_config,
            md_config,
            process_config,
            publications: pd::PublicationTable::new(),
            subscriptions: pd::SubscriptionTable::new(),
            md_sessions: md::SessionTable::new(),
            md_listeners: md::ListenerTable::new(),
            datasets: DatasetRegistry::new(),
            stats: Counters::new(),
            clock,
            log_sink,
            pd_socket,
            md_socket,
            md_listener,
            tcp_peers: HashMap::new(),
            com_id_index: HashMap::new(),
            closed: false,
        })
    }

    fn log(&self, category: Category, message: &str) {
        self.log_sink.log(category, Location { file: file!(), line: line!() }, message);
    }

    /// Rebuild the O(1) comId→publication index used by pull-request
    /// dispatch. Mandatory before the first work cycle if the caller wants
    /// indexed lookup instead of the default linear scan (spec.md §4.6).
    pub fn update_session(&mut self) {
        self.com_id_index.clear();
        for (handle, publication) in self.publications.iter() {
            self.com_id_index.insert(publication.identity.com_id, handle);
        }
    }

    /// `close_session`: idempotent. Drains queues, fires `SESSION_ABORT`
    /// for pending MD sessions, and drops the sockets.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.md_sessions.abort_all();
        self.tcp_peers.clear();
        self.closed = true;
    }

    fn watched_fds(&self) -> FdSet {
        let mut set = FdSet::new();
        set.insert(self.pd_socket.as_raw_fd());
        set.insert(self.md_socket.as_raw_fd());
        if let Some(listener) = &self.md_listener {
            set.insert(listener.as_raw_fd());
        }
        for peer in self.tcp_peers.values() {
            set.insert(peer.stream.as_raw_fd());
        }
        set
    }

    /// `get_interval`: the socket set to watch, and how long the caller's
    /// own `select` may block before the next scheduled event is due.
    pub fn get_interval(&self, default_timeout: Duration) -> (FdSet, Duration) {
        let now = self.clock.now();
        let next_due = self.publications.next_due();
        let remaining = next_due.map(|deadline| deadline.saturating_duration_since(now));
        (self.watched_fds(), multiplex::select_timeout(remaining, default_timeout))
    }

    /// `process_receive`: drain every readable socket in `readable`,
    /// dispatching PD datagrams to the subscription table and MD frames to
    /// the session table / listeners.
    pub fn process_receive(&mut self, readable: &FdSet) -> Result<()> {
        if readable.contains(self.pd_socket.as_raw_fd()) {
            self.drain_pd_socket();
        }
        if readable.contains(self.md_socket.as_raw_fd()) {
            self.drain_md_socket();
        }
        if let Some(listener) = &self.md_listener {
            if readable.contains(listener.as_raw_fd()) {
                self.accept_tcp_peers(listener);
            }
        }
        let tcp_fds: Vec<RawFd> = self.tcp_peers.keys().copied().collect();
        for fd in tcp_fds {
            if readable.contains(fd) {
                self.drain_tcp_peer(fd);
            }
        }
        Ok(())
    }

    fn drain_pd_socket(&mut self) {
        let mut buf = [0u8; 65536];
        loop {
            match self.pd_socket.recv_from(&mut buf) {
                Ok((len, addr)) => {
                    let source = match addr.ip() {
                        std::net::IpAddr::V4(v4) => v4,
                        std::net::IpAddr::V6(_) => continue,
                    };
                    self.handle_pd_frame(&buf[..len], source);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    Counters::bump(&self.stats.pd_num_rcv);
                    break;
                }
            }
        }
    }

    fn handle_pd_frame(&mut self, bytes: &[u8], source: Ipv4Addr) {
        Counters::bump(&self.stats.pd_num_rcv);
        let (header, payload) = match decode_pd(bytes) {
            Ok(decoded) => decoded,
            Err(Error::Crc) => {
                Counters::bump(&self.stats.pd_num_crc_err);
                return;
            }
            Err(_) => {
                Counters::bump(&self.stats.pd_num_prot_err);
                return;
            }
        };
        if header.etb_topo_cnt != self.topo.etb || header.op_trn_topo_cnt != self.topo.op_trn {
            Counters::bump(&self.stats.pd_num_topo_err);
            return;
        }
        match header.msg_type {
            MsgType::Pd => {
                let Tail::Pd { reply_ip, .. } = header.tail else { return };
                let dest = if reply_ip.is_unspecified() { self.own_ip } else { reply_ip };
                match self.subscriptions.match_incoming(&header, source, dest) {
                    Some(handle) => {
                        let marshalled =
                            self.subscriptions.get(handle).map(|s| s.flags.marshalled).unwrap_or(false);
                        if marshalled && dataset::unmarshal(&self.datasets, header.com_id, payload).is_err() {
                            Counters::bump(&self.stats.pd_num_prot_err);
                            return;
                        }
                        let _ = self.subscriptions.deliver(
                            handle,
                            payload.to_vec(),
                            header.sequence_counter,
                            &*self.clock,
                        );
                    }
                    None => Counters::bump(&self.stats.pd_num_no_subs),
                }
            }
            MsgType::Pr => {
                if let Some(handle) = self.com_id_index.get(&header.com_id).copied() {
                    if let Ok(emission) = self.publications.emit_pull_response(handle) {
                        self.send_pd_emission(&emission, MsgType::Pp);
                    }
                } else {
                    Counters::bump(&self.stats.pd_num_no_pub);
                }
            }
            _ => {}
        }
    }

    fn drain_md_socket(&mut self) {
        let mut buf = [0u8; 65536];
        loop {
            match self.md_socket.recv_from(&mut buf) {
                Ok((len, addr)) => {
                    let source = match addr.ip() {
                        std::net::IpAddr::V4(v4) => v4,
                        std::net::IpAddr::V6(_) => continue,
                    };
                    self.handle_md_frame(&buf[..len], source);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn accept_tcp_peers(&mut self, listener: &TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    let _ = stream.set_nonblocking(true);
                    let fd = stream.as_raw_fd();
                    self.tcp_peers.insert(fd, TcpPeer { stream, accumulator: Accumulator::new() });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn drain_tcp_peer(&mut self, fd: RawFd) {
        let mut buf = [0u8; 65536];
        let frames = {
            let Some(peer) = self.tcp_peers.get_mut(&fd) else { return };
            loop {
                match std::io::Read::read(&mut peer.stream, &mut buf) {
                    Ok(0) => {
                        self.tcp_peers.remove(&fd);
                        return;
                    }
                    Ok(n) => peer.accumulator.feed(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => {
                        self.tcp_peers.remove(&fd);
                        return;
                    }
                }
            }
            match self.tcp_peers.get_mut(&fd) {
                Some(peer) => peer.accumulator.drain_frames().unwrap_or_default(),
                None => return,
            }
        };
        for frame in frames {
            // TCP peer address is tracked at the transport layer; MD
            // replies are correlated by session tag, not source IP, so a
            // placeholder loopback address is fine for frame dispatch.
            self.handle_md_frame(&frame, self.own_ip);
        }
    }

    fn handle_md_frame(&mut self, bytes: &[u8], source: Ipv4Addr) {
        let (header, payload) = match decode_pd(bytes) {
            Ok(decoded) => decoded,
            Err(Error::Crc) => {
                Counters::bump(&self.stats.md_num_crc_err);
                return;
            }
            Err(_) => {
                Counters::bump(&self.stats.md_num_prot_err);
                return;
            }
        };
        let Tail::Md { session_tag } = header.tail else { return };
        match header.msg_type {
            MsgType::Mn | MsgType::Mr => {
                let incoming = md::listener::Incoming {
                    com_id: header.com_id,
                    source,
                    session_tag,
                    payload: payload.to_vec(),
                };
                if self.md_listeners.dispatch(header.com_id, source, incoming).is_err() {
                    Counters::bump(&self.stats.md_num_no_subs);
                }
            }
            MsgType::Mp => {
                if let Some(uuid) = self.md_sessions.find_by_tag(session_tag) {
                    let _ = self.md_sessions.on_reply(uuid, payload.to_vec());
                } else {
                    Counters::bump(&self.stats.md_num_prot_err);
                }
            }
            MsgType::Mq => {
                if let Some(uuid) = self.md_sessions.find_by_tag(session_tag) {
                    let _ = self.md_sessions.on_reply_query(
                        uuid,
                        self.md_config.default_confirm_timeout,
                        self.clock.now(),
                    );
                } else {
                    Counters::bump(&self.stats.md_num_prot_err);
                }
            }
            MsgType::Mc => {
                if let Some(uuid) = self.md_sessions.find_by_tag(session_tag) {
                    let _ = self.md_sessions.on_confirm(uuid);
                } else {
                    Counters::bump(&self.stats.md_num_prot_err);
                }
            }
            MsgType::Me => {
                if let Some(uuid) = self.md_sessions.find_by_tag(session_tag) {
                    let _ = self.md_sessions.on_error(uuid);
                } else {
                    Counters::bump(&self.stats.md_num_prot_err);
                }
            }
            MsgType::Pd | MsgType::Pr | MsgType::Pp => {}
        }
    }

    fn send_pd_emission(&mut self, emission: &pd::publication::Emission, msg_type: MsgType) {
        let header = Header {
            msg_type,
            com_id: emission.identity.com_id,
            etb_topo_cnt: self.topo.etb,
            op_trn_topo_cnt: self.topo.op_trn,
            service_id: emission.identity.service_id,
            sequence_counter: emission.sequence_counter,
            payload_length: 0,
            tail: Tail::Pd { reply_com_id: 0, reply_ip: Ipv4Addr::UNSPECIFIED },
        };
        match encode_pd(header, &emission.payload) {
            Ok(frame) => {
                let addr = SocketAddrV4::new(emission.identity.dest, PD_UDP_PORT);
                if self.pd_socket.send_to(&frame, addr).is_ok() {
                    Counters::bump(&self.stats.pd_num_send);
                } else {
                    self.log(Category::Warning, "pd send failed");
                }
            }
            Err(_) => self.log(Category::Error, "pd encode failed"),
        }
    }

    /// `process_send`: fire due subscription and MD timeouts, then emit
    /// every due publication and MD retransmission.
    pub fn process_send(&mut self) {
        let now = self.clock.now();
        self.subscriptions.check_timeouts(&*self.clock);
        let emissions = self.publications.process_send(now);
        for emission in emissions {
            self.send_pd_emission(&emission, MsgType::Pd);
        }
        let retransmits = self.md_sessions.check_timeouts(now);
        for outbound in retransmits {
            self.send_md_outbound(&outbound);
        }
    }

    fn send_md_outbound(&mut self, outbound: &md::session::Outbound) {
        let header = Header {
            msg_type: outbound.msg_type,
            com_id: outbound.com_id,
            etb_topo_cnt: self.topo.etb,
            op_trn_topo_cnt: self.topo.op_trn,
            service_id: 0,
            sequence_counter: 0,
            payload_length: 0,
            tail: Tail::Md { session_tag: outbound.session_tag },
        };
        if let Ok(frame) = encode_pd(header, &outbound.payload) {
            let addr = SocketAddrV4::new(outbound.peer, MD_PORT);
            if self.md_socket.send_to(&frame, addr).is_ok() {
                Counters::bump(&self.stats.md_num_send);
            }
        }
    }

    /// Fill in the fields only the session itself knows — own/leader
    /// address, process priority/cycle — before overlaying the live
    /// counters (spec.md §6 "Statistics").
    pub fn statistics(&self, base: Statistics) -> Statistics {
        let enriched = Statistics {
            own_ip_addr: u32::from(self.own_ip),
            leader_ip_addr: self.leader_ip.map(u32::from).unwrap_or(0),
            process_prio: self.process_config.priority as u32,
            process_cycle: self.process_config.cycle_time.as_millis() as u32,
            pd: PdStatistics {
                def_qos: self.pd_config.default_qos as u32,
                def_ttl: self.pd_config.default_ttl as u32,
                def_timeout: self.pd_config.default_timeout.as_millis() as u32,
                ..base.pd
            },
            ..base
        };
        self.stats.snapshot(enriched)
    }

    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// `publish`: stage a new cyclic or pull-mode publication, applying the
    /// session's `PdConfig` qos/ttl defaults (spec.md §4.3, §6
    /// "Configuration").
    pub fn publish(
        &mut self,
        identity: pd::publication::Identity,
        interval: Duration,
        redundancy_group: Option<u32>,
        flags: pd::publication::PublicationFlags,
        initial_payload: Vec<u8>,
    ) -> Handle<pd::publication::Publication> {
        let handle = self.publications.publish(
            identity,
            interval,
            redundancy_group,
            flags,
            self.pd_config.default_qos,
            self.pd_config.default_ttl,
            initial_payload,
            &*self.clock,
        );
        Counters::bump(&self.stats.pd_num_pub);
        handle
    }

    /// `subscribe`: applying the session's `PdConfig` timeout/behaviour
    /// defaults unless the caller already baked different ones into
    /// `pd_config`.
    pub fn subscribe(
        &mut self,
        identity: pd::subscription::Identity,
        flags: pd::subscription::SubscriptionFlags,
        callback: pd::subscription::Callback,
    ) -> Handle<pd::subscription::Subscription> {
        let handle = self.subscriptions.subscribe(
            identity,
            flags,
            self.pd_config.default_timeout,
            self.pd_config.default_behaviour,
            callback,
            &*self.clock,
        );
        Counters::bump(&self.stats.pd_num_subs);
        handle
    }

    /// `republish`: the inauguration hook, resolving `new_dest`/`new_source`
    /// through `resolver` before delegating (spec.md §1's URI→IP hook,
    /// DESIGN.md Open Question 1).
    pub fn republish(
        &mut self,
        handle: Handle<pd::publication::Publication>,
        new_dest: Destination,
        new_source: Option<Destination>,
        resolver: &dyn UriResolver,
    ) -> Result<()> {
        let dest = new_dest
            .resolve_v4(resolver)
            .ok_or(Error::Param("republish destination did not resolve"))?;
        let source = match new_source {
            Some(d) => {
                Some(d.resolve_v4(resolver).ok_or(Error::Param("republish source did not resolve"))?)
            }
            None => None,
        };
        self.publications.republish(handle, dest, source)
    }

    /// `resubscribe`: swap a subscription's destination and/or source
    /// filter, resolving each through `resolver`. `None` leaves the
    /// corresponding field unchanged.
    pub fn resubscribe(
        &mut self,
        handle: Handle<pd::subscription::Subscription>,
        new_dest: Option<Destination>,
        new_src_ip1: Option<Destination>,
        new_src_ip2: Option<Destination>,
        resolver: &dyn UriResolver,
    ) -> Result<()> {
        let mut identity = self.subscriptions.get(handle).ok_or(Error::InvalidHandle)?.identity;
        if let Some(d) = new_dest {
            identity.dest =
                d.resolve_v4(resolver).ok_or(Error::Param("resubscribe destination did not resolve"))?;
        }
        if let Some(d) = new_src_ip1 {
            identity.src_ip1 = Some(
                d.resolve_v4(resolver).ok_or(Error::Param("resubscribe src_ip1 did not resolve"))?,
            );
        }
        if let Some(d) = new_src_ip2 {
            identity.src_ip2 = Some(
                d.resolve_v4(resolver).ok_or(Error::Param("resubscribe src_ip2 did not resolve"))?,
            );
        }
        self.subscriptions.resubscribe(handle, identity)
    }

    /// `request`: open an MD request/reply session against `peer`, resolved
    /// through `resolver`, applying the session's `MdConfig` reply-timeout
    /// and retry-count defaults, and sends the initial `Mr` frame.
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        &mut self,
        com_id: u32,
        peer: Destination,
        payload: Vec<u8>,
        expected_replies: u32,
        protocol: md::session::Protocol,
        callback: md::session::Callback,
        resolver: &dyn UriResolver,
    ) -> Result<Uuid> {
        let peer_ip =
            peer.resolve_v4(resolver).ok_or(Error::Param("request peer did not resolve"))?;
        let now = self.clock.now();
        let (uuid, outbound) = self.md_sessions.request(
            com_id,
            peer_ip,
            payload,
            expected_replies,
            self.md_config.default_reply_timeout,
            self.md_config.max_retries,
            protocol,
            callback,
            now,
        );
        self.send_md_outbound(&outbound);
        Counters::bump(&self.stats.md_num_rq_sent);
        Ok(uuid)
    }

    /// Marshal `value` through this session's dataset registry and stage it
    /// on `handle`, exactly as [`pd::publication::Table::put_dataset`].
    pub fn put_dataset(
        &mut self,
        handle: Handle<pd::publication::Publication>,
        value: &DatasetValue,
    ) -> Result<()> {
        self.publications.put_dataset(handle, &self.datasets, value)
    }

    /// Like [`Session::put_dataset`], but also forces emission this tick.
    pub fn put_dataset_immediate(
        &mut self,
        handle: Handle<pd::publication::Publication>,
        value: &DatasetValue,
    ) -> Result<()> {
        self.publications.put_dataset_immediate(handle, &self.datasets, value)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
