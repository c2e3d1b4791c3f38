//! An agent over a real UDP socket. It gathers one host candidate and, when
//! a STUN server is bound, one server reflexive candidate, then validates
//! candidate pairs with short-term authenticated STUN binding requests.
//!
//! Datagrams are read on a helper thread which wakes the owning transport.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{Level, trace};
use shared::error::{Error, Result};
use stun::agent::TransactionId;
use stun::attributes::*;
use stun::fingerprint::*;
use stun::integrity::*;
use stun::message::*;
use stun::textattrs::*;
use stun::xoraddr::*;

use super::*;
use crate::rand::{generate_foundation, generate_pwd, generate_ufrag};
use crate::transport::RECEIVE_MTU;

const HOST_PRIORITY: u32 = 2130706431;
const SRFLX_PRIORITY: u32 = 1694498815;

/// Interval between two rounds of connectivity checks.
const CHECK_INTERVAL: Duration = Duration::from_millis(50);
/// Retransmission timeout of the server reflexive binding request.
const STUN_RETRANSMIT_INTERVAL: Duration = Duration::from_millis(500);
const MAX_STUN_ATTEMPTS: u32 = 3;
/// Checks that got no answer within this delay are forgotten.
const MAX_BINDING_REQUEST_TIMEOUT: Duration = Duration::from_millis(4000);
/// The component fails when no pair validates within this delay.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(25);
const READ_TIMEOUT: Duration = Duration::from_millis(100);

// Only used to pick the outgoing interface; nothing is sent there.
const ROUTE_TARGET: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 9);

/// Creates [`UdpAgent`]s.
#[derive(Default, Debug, Clone)]
pub struct UdpAgentFactory {
    host_address: Option<IpAddr>,
}

impl UdpAgentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds and advertises `address` instead of the address of the
    /// interface routing towards the STUN server.
    pub fn with_host_address(mut self, address: IpAddr) -> Self {
        self.host_address = Some(address);
        self
    }
}

impl AgentFactory for UdpAgentFactory {
    fn new_agent(&self, _config: &IceConfiguration) -> Result<Box<dyn Agent>> {
        Ok(Box::new(UdpAgent::new(self.host_address)))
    }
}

struct UdpStream {
    id: u32,
    name: String,
    min_port: u16,
    max_port: u16,
}

/// Reads the socket until closed and hands datagrams to the agent.
struct Reader {
    closed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Reader {
    fn spawn(
        socket: UdpSocket,
        waker: Option<AgentWaker>,
    ) -> Result<(Self, Receiver<(Vec<u8>, SocketAddr)>)> {
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let stop = Arc::clone(&closed);
        let handle = thread::Builder::new()
            .name("ice-udp-reader".to_owned())
            .spawn(move || {
                let mut buf = vec![0u8; RECEIVE_MTU];
                while !stop.load(Ordering::SeqCst) {
                    match socket.recv_from(&mut buf) {
                        Ok((n, from)) => {
                            if tx.send((buf[..n].to_vec(), from)).is_err() {
                                break;
                            }
                            if let Some(waker) = &waker {
                                waker.wake();
                            }
                        }
                        Err(err)
                            if matches!(
                                err.kind(),
                                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                            ) => {}
                        Err(err) => {
                            trace!("udp read failed: {err}");
                            thread::sleep(READ_TIMEOUT);
                        }
                    }
                }
            })?;

        Ok((
            Reader {
                closed,
                handle: Some(handle),
            },
            rx,
        ))
    }

    fn stop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Server reflexive discovery in flight.
struct ReflexiveQuery {
    transaction_id: TransactionId,
    attempts: u32,
    retransmit_at: Instant,
}

struct BindingCheck {
    transaction_id: TransactionId,
    destination: SocketAddr,
    timestamp: Instant,
}

pub struct UdpAgent {
    host_address: Option<IpAddr>,
    controlling: bool,
    stun_server: Option<SocketAddr>,
    waker: Option<AgentWaker>,
    local_ufrag: String,
    local_pwd: String,
    remote_ufrag: Option<String>,
    remote_pwd: Option<String>,

    stream: Option<UdpStream>,
    socket: Option<UdpSocket>,
    reader: Option<Reader>,
    inbound: Option<Receiver<(Vec<u8>, SocketAddr)>>,
    host: Option<SocketAddr>,
    gathering_started: bool,
    reflexive: Option<ReflexiveQuery>,
    local_candidates: Vec<String>,

    remotes: Vec<SocketAddr>,
    pending_checks: Vec<BindingCheck>,
    checks_started: Option<Instant>,
    next_check: Option<Instant>,
    selected: Option<SocketAddr>,

    received: VecDeque<Vec<u8>>,
    state: ConnectionState,
    events: VecDeque<AgentEvent>,
}

impl UdpAgent {
    fn new(host_address: Option<IpAddr>) -> Self {
        UdpAgent {
            host_address,
            controlling: false,
            stun_server: None,
            waker: None,
            local_ufrag: generate_ufrag(),
            local_pwd: generate_pwd(),
            remote_ufrag: None,
            remote_pwd: None,
            stream: None,
            socket: None,
            reader: None,
            inbound: None,
            host: None,
            gathering_started: false,
            reflexive: None,
            local_candidates: vec![],
            remotes: vec![],
            pending_checks: vec![],
            checks_started: None,
            next_check: None,
            selected: None,
            received: VecDeque::new(),
            state: ConnectionState::Disconnected,
            events: VecDeque::new(),
        }
    }

    fn stream_id(&self) -> u32 {
        self.stream.as_ref().map(|s| s.id).unwrap_or_default()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.events.push_back(AgentEvent::ComponentStateChanged {
                stream_id: self.stream_id(),
                component_id: 1,
                state,
            });
        }
    }

    fn log(&mut self, level: Level, message: String) {
        self.events.push_back(AgentEvent::Log { level, message });
    }

    fn bind_address(&self) -> IpAddr {
        match self.host_address {
            Some(address) => address,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    fn same_family(&self, address: &SocketAddr) -> bool {
        address.is_ipv4() == self.bind_address().is_ipv4()
    }

    /// Address of the interface that routes towards the STUN server, or
    /// towards a documentation address without one.
    fn advertised_address(&self) -> IpAddr {
        if let Some(address) = self.host_address {
            return address;
        }
        let target = self.stun_server.unwrap_or(ROUTE_TARGET);
        UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .and_then(|socket| {
                socket.connect(target)?;
                socket.local_addr()
            })
            .map(|local| local.ip())
            .ok()
            .filter(|ip| !ip.is_unspecified())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn bind_socket(&self, min_port: u16, max_port: u16) -> Result<UdpSocket> {
        let address = self.bind_address();
        if min_port == 0 && max_port == 0 {
            return Ok(UdpSocket::bind((address, 0))?);
        }
        (min_port..=max_port)
            .find_map(|port| UdpSocket::bind((address, port)).ok())
            .ok_or_else(|| Error::Other(format!("no free port in {min_port}-{max_port}")))
    }

    fn send_to(&mut self, buf: &[u8], destination: SocketAddr) {
        let Some(socket) = &self.socket else {
            return;
        };
        if let Err(err) = socket.send_to(buf, destination) {
            self.log(Level::Debug, format!("send to {destination} failed: {err}"));
        }
    }

    fn push_candidate(&mut self, candidate: String) {
        self.local_candidates.push(candidate.clone());
        self.events.push_back(AgentEvent::NewCandidate {
            stream_id: self.stream_id(),
            candidate,
        });
    }

    fn finish_gathering(&mut self) {
        self.reflexive = None;
        self.events.push_back(AgentEvent::GatheringDone {
            stream_id: self.stream_id(),
        });
    }

    fn send_reflexive_request(&mut self, now: Instant) -> Result<()> {
        let Some(server) = self.stun_server else {
            return Ok(());
        };

        let mut msg = Message::new();
        msg.build(&[Box::new(BINDING_REQUEST), Box::new(TransactionId::new())])
            .map_err(|err| Error::ErrStun(err.to_string()))?;

        let attempts = self.reflexive.as_ref().map_or(0, |q| q.attempts) + 1;
        self.reflexive = Some(ReflexiveQuery {
            transaction_id: msg.transaction_id,
            attempts,
            retransmit_at: now + STUN_RETRANSMIT_INTERVAL,
        });
        self.send_to(&msg.raw, server);
        Ok(())
    }

    fn handle_reflexive_timeout(&mut self, now: Instant) -> Result<()> {
        let Some(query) = &self.reflexive else {
            return Ok(());
        };
        if now < query.retransmit_at {
            return Ok(());
        }
        if query.attempts >= MAX_STUN_ATTEMPTS {
            self.log(
                Level::Warn,
                "STUN server did not answer, no server reflexive candidate".to_owned(),
            );
            self.finish_gathering();
            return Ok(());
        }
        self.send_reflexive_request(now)
    }

    fn handle_reflexive_response(&mut self, m: &Message) {
        let mut mapped = XorMappedAddress::default();
        if let Err(err) = mapped.get_from(m) {
            self.log(Level::Warn, format!("invalid STUN server response: {err}"));
            return;
        }

        if let Some(host) = self.host {
            if mapped.ip != host.ip() || mapped.port != host.port() {
                let candidate = format!(
                    "candidate:{} 1 udp {SRFLX_PRIORITY} {} {} typ srflx raddr {} rport {}",
                    generate_foundation(),
                    mapped.ip,
                    mapped.port,
                    host.ip(),
                    host.port()
                );
                self.push_candidate(candidate);
            }
        }
        self.finish_gathering();
    }

    /// Checks start once the socket is bound and the remote credentials and
    /// at least one remote address are known.
    fn schedule_checks(&mut self, now: Instant) {
        if self.socket.is_none() || self.remote_pwd.is_none() || self.remote_ufrag.is_none() {
            return;
        }
        if self.remotes.is_empty() {
            return;
        }
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Failed
        ) {
            return;
        }

        if self.checks_started.is_none() {
            self.checks_started = Some(now);
            self.set_state(ConnectionState::Connecting);
        }
        self.next_check = Some(now);
    }

    fn send_checks(&mut self, now: Instant) -> Result<()> {
        let (Some(remote_ufrag), Some(remote_pwd)) = (&self.remote_ufrag, &self.remote_pwd) else {
            return Ok(());
        };
        let username = format!("{remote_ufrag}:{}", self.local_ufrag);
        let remote_pwd = remote_pwd.clone();

        self.pending_checks.retain(|check| {
            now.checked_duration_since(check.timestamp)
                .is_none_or(|elapsed| elapsed < MAX_BINDING_REQUEST_TIMEOUT)
        });

        for destination in self.remotes.clone() {
            let mut msg = Message::new();
            msg.build(&[
                Box::new(BINDING_REQUEST),
                Box::new(TransactionId::new()),
                Box::new(Username::new(ATTR_USERNAME, username.clone())),
                Box::new(MessageIntegrity::new_short_term_integrity(
                    remote_pwd.clone(),
                )),
                Box::new(FINGERPRINT),
            ])
            .map_err(|err| Error::ErrStun(err.to_string()))?;

            self.pending_checks.push(BindingCheck {
                transaction_id: msg.transaction_id,
                destination,
                timestamp: now,
            });
            self.send_to(&msg.raw, destination);
        }
        Ok(())
    }

    fn handle_check_timeout(&mut self, now: Instant) -> Result<()> {
        let Some(next_check) = self.next_check else {
            return Ok(());
        };
        if now < next_check {
            return Ok(());
        }

        let expired = self
            .checks_started
            .is_some_and(|started| now.saturating_duration_since(started) >= CONNECTIVITY_TIMEOUT);
        if expired {
            self.log(
                Level::Warn,
                format!("no candidate pair validated within {CONNECTIVITY_TIMEOUT:?}"),
            );
            self.next_check = None;
            self.set_state(ConnectionState::Failed);
            return Ok(());
        }

        self.send_checks(now)?;
        self.next_check = Some(now + CHECK_INTERVAL);
        Ok(())
    }

    fn handle_binding_request(&mut self, m: &mut Message, from: SocketAddr) {
        let mut username = Username::new(ATTR_USERNAME, String::new());
        if username.get_from(m).is_err()
            || !username
                .to_string()
                .starts_with(&format!("{}:", self.local_ufrag))
        {
            self.log(Level::Debug, format!("discard request from {from}, bad username"));
            return;
        }
        let integrity = MessageIntegrity::new_short_term_integrity(self.local_pwd.clone());
        if let Err(err) = integrity.check(m) {
            self.log(Level::Debug, format!("discard request from {from}, {err}"));
            return;
        }

        if !self.remotes.contains(&from) {
            self.log(Level::Debug, format!("adding peer reflexive remote {from}"));
            self.remotes.push(from);
            self.schedule_checks(Instant::now());
        }

        let mut out = Message::new();
        let built = out.build(&[
            Box::new(m.clone()),
            Box::new(BINDING_SUCCESS),
            Box::new(XorMappedAddress {
                ip: from.ip(),
                port: from.port(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(
                self.local_pwd.clone(),
            )),
            Box::new(FINGERPRINT),
        ]);
        match built {
            Ok(()) => self.send_to(&out.raw, from),
            Err(err) => self.log(Level::Warn, format!("failed to answer {from}: {err}")),
        }
    }

    fn handle_binding_success(&mut self, m: &mut Message, from: SocketAddr) {
        if self
            .reflexive
            .as_ref()
            .is_some_and(|q| q.transaction_id == m.transaction_id)
        {
            self.handle_reflexive_response(m);
            return;
        }

        let Some(index) = self
            .pending_checks
            .iter()
            .position(|check| check.transaction_id == m.transaction_id)
        else {
            self.log(Level::Trace, format!("unexpected response from {from}"));
            return;
        };
        let check = self.pending_checks.remove(index);
        if check.destination != from {
            self.log(Level::Debug, format!("response from {from} for {}", check.destination));
            return;
        }

        let Some(remote_pwd) = self.remote_pwd.clone() else {
            return;
        };
        if let Err(err) = MessageIntegrity::new_short_term_integrity(remote_pwd).check(m) {
            self.log(Level::Debug, format!("discard response from {from}, {err}"));
            return;
        }

        if self.selected.is_none() {
            self.log(Level::Debug, format!("pair {from} validated"));
            self.selected = Some(from);
            self.next_check = None;
            self.pending_checks.clear();
            self.set_state(ConnectionState::Connected);
        }
    }

    fn handle_datagram(&mut self, datagram: Vec<u8>, from: SocketAddr) {
        if !is_message(&datagram) {
            if self.remotes.contains(&from) {
                self.received.push_back(datagram);
            } else {
                self.log(Level::Trace, format!("discard datagram from unknown {from}"));
            }
            return;
        }

        let mut m = Message {
            raw: vec![],
            ..Message::default()
        };
        m.raw.extend_from_slice(&datagram);
        if let Err(err) = m.decode() {
            self.log(Level::Debug, format!("undecodable STUN from {from}: {err}"));
            return;
        }
        if m.typ.method != METHOD_BINDING {
            return;
        }

        if m.typ.class == CLASS_REQUEST {
            self.handle_binding_request(&mut m, from);
        } else if m.typ.class == CLASS_SUCCESS_RESPONSE {
            self.handle_binding_success(&mut m, from);
        }
    }

    fn drain_inbound(&mut self) {
        let mut datagrams = vec![];
        if let Some(inbound) = &self.inbound {
            while let Ok(datagram) = inbound.try_recv() {
                datagrams.push(datagram);
            }
        }
        for (datagram, from) in datagrams {
            self.handle_datagram(datagram, from);
        }
    }

    fn stop(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.stop();
        }
        self.inbound = None;
        self.socket = None;
        self.next_check = None;
        self.reflexive = None;
    }
}

impl Agent for UdpAgent {
    fn set_waker(&mut self, waker: AgentWaker) {
        self.waker = Some(waker);
    }

    fn set_controlling_mode(&mut self, controlling: bool) {
        self.controlling = controlling;
    }

    fn set_stun_server(&mut self, server: SocketAddr) {
        self.stun_server = Some(server);
    }

    fn add_stream(&mut self, n_components: u16) -> Option<u32> {
        if self.stream.is_some() || n_components != 1 {
            return None;
        }
        self.stream = Some(UdpStream {
            id: 1,
            name: String::new(),
            min_port: 0,
            max_port: 0,
        });
        Some(1)
    }

    fn set_stream_name(&mut self, stream_id: u32, name: &str) {
        if let Some(stream) = self.stream.as_mut().filter(|s| s.id == stream_id) {
            stream.name = name.to_owned();
        }
    }

    fn set_port_range(&mut self, stream_id: u32, _component_id: u16, min_port: u16, max_port: u16) {
        if let Some(stream) = self.stream.as_mut().filter(|s| s.id == stream_id) {
            stream.min_port = min_port;
            stream.max_port = max_port;
        }
    }

    fn generate_local_sdp(&self) -> String {
        let mut sdp = format!(
            "a=ice-ufrag:{}\r\na=ice-pwd:{}\r\n",
            self.local_ufrag, self.local_pwd
        );
        if let Some(stream) = &self.stream {
            sdp += &format!("a=mid:{}\r\n", stream.name);
        }
        for candidate in &self.local_candidates {
            sdp += &format!("a={candidate}\r\n");
        }
        sdp
    }

    fn parse_remote_sdp(&mut self, sdp: &str) -> Result<()> {
        for line in sdp.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(ufrag) = line.strip_prefix("a=ice-ufrag:") {
                self.remote_ufrag = Some(ufrag.to_owned());
            } else if let Some(pwd) = line.strip_prefix("a=ice-pwd:") {
                self.remote_pwd = Some(pwd.to_owned());
            } else if line.starts_with("a=candidate:") {
                let candidate = Candidate::new(line, "");
                let stream_id = self.stream_id();
                // Unusable candidates are skipped; the others may still connect.
                if !self.add_remote_candidate(stream_id, 1, &candidate) {
                    self.log(Level::Debug, format!("skipping remote candidate {line}"));
                }
            }
        }
        if self.remote_ufrag.is_none() || self.remote_pwd.is_none() {
            return Err(Error::Other("missing remote ICE credentials".to_owned()));
        }
        self.schedule_checks(Instant::now());
        Ok(())
    }

    fn gather_candidates(&mut self, stream_id: u32) -> Result<()> {
        let (min_port, max_port) = match &self.stream {
            Some(stream) if stream.id == stream_id => (stream.min_port, stream.max_port),
            _ => return Err(Error::Other(format!("unknown stream {stream_id}"))),
        };
        if self.gathering_started {
            return Err(Error::ErrGatheringAlreadyStarted);
        }

        let socket = self.bind_socket(min_port, max_port)?;
        let port = socket.local_addr()?.port();
        let (reader, inbound) = Reader::spawn(socket.try_clone()?, self.waker.clone())?;
        self.socket = Some(socket);
        self.reader = Some(reader);
        self.inbound = Some(inbound);
        self.gathering_started = true;

        self.set_state(ConnectionState::Gathering);
        let host = SocketAddr::new(self.advertised_address(), port);
        self.host = Some(host);
        self.push_candidate(format!(
            "candidate:{} 1 udp {HOST_PRIORITY} {} {} typ host",
            generate_foundation(),
            host.ip(),
            host.port()
        ));

        let now = Instant::now();
        match self.stun_server {
            Some(server) if self.same_family(&server) => self.send_reflexive_request(now)?,
            Some(server) => {
                self.log(Level::Debug, format!("STUN server {server} unreachable from socket"));
                self.finish_gathering();
            }
            None => self.finish_gathering(),
        }

        self.schedule_checks(now);
        Ok(())
    }

    fn add_remote_candidate(
        &mut self,
        _stream_id: u32,
        _component_id: u16,
        candidate: &Candidate,
    ) -> bool {
        let Ok(fields) = candidate.parse() else {
            return false;
        };
        if !fields.network.eq_ignore_ascii_case("udp") {
            return false;
        }
        let Ok(ip) = fields.address.parse::<IpAddr>() else {
            // Hostname candidates are not resolved.
            return false;
        };
        let address = SocketAddr::new(ip, fields.port);
        if !self.same_family(&address) {
            return false;
        }

        if !self.remotes.contains(&address) {
            self.remotes.push(address);
        }
        self.schedule_checks(Instant::now());
        true
    }

    fn send(&mut self, _stream_id: u32, _component_id: u16, buf: &[u8]) -> Result<usize> {
        let (Some(socket), Some(selected)) = (&self.socket, self.selected) else {
            return Err(Error::ErrNoValidatedPair);
        };
        if self.state != ConnectionState::Connected {
            return Err(Error::ErrNoValidatedPair);
        }
        Ok(socket.send_to(buf, selected)?)
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        self.drain_inbound();
        self.handle_reflexive_timeout(now)?;
        self.handle_check_timeout(now)
    }

    fn poll_timeout(&self) -> Option<Instant> {
        let retransmit = self.reflexive.as_ref().map(|q| q.retransmit_at);
        match (retransmit, self.next_check) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn poll_event(&mut self) -> Option<AgentEvent> {
        self.events.pop_front()
    }

    fn poll_read(&mut self, buf: &mut [u8]) -> Option<usize> {
        let datagram = self.received.pop_front()?;
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Some(n)
    }

    fn close(&mut self) -> Result<()> {
        self.stop();
        Ok(())
    }
}

impl Drop for UdpAgent {
    fn drop(&mut self) {
        self.stop();
    }
}
