//! An in-process agent. Agents created from the same [`LoopbackNetwork`]
//! reach each other through per-port inboxes, which is enough to run a full
//! transport cascade inside one process without sockets.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use log::Level;
use shared::error::{Error, Result};

use super::*;
use crate::rand::{generate_foundation, generate_pwd, generate_ufrag};

const LOOPBACK_ADDRESS: &str = "127.0.0.1";
const FIRST_EPHEMERAL_PORT: u16 = 49152;
const HOST_PRIORITY: u32 = 2130706431;

#[derive(Default)]
struct Port {
    inbox: VecDeque<Vec<u8>>,
    waker: Option<AgentWaker>,
}

#[derive(Default)]
struct NetworkInner {
    next_port: u16,
    ports: HashMap<u16, Port>,
}

impl NetworkInner {
    fn bind(&mut self, min_port: u16, max_port: u16, waker: Option<AgentWaker>) -> Option<u16> {
        let port = if min_port != 0 || max_port != 0 {
            (min_port..=max_port).find(|port| !self.ports.contains_key(port))?
        } else {
            if self.next_port < FIRST_EPHEMERAL_PORT {
                self.next_port = FIRST_EPHEMERAL_PORT;
            }
            while self.ports.contains_key(&self.next_port) {
                self.next_port = self.next_port.checked_add(1)?;
            }
            self.next_port
        };

        // Pairs waiting on this port may validate now.
        for peer in self.ports.values() {
            if let Some(waker) = &peer.waker {
                waker.wake();
            }
        }
        self.ports.insert(
            port,
            Port {
                inbox: VecDeque::new(),
                waker,
            },
        );
        Some(port)
    }

    /// Queues `datagram` on `port` and wakes its owner.
    fn deliver(&mut self, port: u16, datagram: Vec<u8>) -> bool {
        match self.ports.get_mut(&port) {
            Some(target) => {
                target.inbox.push_back(datagram);
                if let Some(waker) = &target.waker {
                    waker.wake();
                }
                true
            }
            None => false,
        }
    }
}

/// A shared medium for loopback agents. Cloning shares the medium.
#[derive(Default, Clone)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ports currently bound by live agents.
    pub fn bound_ports(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ports
            .len()
    }
}

impl AgentFactory for LoopbackNetwork {
    fn new_agent(&self, _config: &IceConfiguration) -> Result<Box<dyn Agent>> {
        Ok(Box::new(LoopbackAgent::new(self.inner.clone())))
    }
}

struct LoopbackStream {
    id: u32,
    name: String,
    min_port: u16,
    max_port: u16,
}

pub struct LoopbackAgent {
    network: Arc<Mutex<NetworkInner>>,
    controlling: bool,
    stun_server: Option<SocketAddr>,
    waker: Option<AgentWaker>,
    local_ufrag: String,
    local_pwd: String,
    remote_ufrag: Option<String>,

    stream: Option<LoopbackStream>,
    port: Option<u16>,
    gathering_started: bool,
    gathered: bool,
    local_candidates: Vec<String>,
    remote_ports: Vec<u16>,

    state: ConnectionState,
    events: VecDeque<AgentEvent>,
}

impl LoopbackAgent {
    fn new(network: Arc<Mutex<NetworkInner>>) -> Self {
        LoopbackAgent {
            network,
            controlling: false,
            stun_server: None,
            waker: None,
            local_ufrag: generate_ufrag(),
            local_pwd: generate_pwd(),
            remote_ufrag: None,
            stream: None,
            port: None,
            gathering_started: false,
            gathered: false,
            local_candidates: vec![],
            remote_ports: vec![],
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

    fn live_remote_port(&self) -> Option<u16> {
        let network = self.network.lock().unwrap_or_else(PoisonError::into_inner);
        self.remote_ports
            .iter()
            .copied()
            .find(|port| Some(*port) != self.port && network.ports.contains_key(port))
    }

    fn check_connectivity(&mut self) {
        if !self.gathered || self.remote_ports.is_empty() {
            return;
        }
        if matches!(self.state, ConnectionState::Connected | ConnectionState::Failed) {
            return;
        }

        self.set_state(ConnectionState::Connecting);
        if let Some(port) = self.live_remote_port() {
            self.log(
                Level::Debug,
                format!("pair {LOOPBACK_ADDRESS}:{port} validated"),
            );
            self.set_state(ConnectionState::Connected);
        }
    }

    fn unbind(&mut self) {
        if let Some(port) = self.port.take() {
            self.network
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .ports
                .remove(&port);
        }
    }
}

impl Agent for LoopbackAgent {
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
        self.stream = Some(LoopbackStream {
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
            } else if line.starts_with("a=candidate:") {
                let candidate = Candidate::new(line, "");
                let stream_id = self.stream_id();
                if !self.add_remote_candidate(stream_id, 1, &candidate) {
                    return Err(Error::Other(format!("rejected remote candidate {line}")));
                }
            }
        }
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

        let port = self
            .network
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bind(min_port, max_port, self.waker.clone())
            .ok_or_else(|| Error::Other("no free port in range".to_owned()))?;
        self.port = Some(port);
        self.gathering_started = true;

        self.set_state(ConnectionState::Gathering);
        let candidate = format!(
            "candidate:{} 1 udp {HOST_PRIORITY} {LOOPBACK_ADDRESS} {port} typ host",
            generate_foundation()
        );
        self.local_candidates.push(candidate.clone());
        self.events
            .push_back(AgentEvent::NewCandidate { stream_id, candidate });
        self.events.push_back(AgentEvent::GatheringDone { stream_id });
        self.gathered = true;

        self.check_connectivity();
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
        if fields.address != LOOPBACK_ADDRESS {
            return false;
        }
        if !self.remote_ports.contains(&fields.port) {
            self.remote_ports.push(fields.port);
        }
        self.check_connectivity();
        true
    }

    fn send(&mut self, _stream_id: u32, _component_id: u16, buf: &[u8]) -> Result<usize> {
        if self.state != ConnectionState::Connected {
            return Err(Error::ErrNoValidatedPair);
        }
        let port = self
            .live_remote_port()
            .ok_or_else(|| Error::Other("remote agent is gone".to_owned()))?;

        let delivered = self
            .network
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .deliver(port, buf.to_vec());
        if delivered {
            Ok(buf.len())
        } else {
            Err(Error::Other("remote agent is gone".to_owned()))
        }
    }

    fn handle_timeout(&mut self, _now: Instant) -> Result<()> {
        self.check_connectivity();
        Ok(())
    }

    fn poll_timeout(&self) -> Option<Instant> {
        None
    }

    fn poll_event(&mut self) -> Option<AgentEvent> {
        self.events.pop_front()
    }

    fn poll_read(&mut self, buf: &mut [u8]) -> Option<usize> {
        let port = self.port?;
        let datagram = self
            .network
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ports
            .get_mut(&port)?
            .inbox
            .pop_front()?;
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Some(n)
    }

    fn close(&mut self) -> Result<()> {
        self.unbind();
        Ok(())
    }
}

impl Drop for LoopbackAgent {
    fn drop(&mut self) {
        self.unbind();
    }
}
