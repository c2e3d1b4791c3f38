#[cfg(test)]
mod agent_test;

pub mod agent_config;
pub mod agent_loopback;
pub mod agent_udp;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use shared::error::Result;

use crate::candidate::Candidate;
use crate::state::ConnectionState;
use agent_config::IceConfiguration;

/// Events an [`Agent`] reports while it processes I/O. They are drained by the
/// owning transport's event loop, one agent at a time, in the order queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    ComponentStateChanged {
        stream_id: u32,
        component_id: u16,
        state: ConnectionState,
    },
    /// A local candidate in its `candidate:...` form.
    NewCandidate { stream_id: u32, candidate: String },
    GatheringDone { stream_id: u32 },
    /// Agent diagnostics, routed to the transport's `LogSink`.
    Log { level: log::Level, message: String },
}

/// Wakes the event loop of the transport that owns an agent. Agents call it,
/// from any thread, when input becomes available outside of `handle_timeout`.
#[derive(Clone)]
pub struct AgentWaker(Arc<dyn Fn() + Send + Sync>);

impl AgentWaker {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        AgentWaker(Arc::new(f))
    }

    pub fn wake(&self) {
        (self.0)()
    }
}

impl fmt::Debug for AgentWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AgentWaker")
    }
}

/// Agent is the interactive connectivity establishment engine driven by an
/// `IceTransport`. It owns sockets, candidate discovery and connectivity
/// checks; the transport only feeds it signaling input and polls it.
///
/// All methods are called with the transport's agent lock held, either from
/// the caller's thread or from the transport's event loop, so implementations
/// must not block beyond their own non-blocking I/O.
///
/// The event loop sleeps until `poll_timeout` or until it is woken. An agent
/// that receives input on its own must call the waker handed to `set_waker`.
pub trait Agent: Send {
    fn set_waker(&mut self, _waker: AgentWaker) {}

    fn set_controlling_mode(&mut self, controlling: bool);

    fn set_stun_server(&mut self, server: SocketAddr);

    /// Registers a stream of `n_components` components and returns its id.
    fn add_stream(&mut self, n_components: u16) -> Option<u32>;

    fn set_stream_name(&mut self, stream_id: u32, name: &str);

    /// `0` on both ends leaves the choice to the agent.
    fn set_port_range(&mut self, stream_id: u32, component_id: u16, min_port: u16, max_port: u16);

    /// Local credentials and the candidates gathered so far, one `a=` line each.
    fn generate_local_sdp(&self) -> String;

    fn parse_remote_sdp(&mut self, sdp: &str) -> Result<()>;

    /// Starts candidate discovery. Candidates surface as
    /// [`AgentEvent::NewCandidate`] followed by one [`AgentEvent::GatheringDone`].
    fn gather_candidates(&mut self, stream_id: u32) -> Result<()>;

    /// Returns false when the agent rejects the candidate.
    fn add_remote_candidate(&mut self, stream_id: u32, component_id: u16, candidate: &Candidate)
    -> bool;

    fn send(&mut self, stream_id: u32, component_id: u16, buf: &[u8]) -> Result<usize>;

    fn handle_timeout(&mut self, now: Instant) -> Result<()>;

    /// Next instant `handle_timeout` wants to run, if any.
    fn poll_timeout(&self) -> Option<Instant>;

    fn poll_event(&mut self) -> Option<AgentEvent>;

    /// Copies the next received datagram into `buf` and returns its length.
    /// `buf` is reused across calls.
    fn poll_read(&mut self, buf: &mut [u8]) -> Option<usize>;

    fn close(&mut self) -> Result<()>;
}

/// Creates agents. Failure is an initialization error of the transport being
/// built.
pub trait AgentFactory: Send + Sync {
    fn new_agent(&self, config: &IceConfiguration) -> Result<Box<dyn Agent>>;
}
