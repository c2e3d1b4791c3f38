#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod agent;
pub mod candidate;
pub mod rand;
pub mod server;
pub mod state;
pub mod transport;

pub use agent::agent_config::IceConfiguration;
pub use agent::agent_loopback::LoopbackNetwork;
pub use agent::agent_udp::UdpAgentFactory;
pub use agent::{Agent, AgentEvent, AgentFactory, AgentWaker};
pub use candidate::Candidate;
pub use server::IceServer;
pub use state::ConnectionState;
pub use transport::{
    ConnectivityReadyObserver, FacadeLogSink, IceTransport, LogSink, NoopLogSink,
};
