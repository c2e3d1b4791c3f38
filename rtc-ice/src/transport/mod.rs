
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{Level, debug, trace, warn};
use sdp::{Description, Role};
use shared::error::{Error, Result};
use shared::message::{Message, MessageObserver};

use crate::agent::agent_config::IceConfiguration;
use crate::agent::{Agent, AgentEvent, AgentFactory, AgentWaker};
use crate::candidate::Candidate;
use crate::server::select_stun_server;
use crate::state::ConnectionState;

/// Size of the buffer datagrams are read into.
pub const RECEIVE_MTU: usize = 8192;

/// Name given to the single agent stream.
pub const DEFAULT_STREAM_NAME: &str = "application";

const COMPONENT_ID: u16 = 1;

/// Receives the connectivity transport's asynchronous signals. Both methods
/// are called from the transport's event loop thread.
pub trait ConnectivityReadyObserver: Send + Sync {
    /// A local candidate, or `None` once gathering is complete.
    fn on_local_candidate(&self, candidate: Option<Candidate>);

    /// The component reached [`ConnectionState::Connected`]. Fires at most once.
    fn on_connectivity_ready(&self);
}

/// Destination for agent diagnostics.
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

/// Discards everything.
#[derive(Default, Debug, Copy, Clone)]
pub struct NoopLogSink;

impl LogSink for NoopLogSink {
    fn log(&self, _level: Level, _message: &str) {}
}

/// Forwards agent diagnostics to the `log` facade under the `ice::agent` target.
#[derive(Default, Debug, Copy, Clone)]
pub struct FacadeLogSink;

impl LogSink for FacadeLogSink {
    fn log(&self, level: Level, message: &str) {
        log::log!(target: "ice::agent", level, "{message}");
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum GatheringState {
    New,
    Gathering,
    Complete,
}

enum Command {
    Wake,
    Close,
}

/// State shared between the transport handle and its event loop.
struct TransportInternal {
    agent: Mutex<Box<dyn Agent>>,
    stream_id: u32,
    stream_name: String,
    role: Mutex<Role>,
    state: AtomicU8,
    gathering: Mutex<GatheringState>,
    ready: AtomicBool,
    observer: Weak<dyn ConnectivityReadyObserver>,
    receiver: Mutex<Option<Weak<dyn MessageObserver>>>,
    log_sink: Arc<dyn LogSink>,
}

impl TransportInternal {
    fn agent(&self) -> std::sync::MutexGuard<'_, Box<dyn Agent>> {
        self.agent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn role(&self) -> Role {
        *self.role.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gathering(&self) -> std::sync::MutexGuard<'_, GatheringState> {
        self.gathering.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drives the agent once and returns what it produced, plus the deadline
    /// of its next timer. The agent lock is released before returning.
    fn poll_agent(&self, buf: &mut [u8]) -> (Vec<AgentEvent>, Vec<Message>, Option<Instant>) {
        let mut agent = self.agent();
        if let Err(err) = agent.handle_timeout(Instant::now()) {
            warn!("agent timeout handling failed: {err}");
        }

        let mut events = vec![];
        while let Some(event) = agent.poll_event() {
            events.push(event);
        }

        let mut messages = vec![];
        while let Some(n) = agent.poll_read(buf) {
            messages.push(Message::from_slice(&buf[..n]));
        }

        (events, messages, agent.poll_timeout())
    }

    fn handle_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::ComponentStateChanged {
                component_id, state, ..
            } => {
                if component_id != COMPONENT_ID {
                    return;
                }
                trace!("component {component_id} state changed to {state}");
                self.state.store(state.into(), Ordering::SeqCst);

                if state == ConnectionState::Connected && !self.ready.swap(true, Ordering::SeqCst)
                {
                    debug!("connectivity established on stream {}", self.stream_name);
                    if let Some(observer) = self.observer.upgrade() {
                        observer.on_connectivity_ready();
                    }
                }
            }
            AgentEvent::NewCandidate { candidate, .. } => {
                if *self.gathering() != GatheringState::Gathering {
                    trace!("dropping candidate outside of gathering: {candidate}");
                    return;
                }
                if let Some(observer) = self.observer.upgrade() {
                    observer.on_local_candidate(Some(Candidate::new(&candidate, &self.stream_name)));
                }
            }
            AgentEvent::GatheringDone { .. } => {
                {
                    let mut gathering = self.gathering();
                    if *gathering != GatheringState::Gathering {
                        return;
                    }
                    *gathering = GatheringState::Complete;
                }
                if let Some(observer) = self.observer.upgrade() {
                    observer.on_local_candidate(None);
                }
            }
            AgentEvent::Log { level, message } => self.log_sink.log(level, &message),
        }
    }

    fn deliver(&self, message: Message) {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);

        match receiver {
            Some(receiver) => receiver.on_message(message),
            None => trace!("dropping {} bytes, no receiver", message.len()),
        }
    }
}

fn run_event_loop(internal: Arc<TransportInternal>, commands: Receiver<Command>) {
    let mut buf = vec![0u8; RECEIVE_MTU];

    loop {
        let (events, messages, deadline) = internal.poll_agent(&mut buf);
        for event in events {
            internal.handle_event(event);
        }
        for message in messages {
            internal.deliver(message);
        }

        // Idle until the agent's next timer or until something wakes us.
        let command = match deadline {
            Some(deadline) => {
                commands.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match command {
            Ok(Command::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Command::Close) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    trace!("event loop of stream {} stopped", internal.stream_name);
}

/// IceTransport owns one connectivity establishment agent with a single
/// stream and component, and runs its event processing on a dedicated thread.
/// Once a candidate pair is validated it carries datagrams in both directions.
pub struct IceTransport {
    internal: Arc<TransportInternal>,
    stun_server: Option<SocketAddr>,
    commands: Sender<Command>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl IceTransport {
    /// Creates the agent through `factory`, binds the first resolvable STUN
    /// server, registers the stream and starts the event loop.
    pub fn new(
        config: &IceConfiguration,
        role: Role,
        factory: &dyn AgentFactory,
        observer: Weak<dyn ConnectivityReadyObserver>,
        log_sink: Arc<dyn LogSink>,
    ) -> Result<Arc<Self>> {
        let mut agent = factory
            .new_agent(config)
            .map_err(|err| Error::ErrAgentCreate(err.to_string()))?;

        let (commands, command_rx) = mpsc::channel();
        let waker = commands.clone();
        agent.set_waker(AgentWaker::new(move || {
            let _ = waker.send(Command::Wake);
        }));
        agent.set_controlling_mode(role == Role::Active);

        let stun_server = select_stun_server(&config.servers, config.shuffle_seed(), |host, port| {
            shared::util::lookup_host(true, (host, port))
        });
        match stun_server {
            Some(server) => agent.set_stun_server(server),
            None if !config.servers.is_empty() => {
                warn!("no STUN server could be resolved, continuing without one")
            }
            None => {}
        }

        let stream_id = agent.add_stream(1).ok_or(Error::ErrAddStream)?;
        agent.set_stream_name(stream_id, DEFAULT_STREAM_NAME);
        agent.set_port_range(
            stream_id,
            COMPONENT_ID,
            config.port_range_begin,
            config.port_range_end,
        );

        let internal = Arc::new(TransportInternal {
            agent: Mutex::new(agent),
            stream_id,
            stream_name: DEFAULT_STREAM_NAME.to_owned(),
            role: Mutex::new(role),
            state: AtomicU8::new(ConnectionState::Disconnected.into()),
            gathering: Mutex::new(GatheringState::New),
            ready: AtomicBool::new(false),
            observer,
            receiver: Mutex::new(None),
            log_sink,
        });

        let loop_internal = Arc::clone(&internal);
        let event_loop = thread::Builder::new()
            .name(format!("ice-{stream_id}"))
            .spawn(move || run_event_loop(loop_internal, command_rx))
            .map_err(|_| Error::ErrEventLoopCreate)?;

        Ok(Arc::new(IceTransport {
            internal,
            stun_server,
            commands,
            event_loop: Mutex::new(Some(event_loop)),
        }))
    }

    /// Local role; an `ActPass` transport takes the complement of the remote
    /// role once a remote description is applied.
    pub fn role(&self) -> Role {
        self.internal.role()
    }

    pub fn state(&self) -> ConnectionState {
        self.internal.state.load(Ordering::SeqCst).into()
    }

    pub fn stream_name(&self) -> &str {
        &self.internal.stream_name
    }

    /// The STUN server bound to the agent, if any resolved.
    pub fn stun_server(&self) -> Option<SocketAddr> {
        self.stun_server
    }

    /// Snapshot of the local credentials and of the candidates gathered so far.
    pub fn local_description(&self) -> Result<Description> {
        let sdp = self.internal.agent().generate_local_sdp();
        let mut description = Description::new(self.role(), &sdp)?;
        description.set_role(self.role());
        Ok(description)
    }

    pub fn set_remote_description(&self, description: &Description) -> Result<()> {
        {
            let mut agent = self.internal.agent();
            agent
                .parse_remote_sdp(&description.to_string())
                .map_err(|err| Error::ErrParseRemoteDescription(err.to_string()))?;

            let mut role = self.internal.role.lock()?;
            let resolved = role.resolve(description.role());
            if resolved != *role {
                debug!("local role resolved from {} to {resolved}", *role);
                *role = resolved;
                agent.set_controlling_mode(resolved == Role::Active);
            }
        }

        self.wake();
        Ok(())
    }

    /// Starts gathering. Candidates are reported to the observer followed by
    /// one `None`. Gathering can only be started once.
    pub fn gather_local_candidates(&self) -> Result<()> {
        {
            let mut gathering = self.internal.gathering.lock()?;
            if *gathering != GatheringState::New {
                return Err(Error::ErrGatheringAlreadyStarted);
            }
            *gathering = GatheringState::Gathering;
        }

        let result = self
            .internal
            .agent()
            .gather_candidates(self.internal.stream_id);
        if let Err(err) = result {
            *self.internal.gathering() = GatheringState::New;
            return Err(Error::ErrGatherCandidates(err.to_string()));
        }

        self.wake();
        Ok(())
    }

    /// Returns false if the candidate does not parse or the agent rejects it.
    pub fn add_remote_candidate(&self, candidate: &Candidate) -> bool {
        if let Err(err) = candidate.parse() {
            debug!("ignoring remote candidate {candidate}: {err}");
            return false;
        }

        let accepted = self.internal.agent().add_remote_candidate(
            self.internal.stream_id,
            COMPONENT_ID,
            candidate,
        );
        if accepted {
            self.wake();
        }
        accepted
    }

    /// Hands the payload to the agent. Returns false until connectivity is
    /// established or if the agent fails to send.
    pub fn send(&self, message: Message) -> bool {
        if !self.internal.ready.load(Ordering::SeqCst) {
            return false;
        }

        match self
            .internal
            .agent()
            .send(self.internal.stream_id, COMPONENT_ID, &message.payload)
        {
            Ok(_) => true,
            Err(err) => {
                debug!("send of {} bytes failed: {err}", message.len());
                false
            }
        }
    }

    /// Registers the receiver of incoming datagrams. The last registration wins.
    pub fn on_message(&self, receiver: Weak<dyn MessageObserver>) {
        *self
            .internal
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(receiver);
    }

    fn wake(&self) {
        // A closed loop only happens during drop.
        let _ = self.commands.send(Command::Wake);
    }
}

impl Drop for IceTransport {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);

        let handle = self
            .event_loop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Dropped from one of our own callbacks; the loop exits on its next wait.
                trace!("ice transport dropped on its event loop thread");
            } else if handle.join().is_err() {
                warn!("ice event loop panicked");
            }
        }

        if let Err(err) = self.internal.agent().close() {
            warn!("failed to close agent: {err}");
        }
    }
}
