use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use shared::error::{Error, Result};
use stun::message::*;
use stun::xoraddr::*;

use super::agent_loopback::LoopbackNetwork;
use super::agent_udp::UdpAgentFactory;
use super::*;

static INIT_LOGGER: Once = Once::new();

fn init_logger() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn drain(agent: &mut Box<dyn Agent>) -> Vec<AgentEvent> {
    let mut events = vec![];
    while let Some(event) = agent.poll_event() {
        events.push(event);
    }
    events
}

fn local_candidate(events: &[AgentEvent]) -> Result<String> {
    events
        .iter()
        .find_map(|event| match event {
            AgentEvent::NewCandidate { candidate, .. } => Some(candidate.clone()),
            _ => None,
        })
        .ok_or_else(|| Error::Other("no local candidate".to_owned()))
}

fn is_connected(events: &[AgentEvent]) -> bool {
    events.iter().any(|event| {
        matches!(
            event,
            AgentEvent::ComponentStateChanged {
                state: ConnectionState::Connected,
                ..
            }
        )
    })
}

fn new_gathered_agent(network: &LoopbackNetwork) -> Result<(Box<dyn Agent>, u32)> {
    let mut agent = network.new_agent(&IceConfiguration::default())?;
    let stream_id = agent.add_stream(1).ok_or(Error::ErrAddStream)?;
    agent.set_stream_name(stream_id, "application");
    agent.gather_candidates(stream_id)?;
    Ok((agent, stream_id))
}

#[test]
fn test_loopback_gathering() -> Result<()> {
    init_logger();
    let network = LoopbackNetwork::new();
    let (mut agent, stream_id) = new_gathered_agent(&network)?;

    let events = drain(&mut agent);
    assert_eq!(
        events.first(),
        Some(&AgentEvent::ComponentStateChanged {
            stream_id,
            component_id: 1,
            state: ConnectionState::Gathering
        })
    );
    assert_eq!(
        events.last(),
        Some(&AgentEvent::GatheringDone { stream_id })
    );

    let candidate = local_candidate(&events)?;
    let fields = Candidate::new(&candidate, "").parse()?;
    assert_eq!(fields.address, "127.0.0.1");
    assert_eq!(fields.candidate_type, crate::candidate::CandidateType::Host);

    let sdp = agent.generate_local_sdp();
    assert!(sdp.contains("a=ice-ufrag:"));
    assert!(sdp.contains(&format!("a={candidate}")));

    assert_eq!(
        agent.gather_candidates(stream_id),
        Err(Error::ErrGatheringAlreadyStarted)
    );
    Ok(())
}

#[test]
fn test_loopback_single_stream() -> Result<()> {
    let network = LoopbackNetwork::new();
    let mut agent = network.new_agent(&IceConfiguration::default())?;
    assert_eq!(agent.add_stream(2), None);
    assert_eq!(agent.add_stream(1), Some(1));
    assert_eq!(agent.add_stream(1), None);
    Ok(())
}

#[test]
fn test_loopback_port_range() -> Result<()> {
    let network = LoopbackNetwork::new();
    let mut agent = network.new_agent(&IceConfiguration::default())?;
    let stream_id = agent.add_stream(1).ok_or(Error::ErrAddStream)?;
    agent.set_port_range(stream_id, 1, 6000, 6000);
    agent.gather_candidates(stream_id)?;

    let candidate = local_candidate(&drain(&mut agent))?;
    assert_eq!(Candidate::new(&candidate, "").parse()?.port, 6000);

    // The only port in range is taken.
    let mut other = network.new_agent(&IceConfiguration::default())?;
    let stream_id = other.add_stream(1).ok_or(Error::ErrAddStream)?;
    other.set_port_range(stream_id, 1, 6000, 6000);
    assert!(other.gather_candidates(stream_id).is_err());
    Ok(())
}

#[test]
fn test_loopback_pair_exchanges_datagrams() -> Result<()> {
    init_logger();
    let network = LoopbackNetwork::new();
    let (mut a, a_stream) = new_gathered_agent(&network)?;
    let (mut b, b_stream) = new_gathered_agent(&network)?;

    drain(&mut a);
    let b_candidate = local_candidate(&drain(&mut b))?;

    assert!(a.send(a_stream, 1, b"early").is_err());

    assert!(a.add_remote_candidate(a_stream, 1, &Candidate::new(&b_candidate, "")));
    b.parse_remote_sdp(&a.generate_local_sdp())?;
    assert!(is_connected(&drain(&mut a)));
    assert!(is_connected(&drain(&mut b)));

    assert_eq!(a.send(a_stream, 1, b"ping")?, 4);
    assert_eq!(b.send(b_stream, 1, b"pong!")?, 5);

    let mut buf = [0u8; 16];
    assert_eq!(b.poll_read(&mut buf), Some(4));
    assert_eq!(&buf[..4], b"ping");
    assert_eq!(a.poll_read(&mut buf), Some(5));
    assert_eq!(&buf[..5], b"pong!");
    assert_eq!(a.poll_read(&mut buf), None);

    b.close()?;
    assert!(a.send(a_stream, 1, b"gone").is_err());
    Ok(())
}

#[test]
fn test_loopback_rejects_foreign_candidates() -> Result<()> {
    let network = LoopbackNetwork::new();
    let (mut agent, stream_id) = new_gathered_agent(&network)?;
    assert!(!agent.add_remote_candidate(
        stream_id,
        1,
        &Candidate::new("candidate:1 1 udp 1 192.168.0.10 5000 typ host", "")
    ));
    assert!(!agent.add_remote_candidate(stream_id, 1, &Candidate::new("candidate:x", "")));
    Ok(())
}

#[test]
fn test_loopback_unbinds_on_drop() -> Result<()> {
    let network = LoopbackNetwork::new();
    let (agent, _) = new_gathered_agent(&network)?;
    assert_eq!(network.bound_ports(), 1);
    drop(agent);
    assert_eq!(network.bound_ports(), 0);
    Ok(())
}

#[test]
fn test_loopback_wakes_receiver() -> Result<()> {
    let network = LoopbackNetwork::new();
    let wakes = Arc::new(AtomicUsize::new(0));

    let (mut a, a_stream) = new_gathered_agent(&network)?;
    let mut b = network.new_agent(&IceConfiguration::default())?;
    let counter = Arc::clone(&wakes);
    b.set_waker(AgentWaker::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let b_stream = b.add_stream(1).ok_or(Error::ErrAddStream)?;
    b.gather_candidates(b_stream)?;

    let b_candidate = local_candidate(&drain(&mut b))?;
    assert!(a.add_remote_candidate(a_stream, 1, &Candidate::new(&b_candidate, "")));
    assert!(is_connected(&drain(&mut a)));

    let before = wakes.load(Ordering::SeqCst);
    a.send(a_stream, 1, b"ping")?;
    assert_eq!(wakes.load(Ordering::SeqCst), before + 1);
    Ok(())
}

const UDP_WAIT: Duration = Duration::from_secs(5);

fn localhost_factory() -> UdpAgentFactory {
    UdpAgentFactory::new().with_host_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn new_udp_agent(
    factory: &UdpAgentFactory,
    waker: Option<AgentWaker>,
) -> Result<(Box<dyn Agent>, u32)> {
    let mut agent = factory.new_agent(&IceConfiguration::default())?;
    if let Some(waker) = waker {
        agent.set_waker(waker);
    }
    let stream_id = agent.add_stream(1).ok_or(Error::ErrAddStream)?;
    agent.set_stream_name(stream_id, "application");
    Ok((agent, stream_id))
}

/// Runs `handle_timeout` on `agent` and appends what it reported.
fn drive(agent: &mut Box<dyn Agent>, events: &mut Vec<AgentEvent>) -> Result<()> {
    agent.handle_timeout(Instant::now())?;
    events.extend(drain(agent));
    Ok(())
}

fn is_gathered(events: &[AgentEvent]) -> bool {
    events
        .iter()
        .any(|event| matches!(event, AgentEvent::GatheringDone { .. }))
}

fn local_candidates(events: &[AgentEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::NewCandidate { candidate, .. } => Some(candidate.clone()),
            _ => None,
        })
        .collect()
}

/// Answers the first binding request it receives with `mapped`, the way a
/// STUN server reports the address it saw.
fn spawn_stun_responder(mapped: SocketAddr) -> Result<SocketAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
    let address = socket.local_addr()?;
    thread::spawn(move || {
        let mut buf = [0u8; 1500];
        let Ok((n, from)) = socket.recv_from(&mut buf) else {
            return;
        };
        let mut request = Message {
            raw: vec![],
            ..Message::default()
        };
        request.raw.extend_from_slice(&buf[..n]);
        if request.decode().is_err() {
            return;
        }

        let mut response = Message::new();
        let built = response.build(&[
            Box::new(request),
            Box::new(BINDING_SUCCESS),
            Box::new(XorMappedAddress {
                ip: mapped.ip(),
                port: mapped.port(),
            }),
        ]);
        if built.is_ok() {
            let _ = socket.send_to(&response.raw, from);
        }
    });
    Ok(address)
}

#[test]
fn test_udp_pair_exchanges_datagrams() -> Result<()> {
    init_logger();
    let factory = localhost_factory();
    let wakes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&wakes);

    let (mut a, a_stream) = new_udp_agent(&factory, None)?;
    let (mut b, b_stream) = new_udp_agent(
        &factory,
        Some(AgentWaker::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    )?;
    a.gather_candidates(a_stream)?;
    b.gather_candidates(b_stream)?;

    let mut a_events = drain(&mut a);
    let mut b_events = drain(&mut b);
    let a_candidate = local_candidate(&a_events)?;
    let fields = Candidate::new(&a_candidate, "").parse()?;
    assert_eq!(fields.address, "127.0.0.1");
    assert_eq!(fields.candidate_type, crate::candidate::CandidateType::Host);
    assert!(is_gathered(&a_events));

    assert_eq!(a.send(a_stream, 1, b"early"), Err(Error::ErrNoValidatedPair));

    a.parse_remote_sdp(&b.generate_local_sdp())?;
    b.parse_remote_sdp(&a.generate_local_sdp())?;
    assert!(a.poll_timeout().is_some());

    let deadline = Instant::now() + UDP_WAIT;
    while !(is_connected(&a_events) && is_connected(&b_events)) && Instant::now() < deadline {
        drive(&mut a, &mut a_events)?;
        drive(&mut b, &mut b_events)?;
        thread::sleep(Duration::from_millis(5));
    }
    assert!(is_connected(&a_events));
    assert!(is_connected(&b_events));
    assert!(wakes.load(Ordering::SeqCst) > 0);

    assert_eq!(a.send(a_stream, 1, b"ping")?, 4);
    let mut buf = [0u8; 16];
    let deadline = Instant::now() + UDP_WAIT;
    let mut n = None;
    while n.is_none() && Instant::now() < deadline {
        drive(&mut b, &mut b_events)?;
        n = b.poll_read(&mut buf);
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(n, Some(4));
    assert_eq!(&buf[..4], b"ping");

    a.close()?;
    assert_eq!(a.send(a_stream, 1, b"gone"), Err(Error::ErrNoValidatedPair));
    Ok(())
}

#[test]
fn test_udp_server_reflexive_candidate() -> Result<()> {
    init_logger();
    let mapped: SocketAddr = "203.0.113.7:40000"
        .parse()
        .map_err(|_| Error::Other("bad address".to_owned()))?;
    let server = spawn_stun_responder(mapped)?;

    let (mut agent, stream_id) = new_udp_agent(&localhost_factory(), None)?;
    agent.set_stun_server(server);
    agent.gather_candidates(stream_id)?;

    let mut events = drain(&mut agent);
    let deadline = Instant::now() + UDP_WAIT;
    while !is_gathered(&events) && Instant::now() < deadline {
        drive(&mut agent, &mut events)?;
        thread::sleep(Duration::from_millis(5));
    }
    assert!(is_gathered(&events));

    let candidates = local_candidates(&events);
    assert_eq!(candidates.len(), 2);
    let srflx = Candidate::new(&candidates[1], "").parse()?;
    assert_eq!(
        srflx.candidate_type,
        crate::candidate::CandidateType::ServerReflexive
    );
    assert_eq!(srflx.address, "203.0.113.7");
    assert_eq!(srflx.port, 40000);
    assert_eq!(
        srflx.related_address.map(|related| related.address),
        Some("127.0.0.1".to_owned())
    );
    assert!(agent.generate_local_sdp().contains("typ srflx"));
    Ok(())
}

#[test]
fn test_udp_gathering_ends_when_stun_server_is_silent() -> Result<()> {
    let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;

    let (mut agent, stream_id) = new_udp_agent(&localhost_factory(), None)?;
    agent.set_stun_server(silent.local_addr()?);
    agent.gather_candidates(stream_id)?;

    let mut events = drain(&mut agent);
    assert!(!is_gathered(&events));
    let deadline = Instant::now() + UDP_WAIT;
    while !is_gathered(&events) && Instant::now() < deadline {
        drive(&mut agent, &mut events)?;
        thread::sleep(Duration::from_millis(20));
    }
    assert!(is_gathered(&events));
    assert_eq!(local_candidates(&events).len(), 1);
    assert_eq!(agent.poll_timeout(), None);
    Ok(())
}

#[test]
fn test_udp_port_range() -> Result<()> {
    let taken = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = taken.local_addr()?.port();

    let (mut agent, stream_id) = new_udp_agent(&localhost_factory(), None)?;
    agent.set_port_range(stream_id, 1, port, port);
    assert!(agent.gather_candidates(stream_id).is_err());

    drop(taken);
    agent.gather_candidates(stream_id)?;
    let candidate = local_candidate(&drain(&mut agent))?;
    assert_eq!(Candidate::new(&candidate, "").parse()?.port, port);
    Ok(())
}

#[test]
fn test_udp_remote_candidate_filtering() -> Result<()> {
    let (mut agent, stream_id) = new_udp_agent(&localhost_factory(), None)?;
    for (candidate, accepted) in [
        ("candidate:1 1 udp 2130706431 127.0.0.1 5000 typ host", true),
        ("candidate:1 1 tcp 2130706431 127.0.0.1 5000 typ host tcptype passive", false),
        ("candidate:1 1 udp 2130706431 ::1 5000 typ host", false),
        ("candidate:1 1 udp 2130706431 peer.local 5000 typ host", false),
        ("candidate:x", false),
    ] {
        assert_eq!(
            agent.add_remote_candidate(stream_id, 1, &Candidate::new(candidate, "")),
            accepted,
            "{candidate}"
        );
    }

    // Unusable candidates are skipped, missing credentials are not.
    agent.parse_remote_sdp(
        "a=ice-ufrag:remote\r\na=ice-pwd:remotepassword\r\na=candidate:1 1 tcp 1 127.0.0.1 9 typ host\r\n",
    )?;
    assert!(agent.parse_remote_sdp("a=ice-ufrag:only\r\n").is_ok());
    let (mut fresh, _) = new_udp_agent(&localhost_factory(), None)?;
    assert!(fresh.parse_remote_sdp("a=ice-ufrag:only\r\n").is_err());
    Ok(())
}

#[test]
fn test_ice_configuration_serde() -> Result<()> {
    let json = r#"{"servers":[{"hostname":"stun.l.google.com","service":"19302"}],"seed":42}"#;
    let config: IceConfiguration =
        serde_json::from_str(json).map_err(|err| Error::Other(err.to_string()))?;

    assert_eq!(config.servers.len(), 1);
    assert_eq!(config.servers[0].to_string(), "stun:stun.l.google.com:19302");
    assert_eq!(config.port_range_begin, 0);
    assert_eq!(config.seed, Some(42));
    assert_eq!(config.shuffle_seed(), 42);
    Ok(())
}
