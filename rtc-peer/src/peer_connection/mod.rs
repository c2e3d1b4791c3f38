
pub mod certificate;
pub mod configuration;
pub mod state;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use ice::{AgentFactory, Candidate, ConnectivityReadyObserver, IceTransport, LogSink};
use log::{debug, error, trace, warn};
use sdp::{Description, Role};
use shared::error::{Error, Result};
use shared::message::{Message, MessageObserver, MessageType, Reliability};

use crate::api::API;
use crate::data_channel::{DATA_CHANNEL_OPEN, DataChannel, DataChannelFactory};
use crate::transport::{
    DtlsTransport, DtlsTransportFactory, EncryptionReadyObserver, MultiplexReadyObserver,
    SctpTransport, SctpTransportFactory,
};
use certificate::{Certificate, DEFAULT_CERTIFICATE_NAME};
use configuration::RTCConfiguration;
use state::PeerConnectionState;

/// Media stream identification remote candidates are scoped to.
pub const DEFAULT_MID: &str = "0";

/// Stream ids are 16 bits; allocation stops below this value.
pub const MAX_STREAM_ID: u16 = 65535;

pub type OnLocalDescriptionHdlrFn = Box<dyn Fn(String) + Send + Sync>;
pub type OnLocalCandidateHdlrFn = Box<dyn Fn(Option<String>) + Send + Sync>;
pub type OnDataChannelHdlrFn = Box<dyn Fn(Arc<dyn DataChannel>) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_local_description: Option<Arc<dyn Fn(String) + Send + Sync>>,
    on_local_candidate: Option<Arc<dyn Fn(Option<String>) + Send + Sync>>,
    on_data_channel: Option<Arc<dyn Fn(Arc<dyn DataChannel>) + Send + Sync>>,
}

struct PeerConnectionInternal {
    state: PeerConnectionState,
    sctp_port: u16,
    remote_fingerprint: Option<String>,

    ice_transport: Option<Arc<IceTransport>>,
    dtls_transport: Option<Arc<dyn DtlsTransport>>,
    sctp_transport: Option<Arc<dyn SctpTransport>>,

    // A layer may report readiness from inside its factory, before the
    // handle is stored; the continuation then runs once the handle is in place.
    dtls_ready_pending: bool,
    sctp_ready_pending: bool,

    data_channels: HashMap<u16, Arc<dyn DataChannel>>,
}

/// Remote parameters a description stored, so that a description the
/// transport rejects can be taken back.
struct RemoteUndo {
    created: bool,
    fingerprint_added: bool,
    sctp_port: u16,
}

impl PeerConnectionInternal {
    fn check_remote_fingerprint(&self, description: &Description) -> Result<()> {
        match (&self.remote_fingerprint, description.fingerprint()) {
            (Some(existing), Some(fingerprint)) if existing != fingerprint => {
                Err(Error::ErrConflictingRemoteDescription)
            }
            _ => Ok(()),
        }
    }

    fn store_remote_parameters(&mut self, description: &Description) -> Result<RemoteUndo> {
        self.check_remote_fingerprint(description)?;

        let mut undo = RemoteUndo {
            created: false,
            fingerprint_added: false,
            sctp_port: self.sctp_port,
        };
        if self.remote_fingerprint.is_none() {
            if let Some(fingerprint) = description.fingerprint() {
                self.remote_fingerprint = Some(fingerprint.to_owned());
                undo.fingerprint_added = true;
            }
        }
        if let Some(sctp_port) = description.sctp_port() {
            self.sctp_port = sctp_port;
        }
        Ok(undo)
    }
}

/// PeerConnection drives the ICE, DTLS and SCTP cascade between two peers,
/// exchanges session descriptions with the signaling layer, and maps SCTP
/// streams to data channels.
///
/// Callbacks registered with `on_*` may be invoked from the ICE transport's
/// event loop thread. None of them is invoked with an internal lock held, so
/// they may call back into the PeerConnection.
pub struct PeerConnection {
    configuration: RTCConfiguration,
    certificate: Certificate,
    mid: String,

    agent_factory: Arc<dyn AgentFactory>,
    dtls_transport_factory: Arc<dyn DtlsTransportFactory>,
    sctp_transport_factory: Arc<dyn SctpTransportFactory>,
    data_channel_factory: Arc<dyn DataChannelFactory>,
    log_sink: Arc<dyn LogSink>,

    internal: Mutex<PeerConnectionInternal>,
    handlers: Mutex<Handlers>,
    weak_self: Weak<PeerConnection>,
}

impl PeerConnection {
    pub(crate) fn new(api: &API, configuration: RTCConfiguration) -> Result<Arc<Self>> {
        let certificate = match &configuration.certificate {
            Some(certificate) => certificate.clone(),
            None => Certificate::generate(DEFAULT_CERTIFICATE_NAME)?,
        };
        let sctp_port = configuration.sctp_port;

        Ok(Arc::new_cyclic(|weak_self| PeerConnection {
            configuration,
            certificate,
            mid: DEFAULT_MID.to_owned(),
            agent_factory: Arc::clone(&api.agent_factory),
            dtls_transport_factory: Arc::clone(&api.dtls_transport_factory),
            sctp_transport_factory: Arc::clone(&api.sctp_transport_factory),
            data_channel_factory: Arc::clone(&api.data_channel_factory),
            log_sink: Arc::clone(&api.log_sink),
            internal: Mutex::new(PeerConnectionInternal {
                state: PeerConnectionState::Idle,
                sctp_port,
                remote_fingerprint: None,
                ice_transport: None,
                dtls_transport: None,
                sctp_transport: None,
                dtls_ready_pending: false,
                sctp_ready_pending: false,
                data_channels: HashMap::new(),
            }),
            handlers: Mutex::new(Handlers::default()),
            weak_self: weak_self.clone(),
        }))
    }

    pub fn config(&self) -> &RTCConfiguration {
        &self.configuration
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn state(&self) -> PeerConnectionState {
        self.internal().state
    }

    /// Local role, once the ICE transport exists.
    pub fn role(&self) -> Option<Role> {
        let ice_transport = self.internal().ice_transport.clone();
        ice_transport.map(|t| t.role())
    }

    pub fn data_channel(&self, stream: u16) -> Option<Arc<dyn DataChannel>> {
        self.internal().data_channels.get(&stream).cloned()
    }

    /// Applies the remote description. The first call builds the ICE
    /// transport in the `actpass` role, emits the local description and
    /// starts gathering; later calls are only forwarded to the transport.
    ///
    /// A description the transport rejects leaves the connection as it was:
    /// a connection still `Idle` stays `Idle` and keeps no remote parameters.
    pub fn set_remote_description(&self, description: &str) -> Result<()> {
        let description = Description::new(Role::ActPass, description)?;

        let mut fresh: Option<Arc<IceTransport>> = None;
        let (ice_transport, undo) = loop {
            {
                let mut internal = self.internal.lock()?;
                if let Some(current) = internal.ice_transport.clone() {
                    let undo = internal.store_remote_parameters(&description)?;
                    break (current, undo);
                }
                if let Some(created) = &fresh {
                    let mut undo = internal.store_remote_parameters(&description)?;
                    undo.created = true;
                    internal.ice_transport = Some(Arc::clone(created));
                    internal.state = PeerConnectionState::AwaitingConnectivity;
                    break (Arc::clone(created), undo);
                }
                internal.check_remote_fingerprint(&description)?;
            }
            // Built outside the lock: resolving STUN servers may block.
            fresh = Some(self.new_ice_transport(Role::ActPass)?);
        };
        // Released outside the lock, including a transport that lost the race
        // to a concurrent call.
        drop(fresh);

        let applied = ice_transport
            .set_remote_description(&description)
            .and_then(|()| {
                if undo.created {
                    self.start_ice_transport(&ice_transport)
                } else {
                    Ok(())
                }
            });
        if let Err(err) = applied {
            warn!("remote description not applied: {err}");
            self.undo_remote_description(&ice_transport, undo);
            return Err(err);
        }
        Ok(())
    }

    /// Forwards a remote candidate to the ICE transport. Returns false if
    /// there is no transport yet or the candidate is rejected.
    pub fn set_remote_candidate(&self, candidate: &str) -> bool {
        let ice_transport = self.internal().ice_transport.clone();
        match ice_transport {
            Some(ice_transport) => {
                ice_transport.add_remote_candidate(&Candidate::new(candidate, &self.mid))
            }
            None => {
                debug!("ignoring remote candidate received before any description");
                false
            }
        }
    }

    /// Creates a data channel on the first free stream id of the local
    /// parity. Without a transport the connection initiates: the ICE
    /// transport is built in the `active` role and the local description is
    /// emitted. The channel opens once the cascade completes.
    ///
    /// If the transport cannot be started the channel is released and the
    /// connection returns to `Idle`.
    pub fn create_data_channel(
        &self,
        label: &str,
        protocol: &str,
        reliability: Reliability,
    ) -> Result<Arc<dyn DataChannel>> {
        loop {
            {
                let mut internal = self.internal.lock()?;
                if let Some(ice_transport) = internal.ice_transport.clone() {
                    let channel = self.register_data_channel(
                        &mut internal,
                        ice_transport.role(),
                        label,
                        protocol,
                        reliability,
                    )?;
                    let open_now = match &internal.sctp_transport {
                        Some(sctp_transport)
                            if internal.state == PeerConnectionState::Operational
                                && sctp_transport.is_ready() =>
                        {
                            Some(Arc::clone(sctp_transport))
                        }
                        _ => None,
                    };
                    drop(internal);

                    if let Some(sctp_transport) = open_now {
                        channel.open(sctp_transport);
                    }
                    return Ok(channel);
                }
            }

            // Built outside the lock: resolving STUN servers may block.
            let ice_transport = self.new_ice_transport(Role::Active)?;
            let registered = {
                let mut internal = self.internal.lock()?;
                if internal.ice_transport.is_some() {
                    None
                } else {
                    let channel = self.register_data_channel(
                        &mut internal,
                        Role::Active,
                        label,
                        protocol,
                        reliability.clone(),
                    );
                    if channel.is_ok() {
                        internal.ice_transport = Some(Arc::clone(&ice_transport));
                        internal.state = PeerConnectionState::AwaitingConnectivity;
                    }
                    Some(channel)
                }
            };
            // A concurrent call installed its transport first; use that one.
            let Some(channel) = registered else {
                continue;
            };
            let channel = channel?;

            if let Err(err) = self.start_ice_transport(&ice_transport) {
                warn!("failed to start ICE transport: {err}");
                self.abandon_ice_transport(&ice_transport, Some(channel.stream()));
                return Err(err);
            }
            return Ok(channel);
        }
    }

    /// Sets the handler for data channels opened by the remote peer.
    /// The last registration wins.
    pub fn on_data_channel(&self, f: OnDataChannelHdlrFn) {
        self.handlers().on_data_channel = Some(Arc::from(f));
    }

    /// Sets the handler receiving the local description. It is emitted when
    /// the ICE transport is created, so once unless starting the transport
    /// failed and returned the connection to `Idle`. The last registration wins.
    pub fn on_local_description(&self, f: OnLocalDescriptionHdlrFn) {
        self.handlers().on_local_description = Some(Arc::from(f));
    }

    /// Sets the handler receiving local candidates, `None` marking the end of
    /// gathering. The last registration wins.
    pub fn on_local_candidate(&self, f: OnLocalCandidateHdlrFn) {
        self.handlers().on_local_candidate = Some(Arc::from(f));
    }

    fn internal(&self) -> MutexGuard<'_, PeerConnectionInternal> {
        self.internal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_ice_transport(&self, role: Role) -> Result<Arc<IceTransport>> {
        let observer: Weak<dyn ConnectivityReadyObserver> = self.weak_self.clone();
        IceTransport::new(
            &self.configuration.ice,
            role,
            self.agent_factory.as_ref(),
            observer,
            Arc::clone(&self.log_sink),
        )
    }

    fn register_data_channel(
        &self,
        internal: &mut PeerConnectionInternal,
        role: Role,
        label: &str,
        protocol: &str,
        reliability: Reliability,
    ) -> Result<Arc<dyn DataChannel>> {
        let stream = allocate_stream_id(&internal.data_channels, role)?;
        let channel =
            self.data_channel_factory
                .new_data_channel(stream, label, protocol, reliability)?;
        internal.data_channels.insert(stream, Arc::clone(&channel));
        debug!("data channel {label:?} registered on stream {stream}");
        Ok(channel)
    }

    fn start_ice_transport(&self, ice_transport: &IceTransport) -> Result<()> {
        self.trigger_local_description(ice_transport)?;
        ice_transport.gather_local_candidates()
    }

    fn undo_remote_description(&self, ice_transport: &Arc<IceTransport>, undo: RemoteUndo) {
        {
            let mut internal = self.internal();
            if undo.fingerprint_added {
                internal.remote_fingerprint = None;
            }
            internal.sctp_port = undo.sctp_port;
        }
        if undo.created {
            self.abandon_ice_transport(ice_transport, None);
        }
    }

    /// Returns to `Idle` if `ice_transport` is still the installed one,
    /// dropping the channel registered alongside it.
    fn abandon_ice_transport(&self, ice_transport: &Arc<IceTransport>, stream: Option<u16>) {
        let abandoned = {
            let mut internal = self.internal();
            if let Some(stream) = stream {
                internal.data_channels.remove(&stream);
            }
            let installed = internal
                .ice_transport
                .as_ref()
                .is_some_and(|t| Arc::ptr_eq(t, ice_transport));
            if installed {
                internal.state = PeerConnectionState::Idle;
                internal.ice_transport.take()
            } else {
                None
            }
        };
        // Dropped outside the lock: closing joins the event loop.
        drop(abandoned);
    }

    fn trigger_local_description(&self, ice_transport: &IceTransport) -> Result<()> {
        let Some(handler) = self.handlers().on_local_description.clone() else {
            return Ok(());
        };

        let mut description = ice_transport.local_description()?;
        description.set_fingerprint(self.certificate.fingerprint().to_owned());
        description.set_sctp_port(self.internal().sctp_port);

        handler(description.to_string());
        Ok(())
    }

    fn trigger_data_channel(&self, channel: Arc<dyn DataChannel>) {
        let handler = self.handlers().on_data_channel.clone();
        if let Some(handler) = handler {
            handler(channel);
        }
    }

    fn init_dtls_transport(&self) {
        let ice_transport = {
            let mut internal = self.internal();
            if internal.state != PeerConnectionState::AwaitingConnectivity {
                return;
            }
            let Some(ice_transport) = internal.ice_transport.clone() else {
                return;
            };
            internal.state = PeerConnectionState::AwaitingEncryption;
            ice_transport
        };

        let observer: Weak<dyn EncryptionReadyObserver> = self.weak_self.clone();
        let dtls_transport = match self.dtls_transport_factory.new_dtls_transport(
            ice_transport,
            &self.certificate,
            observer,
        ) {
            Ok(dtls_transport) => dtls_transport,
            Err(err) => {
                error!("failed to create DTLS transport: {err}");
                return;
            }
        };

        let ready = {
            let mut internal = self.internal();
            internal.dtls_transport = Some(dtls_transport);
            std::mem::take(&mut internal.dtls_ready_pending)
        };
        if ready {
            self.init_sctp_transport();
        }
    }

    fn init_sctp_transport(&self) {
        let (dtls_transport, sctp_port) = {
            let mut internal = self.internal();
            if internal.state != PeerConnectionState::AwaitingEncryption {
                return;
            }
            let Some(dtls_transport) = internal.dtls_transport.clone() else {
                return;
            };
            internal.state = PeerConnectionState::AwaitingMultiplexing;
            (dtls_transport, internal.sctp_port)
        };

        let observer: Weak<dyn MultiplexReadyObserver> = self.weak_self.clone();
        let receiver: Weak<dyn MessageObserver> = self.weak_self.clone();
        let sctp_transport = match self.sctp_transport_factory.new_sctp_transport(
            dtls_transport,
            sctp_port,
            observer,
            receiver,
        ) {
            Ok(sctp_transport) => sctp_transport,
            Err(err) => {
                error!("failed to create SCTP transport: {err}");
                return;
            }
        };

        let ready = {
            let mut internal = self.internal();
            internal.sctp_transport = Some(sctp_transport);
            std::mem::take(&mut internal.sctp_ready_pending)
        };
        if ready {
            self.open_data_channels();
        }
    }

    fn open_data_channels(&self) {
        let (sctp_transport, channels) = {
            let mut internal = self.internal();
            if internal.state != PeerConnectionState::AwaitingMultiplexing {
                return;
            }
            let Some(sctp_transport) = internal.sctp_transport.clone() else {
                return;
            };
            internal.state = PeerConnectionState::Operational;
            let channels: Vec<Arc<dyn DataChannel>> =
                internal.data_channels.values().cloned().collect();
            (sctp_transport, channels)
        };

        debug!("cascade complete, opening {} data channels", channels.len());
        for channel in channels {
            channel.open(Arc::clone(&sctp_transport));
        }
    }

    fn forward_message(&self, message: Message) {
        let stream = message.stream;

        let mut internal = self.internal();
        let existing = internal.data_channels.get(&stream).cloned();
        if let Some(channel) = existing {
            drop(internal);
            channel.incoming(message);
            return;
        }

        let (Some(ice_transport), Some(sctp_transport)) = (
            internal.ice_transport.clone(),
            internal.sctp_transport.clone(),
        ) else {
            warn!("dropping message on stream {stream}, no transport");
            return;
        };

        let remote_parity = ice_transport.role().remote_stream_parity();
        let is_open = message.message_type == MessageType::Control
            && message.first_byte() == Some(DATA_CHANNEL_OPEN)
            && stream % 2 == remote_parity;
        if !is_open {
            drop(internal);
            warn!(
                "resetting stream {stream}: unexpected {:?} message for an unknown channel",
                message.message_type
            );
            sctp_transport.reset(stream);
            return;
        }

        let channel = match self
            .data_channel_factory
            .accept_data_channel(stream, Arc::clone(&sctp_transport))
        {
            Ok(channel) => channel,
            Err(err) => {
                drop(internal);
                warn!("resetting stream {stream}: unable to accept data channel: {err}");
                sctp_transport.reset(stream);
                return;
            }
        };
        internal.data_channels.insert(stream, Arc::clone(&channel));
        drop(internal);
        trace!("remote peer opened stream {stream}");

        let peer_connection = self.weak_self.clone();
        let weak_channel = Arc::downgrade(&channel);
        channel.on_open(Box::new(move || {
            if let (Some(pc), Some(channel)) = (peer_connection.upgrade(), weak_channel.upgrade())
            {
                pc.trigger_data_channel(channel);
            }
        }));

        channel.incoming(message);
    }
}

impl ConnectivityReadyObserver for PeerConnection {
    fn on_local_candidate(&self, candidate: Option<Candidate>) {
        let handler = self.handlers().on_local_candidate.clone();
        if let Some(handler) = handler {
            handler(candidate.map(|c| c.candidate().to_owned()));
        }
    }

    fn on_connectivity_ready(&self) {
        self.init_dtls_transport();
    }
}

impl EncryptionReadyObserver for PeerConnection {
    fn verify_fingerprint(&self, fingerprint: &str) -> bool {
        self.internal().remote_fingerprint.as_deref() == Some(fingerprint)
    }

    fn on_encryption_ready(&self) {
        {
            let mut internal = self.internal();
            if internal.state != PeerConnectionState::AwaitingEncryption {
                return;
            }
            if internal.dtls_transport.is_none() {
                internal.dtls_ready_pending = true;
                return;
            }
        }
        self.init_sctp_transport();
    }
}

impl MultiplexReadyObserver for PeerConnection {
    fn on_multiplex_ready(&self) {
        {
            let mut internal = self.internal();
            if internal.state != PeerConnectionState::AwaitingMultiplexing {
                return;
            }
            if internal.sctp_transport.is_none() {
                internal.sctp_ready_pending = true;
                return;
            }
        }
        self.open_data_channels();
    }
}

impl MessageObserver for PeerConnection {
    fn on_message(&self, message: Message) {
        self.forward_message(message);
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        let internal = self
            .internal
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        internal.data_channels.clear();
        drop(internal.sctp_transport.take());
        drop(internal.dtls_transport.take());
        drop(internal.ice_transport.take());
    }
}

/// Returns the first stream id of `role`'s parity not in `channels`.
/// <https://tools.ietf.org/html/draft-ietf-rtcweb-data-protocol-09#section-6>
pub(crate) fn allocate_stream_id<T>(channels: &HashMap<u16, T>, role: Role) -> Result<u16> {
    let mut stream = u32::from(role.stream_parity());
    while channels.contains_key(&(stream as u16)) {
        stream += 2;
        if stream >= u32::from(MAX_STREAM_ID) {
            return Err(Error::ErrMaxDataChannels);
        }
    }
    Ok(stream as u16)
}
