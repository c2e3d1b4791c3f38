//! In-memory DTLS, SCTP and data channel collaborators. The DTLS mock only
//! exchanges certificate fingerprints; the SCTP mock frames each message as
//! `[stream: u16 BE][type: u8][payload]`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use ice::{Agent, AgentFactory, IceConfiguration, IceTransport, LoopbackNetwork};
use shared::error::{Error, Result};
use shared::message::{Message, MessageObserver, MessageType, Reliability};

use crate::data_channel::{
    DATA_CHANNEL_ACK, DATA_CHANNEL_OPEN, DataChannel, DataChannelFactory, OnOpenHdlrFn,
};
use crate::peer_connection::certificate::Certificate;
use crate::transport::{
    DtlsTransport, DtlsTransportFactory, EncryptionReadyObserver, MultiplexReadyObserver,
    SctpTransport, SctpTransportFactory,
};

const TAG_HELLO: u8 = 0;
const TAG_DATA: u8 = 1;

pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// Polls `condition` until it holds or `WAIT` elapses.
pub(crate) fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub(crate) fn recv<T>(rx: &Receiver<T>) -> Result<T> {
    rx.recv_timeout(WAIT)
        .map_err(|err| Error::Other(err.to_string()))
}

/// Builds loopback agents, but only after announcing each request and
/// waiting for the test to open the gate.
pub(crate) struct GatedAgentFactory {
    inner: LoopbackNetwork,
    entered: Mutex<Sender<()>>,
    gate: Mutex<Receiver<()>>,
}

impl GatedAgentFactory {
    /// Returns the factory, the receiver announcing requests and the sender
    /// opening the gate once per request.
    pub(crate) fn new(inner: LoopbackNetwork) -> (Self, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        let factory = GatedAgentFactory {
            inner,
            entered: Mutex::new(entered_tx),
            gate: Mutex::new(gate_rx),
        };
        (factory, entered_rx, gate_tx)
    }
}

impl AgentFactory for GatedAgentFactory {
    fn new_agent(&self, config: &IceConfiguration) -> Result<Box<dyn Agent>> {
        let _ = self.entered.lock().unwrap().send(());
        let _ = self.gate.lock().unwrap().recv_timeout(WAIT);
        self.inner.new_agent(config)
    }
}

#[derive(Default)]
struct DtlsState {
    handshaken: bool,
    rejected: bool,
    receiver: Option<Weak<dyn MessageObserver>>,
}

pub(crate) struct MockDtlsTransport {
    lower: Arc<IceTransport>,
    fingerprint: String,
    observer: Weak<dyn EncryptionReadyObserver>,
    state: Mutex<DtlsState>,
}

impl MockDtlsTransport {
    fn send_hello(&self) {
        let mut hello = BytesMut::with_capacity(1 + self.fingerprint.len());
        hello.put_u8(TAG_HELLO);
        hello.put_slice(self.fingerprint.as_bytes());
        self.lower.send(Message::new(MessageType::Binary, 0, hello.freeze()));
    }

    pub(crate) fn is_rejected(&self) -> bool {
        self.state.lock().unwrap().rejected
    }

    fn handle_hello(&self, fingerprint: &str) {
        {
            let state = self.state.lock().unwrap();
            if state.handshaken || state.rejected {
                return;
            }
        }
        let Some(observer) = self.observer.upgrade() else {
            return;
        };

        if !observer.verify_fingerprint(fingerprint) {
            self.state.lock().unwrap().rejected = true;
            return;
        }

        self.state.lock().unwrap().handshaken = true;
        self.send_hello();
        observer.on_encryption_ready();
    }
}

impl MessageObserver for MockDtlsTransport {
    fn on_message(&self, message: Message) {
        match message.first_byte() {
            Some(TAG_HELLO) => {
                let fingerprint = String::from_utf8_lossy(&message.payload[1..]).into_owned();
                self.handle_hello(&fingerprint);
            }
            Some(TAG_DATA) => {
                let receiver = {
                    let state = self.state.lock().unwrap();
                    if !state.handshaken {
                        return;
                    }
                    state.receiver.as_ref().and_then(Weak::upgrade)
                };
                if let Some(receiver) = receiver {
                    receiver.on_message(Message::from_slice(&message.payload[1..]));
                }
            }
            _ => {}
        }
    }
}

impl DtlsTransport for MockDtlsTransport {
    fn send(&self, message: Message) -> bool {
        if !self.state.lock().unwrap().handshaken {
            return false;
        }
        let mut record = BytesMut::with_capacity(1 + message.len());
        record.put_u8(TAG_DATA);
        record.put_slice(&message.payload);
        self.lower
            .send(Message::new(MessageType::Binary, 0, record.freeze()))
    }

    fn on_message(&self, receiver: Weak<dyn MessageObserver>) {
        self.state.lock().unwrap().receiver = Some(receiver);
    }
}

/// Factories only keep weak records so dropping a peer connection releases
/// its transports.
fn live<T>(records: &Mutex<Vec<Weak<T>>>) -> Vec<Arc<T>> {
    records
        .lock()
        .unwrap()
        .iter()
        .filter_map(Weak::upgrade)
        .collect()
}

#[derive(Default)]
pub(crate) struct MockDtlsFactory {
    created: Mutex<Vec<Weak<MockDtlsTransport>>>,
}

impl MockDtlsFactory {
    pub(crate) fn created(&self) -> Vec<Arc<MockDtlsTransport>> {
        live(&self.created)
    }
}

impl DtlsTransportFactory for MockDtlsFactory {
    fn new_dtls_transport(
        &self,
        lower: Arc<IceTransport>,
        certificate: &Certificate,
        observer: Weak<dyn EncryptionReadyObserver>,
    ) -> Result<Arc<dyn DtlsTransport>> {
        let transport = Arc::new(MockDtlsTransport {
            lower,
            fingerprint: certificate.fingerprint().to_owned(),
            observer,
            state: Mutex::new(DtlsState::default()),
        });
        let receiver: Weak<MockDtlsTransport> = Arc::downgrade(&transport);
        transport.lower.on_message(receiver);
        transport.send_hello();

        self.created.lock().unwrap().push(Arc::downgrade(&transport));
        Ok(transport)
    }
}

fn type_to_u8(message_type: MessageType) -> u8 {
    match message_type {
        MessageType::Binary => 0,
        MessageType::String => 1,
        MessageType::Control => 2,
        MessageType::Reset => 3,
    }
}

fn type_from_u8(v: u8) -> MessageType {
    match v {
        1 => MessageType::String,
        2 => MessageType::Control,
        3 => MessageType::Reset,
        _ => MessageType::Binary,
    }
}

pub(crate) struct MockSctpTransport {
    lower: Arc<dyn DtlsTransport>,
    pub(crate) port: u16,
    receiver: Weak<dyn MessageObserver>,
    ready: AtomicBool,
    pub(crate) resets: Mutex<Vec<u16>>,
}

impl MessageObserver for MockSctpTransport {
    fn on_message(&self, message: Message) {
        if message.len() < 3 {
            return;
        }
        let stream = u16::from_be_bytes([message.payload[0], message.payload[1]]);
        let message_type = type_from_u8(message.payload[2]);
        if let Some(receiver) = self.receiver.upgrade() {
            receiver.on_message(Message::new(
                message_type,
                stream,
                message.payload.slice(3..),
            ));
        }
    }
}

impl SctpTransport for MockSctpTransport {
    fn send(&self, message: Message) -> bool {
        let mut frame = BytesMut::with_capacity(3 + message.len());
        frame.put_u16(message.stream);
        frame.put_u8(type_to_u8(message.message_type));
        frame.put_slice(&message.payload);
        self.lower.send(Message::from_slice(&frame))
    }

    fn reset(&self, stream: u16) {
        self.resets.lock().unwrap().push(stream);
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct MockSctpFactory {
    created: Mutex<Vec<Weak<MockSctpTransport>>>,
}

impl MockSctpFactory {
    pub(crate) fn created(&self) -> Vec<Arc<MockSctpTransport>> {
        live(&self.created)
    }
}

impl SctpTransportFactory for MockSctpFactory {
    fn new_sctp_transport(
        &self,
        lower: Arc<dyn DtlsTransport>,
        port: u16,
        observer: Weak<dyn MultiplexReadyObserver>,
        receiver: Weak<dyn MessageObserver>,
    ) -> Result<Arc<dyn SctpTransport>> {
        let transport = Arc::new(MockSctpTransport {
            lower,
            port,
            receiver,
            ready: AtomicBool::new(false),
            resets: Mutex::new(vec![]),
        });
        let dtls_receiver: Weak<MockSctpTransport> = Arc::downgrade(&transport);
        transport.lower.on_message(dtls_receiver);
        self.created.lock().unwrap().push(Arc::downgrade(&transport));

        // Reports readiness before the caller has stored the handle.
        transport.ready.store(true, Ordering::SeqCst);
        if let Some(observer) = observer.upgrade() {
            observer.on_multiplex_ready();
        }
        Ok(transport)
    }
}

/// SCTP transport that only records what it is asked to do.
#[derive(Default)]
pub(crate) struct RecordingSctpTransport {
    pub(crate) sent: Mutex<Vec<Message>>,
    pub(crate) resets: Mutex<Vec<u16>>,
}

impl SctpTransport for RecordingSctpTransport {
    fn send(&self, message: Message) -> bool {
        self.sent.lock().unwrap().push(message);
        true
    }

    fn reset(&self, stream: u16) {
        self.resets.lock().unwrap().push(stream);
    }

    fn is_ready(&self) -> bool {
        true
    }
}

pub(crate) struct MockDataChannel {
    stream: u16,
    label: Mutex<String>,
    protocol: String,
    pub(crate) reliability: Reliability,
    transport: Mutex<Option<Arc<dyn SctpTransport>>>,
    open: AtomicBool,
    pub(crate) open_calls: AtomicUsize,
    on_open: Mutex<Option<OnOpenHdlrFn>>,
    pub(crate) received: Mutex<Vec<Message>>,
}

impl MockDataChannel {
    fn new(
        stream: u16,
        label: &str,
        protocol: &str,
        reliability: Reliability,
        transport: Option<Arc<dyn SctpTransport>>,
    ) -> Self {
        MockDataChannel {
            stream,
            label: Mutex::new(label.to_owned()),
            protocol: protocol.to_owned(),
            reliability,
            transport: Mutex::new(transport),
            open: AtomicBool::new(false),
            open_calls: AtomicUsize::new(0),
            on_open: Mutex::new(None),
            received: Mutex::new(vec![]),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_control(&self, payload: Bytes) -> bool {
        let transport = self.transport.lock().unwrap().clone();
        match transport {
            Some(transport) => {
                transport.send(Message::new(MessageType::Control, self.stream, payload))
            }
            None => false,
        }
    }

    fn set_open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            if let Some(f) = &*self.on_open.lock().unwrap() {
                f();
            }
        }
    }
}

impl DataChannel for MockDataChannel {
    fn stream(&self) -> u16 {
        self.stream
    }

    fn label(&self) -> String {
        self.label.lock().unwrap().clone()
    }

    fn protocol(&self) -> String {
        self.protocol.clone()
    }

    fn open(&self, transport: Arc<dyn SctpTransport>) {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut current = self.transport.lock().unwrap();
            if current.is_some() {
                return;
            }
            *current = Some(transport);
        }

        let mut open = BytesMut::new();
        open.put_u8(DATA_CHANNEL_OPEN);
        open.put_slice(self.label().as_bytes());
        self.send_control(open.freeze());
    }

    fn on_open(&self, f: OnOpenHdlrFn) {
        *self.on_open.lock().unwrap() = Some(f);
    }

    fn incoming(&self, message: Message) {
        self.received.lock().unwrap().push(message.clone());
        if message.message_type != MessageType::Control {
            return;
        }
        match message.first_byte() {
            Some(DATA_CHANNEL_OPEN) => {
                *self.label.lock().unwrap() =
                    String::from_utf8_lossy(&message.payload[1..]).into_owned();
                self.send_control(Bytes::from_static(&[DATA_CHANNEL_ACK]));
                self.set_open();
            }
            Some(DATA_CHANNEL_ACK) => self.set_open(),
            _ => {}
        }
    }

    fn send(&self, message: Message) -> bool {
        if !self.is_open() {
            return false;
        }
        let transport = self.transport.lock().unwrap().clone();
        match transport {
            Some(transport) => transport.send(Message {
                stream: self.stream,
                ..message
            }),
            None => false,
        }
    }
}

#[derive(Default)]
pub(crate) struct MockDataChannelFactory {
    created: Mutex<Vec<Weak<MockDataChannel>>>,
    accepted: Mutex<Vec<Weak<MockDataChannel>>>,
}

impl MockDataChannelFactory {
    pub(crate) fn created(&self, stream: u16) -> Option<Arc<MockDataChannel>> {
        live(&self.created).into_iter().find(|c| c.stream == stream)
    }

    pub(crate) fn accepted(&self, stream: u16) -> Option<Arc<MockDataChannel>> {
        live(&self.accepted).into_iter().find(|c| c.stream == stream)
    }

    pub(crate) fn accepted_count(&self) -> usize {
        live(&self.accepted).len()
    }
}

impl DataChannelFactory for MockDataChannelFactory {
    fn new_data_channel(
        &self,
        stream: u16,
        label: &str,
        protocol: &str,
        reliability: Reliability,
    ) -> Result<Arc<dyn DataChannel>> {
        let channel = Arc::new(MockDataChannel::new(
            stream,
            label,
            protocol,
            reliability,
            None,
        ));
        self.created.lock().unwrap().push(Arc::downgrade(&channel));
        Ok(channel)
    }

    fn accept_data_channel(
        &self,
        stream: u16,
        transport: Arc<dyn SctpTransport>,
    ) -> Result<Arc<dyn DataChannel>> {
        let channel = Arc::new(MockDataChannel::new(
            stream,
            "",
            "",
            Reliability::default(),
            Some(transport),
        ));
        self.accepted.lock().unwrap().push(Arc::downgrade(&channel));
        Ok(channel)
    }
}
