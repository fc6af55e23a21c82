//! In-memory peer-connection capability for driving the session layer in tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use voxbridge_common::{BridgeConfig, SessionId};
use voxbridge_peer::{
    AudioRouter, BridgeEvent, ChannelFanout, ChannelId, ChannelOptions, ConnectionError,
    ConnectionObserver, ConnectionResult, ConnectionState, DataChannel, IceCandidate,
    PeerConnection, PeerConnector, SdpType, SessionDescription, SessionRegistry,
    SignalingCoordinator,
};

pub const MOCK_OFFER: &str = "v=0 mock-offer";
pub const MOCK_ANSWER: &str = "v=0 mock-answer";

#[derive(Default)]
pub struct MockConnector {
    connections: Mutex<HashMap<SessionId, Arc<MockConnection>>>,
    /// Refuse to create connections.
    pub fail_connect: AtomicBool,
    /// Connections created from now on fail every negotiation call.
    pub fail_negotiation: AtomicBool,
}

impl MockConnector {
    pub fn connection(&self, session: SessionId) -> Arc<MockConnection> {
        self.connections
            .lock()
            .get(&session)
            .cloned()
            .unwrap_or_else(|| panic!("no connection for session {session}"))
    }

    pub fn connect_count(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        session: SessionId,
        _ice_servers: &[String],
        observer: Arc<dyn ConnectionObserver>,
    ) -> ConnectionResult<Arc<dyn PeerConnection>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ConnectionError::new("connector unavailable"));
        }
        let connection = Arc::new(MockConnection {
            session,
            observer,
            fail: AtomicBool::new(self.fail_negotiation.load(Ordering::SeqCst)),
            closed: AtomicBool::new(false),
            remote: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
        });
        self.connections
            .lock()
            .insert(session, Arc::clone(&connection));
        Ok(connection as Arc<dyn PeerConnection>)
    }
}

pub struct MockConnection {
    session: SessionId,
    observer: Arc<dyn ConnectionObserver>,
    pub fail: AtomicBool,
    pub closed: AtomicBool,
    pub remote: Mutex<Vec<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    pub channels: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockConnection {
    fn check(&self) -> ConnectionResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(ConnectionError::new("mock transport failure"))
        } else {
            Ok(())
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.observer.on_state_change(self.session, state);
    }

    /// The browser opens a channel of its own.
    pub fn open_remote_channel(&self, label: &str) -> Arc<MockChannel> {
        let channel = Arc::new(MockChannel::new(label, true));
        self.channels.lock().push(Arc::clone(&channel));
        self.observer
            .on_channel_open(self.session, Arc::clone(&channel) as Arc<dyn DataChannel>);
        channel
    }

    /// Mark every local channel open and report it.
    pub fn open_local_channels(&self) {
        let channels: Vec<Arc<MockChannel>> = self.channels.lock().clone();
        for channel in channels {
            channel.open.store(true, Ordering::SeqCst);
            self.observer
                .on_channel_open(self.session, channel as Arc<dyn DataChannel>);
        }
    }

    /// The transport reports `channel` closed.
    pub fn close_channel(&self, channel: &MockChannel) {
        channel.open.store(false, Ordering::SeqCst);
        channel.closed.store(true, Ordering::SeqCst);
        self.observer.on_channel_closed(self.session, channel.id);
    }

    pub fn receive(&self, data: &[u8]) {
        self.observer
            .on_message(self.session, Bytes::copy_from_slice(data));
    }

    pub fn gather(&self, candidate: &str) {
        self.observer.on_local_candidate(
            self.session,
            IceCandidate {
                candidate: candidate.to_string(),
                mid: "0".to_string(),
                line_index: 0,
            },
        );
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> ConnectionResult<()> {
        self.check()?;
        let offered = description.sdp_type == SdpType::Offer;
        self.remote.lock().push(description);
        if offered {
            self.observer
                .on_local_description(self.session, SessionDescription::answer(MOCK_ANSWER));
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> ConnectionResult<()> {
        self.check()?;
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        options: ChannelOptions,
    ) -> ConnectionResult<Arc<dyn DataChannel>> {
        self.check()?;
        let channel = Arc::new(MockChannel::new(&options.label, false));
        self.channels.lock().push(Arc::clone(&channel));
        self.observer
            .on_local_description(self.session, SessionDescription::offer(MOCK_OFFER));
        Ok(channel as Arc<dyn DataChannel>)
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockChannel {
    id: ChannelId,
    label: String,
    pub open: AtomicBool,
    pub closed: AtomicBool,
    pub fail_send: AtomicBool,
    pub sent: Mutex<Vec<Bytes>>,
}

impl MockChannel {
    pub fn new(label: &str, open: bool) -> Self {
        Self {
            id: ChannelId::next(),
            label: label.to_string(),
            open: AtomicBool::new(open),
            closed: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> ConnectionResult<usize> {
        if !self.is_open() || self.fail_send.load(Ordering::SeqCst) {
            return Err(ConnectionError::new("channel not open"));
        }
        let len = data.len();
        self.sent.lock().push(data);
        Ok(len)
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// A registry, router and coordinator wired to a [`MockConnector`].
pub struct Bridge {
    pub connector: Arc<MockConnector>,
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<AudioRouter>,
    pub coordinator: SignalingCoordinator,
    pub events: mpsc::UnboundedReceiver<BridgeEvent>,
    pub native: mpsc::Receiver<(SessionId, Bytes)>,
}

impl Bridge {
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let connector = Arc::new(MockConnector::default());
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&connector) as Arc<dyn PeerConnector>,
            config,
        ));
        let (native_tx, native) = mpsc::channel(64);
        let router = Arc::new(AudioRouter::new(
            Arc::clone(&registry),
            Arc::new(ChannelFanout::new(native_tx)),
        ));
        let (events_tx, events) = mpsc::unbounded_channel();
        let coordinator =
            SignalingCoordinator::new(Arc::clone(&registry), Arc::clone(&router), events_tx);
        Self {
            connector,
            registry,
            router,
            coordinator,
            events,
            native,
        }
    }

    pub fn drain_events(&mut self) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Bring `session` to the connected state with an open outbound channel.
    pub async fn connect_session(&mut self, session: SessionId) -> Arc<MockChannel> {
        self.coordinator.create_offer(session).await.unwrap();
        self.coordinator
            .handle_answer(session, "v=0 browser-answer".to_string())
            .await
            .unwrap();
        let connection = self.connector.connection(session);
        connection.set_state(ConnectionState::Connected);
        connection.open_local_channels();
        self.drain_events();
        let channel = connection.channels.lock()[0].clone();
        channel
    }
}
