//! Peer session state and the session registry.
//!
//! Negotiation lifecycle of one session:
//! - IDLE: connection created, nothing applied yet
//! - OFFER_SENT: local data channel opened, local offer outstanding
//! - OFFER_RECEIVED: remote offer applied, local answer pending
//! - NEGOTIATING: descriptions exchanged, waiting for ICE/DTLS
//! - CONNECTED: transport reported connected
//! - CLOSED: disconnected, failed or torn down (absorbing)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use voxbridge_common::{BridgeConfig, SessionId};
use voxbridge_rtp::RtpSequencer;

use crate::connection::{
    ChannelId, ConnectionObserver, DataChannel, PeerConnection, PeerConnector,
};
use crate::error::PeerError;

/// Negotiation state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Connection exists, no description applied
    Idle,
    /// Local offer outstanding
    OfferSent,
    /// Remote offer applied, local answer pending
    OfferReceived,
    /// Descriptions exchanged
    Negotiating,
    /// Transport connected, audio may flow
    Connected,
    /// Session ended
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationEvent {
    ApplyOffer,
    ApplyAnswer,
    AddCandidate,
    CreateOffer,
    LocalAnswer,
    ConnectionUp,
    ConnectionDown,
}

impl NegotiationState {
    /// Next state for `event`, or `None` if the event is out of order.
    pub fn next(self, event: NegotiationEvent) -> Option<NegotiationState> {
        use NegotiationEvent::*;
        use NegotiationState::*;

        match (self, event) {
            (Closed, ConnectionDown) => Some(Closed),
            (Closed, _) => None,
            (_, ConnectionDown) => Some(Closed),
            (_, ConnectionUp) => Some(Connected),
            // Glare: an offer of ours is outstanding.
            (OfferSent, ApplyOffer) => None,
            (_, ApplyOffer) => Some(OfferReceived),
            (OfferSent, ApplyAnswer) => Some(Negotiating),
            (_, ApplyAnswer) => None,
            (state, AddCandidate) => Some(state),
            (Idle, CreateOffer) => Some(OfferSent),
            (_, CreateOffer) => None,
            (OfferReceived, LocalAnswer) => Some(Negotiating),
            (state, LocalAnswer) => Some(state),
        }
    }
}

/// One browser peer attached to a native session.
///
/// The connection and channel handles are shared out as `Arc`s for the duration of a
/// single operation; teardown takes them out of the session so later operations see
/// `NotInitialized` instead of a closed handle.
pub struct PeerSession {
    id: SessionId,
    connection: Mutex<Option<Arc<dyn PeerConnection>>>,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
    state: Mutex<NegotiationState>,
    connected: AtomicBool,
    sequencer: Mutex<RtpSequencer>,
}

impl PeerSession {
    pub fn new(id: SessionId, connection: Arc<dyn PeerConnection>, samples_per_frame: u32) -> Self {
        Self {
            id,
            connection: Mutex::new(Some(connection)),
            channel: Mutex::new(None),
            state: Mutex::new(NegotiationState::Idle),
            connected: AtomicBool::new(false),
            sequencer: Mutex::new(RtpSequencer::new(samples_per_frame)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connection(&self) -> Result<Arc<dyn PeerConnection>, PeerError> {
        self.connection
            .lock()
            .clone()
            .ok_or(PeerError::NotInitialized(self.id))
    }

    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.lock().clone()
    }

    /// Make `channel` the outbound path for this session.
    pub fn attach_channel(&self, channel: Arc<dyn DataChannel>) {
        // Lock order: connection, then channel.
        let connection = self.connection.lock();
        if connection.is_none() {
            debug!("session {}: ignoring channel {} after teardown", self.id, channel.label());
            return;
        }
        *self.channel.lock() = Some(channel);
    }

    /// Drop the outbound channel if it is `id`. A channel that was already replaced
    /// leaves its successor in place.
    pub fn detach_channel(&self, id: ChannelId) -> Option<Arc<dyn DataChannel>> {
        let mut guard = self.channel.lock();
        if guard.as_ref().is_some_and(|channel| channel.id() == id) {
            guard.take()
        } else {
            None
        }
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Apply `event`, returning the state it replaced.
    ///
    /// A renegotiation on a live transport settles back in `Connected` once the local
    /// answer is out, since the transport does not report connected again.
    pub fn transition(&self, event: NegotiationEvent) -> Result<NegotiationState, PeerError> {
        let mut state = self.state.lock();
        let from = *state;
        let next = from.next(event).map(|to| {
            if event == NegotiationEvent::LocalAnswer
                && to == NegotiationState::Negotiating
                && self.is_connected()
            {
                NegotiationState::Connected
            } else {
                to
            }
        });
        match next {
            Some(to) => {
                if from != to {
                    debug!("session {}: {:?} -> {:?} via {:?}", self.id, from, to, event);
                }
                *state = to;
                Ok(from)
            }
            None => Err(PeerError::InvalidState {
                session: self.id,
                state: from,
                event,
            }),
        }
    }

    /// Undo a transition whose capability call failed, unless something else has
    /// moved the state on since.
    pub fn restore(&self, previous: NegotiationState, applied: NegotiationEvent) {
        let mut state = self.state.lock();
        if previous.next(applied) == Some(*state) && *state != NegotiationState::Closed {
            *state = previous;
        }
    }

    /// Frame `frame` as the next RTP packet of this session's outbound stream.
    pub fn stamp(&self, frame: &[u8]) -> Bytes {
        self.sequencer.lock().stamp(frame)
    }

    /// Close the channel, then the connection, and mark the session closed.
    pub async fn close(&self) {
        *self.state.lock() = NegotiationState::Closed;
        self.set_connected(false);

        let (channel, connection) = {
            let mut connection = self.connection.lock();
            let channel = self.channel.lock().take();
            (channel, connection.take())
        };

        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                debug!("session {}: closing channel {}: {}", self.id, channel.label(), e);
            }
        }

        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!("session {}: closing peer connection: {}", self.id, e);
            }
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .field("has_channel", &self.channel.lock().is_some())
            .finish()
    }
}

/// Table of live peer sessions keyed by native session identifier.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<PeerSession>>>,
    connector: Arc<dyn PeerConnector>,
    config: BridgeConfig,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn PeerConnector>, config: BridgeConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            connector,
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Create a connection for `id` and register it.
    pub async fn create(
        &self,
        id: SessionId,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<PeerSession>, PeerError> {
        if self.contains(id) {
            return Err(PeerError::AlreadyExists(id));
        }

        let connection = self
            .connector
            .connect(id, &self.config.ice_servers, observer)
            .await
            .map_err(|e| PeerError::negotiation(id, "failed to create peer connection", e))?;

        let session = Arc::new(PeerSession::new(
            id,
            connection,
            self.config.samples_per_frame(),
        ));

        // Another caller may have registered the same id while we were connecting.
        let raced = {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&id) {
                true
            } else {
                sessions.insert(id, Arc::clone(&session));
                false
            }
        };
        if raced {
            session.close().await;
            return Err(PeerError::AlreadyExists(id));
        }

        info!("session {}: peer session created", id);
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<PeerSession>, PeerError> {
        self.sessions
            .lock()
            .get(&id)
            .cloned()
            .ok_or(PeerError::NotFound(id))
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    /// Tear down and forget `id`. Removing an unknown session is a no-op.
    pub async fn remove(&self, id: SessionId) -> bool {
        let removed = self.sessions.lock().remove(&id);
        match removed {
            Some(session) => {
                session.close().await;
                info!("session {}: peer session removed", id);
                true
            }
            None => false,
        }
    }

    /// Tear down every session. Used at shutdown.
    pub async fn clear(&self) -> usize {
        let drained: Vec<Arc<PeerSession>> = self
            .sessions
            .lock()
            .drain()
            .map(|(_, session)| session)
            .collect();
        let count = drained.len();
        for session in drained {
            session.close().await;
        }
        if count > 0 {
            info!("closed {} peer sessions", count);
        }
        count
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
