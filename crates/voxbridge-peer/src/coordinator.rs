use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use voxbridge_common::{GatewayMessage, SessionId, SignalMessage};

use crate::connection::{
    ChannelId, ChannelOptions, ConnectionObserver, ConnectionState, DataChannel, IceCandidate,
    PeerConnection, SdpType, SessionDescription,
};
use crate::error::PeerError;
use crate::router::AudioRouter;
use crate::session::{NegotiationEvent, NegotiationState, PeerSession, SessionRegistry};

/// Notification for the external signaling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Locally generated offer, answer or candidate to relay to the browser.
    Signal {
        session: SessionId,
        message: SignalMessage,
    },
    Connected {
        session: SessionId,
    },
    /// The connection left the connected state; the session should be disconnected.
    Disconnected {
        session: SessionId,
    },
    Error {
        session: SessionId,
        message: String,
    },
}

impl BridgeEvent {
    pub fn session(&self) -> SessionId {
        match self {
            BridgeEvent::Signal { session, .. }
            | BridgeEvent::Connected { session }
            | BridgeEvent::Disconnected { session }
            | BridgeEvent::Error { session, .. } => *session,
        }
    }

    pub fn into_gateway(self) -> GatewayMessage {
        match self {
            BridgeEvent::Signal { session, message } => {
                GatewayMessage::from_signal(session, message)
            }
            BridgeEvent::Connected { session } => GatewayMessage::Connected {
                session_id: session,
            },
            BridgeEvent::Disconnected { session } => GatewayMessage::Disconnected {
                session_id: session,
            },
            BridgeEvent::Error { session, message } => GatewayMessage::Error {
                session_id: session,
                message,
            },
        }
    }
}

/// Drives WebRTC negotiation for native sessions.
///
/// Every failure is returned to the caller and also emitted as [`BridgeEvent::Error`];
/// a failed step leaves the session in the state it had before the call.
pub struct SignalingCoordinator {
    registry: Arc<SessionRegistry>,
    observer: Arc<PeerEvents>,
    events: mpsc::UnboundedSender<BridgeEvent>,
}

impl SignalingCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        router: Arc<AudioRouter>,
        events: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Self {
        let observer = Arc::new(PeerEvents {
            registry: Arc::downgrade(&registry),
            router: Arc::downgrade(&router),
            events: events.clone(),
        });
        Self {
            registry,
            observer,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn handle_signal(
        &self,
        session: SessionId,
        signal: SignalMessage,
    ) -> Result<(), PeerError> {
        match signal {
            SignalMessage::Offer { sdp } => self.handle_offer(session, sdp).await,
            SignalMessage::Answer { sdp } => self.handle_answer(session, sdp).await,
            SignalMessage::IceCandidate {
                candidate,
                mid,
                line_index,
            } => {
                self.handle_ice_candidate(session, candidate, mid, line_index)
                    .await
            }
        }
    }

    /// Apply a browser offer, creating the session if needed. The answer arrives as a
    /// [`BridgeEvent::Signal`].
    pub async fn handle_offer(&self, session: SessionId, sdp: String) -> Result<(), PeerError> {
        info!("session {}: received WebRTC offer", session);
        let (peer, created) = self.ensure_session(session).await?;
        let result = self
            .apply(&peer, NegotiationEvent::ApplyOffer, |connection| async move {
                connection
                    .set_remote_description(SessionDescription::offer(sdp))
                    .await
                    .map_err(|e| PeerError::negotiation(session, "failed to apply remote offer", e))
            })
            .await;
        self.finish(session, created, result).await
    }

    /// Apply the browser's answer to an offer we sent.
    pub async fn handle_answer(&self, session: SessionId, sdp: String) -> Result<(), PeerError> {
        info!("session {}: received WebRTC answer", session);
        let peer = self.lookup(session)?;
        let result = self
            .apply(&peer, NegotiationEvent::ApplyAnswer, |connection| async move {
                connection
                    .set_remote_description(SessionDescription::answer(sdp))
                    .await
                    .map_err(|e| {
                        PeerError::negotiation(session, "failed to apply remote answer", e)
                    })
            })
            .await;
        self.finish(session, false, result).await
    }

    pub async fn handle_ice_candidate(
        &self,
        session: SessionId,
        candidate: String,
        mid: String,
        line_index: u16,
    ) -> Result<(), PeerError> {
        debug!("session {}: received ICE candidate", session);
        let peer = self.lookup(session)?;
        let candidate = IceCandidate {
            candidate,
            mid,
            line_index,
        };
        let result = self
            .apply(&peer, NegotiationEvent::AddCandidate, |connection| async move {
                connection
                    .add_remote_candidate(candidate)
                    .await
                    .map_err(|e| PeerError::negotiation(session, "failed to add ICE candidate", e))
            })
            .await;
        self.finish(session, false, result).await
    }

    /// Open a data channel towards the browser. The offer arrives as a
    /// [`BridgeEvent::Signal`].
    pub async fn create_offer(&self, session: SessionId) -> Result<(), PeerError> {
        info!("session {}: creating WebRTC offer", session);
        let (peer, created) = self.ensure_session(session).await?;
        let config = self.registry.config();
        let options = ChannelOptions {
            label: config.channel_label.clone(),
            reliable: config.reliable_data_channel,
        };
        let result = self
            .apply(&peer, NegotiationEvent::CreateOffer, |connection| async move {
                connection
                    .create_data_channel(options)
                    .await
                    .map_err(|e| {
                        PeerError::negotiation(session, "failed to create data channel", e)
                    })
            })
            .await;
        let result = result.map(|channel| peer.attach_channel(channel));
        self.finish(session, created, result).await
    }

    /// The native user left; tear the peer session down.
    pub async fn disconnect(&self, session: SessionId) {
        if self.registry.remove(session).await {
            info!("session {}: disconnected", session);
        } else {
            debug!("session {}: disconnect for unknown session", session);
        }
    }

    async fn ensure_session(
        &self,
        session: SessionId,
    ) -> Result<(Arc<PeerSession>, bool), PeerError> {
        if let Ok(peer) = self.registry.get(session) {
            return Ok((peer, false));
        }
        let observer: Arc<dyn ConnectionObserver> = self.observer.clone();
        match self.registry.create(session, observer).await {
            Ok(peer) => Ok((peer, true)),
            // Lost a race with a concurrent create for the same session.
            Err(PeerError::AlreadyExists(_)) => self.lookup(session).map(|peer| (peer, false)),
            Err(e) => Err(self.report(e)),
        }
    }

    fn lookup(&self, session: SessionId) -> Result<Arc<PeerSession>, PeerError> {
        self.registry.get(session).map_err(|e| self.report(e))
    }

    /// Run one capability call under a state transition, restoring the prior state if
    /// the call fails. The transition is taken before the call because the transport
    /// may report its response (e.g. the local answer) before the call returns.
    async fn apply<T, F, Fut>(
        &self,
        peer: &PeerSession,
        event: NegotiationEvent,
        call: F,
    ) -> Result<T, PeerError>
    where
        F: FnOnce(Arc<dyn PeerConnection>) -> Fut,
        Fut: std::future::Future<Output = Result<T, PeerError>>,
    {
        let connection = peer.connection()?;
        let previous = peer.transition(event)?;
        let result = call(connection).await;
        if result.is_err() {
            peer.restore(previous, event);
        }
        result
    }

    async fn finish<T>(
        &self,
        session: SessionId,
        created: bool,
        result: Result<T, PeerError>,
    ) -> Result<(), PeerError> {
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if created {
                    // The session did not exist before this call.
                    self.registry.remove(session).await;
                }
                Err(self.report(e))
            }
        }
    }

    fn report(&self, err: PeerError) -> PeerError {
        warn!("{}", err);
        let session = match &err {
            PeerError::AlreadyExists(session)
            | PeerError::NotFound(session)
            | PeerError::NotInitialized(session)
            | PeerError::InvalidState { session, .. }
            | PeerError::Negotiation { session, .. } => *session,
        };
        let _ = self.events.send(BridgeEvent::Error {
            session,
            message: err.to_string(),
        });
        err
    }
}

/// Receives connection callbacks for every session.
///
/// Holds the registry and router weakly: connections own their callbacks, and the
/// registry owns the connections.
struct PeerEvents {
    registry: Weak<SessionRegistry>,
    router: Weak<AudioRouter>,
    events: mpsc::UnboundedSender<BridgeEvent>,
}

impl PeerEvents {
    fn session(&self, session: SessionId) -> Option<Arc<PeerSession>> {
        let registry = self.registry.upgrade()?;
        match registry.get(session) {
            Ok(peer) => Some(peer),
            Err(_) => {
                debug!("session {}: callback for removed session", session);
                None
            }
        }
    }

    fn emit(&self, event: BridgeEvent) {
        if self.events.send(event).is_err() {
            debug!("bridge event receiver dropped");
        }
    }
}

impl ConnectionObserver for PeerEvents {
    fn on_local_description(&self, session: SessionId, description: SessionDescription) {
        let Some(peer) = self.session(session) else {
            return;
        };
        if description.sdp_type == SdpType::Answer {
            let _ = peer.transition(NegotiationEvent::LocalAnswer);
        }
        debug!("session {}: local {:?} ready", session, description.sdp_type);
        self.emit(BridgeEvent::Signal {
            session,
            message: description.into_signal(),
        });
    }

    fn on_local_candidate(&self, session: SessionId, candidate: IceCandidate) {
        if self.session(session).is_none() {
            return;
        }
        self.emit(BridgeEvent::Signal {
            session,
            message: candidate.into_signal(),
        });
    }

    fn on_state_change(&self, session: SessionId, state: ConnectionState) {
        let Some(peer) = self.session(session) else {
            return;
        };
        info!("session {}: connection state {:?}", session, state);

        if state == ConnectionState::Connected {
            if peer.transition(NegotiationEvent::ConnectionUp).is_ok() {
                peer.set_connected(true);
                self.emit(BridgeEvent::Connected { session });
            }
        } else if state.is_terminal() {
            peer.set_connected(false);
            match peer.transition(NegotiationEvent::ConnectionDown) {
                Ok(previous) if previous != NegotiationState::Closed => {
                    self.emit(BridgeEvent::Disconnected { session });
                }
                _ => {}
            }
        }
    }

    fn on_channel_open(&self, session: SessionId, channel: Arc<dyn DataChannel>) {
        let Some(peer) = self.session(session) else {
            return;
        };
        info!("session {}: data channel {} open", session, channel.label());
        peer.attach_channel(channel);
    }

    fn on_channel_closed(&self, session: SessionId, channel: ChannelId) {
        let Some(peer) = self.session(session) else {
            return;
        };
        match peer.detach_channel(channel) {
            Some(closed) => info!(
                "session {}: data channel {} {} closed",
                session,
                closed.label(),
                channel
            ),
            None => debug!("session {}: superseded channel {} closed", session, channel),
        }
    }

    fn on_message(&self, session: SessionId, data: Bytes) {
        if let Some(router) = self.router.upgrade() {
            router.route_inbound(session, data);
        }
    }
}
