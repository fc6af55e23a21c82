//! Peer-connection capability backed by the `webrtc` crate.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};
use voxbridge_common::SessionId;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::connection::{
    ChannelId, ChannelOptions, ConnectionError, ConnectionObserver, ConnectionResult,
    ConnectionState, DataChannel, IceCandidate, PeerConnection, PeerConnector, SdpType,
    SessionDescription,
};

impl From<webrtc::Error> for ConnectionError {
    fn from(err: webrtc::Error) -> Self {
        ConnectionError::new(err)
    }
}

pub struct RtcConnector {
    api: API,
}

impl RtcConnector {
    pub fn new() -> ConnectionResult<Self> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(m).build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        session: SessionId,
        ice_servers: &[String],
        observer: Arc<dyn ConnectionObserver>,
    ) -> ConnectionResult<Arc<dyn PeerConnection>> {
        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let state_observer = Arc::clone(&observer);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let observer = Arc::clone(&state_observer);
            Box::pin(async move {
                if let Some(state) = map_state(state) {
                    observer.on_state_change(session, state);
                }
            })
        }));

        let candidate_observer = Arc::clone(&observer);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let observer = Arc::clone(&candidate_observer);
            Box::pin(async move {
                // None marks the end of gathering.
                let Some(candidate) = candidate else {
                    debug!("session {}: ICE gathering complete", session);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => observer.on_local_candidate(
                        session,
                        IceCandidate {
                            candidate: init.candidate,
                            mid: init.sdp_mid.unwrap_or_default(),
                            line_index: init.sdp_mline_index.unwrap_or(0),
                        },
                    ),
                    Err(e) => warn!("session {}: unusable local ICE candidate: {}", session, e),
                }
            })
        }));

        let channel_observer = Arc::clone(&observer);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let observer = Arc::clone(&channel_observer);
            Box::pin(async move {
                info!("session {}: remote opened data channel {}", session, dc.label());
                wire_channel(session, &dc, observer);
            })
        }));

        Ok(Arc::new(RtcPeerConnection {
            session,
            pc,
            observer,
        }))
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

/// Route a channel's open, close and binary message callbacks to `observer`, and
/// return the identity they report the channel under.
fn wire_channel(
    session: SessionId,
    dc: &Arc<RTCDataChannel>,
    observer: Arc<dyn ConnectionObserver>,
) -> ChannelId {
    let id = ChannelId::next();
    let weak: Weak<RTCDataChannel> = Arc::downgrade(dc);
    let open_observer = Arc::clone(&observer);
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            if let Some(dc) = weak.upgrade() {
                open_observer.on_channel_open(session, Arc::new(RtcDataChannel::new(id, dc)));
            }
        })
    }));

    let close_observer = Arc::clone(&observer);
    dc.on_close(Box::new(move || {
        let observer = Arc::clone(&close_observer);
        Box::pin(async move {
            observer.on_channel_closed(session, id);
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let observer = Arc::clone(&observer);
        Box::pin(async move {
            if msg.is_string {
                debug!("session {}: ignoring text message on audio channel", session);
                return;
            }
            observer.on_message(session, msg.data);
        })
    }));

    id
}

struct RtcPeerConnection {
    session: SessionId,
    pc: Arc<RTCPeerConnection>,
    observer: Arc<dyn ConnectionObserver>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> ConnectionResult<()> {
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        };
        self.pc.set_remote_description(remote).await?;

        if description.sdp_type == SdpType::Offer {
            let answer = self.pc.create_answer(None).await?;
            self.pc.set_local_description(answer.clone()).await?;
            self.observer
                .on_local_description(self.session, SessionDescription::answer(answer.sdp));
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> ConnectionResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: (!candidate.mid.is_empty()).then_some(candidate.mid),
            sdp_mline_index: Some(candidate.line_index),
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        options: ChannelOptions,
    ) -> ConnectionResult<Arc<dyn DataChannel>> {
        let init = if options.reliable {
            RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            }
        } else {
            RTCDataChannelInit {
                ordered: Some(false),
                max_retransmits: Some(0),
                ..Default::default()
            }
        };

        let dc = self
            .pc
            .create_data_channel(&options.label, Some(init))
            .await?;
        let id = wire_channel(self.session, &dc, Arc::clone(&self.observer));

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        self.observer
            .on_local_description(self.session, SessionDescription::offer(offer.sdp));

        Ok(Arc::new(RtcDataChannel::new(id, dc)))
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.pc.close().await?;
        Ok(())
    }
}

struct RtcDataChannel {
    id: ChannelId,
    label: String,
    inner: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    fn new(id: ChannelId, inner: Arc<RTCDataChannel>) -> Self {
        Self {
            id,
            label: inner.label().to_string(),
            inner,
        }
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: Bytes) -> ConnectionResult<usize> {
        Ok(self.inner.send(&data).await?)
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.inner.close().await?;
        Ok(())
    }
}
