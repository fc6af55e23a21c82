//! Peer-connection capability used by the session layer.
//!
//! ICE, DTLS and SCTP live behind these traits. An implementation creates one
//! connection per session, reports everything the connection produces through the
//! session's [`ConnectionObserver`], and generates local descriptions on its own: an
//! answer after a remote offer is applied, an offer after a data channel is created.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use voxbridge_common::{SessionId, SignalMessage};

/// Connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the session is eligible for removal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn into_signal(self) -> SignalMessage {
        match self.sdp_type {
            SdpType::Offer => SignalMessage::Offer { sdp: self.sdp },
            SdpType::Answer => SignalMessage::Answer { sdp: self.sdp },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    /// Media stream identification tag; empty when the transport did not report one.
    pub mid: String,
    pub line_index: u16,
}

impl IceCandidate {
    pub fn into_signal(self) -> SignalMessage {
        SignalMessage::IceCandidate {
            candidate: self.candidate,
            mid: self.mid,
            line_index: self.line_index,
        }
    }
}

/// Identity of one data channel, unique within the process.
///
/// Labels are not unique: the channel we open and the one the browser opens usually
/// share a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Options for a locally created data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    pub label: String,
    /// Ordered and fully retransmitted when true; unordered without retransmits otherwise.
    pub reliable: bool,
}

/// Failure reported by the transport.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ConnectionError(String);

impl ConnectionError {
    pub fn new(msg: impl std::fmt::Display) -> Self {
        Self(msg.to_string())
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Notifications from a connection, invoked on the transport's own tasks.
///
/// Calls for different sessions may run concurrently; calls for one session arrive in
/// the order the transport produced them.
pub trait ConnectionObserver: Send + Sync {
    fn on_local_description(&self, session: SessionId, description: SessionDescription);
    fn on_local_candidate(&self, session: SessionId, candidate: IceCandidate);
    fn on_state_change(&self, session: SessionId, state: ConnectionState);
    fn on_channel_open(&self, session: SessionId, channel: Arc<dyn DataChannel>);
    fn on_channel_closed(&self, session: SessionId, channel: ChannelId);
    /// Binary message received on a data channel.
    fn on_message(&self, session: SessionId, data: Bytes);
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    async fn send(&self, data: Bytes) -> ConnectionResult<usize>;
    async fn close(&self) -> ConnectionResult<()>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> ConnectionResult<()>;

    /// Candidates that arrive before a remote description are buffered by the transport.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> ConnectionResult<()>;

    async fn create_data_channel(
        &self,
        options: ChannelOptions,
    ) -> ConnectionResult<Arc<dyn DataChannel>>;

    async fn close(&self) -> ConnectionResult<()>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        session: SessionId,
        ice_servers: &[String],
        observer: Arc<dyn ConnectionObserver>,
    ) -> ConnectionResult<Arc<dyn PeerConnection>>;
}
