//! WebRTC side of the voice bridge.
//!
//! - [`SessionRegistry`] owns one [`PeerSession`] per native session identifier.
//! - [`SignalingCoordinator`] applies offers, answers and candidates and reports what the
//!   connection produces as [`BridgeEvent`]s.
//! - [`AudioRouter`] moves codec frames between data channels and the native fan-out.
//!
//! The peer-connection machinery sits behind the [`PeerConnector`] family of traits;
//! [`RtcConnector`] is the implementation backed by the `webrtc` crate.

#![forbid(unsafe_code)]

pub mod connection;
pub mod coordinator;
pub mod error;
pub mod router;
pub mod rtc;
pub mod session;

pub use connection::{
    ChannelId, ChannelOptions, ConnectionError, ConnectionObserver, ConnectionResult,
    ConnectionState, DataChannel, IceCandidate, PeerConnection, PeerConnector, SdpType,
    SessionDescription,
};
pub use coordinator::{BridgeEvent, SignalingCoordinator};
pub use error::PeerError;
pub use router::{AudioRouter, ChannelFanout, NativeFanout, RouteSnapshot, RouteStats};
pub use rtc::RtcConnector;
pub use session::{NegotiationEvent, NegotiationState, PeerSession, SessionRegistry};
