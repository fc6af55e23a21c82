use voxbridge_common::SessionId;

use crate::connection::ConnectionError;
use crate::session::{NegotiationEvent, NegotiationState};

/// Session and negotiation errors
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("session {0} already exists")]
    AlreadyExists(SessionId),
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("peer connection for session {0} not initialized")]
    NotInitialized(SessionId),
    #[error("session {session}: {event:?} not allowed in state {state:?}")]
    InvalidState {
        session: SessionId,
        state: NegotiationState,
        event: NegotiationEvent,
    },
    #[error("session {session}: {context}: {source}")]
    Negotiation {
        session: SessionId,
        context: &'static str,
        #[source]
        source: ConnectionError,
    },
}

impl PeerError {
    pub fn negotiation(session: SessionId, context: &'static str, source: ConnectionError) -> Self {
        Self::Negotiation {
            session,
            context,
            source,
        }
    }
}
