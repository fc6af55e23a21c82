use serde::{Deserialize, Serialize};

use crate::{Error, Result, SessionId};

/// WebRTC negotiation message addressed to (or produced for) one session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Session description offering a connection.
    Offer { sdp: String },

    /// Session description answering an offer.
    Answer { sdp: String },

    /// Trickled ICE candidate. `line_index` is informational; the outbound path always
    /// reports the media line the candidate was gathered for, or 0.
    IceCandidate {
        candidate: String,
        mid: String,
        #[serde(default)]
        line_index: u16,
    },
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice_candidate",
        }
    }
}

/// Envelope exchanged with the external signaling gateway (JSON text frames).
///
/// Inbound: `offer`, `answer`, `ice_candidate`, `request_offer`, `disconnect`.
/// Outbound: `offer`, `answer`, `ice_candidate`, `connected`, `disconnected`, `error`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    Offer {
        session_id: SessionId,
        sdp: String,
    },
    Answer {
        session_id: SessionId,
        sdp: String,
    },
    IceCandidate {
        session_id: SessionId,
        candidate: String,
        mid: String,
        #[serde(default)]
        line_index: u16,
    },

    /// Ask the bridge to open a channel and offer first.
    RequestOffer { session_id: SessionId },

    /// The user left the native voice server.
    Disconnect { session_id: SessionId },

    Connected { session_id: SessionId },
    Disconnected { session_id: SessionId },
    Error {
        session_id: SessionId,
        message: String,
    },
}

impl GatewayMessage {
    pub fn from_signal(session_id: SessionId, signal: SignalMessage) -> Self {
        match signal {
            SignalMessage::Offer { sdp } => GatewayMessage::Offer { session_id, sdp },
            SignalMessage::Answer { sdp } => GatewayMessage::Answer { session_id, sdp },
            SignalMessage::IceCandidate {
                candidate,
                mid,
                line_index,
            } => GatewayMessage::IceCandidate {
                session_id,
                candidate,
                mid,
                line_index,
            },
        }
    }

    /// Split a negotiation envelope into its session and signal.
    ///
    /// Returns `None` for control and notification envelopes.
    pub fn into_signal(self) -> Option<(SessionId, SignalMessage)> {
        match self {
            GatewayMessage::Offer { session_id, sdp } => {
                Some((session_id, SignalMessage::Offer { sdp }))
            }
            GatewayMessage::Answer { session_id, sdp } => {
                Some((session_id, SignalMessage::Answer { sdp }))
            }
            GatewayMessage::IceCandidate {
                session_id,
                candidate,
                mid,
                line_index,
            } => Some((
                session_id,
                SignalMessage::IceCandidate {
                    candidate,
                    mid,
                    line_index,
                },
            )),
            _ => None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            GatewayMessage::Offer { session_id, .. }
            | GatewayMessage::Answer { session_id, .. }
            | GatewayMessage::IceCandidate { session_id, .. }
            | GatewayMessage::RequestOffer { session_id }
            | GatewayMessage::Disconnect { session_id }
            | GatewayMessage::Connected { session_id }
            | GatewayMessage::Disconnected { session_id }
            | GatewayMessage::Error { session_id, .. } => *session_id,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_envelope_parses() {
        let msg = GatewayMessage::from_json(r#"{"type":"offer","session_id":7,"sdp":"v=0"}"#)
            .unwrap();
        assert_eq!(
            msg.into_signal(),
            Some((
                7,
                SignalMessage::Offer {
                    sdp: "v=0".to_string()
                }
            ))
        );
    }

    #[test]
    fn test_candidate_line_index_defaults_to_zero() {
        let msg = GatewayMessage::from_json(
            r#"{"type":"ice_candidate","session_id":3,"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","mid":"0"}"#,
        )
        .unwrap();
        match msg {
            GatewayMessage::IceCandidate { line_index, mid, .. } => {
                assert_eq!(line_index, 0);
                assert_eq!(mid, "0");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_control_envelopes_have_no_signal() {
        let msg = GatewayMessage::Disconnect { session_id: 9 };
        assert_eq!(msg.session_id(), 9);
        assert!(msg.into_signal().is_none());

        let msg = GatewayMessage::RequestOffer { session_id: 4 };
        assert!(msg.into_signal().is_none());
    }

    #[test]
    fn test_error_notification_serializes_with_tag() {
        let msg = GatewayMessage::Error {
            session_id: 2,
            message: "negotiation failed".to_string(),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""session_id":2"#));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = GatewayMessage::from_json(r#"{"type":"bogus","session_id":1}"#).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_signal_kind() {
        let candidate = SignalMessage::IceCandidate {
            candidate: String::new(),
            mid: String::new(),
            line_index: 0,
        };
        assert_eq!(candidate.kind(), "ice_candidate");
        assert_eq!(
            SignalMessage::Answer {
                sdp: String::new()
            }
            .kind(),
            "answer"
        );
    }
}
