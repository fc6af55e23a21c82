//! Signaling flows through the coordinator against the mock transport.

mod support;

use std::sync::atomic::Ordering;

use support::{Bridge, MOCK_ANSWER, MOCK_OFFER};
use voxbridge_common::{GatewayMessage, SignalMessage};
use voxbridge_peer::{
    BridgeEvent, ConnectionState, NegotiationEvent, NegotiationState, PeerError, SdpType,
};

fn is_error_for(event: &BridgeEvent, id: u32) -> bool {
    matches!(event, BridgeEvent::Error { session, .. } if *session == id)
}

#[tokio::test]
async fn test_offer_creates_session_and_answers() {
    let mut bridge = Bridge::new();

    bridge
        .coordinator
        .handle_offer(7, "v=0 browser-offer".to_string())
        .await
        .unwrap();

    let peer = bridge.registry.get(7).unwrap();
    assert_eq!(peer.state(), NegotiationState::Negotiating);

    let remote = bridge.connector.connection(7).remote.lock().clone();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].sdp_type, SdpType::Offer);
    assert_eq!(remote[0].sdp, "v=0 browser-offer");

    let events = bridge.drain_events();
    assert_eq!(
        events,
        vec![BridgeEvent::Signal {
            session: 7,
            message: SignalMessage::Answer {
                sdp: MOCK_ANSWER.to_string()
            },
        }]
    );
}

#[tokio::test]
async fn test_answer_event_maps_to_gateway_message() {
    let mut bridge = Bridge::new();
    bridge
        .coordinator
        .handle_signal(
            4,
            SignalMessage::Offer {
                sdp: "v=0".to_string(),
            },
        )
        .await
        .unwrap();

    let event = bridge.drain_events().remove(0);
    assert_eq!(event.session(), 4);
    assert_eq!(
        event.into_gateway(),
        GatewayMessage::Answer {
            session_id: 4,
            sdp: MOCK_ANSWER.to_string(),
        }
    );
}

#[tokio::test]
async fn test_answer_for_unknown_session() {
    let mut bridge = Bridge::new();

    let err = bridge
        .coordinator
        .handle_answer(9, "v=0".to_string())
        .await
        .unwrap_err();

    assert!(matches!(err, PeerError::NotFound(9)));
    assert!(bridge.registry.is_empty());
    assert_eq!(bridge.connector.connect_count(), 0);

    let events = bridge.drain_events();
    assert_eq!(events.len(), 1);
    assert!(is_error_for(&events[0], 9));
}

#[tokio::test]
async fn test_candidate_for_unknown_session() {
    let bridge = Bridge::new();
    let err = bridge
        .coordinator
        .handle_ice_candidate(9, "candidate:1".to_string(), "0".to_string(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::NotFound(9)));
    assert!(bridge.registry.is_empty());
}

#[tokio::test]
async fn test_candidate_is_forwarded() {
    let bridge = Bridge::new();
    bridge
        .coordinator
        .handle_offer(2, "v=0".to_string())
        .await
        .unwrap();

    bridge
        .coordinator
        .handle_signal(
            2,
            SignalMessage::IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
                mid: "0".to_string(),
                line_index: 0,
            },
        )
        .await
        .unwrap();

    let candidates = bridge.connector.connection(2).candidates.lock().clone();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].mid, "0");
    assert_eq!(
        bridge.registry.get(2).unwrap().state(),
        NegotiationState::Negotiating
    );
}

#[tokio::test]
async fn test_answer_without_outstanding_offer() {
    let mut bridge = Bridge::new();
    bridge
        .coordinator
        .handle_offer(1, "v=0".to_string())
        .await
        .unwrap();
    bridge.drain_events();

    let err = bridge
        .coordinator
        .handle_answer(1, "v=0".to_string())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PeerError::InvalidState {
            session: 1,
            state: NegotiationState::Negotiating,
            event: NegotiationEvent::ApplyAnswer,
        }
    ));
    // The answer never reached the transport.
    assert_eq!(bridge.connector.connection(1).remote.lock().len(), 1);
    assert_eq!(
        bridge.registry.get(1).unwrap().state(),
        NegotiationState::Negotiating
    );
    assert!(is_error_for(&bridge.drain_events()[0], 1));
}

#[tokio::test]
async fn test_glare_offer_rejected() {
    let mut bridge = Bridge::new();
    bridge.coordinator.create_offer(3).await.unwrap();
    bridge.drain_events();

    let err = bridge
        .coordinator
        .handle_offer(3, "v=0".to_string())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PeerError::InvalidState {
            state: NegotiationState::OfferSent,
            ..
        }
    ));
    // An existing session survives a rejected offer.
    assert_eq!(
        bridge.registry.get(3).unwrap().state(),
        NegotiationState::OfferSent
    );
}

#[tokio::test]
async fn test_failed_offer_on_new_session_is_torn_down() {
    let mut bridge = Bridge::new();
    bridge
        .connector
        .fail_negotiation
        .store(true, Ordering::SeqCst);

    let err = bridge
        .coordinator
        .handle_offer(5, "v=0".to_string())
        .await
        .unwrap_err();

    assert!(matches!(err, PeerError::Negotiation { session: 5, .. }));
    assert!(!bridge.registry.contains(5));
    assert!(bridge.connector.connection(5).is_closed());

    let events = bridge.drain_events();
    assert_eq!(events.len(), 1);
    assert!(is_error_for(&events[0], 5));
}

#[tokio::test]
async fn test_failed_offer_on_existing_session_restores_state() {
    let mut bridge = Bridge::new();
    bridge
        .coordinator
        .handle_offer(5, "v=0 first".to_string())
        .await
        .unwrap();
    bridge.drain_events();

    let connection = bridge.connector.connection(5);
    connection.fail.store(true, Ordering::SeqCst);

    let err = bridge
        .coordinator
        .handle_offer(5, "v=0 second".to_string())
        .await
        .unwrap_err();

    assert!(matches!(err, PeerError::Negotiation { .. }));
    let peer = bridge.registry.get(5).unwrap();
    assert_eq!(peer.state(), NegotiationState::Negotiating);
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_connector_failure_reported() {
    let mut bridge = Bridge::new();
    bridge.connector.fail_connect.store(true, Ordering::SeqCst);

    let err = bridge.coordinator.create_offer(8).await.unwrap_err();
    assert!(matches!(err, PeerError::Negotiation { session: 8, .. }));
    assert!(bridge.registry.is_empty());
    assert!(is_error_for(&bridge.drain_events()[0], 8));
}

#[tokio::test]
async fn test_create_offer_opens_configured_channel() {
    let mut bridge = Bridge::new();

    bridge.coordinator.create_offer(6).await.unwrap();

    let peer = bridge.registry.get(6).unwrap();
    assert_eq!(peer.state(), NegotiationState::OfferSent);
    let channel = peer.channel().unwrap();
    assert_eq!(channel.label(), "audio");
    assert!(!channel.is_open());

    assert_eq!(
        bridge.drain_events(),
        vec![BridgeEvent::Signal {
            session: 6,
            message: SignalMessage::Offer {
                sdp: MOCK_OFFER.to_string()
            },
        }]
    );

    // A second offer while one is outstanding is out of order.
    let err = bridge.coordinator.create_offer(6).await.unwrap_err();
    assert!(matches!(err, PeerError::InvalidState { .. }));
}

#[tokio::test]
async fn test_offer_then_answer_negotiates() {
    let bridge = Bridge::new();
    bridge.coordinator.create_offer(6).await.unwrap();
    bridge
        .coordinator
        .handle_answer(6, "v=0 browser-answer".to_string())
        .await
        .unwrap();

    assert_eq!(
        bridge.registry.get(6).unwrap().state(),
        NegotiationState::Negotiating
    );
    let remote = bridge.connector.connection(6).remote.lock().clone();
    assert_eq!(remote[0].sdp_type, SdpType::Answer);
}

#[tokio::test]
async fn test_local_candidates_are_relayed() {
    let mut bridge = Bridge::new();
    bridge
        .coordinator
        .handle_offer(2, "v=0".to_string())
        .await
        .unwrap();
    bridge.drain_events();

    bridge.connector.connection(2).gather("candidate:9");

    assert_eq!(
        bridge.drain_events(),
        vec![BridgeEvent::Signal {
            session: 2,
            message: SignalMessage::IceCandidate {
                candidate: "candidate:9".to_string(),
                mid: "0".to_string(),
                line_index: 0,
            },
        }]
    );
}

#[tokio::test]
async fn test_connection_state_events() {
    let mut bridge = Bridge::new();
    bridge
        .coordinator
        .handle_offer(2, "v=0".to_string())
        .await
        .unwrap();
    bridge.drain_events();
    let connection = bridge.connector.connection(2);

    connection.set_state(ConnectionState::Connecting);
    connection.set_state(ConnectionState::Connected);
    let peer = bridge.registry.get(2).unwrap();
    assert!(peer.is_connected());
    assert_eq!(peer.state(), NegotiationState::Connected);
    assert_eq!(
        bridge.drain_events(),
        vec![BridgeEvent::Connected { session: 2 }]
    );

    connection.set_state(ConnectionState::Disconnected);
    connection.set_state(ConnectionState::Closed);
    assert!(!peer.is_connected());
    assert_eq!(peer.state(), NegotiationState::Closed);
    // Reported once even though the transport went through two terminal states.
    assert_eq!(
        bridge.drain_events(),
        vec![BridgeEvent::Disconnected { session: 2 }]
    );
}

#[tokio::test]
async fn test_renegotiation_returns_to_connected() {
    let mut bridge = Bridge::new();
    bridge
        .coordinator
        .handle_offer(2, "v=0 first".to_string())
        .await
        .unwrap();
    bridge
        .connector
        .connection(2)
        .set_state(ConnectionState::Connected);
    bridge.drain_events();

    bridge
        .coordinator
        .handle_offer(2, "v=0 ice-restart".to_string())
        .await
        .unwrap();

    let peer = bridge.registry.get(2).unwrap();
    assert!(peer.is_connected());
    assert_eq!(peer.state(), NegotiationState::Connected);
    assert_eq!(
        bridge.drain_events(),
        vec![BridgeEvent::Signal {
            session: 2,
            message: SignalMessage::Answer {
                sdp: MOCK_ANSWER.to_string()
            },
        }]
    );
}

#[tokio::test]
async fn test_disconnect_tears_down() {
    let mut bridge = Bridge::new();
    bridge
        .coordinator
        .handle_offer(2, "v=0".to_string())
        .await
        .unwrap();
    bridge.drain_events();

    bridge.coordinator.disconnect(2).await;
    assert!(!bridge.registry.contains(2));
    assert!(bridge.connector.connection(2).is_closed());

    // Unknown sessions are ignored.
    bridge.coordinator.disconnect(2).await;
    assert!(bridge.drain_events().is_empty());

    let err = bridge
        .coordinator
        .handle_answer(2, "v=0".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::NotFound(2)));
}

#[tokio::test]
async fn test_callbacks_after_removal_are_ignored() {
    let mut bridge = Bridge::new();
    bridge
        .coordinator
        .handle_offer(2, "v=0".to_string())
        .await
        .unwrap();
    let connection = bridge.connector.connection(2);
    bridge.coordinator.disconnect(2).await;
    bridge.drain_events();

    connection.set_state(ConnectionState::Connected);
    connection.gather("candidate:late");
    connection.receive(&[0x80, 0x6F, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0xAA]);

    assert!(bridge.drain_events().is_empty());
    assert!(bridge.native.try_recv().is_err());
}
