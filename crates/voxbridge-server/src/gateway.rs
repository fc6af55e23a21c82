//! WebSocket client for the external signaling gateway.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};
use voxbridge_common::{Error, GatewayMessage, SessionId, SignalMessage};
use voxbridge_peer::{BridgeEvent, PeerError, SignalingCoordinator};

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Request from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Signal(SessionId, SignalMessage),
    RequestOffer(SessionId),
    Disconnect(SessionId),
}

impl Command {
    pub fn parse(text: &str) -> voxbridge_common::Result<Self> {
        match GatewayMessage::from_json(text)? {
            GatewayMessage::RequestOffer { session_id } => Ok(Command::RequestOffer(session_id)),
            GatewayMessage::Disconnect { session_id } => Ok(Command::Disconnect(session_id)),
            message => {
                let session = message.session_id();
                message
                    .into_signal()
                    .map(|(session, signal)| Command::Signal(session, signal))
                    .ok_or_else(|| {
                        Error::protocol(format!(
                            "session {}: notification envelope sent to the bridge",
                            session
                        ))
                    })
            }
        }
    }
}

pub struct GatewayClient {
    url: String,
    coordinator: Arc<SignalingCoordinator>,
}

impl GatewayClient {
    pub fn new(url: String, coordinator: Arc<SignalingCoordinator>) -> Self {
        Self { url, coordinator }
    }

    /// Serve the gateway until the event stream ends, reconnecting with backoff.
    ///
    /// Events keep being settled while the gateway is unreachable; their envelopes wait in
    /// an [`Outbox`] and go out in order once a connection is back.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<BridgeEvent>) -> Result<()> {
        let mut outbox = Outbox::default();
        let mut retry_delay = INITIAL_RETRY_DELAY;
        loop {
            match self.serve(&mut events, &mut outbox).await {
                Ok(true) => retry_delay = INITIAL_RETRY_DELAY,
                Ok(false) => return Ok(()),
                Err(e) => warn!("Signaling gateway connection failed: {}", e),
            }
            info!("Reconnecting to signaling gateway in {:?}...", retry_delay);
            self.backoff(retry_delay, &mut events, &mut outbox).await;
            retry_delay = std::cmp::min(retry_delay * 2, MAX_RETRY_DELAY);
        }
    }

    /// Wait out `delay` while still settling events as they arrive.
    async fn backoff(
        &self,
        delay: Duration,
        events: &mut mpsc::UnboundedReceiver<BridgeEvent>,
        outbox: &mut Outbox,
    ) {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return,
                event = events.recv() => match event {
                    Some(event) => self.accept(event, outbox).await,
                    None => {
                        (&mut sleep).await;
                        return;
                    }
                },
            }
        }
    }

    /// One gateway connection. Returns `Ok(true)` when the gateway hung up and
    /// `Ok(false)` when there are no more events to deliver.
    async fn serve(
        &self,
        events: &mut mpsc::UnboundedReceiver<BridgeEvent>,
        outbox: &mut Outbox,
    ) -> Result<bool> {
        let (ws_stream, _) = connect_async(&self.url).await?;
        info!("Connected to signaling gateway: {}", self.url);
        let (mut write, mut read) = ws_stream.split();

        if !outbox.is_empty() {
            info!("Delivering {} queued gateway events", outbox.len());
        }
        outbox.flush(&mut write).await?;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return Ok(false);
                    };
                    self.accept(event, outbox).await;
                    outbox.flush(&mut write).await?;
                }
                msg = read.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(&text).await,
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Signaling gateway closed the connection");
                        return Ok(true);
                    }
                    Some(Err(e)) => {
                        error!("Signaling WebSocket error: {}", e);
                        return Err(e.into());
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    async fn accept(&self, event: BridgeEvent, outbox: &mut Outbox) {
        let session = event.session();
        match settle(&self.coordinator, event).await {
            Ok(text) => outbox.push(text),
            Err(e) => warn!("session {}: dropping unencodable gateway event: {}", session, e),
        }
    }

    async fn dispatch(&self, text: &str) {
        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(e) => {
                warn!("Failed to parse gateway message: {}", e);
                return;
            }
        };

        // Failures are reported back to the gateway as error events.
        if let Err(e) = execute(&self.coordinator, command).await {
            debug!("Gateway command failed: {}", e);
        }
    }
}

/// Apply one gateway command to the coordinator.
pub async fn execute(
    coordinator: &SignalingCoordinator,
    command: Command,
) -> Result<(), PeerError> {
    match command {
        Command::Signal(session, signal) => {
            debug!("session {}: gateway {}", session, signal.kind());
            coordinator.handle_signal(session, signal).await
        }
        Command::RequestOffer(session) => coordinator.create_offer(session).await,
        Command::Disconnect(session) => {
            coordinator.disconnect(session).await;
            Ok(())
        }
    }
}

/// Apply an event's local effects and encode its gateway envelope.
///
/// A `Disconnected` session is removed here, before any delivery attempt.
pub async fn settle(
    coordinator: &SignalingCoordinator,
    event: BridgeEvent,
) -> voxbridge_common::Result<String> {
    if let BridgeEvent::Disconnected { session } = event {
        coordinator.disconnect(session).await;
    }
    event.into_gateway().to_json()
}

/// Encoded envelopes not yet accepted by the gateway, oldest first.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: VecDeque<String>,
}

impl Outbox {
    pub fn push(&mut self, text: String) {
        self.pending.push_back(text);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Send queued envelopes in order. An envelope leaves the queue only after the sink
    /// accepted it, so a failed send keeps it for the next connection.
    pub async fn flush<S>(&mut self, sink: &mut S) -> std::result::Result<(), S::Error>
    where
        S: Sink<WsMessage> + Unpin,
    {
        while let Some(text) = self.pending.front() {
            sink.send(WsMessage::Text(text.clone())).await?;
            self.pending.pop_front();
        }
        Ok(())
    }
}
