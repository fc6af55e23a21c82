use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use voxbridge_common::SessionId;

use crate::session::SessionRegistry;

/// Entry point into the voice server's existing fan-out for frames from browsers.
pub trait NativeFanout: Send + Sync {
    fn deliver(&self, session: SessionId, frame: Bytes);
}

/// Fan-out that queues frames on a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelFanout {
    tx: mpsc::Sender<(SessionId, Bytes)>,
}

impl ChannelFanout {
    pub fn new(tx: mpsc::Sender<(SessionId, Bytes)>) -> Self {
        Self { tx }
    }
}

impl NativeFanout for ChannelFanout {
    fn deliver(&self, session: SessionId, frame: Bytes) {
        if let Err(e) = self.tx.try_send((session, frame)) {
            debug!("session {}: native fan-out dropped frame: {}", session, e);
        }
    }
}

/// Routing counters
#[derive(Debug, Default)]
pub struct RouteStats {
    inbound_frames: AtomicU64,
    inbound_dropped: AtomicU64,
    malformed_packets: AtomicU64,
    outbound_packets: AtomicU64,
    outbound_dropped: AtomicU64,
}

/// Point-in-time copy of [`RouteStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteSnapshot {
    pub inbound_frames: u64,
    pub inbound_dropped: u64,
    pub malformed_packets: u64,
    pub outbound_packets: u64,
    pub outbound_dropped: u64,
}

impl RouteStats {
    pub fn snapshot(&self) -> RouteSnapshot {
        RouteSnapshot {
            inbound_frames: self.inbound_frames.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            outbound_packets: self.outbound_packets.load(Ordering::Relaxed),
            outbound_dropped: self.outbound_dropped.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Moves codec frames between browser data channels and the native fan-out.
///
/// Spurious or malformed input is dropped without surfacing an error.
pub struct AudioRouter {
    registry: Arc<SessionRegistry>,
    fanout: Arc<dyn NativeFanout>,
    stats: RouteStats,
}

impl AudioRouter {
    pub fn new(registry: Arc<SessionRegistry>, fanout: Arc<dyn NativeFanout>) -> Self {
        Self {
            registry,
            fanout,
            stats: RouteStats::default(),
        }
    }

    pub fn stats(&self) -> RouteSnapshot {
        self.stats.snapshot()
    }

    /// RTP from a browser: unwrap and hand the frame to the native fan-out.
    pub fn route_inbound(&self, session: SessionId, rtp: Bytes) -> bool {
        if !self.registry.contains(session) || rtp.is_empty() {
            trace!("session {}: dropping inbound packet", session);
            bump(&self.stats.inbound_dropped);
            return false;
        }

        let frame = voxbridge_rtp::decode(rtp);
        if frame.is_empty() {
            warn!("session {}: malformed RTP packet dropped", session);
            bump(&self.stats.malformed_packets);
            return false;
        }

        self.fanout.deliver(session, frame);
        bump(&self.stats.inbound_frames);
        true
    }

    /// Native frame for a browser user: frame as RTP and send over their channel.
    pub async fn route_outbound(&self, session: SessionId, frame: &[u8]) -> bool {
        let Ok(peer) = self.registry.get(session) else {
            bump(&self.stats.outbound_dropped);
            return false;
        };
        if !peer.is_connected() {
            bump(&self.stats.outbound_dropped);
            return false;
        }
        // Held for the whole send; a concurrent teardown closes it but cannot free it.
        let Some(channel) = peer.channel().filter(|channel| channel.is_open()) else {
            bump(&self.stats.outbound_dropped);
            return false;
        };

        let packet = peer.stamp(frame);
        drop(peer);

        match channel.send(packet).await {
            Ok(_) => {
                bump(&self.stats.outbound_packets);
                true
            }
            Err(e) => {
                debug!("session {}: send on {} failed: {}", session, channel.label(), e);
                bump(&self.stats.outbound_dropped);
                false
            }
        }
    }
}
