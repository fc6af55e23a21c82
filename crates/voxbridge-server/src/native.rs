//! UDP link to the native voice server.
//!
//! Every datagram, in both directions, is `[session id: u32 BE][codec frame]`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use voxbridge_common::{Error, SessionId};
use voxbridge_peer::AudioRouter;

pub const SESSION_PREFIX_SIZE: usize = 4;
pub const MAX_DATAGRAM_SIZE: usize = 1500;
const STATS_INTERVAL_SECS: u64 = 30;

pub fn encode_datagram(session: SessionId, frame: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SESSION_PREFIX_SIZE + frame.len());
    buf.put_u32(session);
    buf.put_slice(frame);
    buf.freeze()
}

/// Split a datagram into its session and frame. Empty frames are rejected.
pub fn decode_datagram(datagram: &[u8]) -> voxbridge_common::Result<(SessionId, &[u8])> {
    if datagram.len() <= SESSION_PREFIX_SIZE {
        return Err(Error::protocol(format!(
            "datagram of {} bytes carries no frame",
            datagram.len()
        )));
    }
    let (prefix, frame) = datagram.split_at(SESSION_PREFIX_SIZE);
    let session = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    Ok((session, frame))
}

pub struct NativeLink {
    socket: UdpSocket,
    voice_server: SocketAddr,
}

impl NativeLink {
    pub async fn bind(listen: SocketAddr, voice_server: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(listen).await?;
        info!(
            "Native link listening on {}, voice server at {}",
            socket.local_addr()?,
            voice_server
        );
        Ok(Self {
            socket,
            voice_server,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Frames from the voice server for browser users.
    pub async fn run(&self, router: Arc<AudioRouter>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut stats_interval = tokio::time::interval(Duration::from_secs(STATS_INTERVAL_SECS));

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (len, src) = result?;
                    match decode_datagram(&buf[..len]) {
                        Ok((session, frame)) => {
                            if !router.route_outbound(session, frame).await {
                                trace!("session {}: frame from {} not delivered", session, src);
                            }
                        }
                        Err(e) => debug!("Datagram from {} dropped: {}", src, e),
                    }
                }
                _ = stats_interval.tick() => {
                    let stats = router.stats();
                    debug!(
                        inbound = stats.inbound_frames,
                        inbound_dropped = stats.inbound_dropped,
                        malformed = stats.malformed_packets,
                        outbound = stats.outbound_packets,
                        outbound_dropped = stats.outbound_dropped,
                        "audio routing stats"
                    );
                }
            }
        }
    }

    /// Frames from browser users for the voice server's fan-out.
    pub async fn forward(&self, mut frames: mpsc::Receiver<(SessionId, Bytes)>) -> Result<()> {
        while let Some((session, frame)) = frames.recv().await {
            let datagram = encode_datagram(session, &frame);
            if let Err(e) = self.socket.send_to(&datagram, self.voice_server).await {
                warn!("session {}: failed to forward frame: {}", session, e);
            }
        }
        Ok(())
    }
}
