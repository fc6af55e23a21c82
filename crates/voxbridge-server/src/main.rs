#![forbid(unsafe_code)]

//! Voxbridge server - lets browser voice clients join a native voice server.
//!
//! The server:
//! 1. Negotiates one WebRTC peer connection per native session via the signaling gateway
//! 2. Unwraps RTP from browser data channels and hands frames to the voice server
//! 3. Frames the voice server's audio as RTP for each connected browser

mod gateway;
mod native;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use gateway::GatewayClient;
use native::NativeLink;
use tokio::sync::mpsc;
use tracing::info;
use voxbridge_common::BridgeConfig;
use voxbridge_peer::{
    AudioRouter, ChannelFanout, RtcConnector, SessionRegistry, SignalingCoordinator,
};

const DEFAULT_FANOUT_QUEUE: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "voxbridge-server")]
#[command(about = "Voxbridge server - bridges browser voice clients into a native voice server")]
struct Args {
    /// Signaling gateway WebSocket URL
    #[arg(long, env = "VOXBRIDGE_GATEWAY_URL", default_value = "ws://127.0.0.1:8080/bridge")]
    gateway_url: String,

    /// UDP listen address for the native voice link
    #[arg(long, env = "VOXBRIDGE_LISTEN", default_value = "127.0.0.1:5050")]
    listen: SocketAddr,

    /// Voice server address receiving frames from browser users
    #[arg(long, env = "VOXBRIDGE_VOICE_SERVER", default_value = "127.0.0.1:5051")]
    voice_server: SocketAddr,

    /// Frames queued for the voice server before new ones are dropped
    #[arg(long, default_value_t = DEFAULT_FANOUT_QUEUE)]
    fanout_queue: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if !args.listen.ip().is_loopback() && !env_bool("VOXBRIDGE_ALLOW_PUBLIC_BIND", false) {
        return Err(anyhow!(
            "refusing non-loopback native link bind without VOXBRIDGE_ALLOW_PUBLIC_BIND=1"
        ));
    }
    if args.fanout_queue == 0 {
        return Err(anyhow!("--fanout-queue must be at least 1"));
    }

    voxbridge_common::init_tracing_with_default(&format!(
        "{},webrtc=warn,tokio_tungstenite=warn",
        args.log_level
    ));

    info!("Starting voxbridge-server v{}", env!("CARGO_PKG_VERSION"));

    let config = BridgeConfig::from_env()?;
    info!(
        "Audio: {} Hz, {} channel(s), {} ms frames, max {} bps, {} data channel \"{}\"",
        config.audio_sample_rate,
        config.audio_channels,
        config.frame_duration_ms,
        config.max_bitrate_bps,
        if config.reliable_data_channel {
            "reliable"
        } else {
            "unreliable"
        },
        config.channel_label
    );

    let connector = RtcConnector::new()?;
    let registry = Arc::new(SessionRegistry::new(Arc::new(connector), config));

    let (fanout_tx, fanout_rx) = mpsc::channel(args.fanout_queue);
    let router = Arc::new(AudioRouter::new(
        registry.clone(),
        Arc::new(ChannelFanout::new(fanout_tx)),
    ));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let coordinator = Arc::new(SignalingCoordinator::new(
        registry.clone(),
        router.clone(),
        events_tx,
    ));

    let link = NativeLink::bind(args.listen, args.voice_server).await?;
    let gateway = GatewayClient::new(args.gateway_url, coordinator);

    let result = tokio::select! {
        result = link.run(router) => result,
        result = link.forward(fanout_rx) => result,
        result = gateway.run(events_rx) => result,
        result = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            result.map_err(Into::into)
        }
    };

    registry.clear().await;
    info!("voxbridge-server stopped");
    result
}
