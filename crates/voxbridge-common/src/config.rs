use crate::{Error, Result};

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_FRAME_MS: u32 = 20;
/// 64 kbps, a typical ceiling for mono Opus voice.
pub const DEFAULT_MAX_BITRATE_BPS: u32 = 64_000;
pub const DEFAULT_CHANNEL_LABEL: &str = "audio";

/// Settings for the WebRTC side of the bridge.
///
/// Sample rate, channel count and bitrate are informational: the bridge never decodes
/// audio. The sample rate and frame duration only drive RTP timestamp increments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// STUN/TURN URIs handed to every new peer connection.
    pub ice_servers: Vec<String>,
    pub audio_sample_rate: u32,
    pub audio_channels: u8,
    pub frame_duration_ms: u32,
    /// Advisory only.
    pub max_bitrate_bps: u32,
    /// Ordered with unlimited retransmits when true, unordered best-effort otherwise.
    pub reliable_data_channel: bool,
    pub channel_label: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            audio_sample_rate: DEFAULT_SAMPLE_RATE,
            audio_channels: 1,
            frame_duration_ms: DEFAULT_FRAME_MS,
            max_bitrate_bps: DEFAULT_MAX_BITRATE_BPS,
            reliable_data_channel: true,
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Build a config from `VOXBRIDGE_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`BridgeConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("VOXBRIDGE_ICE_SERVERS") {
            config.ice_servers = parse_list(&value);
        }
        if let Some(value) = lookup("VOXBRIDGE_SAMPLE_RATE") {
            config.audio_sample_rate = parse_number("VOXBRIDGE_SAMPLE_RATE", &value)?;
        }
        if let Some(value) = lookup("VOXBRIDGE_CHANNELS") {
            config.audio_channels = parse_number("VOXBRIDGE_CHANNELS", &value)?;
        }
        if let Some(value) = lookup("VOXBRIDGE_FRAME_MS") {
            config.frame_duration_ms = parse_number("VOXBRIDGE_FRAME_MS", &value)?;
        }
        if let Some(value) = lookup("VOXBRIDGE_MAX_BITRATE") {
            config.max_bitrate_bps = parse_number("VOXBRIDGE_MAX_BITRATE", &value)?;
        }
        if let Some(value) = lookup("VOXBRIDGE_RELIABLE_CHANNEL") {
            config.reliable_data_channel = parse_bool("VOXBRIDGE_RELIABLE_CHANNEL", &value)?;
        }
        if let Some(value) = lookup("VOXBRIDGE_CHANNEL_LABEL") {
            let label = value.trim();
            if !label.is_empty() {
                config.channel_label = label.to_string();
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio_sample_rate == 0 {
            return Err(Error::config("audio sample rate must be non-zero"));
        }
        if self.audio_channels == 0 {
            return Err(Error::config("audio channel count must be non-zero"));
        }
        if self.frame_duration_ms == 0 {
            return Err(Error::config("frame duration must be non-zero"));
        }
        match self.frame_samples() {
            0 => Err(Error::config(format!(
                "{} ms frames at {} Hz hold no whole sample",
                self.frame_duration_ms, self.audio_sample_rate
            ))),
            samples if samples > u64::from(u32::MAX) => Err(Error::config(format!(
                "{} ms frames at {} Hz overflow the RTP timestamp step",
                self.frame_duration_ms, self.audio_sample_rate
            ))),
            _ => Ok(()),
        }
    }

    /// RTP timestamp increment for one codec frame. Saturates for configs that fail
    /// [`BridgeConfig::validate`].
    pub fn samples_per_frame(&self) -> u32 {
        u32::try_from(self.frame_samples()).unwrap_or(u32::MAX)
    }

    fn frame_samples(&self) -> u64 {
        u64::from(self.audio_sample_rate) * u64::from(self.frame_duration_ms) / 1000
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("{name} is not a valid boolean: {value:?}"))),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| Error::config(format!("{name} is not a valid number: {value:?}")))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
