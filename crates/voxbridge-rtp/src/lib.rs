//! RTP framing for opaque codec frames.
//!
//! This crate provides:
//! - Inbound parsing tolerant of CSRC lists and header extensions
//! - Outbound framing in the minimal 12-byte form
//! - Per-session sequence/timestamp/SSRC tracking for outbound streams
//!
//! The payload is never interpreted: native frames cross the bridge byte for byte.

#![forbid(unsafe_code)]

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

pub const RTP_VERSION: u8 = 2;

/// Fixed RTP header (12 bytes)
/// [V/P/X/CC (1B)][M/PT (1B)][Sequence (2B)][Timestamp (4B)][SSRC (4B)]
pub const RTP_HEADER_SIZE: usize = 12;

/// Dynamic payload type conventionally negotiated for Opus.
pub const OPUS_PAYLOAD_TYPE: u8 = 111;

/// Version 2, no padding, no extension, zero CSRCs.
const OUTBOUND_FIRST_BYTE: u8 = RTP_VERSION << 6;
const EXTENSION_FLAG: u8 = 0x10;
const CSRC_COUNT_MASK: u8 = 0x0F;
const MARKER_FLAG: u8 = 0x80;
const PAYLOAD_TYPE_MASK: u8 = 0x7F;
const CSRC_SIZE: usize = 4;
const EXTENSION_HEADER_SIZE: usize = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RtpError {
    #[error("packet too short: {0}")]
    TooShort(usize),
    #[error("header length {header_len} leaves no payload in {packet_len} byte packet")]
    HeaderOverrun {
        header_len: usize,
        packet_len: usize,
    },
}

impl RtpError {
    /// Whether the packet was long enough to be RTP but had no valid payload boundary.
    pub fn is_malformed(&self) -> bool {
        matches!(self, RtpError::HeaderOverrun { .. })
    }
}

/// Fields written to (or read from) the fixed RTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl Default for RtpHeader {
    fn default() -> Self {
        Self {
            marker: false,
            payload_type: OPUS_PAYLOAD_TYPE,
            sequence: 0,
            timestamp: 0,
            ssrc: 0,
        }
    }
}

impl RtpHeader {
    /// Frame `payload` behind this header in the minimal 12-byte form.
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + payload.len());
        buf.put_u8(OUTBOUND_FIRST_BYTE);
        let marker = if self.marker { MARKER_FLAG } else { 0 };
        buf.put_u8(marker | (self.payload_type & PAYLOAD_TYPE_MASK));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(payload);
        buf.freeze()
    }
}

/// Result of locating the payload boundary of an inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    pub header: RtpHeader,
    pub csrc_count: u8,
    pub has_extension: bool,
    /// Offset of the first payload byte.
    pub header_len: usize,
}

/// Parse the fixed header and skip any CSRC list and header extension.
pub fn parse_header(packet: &[u8]) -> Result<ParsedHeader, RtpError> {
    if packet.len() < RTP_HEADER_SIZE {
        return Err(RtpError::TooShort(packet.len()));
    }

    let csrc_count = packet[0] & CSRC_COUNT_MASK;
    let has_extension = packet[0] & EXTENSION_FLAG != 0;
    let mut header_len = RTP_HEADER_SIZE + CSRC_SIZE * csrc_count as usize;

    // An extension whose own header is cut off is ignored; the overrun check below
    // still rejects the packet if nothing is left for a payload.
    if has_extension && packet.len() >= header_len + EXTENSION_HEADER_SIZE {
        let words = u16::from_be_bytes([packet[header_len + 2], packet[header_len + 3]]);
        header_len += EXTENSION_HEADER_SIZE + 4 * words as usize;
    }

    if header_len >= packet.len() {
        return Err(RtpError::HeaderOverrun {
            header_len,
            packet_len: packet.len(),
        });
    }

    Ok(ParsedHeader {
        header: RtpHeader {
            marker: packet[1] & MARKER_FLAG != 0,
            payload_type: packet[1] & PAYLOAD_TYPE_MASK,
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        },
        csrc_count,
        has_extension,
        header_len,
    })
}

/// Strip the RTP header from an inbound packet and return the codec payload.
///
/// Inputs shorter than a fixed header are passed through untouched. Packets whose
/// header runs to or past the end yield an empty frame.
pub fn decode(packet: Bytes) -> Bytes {
    match parse_header(&packet) {
        Ok(parsed) => packet.slice(parsed.header_len..),
        Err(RtpError::TooShort(len)) => {
            trace!("passing through {} byte non-RTP frame", len);
            packet
        }
        Err(err) => {
            trace!("dropping malformed RTP packet: {}", err);
            Bytes::new()
        }
    }
}

/// Frame a native codec frame with a zeroed sequence number, timestamp and SSRC.
pub fn encode(frame: &[u8]) -> Bytes {
    RtpHeader::default().encode(frame)
}

/// Outbound stream state for one session.
///
/// Sequence numbers advance by one and timestamps by one frame's worth of samples per
/// packet, both wrapping.
#[derive(Debug, Clone)]
pub struct RtpSequencer {
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    samples_per_frame: u32,
}

impl RtpSequencer {
    /// Start a stream with a random SSRC, sequence number and timestamp.
    pub fn new(samples_per_frame: u32) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        Self::with_start(rng.gen(), rng.gen(), rng.gen(), samples_per_frame)
    }

    pub fn with_start(ssrc: u32, sequence: u16, timestamp: u32, samples_per_frame: u32) -> Self {
        Self {
            payload_type: OPUS_PAYLOAD_TYPE,
            ssrc,
            sequence,
            timestamp,
            samples_per_frame,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn next_header(&mut self) -> RtpHeader {
        let header = RtpHeader {
            marker: false,
            payload_type: self.payload_type,
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_frame);
        header
    }

    /// Frame the next packet of this stream.
    pub fn stamp(&mut self, frame: &[u8]) -> Bytes {
        self.next_header().encode(frame)
    }
}
