//! Error types for the RTP stream transport

use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised by the RTP transport, stream and keepalive layers
#[derive(Error, Debug)]
pub enum Error {
    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not enough bytes to decode a packet
    #[error("Buffer too small: need {required} bytes, have {available}")]
    BufferTooSmall { required: usize, available: usize },

    /// The packet is not a valid RTP/RTCP/STUN packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// A configuration value is unusable (e.g. unknown keepalive method)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No free port in the configured RTP port range
    #[error("No RTP port available in range {min}-{max}")]
    NoPortAvailable { min: u32, max: u32 },

    /// The remote address needed for an operation is not known yet
    #[error("Remote address not set")]
    NoRemoteAddress,

    /// The jitter buffer refused a packet
    #[error("Jitter buffer rejected packet seq={seq}: {reason}")]
    JitterBuffer { seq: u16, reason: String },

    /// Datagram was only partially written
    #[error("Short write to {dest}: {written} of {len} bytes")]
    ShortWrite {
        dest: SocketAddr,
        written: usize,
        len: usize,
    },

    /// The stream has been closed
    #[error("Stream closed")]
    Closed,
}

impl Error {
    /// Create a new invalid configuration error
    pub fn invalid_config(details: impl Into<String>) -> Self {
        Self::InvalidConfig(details.into())
    }

    /// Create a new invalid packet error
    pub fn invalid_packet(details: impl Into<String>) -> Self {
        Self::InvalidPacket(details.into())
    }

    /// Whether the failing operation can simply be retried later.
    ///
    /// Configuration and allocation failures are permanent for the
    /// operation that triggered them; per-packet failures are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidConfig(_) | Self::NoPortAvailable { .. } | Self::Closed => false,
            Self::Io(_)
            | Self::BufferTooSmall { .. }
            | Self::InvalidPacket(_)
            | Self::NoRemoteAddress
            | Self::JitterBuffer { .. }
            | Self::ShortWrite { .. } => true,
        }
    }
}
