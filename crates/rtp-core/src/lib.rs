//! RTP/RTCP stream transport
//!
//! This crate moves RTP between a UDP socket and a media consumer:
//!
//! - [`packet`]: RTP header codec and RTCP demultiplexing
//! - [`sequence`]: loss, duplicate and reorder classification
//! - [`jitter`]: jitter buffer contract and a frame-counting implementation
//! - [`stream`]: the per-media-line [`Stream`]
//! - [`keepalive`]: NAT keepalive attached to a stream
//! - [`transport`]: UDP and in-memory datagram transports

pub mod config;
pub mod error;
pub mod jitter;
pub mod keepalive;
pub mod media;
pub mod packet;
pub mod sequence;
pub mod session;
pub mod stats;
pub mod stream;
pub mod stun;
pub mod transport;

/// RTP sequence number
pub type RtpSequenceNumber = u16;

/// RTP timestamp
pub type RtpTimestamp = u32;

/// RTP synchronization source identifier
pub type RtpSsrc = u32;

pub use config::{StreamConfig, StreamConfigBuilder};
pub use error::Error;
pub use jitter::{FrameJitterBuffer, JitterBuffer, JitterStats};
pub use keepalive::{Keepalive, KeepaliveMethod, KeepaliveOutcome};
pub use media::{Direction, MediaDescription, PayloadFormat, SharedMedia};
pub use packet::{RtpHeader, RtpPacket};
pub use sequence::{LossThresholds, SequenceOutcome, SequenceTracker};
pub use session::RtpSession;
pub use stats::StreamStats;
pub use stream::{RtpReceiver, Stream};
pub use transport::{Channel, MediaTransport, MemoryTransport, UdpTransport};

/// Result type for stream transport operations
pub type Result<T> = std::result::Result<T, Error>;
