//! RTP and RTCP wire formats

pub mod rtcp;
pub mod rtp;

pub use rtcp::{is_rtcp, RtcpHeader};
pub use rtp::{RtpHeader, RtpPacket, RTP_HEADER_SIZE, RTP_VERSION};
