use bytes::Buf;

use crate::error::Error;
use crate::Result;

/// Size of the common RTCP header
pub const RTCP_HEADER_SIZE: usize = 4;

/// First RTCP packet type that collides with the RTP payload-type space
/// when RTP and RTCP share a port (RFC 5761 section 4).
const RTCP_PT_MIN: u8 = 192;
const RTCP_PT_MAX: u8 = 223;

/// True when a datagram received on a multiplexed port is RTCP.
///
/// Only the second byte is inspected: RTCP packet types 192..=223 map onto
/// RTP marker+PT values that RTP profiles never assign.
pub fn is_rtcp(data: &[u8]) -> bool {
    match data.get(1) {
        Some(&pt) => (RTCP_PT_MIN..=RTCP_PT_MAX).contains(&pt),
        None => false,
    }
}

/// The common header that prefixes every RTCP packet (RFC 3550 section 6.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    /// Protocol version
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Reception report / source count
    pub count: u8,
    /// Packet type (SR=200, RR=201, SDES=202, BYE=203, ...)
    pub packet_type: u8,
    /// Length in 32-bit words minus one
    pub length: u16,
}

impl RtcpHeader {
    /// Parse the common header of the first packet in a compound datagram
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RTCP_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTCP_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut buf = data;
        let b0 = buf.get_u8();
        let header = Self {
            version: b0 >> 6,
            padding: b0 & 0x20 != 0,
            count: b0 & 0x1f,
            packet_type: buf.get_u8(),
            length: buf.get_u16(),
        };

        if header.version != 2 {
            return Err(Error::invalid_packet(format!(
                "unsupported RTCP version {}",
                header.version
            )));
        }

        Ok(header)
    }

    /// Size of the packet including the header, in bytes
    pub fn packet_size(&self) -> usize {
        (self.length as usize + 1) * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demux_boundaries() {
        assert!(!is_rtcp(&[0x80, 191]));
        assert!(is_rtcp(&[0x80, 192]));
        assert!(is_rtcp(&[0x81, 200]));
        assert!(is_rtcp(&[0x80, 223]));
        assert!(!is_rtcp(&[0x80, 224]));
        assert!(!is_rtcp(&[0x80]));
        // marker set on PT 0 is plain RTP
        assert!(!is_rtcp(&[0x80, 0x80]));
    }

    #[test]
    fn test_parse_receiver_report_header() {
        let data = [0x81, 201, 0x00, 0x07];
        let header = RtcpHeader::parse(&data).unwrap();
        assert_eq!(header.count, 1);
        assert_eq!(header.packet_type, 201);
        assert_eq!(header.packet_size(), 32);
    }
}
