use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// Fixed RTP header size without CSRCs or extensions
pub const RTP_HEADER_SIZE: usize = 12;

/// RTP protocol version carried in every packet we emit
pub const RTP_VERSION: u8 = 2;

/// RTP fixed header (RFC 3550 section 5.1)
///
/// `Default` yields an all-zero header; the stream uses it as the
/// placeholder header for a packet the jitter buffer could not produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtpHeader {
    /// Protocol version
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Header extension flag
    pub extension: bool,
    /// Number of CSRC identifiers that followed the fixed header
    pub csrc_count: u8,
    /// Marker bit
    pub marker: bool,
    /// Payload type (7 bits)
    pub payload_type: u8,
    /// Sequence number
    pub sequence_number: RtpSequenceNumber,
    /// Media timestamp
    pub timestamp: RtpTimestamp,
    /// Synchronization source
    pub ssrc: RtpSsrc,
}

impl RtpHeader {
    /// Create a version 2 header with no CSRCs or extensions
    pub fn new(
        marker: bool,
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
    ) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker,
            payload_type: payload_type & 0x7f,
            sequence_number,
            timestamp,
            ssrc,
        }
    }

    /// Write the fixed header (CSRC list and extension are never emitted)
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8((RTP_VERSION << 6) | if self.padding { 0x20 } else { 0 });
        buf.put_u8(if self.marker { 0x80 } else { 0 } | (self.payload_type & 0x7f));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }
}

/// A decoded RTP packet: header plus payload with CSRCs, header
/// extension and padding already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Packet header
    pub header: RtpHeader,
    /// Payload bytes
    pub payload: Bytes,
}

impl RtpPacket {
    /// Create a new packet
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Parse a packet from a datagram
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTP_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut buf = data;
        let b0 = buf.get_u8();
        let b1 = buf.get_u8();

        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(Error::invalid_packet(format!("unsupported RTP version {}", version)));
        }

        let header = RtpHeader {
            version,
            padding: b0 & 0x20 != 0,
            extension: b0 & 0x10 != 0,
            csrc_count: b0 & 0x0f,
            marker: b1 & 0x80 != 0,
            payload_type: b1 & 0x7f,
            sequence_number: buf.get_u16(),
            timestamp: buf.get_u32(),
            ssrc: buf.get_u32(),
        };

        let csrc_len = header.csrc_count as usize * 4;
        if buf.remaining() < csrc_len {
            return Err(Error::BufferTooSmall {
                required: csrc_len,
                available: buf.remaining(),
            });
        }
        buf.advance(csrc_len);

        if header.extension {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }
            let _profile = buf.get_u16();
            let ext_len = buf.get_u16() as usize * 4;
            if buf.remaining() < ext_len {
                return Err(Error::BufferTooSmall {
                    required: ext_len,
                    available: buf.remaining(),
                });
            }
            buf.advance(ext_len);
        }

        let mut payload_len = buf.remaining();
        if header.padding {
            let pad = match buf.last() {
                Some(&p) => p as usize,
                None => return Err(Error::invalid_packet("padding flag set on empty payload")),
            };
            if pad == 0 || pad > payload_len {
                return Err(Error::invalid_packet(format!("bad padding length {}", pad)));
            }
            payload_len -= pad;
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&buf[..payload_len]),
        })
    }

    /// Serialize the packet into a fresh buffer
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + self.payload.len());
        let mut header = self.header;
        header.padding = false;
        header.serialize(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Total size on the wire
    pub fn size(&self) -> usize {
        RTP_HEADER_SIZE + self.payload.len()
    }
}
