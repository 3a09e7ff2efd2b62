//! RTP sender state and RTCP bookkeeping shared by a stream and its keepalive

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace};

use crate::packet::{RtpHeader, RTP_HEADER_SIZE};
use crate::transport::{Channel, MediaTransport};
use crate::{Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTCP parameters of a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtcpState {
    /// RTCP shares the RTP socket
    pub mux: bool,
    /// Clock rate of the outgoing media
    pub srate_tx: u32,
    /// Clock rate of the incoming media
    pub srate_rx: u32,
    /// Canonical name announced in SDES
    pub cname: Option<String>,
    /// Where RTCP is sent
    pub dest: Option<SocketAddr>,
}

/// Sending side of an RTP session on top of a [`MediaTransport`]
pub struct RtpSession {
    transport: Arc<dyn MediaTransport>,
    ssrc: RtpSsrc,
    sequence: Mutex<RtpSequenceNumber>,
    rtcp: Mutex<RtcpState>,
}

impl RtpSession {
    /// Create a session with a random SSRC and initial sequence number
    pub fn new(transport: Arc<dyn MediaTransport>) -> Self {
        let mut rng = rand::thread_rng();
        Self::with_ssrc(transport, rng.gen(), rng.gen())
    }

    /// Create a session with a fixed SSRC and initial sequence number
    pub fn with_ssrc(
        transport: Arc<dyn MediaTransport>,
        ssrc: RtpSsrc,
        initial_seq: RtpSequenceNumber,
    ) -> Self {
        Self {
            transport,
            ssrc,
            sequence: Mutex::new(initial_seq),
            rtcp: Mutex::new(RtcpState::default()),
        }
    }

    /// Our SSRC
    pub fn ssrc(&self) -> RtpSsrc {
        self.ssrc
    }

    /// The underlying transport
    pub fn transport(&self) -> &Arc<dyn MediaTransport> {
        &self.transport
    }

    /// Sequence number the next packet will carry
    pub fn next_sequence(&self) -> RtpSequenceNumber {
        *self.sequence.lock()
    }

    /// Send one RTP packet and return its size on the wire
    pub fn send(
        &self,
        dest: SocketAddr,
        marker: bool,
        payload_type: u8,
        timestamp: RtpTimestamp,
        payload: &[u8],
    ) -> Result<usize> {
        let seq = {
            let mut next = self.sequence.lock();
            let seq = *next;
            *next = seq.wrapping_add(1);
            seq
        };

        let header = RtpHeader::new(marker, payload_type, seq, timestamp, self.ssrc);
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + payload.len());
        header.serialize(&mut buf);
        buf.put_slice(payload);

        self.transport.send_to(Channel::Rtp, &buf, dest)?;
        trace!(
            "rtp: sent seq={} ts={} pt={} m={} len={} to {}",
            seq,
            timestamp,
            payload_type,
            marker,
            buf.len(),
            dest
        );
        Ok(buf.len())
    }

    /// Send a raw datagram on the RTP channel
    pub fn send_raw(&self, dest: SocketAddr, data: &[u8]) -> Result<()> {
        self.transport.send_to(Channel::Rtp, data, dest)
    }

    /// Switch RTCP onto the RTP socket. Returns true on the first call only.
    pub fn enable_mux(&self) -> bool {
        let mut rtcp = self.rtcp.lock();
        if rtcp.mux {
            return false;
        }
        rtcp.mux = true;
        debug!("rtcp-mux enabled for ssrc={:08x}", self.ssrc);
        true
    }

    /// True when RTCP is multiplexed
    pub fn is_mux(&self) -> bool {
        self.rtcp.lock().mux
    }

    /// Record RTCP destination and canonical name
    pub fn set_rtcp_remote(&self, dest: Option<SocketAddr>, cname: Option<String>) {
        let mut rtcp = self.rtcp.lock();
        rtcp.dest = dest;
        if cname.is_some() {
            rtcp.cname = cname;
        }
    }

    /// Clock rates used for RTCP reports
    pub fn set_sample_rates(&self, srate_tx: u32, srate_rx: u32) {
        let mut rtcp = self.rtcp.lock();
        if srate_tx != 0 {
            rtcp.srate_tx = srate_tx;
        }
        if srate_rx != 0 {
            rtcp.srate_rx = srate_rx;
        }
    }

    /// Snapshot of the RTCP parameters
    pub fn rtcp_state(&self) -> RtcpState {
        self.rtcp.lock().clone()
    }
}

impl std::fmt::Debug for RtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpSession")
            .field("ssrc", &self.ssrc)
            .field("sequence", &*self.sequence.lock())
            .field("rtcp", &*self.rtcp.lock())
            .finish()
    }
}
