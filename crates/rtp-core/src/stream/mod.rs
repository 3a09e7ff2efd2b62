//! Generic media stream
//!
//! A [`Stream`] owns the RTP/RTCP path of one media line. Incoming packets
//! are classified for loss, passed through the jitter buffer and handed to
//! an [`RtpReceiver`]; outgoing packets are gated on the negotiated
//! direction and refresh the keepalive.
//!
//! Loss is reported in-band: the receiver is called with `payload: None`
//! before the packet that revealed the gap.

mod receiver;

pub use receiver::RtpReceiver;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::StreamConfig;
use crate::error::Error;
use crate::jitter::{FrameJitterBuffer, JitterBuffer, JitterStats};
use crate::keepalive::Keepalive;
use crate::media::{Direction, MediaDescription, SharedMedia};
use crate::packet::{is_rtcp, RtcpHeader, RtpHeader, RtpPacket};
use crate::sequence::SequenceTracker;
use crate::session::RtpSession;
use crate::stats::StreamStats;
use crate::transport::{Channel, MediaTransport, UdpTransport};
use crate::{Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// Receive-side state, touched only from the reactor
struct RxState {
    ssrc: Option<RtpSsrc>,
    seq: SequenceTracker,
    jbuf: Option<Box<dyn JitterBuffer>>,
    playout_started: bool,
}

struct StreamInner {
    name: String,
    config: StreamConfig,
    media: SharedMedia,
    session: Arc<RtpSession>,
    rx: Mutex<RxState>,
    stats: Mutex<StreamStats>,
    keepalive: Mutex<Option<Arc<Keepalive>>>,
    receiver: RwLock<Option<Arc<dyn RtpReceiver>>>,
    nack_pli: AtomicBool,
    rtcp_received: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One media line's RTP/RTCP stream. Cloning yields another handle to the
/// same stream.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    /// Allocate a stream on UDP sockets bound according to `config`.
    ///
    /// `label` is advertised as the `a=label` attribute when non-zero.
    /// Must be called from within a Tokio runtime.
    pub fn new(name: &str, label: u32, config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let transport = UdpTransport::bind(
            config.local_ip,
            config.rtp_ports,
            config.rtp_tos,
            config.rtcp_enable,
        )?;
        Self::with_transport(name, label, config, Arc::new(transport))
    }

    /// Allocate a stream on an existing transport
    pub fn with_transport(
        name: &str,
        label: u32,
        config: StreamConfig,
        transport: Arc<dyn MediaTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let jbuf: Option<Box<dyn JitterBuffer>> = if config.jbuf_enabled() {
            Some(Box::new(FrameJitterBuffer::with_thresholds(
                config.jbuf_delay.min,
                config.jbuf_delay.max,
                config.loss_thresholds,
            )?))
        } else {
            None
        };

        let mut media = MediaDescription::new(name);
        media.local_port = transport
            .local_addr(Channel::Rtp)
            .map(|a| a.port())
            .unwrap_or_default();
        if label != 0 {
            media.set_local_attr("label", Some(label.to_string()));
        }
        if config.rtcp_mux {
            media.set_local_attr("rtcp-mux", None);
        }

        let session = Arc::new(RtpSession::new(transport));
        debug!(
            "{}: stream allocated on port {} (ssrc={:08x}, jbuf={})",
            name,
            media.local_port,
            session.ssrc(),
            config.jbuf_delay
        );

        let inner = StreamInner {
            name: name.to_string(),
            rx: Mutex::new(RxState {
                ssrc: None,
                seq: SequenceTracker::new(config.loss_thresholds),
                jbuf,
                playout_started: false,
            }),
            config,
            media: media.shared(),
            session,
            stats: Mutex::new(StreamStats::default()),
            keepalive: Mutex::new(None),
            receiver: RwLock::new(None),
            nack_pli: AtomicBool::new(false),
            rtcp_received: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Install the handler for received packets
    pub fn set_receiver(&self, receiver: Arc<dyn RtpReceiver>) {
        *self.inner.receiver.write() = Some(receiver);
    }

    /// Replace the jitter buffer (or remove it with `None`)
    pub fn set_jitter_buffer(&self, jbuf: Option<Box<dyn JitterBuffer>>) {
        let mut rx = self.inner.rx.lock();
        rx.jbuf = jbuf;
        rx.playout_started = false;
    }

    /// Media name (`audio`, `video`)
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The negotiated media line
    pub fn media(&self) -> &SharedMedia {
        &self.inner.media
    }

    /// The configuration this stream was created with
    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    /// Sending side of the RTP session
    pub fn session(&self) -> &Arc<RtpSession> {
        &self.inner.session
    }

    /// Local RTP address
    pub fn local_rtp_addr(&self) -> Option<SocketAddr> {
        self.inner.session.transport().local_addr(Channel::Rtp)
    }

    /// Start the receive loops and the bitrate sampler
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let transport = Arc::clone(self.inner.session.transport());
        let recv_size = self.inner.config.recv_buffer_size;

        tasks.push(tokio::spawn(recv_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&transport),
            Channel::Rtp,
            recv_size,
        )));

        if self.inner.config.rtcp_enable && transport.local_addr(Channel::Rtcp).is_some() {
            tasks.push(tokio::spawn(recv_loop(
                Arc::downgrade(&self.inner),
                transport,
                Channel::Rtcp,
                recv_size,
            )));
        }

        tasks.push(tokio::spawn(stats_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.stats_interval,
        )));

        debug!("{}: stream started", self.inner.name);
    }

    /// (Re)create the keepalive.
    ///
    /// Nothing is started unless a method is configured and the peer offered
    /// at least one format. An unknown method is a configuration error.
    pub fn start_keepalive(&self) -> Result<()> {
        let mut slot = self.inner.keepalive.lock();
        if let Some(old) = slot.take() {
            old.stop();
        }

        let Some(method) = self.inner.config.keepalive.as_deref() else {
            return Ok(());
        };
        if self.inner.media.read().remote_formats.is_empty() {
            return Ok(());
        }

        let ka = Keepalive::new(
            method,
            Arc::clone(&self.inner.session),
            Arc::clone(&self.inner.media),
            self.inner.config.rtcp_mux,
            self.inner.config.keepalive_interval,
        )?;
        ka.start();
        *slot = Some(ka);
        Ok(())
    }

    /// The active keepalive, if any
    pub fn keepalive(&self) -> Option<Arc<Keepalive>> {
        self.inner.keepalive.lock().clone()
    }

    /// Stop all background tasks and the keepalive
    pub fn close(&self) {
        self.inner.stop_tasks();
    }

    /// Send one RTP packet.
    ///
    /// Returns `Ok(())` without sending when the peer address is unknown or
    /// the negotiated direction is not sendrecv.
    pub fn send(
        &self,
        marker: bool,
        payload_type: u8,
        ts: RtpTimestamp,
        payload: &[u8],
    ) -> Result<()> {
        let dest = {
            let media = self.inner.media.read();
            match media.remote_rtp {
                Some(dest) if media.negotiated_dir() == Direction::SendRecv => dest,
                _ => return Ok(()),
            }
        };

        self.inner.stats.lock().tx.record(payload.len());

        let result = self
            .inner
            .session
            .send(dest, marker, payload_type, ts, payload)
            .map(|_| ());

        if let Some(ka) = self.inner.keepalive.lock().as_ref() {
            ka.refresh(ts);
        }

        result
    }

    /// Feed one received RTP packet through loss classification and the
    /// jitter buffer, then deliver it.
    pub fn receive(&self, src: SocketAddr, packet: RtpPacket) {
        self.inner.receive(src, packet);
    }

    /// Apply the peer's description: negotiate RTCP multiplexing and record
    /// the RTCP destination.
    pub fn set_remote(&self, cname: Option<&str>) {
        let inner = &self.inner;
        let media = inner.media.read();

        if inner.config.rtcp_mux
            && media.remote_attr("rtcp-mux").is_some()
            && inner.session.enable_mux()
        {
            info!("{}: RTP/RTCP multiplexing enabled", inner.name);
        }

        let dest = if inner.session.is_mux() {
            media.remote_rtp
        } else {
            media.remote_rtcp.or_else(|| {
                media
                    .remote_rtp
                    .map(|a| SocketAddr::new(a.ip(), a.port().wrapping_add(1)))
            })
        };

        inner
            .session
            .set_rtcp_remote(dest, cname.map(str::to_string));
    }

    /// Decode the peer's media-level attributes
    pub fn decode_sdp_attributes(&self) {
        let media = self.inner.media.read();
        let nack = media
            .remote_attrs("rtcp-fb")
            .find(|attr| attr.contains("nack"))
            .map(str::to_string);
        drop(media);

        if let Some(attr) = nack {
            if !self.inner.nack_pli.swap(true, Ordering::Relaxed) {
                info!("{}: peer supports NACK PLI ({})", self.inner.name, attr);
            }
        }
    }

    /// True once the peer announced `rtcp-fb ... nack`
    pub fn supports_nack(&self) -> bool {
        self.inner.nack_pli.load(Ordering::Relaxed)
    }

    /// Put the stream on hold (sendonly) or resume it (sendrecv)
    pub fn hold(&self, hold: bool) {
        self.inner.media.write().local_dir = if hold {
            Direction::SendOnly
        } else {
            Direction::SendRecv
        };
    }

    /// Clock rates used for RTCP reports
    pub fn set_sample_rates(&self, srate_tx: u32, srate_rx: u32) {
        self.inner.session.set_sample_rates(srate_tx, srate_rx);
    }

    /// Flush the jitter buffer
    pub fn reset(&self) {
        let mut rx = self.inner.rx.lock();
        if let Some(jbuf) = rx.jbuf.as_mut() {
            jbuf.flush();
        }
        rx.playout_started = false;
    }

    /// Jitter buffer counters, `None` without a jitter buffer
    pub fn jitter_stats(&self) -> Option<JitterStats> {
        self.inner.rx.lock().jbuf.as_ref().map(|jb| jb.stats())
    }

    /// Advertise a bandwidth in bit/s as `b=AS`
    pub fn set_bandwidth(&self, bps: u32) {
        self.inner.media.write().bandwidth_as = Some(bps / 1024);
    }

    /// True when the peer offered a format on a non-zero port
    pub fn has_media(&self) -> bool {
        let media = self.inner.media.read();
        !media.remote_formats.is_empty() && media.remote_rtp.map_or(false, |a| a.port() != 0)
    }

    /// Traffic counters
    pub fn stats(&self) -> StreamStats {
        self.inner.stats.lock().clone()
    }

    /// Last SSRC seen from the peer
    pub fn remote_ssrc(&self) -> Option<RtpSsrc> {
        self.inner.rx.lock().ssrc
    }

    /// Last admitted sequence number
    pub fn last_sequence(&self) -> Option<RtpSequenceNumber> {
        self.inner.rx.lock().seq.last()
    }

    /// RTCP packets received so far
    pub fn rtcp_received(&self) -> u64 {
        self.inner.rtcp_received.load(Ordering::Relaxed)
    }

    /// Multi-line state dump
    pub fn debug_summary(&self) -> String {
        let media = self.inner.media.read();
        let rtcp = self.inner.session.rtcp_state();
        let fmt_addr = |a: Option<SocketAddr>| a.map_or_else(|| "-".to_string(), |a| a.to_string());

        let mut out = format!(
            " {} dir={}\n remote: {}/{} cname={}\n",
            self.inner.name,
            media.negotiated_dir(),
            fmt_addr(media.remote_rtp),
            fmt_addr(rtcp.dest),
            rtcp.cname.as_deref().unwrap_or("-"),
        );
        drop(media);

        out.push_str(&format!(
            " rtp: ssrc={:08x} seq={} mux={} srate={}/{}\n",
            self.inner.session.ssrc(),
            self.inner.session.next_sequence(),
            rtcp.mux,
            rtcp.srate_tx,
            rtcp.srate_rx
        ));

        match self.jitter_stats() {
            Some(s) => out.push_str(&format!(
                " jbuf: put={} get={} or={} ur={}\n",
                s.put, s.get, s.overflow, s.underflow
            )),
            None => out.push_str(" jbuf: (not available)\n"),
        }
        out
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.inner.stats.lock();
        write!(f, "{}={}/{}", self.inner.name, stats.tx.bitrate, stats.rx.bitrate)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.inner.name)
            .field("session", &self.inner.session)
            .finish()
    }
}

impl StreamInner {
    fn receive(&self, src: SocketAddr, packet: RtpPacket) {
        let RtpPacket { header, payload } = packet;

        if payload.is_empty() {
            return;
        }
        if !self.media.read().negotiated_dir().can_recv() {
            return;
        }

        self.stats.lock().rx.record(payload.len());

        let mut deliveries: Vec<(RtpHeader, Option<Bytes>)> = Vec::with_capacity(2);
        {
            let mut rx = self.rx.lock();
            let RxState {
                ssrc,
                seq,
                jbuf,
                playout_started,
            } = &mut *rx;

            let mut flush = false;
            if *ssrc != Some(header.ssrc) {
                if let Some(old) = *ssrc {
                    flush = true;
                    info!(
                        "{}: SSRC changed {:08x} -> {:08x} ({} bytes from {})",
                        self.name,
                        old,
                        header.ssrc,
                        payload.len(),
                        src
                    );
                }
                *ssrc = Some(header.ssrc);
            }

            match jbuf.as_mut() {
                Some(jb) => {
                    if flush {
                        jb.flush();
                    }

                    let len = payload.len();
                    if let Err(e) = jb.put(&header, payload) {
                        debug!("{}: dropping {} bytes from {} ({})", self.name, len, src, e);
                    }

                    let (out_hdr, out_payload) = match jb.get() {
                        Some((h, p)) => (h, Some(p)),
                        None if !*playout_started => return,
                        None => (RtpHeader::default(), None),
                    };
                    *playout_started = true;

                    if seq.update(out_hdr.sequence_number).lost() > 0 {
                        deliveries.push((header, None));
                    }
                    deliveries.push((out_hdr, out_payload));
                }
                None => {
                    let lost = seq.update(header.sequence_number).lost();
                    if lost > 0 {
                        trace!("{}: {} packets lost before seq={}", self.name, lost, header.sequence_number);
                        deliveries.push((header, None));
                    }
                    deliveries.push((header, Some(payload)));
                }
            }
        }

        let Some(receiver) = self.receiver.read().clone() else {
            return;
        };
        for (hdr, payload) in deliveries {
            receiver.on_rtp(&hdr, payload);
        }
    }

    fn handle_datagram(&self, channel: Channel, data: &[u8], src: SocketAddr) {
        if channel == Channel::Rtcp || (self.session.is_mux() && is_rtcp(data)) {
            self.handle_rtcp(data, src);
            return;
        }

        match RtpPacket::parse(data) {
            Ok(packet) => self.receive(src, packet),
            Err(e) => debug!("{}: bad RTP packet from {}: {}", self.name, src, e),
        }
    }

    fn handle_rtcp(&self, data: &[u8], src: SocketAddr) {
        match RtcpHeader::parse(data) {
            Ok(hdr) => {
                self.rtcp_received.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "{}: RTCP pt={} count={} len={} from {}",
                    self.name,
                    hdr.packet_type,
                    hdr.count,
                    data.len(),
                    src
                );
            }
            Err(e) => debug!("{}: bad RTCP packet from {}: {}", self.name, src, e),
        }
    }

    fn stop_tasks(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        if let Some(ka) = self.keepalive.lock().take() {
            ka.stop();
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
        debug!("{}: stream destroyed", self.name);
    }
}

async fn recv_loop(
    weak: Weak<StreamInner>,
    transport: Arc<dyn MediaTransport>,
    channel: Channel,
    size: usize,
) {
    let mut buf = vec![0u8; size];

    loop {
        let (n, src) = match transport.recv_from(channel, &mut buf).await {
            Ok(v) => v,
            Err(Error::Closed) => break,
            Err(e) => {
                if weak.strong_count() == 0 {
                    break;
                }
                warn!("{} receive error: {}", channel, e);
                continue;
            }
        };

        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.handle_datagram(channel, &buf[..n], src);
    }
}

async fn stats_loop(weak: Weak<StreamInner>, period: std::time::Duration) {
    // first tick completes immediately and only records the reference time
    let mut ticker = tokio::time::interval(period);

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let now = tokio::time::Instant::now().into_std();
        if inner.stats.lock().sample(now) {
            trace!("{}: bitrate sampled", inner.name);
        }
    }
}
