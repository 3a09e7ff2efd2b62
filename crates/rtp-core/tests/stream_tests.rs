//! Stream transport integration tests
//!
//! Receive-path classification, jitter buffer interaction, send gating,
//! RTCP mux negotiation and keepalive wiring, driven through the
//! in-memory transport.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use voxmedia_rtp_core::{
    Channel, Direction, FrameJitterBuffer, JitterBuffer, JitterStats, MemoryTransport,
    PayloadFormat, RtpHeader, RtpPacket, Stream, StreamConfig,
};

type Delivered = Arc<Mutex<Vec<(RtpHeader, Option<Bytes>)>>>;

fn local() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

fn peer() -> SocketAddr {
    "127.0.0.1:50000".parse().unwrap()
}

fn packet(ssrc: u32, seq: u16) -> RtpPacket {
    RtpPacket::new(
        RtpHeader::new(false, 0, seq, seq as u32 * 160, ssrc),
        Bytes::from(vec![0xd5; 160]),
    )
}

fn stream_with(config: StreamConfig) -> (Stream, Arc<MemoryTransport>, Delivered) {
    let transport = Arc::new(MemoryTransport::new(local()));
    let stream = Stream::with_transport("audio", 1, config, transport.clone()).unwrap();

    let delivered: Delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    stream.set_receiver(Arc::new(move |hdr: &RtpHeader, payload: Option<Bytes>| {
        sink.lock().push((*hdr, payload));
    }));

    (stream, transport, delivered)
}

fn negotiate(stream: &Stream) {
    let mut media = stream.media().write();
    media.remote_rtp = Some(peer());
    media.remote_formats.push(PayloadFormat::new(0, "PCMU", 8000, 1));
}

/// Summary of deliveries as (seq, has_payload)
fn summary(delivered: &Delivered) -> Vec<(u16, bool)> {
    delivered
        .lock()
        .iter()
        .map(|(h, p)| (h.sequence_number, p.is_some()))
        .collect()
}

#[tokio::test]
async fn test_gap_reports_loss_before_packet() {
    let (stream, _, delivered) = stream_with(StreamConfig::builder().no_jbuf().build().unwrap());

    stream.receive(peer(), packet(1, 1));
    stream.receive(peer(), packet(1, 4));

    assert_eq!(summary(&delivered), vec![(1, true), (4, false), (4, true)]);
    assert_eq!(stream.last_sequence(), Some(4));
    assert_eq!(stream.remote_ssrc(), Some(1));
    assert_eq!(stream.stats().rx.packets, 2);
}

#[tokio::test]
async fn test_duplicate_and_reordered_are_delivered_without_loss() {
    let (stream, _, delivered) = stream_with(StreamConfig::builder().no_jbuf().build().unwrap());

    stream.receive(peer(), packet(1, 10));
    stream.receive(peer(), packet(1, 10));
    stream.receive(peer(), packet(1, 8));

    assert_eq!(summary(&delivered), vec![(10, true), (10, true), (8, true)]);
    assert_eq!(stream.last_sequence(), Some(10));
}

#[tokio::test]
async fn test_forward_jump_restarts_without_loss() {
    let (stream, _, delivered) = stream_with(StreamConfig::builder().no_jbuf().build().unwrap());

    stream.receive(peer(), packet(1, 100));
    stream.receive(peer(), packet(1, 5100));

    assert_eq!(summary(&delivered), vec![(100, true), (5100, true)]);
    assert_eq!(stream.last_sequence(), Some(5100));
}

#[tokio::test]
async fn test_empty_payload_and_hold_are_dropped() {
    let (stream, _, delivered) = stream_with(StreamConfig::builder().no_jbuf().build().unwrap());

    let empty = RtpPacket::new(RtpHeader::new(false, 0, 1, 0, 1), Bytes::new());
    stream.receive(peer(), empty);

    stream.hold(true);
    stream.receive(peer(), packet(1, 2));
    assert!(delivered.lock().is_empty());
    assert_eq!(stream.stats().rx.packets, 0);

    stream.hold(false);
    stream.receive(peer(), packet(1, 3));
    assert_eq!(summary(&delivered), vec![(3, true)]);
}

/// Jitter buffer that counts flushes
struct CountingJitterBuffer {
    inner: FrameJitterBuffer,
    flushes: Arc<AtomicUsize>,
}

impl JitterBuffer for CountingJitterBuffer {
    fn put(&mut self, header: &RtpHeader, payload: Bytes) -> voxmedia_rtp_core::Result<()> {
        self.inner.put(header, payload)
    }

    fn get(&mut self) -> Option<(RtpHeader, Bytes)> {
        self.inner.get()
    }

    fn flush(&mut self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.inner.flush();
    }

    fn stats(&self) -> JitterStats {
        self.inner.stats()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[tokio::test]
async fn test_ssrc_change_flushes_once() {
    let (stream, _, delivered) = stream_with(StreamConfig::default());
    let flushes = Arc::new(AtomicUsize::new(0));
    stream.set_jitter_buffer(Some(Box::new(CountingJitterBuffer {
        inner: FrameJitterBuffer::new(1, 10).unwrap(),
        flushes: flushes.clone(),
    })));

    stream.receive(peer(), packet(0xaaaa, 1));
    stream.receive(peer(), packet(0xaaaa, 2));
    assert_eq!(flushes.load(Ordering::SeqCst), 0);

    stream.receive(peer(), packet(0xbbbb, 2000));
    assert_eq!(flushes.load(Ordering::SeqCst), 1);
    assert_eq!(stream.remote_ssrc(), Some(0xbbbb));

    stream.receive(peer(), packet(0xbbbb, 2001));
    assert_eq!(flushes.load(Ordering::SeqCst), 1);

    let last = delivered.lock().last().map(|(h, _)| (h.ssrc, h.sequence_number));
    assert_eq!(last, Some((0xbbbb, 2001)));
}

#[tokio::test]
async fn test_jitter_buffer_waits_then_plays_in_order() {
    let (stream, _, delivered) =
        stream_with(StreamConfig::builder().jbuf_delay(2, 10).build().unwrap());

    stream.receive(peer(), packet(1, 21));
    assert!(delivered.lock().is_empty());

    stream.receive(peer(), packet(1, 20));
    stream.receive(peer(), packet(1, 22));
    assert_eq!(summary(&delivered), vec![(20, true), (21, true)]);

    let stats = stream.jitter_stats().unwrap();
    assert_eq!(stats.put, 3);
    assert_eq!(stats.get, 2);
}

#[tokio::test]
async fn test_empty_jitter_buffer_after_playout_synthesizes_lost_header() {
    let (stream, _, delivered) =
        stream_with(StreamConfig::builder().jbuf_delay(1, 4).build().unwrap());

    stream.receive(peer(), packet(1, 7));
    // duplicate is rejected by the buffer, leaving it empty
    stream.receive(peer(), packet(1, 7));

    let got = delivered.lock().clone();
    assert_eq!(got.len(), 2);
    assert_eq!(got[1].0, RtpHeader::default());
    assert!(got[1].1.is_none());
    assert_eq!(stream.jitter_stats().unwrap().underflow, 1);

    stream.reset();
    assert_eq!(stream.jitter_stats().unwrap().get, 1);
}

#[tokio::test]
async fn test_default_jitter_buffer_follows_sequence_restart() {
    let (stream, _, delivered) = stream_with(StreamConfig::default());

    for seq in 10..30 {
        stream.receive(peer(), packet(1, seq));
    }
    let before: Vec<u16> = summary(&delivered)
        .into_iter()
        .filter(|(_, real)| *real)
        .map(|(seq, _)| seq)
        .collect();
    assert_eq!(before, (10..26).collect::<Vec<u16>>());
    delivered.lock().clear();

    for seq in 40000..40020 {
        stream.receive(peer(), packet(1, seq));
    }

    let after = summary(&delivered);
    // re-buffering to the minimum depth yields one empty slot per packet
    assert_eq!(after.iter().filter(|(_, real)| !*real).count(), 4);
    let played: Vec<u16> = after
        .iter()
        .filter(|(_, real)| *real)
        .map(|(seq, _)| *seq)
        .collect();
    assert_eq!(played, (40000..40016).collect::<Vec<u16>>());
    assert_eq!(stream.last_sequence(), Some(40015));

    let stats = stream.jitter_stats().unwrap();
    assert_eq!(stats.put, 40);
    assert_eq!(stats.get, 32);
    assert_eq!(stats.overflow, 0);
}

#[tokio::test]
async fn test_send_gating() {
    let (stream, transport, _) = stream_with(StreamConfig::default());

    // no remote address
    stream.send(true, 0, 160, &[0u8; 160]).unwrap();
    assert!(transport.sent().is_empty());

    negotiate(&stream);
    stream.media().write().remote_dir = Direction::RecvOnly;
    stream.send(false, 0, 320, &[0u8; 160]).unwrap();
    assert!(transport.sent().is_empty());
    assert_eq!(stream.stats().tx.packets, 0);

    stream.media().write().remote_dir = Direction::SendRecv;
    stream.send(true, 0, 480, &[1u8; 160]).unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].dest, peer());
    let packet = RtpPacket::parse(&sent[0].data).unwrap();
    assert!(packet.header.marker);
    assert_eq!(packet.header.timestamp, 480);
    assert_eq!(packet.header.ssrc, stream.session().ssrc());
    assert_eq!(stream.stats().tx.packets, 1);
}

#[tokio::test]
async fn test_rtcp_mux_negotiation() {
    let config = StreamConfig::builder().rtcp_mux(true).build().unwrap();
    let (stream, _, _) = stream_with(config);
    negotiate(&stream);
    assert_eq!(stream.media().read().local_attr("rtcp-mux"), Some(None));
    assert_eq!(stream.media().read().local_attr("label"), Some(Some("1")));

    stream.set_remote(Some("alice@example.com"));
    assert!(!stream.session().is_mux());
    let rtcp = stream.session().rtcp_state();
    assert_eq!(rtcp.dest, Some("127.0.0.1:50001".parse().unwrap()));
    assert_eq!(rtcp.cname.as_deref(), Some("alice@example.com"));
    assert!(stream
        .debug_summary()
        .contains("remote: 127.0.0.1:50000/127.0.0.1:50001 cname=alice@example.com"));

    stream.media().write().add_remote_attr("rtcp-mux", None);
    stream.set_remote(None);
    stream.set_remote(None);
    assert!(stream.session().is_mux());
    assert_eq!(stream.session().rtcp_state().dest, Some(peer()));
}

#[tokio::test]
async fn test_muxed_rtcp_is_routed_away_from_rtp() {
    let config = StreamConfig::builder().rtcp_mux(true).no_jbuf().build().unwrap();
    let (stream, transport, delivered) = stream_with(config);
    negotiate(&stream);
    stream.media().write().add_remote_attr("rtcp-mux", None);
    stream.set_remote(None);
    stream.start();

    // receiver report on the RTP port
    transport.inject(Channel::Rtp, vec![0x80, 201, 0x00, 0x01, 0, 0, 0, 1], peer());
    transport.inject(Channel::Rtp, packet(9, 1).serialize(), peer());

    tokio::time::timeout(Duration::from_secs(2), async {
        while delivered.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(stream.rtcp_received(), 1);
    assert_eq!(summary(&delivered), vec![(1, true)]);
    stream.close();
}

#[tokio::test]
async fn test_sdp_helpers() {
    let (stream, _, _) = stream_with(StreamConfig::default());
    assert!(!stream.has_media());

    negotiate(&stream);
    assert!(stream.has_media());

    stream.media().write().add_remote_attr("rtcp-fb", Some("* nack pli".into()));
    stream.decode_sdp_attributes();
    assert!(stream.supports_nack());

    stream.set_bandwidth(64 * 1024);
    assert_eq!(stream.media().read().bandwidth_as, Some(64));

    stream.hold(true);
    assert_eq!(stream.media().read().local_dir, Direction::SendOnly);

    stream.set_sample_rates(8000, 16000);
    let rtcp = stream.session().rtcp_state();
    assert_eq!((rtcp.srate_tx, rtcp.srate_rx), (8000, 16000));

    let summary = stream.debug_summary();
    assert!(summary.contains("audio dir=sendonly"));
    assert!(summary.contains("jbuf: put=0"));
}

#[tokio::test(start_paused = true)]
async fn test_bitrate_sampled_every_three_seconds() {
    let (stream, _, _) = stream_with(StreamConfig::default());
    negotiate(&stream);
    stream.start();
    tokio::time::sleep(Duration::from_millis(1)).await;

    for i in 0..10u32 {
        stream.send(false, 0, i * 160, &[0u8; 160]).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(3000)).await;

    // 1600 bytes over 3000 ms
    assert_eq!(stream.stats().tx.bitrate, 4266);
    assert_eq!(stream.to_string(), "audio=4266/0");
    stream.close();
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_follows_traffic() {
    let config = StreamConfig::builder().keepalive("zero").build().unwrap();
    let (stream, transport, _) = stream_with(config);

    // without a remote format nothing is started
    stream.start_keepalive().unwrap();
    assert!(stream.keepalive().is_none());

    negotiate(&stream);
    stream.start_keepalive().unwrap();
    assert!(stream.keepalive().is_some());

    tokio::time::sleep(Duration::from_millis(25)).await;
    let zero_sent = |t: &MemoryTransport| t.sent().iter().filter(|d| d.data.len() == 1).count();
    assert_eq!(zero_sent(&transport), 1);

    // real RTP inside the period suppresses the next keepalive
    stream.send(false, 0, 160, &[0u8; 160]).unwrap();
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(zero_sent(&transport), 1);

    // an idle period sends exactly one
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(zero_sent(&transport), 2);
    stream.close();
}

#[tokio::test]
async fn test_unknown_keepalive_rejected() {
    let mut config = StreamConfig::default();
    config.keepalive = Some("bogus".into());
    let transport = Arc::new(MemoryTransport::new(local()));
    let err = Stream::with_transport("audio", 0, config, transport).unwrap_err();
    assert!(matches!(err, voxmedia_rtp_core::Error::InvalidConfig(_)));
}
