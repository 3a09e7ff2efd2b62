//! Two streams exchanging RTP over real loopback UDP sockets

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use voxmedia_rtp_core::{PayloadFormat, RtpHeader, Stream, StreamConfig};

fn loopback_config() -> StreamConfig {
    StreamConfig::builder()
        .local_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .rtp_ports(0, 0)
        .no_jbuf()
        .build()
        .unwrap()
}

fn connect(from: &Stream, to: &Stream) {
    let mut media = from.media().write();
    media.remote_rtp = to.local_rtp_addr();
    media.remote_formats.push(PayloadFormat::new(8, "PCMA", 8000, 1));
}

#[tokio::test]
async fn test_rtp_flows_between_streams() {
    let alice = Stream::new("audio", 0, loopback_config()).unwrap();
    let bob = Stream::new("audio", 0, loopback_config()).unwrap();
    connect(&alice, &bob);
    connect(&bob, &alice);

    let (tx, mut rx) = mpsc::unbounded_channel::<(RtpHeader, Option<Bytes>)>();
    bob.set_receiver(Arc::new(move |hdr: &RtpHeader, payload: Option<Bytes>| {
        let _ = tx.send((*hdr, payload));
    }));

    alice.start();
    bob.start();

    for i in 0..3u32 {
        alice.send(i == 0, 8, 160 * i, &[0x55; 160]).unwrap();
    }

    let mut seqs = Vec::new();
    for _ in 0..3 {
        let (hdr, payload) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("packet within timeout")
            .expect("channel open");
        assert_eq!(hdr.payload_type, 8);
        assert_eq!(hdr.ssrc, alice.session().ssrc());
        assert_eq!(payload.map(|p| p.len()), Some(160));
        seqs.push(hdr.sequence_number);
    }

    assert_eq!(seqs[1], seqs[0].wrapping_add(1));
    assert_eq!(seqs[2], seqs[0].wrapping_add(2));
    assert_eq!(bob.stats().rx.packets, 3);
    assert_eq!(alice.stats().tx.packets, 3);

    alice.close();
    bob.close();
}
