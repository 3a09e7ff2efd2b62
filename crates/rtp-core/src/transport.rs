//! Datagram transport underneath a media stream

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Error;
use crate::Result;
use voxmedia_infra_common::Range;

/// Which of the two media flows a datagram belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Rtp,
    Rtcp,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rtp => f.write_str("RTP"),
            Self::Rtcp => f.write_str("RTCP"),
        }
    }
}

/// Datagram transport used by a stream.
///
/// Sending is synchronous and never blocks so it can be called from the
/// audio transmit thread; receiving is driven by the reactor.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Local address of a channel, `None` if the channel has no socket
    fn local_addr(&self, channel: Channel) -> Option<SocketAddr>;

    /// Send one datagram
    fn send_to(&self, channel: Channel, data: &[u8], dest: SocketAddr) -> Result<()>;

    /// Wait for the next datagram on a channel
    async fn recv_from(&self, channel: Channel, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
}

/// RTP and optional RTCP UDP sockets.
///
/// Each socket is kept twice: a Tokio handle for the receive loop and a
/// non-blocking std clone so sends work from any thread without waiting
/// for reactor readiness.
#[derive(Debug)]
pub struct UdpTransport {
    rtp: UdpSocket,
    rtcp: Option<UdpSocket>,
    rtp_send: std::net::UdpSocket,
    rtcp_send: Option<std::net::UdpSocket>,
}

impl UdpTransport {
    /// Bind an RTP socket (and an RTCP socket on the next port when
    /// `with_rtcp` is set) within `ports`.
    ///
    /// An unset port range binds ephemeral ports. Must be called from
    /// within a Tokio runtime.
    pub fn bind(ip: IpAddr, ports: Range, tos: u8, with_rtcp: bool) -> Result<Self> {
        if ports.is_unset() {
            let rtp = bind_udp(SocketAddr::new(ip, 0), tos)?;
            let rtcp = if with_rtcp {
                Some(bind_udp(SocketAddr::new(ip, 0), tos)?)
            } else {
                None
            };
            return Self::from_std(rtp, rtcp);
        }

        let first = (ports.min + ports.min % 2).max(2);
        let last = ports.max.min(u16::MAX as u32);
        if first > last {
            return Err(Error::NoPortAvailable {
                min: ports.min,
                max: ports.max,
            });
        }

        let slots = (last - first) / 2 + 1;
        let offset = rand::thread_rng().gen_range(0..slots);

        for i in 0..slots {
            let port = first + ((offset + i) % slots) * 2;
            let rtp = match bind_udp(SocketAddr::new(ip, port as u16), tos) {
                Ok(sock) => sock,
                Err(e) => {
                    debug!("rtp port {} unavailable: {}", port, e);
                    continue;
                }
            };

            if !with_rtcp {
                return Self::from_std(rtp, None);
            }

            if port + 1 > u16::MAX as u32 {
                continue;
            }
            match bind_udp(SocketAddr::new(ip, (port + 1) as u16), tos) {
                Ok(rtcp) => return Self::from_std(rtp, Some(rtcp)),
                Err(e) => debug!("rtcp port {} unavailable: {}", port + 1, e),
            }
        }

        Err(Error::NoPortAvailable {
            min: ports.min,
            max: ports.max,
        })
    }

    fn from_std(rtp: std::net::UdpSocket, rtcp: Option<std::net::UdpSocket>) -> Result<Self> {
        let rtp_send = rtp.try_clone()?;
        let rtcp_send = rtcp.as_ref().map(|s| s.try_clone()).transpose()?;
        Ok(Self {
            rtp: UdpSocket::from_std(rtp)?,
            rtcp: rtcp.map(UdpSocket::from_std).transpose()?,
            rtp_send,
            rtcp_send,
        })
    }

    fn socket(&self, channel: Channel) -> Option<&UdpSocket> {
        match channel {
            Channel::Rtp => Some(&self.rtp),
            Channel::Rtcp => self.rtcp.as_ref(),
        }
    }
}

fn bind_udp(addr: SocketAddr, tos: u8) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if tos != 0 && addr.is_ipv4() {
        if let Err(e) = socket.set_tos(tos as u32) {
            warn!("could not set TOS {:#04x} on {}: {}", tos, addr, e);
        }
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

#[async_trait]
impl MediaTransport for UdpTransport {
    fn local_addr(&self, channel: Channel) -> Option<SocketAddr> {
        self.socket(channel).and_then(|s| s.local_addr().ok())
    }

    fn send_to(&self, channel: Channel, data: &[u8], dest: SocketAddr) -> Result<()> {
        let sock = match channel {
            Channel::Rtcp => self.rtcp_send.as_ref().unwrap_or(&self.rtp_send),
            Channel::Rtp => &self.rtp_send,
        };
        let written = sock.send_to(data, dest)?;
        if written != data.len() {
            return Err(Error::ShortWrite {
                dest,
                written,
                len: data.len(),
            });
        }
        Ok(())
    }

    async fn recv_from(&self, channel: Channel, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        match self.socket(channel) {
            Some(sock) => Ok(sock.recv_from(buf).await?),
            None => std::future::pending().await,
        }
    }
}

/// A datagram handed to [`MemoryTransport::send_to`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub channel: Channel,
    pub data: Bytes,
    pub dest: SocketAddr,
}

type Inbound = (Bytes, SocketAddr);

/// In-process transport that records outgoing datagrams and delivers
/// injected ones. Used for loopback wiring and deterministic tests.
#[derive(Debug)]
pub struct MemoryTransport {
    local: SocketAddr,
    sent: Mutex<Vec<SentDatagram>>,
    rtp_tx: mpsc::UnboundedSender<Inbound>,
    rtcp_tx: mpsc::UnboundedSender<Inbound>,
    rtp_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    rtcp_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

impl MemoryTransport {
    /// Create a transport that reports `local` as its RTP address
    pub fn new(local: SocketAddr) -> Self {
        let (rtp_tx, rtp_rx) = mpsc::unbounded_channel();
        let (rtcp_tx, rtcp_rx) = mpsc::unbounded_channel();
        Self {
            local,
            sent: Mutex::new(Vec::new()),
            rtp_tx,
            rtcp_tx,
            rtp_rx: tokio::sync::Mutex::new(rtp_rx),
            rtcp_rx: tokio::sync::Mutex::new(rtcp_rx),
        }
    }

    /// Queue a datagram as if it had arrived from `from`
    pub fn inject(&self, channel: Channel, data: impl Into<Bytes>, from: SocketAddr) {
        let tx = match channel {
            Channel::Rtp => &self.rtp_tx,
            Channel::Rtcp => &self.rtcp_tx,
        };
        // the receiver lives as long as self
        let _ = tx.send((data.into(), from));
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.sent.lock().clone()
    }

    /// Drain the sent log
    pub fn take_sent(&self) -> Vec<SentDatagram> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl MediaTransport for MemoryTransport {
    fn local_addr(&self, channel: Channel) -> Option<SocketAddr> {
        match channel {
            Channel::Rtp => Some(self.local),
            Channel::Rtcp => Some(SocketAddr::new(self.local.ip(), self.local.port().wrapping_add(1))),
        }
    }

    fn send_to(&self, channel: Channel, data: &[u8], dest: SocketAddr) -> Result<()> {
        self.sent.lock().push(SentDatagram {
            channel,
            data: Bytes::copy_from_slice(data),
            dest,
        });
        Ok(())
    }

    async fn recv_from(&self, channel: Channel, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let rx = match channel {
            Channel::Rtp => &self.rtp_rx,
            Channel::Rtcp => &self.rtcp_rx,
        };
        let mut rx = rx.lock().await;
        match rx.recv().await {
            Some((data, from)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
            None => Err(Error::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_bind_pair_in_range() {
        let transport = UdpTransport::bind(LOCALHOST, Range::new(41000, 41999), 0xb8, true).unwrap();
        let rtp = transport.local_addr(Channel::Rtp).unwrap().port();
        let rtcp = transport.local_addr(Channel::Rtcp).unwrap().port();
        assert_eq!(rtp % 2, 0);
        assert_eq!(rtcp, rtp + 1);
        assert!((41000..=41999).contains(&rtp));
    }

    #[tokio::test]
    async fn test_loopback_datagram() {
        let a = UdpTransport::bind(LOCALHOST, Range::default(), 0, false).unwrap();
        let b = UdpTransport::bind(LOCALHOST, Range::default(), 0, false).unwrap();
        assert!(a.local_addr(Channel::Rtcp).is_none());

        let dest = b.local_addr(Channel::Rtp).unwrap();
        a.send_to(Channel::Rtp, b"hello", dest).unwrap();

        let mut buf = [0u8; 32];
        let (n, from) = b.recv_from(Channel::Rtp, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.local_addr(Channel::Rtp).unwrap());
    }

    #[tokio::test]
    async fn test_memory_transport_records_and_delivers() {
        let local: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let transport = MemoryTransport::new(local);

        transport.send_to(Channel::Rtcp, &[1, 2], peer).unwrap();
        assert_eq!(transport.sent()[0].channel, Channel::Rtcp);
        assert_eq!(transport.take_sent().len(), 1);
        assert!(transport.sent().is_empty());

        transport.inject(Channel::Rtp, vec![9u8, 9, 9], peer);
        let mut buf = [0u8; 8];
        let (n, from) = transport.recv_from(Channel::Rtp, &mut buf).await.unwrap();
        assert_eq!((n, from), (3, peer));
    }

    #[tokio::test]
    async fn test_empty_range_fails() {
        let err = UdpTransport::bind(LOCALHOST, Range::new(5, 4), 0, false).unwrap_err();
        assert!(matches!(err, Error::NoPortAvailable { .. }));
        assert!(!err.is_recoverable());
    }
}
