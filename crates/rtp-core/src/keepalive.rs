//! RTP keepalive (draft-ietf-avt-app-rtp-keepalive)
//!
//! A keepalive is attached to one RTP flow. Every period it checks whether
//! real RTP went out since the last check; if not, it emits one packet
//! using the configured method so NAT bindings stay open.
//!
//! ```text
//! Method   Packet sent
//! zero     one-byte UDP datagram
//! stun     STUN Binding Indication
//! dyna     empty RTP packet with an unused dynamic payload type
//! rtcp     nothing; relies on multiplexed RTCP
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::media::{SharedMedia, PT_DYN_MAX, PT_DYN_MIN};
use crate::session::RtpSession;
use crate::stun;
use crate::{Result, RtpTimestamp};

/// Keepalive period for UDP transports
pub const UDP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Delay before the first check after the keepalive is started
pub const INITIAL_DELAY: Duration = Duration::from_millis(20);

/// How keepalive packets are formed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeepaliveMethod {
    Zero,
    Stun,
    Dyna,
    Rtcp,
}

impl KeepaliveMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zero => "zero",
            Self::Stun => "stun",
            Self::Dyna => "dyna",
            Self::Rtcp => "rtcp",
        }
    }
}

impl FromStr for KeepaliveMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "zero" => Ok(Self::Zero),
            "stun" => Ok(Self::Stun),
            "dyna" => Ok(Self::Dyna),
            "rtcp" => Ok(Self::Rtcp),
            other => Err(Error::invalid_config(format!(
                "unknown rtp keepalive method: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for KeepaliveMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one period check did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    /// RTP was sent since the last check; nothing to do
    Skipped,
    /// A keepalive packet was sent
    Sent(KeepaliveMethod),
    /// `dyna`: every dynamic payload type is in use
    NoFreePayloadType,
    /// `rtcp`: RTCP is multiplexed so RTP traffic refreshes the binding
    RtcpMuxed,
    /// `rtcp`: multiplexing is not available, nothing was sent
    RtcpMuxUnavailable,
}

#[derive(Debug, Default)]
struct ActivityState {
    ts: RtpTimestamp,
    flag: bool,
}

/// Keepalive for one RTP flow
pub struct Keepalive {
    method: KeepaliveMethod,
    session: Arc<RtpSession>,
    media: SharedMedia,
    rtcp_mux_configured: bool,
    interval: Duration,
    state: Mutex<ActivityState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Keepalive {
    /// Create a keepalive; `method` is parsed here so an unknown name is
    /// reported at setup time.
    pub fn new(
        method: &str,
        session: Arc<RtpSession>,
        media: SharedMedia,
        rtcp_mux_configured: bool,
        interval: Duration,
    ) -> Result<Arc<Self>> {
        let method = method.parse()?;
        Ok(Arc::new(Self {
            method,
            session,
            media,
            rtcp_mux_configured,
            interval,
            state: Mutex::new(ActivityState::default()),
            task: Mutex::new(None),
        }))
    }

    /// Configured method
    pub fn method(&self) -> KeepaliveMethod {
        self.method
    }

    /// Period between checks
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the periodic timer. The first check runs after [`INITIAL_DELAY`].
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.interval;
        let handle = tokio::spawn(run(weak, interval));
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
        debug!("rtp_keepalive: started, method={} interval={:?}", self.method, interval);
    }

    /// Stop the periodic timer
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Record an outgoing RTP packet; the next check will not send.
    pub fn refresh(&self, ts: RtpTimestamp) {
        let mut state = self.state.lock();
        state.ts = ts;
        state.flag = true;
    }

    /// Run one period check
    pub fn on_period(&self) -> Result<KeepaliveOutcome> {
        let ts = {
            let mut state = self.state.lock();
            if state.flag {
                state.flag = false;
                return Ok(KeepaliveOutcome::Skipped);
            }
            state.ts
        };

        self.send(ts)
    }

    fn send(&self, ts: RtpTimestamp) -> Result<KeepaliveOutcome> {
        let remote = || self.media.read().remote_rtp.ok_or(Error::NoRemoteAddress);

        match self.method {
            KeepaliveMethod::Zero => {
                self.session.send_raw(remote()?, &[0u8])?;
            }
            KeepaliveMethod::Stun => {
                self.session.send_raw(remote()?, &stun::binding_indication())?;
            }
            KeepaliveMethod::Dyna => {
                let dest = remote()?;
                let Some(pt) = self.find_unused_pt() else {
                    warn!("rtp_keepalive: no unused payload type found");
                    return Ok(KeepaliveOutcome::NoFreePayloadType);
                };
                self.session.send(dest, false, pt, ts, &[])?;
            }
            KeepaliveMethod::Rtcp => {
                return if self.rtcp_mux_configured && self.session.is_mux() {
                    Ok(KeepaliveOutcome::RtcpMuxed)
                } else {
                    warn!("rtp_keepalive: rtcp-mux is not enabled");
                    Ok(KeepaliveOutcome::RtcpMuxUnavailable)
                };
            }
        }

        trace!("rtp_keepalive: sent {} keepalive", self.method);
        Ok(KeepaliveOutcome::Sent(self.method))
    }

    fn find_unused_pt(&self) -> Option<u8> {
        let media = self.media.read();
        (PT_DYN_MIN..=PT_DYN_MAX)
            .rev()
            .find(|pt| !media.uses_payload_type(*pt))
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for Keepalive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keepalive")
            .field("method", &self.method)
            .field("interval", &self.interval)
            .finish()
    }
}

async fn run(weak: Weak<Keepalive>, interval: Duration) {
    sleep(INITIAL_DELAY).await;

    loop {
        // next deadline is fixed before the check so a failure cannot stall the timer
        let deadline = Instant::now() + interval;

        let Some(ka) = weak.upgrade() else {
            break;
        };
        match ka.on_period() {
            Ok(KeepaliveOutcome::Sent(method)) => debug!("rtp_keepalive: {} sent", method),
            Ok(outcome) => trace!("rtp_keepalive: {:?}", outcome),
            Err(e) => info!("rtp_keepalive: send failed: {}", e),
        }
        drop(ka);

        sleep_until(deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaDescription, PayloadFormat};
    use crate::packet::RtpPacket;
    use crate::transport::{Channel, MemoryTransport};
    use std::net::SocketAddr;

    fn setup(method: &str) -> (Arc<Keepalive>, Arc<MemoryTransport>, SharedMedia, SocketAddr) {
        let local: SocketAddr = "127.0.0.1:10000".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:20000".parse().unwrap();
        let transport = Arc::new(MemoryTransport::new(local));
        let session = Arc::new(RtpSession::new(transport.clone()));

        let mut media = MediaDescription::new("audio");
        media.remote_rtp = Some(remote);
        media.add_local_format(PayloadFormat::new(0, "PCMU", 8000, 1));
        media.remote_formats.push(PayloadFormat::new(127, "H264", 90000, 1));
        let media = media.shared();

        let ka = Keepalive::new(method, session, media.clone(), true, UDP_KEEPALIVE_INTERVAL).unwrap();
        (ka, transport, media, remote)
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("zero".parse::<KeepaliveMethod>().unwrap(), KeepaliveMethod::Zero);
        assert_eq!("STUN".parse::<KeepaliveMethod>().unwrap(), KeepaliveMethod::Stun);
        let err = "ping".parse::<KeepaliveMethod>().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_refresh_suppresses_one_period() {
        let (ka, transport, _, remote) = setup("zero");

        ka.refresh(1234);
        assert_eq!(ka.on_period().unwrap(), KeepaliveOutcome::Skipped);
        assert!(transport.sent().is_empty());

        assert_eq!(
            ka.on_period().unwrap(),
            KeepaliveOutcome::Sent(KeepaliveMethod::Zero)
        );
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data.len(), 1);
        assert_eq!(sent[0].dest, remote);
        assert_eq!(sent[0].channel, Channel::Rtp);
    }

    #[tokio::test]
    async fn test_stun_sends_binding_indication() {
        let (ka, transport, _, _) = setup("stun");
        ka.on_period().unwrap();
        let sent = transport.sent();
        assert!(stun::is_stun(&sent[0].data));
        assert_eq!(&sent[0].data[0..2], &[0x00, 0x11]);
    }

    #[tokio::test]
    async fn test_dyna_uses_highest_free_pt_and_last_ts() {
        let (ka, transport, _, _) = setup("dyna");
        ka.refresh(4000);
        ka.on_period().unwrap();
        ka.on_period().unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let packet = RtpPacket::parse(&sent[0].data).unwrap();
        assert_eq!(packet.header.payload_type, 126);
        assert_eq!(packet.header.timestamp, 4000);
        assert!(packet.payload.is_empty());
    }

    #[tokio::test]
    async fn test_dyna_exhausted() {
        let (ka, transport, media, _) = setup("dyna");
        {
            let mut media = media.write();
            for pt in PT_DYN_MIN..=PT_DYN_MAX {
                media.add_local_format(PayloadFormat::new(pt, "x", 8000, 1));
            }
        }
        assert_eq!(ka.on_period().unwrap(), KeepaliveOutcome::NoFreePayloadType);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_rtcp_method_never_sends() {
        let (ka, transport, _, _) = setup("rtcp");
        assert_eq!(ka.on_period().unwrap(), KeepaliveOutcome::RtcpMuxUnavailable);
        ka.session.enable_mux();
        assert_eq!(ka.on_period().unwrap(), KeepaliveOutcome::RtcpMuxed);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_missing_remote_is_error() {
        let (ka, _, media, _) = setup("zero");
        media.write().remote_rtp = None;
        assert!(matches!(ka.on_period(), Err(Error::NoRemoteAddress)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_sends_once_per_idle_period() {
        let (ka, transport, _, _) = setup("zero");
        ka.start();

        // first check after the initial delay
        sleep(Duration::from_millis(25)).await;
        assert_eq!(transport.sent().len(), 1);

        // traffic during the next period suppresses it
        ka.refresh(160);
        sleep(UDP_KEEPALIVE_INTERVAL).await;
        assert_eq!(transport.sent().len(), 1);

        sleep(UDP_KEEPALIVE_INTERVAL).await;
        assert_eq!(transport.sent().len(), 2);

        ka.stop();
        sleep(UDP_KEEPALIVE_INTERVAL * 2).await;
        assert_eq!(transport.sent().len(), 2);
    }
}
