//! Stream configuration
//!
//! Passed explicitly to every [`Stream`](crate::stream::Stream); nothing is
//! held in process-wide state.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use voxmedia_infra_common::Range;

use crate::keepalive::{KeepaliveMethod, UDP_KEEPALIVE_INTERVAL};
use crate::sequence::LossThresholds;
use crate::Result;

/// Interval of the bitrate sampler
pub const STATS_INTERVAL: Duration = Duration::from_millis(3000);

/// Stream transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Address the RTP/RTCP sockets bind to
    pub local_ip: IpAddr,
    /// RTP port range; `0-0` binds ephemeral ports
    pub rtp_ports: Range,
    /// IP type-of-service byte for media sockets
    pub rtp_tos: u8,
    /// Enable RTCP
    pub rtcp_enable: bool,
    /// Offer RTCP multiplexing (RFC 5761)
    pub rtcp_mux: bool,
    /// Jitter buffer depth in frames; `0-0` disables the buffer
    pub jbuf_delay: Range,
    /// Keepalive method (`zero`, `stun`, `dyna`, `rtcp`)
    pub keepalive: Option<String>,
    /// Keepalive period
    #[serde(with = "duration_ms")]
    pub keepalive_interval: Duration,
    /// Bitrate sampling period
    #[serde(with = "duration_ms")]
    pub stats_interval: Duration,
    /// Loss classification thresholds
    pub loss_thresholds: LossThresholds,
    /// Largest datagram accepted from the socket
    pub recv_buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            local_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rtp_ports: Range::new(1024, 49152),
            rtp_tos: 0xb8,
            rtcp_enable: true,
            rtcp_mux: false,
            jbuf_delay: Range::new(5, 10),
            keepalive: None,
            keepalive_interval: UDP_KEEPALIVE_INTERVAL,
            stats_interval: STATS_INTERVAL,
            loss_thresholds: LossThresholds::default(),
            recv_buffer_size: 8192,
        }
    }
}

impl StreamConfig {
    /// Start a builder from the defaults
    pub fn builder() -> StreamConfigBuilder {
        StreamConfigBuilder::new()
    }

    /// True when both jitter-buffer bounds are non-zero
    pub fn jbuf_enabled(&self) -> bool {
        self.jbuf_delay.min != 0 && self.jbuf_delay.max != 0
    }

    /// Check that the configured values are usable
    pub fn validate(&self) -> Result<()> {
        if let Some(method) = &self.keepalive {
            method.parse::<KeepaliveMethod>()?;
        }
        if self.jbuf_enabled() && self.jbuf_delay.min > self.jbuf_delay.max {
            return Err(crate::Error::invalid_config(format!(
                "jitter buffer delay {} is inverted",
                self.jbuf_delay
            )));
        }
        if self.keepalive_interval.is_zero() || self.stats_interval.is_zero() {
            return Err(crate::Error::invalid_config("timer periods must be non-zero"));
        }
        if self.loss_thresholds.forward_jump == 0
            || self.loss_thresholds.forward_jump > self.loss_thresholds.reorder
        {
            return Err(crate::Error::invalid_config(format!(
                "loss thresholds {}/{}",
                self.loss_thresholds.forward_jump, self.loss_thresholds.reorder
            )));
        }
        Ok(())
    }
}

/// Builder for [`StreamConfig`]
#[derive(Debug, Clone, Default)]
pub struct StreamConfigBuilder {
    config: StreamConfig,
}

impl StreamConfigBuilder {
    /// Create a builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address
    pub fn local_ip(mut self, ip: IpAddr) -> Self {
        self.config.local_ip = ip;
        self
    }

    /// Set the RTP port range
    pub fn rtp_ports(mut self, min: u32, max: u32) -> Self {
        self.config.rtp_ports = Range::new(min, max);
        self
    }

    /// Set the TOS byte
    pub fn rtp_tos(mut self, tos: u8) -> Self {
        self.config.rtp_tos = tos;
        self
    }

    /// Enable or disable RTCP
    pub fn rtcp_enable(mut self, enable: bool) -> Self {
        self.config.rtcp_enable = enable;
        self
    }

    /// Offer RTCP multiplexing
    pub fn rtcp_mux(mut self, enable: bool) -> Self {
        self.config.rtcp_mux = enable;
        self
    }

    /// Set the jitter buffer depth in frames
    pub fn jbuf_delay(mut self, min: u32, max: u32) -> Self {
        self.config.jbuf_delay = Range::new(min, max);
        self
    }

    /// Disable the jitter buffer
    pub fn no_jbuf(mut self) -> Self {
        self.config.jbuf_delay = Range::default();
        self
    }

    /// Set the keepalive method
    pub fn keepalive(mut self, method: impl Into<String>) -> Self {
        self.config.keepalive = Some(method.into());
        self
    }

    /// Set the keepalive period
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set the bitrate sampling period
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.config.stats_interval = interval;
        self
    }

    /// Set the loss classification thresholds
    pub fn loss_thresholds(mut self, forward_jump: u16, reorder: u16) -> Self {
        self.config.loss_thresholds = LossThresholds {
            forward_jump,
            reorder,
        };
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<StreamConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
