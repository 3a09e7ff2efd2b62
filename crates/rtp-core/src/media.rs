//! Negotiated media line model
//!
//! SDP offer/answer happens elsewhere; this module only holds its outcome
//! in a shape the stream, keepalive and audio pipeline can query.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Lowest dynamic RTP payload type
pub const PT_DYN_MIN: u8 = 96;
/// Highest dynamic RTP payload type
pub const PT_DYN_MAX: u8 = 127;

/// Media direction of one side of a media line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inactive,
    SendOnly,
    RecvOnly,
    #[default]
    SendRecv,
}

impl Direction {
    fn from_flags(send: bool, recv: bool) -> Self {
        match (send, recv) {
            (true, true) => Self::SendRecv,
            (true, false) => Self::SendOnly,
            (false, true) => Self::RecvOnly,
            (false, false) => Self::Inactive,
        }
    }

    /// True for sendonly and sendrecv
    pub fn can_send(self) -> bool {
        matches!(self, Self::SendOnly | Self::SendRecv)
    }

    /// True for recvonly and sendrecv
    pub fn can_recv(self) -> bool {
        matches!(self, Self::RecvOnly | Self::SendRecv)
    }

    /// Combine the local direction with the peer's.
    ///
    /// We may send when we want to and the peer accepts media, and receive
    /// when we accept media and the peer sends.
    pub fn negotiate(local: Direction, remote: Direction) -> Direction {
        Self::from_flags(
            local.can_send() && remote.can_recv(),
            local.can_recv() && remote.can_send(),
        )
    }

    /// SDP attribute name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::SendRecv => "sendrecv",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a media line's payload format table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFormat {
    /// RTP payload type
    pub payload_type: u8,
    /// Encoding name, e.g. `PCMU` or `telephone-event`
    pub name: String,
    /// RTP clock rate
    pub clock_rate: u32,
    /// Channel count
    pub channels: u8,
    /// Format parameters (`a=fmtp`)
    pub fmtp: Option<String>,
}

impl PayloadFormat {
    /// Create a format entry without format parameters
    pub fn new(payload_type: u8, name: impl Into<String>, clock_rate: u32, channels: u8) -> Self {
        Self {
            payload_type,
            name: name.into(),
            clock_rate,
            channels,
            fmtp: None,
        }
    }

    /// Attach format parameters
    pub fn with_fmtp(mut self, fmtp: impl Into<String>) -> Self {
        self.fmtp = Some(fmtp.into());
        self
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}/{}",
            self.payload_type, self.name, self.clock_rate, self.channels
        )
    }
}

/// A media line as seen after offer/answer
#[derive(Debug, Clone, Default)]
pub struct MediaDescription {
    /// Media name (`audio`, `video`)
    pub name: String,
    /// Direction we advertise
    pub local_dir: Direction,
    /// Direction the peer advertised
    pub remote_dir: Direction,
    /// Local RTP port
    pub local_port: u16,
    /// Peer RTP address
    pub remote_rtp: Option<SocketAddr>,
    /// Peer RTCP address
    pub remote_rtcp: Option<SocketAddr>,
    /// Formats we offer, in preference order
    pub local_formats: Vec<PayloadFormat>,
    /// Formats the peer offered
    pub remote_formats: Vec<PayloadFormat>,
    local_attrs: Vec<(String, Option<String>)>,
    remote_attrs: Vec<(String, Option<String>)>,
    /// `b=AS` bandwidth in kbit/s
    pub bandwidth_as: Option<u32>,
}

/// Media descriptor shared between a stream and the pipeline built on it
pub type SharedMedia = Arc<RwLock<MediaDescription>>;

impl MediaDescription {
    /// Create an empty media line
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Wrap into a shareable handle
    pub fn shared(self) -> SharedMedia {
        Arc::new(RwLock::new(self))
    }

    /// Direction after combining both sides
    pub fn negotiated_dir(&self) -> Direction {
        Direction::negotiate(self.local_dir, self.remote_dir)
    }

    /// Add a local format; an existing entry with the same payload type is replaced
    pub fn add_local_format(&mut self, format: PayloadFormat) {
        self.local_formats
            .retain(|f| f.payload_type != format.payload_type);
        self.local_formats.push(format);
    }

    /// Local format for a payload type
    pub fn local_format(&self, pt: u8) -> Option<&PayloadFormat> {
        self.local_formats.iter().find(|f| f.payload_type == pt)
    }

    /// Remote format for a payload type
    pub fn remote_format(&self, pt: u8) -> Option<&PayloadFormat> {
        self.remote_formats.iter().find(|f| f.payload_type == pt)
    }

    /// Local format by encoding name (case-insensitive) and clock rate
    pub fn local_format_by_name(&self, name: &str, clock_rate: u32) -> Option<&PayloadFormat> {
        self.local_formats
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name) && f.clock_rate == clock_rate)
    }

    /// True when either side's format table uses `pt`
    pub fn uses_payload_type(&self, pt: u8) -> bool {
        self.local_format(pt).is_some() || self.remote_format(pt).is_some()
    }

    /// Set (or replace) a local attribute
    pub fn set_local_attr(&mut self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        self.local_attrs.retain(|(n, _)| *n != name);
        self.local_attrs.push((name, value));
    }

    /// Look up a local attribute
    pub fn local_attr(&self, name: &str) -> Option<Option<&str>> {
        self.local_attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_deref())
    }

    /// Record an attribute received from the peer
    pub fn add_remote_attr(&mut self, name: impl Into<String>, value: Option<String>) {
        self.remote_attrs.push((name.into(), value));
    }

    /// First remote attribute with this name; `Some(None)` for flag attributes
    pub fn remote_attr(&self, name: &str) -> Option<Option<&str>> {
        self.remote_attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_deref())
    }

    /// All values of a repeated remote attribute
    pub fn remote_attrs<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.remote_attrs
            .iter()
            .filter(move |(n, _)| n == name)
            .filter_map(|(_, v)| v.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_negotiation() {
        use Direction::*;
        assert_eq!(Direction::negotiate(SendRecv, SendRecv), SendRecv);
        assert_eq!(Direction::negotiate(SendRecv, RecvOnly), SendOnly);
        assert_eq!(Direction::negotiate(SendOnly, SendRecv), SendOnly);
        assert_eq!(Direction::negotiate(SendOnly, SendOnly), Inactive);
        assert_eq!(Direction::negotiate(RecvOnly, SendOnly), RecvOnly);
        assert_eq!(Direction::negotiate(Inactive, SendRecv), Inactive);
    }

    #[test]
    fn test_format_lookup() {
        let mut media = MediaDescription::new("audio");
        media.add_local_format(PayloadFormat::new(0, "PCMU", 8000, 1));
        media.add_local_format(PayloadFormat::new(8, "PCMA", 8000, 1));
        media.add_local_format(PayloadFormat::new(8, "PCMA", 8000, 1));
        media
            .remote_formats
            .push(PayloadFormat::new(101, "telephone-event", 8000, 1).with_fmtp("0-15"));

        assert_eq!(media.local_formats.len(), 2);
        assert_eq!(media.local_format(8).map(|f| f.name.as_str()), Some("PCMA"));
        assert!(media.local_format_by_name("pcmu", 8000).is_some());
        assert!(media.uses_payload_type(101));
        assert!(!media.uses_payload_type(96));
    }

    #[test]
    fn test_attributes() {
        let mut media = MediaDescription::new("audio");
        media.set_local_attr("label", Some("1".into()));
        media.set_local_attr("label", Some("2".into()));
        assert_eq!(media.local_attr("label"), Some(Some("2")));

        media.add_remote_attr("rtcp-mux", None);
        media.add_remote_attr("rtcp-fb", Some("* nack".into()));
        media.add_remote_attr("rtcp-fb", Some("* nack pli".into()));
        assert_eq!(media.remote_attr("rtcp-mux"), Some(None));
        assert_eq!(media.remote_attrs("rtcp-fb").count(), 2);
        assert_eq!(media.remote_attr("ptime"), None);
    }
}
