use bytes::Bytes;

use crate::packet::RtpHeader;

/// Consumer of packets delivered by a [`Stream`](super::Stream).
///
/// `payload` is `None` for a loss notification; `header` is then the header
/// of the packet that revealed the gap. Called from the reactor.
pub trait RtpReceiver: Send + Sync {
    fn on_rtp(&self, header: &RtpHeader, payload: Option<Bytes>);
}

impl<F> RtpReceiver for F
where
    F: Fn(&RtpHeader, Option<Bytes>) + Send + Sync,
{
    fn on_rtp(&self, header: &RtpHeader, payload: Option<Bytes>) {
        self(header, payload)
    }
}
