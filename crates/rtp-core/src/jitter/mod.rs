//! Jitter buffering between network arrival and playout
//!
//! The stream only depends on the [`JitterBuffer`] contract; the bundled
//! [`FrameJitterBuffer`] is a fixed-depth reorder queue counted in frames.

mod frame;

pub use frame::FrameJitterBuffer;

use bytes::Bytes;

use crate::packet::RtpHeader;
use crate::Result;

/// Counters exposed by every jitter buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitterStats {
    /// Packets accepted by `put`
    pub put: u64,
    /// Packets returned by `get`
    pub get: u64,
    /// Packets evicted because the buffer was full
    pub overflow: u64,
    /// `get` calls that found nothing to play
    pub underflow: u64,
}

/// Reorder/delay queue fed by the receive path
pub trait JitterBuffer: Send {
    /// Enqueue a packet. Errors are per-packet and leave the buffer usable.
    fn put(&mut self, header: &RtpHeader, payload: Bytes) -> Result<()>;

    /// Dequeue the next packet in sequence order, if one is ready
    fn get(&mut self) -> Option<(RtpHeader, Bytes)>;

    /// Drop every buffered packet
    fn flush(&mut self);

    /// Counter snapshot
    fn stats(&self) -> JitterStats;

    /// Packets currently held
    fn len(&self) -> usize;

    /// True when nothing is buffered
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
