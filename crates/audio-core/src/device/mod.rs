//! Audio device contracts
//!
//! Capture and playout backends live outside this crate. A backend is
//! registered as a factory; the pipeline allocates a device with the
//! callbacks it should drive and holds the returned [`DeviceHandle`] for as
//! long as the device runs.
//!
//! Callbacks run on whatever thread the backend uses. Once
//! [`DeviceHandle::stop`] returns, the backend must not invoke them again.

pub mod test_audio;

use std::fmt;

use crate::error::Result;

/// Format of a device stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceParams {
    /// Sample rate in Hz
    pub srate: u32,
    /// Channel count
    pub channels: u8,
    /// Samples per callback, all channels interleaved
    pub frame_size: usize,
    /// Callback period in milliseconds
    pub ptime: u32,
}

impl DeviceParams {
    /// Parameters for `ptime` milliseconds of audio per callback
    pub fn new(srate: u32, channels: u8, ptime: u32) -> Self {
        Self {
            srate,
            channels,
            frame_size: frame_samples(srate, channels, ptime),
            ptime,
        }
    }
}

impl fmt::Display for DeviceParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}ch frame={} ptime={}ms",
            self.srate, self.channels, self.frame_size, self.ptime
        )
    }
}

/// Interleaved sample count for `ptime` milliseconds
pub fn frame_samples(srate: u32, channels: u8, ptime: u32) -> usize {
    (srate as u64 * channels as u64 * ptime as u64 / 1000) as usize
}

/// Receives captured PCM
pub type ReadHandler = Box<dyn FnMut(&[i16]) + Send>;

/// Receives asynchronous device errors as `(code, message)`
pub type ErrorHandler = Box<dyn Fn(i32, &str) + Send + Sync>;

/// Fills a playout buffer; returns false when nothing was written
pub type WriteHandler = Box<dyn FnMut(&mut [i16]) -> bool + Send>;

/// A running device
pub trait DeviceHandle: Send {
    /// Stop the device. No callback runs after this returns.
    fn stop(&mut self);
}

/// Capture backend
pub trait AudioSource: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    /// Start capturing from `device` (backend default when `None`)
    fn alloc(
        &self,
        params: &DeviceParams,
        device: Option<&str>,
        read: ReadHandler,
        error: ErrorHandler,
    ) -> Result<Box<dyn DeviceHandle>>;
}

/// Playout backend
pub trait AudioPlayer: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    /// Start playing to `device` (backend default when `None`)
    fn alloc(
        &self,
        params: &DeviceParams,
        device: Option<&str>,
        write: WriteHandler,
    ) -> Result<Box<dyn DeviceHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_samples() {
        assert_eq!(frame_samples(8000, 1, 20), 160);
        assert_eq!(frame_samples(16000, 1, 20), 320);
        assert_eq!(frame_samples(48000, 2, 20), 1920);
        assert_eq!(DeviceParams::new(8000, 1, 30).frame_size, 240);
    }
}
