//! Audio ring buffer
//!
//! [`AudioBuffer`] is the only structure shared between device threads and
//! the rest of the pipeline. Writers never block; the buffer grows on demand
//! up to `max` samples and then drops the oldest samples. Readers either
//! poll without blocking ([`AudioBuffer::read`], [`AudioBuffer::try_get`])
//! or wait a bounded time for a full frame ([`AudioBuffer::get`]).

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{AudioError, Result};

/// Overrun/underrun counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Writes that pushed the fill level past `max`
    pub overruns: u64,
    /// Reads that found less than a full request
    pub underruns: u64,
}

struct BufferState {
    samples: VecDeque<i16>,
    /// Set until `min` samples have been buffered, and again after an underrun
    filling: bool,
    closed: bool,
    stats: BufferStats,
}

/// Thread-safe bounded sample queue
pub struct AudioBuffer {
    state: Mutex<BufferState>,
    ready: Condvar,
    min: usize,
    max: usize,
}

impl AudioBuffer {
    /// Create a buffer that starts playing out after `min` samples and
    /// holds at most `max` samples
    pub fn new(min: usize, max: usize) -> Result<Self> {
        if max == 0 || max < min {
            return Err(AudioError::invalid_config(format!(
                "ring buffer bounds {}..{}",
                min, max
            )));
        }

        Ok(Self {
            state: Mutex::new(BufferState {
                samples: VecDeque::with_capacity(min),
                filling: true,
                closed: false,
                stats: BufferStats::default(),
            }),
            ready: Condvar::new(),
            min,
            max,
        })
    }

    /// Append samples without blocking. When the buffer would exceed `max`
    /// the oldest samples are discarded.
    pub fn write(&self, samples: &[i16]) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AudioError::BufferClosed);
        }

        state.samples.extend(samples.iter().copied());

        let excess = state.samples.len().saturating_sub(self.max);
        if excess > 0 {
            state.samples.drain(..excess);
            state.stats.overruns += 1;
        }

        if state.filling && state.samples.len() >= self.min {
            state.filling = false;
        }

        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    /// Fill `out` without blocking, for render callbacks.
    ///
    /// Returns the number of samples written into `out`: either all of it or
    /// zero. Zero is returned while the buffer is still filling up to `min`
    /// and after an underrun, in which case the caller plays silence.
    pub fn read(&self, out: &mut [i16]) -> usize {
        let mut state = self.state.lock();

        if state.filling || state.samples.len() < out.len() {
            if !state.filling {
                state.filling = true;
            }
            state.stats.underruns += 1;
            return 0;
        }

        Self::take(&mut state, out);
        out.len()
    }

    /// Wait up to `timeout` until `out.len()` samples are available, then
    /// take them.
    pub fn get(&self, out: &mut [i16], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        while state.samples.len() < out.len() {
            if state.closed {
                return Err(AudioError::BufferClosed);
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                if state.samples.len() >= out.len() {
                    break;
                }
                return Err(AudioError::BufferTimeout);
            }
        }

        Self::take(&mut state, out);
        Ok(())
    }

    /// Take `out.len()` samples if they are available, without waiting
    pub fn try_get(&self, out: &mut [i16]) -> bool {
        let mut state = self.state.lock();
        if state.samples.len() < out.len() {
            return false;
        }
        Self::take(&mut state, out);
        true
    }

    fn take(state: &mut BufferState, out: &mut [i16]) {
        let n = out.len();
        for (dst, src) in out.iter_mut().zip(state.samples.drain(..n)) {
            *dst = src;
        }
    }

    /// Wake blocked readers and refuse further writes
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    /// Drop all buffered samples
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.samples.clear();
        state.filling = true;
    }

    /// Current fill level in samples
    pub fn len(&self) -> usize {
        self.state.lock().samples.len()
    }

    /// True when no samples are buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Playout threshold in samples
    pub fn min(&self) -> usize {
        self.min
    }

    /// Capacity ceiling in samples
    pub fn max(&self) -> usize {
        self.max
    }

    /// Overrun/underrun counters
    pub fn stats(&self) -> BufferStats {
        self.state.lock().stats
    }
}

impl fmt::Display for AudioBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.len(), self.max)
    }
}

impl fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("len", &self.len())
            .field("min", &self.min)
            .field("max", &self.max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_rejects_bad_bounds() {
        assert!(AudioBuffer::new(10, 5).is_err());
        assert!(AudioBuffer::new(0, 0).is_err());
        assert!(AudioBuffer::new(0, 1).is_ok());
    }

    #[test]
    fn test_read_waits_for_min_fill() {
        let buf = AudioBuffer::new(4, 16).unwrap();
        let mut out = [0i16; 2];

        buf.write(&[1, 2]).unwrap();
        assert_eq!(buf.read(&mut out), 0);

        buf.write(&[3, 4]).unwrap();
        assert_eq!(buf.read(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(buf.read(&mut out), 2);
        assert_eq!(out, [3, 4]);

        // Empty again: underrun, back to filling
        assert_eq!(buf.read(&mut out), 0);
        assert_eq!(buf.stats().underruns, 2);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let buf = AudioBuffer::new(0, 4).unwrap();
        buf.write(&[1, 2, 3]).unwrap();
        buf.write(&[4, 5, 6]).unwrap();
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.stats().overruns, 1);

        let mut out = [0i16; 4];
        assert!(buf.try_get(&mut out));
        assert_eq!(out, [3, 4, 5, 6]);
        assert_eq!(buf.to_string(), "0/4");
    }

    #[test]
    fn test_get_times_out() {
        let buf = AudioBuffer::new(0, 8).unwrap();
        buf.write(&[1]).unwrap();
        let mut out = [0i16; 2];
        let err = buf.get(&mut out, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, AudioError::BufferTimeout));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_get_wakes_on_write() {
        let buf = Arc::new(AudioBuffer::new(0, 64).unwrap());
        let writer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                buf.write(&[7; 8]).unwrap();
            })
        };

        let mut out = [0i16; 8];
        buf.get(&mut out, Duration::from_secs(2)).unwrap();
        assert_eq!(out, [7; 8]);
        writer.join().unwrap();
    }

    #[test]
    fn test_close_releases_waiter() {
        let buf = Arc::new(AudioBuffer::new(0, 64).unwrap());
        let reader = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                let mut out = [0i16; 8];
                buf.get(&mut out, Duration::from_secs(5))
            })
        };

        thread::sleep(Duration::from_millis(20));
        buf.close();
        let result = reader.join().unwrap();
        assert!(matches!(result, Err(AudioError::BufferClosed)));
        assert!(matches!(buf.write(&[1]), Err(AudioError::BufferClosed)));
    }
}
