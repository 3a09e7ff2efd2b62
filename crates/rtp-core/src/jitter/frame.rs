use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace};

use super::{JitterBuffer, JitterStats};
use crate::error::Error;
use crate::packet::RtpHeader;
use crate::sequence::LossThresholds;
use crate::{Result, RtpSequenceNumber};

/// True when `a` precedes `b` in 16-bit serial arithmetic
fn seq_less(a: RtpSequenceNumber, b: RtpSequenceNumber) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

/// Fixed-depth jitter buffer measured in frames.
///
/// Playout starts once `min` frames are queued; more than `max` frames
/// evicts the oldest. Running dry counts an underflow and re-buffers.
/// A packet whose distance from the last played sequence falls in the
/// restart band of its [`LossThresholds`] starts a new sequence space.
#[derive(Debug)]
pub struct FrameJitterBuffer {
    frames: VecDeque<(RtpHeader, Bytes)>,
    min: usize,
    max: usize,
    running: bool,
    last_get: Option<RtpSequenceNumber>,
    thresholds: LossThresholds,
    stats: JitterStats,
}

impl FrameJitterBuffer {
    /// Create a buffer holding between `min` and `max` frames
    pub fn new(min: u32, max: u32) -> Result<Self> {
        Self::with_thresholds(min, max, LossThresholds::default())
    }

    /// Create a buffer that detects sequence restarts with `thresholds`
    pub fn with_thresholds(min: u32, max: u32, thresholds: LossThresholds) -> Result<Self> {
        if min == 0 || max < min {
            return Err(Error::invalid_config(format!(
                "jitter buffer delay {}-{} frames",
                min, max
            )));
        }

        Ok(Self {
            frames: VecDeque::with_capacity(max as usize),
            min: min as usize,
            max: max as usize,
            running: false,
            last_get: None,
            thresholds,
            stats: JitterStats::default(),
        })
    }

    /// Drop queued frames and forget playout position
    fn reset(&mut self) {
        self.frames.clear();
        self.running = false;
        self.last_get = None;
    }
}

impl JitterBuffer for FrameJitterBuffer {
    fn put(&mut self, header: &RtpHeader, payload: Bytes) -> Result<()> {
        let seq = header.sequence_number;

        if let Some(last) = self.last_get {
            let delta = seq.wrapping_sub(last);
            if delta >= self.thresholds.forward_jump && delta < self.thresholds.reorder {
                debug!(
                    "jbuf: sequence restart {} -> {}, dropping {} frames",
                    last,
                    seq,
                    self.frames.len()
                );
                self.reset();
            } else if delta == 0 || delta >= self.thresholds.reorder {
                return Err(Error::JitterBuffer {
                    seq,
                    reason: format!("late packet, already played {}", last),
                });
            }
        }

        // Position after the last frame that precedes `seq`
        let mut pos = self.frames.len();
        while pos > 0 {
            let prev = self.frames[pos - 1].0.sequence_number;
            if prev == seq {
                return Err(Error::JitterBuffer {
                    seq,
                    reason: "duplicate".to_string(),
                });
            }
            if seq_less(prev, seq) {
                break;
            }
            pos -= 1;
        }

        if self.frames.len() >= self.max {
            if let Some((old, _)) = self.frames.pop_front() {
                debug!("jbuf: overflow, dropping seq={}", old.sequence_number);
            }
            self.stats.overflow += 1;
            pos = pos.saturating_sub(1);
        }

        self.frames.insert(pos, (*header, payload));
        self.stats.put += 1;
        trace!("jbuf: put seq={} n={}", seq, self.frames.len());
        Ok(())
    }

    fn get(&mut self) -> Option<(RtpHeader, Bytes)> {
        if !self.running && self.frames.len() < self.min {
            return None;
        }

        match self.frames.pop_front() {
            Some(frame) => {
                self.running = true;
                self.last_get = Some(frame.0.sequence_number);
                self.stats.get += 1;
                Some(frame)
            }
            None => {
                self.running = false;
                self.stats.underflow += 1;
                None
            }
        }
    }

    fn flush(&mut self) {
        if !self.frames.is_empty() {
            debug!("jbuf: flushing {} frames", self.frames.len());
        }
        self.reset();
    }

    fn stats(&self) -> JitterStats {
        self.stats
    }

    fn len(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr(seq: u16) -> RtpHeader {
        RtpHeader::new(false, 0, seq, seq as u32 * 160, 1)
    }

    fn put(jb: &mut FrameJitterBuffer, seq: u16) -> Result<()> {
        jb.put(&hdr(seq), Bytes::from(vec![seq as u8]))
    }

    #[test]
    fn test_waits_for_min_then_reorders() {
        let mut jb = FrameJitterBuffer::new(2, 10).unwrap();
        put(&mut jb, 11).unwrap();
        assert!(jb.get().is_none());
        put(&mut jb, 10).unwrap();

        assert_eq!(jb.get().unwrap().0.sequence_number, 10);
        assert_eq!(jb.get().unwrap().0.sequence_number, 11);
        assert!(jb.get().is_none());

        let stats = jb.stats();
        assert_eq!(stats.put, 2);
        assert_eq!(stats.get, 2);
        assert_eq!(stats.underflow, 1);
    }

    #[test]
    fn test_duplicate_and_late_rejected() {
        let mut jb = FrameJitterBuffer::new(1, 10).unwrap();
        put(&mut jb, 5).unwrap();
        assert!(matches!(put(&mut jb, 5), Err(Error::JitterBuffer { seq: 5, .. })));

        jb.get().unwrap();
        assert!(put(&mut jb, 4).is_err());
        assert!(put(&mut jb, 6).is_ok());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut jb = FrameJitterBuffer::new(1, 3).unwrap();
        for seq in 1..=4 {
            put(&mut jb, seq).unwrap();
        }
        assert_eq!(jb.len(), 3);
        assert_eq!(jb.stats().overflow, 1);
        assert_eq!(jb.get().unwrap().0.sequence_number, 2);
    }

    #[test]
    fn test_ordering_across_wrap() {
        let mut jb = FrameJitterBuffer::new(3, 10).unwrap();
        put(&mut jb, 1).unwrap();
        put(&mut jb, 65535).unwrap();
        put(&mut jb, 0).unwrap();
        let order: Vec<u16> = std::iter::from_fn(|| jb.get().map(|(h, _)| h.sequence_number))
            .take(3)
            .collect();
        assert_eq!(order, vec![65535, 0, 1]);
    }

    #[test]
    fn test_flush_resets_playout() {
        let mut jb = FrameJitterBuffer::new(1, 4).unwrap();
        put(&mut jb, 100).unwrap();
        jb.get().unwrap();
        jb.flush();
        // an older sequence is accepted again after a flush
        put(&mut jb, 3).unwrap();
        assert_eq!(jb.len(), 1);
    }

    #[test]
    fn test_forward_jump_restarts_playout() {
        let mut jb = FrameJitterBuffer::new(2, 10).unwrap();
        for seq in 10..14 {
            put(&mut jb, seq).unwrap();
        }
        assert_eq!(jb.get().unwrap().0.sequence_number, 10);

        // 40000 - 10 lies in the restart band; queued frames are dropped
        put(&mut jb, 40000).unwrap();
        assert_eq!(jb.len(), 1);
        assert!(jb.get().is_none());
        put(&mut jb, 40001).unwrap();
        assert_eq!(jb.get().unwrap().0.sequence_number, 40000);
        assert_eq!(jb.get().unwrap().0.sequence_number, 40001);

        // small backward step is still late
        assert!(put(&mut jb, 39990).is_err());
    }

    #[test]
    fn test_restart_band_follows_thresholds() {
        let thresholds = LossThresholds {
            forward_jump: 100,
            reorder: 65000,
        };
        let mut jb = FrameJitterBuffer::with_thresholds(1, 10, thresholds).unwrap();
        put(&mut jb, 1).unwrap();
        jb.get().unwrap();

        put(&mut jb, 50).unwrap();
        put(&mut jb, 51).unwrap();
        assert_eq!(jb.len(), 2);

        // delta 200 restarts with these thresholds
        put(&mut jb, 201).unwrap();
        assert_eq!(jb.len(), 1);
        assert_eq!(jb.get().unwrap().0.sequence_number, 201);

        // delta 65036 is a backward step
        assert!(put(&mut jb, 201u16.wrapping_sub(500)).is_err());
    }

    #[test]
    fn test_rejects_bad_bounds() {
        assert!(FrameJitterBuffer::new(0, 5).is_err());
        assert!(FrameJitterBuffer::new(5, 2).is_err());
    }
}
