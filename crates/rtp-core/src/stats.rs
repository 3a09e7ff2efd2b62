//! Per-stream traffic counters and bitrate sampling

use std::time::Instant;

/// Packet and byte counters for one direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    /// Packets since the stream was created
    pub packets: u64,
    /// Bytes since the last bitrate sample
    pub bytes: u64,
    /// Bitrate computed at the last sample, in bit/s
    pub bitrate: u32,
}

impl DirectionStats {
    /// Account one packet of `len` bytes
    pub fn record(&mut self, len: usize) {
        self.packets += 1;
        self.bytes += len as u64;
    }

    fn sample(&mut self, elapsed_ms: Option<u64>) {
        if let Some(ms) = elapsed_ms {
            self.bitrate = (self.bytes * 8 * 1000 / ms).min(u32::MAX as u64) as u32;
        }
        self.bytes = 0;
    }
}

/// Transmit and receive counters of a stream
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// Outgoing traffic
    pub tx: DirectionStats,
    /// Incoming traffic
    pub rx: DirectionStats,
    last_sample: Option<Instant>,
}

impl StreamStats {
    /// Compute both bitrates from the bytes seen since the previous sample
    /// and reset the byte counters.
    ///
    /// The first call computes nothing; it only starts the measurement.
    /// Returns true when the bitrates were updated.
    pub fn sample(&mut self, now: Instant) -> bool {
        let elapsed_ms = match self.last_sample {
            Some(last) if now <= last => return false,
            Some(last) => Some(now.duration_since(last).as_millis() as u64).filter(|ms| *ms > 0),
            None => None,
        };

        self.tx.sample(elapsed_ms);
        self.rx.sample(elapsed_ms);
        self.last_sample = Some(now);
        elapsed_ms.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_sample_only_records_time() {
        let mut stats = StreamStats::default();
        stats.tx.record(1000);
        assert!(!stats.sample(Instant::now()));
        assert_eq!(stats.tx.bitrate, 0);
        assert_eq!(stats.tx.bytes, 0);
        assert_eq!(stats.tx.packets, 1);
    }

    #[test]
    fn test_bitrate_over_three_seconds() {
        let mut stats = StreamStats::default();
        let t0 = Instant::now();
        stats.sample(t0);

        // 150 packets of 172 bytes in 3 s: 68800 bit/s
        for _ in 0..150 {
            stats.tx.record(172);
            stats.rx.record(172);
        }
        assert!(stats.sample(t0 + Duration::from_secs(3)));
        assert_eq!(stats.tx.bitrate, 68800);
        assert_eq!(stats.rx.bitrate, 68800);
        assert_eq!(stats.tx.bytes, 0);
        assert_eq!(stats.tx.packets, 150);

        assert!(stats.sample(t0 + Duration::from_secs(6)));
        assert_eq!(stats.rx.bitrate, 0);
    }
}
