//! Sequence-number based loss, duplicate and reorder classification

use serde::{Deserialize, Serialize};

use crate::RtpSequenceNumber;

/// Deltas separating "forward jump" and "reorder" in [`SequenceTracker`].
///
/// For `delta = seq - last` (mod 2^16): `1..forward_jump` counts as loss,
/// `forward_jump..reorder` as a stream restart and everything from
/// `reorder` up as an old or reordered packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossThresholds {
    /// First delta treated as a restart rather than loss
    pub forward_jump: u16,
    /// First delta treated as a backward step
    pub reorder: u16,
}

impl Default for LossThresholds {
    fn default() -> Self {
        Self {
            forward_jump: 3000,
            reorder: 65436,
        }
    }
}

/// Result of feeding one sequence number to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// Packet accepted; `lost` packets were skipped before it
    Admitted { lost: u16 },
    /// Large forward jump; accepted as a new starting point
    Restart,
    /// Same sequence as the last admitted packet
    Duplicate,
    /// Behind the last admitted packet
    Late,
}

impl SequenceOutcome {
    /// Number of packets to report as lost
    pub fn lost(&self) -> u16 {
        match self {
            Self::Admitted { lost } => *lost,
            _ => 0,
        }
    }

    /// True when the tracker state was left untouched
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Duplicate | Self::Late)
    }
}

/// Tracks the last admitted sequence number of one RTP flow
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<RtpSequenceNumber>,
    thresholds: LossThresholds,
}

impl SequenceTracker {
    /// Create a tracker with custom thresholds
    pub fn new(thresholds: LossThresholds) -> Self {
        Self {
            last: None,
            thresholds,
        }
    }

    /// Last admitted sequence number
    pub fn last(&self) -> Option<RtpSequenceNumber> {
        self.last
    }

    /// Forget the last admitted sequence number
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Classify `seq` and update the state accordingly
    pub fn update(&mut self, seq: RtpSequenceNumber) -> SequenceOutcome {
        let Some(last) = self.last else {
            self.last = Some(seq);
            return SequenceOutcome::Admitted { lost: 0 };
        };

        let delta = seq.wrapping_sub(last);

        if delta == 0 {
            SequenceOutcome::Duplicate
        } else if delta < self.thresholds.forward_jump {
            self.last = Some(seq);
            SequenceOutcome::Admitted { lost: delta - 1 }
        } else if delta < self.thresholds.reorder {
            self.last = Some(seq);
            SequenceOutcome::Restart
        } else {
            SequenceOutcome::Late
        }
    }
}
