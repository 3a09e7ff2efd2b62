//! Telephone events (RFC 4733)
//!
//! The sender turns key presses into a start packet (marker set),
//! continuation packets with growing duration and an end packet that is
//! repeated three times. The receiver reports each event's start once and
//! its end once, however many packets carry them.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};

use crate::error::{AudioError, Result};

/// Clock rate of telephone-event payloads
pub const TELEV_SRATE: u32 = 8000;

/// Number of times the end packet is sent
const END_REPEATS: u8 = 3;

/// Volume field of generated events (-dBm0)
const DEFAULT_VOLUME: u8 = 10;

/// Map a DTMF digit to its event code
pub fn digit_to_code(digit: char) -> Option<u8> {
    match digit {
        '0'..='9' => Some(digit as u8 - b'0'),
        '*' => Some(10),
        '#' => Some(11),
        'A'..='D' => Some(digit as u8 - b'A' + 12),
        'a'..='d' => Some(digit as u8 - b'a' + 12),
        _ => None,
    }
}

/// Map an event code back to its DTMF digit
pub fn code_to_digit(code: u8) -> Option<char> {
    match code {
        0..=9 => Some((b'0' + code) as char),
        10 => Some('*'),
        11 => Some('#'),
        12..=15 => Some((b'A' + code - 12) as char),
        _ => None,
    }
}

/// One encoded event packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelevPacket {
    /// Set on the first packet of an event
    pub marker: bool,
    /// Four-byte RFC 4733 payload
    pub payload: [u8; 4],
}

impl TelevPacket {
    fn encode(code: u8, end: bool, duration: u16, marker: bool) -> Self {
        let [hi, lo] = duration.to_be_bytes();
        let flags = (if end { 0x80 } else { 0 }) | (DEFAULT_VOLUME & 0x3f);
        Self {
            marker,
            payload: [code, flags, hi, lo],
        }
    }

    /// Event code
    pub fn code(&self) -> u8 {
        self.payload[0]
    }

    /// True for end-of-event packets
    pub fn is_end(&self) -> bool {
        self.payload[1] & 0x80 != 0
    }

    /// Duration in 8 kHz units
    pub fn duration(&self) -> u16 {
        u16::from_be_bytes([self.payload[2], self.payload[3]])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Start(u8),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Idle,
    Sending { code: u8, duration: u16 },
    Ending { code: u8, duration: u16, remaining: u8 },
}

/// Event sender, polled from the capture path
#[derive(Debug)]
pub struct TelevSender {
    queue: VecDeque<Pending>,
    state: TxState,
}

impl Default for TelevSender {
    fn default() -> Self {
        Self::new()
    }
}

impl TelevSender {
    /// An idle sender
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            state: TxState::Idle,
        }
    }

    /// Queue the start of an event
    pub fn start(&mut self, code: u8) -> Result<()> {
        if code > 15 {
            return Err(AudioError::invalid_config(format!(
                "telephone event code {} out of range",
                code
            )));
        }
        self.queue.push_back(Pending::Start(code));
        Ok(())
    }

    /// Queue the end of the current event
    pub fn end(&mut self) {
        self.queue.push_back(Pending::End);
    }

    /// True when an event is being sent or queued
    pub fn is_busy(&self) -> bool {
        self.state != TxState::Idle || !self.queue.is_empty()
    }

    /// Produce the packet due after `elapsed_ms` milliseconds, if any.
    /// The event duration grows by the elapsed time.
    pub fn poll(&mut self, elapsed_ms: u32) -> Option<TelevPacket> {
        let step = (elapsed_ms as u64 * TELEV_SRATE as u64 / 1000).min(u16::MAX as u64) as u16;

        match self.state {
            TxState::Idle => loop {
                match self.queue.pop_front()? {
                    Pending::Start(code) => {
                        self.state = TxState::Sending {
                            code,
                            duration: step,
                        };
                        return Some(TelevPacket::encode(code, false, step, true));
                    }
                    // End without a running event
                    Pending::End => continue,
                }
            },
            TxState::Sending { code, duration } => {
                let duration = duration.saturating_add(step);
                if self.queue.front() == Some(&Pending::End) {
                    self.queue.pop_front();
                    self.state = TxState::Ending {
                        code,
                        duration,
                        remaining: END_REPEATS - 1,
                    };
                    Some(TelevPacket::encode(code, true, duration, false))
                } else {
                    self.state = TxState::Sending { code, duration };
                    Some(TelevPacket::encode(code, false, duration, false))
                }
            }
            TxState::Ending {
                code,
                duration,
                remaining,
            } => {
                self.state = if remaining > 1 {
                    TxState::Ending {
                        code,
                        duration,
                        remaining: remaining - 1,
                    }
                } else {
                    TxState::Idle
                };
                Some(TelevPacket::encode(code, true, duration, false))
            }
        }
    }
}

/// Event receiver
#[derive(Debug, Default)]
pub struct TelevReceiver {
    current: Option<u8>,
    ended: Option<u8>,
}

impl TelevReceiver {
    /// A receiver with no event in progress
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one payload and return `(code, end)` when it starts or ends an
    /// event; repeats and continuations return `None`
    pub fn recv(&mut self, payload: &Bytes) -> Result<Option<(u8, bool)>> {
        if payload.len() < 4 {
            return Err(AudioError::decoding_failed(format!(
                "telephone event payload of {} bytes",
                payload.len()
            )));
        }

        let mut buf = payload.slice(..4);
        let code = buf.get_u8();
        let end = buf.get_u8() & 0x80 != 0;

        if end {
            if self.ended == Some(code) {
                return Ok(None);
            }
            self.ended = Some(code);
            self.current = None;
            return Ok(Some((code, true)));
        }

        if self.current == Some(code) {
            return Ok(None);
        }
        self.current = Some(code);
        self.ended = None;
        Ok(Some((code, false)))
    }
}
