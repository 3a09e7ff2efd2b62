//! Audio pipeline configuration

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use voxmedia_infra_common::Range;

use crate::error::{AudioError, Result};

/// How encoded frames are pulled from the tx ring buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    /// Encode inline in the capture callback
    #[default]
    Poll,
    /// Dedicated tx thread
    Thread,
    /// Dedicated tx thread with real-time scheduling
    ThreadRealtime,
    /// Periodic task on the runtime
    Timer,
}

impl AudioMode {
    /// Config-file spelling
    pub fn as_str(self) -> &'static str {
        match self {
            AudioMode::Poll => "poll",
            AudioMode::Thread => "thread",
            AudioMode::ThreadRealtime => "thread_realtime",
            AudioMode::Timer => "timer",
        }
    }

    /// True for the modes that own a tx thread
    pub fn is_threaded(self) -> bool {
        matches!(self, AudioMode::Thread | AudioMode::ThreadRealtime)
    }
}

impl fmt::Display for AudioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioMode {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "poll" => Ok(AudioMode::Poll),
            "thread" => Ok(AudioMode::Thread),
            "thread_realtime" => Ok(AudioMode::ThreadRealtime),
            "timer" | "tmr" => Ok(AudioMode::Timer),
            other => Err(AudioError::invalid_config(format!(
                "unknown audio mode '{}'",
                other
            ))),
        }
    }
}

/// Audio pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Device name passed to the source and player backends
    pub device: Option<String>,
    /// Clock rates of codecs to advertise
    pub srate: Range,
    /// Channel counts of codecs to advertise
    pub channels: Range,
    /// Clamp for the capture sample rate
    pub srate_src: Range,
    /// Clamp for the playout sample rate
    pub srate_play: Range,
    /// Echo canceller tail length in milliseconds, passed to filters
    pub aec_len: u32,
    /// Packet time in milliseconds
    pub ptime: u32,
    /// Tx scheduling mode
    pub mode: AudioMode,
    /// Interval between telephone-event packets in milliseconds
    pub telev_ptime: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            srate: Range::new(8000, 48000),
            channels: Range::new(1, 2),
            srate_src: Range::default(),
            srate_play: Range::default(),
            aec_len: 0,
            ptime: 20,
            mode: AudioMode::Poll,
            telev_ptime: 50,
        }
    }
}

impl AudioConfig {
    /// Start a builder from the defaults
    pub fn builder() -> AudioConfigBuilder {
        AudioConfigBuilder::default()
    }

    /// Check that the configured values are usable
    pub fn validate(&self) -> Result<()> {
        if self.ptime == 0 {
            return Err(AudioError::invalid_config("ptime must be non-zero"));
        }
        if self.telev_ptime == 0 {
            return Err(AudioError::invalid_config("telev_ptime must be non-zero"));
        }
        for (name, range) in [
            ("srate", self.srate),
            ("channels", self.channels),
            ("srate_src", self.srate_src),
            ("srate_play", self.srate_play),
        ] {
            if range.max != 0 && range.min > range.max {
                return Err(AudioError::invalid_config(format!(
                    "{} range {} is inverted",
                    name, range
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`AudioConfig`]
#[derive(Debug, Clone, Default)]
pub struct AudioConfigBuilder {
    config: AudioConfig,
}

impl AudioConfigBuilder {
    /// Set the device name
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.config.device = Some(device.into());
        self
    }

    /// Set the advertised clock-rate range
    pub fn srate(mut self, min: u32, max: u32) -> Self {
        self.config.srate = Range::new(min, max);
        self
    }

    /// Set the advertised channel range
    pub fn channels(mut self, min: u32, max: u32) -> Self {
        self.config.channels = Range::new(min, max);
        self
    }

    /// Clamp the capture sample rate
    pub fn srate_src(mut self, min: u32, max: u32) -> Self {
        self.config.srate_src = Range::new(min, max);
        self
    }

    /// Clamp the playout sample rate
    pub fn srate_play(mut self, min: u32, max: u32) -> Self {
        self.config.srate_play = Range::new(min, max);
        self
    }

    /// Set the echo canceller tail length
    pub fn aec_len(mut self, ms: u32) -> Self {
        self.config.aec_len = ms;
        self
    }

    /// Set the packet time
    pub fn ptime(mut self, ms: u32) -> Self {
        self.config.ptime = ms;
        self
    }

    /// Set the tx scheduling mode
    pub fn mode(mut self, mode: AudioMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the telephone-event packet interval
    pub fn telev_ptime(mut self, ms: u32) -> Self {
        self.config.telev_ptime = ms;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<AudioConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.ptime, 20);
        assert_eq!(config.mode, AudioMode::Poll);
        assert!(config.srate_src.is_unset());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Thread_Realtime".parse::<AudioMode>().unwrap(), AudioMode::ThreadRealtime);
        assert_eq!("tmr".parse::<AudioMode>().unwrap(), AudioMode::Timer);
        assert!("fast".parse::<AudioMode>().is_err());
        assert!(AudioMode::Thread.is_threaded());
        assert!(!AudioMode::Timer.is_threaded());
    }

    #[test]
    fn test_builder_validation() {
        assert!(AudioConfig::builder().ptime(0).build().is_err());
        assert!(AudioConfig::builder().srate_play(16000, 8000).build().is_err());

        let config = AudioConfig::builder()
            .ptime(30)
            .mode(AudioMode::Timer)
            .srate_src(16000, 0)
            .build()
            .unwrap();
        assert_eq!(config.ptime, 30);
        assert_eq!(config.srate_src.clamp_preferred(8000), 16000);
    }

    #[test]
    fn test_serde_shape() {
        let config: AudioConfig =
            serde_json::from_str(r#"{"mode":"thread_realtime","ptime":40}"#).unwrap();
        assert_eq!(config.mode, AudioMode::ThreadRealtime);
        assert_eq!(config.ptime, 40);
        assert_eq!(config.telev_ptime, 50);
    }
}
