//! Error types for the audio pipeline

use thiserror::Error;

/// Result alias for audio operations
pub type Result<T> = std::result::Result<T, AudioError>;

/// Errors raised by the audio pipeline and its collaborators
#[derive(Error, Debug)]
pub enum AudioError {
    /// No registered codec matches the request
    #[error("Codec not found: {name}")]
    CodecNotFound { name: String },

    /// A codec instance could not be created
    #[error("Codec initialization failed: {reason}")]
    CodecInit { reason: String },

    /// A single frame failed to encode
    #[error("Encoding failed: {reason}")]
    EncodingFailed { reason: String },

    /// A single frame failed to decode
    #[error("Decoding failed: {reason}")]
    DecodingFailed { reason: String },

    /// A filter could not be set up or failed on a frame
    #[error("Filter {name} failed: {reason}")]
    Filter { name: String, reason: String },

    /// Audio device failure
    #[error("Device error on {device} during {operation}: {reason}")]
    Device {
        device: String,
        operation: String,
        reason: String,
    },

    /// A timed ring-buffer read did not complete in time
    #[error("Ring buffer read timed out")]
    BufferTimeout,

    /// The ring buffer was closed while waiting
    #[error("Ring buffer closed")]
    BufferClosed,

    /// Invalid configuration value
    #[error("Invalid audio configuration: {details}")]
    InvalidConfig { details: String },

    /// Error from the underlying RTP stream
    #[error("Stream error: {0}")]
    Stream(#[from] voxmedia_rtp_core::Error),
}

impl AudioError {
    /// Create a codec-not-found error
    pub fn codec_not_found(name: impl Into<String>) -> Self {
        Self::CodecNotFound { name: name.into() }
    }

    /// Create a codec initialization error
    pub fn codec_init(reason: impl Into<String>) -> Self {
        Self::CodecInit {
            reason: reason.into(),
        }
    }

    /// Create an encoding failed error
    pub fn encoding_failed(reason: impl Into<String>) -> Self {
        Self::EncodingFailed {
            reason: reason.into(),
        }
    }

    /// Create a decoding failed error
    pub fn decoding_failed(reason: impl Into<String>) -> Self {
        Self::DecodingFailed {
            reason: reason.into(),
        }
    }

    /// Create a filter error
    pub fn filter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Filter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a device error
    pub fn device(
        device: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Device {
            device: device.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(details: impl Into<String>) -> Self {
        Self::InvalidConfig {
            details: details.into(),
        }
    }

    /// Per-frame failures are recoverable: the frame is dropped and the
    /// pipeline keeps running. Allocation and configuration failures abort
    /// the operation that raised them.
    pub fn is_recoverable(&self) -> bool {
        match self {
            AudioError::EncodingFailed { .. }
            | AudioError::DecodingFailed { .. }
            | AudioError::BufferTimeout => true,
            AudioError::Stream(err) => err.is_recoverable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(AudioError::encoding_failed("short frame").is_recoverable());
        assert!(AudioError::BufferTimeout.is_recoverable());
        assert!(!AudioError::codec_not_found("opus").is_recoverable());
        assert!(!AudioError::invalid_config("ptime 0").is_recoverable());
        assert!(!AudioError::device("tone", "alloc", "busy").is_recoverable());
    }

    #[test]
    fn test_display() {
        let err = AudioError::device("tone", "start", "no such device");
        assert_eq!(
            err.to_string(),
            "Device error on tone during start: no such device"
        );
    }
}
