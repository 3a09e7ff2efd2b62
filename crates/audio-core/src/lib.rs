//! Full-duplex audio pipeline on top of an RTP stream
//!
//! Capture flows source -> tx ring buffer -> filters -> encoder -> RTP;
//! playout flows RTP -> decoder -> filters -> rx ring buffer -> player.
//!
//! - [`buffer`]: thread-safe PCM ring buffer with fill threshold
//! - [`codec`]: codec trait, registry and the built-in G.711 and L16 codecs
//! - [`telev`]: RFC 4733 telephone events
//! - [`filter`]: pluggable PCM filters
//! - [`device`]: capture and playout device contracts plus test backends
//! - [`pipeline`]: the [`AudioStream`] tying it together

pub mod buffer;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod realtime;
pub mod telev;

pub use buffer::{AudioBuffer, BufferStats};
pub use codec::{AudioCodec, CodecDescriptor, CodecInstance, CodecParams, CodecRegistry, SharedCodec};
pub use config::{AudioConfig, AudioConfigBuilder, AudioMode};
pub use device::{AudioPlayer, AudioSource, DeviceHandle, DeviceParams};
pub use error::{AudioError, Result};
pub use filter::{AudioFilter, FilterChain, FilterParams, FilterRegistry, FilterState};
pub use pipeline::{AudioContext, AudioStream};
pub use telev::{TelevReceiver, TelevSender};
