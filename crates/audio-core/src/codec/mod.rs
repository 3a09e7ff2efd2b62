//! Audio codec contract and registry
//!
//! A [`CodecDescriptor`] names a codec (encoding name, RTP clock rate,
//! channel count) and knows how to create instances of it. Instances are
//! handed out as [`SharedCodec`] so that an encoder and a decoder with the
//! same identity can share one codec state.

#[cfg(feature = "codec-g711")]
pub mod g711;
#[cfg(feature = "codec-l16")]
pub mod l16;
mod registry;

pub use registry::CodecRegistry;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::Result;

/// Payload type of comfort noise (RFC 3389)
pub const PT_CN: u8 = 13;

/// Encoder/decoder state of one codec instance
pub trait AudioCodec: Send {
    /// Encode one frame of interleaved PCM, appending to `out`
    fn encode(&mut self, pcm: &[i16], out: &mut Vec<u8>) -> Result<()>;

    /// Decode one frame from the front of `payload`, advancing it past the
    /// consumed bytes and appending PCM to `out`
    fn decode(&mut self, payload: &mut Bytes, out: &mut Vec<i16>) -> Result<()>;

    /// Produce replacement PCM for a frame that never arrived. The default
    /// conceals nothing.
    fn conceal(&mut self, _out: &mut Vec<i16>) -> Result<()> {
        Ok(())
    }
}

/// Parameters a codec instance is created with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParams {
    /// DSP sample rate
    pub srate: u32,
    /// Channel count
    pub channels: u8,
    /// Packet time in milliseconds
    pub ptime: u32,
    /// Format parameters negotiated for the payload type
    pub fmtp: Option<String>,
}

type CodecFactory = dyn Fn(&CodecParams) -> Result<Box<dyn AudioCodec>> + Send + Sync;

/// Registered codec: identity plus instance factory
pub struct CodecDescriptor {
    /// Static payload type, `None` for dynamically assigned ones
    pub payload_type: Option<u8>,
    /// Encoding name
    pub name: String,
    /// RTP clock rate
    pub srate: u32,
    /// Channel count
    pub channels: u8,
    /// Format parameters advertised for this codec
    pub fmtp: Option<String>,
    factory: Arc<CodecFactory>,
}

impl CodecDescriptor {
    /// Describe a codec with a dynamically assigned payload type
    pub fn new<F>(name: impl Into<String>, srate: u32, channels: u8, factory: F) -> Self
    where
        F: Fn(&CodecParams) -> Result<Box<dyn AudioCodec>> + Send + Sync + 'static,
    {
        Self {
            payload_type: None,
            name: name.into(),
            srate,
            channels,
            fmtp: None,
            factory: Arc::new(factory),
        }
    }

    /// Use a static payload type
    pub fn with_payload_type(mut self, pt: u8) -> Self {
        self.payload_type = Some(pt);
        self
    }

    /// Advertise format parameters
    pub fn with_fmtp(mut self, fmtp: impl Into<String>) -> Self {
        self.fmtp = Some(fmtp.into());
        self
    }

    /// Sample rate the codec processes PCM at.
    ///
    /// G.722 declares an 8 kHz RTP clock but runs at 16 kHz.
    pub fn dsp_srate(&self) -> u32 {
        if self.name.eq_ignore_ascii_case("G722") {
            16000
        } else {
            self.srate
        }
    }

    /// Same encoding name, clock rate and channel count
    pub fn same_codec(&self, other: &CodecDescriptor) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.srate == other.srate
            && self.channels == other.channels
    }

    /// Same DSP rate and channel count, so devices need no restart
    pub fn same_clock(&self, other: &CodecDescriptor) -> bool {
        self.dsp_srate() == other.dsp_srate() && self.channels == other.channels
    }

    /// RTP timestamp units covered by `samples` interleaved PCM samples
    pub fn rtp_units(&self, samples: usize) -> u32 {
        let units = samples as u64 * self.srate as u64 / self.dsp_srate().max(1) as u64;
        units as u32
    }

    /// Create a fresh codec state
    pub fn instantiate(&self, params: &CodecParams) -> Result<Box<dyn AudioCodec>> {
        (self.factory)(params)
    }
}

impl fmt::Display for CodecDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}Hz/{}ch", self.name, self.srate, self.channels)
    }
}

impl fmt::Debug for CodecDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecDescriptor")
            .field("payload_type", &self.payload_type)
            .field("name", &self.name)
            .field("srate", &self.srate)
            .field("channels", &self.channels)
            .field("fmtp", &self.fmtp)
            .finish()
    }
}

/// A live codec state together with the descriptor it was created from
pub struct CodecInstance {
    descriptor: Arc<CodecDescriptor>,
    state: Mutex<Box<dyn AudioCodec>>,
}

/// Reference-counted codec instance; an encoder and decoder of the same
/// codec hold clones of one `SharedCodec`
pub type SharedCodec = Arc<CodecInstance>;

impl CodecInstance {
    /// Instantiate `descriptor` with `params`
    pub fn create(descriptor: Arc<CodecDescriptor>, params: &CodecParams) -> Result<SharedCodec> {
        let state = descriptor.instantiate(params)?;
        Ok(Arc::new(Self {
            descriptor,
            state: Mutex::new(state),
        }))
    }

    /// The codec this instance implements
    pub fn descriptor(&self) -> &Arc<CodecDescriptor> {
        &self.descriptor
    }

    /// Encode one frame
    pub fn encode(&self, pcm: &[i16], out: &mut Vec<u8>) -> Result<()> {
        self.state.lock().encode(pcm, out)
    }

    /// Decode one frame from the front of `payload`
    pub fn decode(&self, payload: &mut Bytes, out: &mut Vec<i16>) -> Result<()> {
        self.state.lock().decode(payload, out)
    }

    /// Conceal one lost frame
    pub fn conceal(&self, out: &mut Vec<i16>) -> Result<()> {
        self.state.lock().conceal(out)
    }
}

impl fmt::Debug for CodecInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodecInstance({})", self.descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AudioError;

    struct Null;

    impl AudioCodec for Null {
        fn encode(&mut self, _pcm: &[i16], _out: &mut Vec<u8>) -> Result<()> {
            Ok(())
        }

        fn decode(&mut self, payload: &mut Bytes, _out: &mut Vec<i16>) -> Result<()> {
            payload.clear();
            Ok(())
        }
    }

    fn null(name: &str, srate: u32, ch: u8) -> CodecDescriptor {
        CodecDescriptor::new(name, srate, ch, |_| Ok(Box::new(Null) as Box<dyn AudioCodec>))
    }

    #[test]
    fn test_identity() {
        let a = null("PCMU", 8000, 1);
        assert!(a.same_codec(&null("pcmu", 8000, 1)));
        assert!(!a.same_codec(&null("PCMU", 8000, 2)));
        assert!(a.same_clock(&null("PCMA", 8000, 1)));
        assert!(!a.same_clock(&null("G722", 8000, 1)));
    }

    #[test]
    fn test_g722_units() {
        let g722 = null("G722", 8000, 1);
        assert_eq!(g722.dsp_srate(), 16000);
        assert_eq!(g722.rtp_units(320), 160);
        assert_eq!(null("PCMA", 8000, 1).rtp_units(160), 160);
    }

    #[test]
    fn test_factory_errors_propagate() {
        let broken = CodecDescriptor::new("broken", 8000, 1, |_| {
            Err(AudioError::codec_init("no state"))
        });
        let params = CodecParams {
            srate: 8000,
            channels: 1,
            ptime: 20,
            fmtp: None,
        };
        let err = CodecInstance::create(Arc::new(broken), &params).unwrap_err();
        assert!(matches!(err, AudioError::CodecInit { .. }));
    }
}
