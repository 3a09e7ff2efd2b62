use std::sync::Arc;

use tracing::{debug, warn};
use voxmedia_infra_common::Range;
use voxmedia_rtp_core::media::{MediaDescription, PayloadFormat, PT_DYN_MAX, PT_DYN_MIN};

use super::CodecDescriptor;

/// Ordered set of available codecs.
///
/// Registration order is preserved and is the preference order used when
/// advertising codecs; the first registered codec is the default.
#[derive(Debug, Default, Clone)]
pub struct CodecRegistry {
    codecs: Vec<Arc<CodecDescriptor>>,
}

impl CodecRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the codecs compiled into this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        #[cfg(feature = "codec-g711")]
        {
            registry.register(super::g711::pcmu());
            registry.register(super::g711::pcma());
        }
        #[cfg(feature = "codec-l16")]
        {
            registry.register(super::l16::l16(16000, 1));
        }
        registry
    }

    /// Append a codec
    pub fn register(&mut self, codec: CodecDescriptor) -> Arc<CodecDescriptor> {
        debug!("codec: registered {}", codec);
        let codec = Arc::new(codec);
        self.codecs.push(Arc::clone(&codec));
        codec
    }

    /// Remove every codec with this name
    pub fn unregister(&mut self, name: &str) {
        self.codecs.retain(|c| !c.name.eq_ignore_ascii_case(name));
    }

    /// First codec matching all given criteria; `None` and zero act as
    /// wildcards
    pub fn find(&self, name: Option<&str>, srate: u32, channels: u8) -> Option<Arc<CodecDescriptor>> {
        self.codecs
            .iter()
            .find(|c| {
                name.map_or(true, |n| c.name.eq_ignore_ascii_case(n))
                    && (srate == 0 || c.srate == srate)
                    && (channels == 0 || c.channels == channels)
            })
            .cloned()
    }

    /// Codec for a negotiated payload format
    pub fn find_format(&self, format: &PayloadFormat) -> Option<Arc<CodecDescriptor>> {
        self.find(Some(&format.name), format.clock_rate, format.channels)
    }

    /// The default codec
    pub fn first(&self) -> Option<Arc<CodecDescriptor>> {
        self.codecs.first().cloned()
    }

    /// Codecs in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CodecDescriptor>> {
        self.codecs.iter()
    }

    /// Number of registered codecs
    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Add every codec whose clock rate and channel count fall inside the
    /// given ranges to the local format table. Codecs without a static
    /// payload type get the lowest free dynamic one. Returns how many were
    /// added.
    pub fn add_to_media(&self, media: &mut MediaDescription, srate: Range, channels: Range) -> usize {
        let mut added = 0;

        for codec in &self.codecs {
            if !srate.is_unset() && !srate.contains(codec.srate) {
                debug!("codec: {} skipped, clock rate outside {}", codec, srate);
                continue;
            }
            if !channels.is_unset() && !channels.contains(codec.channels as u32) {
                debug!("codec: {} skipped, channels outside {}", codec, channels);
                continue;
            }

            let pt = match codec.payload_type {
                Some(pt) => pt,
                None => match (PT_DYN_MIN..=PT_DYN_MAX).find(|pt| !media.uses_payload_type(*pt)) {
                    Some(pt) => pt,
                    None => {
                        warn!("codec: no free dynamic payload type for {}", codec);
                        continue;
                    }
                },
            };

            let mut format = PayloadFormat::new(pt, codec.name.clone(), codec.srate, codec.channels);
            format.fmtp = codec.fmtp.clone();
            media.add_local_format(format);
            added += 1;
        }

        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AudioCodec;

    fn l16(srate: u32, ch: u8) -> CodecDescriptor {
        crate::codec::l16::l16(srate, ch)
    }

    #[test]
    fn test_builtin_order() {
        let registry = CodecRegistry::with_builtin();
        let names: Vec<_> = registry.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["PCMU", "PCMA", "L16"]);
        assert_eq!(registry.first().unwrap().name, "PCMU");
    }

    #[test]
    fn test_find_wildcards() {
        let mut registry = CodecRegistry::with_builtin();
        registry.register(l16(44100, 2));

        assert_eq!(registry.find(Some("pcma"), 0, 0).unwrap().payload_type, Some(8));
        assert_eq!(registry.find(Some("L16"), 0, 2).unwrap().srate, 44100);
        assert_eq!(registry.find(None, 16000, 0).unwrap().name, "L16");
        assert!(registry.find(Some("opus"), 0, 0).is_none());

        registry.unregister("l16");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_add_to_media_assigns_dynamic_types() {
        let mut registry = CodecRegistry::with_builtin();
        registry.register(l16(48000, 2));
        registry.register(
            CodecDescriptor::new("telephone-event", 8000, 1, |_| {
                Err(crate::error::AudioError::codec_init("signalling only"))
            })
            .with_fmtp("0-15"),
        );

        let mut media = MediaDescription::new("audio");
        let added = registry.add_to_media(&mut media, Range::new(8000, 16000), Range::new(1, 1));
        assert_eq!(added, 4);

        let pts: Vec<_> = media.local_formats.iter().map(|f| f.payload_type).collect();
        assert_eq!(pts, vec![0, 8, 96, 97]);
        assert_eq!(media.local_format(97).unwrap().fmtp.as_deref(), Some("0-15"));
        assert!(media.local_format_by_name("L16", 48000).is_none());
    }

    #[test]
    fn test_find_format_matches_negotiated_entry() {
        let registry = CodecRegistry::with_builtin();
        let codec = registry
            .find_format(&PayloadFormat::new(101, "L16", 16000, 1))
            .unwrap();
        let params = crate::codec::CodecParams {
            srate: codec.dsp_srate(),
            channels: codec.channels,
            ptime: 20,
            fmtp: None,
        };
        let mut state: Box<dyn AudioCodec> = codec.instantiate(&params).unwrap();
        let mut out = Vec::new();
        state.encode(&[1, 2], &mut out).unwrap();
        assert_eq!(out.len(), 4);
    }
}
