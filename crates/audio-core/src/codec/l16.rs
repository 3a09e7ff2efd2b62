//! L16: uncompressed 16-bit linear PCM in network byte order

use bytes::{Buf, BufMut, Bytes};

use super::{AudioCodec, CodecDescriptor, CodecParams};
use crate::error::{AudioError, Result};

/// Linear PCM codec
#[derive(Debug, Default, Clone, Copy)]
pub struct L16Codec;

impl AudioCodec for L16Codec {
    fn encode(&mut self, pcm: &[i16], out: &mut Vec<u8>) -> Result<()> {
        out.reserve(pcm.len() * 2);
        for &sample in pcm {
            out.put_i16(sample);
        }
        Ok(())
    }

    fn decode(&mut self, payload: &mut Bytes, out: &mut Vec<i16>) -> Result<()> {
        if payload.len() % 2 != 0 {
            let len = payload.len();
            payload.clear();
            return Err(AudioError::decoding_failed(format!(
                "odd L16 payload length {}",
                len
            )));
        }
        out.reserve(payload.len() / 2);
        while payload.has_remaining() {
            out.push(payload.get_i16());
        }
        Ok(())
    }
}

/// Descriptor for L16 at `srate`/`channels` with a dynamic payload type
pub fn l16(srate: u32, channels: u8) -> CodecDescriptor {
    CodecDescriptor::new("L16", srate, channels, |_params: &CodecParams| {
        Ok(Box::new(L16Codec) as Box<dyn AudioCodec>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_byte_order() {
        let mut out = Vec::new();
        L16Codec.encode(&[0x0102, -2], &mut out).unwrap();
        assert_eq!(out, vec![0x01, 0x02, 0xff, 0xfe]);

        let mut payload = Bytes::from(out);
        let mut pcm = Vec::new();
        L16Codec.decode(&mut payload, &mut pcm).unwrap();
        assert_eq!(pcm, vec![0x0102, -2]);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_odd_length_is_a_frame_error() {
        let mut payload = Bytes::from_static(&[1, 2, 3]);
        let err = L16Codec.decode(&mut payload, &mut Vec::new()).unwrap_err();
        assert!(err.is_recoverable());
        assert!(payload.is_empty());
    }
}
