//! G.711 A-law (PCMA) and mu-law (PCMU)
//!
//! Sample conversion follows the ITU-T G.711 reference routines.

use bytes::Bytes;

use super::{AudioCodec, CodecDescriptor, CodecParams};
use crate::error::{AudioError, Result};

/// Companding law
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711Law {
    /// mu-law, payload type 0
    MuLaw,
    /// A-law, payload type 8
    ALaw,
}

/// Stateless G.711 codec
#[derive(Debug, Clone, Copy)]
pub struct G711Codec {
    law: G711Law,
}

impl G711Codec {
    /// Create a codec for `law`; G.711 runs at 8 kHz mono only
    pub fn new(law: G711Law, params: &CodecParams) -> Result<Self> {
        if params.srate != 8000 || params.channels != 1 {
            return Err(AudioError::codec_init(format!(
                "G.711 requires 8000Hz mono, got {}Hz/{}ch",
                params.srate, params.channels
            )));
        }
        Ok(Self { law })
    }
}

impl AudioCodec for G711Codec {
    fn encode(&mut self, pcm: &[i16], out: &mut Vec<u8>) -> Result<()> {
        match self.law {
            G711Law::MuLaw => out.extend(pcm.iter().map(|&s| ulaw_compress(s))),
            G711Law::ALaw => out.extend(pcm.iter().map(|&s| alaw_compress(s))),
        }
        Ok(())
    }

    fn decode(&mut self, payload: &mut Bytes, out: &mut Vec<i16>) -> Result<()> {
        match self.law {
            G711Law::MuLaw => out.extend(payload.iter().map(|&b| ulaw_expand(b))),
            G711Law::ALaw => out.extend(payload.iter().map(|&b| alaw_expand(b))),
        }
        payload.clear();
        Ok(())
    }
}

/// Descriptor for PCMU (static payload type 0)
pub fn pcmu() -> CodecDescriptor {
    CodecDescriptor::new("PCMU", 8000, 1, |params| {
        Ok(Box::new(G711Codec::new(G711Law::MuLaw, params)?) as Box<dyn AudioCodec>)
    })
    .with_payload_type(0)
}

/// Descriptor for PCMA (static payload type 8)
pub fn pcma() -> CodecDescriptor {
    CodecDescriptor::new("PCMA", 8000, 1, |params| {
        Ok(Box::new(G711Codec::new(G711Law::ALaw, params)?) as Box<dyn AudioCodec>)
    })
    .with_payload_type(8)
}

/// A-law compression of one 16-bit sample
pub fn alaw_compress(sample: i16) -> u8 {
    let mut ix = if sample < 0 {
        ((!sample) as u16 >> 4) as i16
    } else {
        sample >> 4
    };

    if ix > 15 {
        let mut iexp = 1;
        while ix > 16 + 15 {
            ix >>= 1;
            iexp += 1;
        }
        ix -= 16;
        ix += iexp << 4;
    }

    if sample >= 0 {
        ix |= 0x0080;
    }

    (ix ^ 0x0055) as u8
}

/// A-law expansion to a 16-bit sample
pub fn alaw_expand(code: u8) -> i16 {
    let ix = ((code ^ 0x55) & 0x7f) as i16;
    let iexp = ix >> 4;
    let mut mant = ix & 0x0f;

    if iexp > 0 {
        mant += 16;
    }
    mant = (mant << 4) + 0x08;
    if iexp > 1 {
        mant <<= iexp - 1;
    }

    if code > 127 {
        mant
    } else {
        -mant
    }
}

/// mu-law compression of one 16-bit sample
pub fn ulaw_compress(sample: i16) -> u8 {
    let absno = if sample < 0 {
        ((!sample) as u16 >> 2) as i16 + 33
    } else {
        (sample >> 2) + 33
    };
    let absno = absno.min(0x1fff);

    let mut i = absno >> 6;
    let mut segno: i16 = 1;
    while i != 0 {
        segno += 1;
        i >>= 1;
    }

    let high = 0x08 - segno;
    let low = 0x0f - ((absno >> segno) & 0x0f);
    let mut code = (high << 4) | low;
    if sample >= 0 {
        code |= 0x0080;
    }

    code as u8
}

/// mu-law expansion to a 16-bit sample
pub fn ulaw_expand(code: u8) -> i16 {
    let sign: i16 = if code < 0x80 { -1 } else { 1 };
    let inv = (!code) as i16;
    let exponent = (inv >> 4) & 0x07;
    let mantissa = inv & 0x0f;
    let step: i16 = 4 << (exponent + 1);

    sign * ((0x80 << exponent) + step * mantissa + step / 2 - 4 * 33)
}
