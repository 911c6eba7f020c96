use opus::{Channels, Decoder as OpusInner};

use walkie_types::{DecodedFrame, SAMPLES_PER_FRAME, SAMPLE_RATE_HZ};

use crate::error::{JitterError, Result};

use super::AudioDecoder;

/// Wrapper around libopus via the `opus` crate, matching
/// `neteq::codec::native_opus::OpusDecoder`'s shape.
pub struct OpusDecoder {
    inner: OpusInner,
}

impl OpusDecoder {
    pub fn new() -> Result<Self> {
        let inner = OpusInner::new(SAMPLE_RATE_HZ, Channels::Mono)
            .map_err(|e| JitterError::Codec(format!("opus init: {e}")))?;
        Ok(Self { inner })
    }

    fn decode_into(&mut self, encoded: &[u8]) -> Result<DecodedFrame> {
        let mut buf = [0i16; SAMPLES_PER_FRAME];
        let samples = self
            .inner
            .decode(encoded, &mut buf, false)
            .map_err(|e| JitterError::Codec(format!("opus decode: {e}")))?;
        if samples != SAMPLES_PER_FRAME {
            return Err(JitterError::Codec(format!(
                "opus returned {samples} samples, expected {SAMPLES_PER_FRAME}"
            )));
        }
        Ok(buf)
    }
}

impl AudioDecoder for OpusDecoder {
    fn decode(&mut self, encoded: &[u8]) -> Result<DecodedFrame> {
        self.decode_into(encoded)
    }

    fn decode_plc(&mut self) -> Result<DecodedFrame> {
        // Feeding libopus an empty packet triggers its built-in PLC.
        self.decode_into(&[])
    }
}
