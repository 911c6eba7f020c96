//! Audio codec support for the jitter buffer. The decoder is stateful and
//! must be driven in strict monotonic sequence order, including loss-
//! concealment calls.

#[cfg(feature = "native")]
mod native_opus;

#[cfg(feature = "native")]
pub use native_opus::OpusDecoder;

use walkie_types::DecodedFrame;

use crate::error::Result;

/// Trait for the stateful decoder half of an audio codec. Implementations
/// must always return exactly [`walkie_types::SAMPLES_PER_FRAME`] samples.
pub trait AudioDecoder: Send {
    /// Decode one encoded frame.
    fn decode(&mut self, encoded: &[u8]) -> Result<DecodedFrame>;

    /// Packet-loss concealment: the decoder's extrapolation output when fed
    /// no input.
    fn decode_plc(&mut self) -> Result<DecodedFrame>;
}
