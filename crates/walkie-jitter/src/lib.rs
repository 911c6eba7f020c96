//! Per-peer adaptive jitter buffer, sequence-number dedup, FEC framing, and
//! packet-loss concealment for the walkie audio pipeline.

pub mod channel;
pub mod codec;
pub mod dedup;
pub mod error;
pub mod framer;
pub mod signal;

pub use channel::Channel;
pub use codec::AudioDecoder;
#[cfg(feature = "native")]
pub use codec::OpusDecoder;
pub use dedup::DedupFilter;
pub use error::{JitterError, Result};
pub use framer::Framer;
