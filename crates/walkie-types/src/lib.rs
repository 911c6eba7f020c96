//! Shared wire types, peer directory, and control-plane messages for the
//! walkie peer-to-peer voice conferencing transport.

pub mod control;
pub mod error;
pub mod frame;
pub mod peer;

pub use control::{is_json_control, ClientInfo, ControlMessage, MessageKind, TempoInfo};
pub use error::{Result, WalkieError};
pub use frame::{
    silence_frame, DecodedFrame, Packet, Seq, BYTES_PER_FRAME, SAMPLES_PER_FRAME, SAMPLE_RATE_HZ,
};
pub use peer::{Peer, PeerIndex};
