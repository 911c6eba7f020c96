use std::net::SocketAddr;

use clap::Parser;

/// Peer-to-peer low-latency voice conferencing client.
#[derive(Parser, Debug)]
#[clap(name = "walkie")]
pub struct Opt {
    /// Name this client advertises to the relay and its peers.
    #[clap(long)]
    pub name: String,

    /// Address of the relay to join.
    #[clap(long)]
    pub relay: SocketAddr,

    /// Start without recording from the microphone.
    #[clap(long)]
    pub silent: bool,

    /// Route outgoing broadcasts through the lossy chaos harness instead of
    /// sending them directly; for exercising the jitter buffer's resilience.
    #[clap(long)]
    pub unreliable: bool,

    /// Input device name for the recorder ("default" for the host default).
    #[clap(long, default_value = "default")]
    pub device: String,

    /// Output device name for the player ("default" for the host default).
    #[clap(long, default_value = "default")]
    pub output_device: String,
}
