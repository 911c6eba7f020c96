mod cli_args;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::level_filters::LevelFilter;

use walkie_audio::Player;
#[cfg(feature = "native")]
use walkie_jitter::{Channel, OpusDecoder};
use walkie_net::UdpClient;

use cli_args::Opt;

/// How often the REPL checks for peers the discovery loop hasn't wired yet.
const DISCOVERY_PERIOD: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .finish(),
    )
    .expect("failed to install global tracing subscriber");

    let opt = Opt::parse();
    let net = UdpClient::bind(opt.name.clone(), opt.relay, opt.unreliable)
        .await
        .expect("failed to bind udp client");
    let player = Arc::new(Player::new());
    start_playback(&player, &opt.output_device);

    let clients = net.enter().await.expect("enter handshake with relay failed");
    tracing::info!(count = clients.len(), "joined relay");
    for client in &clients {
        if client.name != opt.name {
            wire_peer(&net, &player, client.name.clone());
        }
    }

    tokio::spawn(discovery_loop(net.clone(), player.clone(), opt.name.clone()));

    let mut recorder = if opt.silent {
        None
    } else {
        Some(start_recording(&net, &opt.device))
    };

    repl(net, player, &mut recorder, opt.device).await;
}

/// Creates a fresh jitter-buffer `Channel` for `peer`, registers it with the
/// mixer, and spawns a task forwarding demultiplexed audio into it.
#[cfg(feature = "native")]
fn wire_peer(net: &UdpClient, player: &Arc<Player>, peer: String) {
    if player.channel(&peer).is_some() {
        return;
    }
    let decoder = match OpusDecoder::new() {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(%peer, error = %e, "failed to create opus decoder, skipping peer");
            return;
        }
    };
    let channel = Arc::new(Channel::spawn(peer.clone(), Box::new(decoder)));
    player.add_channel(peer.clone(), channel.clone());

    let mut audio_rx = net.subscribe_audio(peer.clone());
    tokio::spawn(async move {
        while let Some(packet) = audio_rx.recv().await {
            channel.enqueue(packet.seq, packet.encoded);
        }
    });

    tracing::info!(%peer, "wired new peer");
}

/// Built without opus support: peers stay silent, but the relay connection,
/// tempo gossip and REPL still work.
#[cfg(not(feature = "native"))]
fn wire_peer(_net: &UdpClient, _player: &Arc<Player>, peer: String) {
    tracing::warn!(%peer, "built without the native feature; peer audio is unavailable");
}

/// Opens the output device and starts rendering the mixed peer audio,
/// the symmetric counterpart of `start_recording`.
#[cfg(feature = "native")]
fn start_playback(player: &Arc<Player>, device: &str) {
    if let Err(e) = player.start(device) {
        tracing::error!(error = %e, "failed to start playback");
    }
}

#[cfg(not(feature = "native"))]
fn start_playback(_player: &Arc<Player>, _device: &str) {
    tracing::warn!("built without the native feature; playback is unavailable");
}

/// Periodically notices peers the relay/ping gossip has discovered that
/// don't have a channel wired yet.
async fn discovery_loop(net: UdpClient, player: Arc<Player>, own_name: String) {
    let mut interval = tokio::time::interval(DISCOVERY_PERIOD);
    loop {
        interval.tick().await;
        for peer in net.known_peers() {
            if peer != own_name {
                wire_peer(&net, &player, peer);
            }
        }
    }
}

#[cfg(feature = "native")]
type Recorder = walkie_audio::Recorder;

/// Stands in for `walkie_audio::Recorder` in builds without microphone
/// support, so the REPL's record/mute command plumbing doesn't need its own
/// `cfg` branches.
#[cfg(not(feature = "native"))]
struct Recorder;

#[cfg(not(feature = "native"))]
impl Recorder {
    fn stop(&mut self) {}
}

#[cfg(feature = "native")]
fn start_recording(net: &UdpClient, device: &str) -> Recorder {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut recorder = Recorder::new();
    if let Err(e) = recorder.start(device, tx) {
        tracing::error!(error = %e, "failed to start recorder");
    }

    let net = net.clone();
    tokio::spawn(async move {
        while let Some(encoded) = rx.recv().await {
            if let Err(e) = net.broadcast(encoded).await {
                tracing::warn!(error = %e, "failed to broadcast recorded frame");
            }
        }
    });

    recorder
}

#[cfg(not(feature = "native"))]
fn start_recording(_net: &UdpClient, _device: &str) -> Recorder {
    tracing::warn!("built without the native feature; microphone recording is unavailable");
    Recorder
}

async fn repl(net: UdpClient, player: Arc<Player>, recorder: &mut Option<Recorder>, device: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("walkie> commands: record, mute, tempo <bpm>, log, quit");

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("record") => toggle_record(&net, recorder, &device),
            Some("mute") => {
                let muted = player.toggle_mute();
                println!("muted: {muted}");
            }
            Some("tempo") => match parts.next().and_then(|s| s.parse::<u32>().ok()) {
                Some(bpm) => {
                    net.set_tempo(bpm);
                    println!("tempo set to {bpm} bpm");
                }
                None => println!("usage: tempo <bpm>"),
            },
            Some("log") => print_status(&net, &player),
            Some("quit") | Some("exit") => {
                if let Err(e) = net.leave().await {
                    tracing::warn!(error = %e, "leave failed");
                }
                net.close();
                break;
            }
            Some(other) => println!("unknown command: {other}"),
            None => {}
        }
    }
}

fn toggle_record(net: &UdpClient, recorder: &mut Option<Recorder>, device: &str) {
    match recorder {
        Some(r) => {
            r.stop();
            *recorder = None;
            println!("recording stopped");
        }
        None => {
            *recorder = Some(start_recording(net, device));
            println!("recording started");
        }
    }
}

fn print_status(net: &UdpClient, player: &Player) {
    println!("peers: {:?}", net.known_peers());
    if let Some(tempo) = net.tempo() {
        println!("tempo: {} bpm (owner {})", tempo.bpm, tempo.owner);
    } else {
        println!("tempo: none");
    }
    for peer in player.peers() {
        if let Some(channel) = player.channel(&peer) {
            println!("  {peer}: missing={}", channel.missing_count());
        }
    }
}
