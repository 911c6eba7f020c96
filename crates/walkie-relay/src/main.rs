mod directory;

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::UdpSocket;
use tracing::level_filters::LevelFilter;
use walkie_types::is_json_control;

use directory::Directory;

const PRUNE_PERIOD: Duration = Duration::from_secs(5);
const RECV_BUF_LEN: usize = 2048;

/// Stateless UDP peer directory for walkie clients.
#[derive(Parser, Debug)]
#[clap(name = "walkie-relay")]
struct Opt {
    /// UDP port to listen on.
    #[clap(long, default_value_t = 5005)]
    port: u16,
}

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
    let addr: SocketAddr = ([0, 0, 0, 0], opt.port).into();
    let sock = UdpSocket::bind(addr).await.expect("failed to bind relay socket");
    tracing::info!(%addr, "walkie-relay listening");

    let directory = Mutex::new(Directory::new());

    tokio::join!(read_loop(&sock, &directory), prune_loop(&directory));
}

async fn read_loop(sock: &UdpSocket, directory: &Mutex<Directory>) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        let (n, from) = match sock.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "relay recv failed");
                continue;
            }
        };
        let data = &buf[..n];
        if !is_json_control(data) {
            tracing::debug!(%from, "dropping non-control datagram");
            continue;
        }
        let msg = match serde_json::from_slice(data) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, %from, "dropping malformed control datagram");
                continue;
            }
        };
        let reply = directory.lock().unwrap().handle(&msg, from, Instant::now());
        let bytes = match serde_json::to_vec(&reply) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode reply");
                continue;
            }
        };
        if let Err(e) = sock.send_to(&bytes, from).await {
            tracing::warn!(error = %e, %from, "relay send failed");
        }
    }
}

async fn prune_loop(directory: &Mutex<Directory>) {
    let mut interval = tokio::time::interval(PRUNE_PERIOD);
    loop {
        interval.tick().await;
        let mut dir = directory.lock().unwrap();
        let before = dir.len();
        dir.prune(Instant::now());
        let evicted = before - dir.len();
        if evicted > 0 {
            tracing::info!(evicted, remaining = dir.len(), "pruned stale directory entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use walkie_types::{ControlMessage, MessageKind};

    #[tokio::test]
    async fn enter_ping_leave_round_trip_over_the_wire() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = sock.local_addr().unwrap();
        let directory = Mutex::new(Directory::new());
        tokio::spawn(async move {
            read_loop(&sock, &directory).await;
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = vec![0u8; 2048];

        let enter = ControlMessage::new(MessageKind::Enter, "alice", 1);
        client.send_to(&serde_json::to_vec(&enter).unwrap(), relay_addr).await.unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        let reply: ControlMessage = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(reply.from, "host");
        assert_eq!(reply.seq, 1);
        assert_eq!(reply.clients.unwrap().len(), 1);

        let ping = ControlMessage::ping("alice", 2, 0);
        client.send_to(&serde_json::to_vec(&ping).unwrap(), relay_addr).await.unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        let reply: ControlMessage = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(reply.kind, MessageKind::Pong);
        assert_eq!(reply.seq, 2);

        let leave = ControlMessage::leave("alice", 3);
        client.send_to(&serde_json::to_vec(&leave).unwrap(), relay_addr).await.unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        let reply: ControlMessage = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(reply.seq, 3);
    }
}
