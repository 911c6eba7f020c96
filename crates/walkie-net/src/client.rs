use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

use walkie_jitter::Framer;
use walkie_types::{
    is_json_control, ClientInfo, ControlMessage, MessageKind, Packet, PeerIndex, Seq, TempoInfo,
};

use crate::chaos::ChaosSender;
use crate::error::{NetError, Result};

const PING_PERIOD: Duration = Duration::from_secs(1);
const RPC_RETRY_PERIOD: Duration = Duration::from_secs(1);
const RPC_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_BUF_LEN: usize = 2048;

struct Inner {
    name: String,
    sock: Arc<UdpSocket>,
    relay_addr: SocketAddr,
    peers: Mutex<PeerIndex>,
    next_seq: AtomicU32,
    framer: Mutex<Framer>,
    rpc_listeners: Mutex<std::collections::HashMap<Seq, mpsc::UnboundedSender<ControlMessage>>>,
    audio_listeners: Mutex<std::collections::HashMap<String, mpsc::UnboundedSender<Packet>>>,
    closed: AtomicBool,
    chaos: Option<ChaosSender>,
    /// Tempo this client is currently gossiping, piggybacked on every ping.
    tempo: Mutex<Option<TempoInfo>>,
    /// Most recent tempo seen from any peer (including our own echoed back).
    peer_tempo: Mutex<Option<TempoInfo>>,
}

impl Inner {
    fn next_seq(&self) -> Seq {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn offset_time(&self) -> i64 {
        walkie_diagnostics::now_ms() as i64
    }

    async fn send_json(&self, msg: &ControlMessage, dst: SocketAddr) -> Result<()> {
        let bytes = serde_json::to_vec(msg).map_err(|e| NetError::MalformedDatagram(e.to_string()))?;
        self.sock.send_to(&bytes, dst).await?;
        Ok(())
    }

    fn record_peer(&self, msg: &ControlMessage, addr: SocketAddr) {
        if msg.from == "host" || msg.from == self.name {
            return;
        }
        self.peers.lock().unwrap().set_assoc(&msg.from, addr);
    }

    fn absorb_clients(&self, clients: &[ClientInfo]) {
        let mut peers = self.peers.lock().unwrap();
        for c in clients {
            if c.name != self.name {
                peers.set_assoc(&c.name, c.addr);
            }
        }
    }

    /// Keeps only the tempo announcement with the higher `seq`, so a late or
    /// duplicated ping can never roll an already-adopted tempo back.
    fn absorb_tempo(&self, tempo: &TempoInfo) {
        let mut current = self.peer_tempo.lock().unwrap();
        if current.as_ref().map(|t| tempo.seq > t.seq).unwrap_or(true) {
            *current = Some(tempo.clone());
        }
    }

    async fn handle_control(&self, data: &[u8], addr: SocketAddr) {
        let msg: ControlMessage = match serde_json::from_slice(data) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "dropping malformed control datagram");
                return;
            }
        };
        self.record_peer(&msg, addr);
        if let Some(tempo) = &msg.tempo {
            self.absorb_tempo(tempo);
        }

        match msg.kind {
            MessageKind::Ping => {
                let seq = self.next_seq();
                let reply = ControlMessage::pong(
                    self.name.clone(),
                    seq,
                    msg.time.unwrap_or(0),
                    self.offset_time(),
                );
                if let Err(e) = self.send_json(&reply, addr).await {
                    warn!(error = %e, %addr, "failed to reply to ping");
                }
            }
            MessageKind::Pong if msg.from != "host" => {
                if let (Some(ping_time), Some(pong_time)) = (msg.ping_time, msg.time) {
                    let now = self.offset_time();
                    if let Some(peer) = self.peers.lock().unwrap().get_mut(&msg.from) {
                        peer.receive_pong(ping_time, pong_time, now);
                    }
                }
                if let Some(clients) = &msg.clients {
                    self.absorb_clients(clients);
                }
                self.dispatch_rpc(msg);
            }
            _ => {
                if let Some(clients) = &msg.clients {
                    self.absorb_clients(clients);
                }
                self.dispatch_rpc(msg);
            }
        }
    }

    fn dispatch_rpc(&self, msg: ControlMessage) {
        let sender = self.rpc_listeners.lock().unwrap().get(&msg.seq).cloned();
        if let Some(tx) = sender {
            let _ = tx.send(msg);
        }
    }

    fn handle_binary(&self, data: &[u8], addr: SocketAddr) {
        let name = match self.peers.lock().unwrap().name_for(addr).map(str::to_string) {
            Some(n) => n,
            None => return,
        };
        let records = match walkie_jitter::framer::demux(data) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, %addr, "dropping malformed audio datagram");
                return;
            }
        };
        let mut listeners = self.audio_listeners.lock().unwrap();
        if let Some(tx) = listeners.get(&name) {
            for packet in records {
                if tx.send(packet).is_err() {
                    listeners.remove(&name);
                    break;
                }
            }
        }
    }

    fn known_peer_addrs(&self) -> Vec<(String, SocketAddr)> {
        let peers = self.peers.lock().unwrap();
        peers
            .names()
            .filter_map(|name| peers.get_addr(name).map(|addr| (name.to_string(), addr)))
            .collect()
    }
}

/// UDP control/data client: multiplexes the JSON control plane and the
/// binary audio plane on a single socket, runs the read and ping loops, and
/// exposes RPC-with-retry and redundant broadcast.
#[derive(Clone)]
pub struct UdpClient {
    inner: Arc<Inner>,
}

impl UdpClient {
    /// Binds an ephemeral UDP socket and starts the read and ping loops.
    /// When `unreliable` is set, `broadcast` routes through the chaos
    /// harness instead of sending directly.
    pub async fn bind(name: impl Into<String>, relay_addr: SocketAddr, unreliable: bool) -> Result<Self> {
        let sock = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        info!(local_addr = ?sock.local_addr()?, %relay_addr, "udp client bound");

        let chaos = unreliable.then(|| ChaosSender::new(sock.clone()));
        let inner = Arc::new(Inner {
            name: name.into(),
            sock,
            relay_addr,
            peers: Mutex::new(PeerIndex::new()),
            next_seq: AtomicU32::new(0),
            framer: Mutex::new(Framer::new()),
            rpc_listeners: Mutex::new(std::collections::HashMap::new()),
            audio_listeners: Mutex::new(std::collections::HashMap::new()),
            closed: AtomicBool::new(false),
            chaos,
            tempo: Mutex::new(None),
            peer_tempo: Mutex::new(None),
        });

        tokio::spawn(read_loop(inner.clone()));
        tokio::spawn(ping_loop(inner.clone()));

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn known_peers(&self) -> Vec<String> {
        self.inner.peers.lock().unwrap().names().map(String::from).collect()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.sock.local_addr()?)
    }

    /// Starts gossiping `bpm` on every outgoing ping from now on.
    pub fn set_tempo(&self, bpm: u32) {
        let seq = self.inner.next_seq();
        let tempo = TempoInfo {
            bpm,
            start: self.inner.offset_time(),
            owner: self.inner.name.clone(),
            seq,
        };
        self.inner.absorb_tempo(&tempo);
        *self.inner.tempo.lock().unwrap() = Some(tempo);
    }

    /// The tempo currently known to be in effect: whichever of our own
    /// announcement and the latest gossiped one carries the higher `seq`.
    pub fn tempo(&self) -> Option<TempoInfo> {
        self.inner.peer_tempo.lock().unwrap().clone()
    }

    /// Registers interest in demultiplexed audio packets from `peer`; the
    /// caller (typically the mixer) drains the returned receiver.
    pub fn subscribe_audio(&self, peer: impl Into<String>) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .audio_listeners
            .lock()
            .unwrap()
            .insert(peer.into(), tx);
        rx
    }

    pub fn unsubscribe_audio(&self, peer: &str) {
        self.inner.audio_listeners.lock().unwrap().remove(peer);
    }

    /// `enter` RPC against the relay: retries once per second for up to 10 s,
    /// returns the advertised client list on success.
    pub async fn enter(&self) -> Result<Vec<ClientInfo>> {
        let relay_addr = self.inner.relay_addr;
        let reply = self
            .rpc(relay_addr, |seq| ControlMessage::new(MessageKind::Enter, self.inner.name.clone(), seq))
            .await?;
        let clients = reply.clients.unwrap_or_default();
        self.inner.absorb_clients(&clients);
        Ok(clients)
    }

    /// `leave` RPC against the relay.
    pub async fn leave(&self) -> Result<()> {
        let relay_addr = self.inner.relay_addr;
        self.rpc(relay_addr, |seq| ControlMessage::new(MessageKind::Leave, self.inner.name.clone(), seq))
            .await?;
        Ok(())
    }

    /// Sends `msg_for(seq)` to `dst` once per second with a fresh seq until a
    /// reply bearing one of the attempted seqs arrives, or `RPC_TIMEOUT`
    /// elapses.
    async fn rpc(
        &self,
        dst: SocketAddr,
        msg_for: impl Fn(Seq) -> ControlMessage,
    ) -> Result<ControlMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut attempted = Vec::new();
        let mut retry = tokio::time::interval(RPC_RETRY_PERIOD);
        let deadline = tokio::time::sleep(RPC_TIMEOUT);
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                _ = retry.tick() => {
                    let seq = self.inner.next_seq();
                    self.inner.rpc_listeners.lock().unwrap().insert(seq, tx.clone());
                    attempted.push(seq);
                    let msg = msg_for(seq);
                    let span = tracing::info_span!("rpc_attempt", rpc_id = seq, dst = %dst);
                    if let Err(e) = self.inner.send_json(&msg, dst).instrument(span).await {
                        warn!(error = %e, %dst, "rpc send failed");
                    }
                }
                resp = rx.recv() => {
                    if let Some(msg) = resp {
                        break Ok(msg);
                    }
                }
                _ = &mut deadline => {
                    break Err(NetError::RpcTimeout);
                }
            }
        };

        for seq in attempted {
            self.inner.rpc_listeners.lock().unwrap().remove(&seq);
        }
        result
    }

    /// Prepares the redundant broadcast payload and sends one datagram per
    /// known peer (the chaos path, if enabled, may delay/drop/duplicate it).
    pub async fn broadcast(&self, data: Vec<u8>) -> Result<()> {
        let payload = {
            let mut framer = self.inner.framer.lock().unwrap();
            framer.prepare_broadcast(data)
        };
        for (_, addr) in self.inner.known_peer_addrs() {
            match &self.inner.chaos {
                Some(chaos) => chaos.send_unreliably(payload.clone(), addr),
                None => {
                    self.inner.sock.send_to(&payload, addr).await?;
                }
            }
        }
        Ok(())
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

async fn read_loop(inner: Arc<Inner>) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        if inner.closed.load(Ordering::Relaxed) {
            break;
        }
        let (n, addr) = match inner.sock.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "udp recv failed");
                continue;
            }
        };
        let data = &buf[..n];
        if is_json_control(data) {
            inner.handle_control(data, addr).await;
        } else {
            inner.handle_binary(data, addr);
        }
    }
    debug!("udp read loop ended");
}

async fn ping_loop(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(PING_PERIOD);
    loop {
        interval.tick().await;
        if inner.closed.load(Ordering::Relaxed) {
            break;
        }
        let tempo = inner.tempo.lock().unwrap().clone();

        let seq = inner.next_seq();
        let mut ping = ControlMessage::ping(inner.name.clone(), seq, inner.offset_time());
        ping.tempo = tempo.clone();
        if let Err(e) = inner.send_json(&ping, inner.relay_addr).await {
            warn!(error = %e, "ping to relay failed");
        }
        for (_, addr) in inner.known_peer_addrs() {
            let seq = inner.next_seq();
            let mut ping = ControlMessage::ping(inner.name.clone(), seq, inner.offset_time());
            ping.tempo = tempo.clone();
            if let Err(e) = inner.send_json(&ping, addr).await {
                warn!(error = %e, %addr, "ping to peer failed");
            }
        }
    }
    debug!("udp ping loop ended");
}
