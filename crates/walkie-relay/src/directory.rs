use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use walkie_types::{ClientInfo, ControlMessage, MessageKind};

/// How long an entry may go without a ping before the sweep evicts it.
pub const STALE_AFTER: Duration = Duration::from_secs(15);

struct Entry {
    name: String,
    last_ping: Instant,
}

/// Stateless peer directory: `addr -> {name, last_ping}`. Carries no
/// identity beyond what `enter`/`ping` advertise, and no authentication.
#[derive(Default)]
pub struct Directory {
    entries: HashMap<SocketAddr, Entry>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    fn clients(&self) -> Vec<ClientInfo> {
        self.entries
            .iter()
            .map(|(addr, e)| ClientInfo {
                name: e.name.clone(),
                addr: *addr,
            })
            .collect()
    }

    /// Applies one inbound control message and returns the reply to send
    /// back to `from`, if any (`leave` replies with an empty ack; malformed
    /// messages produce no reply and are dropped by the caller).
    pub fn handle(&mut self, msg: &ControlMessage, from: SocketAddr, now: Instant) -> ControlMessage {
        match msg.kind {
            MessageKind::Enter => {
                self.entries.insert(
                    from,
                    Entry {
                        name: msg.from.clone(),
                        last_ping: now,
                    },
                );
                let mut reply = ControlMessage::new(MessageKind::Enter, "host", msg.seq);
                reply.youare = Some(from);
                reply.clients = Some(self.clients());
                reply
            }
            MessageKind::Ping => {
                self.entries.insert(
                    from,
                    Entry {
                        name: msg.from.clone(),
                        last_ping: now,
                    },
                );
                let mut reply = ControlMessage::new(MessageKind::Pong, "host", msg.seq);
                reply.clients = Some(self.clients());
                reply
            }
            MessageKind::Leave => {
                self.entries.remove(&from);
                ControlMessage::new(MessageKind::Leave, "host", msg.seq)
            }
            MessageKind::Pong => ControlMessage::new(MessageKind::Pong, "host", msg.seq),
        }
    }

    /// Evicts entries whose last ping is older than [`STALE_AFTER`].
    pub fn prune(&mut self, now: Instant) {
        self.entries
            .retain(|_, e| now.duration_since(e.last_ping) <= STALE_AFTER);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
