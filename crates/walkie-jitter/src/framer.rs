use std::collections::VecDeque;

use walkie_types::{Packet, Seq};

use crate::error::{JitterError, Result};

const RECORD_HEADER_LEN: usize = 8; // seq: u32 BE + size: u32 BE
const MAX_REDUNDANT_RECORDS: usize = 3;

/// Packs outgoing frames with forward-error-recovery redundancy: every
/// broadcast datagram carries the current frame plus the two previous ones.
#[derive(Debug, Default)]
pub struct Framer {
    broadcast_seq: Seq,
    recent: VecDeque<Packet>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broadcast_seq(&self) -> Seq {
        self.broadcast_seq
    }

    /// Increments `broadcast_seq`, prepends `(seq, data)`, truncates the
    /// redundancy deque to 3 records, and returns the wire concatenation.
    pub fn prepare_broadcast(&mut self, data: Vec<u8>) -> Vec<u8> {
        self.broadcast_seq += 1;
        self.recent.push_front(Packet::new(self.broadcast_seq, data));
        self.recent.truncate(MAX_REDUNDANT_RECORDS);

        let mut out = Vec::with_capacity(
            self.recent.iter().map(|p| RECORD_HEADER_LEN + p.encoded.len()).sum(),
        );
        for p in &self.recent {
            out.extend_from_slice(&p.seq.to_be_bytes());
            out.extend_from_slice(&(p.encoded.len() as u32).to_be_bytes());
            out.extend_from_slice(&p.encoded);
        }
        out
    }
}

/// Demultiplex an inbound broadcast datagram into its 1..3 `(seq, payload)`
/// records.
pub fn demux(mut data: &[u8]) -> Result<Vec<Packet>> {
    let mut out = Vec::new();
    while !data.is_empty() {
        if data.len() < RECORD_HEADER_LEN {
            return Err(JitterError::MalformedDatagram(
                "truncated record header".into(),
            ));
        }
        let seq = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let size = u32::from_be_bytes(data[4..8].try_into().unwrap()) as usize;
        let body_start = RECORD_HEADER_LEN;
        let body_end = body_start
            .checked_add(size)
            .ok_or_else(|| JitterError::MalformedDatagram("record size overflow".into()))?;
        if data.len() < body_end {
            return Err(JitterError::MalformedDatagram(
                "truncated record payload".into(),
            ));
        }
        out.push(Packet::new(seq, data[body_start..body_end].to_vec()));
        data = &data[body_end..];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_seq_is_strictly_monotonic() {
        let mut f = Framer::new();
        let mut last = 0;
        for _ in 0..10 {
            f.prepare_broadcast(vec![1, 2, 3]);
            assert!(f.broadcast_seq() > last);
            last = f.broadcast_seq();
        }
    }

    #[test]
    fn prepared_datagram_carries_at_most_three_records_descending() {
        let mut f = Framer::new();
        for i in 0..5u8 {
            f.prepare_broadcast(vec![i]);
        }
        let out = f.prepare_broadcast(vec![99]);
        let records = demux(&out).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].seq > records[1].seq);
        assert!(records[1].seq > records[2].seq);
    }

    #[test]
    fn encode_demux_round_trips_exact_tuples() {
        let mut f = Framer::new();
        let wire = f.prepare_broadcast(vec![10, 20, 30]);
        let records = demux(&wire).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].seq, 1);
        assert_eq!(records[0].encoded, vec![10, 20, 30]);
    }

    #[test]
    fn demux_rejects_truncated_datagram() {
        assert!(demux(&[0, 0, 0, 1, 0, 0, 0, 10, 1, 2]).is_err());
    }
}
