use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use walkie_diagnostics::metric;
use walkie_types::{silence_frame, DecodedFrame, Packet, Seq};

use crate::codec::AudioDecoder;
use crate::dedup::DedupFilter;

/// Decay/bump steps for the EWMA estimators driving buffer depth.
const DECAY: f64 = 0.995;
const BUMP: f64 = 0.005;
const GROW_THRESHOLD: f64 = 0.9;
const SHRINK_THRESHOLD: f64 = 0.95;

/// Sentinel for "no frame has been played yet". `last_played` is kept as a
/// signed counter (rather than `Option<Seq>`) because `adjust_buffer`'s grow
/// branch deliberately steps it below the last real sequence number it saw;
/// an unsigned counter would wrap instead of going negative.
const NEVER_PLAYED: i64 = i64::MIN;

#[derive(Debug, Clone, Copy)]
struct Ewma {
    ready_rate: f64,
    ready_next_rate: f64,
    /// Telemetry-only: how often an enqueue survives dedup, decayed on every
    /// call and bumped on acceptance. Not consulted by `adjust_buffer`.
    accept_rate: f64,
}

impl Default for Ewma {
    fn default() -> Self {
        Self {
            ready_rate: 1.0,
            ready_next_rate: 0.0,
            accept_rate: 1.0,
        }
    }
}

/// Decoder-owned state: the last frame seq handed to the audio callback,
/// whether the previous pull was a concealment (so the next real decode
/// must crossfade), and the decoder itself. All three fields change
/// atomically with respect to the strict-ascending decode discipline, so
/// one lock guards them together.
struct DecoderGuard {
    last_played: i64,
    last_missing: bool,
    decoder: Box<dyn AudioDecoder>,
}

impl DecoderGuard {
    fn is_initialized(&self) -> bool {
        self.last_played != NEVER_PLAYED
    }
}

/// The decoded-frame mailbox plus its wake flag, guarded by a single mutex
/// following the standard mutex/condvar/predicate pattern. The decoder
/// thread only treats `pending` as cleared once it has re-observed the
/// predicate under the same lock — skipping that re-check is how these
/// wake-ups lose frames.
#[derive(Default)]
struct WakeState {
    decoded: Option<(Seq, DecodedFrame)>,
    pending: bool,
}

struct Inner {
    name: String,
    heap: Mutex<BinaryHeap<Reverse<Packet>>>,
    decoder_lock: Mutex<DecoderGuard>,
    dedup: Mutex<DedupFilter>,
    ewma: Mutex<Ewma>,
    wake: Mutex<WakeState>,
    wake_cv: Condvar,
    last_packet_time: Mutex<Instant>,
    missing_count: AtomicU64,
    stop: AtomicBool,
}

/// Per-remote-peer adaptive jitter buffer and concealment engine. Owns a
/// dedicated decoder thread that pre-decodes the next frame so the audio
/// callback never blocks on the codec.
pub struct Channel {
    inner: Arc<Inner>,
    decoder_thread: Option<JoinHandle<()>>,
}

impl Channel {
    pub fn spawn(name: impl Into<String>, decoder: Box<dyn AudioDecoder>) -> Self {
        let inner = Arc::new(Inner {
            name: name.into(),
            heap: Mutex::new(BinaryHeap::new()),
            decoder_lock: Mutex::new(DecoderGuard {
                last_played: NEVER_PLAYED,
                last_missing: false,
                decoder,
            }),
            dedup: Mutex::new(DedupFilter::new()),
            ewma: Mutex::new(Ewma::default()),
            wake: Mutex::new(WakeState::default()),
            wake_cv: Condvar::new(),
            last_packet_time: Mutex::new(Instant::now()),
            missing_count: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        });

        let worker_inner = inner.clone();
        let decoder_thread = std::thread::Builder::new()
            .name(format!("walkie-decoder-{}", inner.name))
            .spawn(move || decoder_loop(worker_inner))
            .expect("failed to spawn decoder thread");

        Self {
            inner,
            decoder_thread: Some(decoder_thread),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn last_packet_time(&self) -> Instant {
        *self.inner.last_packet_time.lock().unwrap()
    }

    pub fn missing_count(&self) -> u64 {
        self.inner.missing_count.load(Ordering::Relaxed)
    }

    /// The raw `last_played` counter. `None` before the first frame plays;
    /// afterwards, note it can transiently read below any seq ever enqueued
    /// while the buffer is growing (see `adjust_buffer`).
    pub fn last_played(&self) -> Option<i64> {
        let lp = self.inner.decoder_lock.lock().unwrap().last_played;
        (lp != NEVER_PLAYED).then_some(lp)
    }

    pub fn ready_rate(&self) -> f64 {
        self.inner.ewma.lock().unwrap().ready_rate
    }

    pub fn ready_next_rate(&self) -> f64 {
        self.inner.ewma.lock().unwrap().ready_next_rate
    }

    pub fn accept_rate(&self) -> f64 {
        self.inner.ewma.lock().unwrap().accept_rate
    }

    /// Enqueue a freshly arrived packet for reassembly. The redundancy
    /// framer guarantees each seq is delivered up to 3 times, so every
    /// enqueue is first run through this channel's own `DedupFilter`;
    /// replays are dropped here before they ever reach the heap.
    pub fn enqueue(&self, seq: Seq, data: Vec<u8>) {
        *self.inner.last_packet_time.lock().unwrap() = Instant::now();

        if !self.inner.dedup.lock().unwrap().receive(seq) {
            return;
        }

        {
            let mut e = self.inner.ewma.lock().unwrap();
            e.accept_rate *= DECAY;
        }

        let last_played = self.inner.decoder_lock.lock().unwrap().last_played;
        if last_played == NEVER_PLAYED || (seq as i64) > last_played {
            self.inner.heap.lock().unwrap().push(Reverse(Packet::new(seq, data)));
            {
                let mut e = self.inner.ewma.lock().unwrap();
                e.accept_rate += BUMP;
            }
            self.notify_decoder();
        }
    }

    fn notify_decoder(&self) {
        let mut w = self.inner.wake.lock().unwrap();
        w.pending = true;
        self.inner.wake_cv.notify_one();
    }

    /// Atomically take the pre-decoded frame, clearing it and waking the
    /// decoder thread so it can start preparing the next one.
    fn read_decoded(&self) -> Option<(Seq, DecodedFrame)> {
        let mut w = self.inner.wake.lock().unwrap();
        let taken = w.decoded.take();
        w.pending = true;
        drop(w);
        self.inner.wake_cv.notify_one();
        taken
    }

    /// Called from the audio callback's hard deadline. Always returns
    /// exactly one 120-sample frame.
    pub fn get_audio(&self) -> DecodedFrame {
        {
            let mut e = self.inner.ewma.lock().unwrap();
            e.ready_rate *= DECAY;
        }

        if let Some((seq, frame)) = self.read_decoded() {
            if self.should_play(seq) {
                self.commit_play(seq);
                return frame;
            }
            // Stale: the callback already advanced past this seq while the
            // decode was in flight. Fall through to the re-check below.
        }

        let mut dec = self.inner.decoder_lock.lock().unwrap();
        if let Some((seq, frame)) = self.read_decoded() {
            if should_play_against(dec.last_played, seq) {
                drop(dec);
                self.commit_play(seq);
                return frame;
            }
        }

        if dec.is_initialized() {
            let samples = dec.decoder.decode_plc().unwrap_or_else(|e| {
                tracing::warn!(peer = %self.inner.name, error = %e, "concealment decode failed");
                silence_frame()
            });
            dec.last_missing = true;
            dec.last_played += 1;
            drop(dec);
            // last_played just advanced without going through read_decoded,
            // so the decoder thread needs an explicit nudge to reconsider
            // whatever is sitting in the heap against the new value.
            self.notify_decoder();

            self.inner.missing_count.fetch_add(1, Ordering::Relaxed);
            walkie_diagnostics::publish(
                "jitter",
                Some(self.inner.name.clone()),
                vec![metric!("missing", 1i64)],
            );
            self.adjust_buffer();
            return samples;
        }

        silence_frame()
    }

    fn should_play(&self, seq: Seq) -> bool {
        let last_played = self.inner.decoder_lock.lock().unwrap().last_played;
        should_play_against(last_played, seq)
    }

    fn commit_play(&self, seq: Seq) {
        self.inner.decoder_lock.lock().unwrap().last_played = seq as i64;
        {
            let mut e = self.inner.ewma.lock().unwrap();
            e.ready_rate += BUMP;
        }
        self.adjust_buffer();
        // The decoder thread may already have observed the pre-commit
        // last_played and gone back to sleep before this update landed;
        // nudge it so it reconsiders the heap against the new value.
        self.notify_decoder();
    }

    /// The adaptive-depth heart of the jitter buffer: nudges `last_played`
    /// by one frame based purely on the two EWMA estimators.
    fn adjust_buffer(&self) {
        let mut e = self.inner.ewma.lock().unwrap();
        if e.ready_rate < GROW_THRESHOLD {
            self.inner.decoder_lock.lock().unwrap().last_played -= 1;
            let prior = e.ready_rate;
            e.ready_rate = 1.0;
            e.ready_next_rate = prior;
            drop(e);
            walkie_diagnostics::publish(
                "jitter",
                Some(self.inner.name.clone()),
                vec![metric!("buffer_grow", 1i64)],
            );
        } else if e.ready_next_rate > SHRINK_THRESHOLD {
            self.inner.decoder_lock.lock().unwrap().last_played += 1;
            e.ready_rate = e.ready_next_rate;
            e.ready_next_rate = 0.0;
            drop(e);
            walkie_diagnostics::publish(
                "jitter",
                Some(self.inner.name.clone()),
                vec![metric!("buffer_shrink", 1i64)],
            );
        }
    }

    pub fn shutdown(&mut self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        {
            let mut w = self.inner.wake.lock().unwrap();
            w.pending = true;
        }
        self.inner.wake_cv.notify_one();
        if let Some(handle) = self.decoder_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn should_play_against(last_played: i64, seq: Seq) -> bool {
    last_played == NEVER_PLAYED || seq as i64 == last_played + 1
}

/// Dequeue policy: pop unconditionally while cold, otherwise only pop the
/// immediate successor of `last_played`, bumping `ready_next_rate` when a
/// second consecutive frame is already queued. Guards the post-pop peek
/// against an empty heap.
fn dequeue(inner: &Inner) -> Option<Packet> {
    let last_played = inner.decoder_lock.lock().unwrap().last_played;
    let mut heap = inner.heap.lock().unwrap();

    let popped = if last_played == NEVER_PLAYED {
        heap.pop().map(|Reverse(p)| p)
    } else {
        while let Some(Reverse(top)) = heap.peek() {
            if top.seq as i64 <= last_played {
                heap.pop();
            } else {
                break;
            }
        }
        match heap.peek() {
            Some(Reverse(top)) if top.seq as i64 == last_played + 1 => {
                heap.pop().map(|Reverse(p)| p)
            }
            _ => None,
        }
    };

    let mut bumped = false;
    if let Some(ref p) = popped {
        if let Some(Reverse(next)) = heap.peek() {
            if next.seq == p.seq.wrapping_add(1) {
                bumped = true;
            }
        }
    }
    drop(heap);

    let mut e = inner.ewma.lock().unwrap();
    if bumped {
        e.ready_next_rate += BUMP;
    }
    e.ready_next_rate *= DECAY;
    drop(e);

    popped
}

fn decoder_loop(inner: Arc<Inner>) {
    loop {
        let mut w = inner.wake.lock().unwrap();
        while !w.pending {
            w = inner.wake_cv.wait(w).unwrap();
        }
        w.pending = false;

        if inner.stop.load(Ordering::Relaxed) {
            return;
        }

        if w.decoded.is_some() {
            continue;
        }
        drop(w);

        let Some(packet) = dequeue(&inner) else {
            continue;
        };

        let mut dec = inner.decoder_lock.lock().unwrap();
        if dec.is_initialized() && packet.seq as i64 <= dec.last_played {
            continue;
        }

        let samples = if dec.last_missing {
            let one = dec.decoder.decode_plc().unwrap_or_else(|e| {
                tracing::warn!(peer = %inner.name, error = %e, "plc decode failed");
                silence_frame()
            });
            let two = dec.decoder.decode(&packet.encoded).unwrap_or_else(|e| {
                tracing::warn!(peer = %inner.name, error = %e, "codec decode failed");
                silence_frame()
            });
            dec.last_missing = false;
            crate::signal::crossfade(&one, &two)
        } else {
            dec.decoder.decode(&packet.encoded).unwrap_or_else(|e| {
                tracing::warn!(peer = %inner.name, error = %e, "codec decode failed");
                silence_frame()
            })
        };
        drop(dec);

        let mut w = inner.wake.lock().unwrap();
        w.decoded = Some((packet.seq, samples));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    /// A deterministic stub decoder: "decodes" by reinterpreting the first
    /// byte of the payload as a fill value, and reports a fixed value on
    /// concealment so tests can assert exactly when PLC fired.
    struct StubDecoder {
        plc_value: i16,
    }

    impl AudioDecoder for StubDecoder {
        fn decode(&mut self, encoded: &[u8]) -> Result<DecodedFrame> {
            let fill = encoded.first().copied().unwrap_or(0) as i16;
            Ok([fill; walkie_types::SAMPLES_PER_FRAME])
        }

        fn decode_plc(&mut self) -> Result<DecodedFrame> {
            Ok([self.plc_value; walkie_types::SAMPLES_PER_FRAME])
        }
    }

    fn stub_channel() -> Channel {
        Channel::spawn("peer", Box::new(StubDecoder { plc_value: -1 }))
    }

    impl Channel {
        /// Test-only: true once the decoder thread has a decoded frame
        /// staged and ready for the next `get_audio` call.
        fn has_pending_decoded(&self) -> bool {
            self.inner.wake.lock().unwrap().decoded.is_some()
        }
    }

    fn wait_for<F: Fn() -> bool>(pred: F) {
        for _ in 0..400 {
            if pred() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("condition never became true");
    }

    #[test]
    fn lossless_in_order_stream_plays_every_frame_with_no_concealment() {
        let ch = stub_channel();
        for seq in 0..50u32 {
            ch.enqueue(seq, vec![seq as u8]);
            wait_for(|| ch.has_pending_decoded());
            let frame = ch.get_audio();
            assert_eq!(ch.missing_count(), 0);
            assert_eq!(frame[0] as u32, seq);
        }
    }

    #[test]
    fn reordered_pair_still_plays_in_order() {
        let ch = stub_channel();
        ch.enqueue(0, vec![0]);
        wait_for(|| ch.has_pending_decoded());
        let _ = ch.get_audio();

        ch.enqueue(2, vec![2]);
        ch.enqueue(1, vec![1]);
        wait_for(|| ch.has_pending_decoded());
        let f1 = ch.get_audio();
        assert_eq!(f1[0], 1);

        wait_for(|| ch.has_pending_decoded());
        let f2 = ch.get_audio();
        assert_eq!(f2[0], 2);
        assert_eq!(ch.missing_count(), 0);
    }

    #[test]
    fn gap_triggers_exactly_one_concealment() {
        let ch = stub_channel();
        ch.enqueue(0, vec![0]);
        wait_for(|| ch.has_pending_decoded());
        let _ = ch.get_audio();

        // seq 1 is lost; seq 2 arrives but can't be decoded out of order, so
        // nothing will ever land in the decoded mailbox until we conceal.
        ch.enqueue(2, vec![2]);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!ch.has_pending_decoded());

        let concealed = ch.get_audio();
        assert_eq!(concealed[0], -1);
        assert_eq!(ch.missing_count(), 1);
        assert_eq!(ch.last_played(), Some(1));

        wait_for(|| ch.has_pending_decoded());
        let real = ch.get_audio();
        // The decoder crosses from the PLC fill into the real seq-2 fill, so
        // only the tail of the frame has fully settled on the new value.
        assert_eq!(real[walkie_types::SAMPLES_PER_FRAME - 1], 2);
        assert_eq!(ch.missing_count(), 1);
    }

    #[test]
    fn uninitialized_pull_returns_silence() {
        let ch = stub_channel();
        let frame = ch.get_audio();
        assert_eq!(frame, silence_frame());
    }

    #[test]
    fn duplicate_enqueue_is_filtered_before_reaching_the_heap() {
        let ch = stub_channel();
        ch.enqueue(0, vec![0]);
        wait_for(|| ch.has_pending_decoded());
        assert_eq!(ch.get_audio()[0], 0);

        // The same seq arrives twice more, as the redundancy framer
        // guarantees; dedup must drop both replays before seq 1 ever shows
        // up, so there is nothing to decode yet.
        ch.enqueue(0, vec![0]);
        ch.enqueue(0, vec![0]);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!ch.has_pending_decoded());

        ch.enqueue(1, vec![1]);
        wait_for(|| ch.has_pending_decoded());
        assert_eq!(ch.get_audio()[0], 1);
        assert_eq!(ch.missing_count(), 0);
    }

    #[test]
    fn accept_rate_decays_and_bumps_around_enqueues() {
        let ch = stub_channel();
        assert_eq!(ch.accept_rate(), 1.0);
        ch.enqueue(0, vec![0]);
        // One decay then one bump, net positive since both apply once.
        assert!(ch.accept_rate() > 0.995);

        // A duplicate is dropped by dedup before accept_rate is touched at all.
        let before = ch.accept_rate();
        ch.enqueue(0, vec![0]);
        assert_eq!(ch.accept_rate(), before);
    }

    #[test]
    fn uniform_one_in_twenty_loss_has_bounded_missing_and_no_reordering() {
        let ch = stub_channel();
        let mut played = Vec::new();
        for seq in 0..100u32 {
            if seq % 20 != 19 {
                ch.enqueue(seq, vec![seq as u8]);
            }
            std::thread::sleep(std::time::Duration::from_millis(3));
            played.push(ch.get_audio()[0]);
        }

        // Five of the hundred frames never arrive; concealment should track
        // that closely without ballooning far past it.
        let missing = ch.missing_count();
        assert!((3..=15).contains(&missing), "missing={missing}");

        // Real (non-concealed) fills carry the seq number itself, so the
        // output must never show one going backwards or repeating.
        let mut prev = None;
        for sample in played.into_iter().filter(|&s| s != -1) {
            if let Some(p) = prev {
                assert!(sample as i64 > p, "output reordered or duplicated: {sample} after {p}");
            }
            prev = Some(sample as i64);
        }
    }

    #[test]
    fn bursty_arrival_grows_the_buffer() {
        let ch = stub_channel();
        // A tight burst of 50 frames, consumed as fast as they decode.
        for seq in 0..50u32 {
            ch.enqueue(seq, vec![seq as u8]);
        }
        for _ in 0..50 {
            std::thread::sleep(std::time::Duration::from_millis(1));
            let _ = ch.get_audio();
        }

        // Then silence: every pull conceals, decaying ready_rate until it
        // crosses GROW_THRESHOLD and the buffer grows by one frame.
        for _ in 0..30 {
            let _ = ch.get_audio();
        }

        assert!(ch.missing_count() > 0);
        let next_rate = ch.ready_next_rate();
        assert!(
            next_rate > 0.0 && next_rate < GROW_THRESHOLD,
            "ready_next_rate={next_rate} does not show a grow having occurred"
        );
    }
}
