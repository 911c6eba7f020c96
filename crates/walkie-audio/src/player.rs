use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
#[cfg(feature = "native")]
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use walkie_jitter::Channel;
use walkie_types::{silence_frame, DecodedFrame, SAMPLES_PER_FRAME};

#[cfg(feature = "native")]
use crate::error::{AudioError, Result};

/// Channels idle longer than this are kept alive but excluded from the mix.
const ACTIVE_WINDOW: Duration = Duration::from_secs(5);

/// Audio-callback-driven mixer. Hosts a `peer_name -> Channel` map behind a
/// copy-on-write swap so the hot callback path only ever clones an `Arc`,
/// never blocking behind a directory writer.
pub struct Player {
    channels: Mutex<Arc<HashMap<String, Arc<Channel>>>>,
    muted: AtomicBool,
    #[cfg(feature = "native")]
    playback_stop: Arc<AtomicBool>,
    #[cfg(feature = "native")]
    playback_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Player {
    fn default() -> Self {
        Self::new()
    }
}

impl Player {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(Arc::new(HashMap::new())),
            muted: AtomicBool::new(false),
            #[cfg(feature = "native")]
            playback_stop: Arc::new(AtomicBool::new(false)),
            #[cfg(feature = "native")]
            playback_thread: Mutex::new(None),
        }
    }

    /// Inserts `channel` under `peer`, replacing the whole map so concurrent
    /// readers in the audio callback never see a partially updated one. The
    /// caller keeps its own `Arc<Channel>` clone to feed `enqueue` from the
    /// network read path.
    pub fn add_channel(&self, peer: impl Into<String>, channel: Arc<Channel>) {
        let mut guard = self.channels.lock().unwrap();
        let mut next = (**guard).clone();
        next.insert(peer.into(), channel);
        *guard = Arc::new(next);
    }

    pub fn channel(&self, peer: &str) -> Option<Arc<Channel>> {
        self.channels.lock().unwrap().get(peer).cloned()
    }

    pub fn remove_channel(&self, peer: &str) {
        let mut guard = self.channels.lock().unwrap();
        if guard.contains_key(peer) {
            let mut next = (**guard).clone();
            next.remove(peer);
            *guard = Arc::new(next);
        }
    }

    pub fn peers(&self) -> Vec<String> {
        self.channels.lock().unwrap().keys().cloned().collect()
    }

    /// Toggles the mute flag, returning the new state.
    pub fn toggle_mute(&self) -> bool {
        !self.muted.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Called from the audio callback's hard deadline. Always returns
    /// exactly one 120-sample frame.
    pub fn get_audio(&self) -> DecodedFrame {
        if self.muted.load(Ordering::Relaxed) {
            return silence_frame();
        }

        let channels = self.channels.lock().unwrap().clone();
        let now = Instant::now();
        let active: Vec<DecodedFrame> = channels
            .values()
            .filter(|ch| now.duration_since(ch.last_packet_time()) <= ACTIVE_WINDOW)
            .map(|ch| ch.get_audio())
            .collect();

        match active.as_slice() {
            [] => silence_frame(),
            [only] => *only,
            many => {
                let n = many.len() as i64;
                let mut mixed = [0i16; SAMPLES_PER_FRAME];
                for (i, sample) in mixed.iter_mut().enumerate() {
                    let sum: i64 = many.iter().map(|f| f[i] as i64).sum();
                    *sample = (sum / n).clamp(i16::MIN as i64, i16::MAX as i64) as i16;
                }
                mixed
            }
        }
    }

    /// Opens the host output device and feeds it from `get_audio` on its
    /// callback thread, the symmetric counterpart of `Recorder::start`.
    #[cfg(feature = "native")]
    pub fn start(self: &Arc<Self>, device: &str) -> Result<()> {
        self.playback_stop.store(false, Ordering::Relaxed);
        let stop = self.playback_stop.clone();
        let player = self.clone();
        let handle = spawn_playback(device.to_string(), player, stop)?;
        *self.playback_thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    #[cfg(feature = "native")]
    pub fn is_playing(&self) -> bool {
        self.playback_thread.lock().unwrap().is_some()
    }

    #[cfg(feature = "native")]
    pub fn stop(&self) {
        self.playback_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.playback_thread.lock().unwrap().take() {
            if handle.join().is_err() {
                tracing::error!("player output thread panicked");
            }
        }
    }
}

#[cfg(feature = "native")]
impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "native")]
fn spawn_playback(device_name: String, player: Arc<Player>, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use walkie_types::SAMPLE_RATE_HZ;

    let host = cpal::default_host();
    let device = if device_name == "default" {
        host.default_output_device()
    } else {
        host.output_devices()
            .map_err(|e| AudioError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == device_name).unwrap_or(false))
    }
    .ok_or(AudioError::NoOutputDevice)?;

    tracing::info!(device = %device.name().unwrap_or_default(), "player output device selected");

    let range = cpal::SupportedBufferSize::Range {
        min: SAMPLES_PER_FRAME as u32,
        max: SAMPLES_PER_FRAME as u32,
    };
    let config = cpal::SupportedStreamConfig::new(
        1,
        cpal::SampleRate(SAMPLE_RATE_HZ),
        range,
        cpal::SampleFormat::I16,
    );

    let err_fn = |err| tracing::error!(error = %err, "audio output stream error");

    std::thread::Builder::new()
        .name("walkie-player".into())
        .spawn(move || {
            let stream = match device.build_output_stream(
                &config.into(),
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    for chunk in data.chunks_mut(SAMPLES_PER_FRAME) {
                        let frame = player.get_audio();
                        let n = chunk.len().min(SAMPLES_PER_FRAME);
                        chunk[..n].copy_from_slice(&frame[..n]);
                    }
                },
                err_fn,
                None,
            ) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "failed to build output stream");
                    return;
                }
            };

            if let Err(e) = stream.play() {
                tracing::error!(error = %e, "failed to start output stream");
                return;
            }

            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(200));
            }
        })
        .map_err(|e| AudioError::Device(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use walkie_jitter::error::Result as JitterResult;
    use walkie_jitter::AudioDecoder;

    struct FixedDecoder {
        fill: i16,
    }

    impl AudioDecoder for FixedDecoder {
        fn decode(&mut self, _encoded: &[u8]) -> JitterResult<DecodedFrame> {
            Ok([self.fill; SAMPLES_PER_FRAME])
        }

        fn decode_plc(&mut self) -> JitterResult<DecodedFrame> {
            Ok([self.fill; SAMPLES_PER_FRAME])
        }
    }

    fn channel_with_fill(name: &str, fill: i16) -> Arc<Channel> {
        let ch = Arc::new(Channel::spawn(name, Box::new(FixedDecoder { fill })));
        ch.enqueue(0, vec![fill as u8]);
        for _ in 0..200 {
            if ch.get_audio()[0] == fill {
                return ch;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        ch
    }

    #[test]
    fn no_channels_yields_silence() {
        let player = Player::new();
        assert_eq!(player.get_audio(), silence_frame());
    }

    #[test]
    fn single_active_channel_passes_through_unmixed() {
        let player = Player::new();
        player.add_channel("alice", channel_with_fill("alice", 100));
        // First call above primed the channel; drain one more real pull.
        assert_eq!(player.get_audio()[0], 100);
    }

    #[test]
    fn two_active_channels_mix_to_the_integer_mean() {
        let player = Player::new();
        player.add_channel("alice", channel_with_fill("alice", 100));
        player.add_channel("bob", channel_with_fill("bob", 50));
        assert_eq!(player.get_audio()[0], 75);
    }

    #[test]
    fn mute_short_circuits_to_silence_without_dropping_channels() {
        let player = Player::new();
        player.add_channel("alice", channel_with_fill("alice", 100));
        assert!(player.toggle_mute());
        assert_eq!(player.get_audio(), silence_frame());
        assert_eq!(player.peers().len(), 1);
    }

    #[test]
    fn remove_channel_drops_it_from_the_mix() {
        let player = Player::new();
        player.add_channel("alice", channel_with_fill("alice", 100));
        player.remove_channel("alice");
        assert_eq!(player.peers().len(), 0);
        assert_eq!(player.get_audio(), silence_frame());
    }
}
