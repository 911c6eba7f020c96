use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use opus::{Application, Channels, Encoder};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info};

use walkie_types::{BYTES_PER_FRAME, SAMPLES_PER_FRAME, SAMPLE_RATE_HZ};

use crate::error::{AudioError, Result};

/// Captures microphone input in [`SAMPLES_PER_FRAME`]-sample chunks, encodes
/// each via Opus, and publishes the encoded bytes to one listener. The stop
/// flag is an `Arc<AtomicBool>` sampled once per loop iteration rather than
/// an async cancellation token, matching how the capture thread is driven.
pub struct Recorder {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Starts capturing from `device` ("default" for the host's default
    /// input device), publishing each encoded frame to `tx`.
    pub fn start(&mut self, device: &str, tx: UnboundedSender<Vec<u8>>) -> Result<()> {
        self.stop.store(false, Ordering::Relaxed);
        let stop = self.stop.clone();
        self.handle = Some(spawn_capture(device.to_string(), tx, stop)?);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("recorder thread panicked");
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_capture(
    device_name: String,
    tx: UnboundedSender<Vec<u8>>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let host = cpal::default_host();
    let device = if device_name == "default" {
        host.default_input_device()
    } else {
        host.input_devices()
            .map_err(|e| AudioError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == device_name).unwrap_or(false))
    }
    .ok_or(AudioError::NoInputDevice)?;

    info!(device = %device.name().unwrap_or_default(), "recorder input device selected");

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

    let mut encoder = Encoder::new(SAMPLE_RATE_HZ, Channels::Mono, Application::Voip)
        .map_err(|e| AudioError::Codec(e.to_string()))?;

    let err_fn = |err| error!(error = %err, "audio input stream error");

    std::thread::Builder::new()
        .name("walkie-recorder".into())
        .spawn(move || {
            let stream = match device.build_input_stream(
                &config.into(),
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    for chunk in data.chunks_exact(SAMPLES_PER_FRAME) {
                        match encoder.encode_vec(chunk, BYTES_PER_FRAME) {
                            Ok(encoded) => {
                                let _ = tx.send(encoded);
                            }
                            Err(e) => error!(error = %e, "opus encode failed"),
                        }
                    }
                },
                err_fn,
                None,
            ) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to build input stream");
                    return;
                }
            };

            if let Err(e) = stream.play() {
                error!(error = %e, "failed to start input stream");
                return;
            }

            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(200));
            }
        })
        .map_err(|e| AudioError::Device(e.to_string()))
}
