// Host audio monitoring (--listen): the two audio-range outputs are
// mirrored to the default sound card. A dedicated thread owns the cpal
// stream; the audio domain posts (left, right) volt pairs into an SPSC
// ring and the device callback drains it, holding the last pair between
// engine samples (the engine runs far below any device rate) and playing
// silence-shaped holds on underrun. Purely observational; the kernel
// never depends on this path.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::audio::SAMPLE_RATE;
use crate::fabric::ring::Consumer;
use crate::fabric::state::SharedState;
use crate::slope::scale::VOLT_CLAMP;

/// Spawn the listen thread. Returns the device's actual sample rate.
pub fn spawn_listen_thread(
    rx: Consumer<(f32, f32)>,
    state: Arc<SharedState>,
) -> Result<u32, String> {
    let (result_tx, result_rx) = std::sync::mpsc::sync_channel::<Result<u32, String>>(1);

    thread::Builder::new()
        .name("listen".into())
        .spawn(move || {
            let result = (|| -> Result<(cpal::Stream, u32), String> {
                let host = cpal::default_host();
                let device = host
                    .default_output_device()
                    .ok_or_else(|| "No audio output device found".to_string())?;

                let default_config = device
                    .default_output_config()
                    .map_err(|e| format!("No default output config: {e}"))?;
                let device_rate = default_config.sample_rate().0;
                log::info!(
                    "listen: device '{}' at {device_rate} Hz",
                    device.name().unwrap_or_else(|_| "unknown".into()),
                );

                let config = cpal::StreamConfig {
                    channels: 2,
                    sample_rate: cpal::SampleRate(device_rate),
                    buffer_size: cpal::BufferSize::Default,
                };

                // Repeat each engine sample device_rate/SAMPLE_RATE times
                // with exact remainder carry.
                let mut acc: u32 = 0;
                let mut held: (f32, f32) = (0.0, 0.0);

                let stream = device
                    .build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            for frame in data.chunks_mut(2) {
                                acc += SAMPLE_RATE;
                                if acc >= device_rate {
                                    acc -= device_rate;
                                    if let Some(pair) = rx.get() {
                                        held = pair;
                                    }
                                }
                                frame[0] = (held.0 / VOLT_CLAMP).clamp(-1.0, 1.0);
                                frame[1] = (held.1 / VOLT_CLAMP).clamp(-1.0, 1.0);
                            }
                        },
                        move |err| {
                            log::error!("listen stream error: {err}");
                        },
                        None,
                    )
                    .map_err(|e| format!("build_output_stream failed: {e}"))?;

                stream
                    .play()
                    .map_err(|e| format!("stream.play() failed: {e}"))?;

                Ok((stream, device_rate))
            })();

            match result {
                Ok((stream, rate)) => {
                    let _ = result_tx.send(Ok(rate));
                    // Park: this thread owns the stream.
                    while !state.shutdown.load(Ordering::Relaxed) {
                        thread::park_timeout(std::time::Duration::from_millis(100));
                    }
                    drop(stream);
                    log::info!("listen thread exiting");
                }
                Err(e) => {
                    let _ = result_tx.send(Err(e));
                }
            }
        })
        .map_err(|e| format!("spawn listen thread: {e}"))?;

    result_rx
        .recv()
        .map_err(|_| "Listen thread died before reporting status".to_string())?
}
