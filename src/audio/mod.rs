// Audio domain: the fixed-rate per-sample callback (C11) and the block
// runner that paces it against an absolute deadline. The callback runs
// to completion every period: no suspension points, no calls into the
// VM, errors only ever set flags.

pub mod listen;
pub mod noise;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bench::Bench;
use crate::detect::{Detector, NUM_DETECTORS};
use crate::fabric::event::{AudioEnds, PulseEdge};
use crate::fabric::ring::Producer;
use crate::fabric::state::{
    SharedState, NUM_AUDIO_INPUTS, NUM_CV_INPUTS, NUM_OUTPUTS, NUM_PULSE, PULSE_MODE_CHANGE,
    PULSE_MODE_CLOCK,
};
use crate::metro::MetroBank;
use crate::slope::SlopeFeed;
use noise::Xorshift;

/// Engine sample rate; the per-callback budget below assumes it.
pub const SAMPLE_RATE: u32 = 8_000;

/// Samples ticked per pacing block.
pub const BLOCK_SAMPLES: usize = 16;

/// Per-callback budget at 8 kHz.
pub const CALLBACK_BUDGET_US: u32 = 125;

use crate::clock::{CLOCK_SERVICE_HZ, TIMER_SERVICE_HZ};

pub struct AudioEngine {
    bench: Arc<dyn Bench>,
    state: Arc<SharedState>,
    detectors: [Arc<Detector>; NUM_DETECTORS],
    metros: Arc<MetroBank>,
    feeds: Vec<SlopeFeed>,
    ends: AudioEnds,
    noise: Xorshift,
    refill_rr: usize,
    timer_acc: u32,
    clock_acc: u32,
    pulse_last: [bool; NUM_PULSE],
}

impl AudioEngine {
    pub fn new(
        bench: Arc<dyn Bench>,
        state: Arc<SharedState>,
        detectors: [Arc<Detector>; NUM_DETECTORS],
        metros: Arc<MetroBank>,
        feeds: Vec<SlopeFeed>,
        ends: AudioEnds,
        noise_seed: u32,
    ) -> Self {
        assert_eq!(feeds.len(), NUM_OUTPUTS);
        Self {
            bench,
            state,
            detectors,
            metros,
            feeds,
            ends,
            noise: Xorshift::new(noise_seed),
            refill_rr: 0,
            timer_acc: 0,
            clock_acc: 0,
            pulse_last: [false; NUM_PULSE],
        }
    }

    /// One sample period, in strict order.
    pub fn tick(&mut self) {
        let state = &self.state;

        // 1. Sample counter, derived service ticks (exact remainder
        //    carry), metro countdowns.
        let now = state.sample_counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.timer_acc += TIMER_SERVICE_HZ;
        if self.timer_acc >= SAMPLE_RATE {
            self.timer_acc -= SAMPLE_RATE;
            state.timer_ticks_pending.fetch_add(1, Ordering::Relaxed);
        }
        self.clock_acc += CLOCK_SERVICE_HZ;
        if self.clock_acc >= SAMPLE_RATE {
            self.clock_acc -= SAMPLE_RATE;
            state.clock_ticks_pending.fetch_add(1, Ordering::Relaxed);
        }
        self.metros.tick(&self.ends.metro_tx);

        // 2. Batched immediate voltage sets land atomically, then each
        //    channel consumes its next pre-rendered slope sample.
        let jam = state.immediate.take();
        let mut volts = [0.0f32; NUM_OUTPUTS];
        for ch in 0..NUM_OUTPUTS {
            if let Some(Some(v)) = jam.as_ref().map(|j| j[ch]) {
                self.feeds[ch].jam(v);
                volts[ch] = v;
                continue;
            }
            let out = self.feeds[ch].consume();
            if out.underrun {
                state.diag.slope_underruns.fetch_add(1, Ordering::Relaxed);
            }
            volts[ch] = out.volts;
        }

        // 3. Round-robin refill request for one channel per callback.
        self.feeds[self.refill_rr].request_refill_if_low();
        self.refill_rr = (self.refill_rr + 1) % NUM_OUTPUTS;

        // 4. CV inputs.
        let mut cv = [0i32; NUM_CV_INPUTS];
        for ch in 0..NUM_CV_INPUTS {
            cv[ch] = self.bench.read_cv(ch);
            state.input_raw[ch].store(cv[ch], Ordering::Relaxed);
        }

        // 5. Audio inputs.
        for ch in 0..NUM_AUDIO_INPUTS {
            state.audio_in_raw[ch].store(self.bench.read_audio_in(ch), Ordering::Relaxed);
        }

        // 6. Detection, integer-only.
        for ch in 0..NUM_DETECTORS {
            self.detectors[ch].process_sample(cv[ch]);
        }

        // 7. Pulse inputs: edge capture per the active mode. Unpatched
        //    inputs are skipped entirely.
        for ch in 0..NUM_PULSE {
            if !self.bench.pulse_connected(ch) {
                continue;
            }
            let level = self.bench.read_pulse(ch);
            if level != self.pulse_last[ch] {
                self.pulse_last[ch] = level;
                state.pulse_in_level[ch].store(level, Ordering::Relaxed);
                match state.pulse_in_mode[ch].load(Ordering::Relaxed) {
                    PULSE_MODE_CHANGE => {
                        state.pulse_change_pending[ch].store(true, Ordering::Release);
                    }
                    PULSE_MODE_CLOCK => {
                        if level {
                            let _ = self.ends.pulse_edge_tx.post(PulseEdge {
                                channel: ch as u8,
                                timestamp: now,
                            });
                        }
                    }
                    _ => {}
                }
            }
        }

        // 8. Noise overlay: one generator sample, per-channel integer
        //    gain, overwrites the slope value.
        let mut mv = [0i32; NUM_OUTPUTS];
        for ch in 0..NUM_OUTPUTS {
            mv[ch] = (volts[ch] * 1000.0) as i32;
        }
        let noise_mask = state.noise.mask.load(Ordering::Relaxed);
        if noise_mask != 0 {
            let reseed = state.noise.reseed.swap(0, Ordering::Relaxed);
            if reseed != 0 {
                self.noise.reseed(reseed);
            }
            let raw = self.noise.next();
            for ch in 0..NUM_OUTPUTS {
                if noise_mask & (1 << ch) != 0 {
                    let gain = state.noise.gain_mv[ch].load(Ordering::Relaxed);
                    let s = (raw >> 16) as i32 - 32768;
                    mv[ch] = s * gain / 32768;
                    volts[ch] = mv[ch] as f32 / 1000.0;
                }
            }
        }

        // DAC + pulse output writes, then the all-channel state publish.
        for ch in 0..NUM_OUTPUTS {
            let counts = self.bench.calibrate(ch, volts[ch]);
            self.bench.write_dac(ch, counts);
        }
        for ch in 0..NUM_PULSE {
            self.bench
                .write_pulse(ch, state.pulse_out_level[ch].load(Ordering::Relaxed));
        }
        state.outputs.publish(mv);
    }

    /// The listen tap, if any, receives the two audio-range outputs.
    fn listen_sample(&self) -> (f32, f32) {
        (self.feeds[2].current(), self.feeds[3].current())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Block runner
// ─────────────────────────────────────────────────────────────────────────────

/// Wait until `deadline` using sleep for bulk + spin for precision.
/// Sleeps most of the duration, then spin-waits the last stretch for
/// sub-millisecond accuracy without burning a core.
fn wait_until(deadline: Instant) {
    let now = Instant::now();
    if now >= deadline {
        return;
    }
    let remaining = deadline - now;
    if remaining > Duration::from_micros(1500) {
        std::thread::sleep(remaining - Duration::from_micros(1000));
    }
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

/// Real-time loop: tick one block, then wait for the absolute deadline.
/// Advancing the deadline by exactly one block period keeps long-run
/// cadence drift-free; after a stall the deadline snaps to now instead
/// of fast-forwarding.
pub fn run(mut engine: AudioEngine, listen_tx: Option<Producer<(f32, f32)>>) {
    let state = engine.state.clone();
    let block_dur = Duration::from_micros(BLOCK_SAMPLES as u64 * 1_000_000 / SAMPLE_RATE as u64);
    let budget_us = BLOCK_SAMPLES as u32 * CALLBACK_BUDGET_US;
    let mut next = Instant::now() + block_dur;

    log::info!(
        "audio domain up: {} Hz, {} samples/block, {} µs budget",
        SAMPLE_RATE,
        BLOCK_SAMPLES,
        budget_us,
    );

    while !state.shutdown.load(Ordering::Relaxed) {
        // Flash writes quiesce the audio domain: skip whole blocks while
        // the flag is up, but keep pacing.
        if !state.flash_operation_pending.load(Ordering::Acquire) {
            let started = Instant::now();
            for _ in 0..BLOCK_SAMPLES {
                engine.tick();
                if let Some(ref tx) = listen_tx {
                    let _ = tx.post(engine.listen_sample());
                }
            }
            let elapsed_us = started.elapsed().as_micros() as u32;
            let per_call = elapsed_us / BLOCK_SAMPLES as u32;
            if per_call > state.diag.worst_case_us.load(Ordering::Relaxed) {
                state.diag.worst_case_us.store(per_call, Ordering::Relaxed);
            }
            if elapsed_us >= budget_us {
                state.diag.overrun_count.fetch_add(1, Ordering::Relaxed);
                state.diag.overrun_warn.store(true, Ordering::Release);
            }
        }

        next += block_dur;
        let now = Instant::now();
        if next < now {
            next = now;
        }
        wait_until(next);
    }
    log::info!("audio domain exiting");
}
