// Cross-domain atomic state. This is the one sanctioned pocket of shared
// mutable state: small word-sized cells, each with exactly one writing
// domain, read by the other side under Acquire/Release.
//
// Writer column:  A = audio callback,  C = control loop.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};

pub const NUM_OUTPUTS: usize = 4;
pub const NUM_CV_INPUTS: usize = 2;
pub const NUM_AUDIO_INPUTS: usize = 2;
pub const NUM_PULSE: usize = 2;

/// Pulse-input modes.
pub const PULSE_MODE_OFF: u8 = 0;
pub const PULSE_MODE_CHANGE: u8 = 1;
pub const PULSE_MODE_CLOCK: u8 = 2;

/// All-channel output snapshot protected by a seqlock version counter.
///
/// The audio callback (sole writer) brackets each whole-callback update:
/// version → odd, store all channels, version → even. Readers retry until
/// the two bracketing reads are equal and even.
pub struct OutputSnap {
    version: AtomicU32,
    mv: [AtomicI32; NUM_OUTPUTS],
}

impl OutputSnap {
    fn new() -> Self {
        Self {
            version: AtomicU32::new(0),
            mv: Default::default(),
        }
    }

    /// Writer: audio callback only, once per callback, all channels.
    pub fn publish(&self, mv: [i32; NUM_OUTPUTS]) {
        let v = self.version.load(Ordering::Relaxed);
        self.version.store(v.wrapping_add(1), Ordering::Release);
        for (cell, value) in self.mv.iter().zip(mv) {
            cell.store(value, Ordering::Relaxed);
        }
        self.version.store(v.wrapping_add(2), Ordering::Release);
    }

    /// Consistent all-channel read (retries across in-flight writes).
    pub fn snapshot(&self) -> [i32; NUM_OUTPUTS] {
        loop {
            let before = self.version.load(Ordering::Acquire);
            if before & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let mut out = [0i32; NUM_OUTPUTS];
            for (slot, cell) in out.iter_mut().zip(&self.mv) {
                *slot = cell.load(Ordering::Acquire);
            }
            if self.version.load(Ordering::Acquire) == before {
                return out;
            }
        }
    }

    /// Single-channel advisory read (no snapshot guarantee).
    pub fn get(&self, ch: usize) -> i32 {
        self.mv[ch].load(Ordering::Relaxed)
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }
}

/// Batched `volts` writes from the control domain. The control loop stores
/// all target values, then ORs the channel mask with Release; the audio
/// callback swaps the mask to zero with Acquire and applies every masked
/// channel within a single callback, so an `OutputSnap` snapshot can never
/// see a partial batch.
pub struct ImmediateSet {
    mask: AtomicU8,
    bits: [AtomicU32; NUM_OUTPUTS],
}

impl ImmediateSet {
    fn new() -> Self {
        Self {
            mask: AtomicU8::new(0),
            bits: Default::default(),
        }
    }

    /// Writer: control loop. Publish targets for the masked channels.
    pub fn publish(&self, targets: [Option<f32>; NUM_OUTPUTS]) {
        let mut mask = 0u8;
        for (ch, t) in targets.iter().enumerate() {
            if let Some(v) = t {
                self.bits[ch].store(v.to_bits(), Ordering::Relaxed);
                mask |= 1 << ch;
            }
        }
        if mask != 0 {
            self.mask.fetch_or(mask, Ordering::Release);
        }
    }

    /// Reader: audio callback. Take the whole pending batch, if any.
    pub fn take(&self) -> Option<[Option<f32>; NUM_OUTPUTS]> {
        let mask = self.mask.swap(0, Ordering::Acquire);
        if mask == 0 {
            return None;
        }
        let mut out = [None; NUM_OUTPUTS];
        for (ch, slot) in out.iter_mut().enumerate() {
            if mask & (1 << ch) != 0 {
                *slot = Some(f32::from_bits(self.bits[ch].load(Ordering::Relaxed)));
            }
        }
        Some(out)
    }
}

/// Per-sample noise overlay parameters. Control writes, audio reads.
pub struct NoiseCtl {
    /// Bit n set = channel n outputs noise instead of its slope.
    pub mask: AtomicU8,
    /// Per-channel gain in millivolts of full-scale amplitude.
    pub gain_mv: [AtomicI32; NUM_OUTPUTS],
    /// Reseed request; audio swaps it out when nonzero.
    pub reseed: AtomicU32,
}

/// ISR timing diagnostics. Audio writes, control reads.
pub struct AudioDiag {
    pub overrun_count: AtomicU32,
    pub worst_case_us: AtomicU32,
    /// One-shot warning latch, cleared by the control loop when it has
    /// emitted its diagnostic line.
    pub overrun_warn: AtomicBool,
    /// Slope buffer underruns (last value re-emitted).
    pub slope_underruns: AtomicU32,
}

pub struct SharedState {
    /// A: published after DAC write, every callback.
    pub outputs: OutputSnap,
    /// C → A: batched immediate voltage sets.
    pub immediate: ImmediateSet,
    /// A: raw signed 12-bit ADC per CV input.
    pub input_raw: [AtomicI32; NUM_CV_INPUTS],
    /// A: raw signed 12-bit ADC per audio input.
    pub audio_in_raw: [AtomicI32; NUM_AUDIO_INPUTS],
    /// A: last sampled pulse input level.
    pub pulse_in_level: [AtomicBool; NUM_PULSE],
    /// C: active pulse-input mode (see `PULSE_MODE_*`).
    pub pulse_in_mode: [AtomicU8; NUM_PULSE],
    /// A: edge seen since the control loop last looked (change dispatch).
    pub pulse_change_pending: [AtomicBool; NUM_PULSE],
    /// C: desired pulse output level, applied by the audio callback.
    pub pulse_out_level: [AtomicBool; NUM_PULSE],
    /// C → A: noise overlay.
    pub noise: NoiseCtl,
    /// C: set for the duration of a flash write; the audio domain's
    /// background hook skips whole blocks while it is up.
    pub flash_operation_pending: AtomicBool,
    /// A: global sample counter (event timestamps).
    pub sample_counter: AtomicU64,
    /// A → C: pending ~1.5 kHz timer-service ticks (remainder carry).
    pub timer_ticks_pending: AtomicU32,
    /// A → C: pending ~1 kHz clock-scheduler ticks (remainder carry).
    pub clock_ticks_pending: AtomicU32,
    /// A: timing diagnostics.
    pub diag: AudioDiag,
    /// C: shutdown request observed by the audio runner and link threads.
    pub shutdown: AtomicBool,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            outputs: OutputSnap::new(),
            immediate: ImmediateSet::new(),
            input_raw: Default::default(),
            audio_in_raw: Default::default(),
            pulse_in_level: Default::default(),
            pulse_in_mode: Default::default(),
            pulse_change_pending: Default::default(),
            pulse_out_level: Default::default(),
            noise: NoiseCtl {
                mask: AtomicU8::new(0),
                gain_mv: Default::default(),
                reseed: AtomicU32::new(0),
            },
            flash_operation_pending: AtomicBool::new(false),
            sample_counter: AtomicU64::new(0),
            timer_ticks_pending: AtomicU32::new(0),
            clock_ticks_pending: AtomicU32::new(0),
            diag: AudioDiag {
                overrun_count: AtomicU32::new(0),
                worst_case_us: AtomicU32::new(0),
                overrun_warn: AtomicBool::new(false),
                slope_underruns: AtomicU32::new(0),
            },
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn now(&self) -> u64 {
        self.sample_counter.load(Ordering::Relaxed)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn snapshot_is_never_partial() {
        let snap = Arc::new(OutputSnap::new());
        let writer = {
            let snap = snap.clone();
            std::thread::spawn(move || {
                for i in 0..50_000i32 {
                    // All four channels always carry the same value, so any
                    // mixed snapshot is detectable.
                    snap.publish([i; NUM_OUTPUTS]);
                }
            })
        };
        for _ in 0..50_000 {
            let s = snap.snapshot();
            assert!(s.iter().all(|&v| v == s[0]), "torn snapshot: {s:?}");
        }
        writer.join().unwrap();
    }

    #[test]
    fn snapshot_version_is_monotone() {
        let snap = OutputSnap::new();
        let v0 = snap.version();
        snap.publish([1, 2, 3, 4]);
        assert!(snap.version() > v0);
        assert_eq!(snap.snapshot(), [1, 2, 3, 4]);
    }

    #[test]
    fn immediate_set_is_all_or_nothing() {
        let cell = ImmediateSet::new();
        assert!(cell.take().is_none());
        cell.publish([Some(1.0), None, Some(-2.5), None]);
        let got = cell.take().unwrap();
        assert_eq!(got[0], Some(1.0));
        assert_eq!(got[1], None);
        assert_eq!(got[2], Some(-2.5));
        // Consumed exactly once.
        assert!(cell.take().is_none());
    }
}
