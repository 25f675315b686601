// Hardware bench: the platform contract the kernel runs against, and a
// software bench with test-drivable input lanes.
//
//   - two CV inputs & two audio inputs, signed 12-bit over ±6 V
//   - two pulse inputs, two pulse outputs, with patch-probe "connected"
//   - four outputs: channels 1–2 calibrated in millivolts, 3–4 raw DAC
//   - three knobs (normalized 0.0–1.0), a three-position switch, six LEDs
//   - a stable unique id for serial identification

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

pub const NUM_OUTPUTS: usize = 4;
pub const NUM_CV_INPUTS: usize = 2;
pub const NUM_AUDIO_INPUTS: usize = 2;
pub const NUM_PULSE: usize = 2;
pub const NUM_LEDS: usize = 6;

/// DAC full scale for the audio-range outputs: ±6 V ↔ ±2047.
pub const DAC_FULL_SCALE: f32 = 2047.0;
pub const OUT_VOLT_RANGE: f32 = 6.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Knob {
    Main,
    X,
    Y,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchPos {
    Up,
    Middle,
    Down,
}

/// Platform contract. Audio-domain methods (ADC/DAC/pulse I/O) are called
/// only from the audio callback; the rest only from the control loop.
/// All methods take `&self`: implementations are interior-atomic.
pub trait Bench: Send + Sync {
    // ── Audio domain ─────────────────────────────────────────────────────
    fn read_cv(&self, ch: usize) -> i32;
    fn read_audio_in(&self, ch: usize) -> i32;
    fn read_pulse(&self, ch: usize) -> bool;
    fn write_dac(&self, ch: usize, counts: i16);
    fn write_pulse(&self, ch: usize, level: bool);

    /// Opaque output calibration: volts → DAC counts for one channel.
    fn calibrate(&self, ch: usize, volts: f32) -> i16;

    // ── Normalization probes ─────────────────────────────────────────────
    fn cv_connected(&self, ch: usize) -> bool;
    fn pulse_connected(&self, ch: usize) -> bool;

    // ── Control domain ───────────────────────────────────────────────────
    fn knob(&self, which: Knob) -> f32;
    fn switch_position(&self) -> SwitchPos;
    fn set_led(&self, index: usize, on: bool);
    fn unique_id(&self) -> String;
}

// ─────────────────────────────────────────────────────────────────────────────
//  Software bench
// ─────────────────────────────────────────────────────────────────────────────

/// Emulated hardware. Input lanes are plain atomic cells a test (or the
/// shell) drives; output writes are captured for inspection.
pub struct SimBench {
    cv_raw: [AtomicI32; NUM_CV_INPUTS],
    audio_raw: [AtomicI32; NUM_AUDIO_INPUTS],
    pulse_in: [AtomicBool; NUM_PULSE],
    cv_conn: [AtomicBool; NUM_CV_INPUTS],
    pulse_conn: [AtomicBool; NUM_PULSE],
    dac: [AtomicI32; NUM_OUTPUTS],
    pulse_out: [AtomicBool; NUM_PULSE],
    knobs: [AtomicU32; 3],
    switch_pos: AtomicI32,
    leds: [AtomicBool; NUM_LEDS],
    id: String,
}

impl SimBench {
    pub fn new() -> Self {
        let bench = Self {
            cv_raw: Default::default(),
            audio_raw: Default::default(),
            pulse_in: Default::default(),
            cv_conn: Default::default(),
            pulse_conn: Default::default(),
            dac: Default::default(),
            pulse_out: Default::default(),
            knobs: Default::default(),
            switch_pos: AtomicI32::new(1),
            leds: Default::default(),
            id: "sim-bench".to_string(),
        };
        for c in &bench.cv_conn {
            c.store(true, Ordering::Relaxed);
        }
        for c in &bench.pulse_conn {
            c.store(true, Ordering::Relaxed);
        }
        bench
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let mut b = Self::new();
        b.id = id.into();
        b
    }

    // ── Stimulus side (tests / shell) ────────────────────────────────────

    pub fn drive_cv_volts(&self, ch: usize, volts: f32) {
        let raw = (volts / OUT_VOLT_RANGE * DAC_FULL_SCALE) as i32;
        self.cv_raw[ch].store(raw, Ordering::Relaxed);
    }

    pub fn drive_audio_in(&self, ch: usize, raw: i32) {
        self.audio_raw[ch].store(raw, Ordering::Relaxed);
    }

    pub fn drive_pulse(&self, ch: usize, level: bool) {
        self.pulse_in[ch].store(level, Ordering::Relaxed);
    }

    pub fn patch_cv(&self, ch: usize, connected: bool) {
        self.cv_conn[ch].store(connected, Ordering::Relaxed);
    }

    pub fn patch_pulse(&self, ch: usize, connected: bool) {
        self.pulse_conn[ch].store(connected, Ordering::Relaxed);
    }

    pub fn turn_knob(&self, which: Knob, value: f32) {
        self.knobs[knob_index(which)].store(value.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn flip_switch(&self, pos: SwitchPos) {
        let v = match pos {
            SwitchPos::Up => 0,
            SwitchPos::Middle => 1,
            SwitchPos::Down => 2,
        };
        self.switch_pos.store(v, Ordering::Relaxed);
    }

    // ── Observation side ─────────────────────────────────────────────────

    pub fn dac_counts(&self, ch: usize) -> i32 {
        self.dac[ch].load(Ordering::Relaxed)
    }

    pub fn pulse_out_level(&self, ch: usize) -> bool {
        self.pulse_out[ch].load(Ordering::Relaxed)
    }

    pub fn led(&self, index: usize) -> bool {
        self.leds[index].load(Ordering::Relaxed)
    }
}

impl Default for SimBench {
    fn default() -> Self {
        Self::new()
    }
}

fn knob_index(which: Knob) -> usize {
    match which {
        Knob::Main => 0,
        Knob::X => 1,
        Knob::Y => 2,
    }
}

impl Bench for SimBench {
    fn read_cv(&self, ch: usize) -> i32 {
        self.cv_raw[ch].load(Ordering::Relaxed)
    }

    fn read_audio_in(&self, ch: usize) -> i32 {
        self.audio_raw[ch].load(Ordering::Relaxed)
    }

    fn read_pulse(&self, ch: usize) -> bool {
        self.pulse_in[ch].load(Ordering::Relaxed)
    }

    fn write_dac(&self, ch: usize, counts: i16) {
        self.dac[ch].store(counts as i32, Ordering::Relaxed);
    }

    fn write_pulse(&self, ch: usize, level: bool) {
        self.pulse_out[ch].store(level, Ordering::Relaxed);
    }

    fn calibrate(&self, ch: usize, volts: f32) -> i16 {
        let v = volts.clamp(-OUT_VOLT_RANGE, OUT_VOLT_RANGE);
        if ch < 2 {
            // CV outputs are calibrated in millivolts.
            (v * 1000.0).round() as i16
        } else {
            // Audio outputs are raw DAC counts.
            (v / OUT_VOLT_RANGE * DAC_FULL_SCALE).round() as i16
        }
    }

    fn cv_connected(&self, ch: usize) -> bool {
        self.cv_conn[ch].load(Ordering::Relaxed)
    }

    fn pulse_connected(&self, ch: usize) -> bool {
        self.pulse_conn[ch].load(Ordering::Relaxed)
    }

    fn knob(&self, which: Knob) -> f32 {
        f32::from_bits(self.knobs[knob_index(which)].load(Ordering::Relaxed))
    }

    fn switch_position(&self) -> SwitchPos {
        match self.switch_pos.load(Ordering::Relaxed) {
            0 => SwitchPos::Up,
            2 => SwitchPos::Down,
            _ => SwitchPos::Middle,
        }
    }

    fn set_led(&self, index: usize, on: bool) {
        if index < NUM_LEDS {
            self.leds[index].store(on, Ordering::Relaxed);
        }
    }

    fn unique_id(&self) -> String {
        self.id.clone()
    }
}
