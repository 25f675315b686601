// Input detection engine, split across the two domains.
//
// The audio callback runs `Detector::process_sample`: integer compares
// and counters only, a few operations per channel. The control loop runs
// `DetectorBank::poll`, which clears the changed flags, converts raw ADC
// counts to volts, performs the mode-specific floating-point derivation
// (window search, scale lookup, Hz conversion) and posts events to the
// detection queue.
//
// Mode switches follow the bracketing protocol: raise `mode_switching`,
// fence, install integer parameters, clear pending state, fence, lower
// the flag. The audio side returns early whenever the flag is up.

use std::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};

use crate::fabric::event::{DetectEvent, DetectKind};
use crate::fabric::ring::Producer;
use crate::slope::scale::ScaleMap;

pub const NUM_DETECTORS: usize = 2;

/// Raw ADC full scale: signed 12-bit over ±6 V.
pub const ADC_FULL_SCALE: i32 = 2047;
pub const ADC_VOLT_RANGE: f32 = 6.0;

/// Denoise policy shared by the stream-equivalent input view and stream
/// mode emission: a sample is significant when it moved more than 10 mV
/// or 5 ms have elapsed. One definition site, used by both paths.
pub const DENOISE_MV: f32 = 10.0;
pub const DENOISE_MS: u32 = 5;

/// Fixed integer hysteresis for the frequency mode's zero-cross counter.
const ZERO_CROSS_HYST_RAW: i32 = 16;

pub fn volts_to_raw(v: f32) -> i32 {
    ((v / ADC_VOLT_RANGE) * ADC_FULL_SCALE as f32).round() as i32
}

pub fn raw_to_volts(raw: i32) -> f32 {
    raw as f32 * ADC_VOLT_RANGE / ADC_FULL_SCALE as f32
}

// ─────────────────────────────────────────────────────────────────────────────
//  Mode tags & direction filter
// ─────────────────────────────────────────────────────────────────────────────

mod tag {
    pub const NONE: u8 = 0;
    pub const STREAM: u8 = 1;
    pub const CHANGE: u8 = 2;
    pub const WINDOW: u8 = 3;
    pub const SCALE: u8 = 4;
    pub const VOLUME: u8 = 5;
    pub const PEAK: u8 = 6;
    pub const FREQUENCY: u8 = 7;
    pub const CLOCK: u8 = 8;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Rising,
    Falling,
    Both,
}

impl Direction {
    pub fn from_name(name: &str) -> Option<Direction> {
        match name {
            "rising" => Some(Direction::Rising),
            "falling" => Some(Direction::Falling),
            "both" => Some(Direction::Both),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Direction::Rising => 0,
            Direction::Falling => 1,
            Direction::Both => 2,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Audio-domain detector cell
// ─────────────────────────────────────────────────────────────────────────────

/// Per-channel detector state, shared as word-sized atomic cells. The
/// audio callback owns the ISR fields; the control loop owns the
/// parameters and only touches them inside the mode-switch bracket.
pub struct Detector {
    mode_switching: AtomicBool,
    mode: AtomicU8,

    // Parameters, pre-converted to ADC counts at mode-set time.
    threshold_raw: AtomicI32,
    hysteresis_raw: AtomicI32,
    direction: AtomicU8,
    block_interval: AtomicU32,

    // ISR state.
    last_raw: AtomicI32,
    sample_counter: AtomicU32,
    state_changed: AtomicBool,
    event_raw: AtomicI32,
    /// Second published word (crossing direction, envelope, cross count).
    event_aux: AtomicI32,
    /// Last value published for window/scale movement tracking.
    published_raw: AtomicI32,
    latched_high: AtomicBool,
    env_acc: AtomicI32,
    cross_count: AtomicU32,

    // Clock mode: edges counted for the clock engine.
    clock_edges: AtomicU32,
    clock_edge_pending: AtomicBool,
}

impl Detector {
    pub fn new() -> Self {
        Self {
            mode_switching: AtomicBool::new(false),
            mode: AtomicU8::new(tag::NONE),
            threshold_raw: AtomicI32::new(0),
            hysteresis_raw: AtomicI32::new(0),
            direction: AtomicU8::new(Direction::Both.as_u8()),
            block_interval: AtomicU32::new(0),
            last_raw: AtomicI32::new(0),
            sample_counter: AtomicU32::new(0),
            state_changed: AtomicBool::new(false),
            event_raw: AtomicI32::new(0),
            event_aux: AtomicI32::new(0),
            published_raw: AtomicI32::new(0),
            latched_high: AtomicBool::new(false),
            env_acc: AtomicI32::new(0),
            cross_count: AtomicU32::new(0),
            clock_edges: AtomicU32::new(0),
            clock_edge_pending: AtomicBool::new(false),
        }
    }

    /// Audio-domain entry point. Integer operations only.
    pub fn process_sample(&self, raw: i32) {
        if self.mode_switching.load(Ordering::Acquire) {
            return;
        }
        match self.mode.load(Ordering::Relaxed) {
            tag::STREAM => {
                let n = self.sample_counter.load(Ordering::Relaxed) + 1;
                if n >= self.block_interval.load(Ordering::Relaxed) {
                    self.sample_counter.store(0, Ordering::Relaxed);
                    self.event_raw.store(raw, Ordering::Relaxed);
                    self.state_changed.store(true, Ordering::Release);
                } else {
                    self.sample_counter.store(n, Ordering::Relaxed);
                }
            }
            tag::CHANGE => self.change_sample(raw, true),
            tag::WINDOW | tag::SCALE => {
                let h = self.hysteresis_raw.load(Ordering::Relaxed);
                let moved = raw - self.published_raw.load(Ordering::Relaxed);
                if moved > h || moved < -h {
                    self.published_raw.store(raw, Ordering::Relaxed);
                    self.event_raw.store(raw, Ordering::Relaxed);
                    self.state_changed.store(true, Ordering::Release);
                }
            }
            tag::VOLUME | tag::PEAK => {
                let mag = raw.abs();
                if mag > self.env_acc.load(Ordering::Relaxed) {
                    self.env_acc.store(mag, Ordering::Relaxed);
                }
                let n = self.sample_counter.load(Ordering::Relaxed) + 1;
                if n >= self.block_interval.load(Ordering::Relaxed) {
                    self.sample_counter.store(0, Ordering::Relaxed);
                    self.event_raw
                        .store(self.env_acc.load(Ordering::Relaxed), Ordering::Relaxed);
                    self.env_acc.store(0, Ordering::Relaxed);
                    self.state_changed.store(true, Ordering::Release);
                } else {
                    self.sample_counter.store(n, Ordering::Relaxed);
                }
            }
            tag::FREQUENCY => {
                let high = self.latched_high.load(Ordering::Relaxed);
                if !high && raw > ZERO_CROSS_HYST_RAW {
                    self.latched_high.store(true, Ordering::Relaxed);
                    self.cross_count.fetch_add(1, Ordering::Relaxed);
                } else if high && raw < -ZERO_CROSS_HYST_RAW {
                    self.latched_high.store(false, Ordering::Relaxed);
                }
                let n = self.sample_counter.load(Ordering::Relaxed) + 1;
                if n >= self.block_interval.load(Ordering::Relaxed) {
                    self.sample_counter.store(0, Ordering::Relaxed);
                    self.event_raw
                        .store(self.cross_count.swap(0, Ordering::Relaxed) as i32, Ordering::Relaxed);
                    self.state_changed.store(true, Ordering::Release);
                } else {
                    self.sample_counter.store(n, Ordering::Relaxed);
                }
            }
            tag::CLOCK => self.change_sample(raw, false),
            _ => {}
        }
        self.last_raw.store(raw, Ordering::Relaxed);
    }

    /// Threshold crossing with hysteresis. `publish` selects between the
    /// change-event path and the clock-edge path.
    fn change_sample(&self, raw: i32, publish: bool) {
        let t = self.threshold_raw.load(Ordering::Relaxed);
        let h = self.hysteresis_raw.load(Ordering::Relaxed);
        let high = self.latched_high.load(Ordering::Relaxed);
        if !high && raw >= t + h {
            self.latched_high.store(true, Ordering::Relaxed);
            if publish {
                let dir = self.direction.load(Ordering::Relaxed);
                if dir != Direction::Falling.as_u8() {
                    self.event_raw.store(raw, Ordering::Relaxed);
                    self.event_aux.store(1, Ordering::Relaxed);
                    self.state_changed.store(true, Ordering::Release);
                }
            } else {
                self.clock_edges.fetch_add(1, Ordering::Relaxed);
                self.clock_edge_pending.store(true, Ordering::Release);
            }
        } else if high && raw <= t - h {
            self.latched_high.store(false, Ordering::Relaxed);
            if publish {
                let dir = self.direction.load(Ordering::Relaxed);
                if dir != Direction::Rising.as_u8() {
                    self.event_raw.store(raw, Ordering::Relaxed);
                    self.event_aux.store(-1, Ordering::Relaxed);
                    self.state_changed.store(true, Ordering::Release);
                }
            }
        }
    }

    pub fn last_raw(&self) -> i32 {
        self.last_raw.load(Ordering::Relaxed)
    }

    fn install(&self, mode: u8, threshold: i32, hysteresis: i32, dir: u8, block: u32) {
        self.mode_switching.store(true, Ordering::Release);
        fence(Ordering::SeqCst);
        self.mode.store(mode, Ordering::Relaxed);
        self.threshold_raw.store(threshold, Ordering::Relaxed);
        self.hysteresis_raw.store(hysteresis.max(1), Ordering::Relaxed);
        self.direction.store(dir, Ordering::Relaxed);
        self.block_interval.store(block.max(1), Ordering::Relaxed);
        self.sample_counter.store(0, Ordering::Relaxed);
        self.state_changed.store(false, Ordering::Relaxed);
        let last = self.last_raw.load(Ordering::Relaxed);
        self.published_raw.store(last, Ordering::Relaxed);
        // Arm the crossing latch at the current level so installing (or
        // re-installing) a mode never fires from a level that was already
        // past the threshold.
        let armed_high = (mode == tag::CHANGE || mode == tag::CLOCK) && last >= threshold;
        self.latched_high.store(armed_high, Ordering::Relaxed);
        self.env_acc.store(0, Ordering::Relaxed);
        self.cross_count.store(0, Ordering::Relaxed);
        self.clock_edge_pending.store(false, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.mode_switching.store(false, Ordering::Release);
    }

    /// Clock-mode edges accumulated since the last call.
    pub fn take_clock_edges(&self) -> u32 {
        if self.clock_edge_pending.swap(false, Ordering::Acquire) {
            self.clock_edges.swap(0, Ordering::Relaxed)
        } else {
            0
        }
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Control-domain configuration & derivation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum ModeSpec {
    None,
    Stream { interval_s: f32 },
    Change { threshold: f32, hysteresis: f32, direction: Direction },
    Window { bounds: Vec<f32>, hysteresis: f32 },
    Scale { map: ScaleMap },
    Volume { interval_s: f32 },
    Peak { threshold: f32, hysteresis: f32 },
    Frequency { interval_s: f32 },
    Clock { threshold: f32 },
}

struct ChannelCtl {
    user_mode: ModeSpec,
    connected: bool,
    window_bounds: Vec<f32>,
    window_hyst: f32,
    latched_window: usize,
    scale_map: Option<ScaleMap>,
    latched_degree: i32,
    latched_octave: i32,
    peak_threshold: f32,
    peak_hyst: f32,
    peak_latched: bool,
    block_s: f32,
    // Stream-equivalent denoised view (`input[n].volts`).
    view_volts: f32,
    view_stamp: u64,
    stream_volts: f32,
    stream_stamp: u64,
}

impl ChannelCtl {
    fn new() -> Self {
        Self {
            user_mode: ModeSpec::None,
            connected: true,
            window_bounds: Vec::new(),
            window_hyst: 0.0,
            latched_window: 0,
            scale_map: None,
            latched_degree: -1,
            latched_octave: 0,
            peak_threshold: 0.0,
            peak_hyst: 0.0,
            peak_latched: false,
            block_s: 0.0,
            view_volts: 0.0,
            view_stamp: 0,
            stream_volts: f32::MAX,
            stream_stamp: 0,
        }
    }
}

pub struct DetectorBank {
    cells: [std::sync::Arc<Detector>; NUM_DETECTORS],
    ctl: [ChannelCtl; NUM_DETECTORS],
    sample_rate: u32,
}

impl DetectorBank {
    pub fn new(cells: [std::sync::Arc<Detector>; NUM_DETECTORS], sample_rate: u32) -> Self {
        Self {
            cells,
            ctl: [ChannelCtl::new(), ChannelCtl::new()],
            sample_rate,
        }
    }

    /// Configure a channel. Volts are converted to ADC counts exactly
    /// once, here. A disconnected channel is coerced to the effective
    /// mode None regardless of the requested mode.
    pub fn set_mode(&mut self, ch: usize, spec: ModeSpec) {
        self.ctl[ch].user_mode = spec.clone();
        self.apply_effective(ch);
    }

    /// Normalization-probe update from the bench.
    pub fn set_connected(&mut self, ch: usize, connected: bool) {
        if self.ctl[ch].connected != connected {
            self.ctl[ch].connected = connected;
            self.apply_effective(ch);
        }
    }

    fn apply_effective(&mut self, ch: usize) {
        let rate = self.sample_rate;
        let ctl = &mut self.ctl[ch];
        let cell = &self.cells[ch];
        let spec = if ctl.connected {
            ctl.user_mode.clone()
        } else {
            ModeSpec::None
        };
        let interval_to_block = |s: f32| ((s * rate as f32).round() as u32).max(1);
        match spec {
            ModeSpec::None => cell.install(tag::NONE, 0, 0, 0, 1),
            ModeSpec::Stream { interval_s } => {
                ctl.block_s = interval_s.max(1.0 / rate as f32);
                ctl.stream_volts = f32::MAX;
                cell.install(tag::STREAM, 0, 0, 0, interval_to_block(interval_s))
            }
            ModeSpec::Change {
                threshold,
                hysteresis,
                direction,
            } => cell.install(
                tag::CHANGE,
                volts_to_raw(threshold),
                volts_to_raw(hysteresis.abs()),
                direction.as_u8(),
                1,
            ),
            ModeSpec::Window { mut bounds, hysteresis } => {
                // Script-supplied bounds; non-finite entries are dropped.
                bounds.retain(|b| b.is_finite());
                bounds.sort_by(|a, b| a.total_cmp(b));
                ctl.window_hyst = hysteresis.abs();
                ctl.latched_window = 0;
                let hyst_raw = volts_to_raw(hysteresis.abs()).max(1);
                ctl.window_bounds = bounds;
                cell.install(tag::WINDOW, 0, hyst_raw, 0, 1)
            }
            ModeSpec::Scale { map } => {
                ctl.scale_map = Some(map);
                ctl.latched_degree = -1;
                ctl.latched_octave = 0;
                // Half a semitone of movement before the control side
                // re-derives the degree.
                let hyst_raw = volts_to_raw(map.scaling() / 24.0).max(1);
                cell.install(tag::SCALE, 0, hyst_raw, 0, 1)
            }
            ModeSpec::Volume { interval_s } => {
                ctl.block_s = interval_s.max(1.0 / rate as f32);
                cell.install(tag::VOLUME, 0, 0, 0, interval_to_block(interval_s))
            }
            ModeSpec::Peak { threshold, hysteresis } => {
                ctl.peak_threshold = threshold;
                ctl.peak_hyst = hysteresis.abs();
                ctl.peak_latched = false;
                ctl.block_s = 0.01;
                cell.install(tag::PEAK, 0, 0, 0, interval_to_block(0.01))
            }
            ModeSpec::Frequency { interval_s } => {
                ctl.block_s = interval_s.max(0.01);
                cell.install(tag::FREQUENCY, 0, 0, 0, interval_to_block(ctl.block_s))
            }
            ModeSpec::Clock { threshold } => cell.install(
                tag::CLOCK,
                volts_to_raw(threshold),
                volts_to_raw(0.1),
                0,
                1,
            ),
        }
    }

    /// Control-domain scan: clear changed flags, derive, post events.
    /// Also maintains the denoised stream-equivalent view per channel.
    pub fn poll(&mut self, now: u64, detect_tx: &Producer<DetectEvent>) {
        for ch in 0..NUM_DETECTORS {
            self.update_view(ch, now);
            if !self.cells[ch].state_changed.load(Ordering::Acquire) {
                continue;
            }
            self.cells[ch].state_changed.store(false, Ordering::Release);
            let raw = self.cells[ch].event_raw.load(Ordering::Relaxed);
            let aux = self.cells[ch].event_aux.load(Ordering::Relaxed);
            if let Some(ev) = self.derive(ch, raw, aux, now) {
                let _ = detect_tx.post(ev);
            }
        }
    }

    fn update_view(&mut self, ch: usize, now: u64) {
        let v = raw_to_volts(self.cells[ch].last_raw());
        let ctl = &mut self.ctl[ch];
        let elapsed_ms = (now.saturating_sub(ctl.view_stamp)) * 1000 / self.sample_rate as u64;
        if (v - ctl.view_volts).abs() > DENOISE_MV / 1000.0 || elapsed_ms >= DENOISE_MS as u64 {
            ctl.view_volts = v;
            ctl.view_stamp = now;
        }
    }

    /// Denoised `input[n].volts` view.
    pub fn volts(&self, ch: usize) -> f32 {
        self.ctl[ch].view_volts
    }

    pub fn connected(&self, ch: usize) -> bool {
        self.ctl[ch].connected
    }

    pub fn cell(&self, ch: usize) -> &Detector {
        &self.cells[ch]
    }

    fn derive(&mut self, ch: usize, raw: i32, aux: i32, now: u64) -> Option<DetectEvent> {
        let rate = self.sample_rate as f32;
        let ctl = &mut self.ctl[ch];
        let volts = raw_to_volts(raw);
        let mk = |kind, value, index, octave, note| DetectEvent {
            channel: ch as u8,
            kind,
            value,
            timestamp: now,
            index,
            octave,
            note,
        };
        match ctl.user_mode {
            ModeSpec::Stream { .. } => {
                let elapsed_ms =
                    (now.saturating_sub(ctl.stream_stamp)) as f32 * 1000.0 / rate;
                if (volts - ctl.stream_volts).abs() <= DENOISE_MV / 1000.0
                    && elapsed_ms < DENOISE_MS as f32
                {
                    return None;
                }
                ctl.stream_volts = volts;
                ctl.stream_stamp = now;
                Some(mk(DetectKind::Stream, volts, 0, 0, 0))
            }
            ModeSpec::Change { .. } => Some(mk(DetectKind::Change, volts, aux, 0, 0)),
            ModeSpec::Window { .. } => {
                let mut idx = ctl.latched_window.min(ctl.window_bounds.len());
                while idx < ctl.window_bounds.len()
                    && volts > ctl.window_bounds[idx] + ctl.window_hyst
                {
                    idx += 1;
                }
                while idx > 0 && volts < ctl.window_bounds[idx - 1] - ctl.window_hyst {
                    idx -= 1;
                }
                if idx == ctl.latched_window {
                    return None;
                }
                let rising = idx > ctl.latched_window;
                ctl.latched_window = idx;
                let signed = if rising {
                    idx as i32 + 1
                } else {
                    -(idx as i32 + 1)
                };
                Some(mk(DetectKind::Window, volts, signed, 0, 0))
            }
            ModeSpec::Scale { .. } => {
                let map = ctl.scale_map.as_ref()?;
                let (degree, octave) = map.locate(volts);
                if degree as i32 == ctl.latched_degree && octave == ctl.latched_octave {
                    return None;
                }
                ctl.latched_degree = degree as i32;
                ctl.latched_octave = octave;
                let q = map.quantize(volts);
                let semitone =
                    ((q - octave as f32 * map.scaling()) / map.scaling() * 12.0).round() as i32;
                Some(mk(DetectKind::Scale, q, degree as i32, octave, octave * 12 + semitone))
            }
            ModeSpec::Volume { .. } => Some(mk(DetectKind::Volume, volts.abs(), 0, 0, 0)),
            ModeSpec::Peak { .. } => {
                let env = volts.abs();
                if !ctl.peak_latched && env > ctl.peak_threshold {
                    ctl.peak_latched = true;
                    Some(mk(DetectKind::Peak, env, 0, 0, 0))
                } else {
                    if ctl.peak_latched && env < ctl.peak_threshold - ctl.peak_hyst {
                        ctl.peak_latched = false;
                    }
                    None
                }
            }
            ModeSpec::Frequency { .. } => {
                let hz = raw as f32 / ctl.block_s;
                Some(mk(DetectKind::Frequency, hz, raw, 0, 0))
            }
            ModeSpec::None | ModeSpec::Clock { .. } => None,
        }
    }
}
