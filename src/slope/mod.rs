// Slope engine: piecewise shaped envelope generation for the four output
// channels. The control domain authors a plan per channel and pre-renders
// samples into an SPSC ring; the audio callback consumes exactly one
// sample per channel per callback.
//
// Every new plan bumps a per-channel generation counter. The consumer
// skips ring entries stamped with an older generation, so a replanned
// channel responds within one callback instead of playing out its stale
// pre-rendered lead.

pub mod scale;
pub mod shape;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::fabric::event::SlopeAction;
use crate::fabric::ring::{self, Consumer, Producer};
use scale::ScaleMap;
use shape::Shape;

pub const NUM_SLOPES: usize = 4;

/// Pre-render ring capacity per channel (power of two, ≥ one audio block).
pub const SLOPE_BUF_CAP: usize = 64;

/// Rendered lead the refill pass maintains: two audio blocks. Bounds the
/// latency of a replanned channel that keeps its old samples.
pub const REFILL_TARGET: usize = 32;

/// Audio-side refill request threshold.
pub const REFILL_LOW_WATER: usize = 16;

#[derive(Clone, Copy)]
struct SlopeSample {
    gen: u32,
    volts: f32,
}

/// Word-sized cells shared between the two halves of one channel.
struct ChannelShared {
    /// Control bumps on every new plan; stale ring entries are skipped.
    gen: AtomicU32,
    /// Audio raises when the ring runs low; control services it.
    refill_request: AtomicBool,
}

// ─────────────────────────────────────────────────────────────────────────────
//  Control half
// ─────────────────────────────────────────────────────────────────────────────

struct Plan {
    here: f32,
    dest: f32,
    start: f32,
    shape: Shape,
    samples_total: u32,
    samples_remaining: u32,
    action: Option<u32>,
    scale: Option<ScaleMap>,
    gen: u32,
    /// Set on every generation bump: the ring may still be full of stale
    /// entries, so the next refill ignores depth and restocks a full lead.
    needs_restock: bool,
    /// Completed with a continuation posted: hold rendering so the next
    /// segment joins the stream sample-exactly.
    awaiting_chain: bool,
    tx: Producer<SlopeSample>,
    shared: Arc<ChannelShared>,
}

impl Plan {
    fn emit_value(&self, raw: f32) -> f32 {
        match &self.scale {
            Some(map) => map.quantize(raw),
            None => scale::clamp_volts(raw),
        }
    }

    /// Render up to `budget` samples of the active plan (or the quiescent
    /// destination). Returns true when this pass completed the plan.
    /// A completed plan with a continuation stops the stream: the next
    /// segment appends where this one ended.
    fn render(&mut self, budget: usize) -> bool {
        let mut completed = false;
        for _ in 0..budget {
            let raw = if self.samples_remaining == 0 {
                if self.awaiting_chain || self.action.is_some() {
                    break;
                }
                self.dest
            } else {
                let done = self.samples_total - self.samples_remaining + 1;
                let p = done as f32 / self.samples_total as f32;
                let v = self.start + (self.dest - self.start) * self.shape.apply(p);
                self.samples_remaining -= 1;
                self.here = v;
                if self.samples_remaining == 0 {
                    self.here = self.dest;
                    completed = true;
                }
                v
            };
            let sample = SlopeSample {
                gen: self.gen,
                volts: self.emit_value(raw),
            };
            if !self.tx.post(sample) {
                break;
            }
            if completed && self.action.is_some() {
                break;
            }
        }
        completed
    }
}

/// Control-domain owner of all four slope plans and the slope-action
/// queue producer.
pub struct SlopeBank {
    plans: [Plan; NUM_SLOPES],
    action_tx: Producer<SlopeAction>,
    sample_rate: f32,
}

/// Audio-domain consumer half of one channel.
pub struct SlopeFeed {
    rx: Consumer<SlopeSample>,
    shared: Arc<ChannelShared>,
    current: f32,
}

pub struct SlopeOut {
    pub volts: f32,
    pub underrun: bool,
}

pub fn split(sample_rate: u32, action_tx: Producer<SlopeAction>) -> (SlopeBank, Vec<SlopeFeed>) {
    let mut plans = Vec::with_capacity(NUM_SLOPES);
    let mut feeds = Vec::with_capacity(NUM_SLOPES);
    for _ in 0..NUM_SLOPES {
        let (tx, rx) = ring::channel(SLOPE_BUF_CAP);
        let shared = Arc::new(ChannelShared {
            gen: AtomicU32::new(0),
            refill_request: AtomicBool::new(false),
        });
        plans.push(Plan {
            here: 0.0,
            dest: 0.0,
            start: 0.0,
            shape: Shape::Linear,
            samples_total: 0,
            samples_remaining: 0,
            action: None,
            scale: None,
            gen: 0,
            needs_restock: false,
            awaiting_chain: false,
            tx,
            shared: shared.clone(),
        });
        feeds.push(SlopeFeed {
            rx,
            shared,
            current: 0.0,
        });
    }
    let plans: [Plan; NUM_SLOPES] = match plans.try_into() {
        Ok(p) => p,
        Err(_) => unreachable!(),
    };
    (
        SlopeBank {
            plans,
            action_tx,
            sample_rate: sample_rate as f32,
        },
        feeds,
    )
}

impl SlopeBank {
    /// Install a new plan toward `dest` over `time_s` with `shape`.
    /// A duration at or below one sample period is an immediate step.
    /// Any in-progress shape is cancelled; `action` is carried as the
    /// continuation handle for when the new plan completes.
    pub fn toward(&mut self, ch: usize, dest: f32, time_s: f32, shape: Shape, action: Option<u32>) {
        self.plans[ch].gen = self.plans[ch].gen.wrapping_add(1);
        self.plans[ch]
            .shared
            .gen
            .store(self.plans[ch].gen, Ordering::Release);
        self.plans[ch].needs_restock = true;
        self.install_plan(ch, dest, time_s, shape, action);
    }

    /// Continuation variant: the new segment appends to the rendered
    /// stream instead of superseding it, so chained envelope segments
    /// join sample-exactly.
    pub fn toward_chained(
        &mut self,
        ch: usize,
        dest: f32,
        time_s: f32,
        shape: Shape,
        action: Option<u32>,
    ) {
        self.install_plan(ch, dest, time_s, shape, action);
    }

    /// End a continuation hold without installing a new segment (the
    /// script declined to chain); the channel sustains its destination.
    pub fn resume_fill(&mut self, ch: usize) {
        self.plans[ch].awaiting_chain = false;
    }

    fn install_plan(&mut self, ch: usize, dest: f32, time_s: f32, shape: Shape, action: Option<u32>) {
        let plan = &mut self.plans[ch];
        let immediate = time_s * self.sample_rate <= 1.0;
        let changed = dest != plan.here;
        plan.awaiting_chain = false;
        plan.start = plan.here;
        plan.dest = dest;
        plan.shape = shape;

        if immediate {
            plan.here = dest;
            plan.samples_total = 0;
            plan.samples_remaining = 0;
            plan.action = None;
            // A zero-time step to the current value enqueues nothing.
            if changed && action.is_some() {
                let _ = self.action_tx.post(SlopeAction { channel: ch as u8 });
            }
        } else {
            let samples = (time_s * self.sample_rate).ceil() as u32;
            plan.samples_total = samples;
            plan.samples_remaining = samples;
            plan.action = action;
        }
    }

    /// Attach or clear the quantization scale for a channel. Applies from
    /// the next rendered sample.
    pub fn set_scale(&mut self, ch: usize, map: Option<ScaleMap>) {
        let plan = &mut self.plans[ch];
        plan.scale = map;
        plan.gen = plan.gen.wrapping_add(1);
        plan.shared.gen.store(plan.gen, Ordering::Release);
        plan.needs_restock = true;
    }

    /// Current planned value in volts (`output[n].volts` query).
    pub fn get_state(&self, ch: usize) -> f32 {
        let plan = &self.plans[ch];
        plan.emit_value(plan.here)
    }

    /// Destination of the active plan.
    pub fn dest(&self, ch: usize) -> f32 {
        self.plans[ch].dest
    }

    /// True while a shape is still rendering.
    pub fn active(&self, ch: usize) -> bool {
        self.plans[ch].samples_remaining > 0
    }

    /// Producer-side query: does this channel want a refill pass?
    pub fn buffer_needs_fill(&self, ch: usize) -> bool {
        let plan = &self.plans[ch];
        plan.tx.depth() < REFILL_TARGET || plan.shared.refill_request.load(Ordering::Relaxed)
    }

    /// Top up every channel's rendered lead; posts slope-action
    /// continuations for plans that complete during the pass.
    pub fn refill_all(&mut self) {
        for ch in 0..NUM_SLOPES {
            let plan = &mut self.plans[ch];
            plan.shared.refill_request.store(false, Ordering::Relaxed);
            let budget = if plan.needs_restock {
                plan.needs_restock = false;
                REFILL_TARGET.min(plan.tx.space())
            } else {
                let depth = plan.tx.depth();
                if depth >= REFILL_TARGET {
                    continue;
                }
                REFILL_TARGET - depth
            };
            let completed = plan.render(budget);
            if completed && plan.action.take().is_some() {
                plan.awaiting_chain = true;
                let _ = self.action_tx.post(SlopeAction { channel: ch as u8 });
            }
        }
    }

    /// Hard reset: zero all channels, drop plans, scales and continuations.
    pub fn reset(&mut self) {
        for ch in 0..NUM_SLOPES {
            self.plans[ch].scale = None;
            self.plans[ch].action = None;
            self.toward(ch, 0.0, 0.0, Shape::Linear, None);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Audio half
// ─────────────────────────────────────────────────────────────────────────────

impl SlopeFeed {
    /// Consume the next pre-rendered sample. Entries from a superseded
    /// generation are discarded. On a true underrun the last value is
    /// re-emitted and flagged; the audio domain is never blocked.
    pub fn consume(&mut self) -> SlopeOut {
        let gen = self.shared.gen.load(Ordering::Acquire);
        let mut skipped_stale = false;
        loop {
            match self.rx.get() {
                Some(s) if s.gen == gen => {
                    self.current = s.volts;
                    if self.rx.depth() < REFILL_LOW_WATER {
                        self.shared.refill_request.store(true, Ordering::Relaxed);
                    }
                    return SlopeOut {
                        volts: s.volts,
                        underrun: false,
                    };
                }
                Some(_) => skipped_stale = true,
                None => {
                    self.shared.refill_request.store(true, Ordering::Relaxed);
                    return SlopeOut {
                        volts: self.current,
                        // A drained-stale ring is a replan in flight, not
                        // a starved producer.
                        underrun: !skipped_stale,
                    };
                }
            }
        }
    }

    /// Apply a batched immediate voltage set (already quantize-free: the
    /// control side published the final value).
    pub fn jam(&mut self, volts: f32) {
        self.current = volts;
    }

    /// Round-robin refill poke from the audio callback.
    pub fn request_refill_if_low(&self) {
        if self.rx.depth() < REFILL_LOW_WATER {
            self.shared.refill_request.store(true, Ordering::Relaxed);
        }
    }

    pub fn current(&self) -> f32 {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::ring;

    fn bank() -> (SlopeBank, Vec<SlopeFeed>, ring::Consumer<SlopeAction>) {
        let (action_tx, action_rx) = ring::channel(16);
        let (bank, feeds) = split(8_000, action_tx);
        (bank, feeds, action_rx)
    }

    fn drain_n(feed: &mut SlopeFeed, n: usize) -> Vec<f32> {
        (0..n).map(|_| feed.consume().volts).collect()
    }

    #[test]
    fn linear_slope_reaches_destination() {
        let (mut bank, mut feeds, _rx) = bank();
        // 10 ms at 8 kHz = 80 samples.
        bank.toward(0, 4.0, 0.01, Shape::Linear, None);
        let mut last = 0.0;
        let mut prev = -f32::MAX;
        for _ in 0..6 {
            bank.refill_all();
            for v in drain_n(&mut feeds[0], REFILL_TARGET) {
                assert!(v >= prev - 1e-5, "linear slope must be nondecreasing");
                prev = v;
                last = v;
            }
        }
        assert!((last - 4.0).abs() < 1e-5);
    }

    #[test]
    fn quiescent_channel_holds_destination() {
        let (mut bank, mut feeds, _rx) = bank();
        bank.toward(1, 2.5, 0.0, Shape::Linear, None);
        bank.refill_all();
        for v in drain_n(&mut feeds[1], 20) {
            assert!((v - 2.5).abs() < 1e-6);
        }
        assert!(!bank.active(1));
        assert!((bank.get_state(1) - 2.5).abs() < 1e-6);
    }

    #[test]
    fn immediate_step_sets_state_without_action() {
        let (mut bank, mut feeds, action_rx) = bank();
        bank.toward(0, 3.0, 0.0, Shape::Linear, Some(7));
        assert_eq!(bank.get_state(0), 3.0);
        // Continuation fired immediately for a real change…
        assert!(action_rx.get().is_some());
        // …but a zero-time step to the current value enqueues nothing.
        bank.toward(0, 3.0, 0.0, Shape::Linear, Some(8));
        assert!(action_rx.get().is_none());
        bank.refill_all();
        assert_eq!(feeds[0].consume().volts, 3.0);
    }

    #[test]
    fn completion_posts_one_action_continuation() {
        let (mut bank, mut feeds, action_rx) = bank();
        // 16 samples.
        bank.toward(2, 1.0, 0.002, Shape::Linear, Some(1));
        bank.refill_all();
        assert_eq!(action_rx.get(), Some(SlopeAction { channel: 2 }));
        // Quiescent refills must not repeat the continuation.
        drain_n(&mut feeds[2], REFILL_TARGET);
        bank.refill_all();
        assert_eq!(action_rx.get(), None);
    }

    #[test]
    fn replan_supersedes_buffered_samples() {
        let (mut bank, mut feeds, _rx) = bank();
        bank.toward(0, 5.0, 1.0, Shape::Linear, None);
        bank.refill_all();
        // Replan before consuming anything: old samples are stale.
        bank.toward(0, -1.0, 0.0, Shape::Linear, None);
        bank.refill_all();
        assert_eq!(feeds[0].consume().volts, -1.0);
    }

    #[test]
    fn underrun_repeats_last_value() {
        let (mut bank, mut feeds, _rx) = bank();
        bank.toward(3, 1.5, 0.0, Shape::Linear, None);
        bank.refill_all();
        while feeds[3].rx.depth() > 0 {
            feeds[3].consume();
        }
        let out = feeds[3].consume();
        assert!(out.underrun);
        assert_eq!(out.volts, 1.5);
    }

    #[test]
    fn scaled_channel_snaps_to_degrees() {
        let (mut bank, mut feeds, _rx) = bank();
        bank.set_scale(0, Some(ScaleMap::from_degrees(&[], 12.0, 1.0)));
        bank.toward(0, 1.0, 0.01, Shape::Linear, None);
        bank.refill_all();
        for v in drain_n(&mut feeds[0], REFILL_TARGET) {
            let semis = v * 12.0;
            assert!(
                (semis - semis.round()).abs() < 1e-4,
                "{v} is not on a semitone"
            );
        }
    }
}
