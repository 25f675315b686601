// Beat clock scheduler. A global beats counter advances from either the
// internal tempo or divided rising edges on an external pulse input.
// Coroutine slots hold a wake condition; the clock service posts a resume
// event when a condition is met. The native side only ever holds dense
// integer ids; cancellation is id invalidation, checked again at
// dispatch time, so a resume racing a cancel becomes a no-op.

use crate::fabric::event::ClockResume;
use crate::fabric::ring::Producer;

pub const NUM_CORO_SLOTS: usize = 16;

/// Clock-scheduler service rate (ticks produced by the audio domain's
/// remainder-carry accumulator).
pub const CLOCK_SERVICE_HZ: u32 = 1_000;

/// Fine timer service rate, used for control-side cadences.
pub const TIMER_SERVICE_HZ: u32 = 1_500;

pub const DEFAULT_BPM: f64 = 120.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClockSource {
    Internal,
    External { div: u32 },
}

#[derive(Clone, Copy, Debug)]
enum Wake {
    Sleep { ticks_left: u32 },
    BeatDelta { at_beat: f64 },
    BeatSync { mult: f64, at_beat: f64 },
}

#[derive(Clone, Copy, Debug)]
enum SlotState {
    Free,
    Waiting(Wake),
    /// Resume event posted, awaiting dispatch confirmation.
    Posted,
    /// Cancelled after posting; the dispatcher drops the resume.
    PostedCancelled,
}

struct Slot {
    id: u32,
    state: SlotState,
}

pub struct ClockScheduler {
    slots: [Slot; NUM_CORO_SLOTS],
    next_id: u32,
    beats: f64,
    running: bool,
    source: ClockSource,
    bpm: f64,
    beat_per_tick: f64,
    ext_edge_accum: u32,
}

impl ClockScheduler {
    pub fn new() -> Self {
        let mut s = Self {
            slots: std::array::from_fn(|_| Slot {
                id: 0,
                state: SlotState::Free,
            }),
            next_id: 1,
            beats: 0.0,
            running: true,
            source: ClockSource::Internal,
            bpm: 0.0,
            beat_per_tick: 0.0,
            ext_edge_accum: 0,
        };
        s.set_tempo(DEFAULT_BPM);
        s
    }

    // ── Transport ────────────────────────────────────────────────────────

    pub fn set_tempo(&mut self, bpm: f64) {
        self.bpm = bpm.max(0.0);
        self.beat_per_tick = self.bpm / 60.0 / CLOCK_SERVICE_HZ as f64;
    }

    pub fn tempo(&self) -> f64 {
        self.bpm
    }

    pub fn beats(&self) -> f64 {
        self.beats
    }

    pub fn set_source(&mut self, source: ClockSource) {
        self.source = source;
        self.ext_edge_accum = 0;
    }

    pub fn source(&self) -> ClockSource {
        self.source
    }

    /// Jam the beats counter and run.
    pub fn start(&mut self, beat_offset: f64) {
        self.beats = beat_offset;
        self.running = true;
        // Re-anchor beat-sync targets to the jammed position.
        for slot in &mut self.slots {
            if let SlotState::Waiting(Wake::BeatSync { mult, at_beat }) = &mut slot.state {
                *at_beat = next_multiple(self.beats, *mult);
            }
        }
    }

    /// Freeze the beats counter.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn running(&self) -> bool {
        self.running
    }

    // ── Scheduling ───────────────────────────────────────────────────────

    /// Resume after `seconds` of wall time. Non-positive durations post
    /// the resume immediately.
    pub fn sleep(&mut self, seconds: f64, clock_tx: &Producer<ClockResume>) -> Option<u32> {
        if seconds <= 0.0 {
            return self.post_immediate(clock_tx);
        }
        let ticks = ((seconds * CLOCK_SERVICE_HZ as f64) - 1e-9).ceil().max(1.0) as u32;
        self.allocate(Wake::Sleep { ticks_left: ticks })
    }

    /// Resume after `delta` beats of clock time.
    pub fn sync_beats(&mut self, delta: f64, clock_tx: &Producer<ClockResume>) -> Option<u32> {
        if delta <= 0.0 {
            return self.post_immediate(clock_tx);
        }
        self.allocate(Wake::BeatDelta {
            at_beat: self.beats + delta,
        })
    }

    /// Resume at the next beat index that is a multiple of `mult`.
    pub fn sync_every(&mut self, mult: f64, clock_tx: &Producer<ClockResume>) -> Option<u32> {
        if mult <= 0.0 {
            return self.post_immediate(clock_tx);
        }
        self.allocate(Wake::BeatSync {
            mult,
            at_beat: next_multiple(self.beats, mult),
        })
    }

    /// Invalidate a coroutine id. Safe against in-flight resumes: a
    /// posted event is dropped at dispatch by `confirm_resume`.
    pub fn cancel(&mut self, id: u32) {
        for slot in &mut self.slots {
            if slot.id == id {
                slot.state = match slot.state {
                    SlotState::Posted | SlotState::PostedCancelled => SlotState::PostedCancelled,
                    _ => SlotState::Free,
                };
                return;
            }
        }
    }

    pub fn cancel_all(&mut self) {
        for slot in &mut self.slots {
            slot.state = match slot.state {
                SlotState::Posted | SlotState::PostedCancelled => SlotState::PostedCancelled,
                _ => SlotState::Free,
            };
        }
    }

    /// Dispatcher-side id check for a dequeued resume event. Returns true
    /// when the coroutine should actually be resumed, and frees the slot
    /// either way.
    pub fn confirm_resume(&mut self, id: u32) -> bool {
        for slot in &mut self.slots {
            if slot.id == id {
                let ok = matches!(slot.state, SlotState::Posted);
                if matches!(slot.state, SlotState::Posted | SlotState::PostedCancelled) {
                    slot.state = SlotState::Free;
                }
                return ok;
            }
        }
        false
    }

    // ── Advancement ──────────────────────────────────────────────────────

    /// Service `ticks` clock-scheduler ticks (~1 kHz).
    pub fn service(&mut self, ticks: u32, clock_tx: &Producer<ClockResume>) {
        if ticks == 0 {
            return;
        }
        if self.running && matches!(self.source, ClockSource::Internal) {
            self.beats += ticks as f64 * self.beat_per_tick;
        }
        let beats = self.beats;
        for i in 0..NUM_CORO_SLOTS {
            let fire = match &mut self.slots[i].state {
                SlotState::Waiting(Wake::Sleep { ticks_left }) => {
                    *ticks_left = ticks_left.saturating_sub(ticks);
                    *ticks_left == 0
                }
                SlotState::Waiting(Wake::BeatDelta { at_beat })
                | SlotState::Waiting(Wake::BeatSync { at_beat, .. }) => beats >= *at_beat,
                _ => false,
            };
            if fire {
                self.fire_slot(i, clock_tx);
            }
        }
    }

    /// Feed rising edges captured from the external clock input.
    pub fn external_edges(&mut self, edges: u32, clock_tx: &Producer<ClockResume>) {
        let div = match self.source {
            ClockSource::External { div } => div.max(1),
            ClockSource::Internal => return,
        };
        self.ext_edge_accum += edges;
        while self.ext_edge_accum >= div {
            self.ext_edge_accum -= div;
            if !self.running {
                continue;
            }
            self.beats += 1.0;
            let beats = self.beats;
            for i in 0..NUM_CORO_SLOTS {
                let fire = matches!(
                    self.slots[i].state,
                    SlotState::Waiting(Wake::BeatDelta { at_beat })
                        | SlotState::Waiting(Wake::BeatSync { at_beat, .. })
                        if beats >= at_beat
                );
                if fire {
                    self.fire_slot(i, clock_tx);
                }
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn allocate(&mut self, wake: Wake) -> Option<u32> {
        let slot = self.slots.iter_mut().find(|s| matches!(s.state, SlotState::Free))?;
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        slot.id = id;
        slot.state = SlotState::Waiting(wake);
        Some(id)
    }

    fn post_immediate(&mut self, clock_tx: &Producer<ClockResume>) -> Option<u32> {
        let id = {
            let slot = self
                .slots
                .iter_mut()
                .find(|s| matches!(s.state, SlotState::Free))?;
            let id = self.next_id;
            slot.id = id;
            slot.state = SlotState::Posted;
            id
        };
        self.next_id = self.next_id.wrapping_add(1).max(1);
        if !clock_tx.post(ClockResume { coro_id: id }) {
            // Dropped: count is on the queue; the slot is reusable now.
            self.free_by_id(id);
        }
        Some(id)
    }

    fn fire_slot(&mut self, index: usize, clock_tx: &Producer<ClockResume>) {
        let id = self.slots[index].id;
        if clock_tx.post(ClockResume { coro_id: id }) {
            self.slots[index].state = SlotState::Posted;
        } else {
            self.slots[index].state = SlotState::Free;
        }
    }

    fn free_by_id(&mut self, id: u32) {
        for slot in &mut self.slots {
            if slot.id == id {
                slot.state = SlotState::Free;
            }
        }
    }

    /// Active (waiting or in-flight) slot count, for diagnostics.
    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s.state, SlotState::Free))
            .count()
    }
}

impl Default for ClockScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn next_multiple(beats: f64, mult: f64) -> f64 {
    ((beats / mult).floor() + 1.0) * mult
}
