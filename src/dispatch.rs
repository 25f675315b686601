// Event dispatch and VM-boundary glue. Each control-loop iteration runs
// the queues in a fixed priority order, each bounded so no queue can
// starve the others. Every VM call is bracketed by an output batch:
// voltage writes made by script code are recorded, then applied through
// the immediate-set cell on flush, so all touched channels land in the
// same audio callback.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::bench::{Bench, SwitchPos};
use crate::clock::{ClockScheduler, TIMER_SERVICE_HZ};
use crate::detect::{DetectorBank, ModeSpec, NUM_DETECTORS};
use crate::fabric::event::{ControlEnds, RxChunk, TxMsg};
use crate::fabric::state::{
    SharedState, NUM_OUTPUTS, NUM_PULSE, PULSE_MODE_OFF,
};
use crate::metro::MetroBank;
use crate::slope::shape::Shape;
use crate::slope::{scale::ScaleMap, SlopeBank};
use crate::vm::{KernelView, ScriptVm, VmAction, VmError, VmEvent};

/// Per-iteration dispatch caps.
const DETECT_EVENTS_PER_LOOP: usize = 8;
const GENERAL_EVENTS_PER_LOOP: usize = 16;

/// Cadences in timer-service ticks (~1.5 kHz).
const SWITCH_POLL_TICKS: u32 = TIMER_SERVICE_HZ / 20;
const PUBLIC_VIEW_TICKS: u32 = TIMER_SERVICE_HZ / 15;

/// Pulse widths above this hold the output high indefinitely.
const PULSE_WIDTH_HOLD_S: f32 = 100.0;

#[derive(Clone, Copy, Debug)]
enum ResumeTarget {
    /// Resume a script coroutine by its VM-side registry key.
    VmRef(u32),
    /// Pull a pulse output low, unless a newer pulse superseded this one.
    PulseRelease { channel: usize, pulse_id: u32 },
}

struct OutputBatch {
    depth: u32,
    pending: [Option<f32>; NUM_OUTPUTS],
}

pub struct Dispatcher {
    pub slopes: SlopeBank,
    pub detectors: DetectorBank,
    pub metros: Arc<MetroBank>,
    pub clock: ClockScheduler,
    state: Arc<SharedState>,
    bench: Arc<dyn Bench>,
    ends: ControlEnds,
    vm: Box<dyn ScriptVm>,

    resumes: HashMap<u32, ResumeTarget>,
    pulse_ids: [u32; NUM_PULSE],
    pulse_cb_active: [bool; NUM_PULSE],
    batch: OutputBatch,
    /// While a slope-action callback runs, towards on this channel are
    /// appended (chained) instead of superseding the rendered stream.
    chain_channel: Option<u8>,

    /// `^^pubview` monitoring stream toggle.
    pub public_view: bool,
    switch_acc: u32,
    view_acc: u32,
    last_switch: SwitchPos,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slopes: SlopeBank,
        detectors: DetectorBank,
        metros: Arc<MetroBank>,
        clock: ClockScheduler,
        state: Arc<SharedState>,
        bench: Arc<dyn Bench>,
        ends: ControlEnds,
        vm: Box<dyn ScriptVm>,
    ) -> Self {
        let last_switch = bench.switch_position();
        Self {
            slopes,
            detectors,
            metros,
            clock,
            state,
            bench,
            ends,
            vm,
            resumes: HashMap::new(),
            pulse_ids: [0; NUM_PULSE],
            pulse_cb_active: [false; NUM_PULSE],
            batch: OutputBatch {
                depth: 0,
                pending: [None; NUM_OUTPUTS],
            },
            chain_channel: None,
            public_view: false,
            switch_acc: 0,
            view_acc: 0,
            last_switch,
        }
    }

    // ── Serial I/O helpers ───────────────────────────────────────────────

    /// Queue one `\n\r`-terminated response line.
    pub fn send_line(&self, text: &str) {
        let mut bytes = Vec::with_capacity(text.len() + 2);
        bytes.extend_from_slice(text.as_bytes());
        bytes.extend_from_slice(b"\n\r");
        let _ = self.ends.usb_tx_tx.post(TxMsg::from_slice(&bytes, true));
    }

    pub fn recv_usb(&self) -> Option<RxChunk> {
        self.ends.usb_rx_rx.get()
    }

    // ── VM invocation (always batch-bracketed) ───────────────────────────

    /// Snapshot handed to the VM with every call.
    fn kernel_view(&self) -> KernelView {
        use crate::bench::Knob;
        KernelView {
            output_volts: std::array::from_fn(|ch| self.slopes.get_state(ch)),
            input_volts: [self.detectors.volts(0), self.detectors.volts(1)],
            input_connected: [self.detectors.connected(0), self.detectors.connected(1)],
            knobs: [
                self.bench.knob(Knob::Main),
                self.bench.knob(Knob::X),
                self.bench.knob(Knob::Y),
            ],
            switch_position: match self.bench.switch_position() {
                SwitchPos::Up => 0,
                SwitchPos::Middle => 1,
                SwitchPos::Down => 2,
            },
            beats: self.clock.beats(),
            tempo: self.clock.tempo(),
        }
    }

    fn call_vm(&mut self, event: VmEvent) {
        let view = self.kernel_view();
        let mut actions = Vec::new();
        self.batch_begin();
        let result = self.vm.on_event(event, &view, &mut actions);
        match result {
            Ok(()) => self.apply_actions(actions),
            Err(e) => self.report_vm_error(e),
        }
        // Flushed even after an error so no intermediate state sticks.
        self.batch_flush();
    }

    /// Evaluate a REPL chunk.
    pub fn eval_chunk(&mut self, chunk: &str) {
        let view = self.kernel_view();
        let mut actions = Vec::new();
        self.batch_begin();
        let result = self.vm.eval(chunk, &view, &mut actions);
        match result {
            Ok(()) => self.apply_actions(actions),
            Err(e) => self.report_vm_error(e),
        }
        self.batch_flush();
    }

    /// Load and run a whole script. Returns success.
    pub fn run_script(&mut self, source: &str) -> bool {
        let view = self.kernel_view();
        let mut actions = Vec::new();
        self.batch_begin();
        let result = self.vm.load_script(source, &view, &mut actions);
        let ok = match result {
            Ok(()) => {
                self.apply_actions(actions);
                true
            }
            Err(e) => {
                self.report_vm_error(e);
                false
            }
        };
        self.batch_flush();
        ok
    }

    pub fn load_default_script(&mut self) -> bool {
        let view = self.kernel_view();
        let mut actions = Vec::new();
        self.batch_begin();
        let result = self.vm.load_default(&view, &mut actions);
        let ok = match result {
            Ok(()) => {
                self.apply_actions(actions);
                true
            }
            Err(e) => {
                self.report_vm_error(e);
                false
            }
        };
        self.batch_flush();
        ok
    }

    /// Invoke `init()` if the script defines one.
    pub fn call_init(&mut self) {
        if self.vm.has_init() {
            self.call_vm(VmEvent::Init);
        }
    }

    /// Full soft reset: metros stopped, detectors cleared, clock slots
    /// cancelled, slopes zeroed, noise off, queues emptied, VM state
    /// dropped.
    pub fn full_reset(&mut self) {
        self.metros.stop_all();
        for ch in 0..NUM_DETECTORS {
            self.detectors.set_mode(ch, ModeSpec::None);
        }
        self.clock.cancel_all();
        self.resumes.clear();
        self.slopes.reset();
        self.state.noise.mask.store(0, Ordering::Relaxed);
        for ch in 0..NUM_PULSE {
            self.state.pulse_out_level[ch].store(false, Ordering::Relaxed);
            self.state.pulse_in_mode[ch].store(PULSE_MODE_OFF, Ordering::Relaxed);
            self.state.pulse_change_pending[ch].store(false, Ordering::Relaxed);
            self.pulse_cb_active[ch] = false;
        }
        self.ends.detect_rx.drain();
        self.ends.metro_rx.drain();
        self.ends.clock_rx.drain();
        self.ends.slope_action_rx.drain();
        self.ends.general_rx.drain();
        self.ends.pulse_edge_rx.drain();
        self.vm.reset();
    }

    pub fn vm_mut(&mut self) -> &mut dyn ScriptVm {
        self.vm.as_mut()
    }

    /// Total payloads dropped across the control-visible queues.
    pub fn queue_drops(&self) -> u32 {
        self.ends.detect_rx.drops()
            + self.ends.metro_rx.drops()
            + self.ends.clock_rx.drops()
            + self.ends.slope_action_rx.drops()
            + self.ends.general_rx.drops()
            + self.ends.pulse_edge_rx.drops()
            + self.ends.usb_rx_rx.drops()
    }

    // ── The ten priority steps ───────────────────────────────────────────

    pub fn run_iteration(&mut self) {
        let now = self.state.now();

        // Service the beat clock from the audio domain's tick budget
        // before draining resumes, so fresh wakes dispatch this pass.
        let clock_ticks = self.state.clock_ticks_pending.swap(0, Ordering::Acquire);
        self.clock.service(clock_ticks, &self.ends.clock_tx);
        let timer_ticks = self.state.timer_ticks_pending.swap(0, Ordering::Acquire);

        // Keep the pre-rendered slope lead topped up; completions post
        // continuations into the slope-action queue.
        self.slopes.refill_all();

        // 1. Slope-action continuations (all available; they unblock
        //    chained envelopes).
        while let Some(ev) = self.ends.slope_action_rx.get() {
            self.chain_channel = Some(ev.channel);
            self.call_vm(VmEvent::SlopeAction {
                channel: ev.channel,
            });
            self.chain_channel = None;
            // If the script declined to chain, the channel sustains.
            self.slopes.resume_fill(ev.channel as usize);
        }

        // 2. Detection events, capped.
        self.detectors.poll(now, &self.ends.detect_tx);
        for _ in 0..DETECT_EVENTS_PER_LOOP {
            match self.ends.detect_rx.get() {
                Some(ev) => self.call_vm(VmEvent::Detect(ev)),
                None => break,
            }
        }

        // 3. Metro ticks (drain).
        while let Some(ev) = self.ends.metro_rx.get() {
            self.call_vm(VmEvent::Metro {
                id: ev.id,
                stage: ev.stage,
            });
        }

        // 4. Clock resumes (drain), id-checked against cancellation.
        while let Some(ev) = self.ends.clock_rx.get() {
            let live = self.clock.confirm_resume(ev.coro_id);
            match self.resumes.remove(&ev.coro_id) {
                Some(ResumeTarget::VmRef(vm_ref)) if live => {
                    self.call_vm(VmEvent::ClockResume { vm_ref });
                }
                Some(ResumeTarget::PulseRelease { channel, pulse_id }) if live => {
                    // A newer pulse supersedes the stale release.
                    if self.pulse_ids[channel] == pulse_id {
                        self.state.pulse_out_level[channel].store(false, Ordering::Relaxed);
                    }
                }
                _ => {}
            }
        }

        // 5. General events, capped.
        for _ in 0..GENERAL_EVENTS_PER_LOOP {
            match self.ends.general_rx.get() {
                Some(ev) => self.call_vm(VmEvent::General {
                    code: ev.code,
                    value: ev.value,
                }),
                None => break,
            }
        }

        // 6. Switch + normalization-probe poll at 20 Hz. An unpatched
        //    input is coerced to the effective mode None.
        self.switch_acc += timer_ticks;
        if self.switch_acc >= SWITCH_POLL_TICKS {
            self.switch_acc = 0;
            for ch in 0..NUM_DETECTORS {
                self.detectors.set_connected(ch, self.bench.cv_connected(ch));
            }
            let pos = self.bench.switch_position();
            if pos != self.last_switch {
                self.last_switch = pos;
                let position = match pos {
                    SwitchPos::Up => 0,
                    SwitchPos::Middle => 1,
                    SwitchPos::Down => 2,
                };
                self.call_vm(VmEvent::Switch { position });
            }
        }

        // 7. Pulse-input change dispatch, reentrancy-guarded: edges that
        //    arrive while the callback runs are dropped, not queued.
        for ch in 0..NUM_PULSE {
            if !self.state.pulse_change_pending[ch].swap(false, Ordering::Acquire) {
                continue;
            }
            if self.pulse_cb_active[ch] {
                continue;
            }
            self.pulse_cb_active[ch] = true;
            let level = self.state.pulse_in_level[ch].load(Ordering::Relaxed);
            self.call_vm(VmEvent::PulseChange {
                channel: ch as u8,
                level,
            });
            self.state.pulse_change_pending[ch].store(false, Ordering::Relaxed);
            self.pulse_cb_active[ch] = false;
        }

        // 8. Clock-edge forwarding: pulse-input edges and CV clock-mode
        //    edges both drive the external clock source.
        let mut edges = 0u32;
        while self.ends.pulse_edge_rx.get().is_some() {
            edges += 1;
        }
        for ch in 0..NUM_DETECTORS {
            edges += self.detectors.cell(ch).take_clock_edges();
        }
        if edges > 0 {
            self.clock.external_edges(edges, &self.ends.clock_tx);
        }

        // 9. Public-view monitoring at 15 Hz.
        self.view_acc += timer_ticks;
        if self.view_acc >= PUBLIC_VIEW_TICKS {
            self.view_acc = 0;
            if self.public_view {
                let out = self.state.outputs.snapshot();
                let line = format!(
                    "^^pubview({:.3},{:.3},{:.3},{:.3},{:.3},{:.3})",
                    out[0] as f32 / 1000.0,
                    out[1] as f32 / 1000.0,
                    out[2] as f32 / 1000.0,
                    out[3] as f32 / 1000.0,
                    self.detectors.volts(0),
                    self.detectors.volts(1),
                );
                self.send_line(&line);
            }
        }

        // 10. The "as soon as possible" user hook, once per iteration.
        self.call_vm(VmEvent::Asap);

        // Top up again so envelopes started this pass are rendered
        // before the audio domain needs them.
        self.slopes.refill_all();
    }

    // ── Output batching ──────────────────────────────────────────────────

    fn batch_begin(&mut self) {
        self.batch.depth += 1;
    }

    fn batch_flush(&mut self) {
        // Balanced bracket: only the outermost flush actuates.
        self.batch.depth = self.batch.depth.saturating_sub(1);
        if self.batch.depth > 0 {
            return;
        }
        let mut targets = [None; NUM_OUTPUTS];
        let mut any = false;
        for ch in 0..NUM_OUTPUTS {
            if let Some(v) = self.batch.pending[ch].take() {
                // One conversion per changed channel: the plan jumps to
                // the (quantized) target and the audio callback applies
                // every channel in the same tick.
                self.slopes.toward(ch, v, 0.0, Shape::Linear, None);
                targets[ch] = Some(self.slopes.get_state(ch));
                any = true;
            }
        }
        if any {
            self.state.immediate.publish(targets);
        }
    }

    fn set_volts(&mut self, ch: usize, volts: f32) {
        if self.batch.depth > 0 {
            self.batch.pending[ch] = Some(volts);
        } else {
            self.slopes.toward(ch, volts, 0.0, Shape::Linear, None);
            let mut targets = [None; NUM_OUTPUTS];
            targets[ch] = Some(self.slopes.get_state(ch));
            self.state.immediate.publish(targets);
        }
    }

    // ── Action application ───────────────────────────────────────────────

    fn apply_actions(&mut self, actions: Vec<VmAction>) {
        for action in actions {
            self.apply_action(action);
        }
    }

    fn apply_action(&mut self, action: VmAction) {
        match action {
            VmAction::SetVolts { channel, volts } => {
                self.set_volts(channel as usize, volts);
            }
            VmAction::Toward {
                channel,
                dest,
                time_s,
                shape,
                action,
            } => {
                if self.chain_channel == Some(channel) {
                    self.slopes
                        .toward_chained(channel as usize, dest, time_s, shape, action);
                } else {
                    self.slopes
                        .toward(channel as usize, dest, time_s, shape, action);
                }
            }
            VmAction::SetScale {
                channel,
                degrees,
                modulo,
                scaling,
            } => {
                let map = ScaleMap::from_degrees(&degrees, modulo, scaling);
                self.slopes.set_scale(channel as usize, Some(map));
            }
            VmAction::ClearScale { channel } => {
                self.slopes.set_scale(channel as usize, None);
            }
            VmAction::Noise {
                channel,
                gain_mv,
                enable,
            } => {
                let bit = 1u8 << channel;
                self.state.noise.gain_mv[channel as usize].store(gain_mv, Ordering::Relaxed);
                if enable {
                    self.state
                        .noise
                        .reseed
                        .store(rand::random::<u32>() | 1, Ordering::Relaxed);
                    self.state.noise.mask.fetch_or(bit, Ordering::Relaxed);
                } else {
                    self.state.noise.mask.fetch_and(!bit, Ordering::Relaxed);
                }
            }
            VmAction::SetInputMode { channel, spec } => {
                self.detectors.set_mode(channel as usize, spec);
            }
            VmAction::SetPulseInMode { channel, mode } => {
                use crate::fabric::state::{PULSE_MODE_CHANGE, PULSE_MODE_CLOCK};
                let ch = channel as usize;
                let tag = match mode {
                    crate::vm::PulseInMode::Off => PULSE_MODE_OFF,
                    crate::vm::PulseInMode::Change => PULSE_MODE_CHANGE,
                    crate::vm::PulseInMode::Clock => PULSE_MODE_CLOCK,
                };
                self.state.pulse_change_pending[ch].store(false, Ordering::Relaxed);
                self.state.pulse_in_mode[ch].store(tag, Ordering::Release);
            }
            VmAction::MetroStart {
                id,
                interval_s,
                count,
            } => {
                self.metros.start(id as usize, interval_s, count);
            }
            VmAction::MetroStop { id } => self.metros.stop(id as usize),
            VmAction::MetroSetInterval { id, interval_s } => {
                self.metros.set_interval(id as usize, interval_s);
            }
            VmAction::MetroSetCount { id, stages } => {
                self.metros.set_count(id as usize, stages);
            }
            VmAction::ClockSleep { seconds, vm_ref } => {
                if let Some(id) = self.clock.sleep(seconds, &self.ends.clock_tx) {
                    self.resumes.insert(id, ResumeTarget::VmRef(vm_ref));
                }
            }
            VmAction::ClockSyncBeats { delta, vm_ref } => {
                if let Some(id) = self.clock.sync_beats(delta, &self.ends.clock_tx) {
                    self.resumes.insert(id, ResumeTarget::VmRef(vm_ref));
                }
            }
            VmAction::ClockSyncEvery { mult, vm_ref } => {
                if let Some(id) = self.clock.sync_every(mult, &self.ends.clock_tx) {
                    self.resumes.insert(id, ResumeTarget::VmRef(vm_ref));
                }
            }
            VmAction::ClockCancel { vm_ref } => {
                let stale: Vec<u32> = self
                    .resumes
                    .iter()
                    .filter_map(|(id, t)| match t {
                        ResumeTarget::VmRef(r) if *r == vm_ref => Some(*id),
                        _ => None,
                    })
                    .collect();
                for id in stale {
                    self.clock.cancel(id);
                    self.resumes.remove(&id);
                }
            }
            VmAction::ClockSetTempo { bpm } => self.clock.set_tempo(bpm),
            VmAction::ClockStart { beat } => self.clock.start(beat),
            VmAction::ClockStop => self.clock.stop(),
            VmAction::ClockSourceInternal => {
                self.clock.set_source(crate::clock::ClockSource::Internal);
            }
            VmAction::ClockSourceExternal { div } => {
                self.clock
                    .set_source(crate::clock::ClockSource::External { div });
            }
            VmAction::PulseOut { channel, width_s } => {
                let ch = channel as usize;
                self.pulse_ids[ch] = self.pulse_ids[ch].wrapping_add(1);
                if width_s <= 0.0 {
                    // Zero width: pulled low immediately.
                    self.state.pulse_out_level[ch].store(false, Ordering::Relaxed);
                    return;
                }
                self.state.pulse_out_level[ch].store(true, Ordering::Relaxed);
                if width_s > PULSE_WIDTH_HOLD_S {
                    // Held high indefinitely.
                    return;
                }
                if let Some(id) = self.clock.sleep(width_s as f64, &self.ends.clock_tx) {
                    self.resumes.insert(
                        id,
                        ResumeTarget::PulseRelease {
                            channel: ch,
                            pulse_id: self.pulse_ids[ch],
                        },
                    );
                }
            }
            VmAction::PulseSet { channel, level } => {
                let ch = channel as usize;
                self.pulse_ids[ch] = self.pulse_ids[ch].wrapping_add(1);
                self.state.pulse_out_level[ch].store(level, Ordering::Relaxed);
            }
            VmAction::Emit { code, value } => {
                let _ = self
                    .ends
                    .general_tx
                    .post(crate::fabric::event::GeneralEvent { code, value });
            }
            VmAction::Print(text) => self.send_line(&text),
        }
    }

    // ── Error surfacing ──────────────────────────────────────────────────

    fn report_vm_error(&mut self, err: VmError) {
        match err {
            VmError::Load(msg) => self.send_line(&format!("lua load error: {msg}")),
            VmError::Runtime(msg) => self.send_line(&format!("lua runtime error: {msg}")),
            VmError::OutOfMemory {
                requested,
                total,
                peak,
            } => {
                self.send_line("lua out of memory:");
                self.send_line(&format!("  requested: {requested} bytes"));
                self.send_line(&format!("  total:     {total} bytes"));
                self.send_line(&format!("  peak:      {peak} bytes"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::SimBench;
    use crate::clock::ClockScheduler;
    use crate::detect::Detector;
    use crate::fabric::event::{self, LinkEnds};
    use crate::slope;
    use crate::vm::{Hook, StubVm};
    use std::sync::Arc;

    struct Rig {
        dispatcher: Dispatcher,
        state: Arc<SharedState>,
        bench: Arc<SimBench>,
        link: LinkEnds,
        audio: event::AudioEnds,
        feeds: Vec<slope::SlopeFeed>,
    }

    fn rig(vm: StubVm) -> Rig {
        let bench = Arc::new(SimBench::new());
        let state = Arc::new(SharedState::new());
        let (audio, control, link, action_tx) = event::build();
        let detectors = [Arc::new(Detector::new()), Arc::new(Detector::new())];
        let metros = Arc::new(MetroBank::new(8_000));
        let (slopes, feeds) = slope::split(8_000, action_tx);
        let dbank = DetectorBank::new(detectors, 8_000);
        let dispatcher = Dispatcher::new(
            slopes,
            dbank,
            metros,
            ClockScheduler::new(),
            state.clone(),
            bench.clone() as Arc<dyn Bench>,
            control,
            Box::new(vm),
        );
        Rig {
            dispatcher,
            state,
            bench,
            link,
            audio,
            feeds,
        }
    }

    fn give_timer_ticks(state: &SharedState, ticks: u32) {
        state.timer_ticks_pending.store(ticks, Ordering::Relaxed);
    }

    #[test]
    fn metro_event_reaches_vm_hook() {
        let mut vm = StubVm::new();
        vm.on(
            Hook::Metro { id: 1 },
            vec![VmAction::SetVolts {
                channel: 0,
                volts: 2.0,
            }],
        );
        let mut r = rig(vm);
        r.audio
            .metro_tx
            .post(crate::fabric::event::MetroEvent { id: 1, stage: 1 });
        r.dispatcher.run_iteration();
        // The batched write went through the immediate-set cell.
        let jam = r.state.immediate.take().expect("batched write published");
        assert_eq!(jam[0], Some(2.0));
    }

    #[test]
    fn batched_writes_publish_all_channels_at_once() {
        let mut vm = StubVm::new();
        vm.on(
            Hook::Metro { id: 0 },
            vec![
                VmAction::SetVolts { channel: 0, volts: 1.0 },
                VmAction::SetVolts { channel: 1, volts: 2.0 },
                VmAction::SetVolts { channel: 2, volts: 3.0 },
                VmAction::SetVolts { channel: 3, volts: 4.0 },
            ],
        );
        let mut r = rig(vm);
        r.audio
            .metro_tx
            .post(crate::fabric::event::MetroEvent { id: 0, stage: 1 });
        r.dispatcher.run_iteration();
        let jam = r.state.immediate.take().unwrap();
        assert_eq!(jam, [Some(1.0), Some(2.0), Some(3.0), Some(4.0)]);
    }

    #[test]
    fn vm_runtime_error_is_reported_and_batch_still_flushes() {
        let mut vm = StubVm::new();
        vm.fail_next = Some(VmError::Runtime("attempt to index nil".into()));
        let mut r = rig(vm);
        r.dispatcher.eval_chunk("boom()");
        let msg = r.link.usb_tx_rx.get().expect("error line queued");
        let text = String::from_utf8_lossy(msg.as_slice()).into_owned();
        assert_eq!(text, "lua runtime error: attempt to index nil\n\r");
    }

    #[test]
    fn pulse_release_is_superseded_by_new_pulse() {
        let mut r = rig(StubVm::new());
        // First pulse, 10 ms.
        r.dispatcher.apply_action(VmAction::PulseOut {
            channel: 0,
            width_s: 0.01,
        });
        assert!(r.state.pulse_out_level[0].load(Ordering::Relaxed));
        // Second pulse before the first release fires.
        r.dispatcher.apply_action(VmAction::PulseOut {
            channel: 0,
            width_s: 10.0,
        });
        // Let the first release's sleep elapse.
        r.state.clock_ticks_pending.store(20, Ordering::Relaxed);
        r.dispatcher.run_iteration();
        // The stale release observed the id mismatch: still high.
        assert!(r.state.pulse_out_level[0].load(Ordering::Relaxed));
    }

    #[test]
    fn zero_width_pulse_is_low_immediately() {
        let mut r = rig(StubVm::new());
        r.dispatcher.apply_action(VmAction::PulseSet {
            channel: 1,
            level: true,
        });
        r.dispatcher.apply_action(VmAction::PulseOut {
            channel: 1,
            width_s: 0.0,
        });
        assert!(!r.state.pulse_out_level[1].load(Ordering::Relaxed));
    }

    #[test]
    fn clock_resume_routes_vm_ref_back() {
        let mut vm = StubVm::new();
        vm.on(
            Hook::ClockResume { vm_ref: 77 },
            vec![VmAction::Print("woke".into())],
        );
        let mut r = rig(vm);
        r.dispatcher.apply_action(VmAction::ClockSleep {
            seconds: 0.005,
            vm_ref: 77,
        });
        r.state.clock_ticks_pending.store(10, Ordering::Relaxed);
        r.dispatcher.run_iteration();
        let msg = r.link.usb_tx_rx.get().expect("print line");
        assert_eq!(String::from_utf8_lossy(msg.as_slice()), "woke\n\r");
    }

    #[test]
    fn cancelled_resume_never_reaches_vm() {
        let mut vm = StubVm::new();
        vm.on(
            Hook::ClockResume { vm_ref: 5 },
            vec![VmAction::Print("must not print".into())],
        );
        let mut r = rig(vm);
        r.dispatcher.apply_action(VmAction::ClockSleep {
            seconds: 0.005,
            vm_ref: 5,
        });
        r.dispatcher.apply_action(VmAction::ClockCancel { vm_ref: 5 });
        r.state.clock_ticks_pending.store(10, Ordering::Relaxed);
        r.dispatcher.run_iteration();
        assert!(r.link.usb_tx_rx.get().is_none());
    }

    #[test]
    fn switch_move_dispatches_at_poll_rate() {
        let mut vm = StubVm::new();
        vm.on(Hook::Switch, vec![VmAction::Print("flip".into())]);
        let mut r = rig(vm);
        r.bench.flip_switch(crate::bench::SwitchPos::Down);
        give_timer_ticks(&r.state, SWITCH_POLL_TICKS);
        r.dispatcher.run_iteration();
        let msg = r.link.usb_tx_rx.get().expect("switch event line");
        assert_eq!(String::from_utf8_lossy(msg.as_slice()), "flip\n\r");
    }

    #[test]
    fn full_reset_clears_kernel_state() {
        let mut r = rig(StubVm::new());
        r.dispatcher.metros.start(0, 0.1, -1);
        r.dispatcher.apply_action(VmAction::Noise {
            channel: 2,
            gain_mv: 1000,
            enable: true,
        });
        r.dispatcher.apply_action(VmAction::PulseSet {
            channel: 0,
            level: true,
        });
        r.dispatcher.full_reset();
        assert!(!r.dispatcher.metros.running(0));
        assert_eq!(r.state.noise.mask.load(Ordering::Relaxed), 0);
        assert!(!r.state.pulse_out_level[0].load(Ordering::Relaxed));
    }

    #[test]
    fn slope_chain_attack_release() {
        // toward(ch, 5, 0.1s) with a release continuation toward 0 over
        // 0.2s: the continuation fires exactly once, and the rendered
        // stream peaks at 5 V then returns to 0 V.
        let mut vm = StubVm::new();
        vm.on(
            Hook::SlopeAction { channel: 0 },
            vec![
                VmAction::Print("release".into()),
                VmAction::Toward {
                    channel: 0,
                    dest: 0.0,
                    time_s: 0.2,
                    shape: Shape::Linear,
                    action: None,
                },
            ],
        );
        let mut r = rig(vm);
        r.dispatcher.apply_action(VmAction::Toward {
            channel: 0,
            dest: 5.0,
            time_s: 0.1,
            shape: Shape::Linear,
            action: Some(1),
        });
        // Attack 800 samples + release 1600. Alternate dispatcher
        // iterations with audio-side consumption of the rendered lead.
        let mut peak = f32::MIN;
        let mut last = f32::MIN;
        for _ in 0..200 {
            r.dispatcher.run_iteration();
            for _ in 0..32 {
                last = r.feeds[0].consume().volts;
                peak = peak.max(last);
            }
            if !r.dispatcher.slopes.active(0) && r.dispatcher.slopes.dest(0) == 0.0 {
                break;
            }
        }
        assert!((peak - 5.0).abs() < 0.01, "peak {peak}");
        assert_eq!(r.dispatcher.slopes.dest(0), 0.0);
        // Drain any remaining release samples.
        r.dispatcher.run_iteration();
        for _ in 0..64 {
            last = r.feeds[0].consume().volts;
        }
        assert!(last.abs() < 0.01, "settled at {last}");
        // Exactly one continuation fired.
        let mut releases = 0;
        while let Some(msg) = r.link.usb_tx_rx.get() {
            if String::from_utf8_lossy(msg.as_slice()).contains("release") {
                releases += 1;
            }
        }
        assert_eq!(releases, 1);
    }
}
