// Script VM boundary. The Lua VM itself is an external collaborator: the
// kernel only talks to the `ScriptVm` trait below. Events flow in, and
// the VM answers with a list of actions the dispatcher applies inside an
// output batch, the same collect-then-apply shape the rest of the
// control loop uses everywhere.
//
// `StubVm` is the shipped implementation: a scripted double that records
// chunks, understands a few literal statement forms, and lets tests (and
// the shell) bind canned action lists to events. It is a stand-in for a
// real interpreter, not one.

use std::collections::HashMap;

use crate::detect::ModeSpec;
use crate::fabric::event::{DetectEvent, DetectKind};
use crate::slope::shape::Shape;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PulseInMode {
    Off,
    Change,
    Clock,
}

/// Read-only kernel snapshot handed to the VM with every call, so script
/// code can answer `.volts`-style queries without a second seam.
#[derive(Clone, Copy, Debug, Default)]
pub struct KernelView {
    pub output_volts: [f32; 4],
    pub input_volts: [f32; 2],
    pub input_connected: [bool; 2],
    pub knobs: [f32; 3],
    pub switch_position: u8,
    pub beats: f64,
    pub tempo: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
//  Events & actions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum VmEvent {
    /// Call `init()` if the script defines one.
    Init,
    Detect(DetectEvent),
    Metro { id: u8, stage: i32 },
    /// `vm_ref` is the VM-side registry key the script supplied when it
    /// scheduled the wake (the native coro id never crosses this seam).
    ClockResume { vm_ref: u32 },
    /// Advance the action sequence attached to an output channel.
    SlopeAction { channel: u8 },
    PulseChange { channel: u8, level: bool },
    /// Three-position switch moved (0 = up, 1 = middle, 2 = down).
    Switch { position: u8 },
    General { code: u32, value: f32 },
    /// The once-per-iteration "as soon as possible" hook.
    Asap,
}

#[derive(Clone, Debug)]
pub enum VmAction {
    SetVolts { channel: u8, volts: f32 },
    Toward {
        channel: u8,
        dest: f32,
        time_s: f32,
        shape: Shape,
        action: Option<u32>,
    },
    SetScale { channel: u8, degrees: Vec<f32>, modulo: f32, scaling: f32 },
    ClearScale { channel: u8 },
    Noise { channel: u8, gain_mv: i32, enable: bool },
    SetInputMode { channel: u8, spec: ModeSpec },
    SetPulseInMode { channel: u8, mode: PulseInMode },
    MetroStart { id: u8, interval_s: f32, count: i32 },
    MetroStop { id: u8 },
    MetroSetInterval { id: u8, interval_s: f32 },
    MetroSetCount { id: u8, stages: i32 },
    /// Park the coroutine registered under `vm_ref` until the wake fires.
    ClockSleep { seconds: f64, vm_ref: u32 },
    ClockSyncBeats { delta: f64, vm_ref: u32 },
    ClockSyncEvery { mult: f64, vm_ref: u32 },
    ClockCancel { vm_ref: u32 },
    ClockSetTempo { bpm: f64 },
    ClockStart { beat: f64 },
    ClockStop,
    ClockSourceInternal,
    ClockSourceExternal { div: u32 },
    PulseOut { channel: u8, width_s: f32 },
    PulseSet { channel: u8, level: bool },
    /// Re-post an event to the general queue for a later iteration.
    Emit { code: u32, value: f32 },
    Print(String),
}

#[derive(Clone, Debug)]
pub enum VmError {
    Load(String),
    Runtime(String),
    OutOfMemory { requested: usize, total: usize, peak: usize },
}

pub trait ScriptVm: Send {
    /// Load and run a whole script (protected call).
    fn load_script(
        &mut self,
        source: &str,
        view: &KernelView,
        out: &mut Vec<VmAction>,
    ) -> Result<(), VmError>;

    /// Evaluate one REPL chunk (single or multi line).
    fn eval(
        &mut self,
        chunk: &str,
        view: &KernelView,
        out: &mut Vec<VmAction>,
    ) -> Result<(), VmError>;

    /// Load the compiled built-in default script.
    fn load_default(&mut self, view: &KernelView, out: &mut Vec<VmAction>)
        -> Result<(), VmError>;

    /// Deliver an event to the script's registered callbacks.
    fn on_event(
        &mut self,
        event: VmEvent,
        view: &KernelView,
        out: &mut Vec<VmAction>,
    ) -> Result<(), VmError>;

    /// Whether the loaded script defines `init()`.
    fn has_init(&self) -> bool;

    /// Drop all script state.
    fn reset(&mut self);
}

// ─────────────────────────────────────────────────────────────────────────────
//  Stub implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Keys a test (or the built-in default script) can bind actions to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hook {
    Init,
    Detect { channel: u8 },
    Metro { id: u8 },
    ClockResume { vm_ref: u32 },
    SlopeAction { channel: u8 },
    PulseChange { channel: u8 },
    Switch,
    General { code: u32 },
    Asap,
}

pub struct StubVm {
    hooks: HashMap<Hook, Vec<VmAction>>,
    has_init: bool,
    /// Full source of the running script (for inspection).
    pub loaded_source: Option<String>,
    /// Every chunk evaluated, in order (for inspection).
    pub eval_log: Vec<String>,
    /// Events delivered, in order (for inspection).
    pub event_log: Vec<VmEvent>,
    /// When set, the next call fails with this error (error-path tests).
    pub fail_next: Option<VmError>,
}

impl StubVm {
    pub fn new() -> Self {
        Self {
            hooks: HashMap::new(),
            has_init: false,
            loaded_source: None,
            eval_log: Vec::new(),
            event_log: Vec::new(),
            fail_next: None,
        }
    }

    /// Bind an action list to a hook. Replaces any previous binding.
    pub fn on(&mut self, hook: Hook, actions: Vec<VmAction>) {
        if hook == Hook::Init {
            self.has_init = true;
        }
        self.hooks.insert(hook, actions);
    }

    fn take_failure(&mut self) -> Result<(), VmError> {
        match self.fail_next.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn run_hook(&mut self, hook: Hook, out: &mut Vec<VmAction>) {
        if let Some(actions) = self.hooks.get(&hook) {
            out.extend(actions.iter().cloned());
        }
    }

    /// Interpret the handful of literal statement forms the stub
    /// understands. Anything else is recorded and ignored.
    fn interpret_line(&mut self, line: &str, view: &KernelView, out: &mut Vec<VmAction>) {
        let line = line.trim();
        if line.is_empty() || line.starts_with("--") {
            return;
        }
        if line.starts_with("function init") {
            self.has_init = true;
            return;
        }
        // output[n].volts = v  |  output[n].volts  (query)
        if let Some(rest) = line.strip_prefix("output[") {
            if let Some((idx, tail)) = rest.split_once(']') {
                if let Ok(n) = idx.trim().parse::<u8>() {
                    if !(1..=4).contains(&n) {
                        return;
                    }
                    let tail = tail.trim();
                    if let Some(assign) = tail
                        .strip_prefix(".volts")
                        .map(str::trim)
                        .and_then(|t| t.strip_prefix('='))
                    {
                        if let Ok(v) = assign.trim().parse::<f32>() {
                            out.push(VmAction::SetVolts {
                                channel: n - 1,
                                volts: v,
                            });
                        }
                    } else if tail == ".volts" {
                        out.push(VmAction::Print(format!(
                            "{:.3}",
                            view.output_volts[(n - 1) as usize]
                        )));
                    }
                }
            }
            return;
        }
        // input[n].volts (query)
        if let Some(rest) = line.strip_prefix("input[") {
            if let Some((idx, tail)) = rest.split_once(']') {
                if let Ok(n) = idx.trim().parse::<u8>() {
                    if (1..=2).contains(&n) && tail.trim() == ".volts" {
                        out.push(VmAction::Print(format!(
                            "{:.3}",
                            view.input_volts[(n - 1) as usize]
                        )));
                    }
                }
            }
            return;
        }
        // print('…') / print("…")
        if let Some(arg) = line
            .strip_prefix("print(")
            .and_then(|t| t.strip_suffix(')'))
        {
            let text = arg.trim().trim_matches('\'').trim_matches('"');
            out.push(VmAction::Print(text.to_string()));
        }
    }
}

/// Default serial form for detection events, matching the host tooling's
/// `^^event(args…)` conventions. Channels are 1-based on the wire.
fn detect_line(ev: &DetectEvent) -> String {
    let ch = ev.channel + 1;
    match ev.kind {
        DetectKind::Stream => format!("^^stream({ch},{:.3})", ev.value),
        DetectKind::Change => format!("^^change({ch},{})", i32::from(ev.index > 0)),
        DetectKind::Window => format!("^^window({ch},{},{})", ev.index.abs(), i32::from(ev.index > 0)),
        DetectKind::Scale => format!(
            "^^scale({ch},{},{},{:.3})",
            ev.index, ev.note, ev.value
        ),
        DetectKind::Volume => format!("^^volume({ch},{:.3})", ev.value),
        DetectKind::Peak => format!("^^peak({ch})"),
        DetectKind::Frequency => format!("^^freq({ch},{:.3})", ev.value),
    }
}

impl Default for StubVm {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptVm for StubVm {
    fn load_script(
        &mut self,
        source: &str,
        view: &KernelView,
        out: &mut Vec<VmAction>,
    ) -> Result<(), VmError> {
        self.take_failure()?;
        self.loaded_source = Some(source.to_string());
        self.has_init = false;
        let lines: Vec<String> = source.lines().map(str::to_string).collect();
        for line in &lines {
            self.interpret_line(line, view, out);
        }
        Ok(())
    }

    fn eval(
        &mut self,
        chunk: &str,
        view: &KernelView,
        out: &mut Vec<VmAction>,
    ) -> Result<(), VmError> {
        self.take_failure()?;
        self.eval_log.push(chunk.to_string());
        let lines: Vec<String> = chunk.lines().map(str::to_string).collect();
        for line in &lines {
            self.interpret_line(line, view, out);
        }
        Ok(())
    }

    fn load_default(
        &mut self,
        _view: &KernelView,
        _out: &mut Vec<VmAction>,
    ) -> Result<(), VmError> {
        self.take_failure()?;
        // Built-in default: a blank patch with an init() that does nothing.
        self.loaded_source = Some("-- default".to_string());
        self.has_init = true;
        Ok(())
    }

    fn on_event(
        &mut self,
        event: VmEvent,
        _view: &KernelView,
        out: &mut Vec<VmAction>,
    ) -> Result<(), VmError> {
        self.take_failure()?;
        self.event_log.push(event.clone());
        let hook = match &event {
            VmEvent::Init => Hook::Init,
            VmEvent::Detect(ev) => Hook::Detect { channel: ev.channel },
            VmEvent::Metro { id, .. } => Hook::Metro { id: *id },
            VmEvent::ClockResume { vm_ref } => Hook::ClockResume { vm_ref: *vm_ref },
            VmEvent::SlopeAction { channel } => Hook::SlopeAction { channel: *channel },
            VmEvent::PulseChange { channel, .. } => Hook::PulseChange { channel: *channel },
            VmEvent::Switch { .. } => Hook::Switch,
            VmEvent::General { code, .. } => Hook::General { code: *code },
            VmEvent::Asap => Hook::Asap,
        };
        if let (VmEvent::Detect(ev), false) = (&event, self.hooks.contains_key(&hook)) {
            // No script callback registered: emit the default serial form.
            out.push(VmAction::Print(detect_line(ev)));
            return Ok(());
        }
        self.run_hook(hook, out);
        Ok(())
    }

    fn has_init(&self) -> bool {
        self.has_init
    }

    fn reset(&mut self) {
        self.hooks.clear();
        self.has_init = false;
        self.loaded_source = None;
        self.eval_log.clear();
        self.event_log.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> KernelView {
        KernelView::default()
    }

    #[test]
    fn volts_assignment_is_interpreted() {
        let mut vm = StubVm::new();
        let mut out = Vec::new();
        vm.eval("output[1].volts = 3", &view(), &mut out).unwrap();
        match &out[0] {
            VmAction::SetVolts { channel, volts } => {
                assert_eq!(*channel, 0);
                assert_eq!(*volts, 3.0);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn volts_query_prints_from_the_view() {
        let mut vm = StubVm::new();
        let mut v = view();
        v.output_volts[2] = 1.25;
        v.input_volts[0] = -0.5;
        let mut out = Vec::new();
        vm.eval("output[3].volts", &v, &mut out).unwrap();
        vm.eval("input[1].volts", &v, &mut out).unwrap();
        assert!(matches!(&out[0], VmAction::Print(s) if s == "1.250"));
        assert!(matches!(&out[1], VmAction::Print(s) if s == "-0.500"));
    }

    #[test]
    fn load_detects_init_definition() {
        let mut vm = StubVm::new();
        let mut out = Vec::new();
        vm.load_script("-- patch\nfunction init()\nend\n", &view(), &mut out)
            .unwrap();
        assert!(vm.has_init());
        vm.load_script("output[2].volts = 1", &view(), &mut out)
            .unwrap();
        assert!(!vm.has_init());
    }

    #[test]
    fn hooks_fire_for_matching_events() {
        let mut vm = StubVm::new();
        vm.on(
            Hook::Metro { id: 3 },
            vec![VmAction::PulseSet {
                channel: 0,
                level: true,
            }],
        );
        let mut out = Vec::new();
        vm.on_event(VmEvent::Metro { id: 2, stage: 1 }, &view(), &mut out)
            .unwrap();
        assert!(out.is_empty());
        vm.on_event(VmEvent::Metro { id: 3, stage: 1 }, &view(), &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn unhandled_detect_event_prints_serial_form() {
        let mut vm = StubVm::new();
        let ev = DetectEvent {
            channel: 0,
            kind: DetectKind::Stream,
            value: 2.5,
            timestamp: 0,
            index: 0,
            octave: 0,
            note: 0,
        };
        let mut out = Vec::new();
        vm.on_event(VmEvent::Detect(ev), &view(), &mut out).unwrap();
        assert!(matches!(&out[0], VmAction::Print(s) if s == "^^stream(1,2.500)"));
        // A registered hook replaces the default form.
        vm.on(Hook::Detect { channel: 0 }, vec![]);
        out.clear();
        vm.on_event(VmEvent::Detect(ev), &view(), &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn injected_failure_surfaces_once() {
        let mut vm = StubVm::new();
        vm.fail_next = Some(VmError::Runtime("boom".into()));
        let mut out = Vec::new();
        assert!(vm.eval("x = 1", &view(), &mut out).is_err());
        assert!(vm.eval("x = 1", &view(), &mut out).is_ok());
    }
}
