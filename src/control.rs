// Control-domain main loop: bounded work per iteration. Drains the link
// RX ring into the REPL machine, executes commands against the script
// store and the VM, runs the dispatcher's ten priority steps, refreshes
// LEDs, and reports diagnostics. Communicates with the shell over
// crossbeam channels.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::bench::{Bench, NUM_LEDS};
use crate::dispatch::Dispatcher;
use crate::fabric::state::SharedState;
use crate::repl::store::{ScriptStore, Slot};
use crate::repl::{Command, Repl, ReplEvent};

pub const FIRMWARE_VERSION: &str = "corvid-1.0";

/// Welcome banner delay after boot.
const WELCOME_DELAY: Duration = Duration::from_millis(1500);

/// LED refresh cap.
const LED_PERIOD: Duration = Duration::from_millis(16);

/// At most one overrun diagnostic line per second.
const OVERRUN_REPORT_PERIOD: Duration = Duration::from_secs(1);

/// Commands from the shell thread.
#[derive(Debug, Clone)]
pub enum ShellCmd {
    /// Run a script as if uploaded over the link.
    LoadScript(String),
    PublicView(bool),
    Quit,
}

/// Periodic status back to the shell.
#[derive(Debug, Clone, Default)]
pub struct ShellStatus {
    pub iterations: u64,
    pub worst_iter_us: u32,
    pub audio_overruns: u32,
    pub audio_worst_us: u32,
    pub slope_underruns: u32,
    pub queue_drops: u32,
}

pub struct ControlLoop {
    dispatcher: Dispatcher,
    repl: Repl,
    store: ScriptStore,
    bench: Arc<dyn Bench>,
    state: Arc<SharedState>,
    identity: String,
    cmd_rx: Receiver<ShellCmd>,
    status_tx: Sender<ShellStatus>,

    booted_at: Instant,
    welcomed: bool,
    last_led: Instant,
    last_overrun_report: Instant,
    last_status: Instant,
    iterations: u64,
    worst_iter_us: u32,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dispatcher: Dispatcher,
        store: ScriptStore,
        bench: Arc<dyn Bench>,
        state: Arc<SharedState>,
        identity: String,
        cmd_rx: Receiver<ShellCmd>,
        status_tx: Sender<ShellStatus>,
    ) -> Self {
        let now = Instant::now();
        Self {
            dispatcher,
            repl: Repl::new(),
            store,
            bench,
            state,
            identity,
            cmd_rx,
            status_tx,
            booted_at: now,
            welcomed: false,
            last_led: now,
            last_overrun_report: now,
            last_status: now,
            iterations: 0,
            worst_iter_us: 0,
        }
    }

    pub fn run(mut self) {
        log::info!("control loop up");
        loop {
            let started = Instant::now();
            self.iterations += 1;

            // Link bytes → REPL framing → command/chunk handling.
            let mut events = Vec::new();
            while let Some(chunk) = self.dispatcher.recv_usb() {
                self.repl.feed(chunk.as_slice(), &mut events);
            }
            for event in events {
                self.handle_repl_event(event);
            }

            // One-shot welcome, then the stored script.
            if !self.welcomed && started.duration_since(self.booted_at) >= WELCOME_DELAY {
                self.welcomed = true;
                self.dispatcher
                    .send_line(&format!("{FIRMWARE_VERSION} up"));
                self.boot_script();
            }

            // ISR-overrun warning, one line per second.
            if self.state.diag.overrun_warn.swap(false, Ordering::Acquire)
                && started.duration_since(self.last_overrun_report) >= OVERRUN_REPORT_PERIOD
            {
                self.last_overrun_report = started;
                let count = self.state.diag.overrun_count.load(Ordering::Relaxed);
                let worst = self.state.diag.worst_case_us.load(Ordering::Relaxed);
                self.dispatcher.send_line(&format!(
                    "warning: audio callback overrun (count {count}, worst {worst} µs)"
                ));
            }

            // The ten dispatch priority steps.
            self.dispatcher.run_iteration();

            // LEDs at ≤ 60 Hz: four output activity LEDs + two pulse.
            if started.duration_since(self.last_led) >= LED_PERIOD {
                self.last_led = started;
                let outs = self.state.outputs.snapshot();
                for (i, mv) in outs.iter().enumerate().take(NUM_LEDS - 2) {
                    self.bench.set_led(i, mv.abs() > 500);
                }
                for ch in 0..2 {
                    self.bench
                        .set_led(4 + ch, self.state.pulse_out_level[ch].load(Ordering::Relaxed));
                }
            }

            let iter_us = started.elapsed().as_micros() as u32;
            if iter_us > self.worst_iter_us {
                self.worst_iter_us = iter_us;
            }

            if started.duration_since(self.last_status) >= Duration::from_secs(1) {
                self.last_status = started;
                self.push_status();
            }

            // Idle briefly; shell commands wake us early.
            match self.cmd_rx.recv_timeout(Duration::from_millis(1)) {
                Ok(ShellCmd::Quit) => break,
                Ok(cmd) => self.handle_shell_cmd(cmd),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }

        self.state.shutdown.store(true, Ordering::Release);
        log::info!(
            "control loop exiting after {} iterations (worst {} µs)",
            self.iterations,
            self.worst_iter_us,
        );
    }

    /// One synchronous iteration without the idle wait (test entry).
    pub fn step(&mut self) {
        let mut events = Vec::new();
        while let Some(chunk) = self.dispatcher.recv_usb() {
            self.repl.feed(chunk.as_slice(), &mut events);
        }
        for event in events {
            self.handle_repl_event(event);
        }
        self.dispatcher.run_iteration();
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    pub fn store(&self) -> &ScriptStore {
        &self.store
    }

    fn push_status(&mut self) {
        let status = ShellStatus {
            iterations: self.iterations,
            worst_iter_us: self.worst_iter_us,
            audio_overruns: self.state.diag.overrun_count.load(Ordering::Relaxed),
            audio_worst_us: self.state.diag.worst_case_us.load(Ordering::Relaxed),
            slope_underruns: self.state.diag.slope_underruns.load(Ordering::Relaxed),
            queue_drops: self.dispatcher.queue_drops(),
        };
        match self.status_tx.try_send(status) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn handle_shell_cmd(&mut self, cmd: ShellCmd) {
        match cmd {
            ShellCmd::LoadScript(source) => {
                self.dispatcher.full_reset();
                if self.dispatcher.run_script(&source) {
                    self.dispatcher.call_init();
                    self.dispatcher.send_line("^^ready()");
                }
            }
            ShellCmd::PublicView(enable) => self.dispatcher.public_view = enable,
            ShellCmd::Quit => unreachable!("handled in run()"),
        }
    }

    /// Load whatever the flash slot holds, at boot or after `^^k`.
    fn boot_script(&mut self) {
        match self.store.slot().clone() {
            Slot::User { source, name } => {
                log::info!(
                    "running user script{}",
                    name.as_deref()
                        .map(|n| format!(" '{n}'"))
                        .unwrap_or_default()
                );
                if self.dispatcher.run_script(&source) {
                    self.dispatcher.call_init();
                }
            }
            Slot::Default => {
                if self.dispatcher.load_default_script() {
                    self.dispatcher.call_init();
                }
            }
            Slot::Clear => {}
        }
    }

    // ── REPL event handling ──────────────────────────────────────────────

    fn handle_repl_event(&mut self, event: ReplEvent) {
        match event {
            ReplEvent::Command(cmd) => self.handle_command(cmd),
            ReplEvent::Chunk(chunk) => self.dispatcher.eval_chunk(&chunk),
            ReplEvent::Upload { source, to_flash } => self.finish_upload(source, to_flash),
            ReplEvent::UploadFailed { .. } => self.dispatcher.send_line("upload failed"),
            ReplEvent::ChunkTooLong => self.dispatcher.send_line("error: chunk too long"),
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Version => {
                self.dispatcher
                    .send_line(&format!("^^version('{FIRMWARE_VERSION}')"));
            }
            Command::Identity => {
                let id = self.identity.clone();
                self.dispatcher.send_line(&format!("^^identity('0x{id}')"));
            }
            Command::PrintScript => match self.store.slot() {
                Slot::User { name, .. } => {
                    let text = match name {
                        Some(n) => format!("Running: {n}"),
                        None => "Running: user script".to_string(),
                    };
                    self.dispatcher.send_line(&text);
                }
                _ => self.dispatcher.send_line("No user script."),
            },
            Command::ResetHint => {
                self.dispatcher
                    .send_line("power-cycle the module to reset, or send ^^k for a soft reset");
            }
            Command::Kill => {
                self.dispatcher.full_reset();
                self.boot_script();
                self.dispatcher.send_line("soft reset complete");
            }
            Command::Bootloader => {
                self.dispatcher
                    .send_line("this platform has no bootloader command; hold BOOT while powering on");
            }
            Command::StartUpload => self.dispatcher.send_line("script upload started"),
            // EndUpload / FlashUpload surface as Upload / UploadFailed
            // events; reaching here means no upload was in progress.
            Command::EndUpload | Command::FlashUpload => {
                self.dispatcher.send_line("no upload in progress");
            }
            Command::FlashClear => {
                match self.store.clear() {
                    Ok(()) => {
                        self.dispatcher.full_reset();
                        self.dispatcher.call_init();
                        self.dispatcher
                            .send_line("user script cleared; restart or ^^f for the default");
                    }
                    Err(e) => self.dispatcher.send_line(&e),
                }
            }
            Command::LoadDefault => {
                self.dispatcher.full_reset();
                if self.dispatcher.load_default_script() {
                    self.dispatcher.call_init();
                    self.dispatcher.send_line("default script loaded");
                }
            }
        }
    }

    fn finish_upload(&mut self, source: String, to_flash: bool) {
        // Identical reset for both endings: stop everything, clear
        // queues, fresh VM.
        self.dispatcher.full_reset();
        let ok = self.dispatcher.run_script(&source);
        if !ok {
            self.dispatcher.send_line("upload failed");
            return;
        }
        if to_flash {
            match self.store.save_user(&source) {
                Ok(()) => {
                    self.dispatcher.call_init();
                    let name = self.store.script_name().unwrap_or("user script");
                    self.dispatcher.send_line(&format!(
                        "{name} saved to flash ({} bytes); ^^k re-runs it",
                        source.len()
                    ));
                }
                Err(e) => {
                    self.dispatcher.send_line(&e);
                }
            }
        } else {
            self.dispatcher.call_init();
            self.dispatcher.send_line("^^ready()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::SimBench;
    use crate::clock::ClockScheduler;
    use crate::detect::{Detector, DetectorBank};
    use crate::fabric::event::{self, LinkEnds, RxChunk};
    use crate::metro::MetroBank;
    use crate::slope;
    use crate::vm::StubVm;
    use crossbeam_channel::bounded;

    struct Harness {
        control: ControlLoop,
        link: LinkEnds,
        state: Arc<SharedState>,
        feeds: Vec<slope::SlopeFeed>,
    }

    fn harness() -> Harness {
        let bench = Arc::new(SimBench::new());
        let state = Arc::new(SharedState::new());
        let (_audio, control_ends, link, action_tx) = event::build();
        let detectors = [Arc::new(Detector::new()), Arc::new(Detector::new())];
        let metros = Arc::new(MetroBank::new(8_000));
        let (slopes, feeds) = slope::split(8_000, action_tx);
        let dispatcher = Dispatcher::new(
            slopes,
            DetectorBank::new(detectors, 8_000),
            metros,
            ClockScheduler::new(),
            state.clone(),
            bench.clone() as Arc<dyn Bench>,
            control_ends,
            Box::new(StubVm::new()),
        );
        let store = ScriptStore::open(None, state.clone());
        let (_cmd_tx, cmd_rx) = bounded(4);
        let (status_tx, _status_rx) = bounded(4);
        let control = ControlLoop::new(
            dispatcher,
            store,
            bench as Arc<dyn Bench>,
            state.clone(),
            "00c0ffee00c0ffee".into(),
            cmd_rx,
            status_tx,
        );
        Harness {
            control,
            link,
            state,
            feeds,
        }
    }

    fn send(h: &mut Harness, bytes: &[u8]) {
        for chunk in bytes.chunks(event::RX_CHUNK_BYTES) {
            assert!(h.link.usb_rx_tx.post(RxChunk::from_slice(chunk)));
        }
    }

    fn read_lines(h: &mut Harness) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(msg) = h.link.usb_tx_rx.get() {
            lines.push(String::from_utf8_lossy(msg.as_slice()).into_owned());
        }
        lines
    }

    #[test]
    fn version_query_round_trip() {
        let mut h = harness();
        send(&mut h, b"^^v\n");
        h.control.step();
        assert_eq!(read_lines(&mut h), vec!["^^version('corvid-1.0')\n\r"]);
    }

    #[test]
    fn identity_query_uses_captured_id() {
        let mut h = harness();
        send(&mut h, b"^^i");
        h.control.step();
        assert_eq!(
            read_lines(&mut h),
            vec!["^^identity('0x00c0ffee00c0ffee')\n\r"]
        );
    }

    #[test]
    fn upload_happy_path_sets_output() {
        let mut h = harness();
        send(&mut h, b"^^s");
        h.control.step();
        assert_eq!(read_lines(&mut h), vec!["script upload started\n\r"]);

        send(&mut h, b"output[1].volts = 3\n");
        h.control.step();
        send(&mut h, b"^^e");
        h.control.step();
        let lines = read_lines(&mut h);
        assert!(lines.contains(&"^^ready()\n\r".to_string()), "{lines:?}");

        // The batched write is pending in the immediate-set cell.
        let jam = h.state.immediate.take().expect("voltage published");
        assert_eq!(jam[0], Some(3.0));
    }

    #[test]
    fn repeated_upload_is_idempotent() {
        let mut h = harness();
        for _ in 0..2 {
            send(&mut h, b"^^s");
            h.control.step();
            send(&mut h, b"output[2].volts = 1.5\n^^e");
            h.control.step();
        }
        let lines = read_lines(&mut h);
        assert_eq!(
            lines.iter().filter(|l| l.contains("^^ready()")).count(),
            2
        );
        // Identical observable state after each round.
        assert_eq!(h.control.dispatcher_mut().slopes.get_state(1), 1.5);
    }

    #[test]
    fn print_with_no_user_script() {
        let mut h = harness();
        send(&mut h, b"^^p");
        h.control.step();
        assert_eq!(read_lines(&mut h), vec!["No user script.\n\r"]);
    }

    #[test]
    fn kill_resets_and_acknowledges() {
        let mut h = harness();
        h.control.dispatcher_mut().metros.start(0, 0.1, -1);
        send(&mut h, b"^^k");
        h.control.step();
        assert!(!h.control.dispatcher_mut().metros.running(0));
        let lines = read_lines(&mut h);
        assert!(lines.iter().any(|l| l.contains("soft reset complete")));
    }

    #[test]
    fn bootloader_request_is_politely_rejected() {
        let mut h = harness();
        send(&mut h, b"^^b");
        h.control.step();
        let lines = read_lines(&mut h);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("no bootloader"));
    }

    #[test]
    fn eval_line_reaches_outputs_within_one_iteration() {
        let mut h = harness();
        send(&mut h, b"output[4].volts = -2\n");
        h.control.step();
        let jam = h.state.immediate.take().expect("published");
        assert_eq!(jam[3], Some(-2.0));
        // And the slope plan agrees.
        assert_eq!(h.control.dispatcher_mut().slopes.get_state(3), -2.0);
        let _ = &h.feeds;
    }

    #[test]
    fn upload_overflow_reports_failure() {
        let mut h = harness();
        send(&mut h, b"^^s");
        h.control.step();
        let big_line = vec![b'x'; 2000];
        for _ in 0..10 {
            send(&mut h, &big_line);
            send(&mut h, b"\n");
            h.control.step();
        }
        send(&mut h, b"^^e");
        h.control.step();
        let lines = read_lines(&mut h);
        assert!(
            lines.iter().any(|l| l.contains("upload failed")),
            "{lines:?}"
        );
    }
}
