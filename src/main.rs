mod audio;
mod bench;
mod clock;
mod config;
mod control;
mod detect;
mod dispatch;
mod fabric;
mod link;
mod metro;
mod repl;
mod slope;
mod vm;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;

use audio::AudioEngine;
use bench::{Bench, SimBench};
use clock::ClockScheduler;
use config::Config;
use control::{ControlLoop, ShellCmd, ShellStatus};
use detect::{Detector, DetectorBank};
use dispatch::Dispatcher;
use fabric::state::SharedState;
use metro::MetroBank;
use repl::store::ScriptStore;
use vm::StubVm;

const USAGE: &str = "\
corvid: CV module firmware emulator

USAGE:
    corvid [OPTIONS]

OPTIONS:
    --port <N>       TCP port for the ^^ REPL link (default 6666, 0 = auto)
    --script <FILE>  run a script at boot, as if uploaded
    --config <FILE>  read settings from FILE instead of the config dir
    --listen         mirror the audio-range outputs to the sound card
    --headless       keep the flash image in memory only
    --public-view    emit the ^^pubview monitoring stream
    -h, --help       show this help
";

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{USAGE}");
        return;
    }

    let config_file = arg_value(&args, "--config").map(std::path::PathBuf::from);
    let mut config = Config::load(config_file.as_deref());
    if let Some(p) = arg_value(&args, "--port").and_then(|v| v.parse().ok()) {
        config.port = p;
    }
    if args.iter().any(|a| a == "--listen") {
        config.listen = true;
    }
    if args.iter().any(|a| a == "--public-view") {
        config.public_view = true;
    }
    let headless = args.iter().any(|a| a == "--headless");
    let script_file = arg_value(&args, "--script");

    eprintln!(
        "[corvid] {}: port={}, listen={}, headless={}",
        control::FIRMWARE_VERSION,
        config.port,
        config.listen,
        headless,
    );

    // ── Shared state & fabric ────────────────────────────────────────────
    let state = Arc::new(SharedState::new());
    let bench = Arc::new(SimBench::with_id(host_name()));
    let (audio_ends, control_ends, link_ends, slope_action_tx) = fabric::event::build();
    let detectors = [Arc::new(Detector::new()), Arc::new(Detector::new())];
    let metros = Arc::new(MetroBank::new(audio::SAMPLE_RATE));
    let (slopes, feeds) = slope::split(audio::SAMPLE_RATE, slope_action_tx);

    let mut beat_clock = ClockScheduler::new();
    beat_clock.set_tempo(config.bpm);

    let flash_path = if headless { None } else { config.flash_file() };
    let identity = identity_hash(&bench.unique_id(), flash_path.as_deref());
    let store = ScriptStore::open(flash_path, state.clone());

    let mut dispatcher = Dispatcher::new(
        slopes,
        DetectorBank::new(
            [detectors[0].clone(), detectors[1].clone()],
            audio::SAMPLE_RATE,
        ),
        metros.clone(),
        beat_clock,
        state.clone(),
        bench.clone() as Arc<dyn Bench>,
        control_ends,
        Box::new(StubVm::new()),
    );
    dispatcher.public_view = config.public_view;

    // ── Audio domain ─────────────────────────────────────────────────────
    let listen_tx = if config.listen {
        let (tx, rx) = fabric::ring::channel::<(f32, f32)>(1024);
        match audio::listen::spawn_listen_thread(rx, state.clone()) {
            Ok(rate) => {
                eprintln!("[corvid] listening at {rate} Hz");
                Some(tx)
            }
            Err(e) => {
                log::error!("listen disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    let engine = AudioEngine::new(
        bench.clone() as Arc<dyn Bench>,
        state.clone(),
        detectors,
        metros,
        feeds,
        audio_ends,
        rand::random::<u32>() | 1,
    );
    let audio_thread = thread::Builder::new()
        .name("audio".into())
        .spawn(move || audio::run(engine, listen_tx))
        .expect("spawn audio thread");

    // ── Link ─────────────────────────────────────────────────────────────
    match link::spawn_tcp_link(config.port, link_ends, state.clone()) {
        Ok(port) => eprintln!("[corvid] REPL: nc 127.0.0.1 {port}"),
        Err(e) => log::error!("link disabled: {e}"),
    }

    // ── Control domain (this thread) ─────────────────────────────────────
    let (cmd_tx, cmd_rx) = bounded::<ShellCmd>(64);
    let (status_tx, status_rx) = bounded::<ShellStatus>(16);

    if let Some(path) = script_file {
        match std::fs::read_to_string(&path) {
            Ok(source) => {
                let _ = cmd_tx.send(ShellCmd::LoadScript(source));
            }
            Err(e) => {
                eprintln!("[corvid] cannot read {path}: {e}");
            }
        }
    }

    let control = ControlLoop::new(
        dispatcher,
        store,
        bench as Arc<dyn Bench>,
        state.clone(),
        identity,
        cmd_rx,
        status_tx,
    );
    control.run();

    // ── Shutdown ─────────────────────────────────────────────────────────
    state.shutdown.store(true, Ordering::Release);
    if let Some(status) = status_rx.try_iter().last() {
        log::info!(
            "final status: {} iterations, audio worst {} µs, {} overruns, {} underruns",
            status.iterations,
            status.audio_worst_us,
            status.audio_overruns,
            status.slope_underruns,
        );
    }
    let _ = audio_thread.join();
    eprintln!("[corvid] bye");
}

fn arg_value(args: &[String], key: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == key).map(|w| w[1].clone())
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "corvid-host".to_string())
}

/// Stable device id: 16 hex chars derived once at boot.
fn identity_hash(host: &str, flash: Option<&std::path::Path>) -> String {
    let mut seed = host.to_string();
    if let Some(p) = flash {
        seed.push_str(&p.to_string_lossy());
    }
    let digest = md5::compute(seed.as_bytes());
    format!("{digest:x}")[..16].to_string()
}
