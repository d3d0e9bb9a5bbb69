//! # DroneCAN Batch Updater CLI
//!
//! Unattended batch firmware updates for a fleet of CubePilot autopilots
//! and their DroneCAN peripherals:
//!
//! 1. **Phase A**: every cube found on a host serial port is coaxed into
//!    its bootloader and reflashed from the `.apj` bundles in the
//!    firmware directory.
//! 2. **Phase B**: every serial-tunnelled CAN adapter is scanned for
//!    vendor peripherals, which are then driven through the
//!    maintenance / flash / bootloader / restart sequence.
//!
//! This binary is a thin presentation layer over the
//! `dronecan-batch-updater-common` library: argument parsing with `clap`,
//! progress rendering with `indicatif`, and a per-session log file.

use clap::{Arg, ArgAction, Command};
use dronecan_batch_updater_common::cubepilot::batchupdater::{
    config::UpdaterConfig,
    orchestrator::BatchUpdater,
    progress::{DeviceState, ProgressBus, ProgressSnapshot},
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let matches = Command::new("dronecan-batch-updater")
        .version("0.1.0")
        .about("Batch firmware updater for CubePilot autopilots and DroneCAN peripherals")
        .arg(
            Arg::new("yes")
                .short('y')
                .long("yes")
                .help("Automatically answer yes to all prompts (non-interactive mode)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("skip-cube-update")
                .long("skip-cube-update")
                .help("Skip the Cube firmware update phase and go directly to DroneCAN monitoring")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("firmware-dir")
                .long("firmware-dir")
                .help("Root of the firmware tree (.apj bundles and per-device directories)")
                .default_value("firmware")
                .action(ArgAction::Set)
                .num_args(1),
        )
        .arg(
            Arg::new("can-bus")
                .long("can-bus")
                .help("CAN bus number(s) probed during Phase B discovery")
                .value_parser(clap::value_parser!(u8).range(1..))
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .help("Comma-separated list of serial ports to try instead of the platform defaults")
                .action(ArgAction::Set)
                .num_args(1),
        )
        .get_matches();

    init_logging();

    let mut config = UpdaterConfig {
        auto_yes: matches.get_flag("yes"),
        skip_cube_update: matches.get_flag("skip-cube-update"),
        firmware_dir: PathBuf::from(matches.get_one::<String>("firmware-dir").unwrap()),
        ..Default::default()
    };
    if let Some(buses) = matches.get_many::<u8>("can-bus") {
        config.can_buses = buses.copied().collect();
    }
    if let Some(ports) = matches.get_one::<String>("port") {
        config.ports = ports.split(',').map(|p| p.trim().to_string()).collect();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    let ctrlc_result = ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        handler_stop.store(true, Ordering::Relaxed);
    });
    if let Err(e) = ctrlc_result {
        log::warn!("could not install signal handler: {}", e);
    }

    let progress = Arc::new(ProgressBus::new());
    let done = Arc::new(AtomicBool::new(false));
    let renderer = spawn_renderer(progress.clone(), done.clone());

    let updater = BatchUpdater::new(config, progress, stop);
    let exit_code = updater.run();

    done.store(true, Ordering::Relaxed);
    let _ = renderer.join();

    std::process::exit(exit_code);
}

/// Routes the log facade into `logs/session_<epoch>.log` so the terminal
/// stays free for the progress display.
fn init_logging() {
    let logs_dir = PathBuf::from("logs");
    let _ = std::fs::create_dir_all(&logs_dir);

    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let log_path = logs_dir.join(format!("session_{}.log", stamp));

    let env = env_logger::Env::default().default_filter_or("info");
    match std::fs::File::create(&log_path) {
        Ok(file) => {
            env_logger::Builder::from_env(env)
                .format_timestamp_millis()
                .target(env_logger::Target::Pipe(Box::new(file)))
                .init();
        }
        Err(_) => {
            env_logger::Builder::from_env(env).init();
        }
    }
}

/// Renders progress snapshots with one bar per device plus the rolling
/// console output. The bus throttles redraws to 10 Hz.
fn spawn_renderer(bus: Arc<ProgressBus>, done: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let multi = MultiProgress::new();
        let style = ProgressStyle::default_bar()
            .template("{prefix:>30} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .unwrap()
            .progress_chars("=>-");
        let mut bars: HashMap<String, ProgressBar> = HashMap::new();
        let mut seen_console: u64 = 0;

        loop {
            let finished = done.load(Ordering::Relaxed);
            if bus.should_render() || finished {
                let snapshot = bus.snapshot();
                seen_console = print_new_console(&multi, &snapshot, seen_console);
                sync_bars(&multi, &style, &mut bars, &snapshot);
            }
            if finished {
                for bar in bars.values() {
                    bar.finish();
                }
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    })
}

fn print_new_console(multi: &MultiProgress, snapshot: &ProgressSnapshot, seen: u64) -> u64 {
    if snapshot.console_seq <= seen {
        return seen;
    }
    let new = (snapshot.console_seq - seen) as usize;
    let start = snapshot.console.len().saturating_sub(new);
    for line in &snapshot.console[start..] {
        let _ = multi.println(line);
    }
    snapshot.console_seq
}

fn sync_bars(
    multi: &MultiProgress,
    style: &ProgressStyle,
    bars: &mut HashMap<String, ProgressBar>,
    snapshot: &ProgressSnapshot,
) {
    // drop bars whose device row was removed (peer timeout, reindex)
    bars.retain(|id, bar| {
        if snapshot.devices.contains_key(id) {
            true
        } else {
            bar.finish_and_clear();
            multi.remove(bar);
            false
        }
    });

    for (id, row) in &snapshot.devices {
        let bar = bars.entry(id.clone()).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new(100));
            bar.set_style(style.clone());
            bar.set_prefix(format!("{} ({})", row.name, row.locator));
            bar
        });
        bar.set_position(row.progress as u64);
        let message = match (&row.state, &row.error) {
            (DeviceState::Failed, Some(error)) => format!("failed: {}", error),
            (state, _) => state.as_str().to_string(),
        };
        bar.set_message(message);
    }
}
