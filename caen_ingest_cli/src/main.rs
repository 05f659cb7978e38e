use clap::{Arg, ArgAction, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use libcaen_ingest::config::Config;
use libcaen_ingest::ledger::JobLedger;
use libcaen_ingest::process::process;
use libcaen_ingest::sink::RetryMode;

const LOG_FILE: &str = "./caen_ingest.log";

/// Send library logs to a file so they do not fight with the progress bar
fn init_file_logging() -> Result<(), spdlog::Error> {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from(LOG_FILE))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(false)
            .build()?,
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()?,
    );
    spdlog::set_default_logger(logger);
    Ok(())
}

/// Set the stop flag on Ctrl-C. The worker finishes its current chunk and leaves the file
/// pending.
fn install_stop_handler(stop: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                log::error!("Could not install the Ctrl-C handler: {e}");
                return;
            }
        };
        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            log::warn!("Stop requested, finishing the current chunk...");
            stop.store(true, Ordering::SeqCst);
        }
    });
}

fn show_status(config: &Config) {
    let ledger = match JobLedger::open(&config.ledger_path) {
        Ok(l) => l,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    let summary = ledger.summary();
    log::info!(
        "Ledger {}: {} done, {} pending, {} failed",
        ledger.path().to_string_lossy(),
        summary.done,
        summary.pending,
        summary.failed
    );
    for file in ledger.pending() {
        log::info!("  pending: {}", file.path.to_string_lossy());
    }
    for file in ledger.failed() {
        log::warn!("  failed: {}", file.path.to_string_lossy());
    }
}

fn reset_failed(config: &Config) {
    match JobLedger::open(&config.ledger_path).and_then(|mut ledger| ledger.reset_failed()) {
        Ok(count) => log::info!("Reset {count} failed files to pending."),
        Err(e) => log::error!("{e}"),
    }
}

fn run(config: Config, pb_manager: &MultiProgress) {
    log::info!("Source Path: {}", config.source_path.to_string_lossy());
    log::info!("Ledger Path: {}", config.ledger_path.to_string_lossy());
    log::info!(
        "Channels: {}",
        if config.channels.is_empty() {
            String::from("all")
        } else {
            format!("{:?}", config.channels)
        }
    );
    log::info!(
        "Tables: {:?} with prefix {}, particles: {:?}",
        config.table_layout,
        config.table_prefix,
        config.particles
    );
    log::info!("Retry Mode: {:?}", config.retry.mode);

    let stop = Arc::new(AtomicBool::new(false));
    install_stop_handler(stop.clone());

    let pb = pb_manager.add(ProgressBar::new(0));
    if let Ok(style) = ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} files {msg}") {
        pb.set_style(style);
    }
    let (tx, rx) = channel();
    // Spawn the task!
    let handle = std::thread::spawn(move || process(config, tx, stop));

    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(status) => {
                pb.set_length(status.files_total as u64);
                pb.set_position(status.files_done as u64);
                pb.set_message(status.current_file);
            }
            Err(RecvTimeoutError::Timeout) if !handle.is_finished() => (),
            Err(_) => break,
        }
    }
    pb.finish_and_clear();

    match handle.join() {
        Ok(Ok(summary)) => {
            log::info!(
                "Processed {} files ({} events), {} failed, {} skipped.",
                summary.processed,
                summary.events_written,
                summary.failed_now,
                summary.skipped
            );
            if !summary.pending.is_empty() {
                log::info!("{} files remain pending.", summary.pending.len());
            }
            for (path, partial) in summary.partially_written.iter() {
                log::warn!(
                    "{} is pending but {partial}; clear those rows before the next run.",
                    path.to_string_lossy()
                );
            }
            if !summary.failed.is_empty() {
                log::warn!(
                    "{} files have failed; run `status` to list them and `reset-failed` to retry them.",
                    summary.failed.len()
                );
            }
            if summary.store_unavailable {
                log::error!("Stopped early because the event store was unreachable.");
            }
        }
        Ok(Err(e)) => log::error!("Ingest failed with error: {e}"),
        Err(_) => log::error!("Failed to join ingest task!"),
    }
    log::info!("See {LOG_FILE} for details.");
}

fn make_template_config(path: &Path) {
    log::info!("Making a template config at {}...", path.to_string_lossy());
    match Config::default().write_config_file(path) {
        Ok(()) => log::info!("Done."),
        Err(e) => log::error!("{e}"),
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("caen_ingest_cli")
        .about("Reconstruct, classify and store CAEN digitizer events")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .help("Path to the configuration file"),
        )
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("run")
                .about("Process every pending file of the configured run folder")
                .arg(
                    Arg::new("start-time")
                        .long("start-time")
                        .help("Acquisition start (YYYY-MM-DD HH:MM:SS) used when no other source is found"),
                )
                .arg(
                    Arg::new("unattended")
                        .long("unattended")
                        .action(ArgAction::SetTrue)
                        .help("Retry the event store forever instead of giving up"),
                ),
        )
        .subcommand(Command::new("status").about("Show the state of the ledger"))
        .subcommand(Command::new("reset-failed").about("Mark every failed file as pending again"))
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    let pb_manager = MultiProgress::new();
    if let Err(e) = LogWrapper::new(pb_manager.clone(), logger).try_init() {
        eprintln!("Could not create logging/progress: {e}");
        return;
    }
    log::set_max_level(log::LevelFilter::Info);
    if let Err(e) = init_file_logging() {
        log::error!("Could not open the log file {LOG_FILE}: {e}");
        return;
    }

    // Parse the cli
    let Some(config_path) = matches.get_one::<String>("path").map(PathBuf::from) else {
        log::error!("A configuration path is required");
        return;
    };

    if let Some(("new", _)) = matches.subcommand() {
        make_template_config(&config_path);
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let mut config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");

    match matches.subcommand() {
        Some(("status", _)) => show_status(&config),
        Some(("reset-failed", _)) => reset_failed(&config),
        Some(("run", args)) => {
            if let Some(start) = args.get_one::<String>("start-time") {
                config.start_time_override = Some(start.clone());
            }
            if args.get_flag("unattended") {
                config.retry.mode = RetryMode::Unbounded;
            }
            if let Err(e) = config.start_time_override_ps() {
                log::error!("{e}");
                return;
            }
            run(config, &pb_manager);
        }
        _ => log::error!("Unknown subcommand"),
    }
}
