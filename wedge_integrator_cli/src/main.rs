//! # wedge_integrator_cli
//!
//! Part of the wedge_integrator crate family.
//!
//! Command line front end of the wedge integrator. Each configuration file given
//! with `-p` describes one dataset; every dataset is followed and integrated on its
//! own worker thread with a progress bar of its own.
//!
//! ## Use
//!
//! ```bash
//! wedge_integrator_cli -p lyso_1.yml -p lyso_2.yml
//! ```
//!
//! A template configuration is written with
//!
//! ```bash
//! wedge_integrator_cli -p template.yml new
//! ```
//!
//! Log output goes to the terminal and to `wedge_integrator.log`.
use clap::{Arg, ArgAction, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use libwedge_integrator::config::Config;
use libwedge_integrator::error::ProcessorError;
use libwedge_integrator::process::process_dataset;
use libwedge_integrator::results::ResultRecord;
use libwedge_integrator::worker_status::{BarColor, WorkerStatus};

const LOG_FILE: &str = "wedge_integrator.log";

fn make_template_config(path: &Path) {
    let config = Config::default();
    match config.write_config_file(path) {
        Ok(()) => log::info!("Done."),
        Err(e) => log::error!("Could not write the template config: {e}"),
    }
}

fn bar_style(color: BarColor) -> ProgressStyle {
    let template = match color {
        BarColor::CYAN => "{prefix:>14} {msg:>9} [{bar:40.cyan/blue}] {percent:>3}%",
        BarColor::MAGENTA => "{prefix:>14} {msg:>9} [{bar:40.magenta/blue}] {percent:>3}%",
        BarColor::RED => "{prefix:>14} {msg:>9} [{bar:40.red/blue}] {percent:>3}%",
        BarColor::GREEN => "{prefix:>14} {msg:>9} [{bar:40.green/blue}] {percent:>3}%",
    };
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn update_bar(bar: &ProgressBar, status: &WorkerStatus) {
    bar.set_style(bar_style(status.color));
    bar.set_message(status.stage.label());
    bar.set_position((status.progress.clamp(0.0, 1.0) * 100.0) as u64);
}

fn main() {
    // Create a cli
    let matches = Command::new("wedge_integrator_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .action(ArgAction::Append)
                .required(true)
                .help("Path to a dataset configuration file; may be repeated"),
        )
        .get_matches();

    // Initialize feedback
    let log_file = File::create(LOG_FILE).expect("Could not create the log file!");
    let logger = simplelog::CombinedLogger::new(vec![
        simplelog::TermLogger::new(
            simplelog::LevelFilter::Info,
            simplelog::Config::default(),
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        ),
        simplelog::WriteLogger::new(
            simplelog::LevelFilter::Debug,
            simplelog::Config::default(),
            log_file,
        ),
    ]);

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");
    log::set_max_level(log::LevelFilter::Debug);

    // Parse the cli
    let config_paths: Vec<PathBuf> = matches
        .get_many::<String>("path")
        .expect("We require args")
        .map(PathBuf::from)
        .collect();

    if let Some(("new", _)) = matches.subcommand() {
        for path in config_paths.iter() {
            log::info!("Making a template config at {}...", path.to_string_lossy());
            make_template_config(path);
        }
        return;
    }

    // Load our configs, one worker per dataset
    let (tx, rx) = mpsc::channel::<WorkerStatus>();
    let mut bars: Vec<ProgressBar> = Vec::new();
    let mut workers: Vec<(String, JoinHandle<Result<ResultRecord, ProcessorError>>)> = Vec::new();
    for path in config_paths.iter() {
        log::info!("Loading config from {}...", path.to_string_lossy());
        let config = match Config::read_config_file(path) {
            Ok(c) => c,
            Err(e) => {
                log::error!("{e}");
                continue;
            }
        };
        let name = config.results_name();
        log::info!("Dataset {name}: {:?}", config.command);
        log::info!("Images: {}", config.run.directory.to_string_lossy());
        log::info!(
            "First image: {} Total images: {}",
            config.run.start,
            config.run.total
        );
        log::info!("Work directory: {}", config.work_directory.to_string_lossy());

        // Setup the progress bar
        let worker_id = bars.len();
        let bar = pb_manager.add(ProgressBar::new(100));
        bar.set_prefix(name.clone());
        update_bar(&bar, &WorkerStatus::default());
        bars.push(bar);

        // Spawn the task!
        let worker_tx = tx.clone();
        workers.push((
            name,
            std::thread::spawn(move || process_dataset(&config, &worker_tx, &worker_id)),
        ));
    }
    drop(tx);

    if workers.is_empty() {
        log::error!("No dataset could be started.");
        return;
    }

    loop {
        std::thread::sleep(Duration::from_millis(250));
        loop {
            match rx.try_recv() {
                Ok(status) => {
                    if let Some(bar) = bars.get(status.worker_id) {
                        update_bar(bar, &status);
                    }
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => break,
            }
        }

        if workers.iter().all(|(_, handle)| handle.is_finished()) {
            break;
        }
    }

    for (name, handle) in workers {
        match handle.join() {
            Ok(Ok(record)) if record.is_success() => {
                log::info!("Successfully integrated {name}!")
            }
            Ok(Ok(record)) => log::error!(
                "Integration of {name} failed: {}",
                record.reason.as_deref().unwrap_or("unknown reason")
            ),
            Ok(Err(e)) => log::error!("Integration of {name} failed with error: {e}"),
            Err(_) => log::error!("Failed to join the worker for {name}!"),
        }
    }

    for bar in bars.iter() {
        bar.finish();
    }

    log::info!("Done.");
}
