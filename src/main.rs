use chrono::NaiveDate;
use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

mod archive;
mod config;
mod device_map;
mod fetch;
mod parser;
mod pipeline;

use config::RunDates;
use device_map::DeviceMap;
use fetch::HttpFetcher;
use pipeline::Pipeline;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel { Error, Warn, Info, Debug, Trace }

#[derive(Parser, Debug)]
#[command(
    name = "aicollect",
    about = "Daily device log collector and per-device CSV reporter",
    long_about = "Downloads diagnostic log archives from the configured devices, extracts and \
                  classifies yesterday's detection records, and writes one CSV report per device."
)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, short = 'c', default_value = "config.json")]
    config: PathBuf,
    /// Path to the device classification table (optional)
    #[arg(long, default_value = "device_config.json")]
    device_config: PathBuf,
    /// Collect this data date instead of yesterday (YYYY-MM-DD)
    #[arg(long)]
    date: Option<NaiveDate>,
    #[arg(long)]
    log_level: Option<LogLevel>,
    #[arg(long)]
    log_path: Option<String>,
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
    #[arg(short = 'q', long, default_value_t = false)]
    quiet: bool,
    #[arg(long, default_value_t = false)]
    progress: bool,
}

fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    if args.quiet {
        builder.filter_level(log::LevelFilter::Error);
    } else if let Some(lvl) = args.log_level {
        let f = match lvl { LogLevel::Error => log::LevelFilter::Error, LogLevel::Warn => log::LevelFilter::Warn, LogLevel::Info => log::LevelFilter::Info, LogLevel::Debug => log::LevelFilter::Debug, LogLevel::Trace => log::LevelFilter::Trace };
        builder.filter_level(f);
    } else if args.verbose >= 2 {
        builder.filter_level(log::LevelFilter::Debug);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }
    if let Some(path) = args.log_path.as_ref() {
        match std::fs::File::create(path) {
            Ok(f) => { builder.target(env_logger::Target::Pipe(Box::new(f))); }
            Err(e) => { eprintln!("Failed to open log file {}: {}", path, e); }
        }
    }
    builder.init();
}

fn main() {
    let args = Args::parse();
    init_logging(&args);

    // The only fatal failure: without config there is no work to do.
    let cfg = match config::load_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            log::error!("Fatal: {:#}", e);
            std::process::exit(1);
        }
    };

    let dates = RunDates::new(chrono::Local::now(), args.date);
    let device_map = DeviceMap::load(&args.device_config);

    if let Err(e) = std::fs::create_dir_all(&cfg.paths.download_dir) {
        log::error!("Fatal: cannot create download dir {}: {}", cfg.paths.download_dir.display(), e);
        std::process::exit(1);
    }

    let fetcher = match HttpFetcher::new(
        &cfg.devices.credentials.username,
        &cfg.devices.credentials.password,
        &cfg.paths.download_dir,
        &dates.run_date_str,
        Duration::from_secs(cfg.execution.retry_delay_secs),
        args.progress,
    ) {
        Ok(f) => f,
        Err(e) => {
            log::error!("Fatal: cannot build HTTP client: {:#}", e);
            std::process::exit(1);
        }
    };

    let start = std::time::Instant::now();
    log::info!(
        "Starting collection run (run time: {}, data date: {})",
        dates.run_datetime.format("%Y-%m-%d %H:%M:%S"),
        dates.data_date_str
    );

    let pipeline = Pipeline {
        addresses: cfg.devices.ips.clone(),
        max_workers: cfg.execution.max_workers,
        download_dir: cfg.paths.download_dir.clone(),
        dates,
        device_map,
        fetcher: &fetcher,
    };
    let report = pipeline.run();

    let failed_fetches = report
        .per_address
        .values()
        .filter(|s| **s == pipeline::AddressState::FetchFailed)
        .count();
    log::info!(
        "Run finished in {:.2}s: {} devices reported, {} records, {} addresses unreachable.",
        start.elapsed().as_secs_f64(),
        report.devices_written,
        report.total_records,
        failed_fetches
    );
}
