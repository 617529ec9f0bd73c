//! Fennec ingest service.
//!
//! Polls the watch folders for video files, queues them for enrichment,
//! and drives the pipeline. Plain polling (no inotify) so network
//! mounts behave. The API server is a separate process sharing the
//! same database.
//!
//! ```bash
//! fennec-ingest              # run in the foreground
//! fennec-ingest --once       # one scan + drain cycle, then exit
//! ```

use anyhow::Result;
use std::path::PathBuf;

use fennec::config::Config;
use fennec::scheduler::Scheduler;
use fennec::{logging, models};

struct Args {
    once: bool,
    config_path: Option<PathBuf>,
}

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    let mut args = Args {
        once: false,
        config_path: None,
    };

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--once" | "-1" => {
                args.once = true;
            }
            "--config" | "-c" => {
                if i + 1 < argv.len() {
                    args.config_path = Some(PathBuf::from(&argv[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--version" | "-V" => {
                println!("fennec-ingest {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", argv[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    args
}

fn print_help() {
    println!(
        r#"fennec-ingest - video ingest and enrichment service

USAGE:
    fennec-ingest [OPTIONS]

OPTIONS:
    --once, -1          Run one scan + enrichment cycle and exit
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    FENNEC_CONFIG       Path to config file (overrides default location)
    WATCH_FOLDERS       Comma-separated absolute paths to scan
    FENNEC_LOG          Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/fennec/config.toml

Runtime switches (indexer state, poll interval, model toggles, search
thresholds) live in the database config table and can be changed from
the UI while the service runs."#
    );
}

fn main() -> Result<()> {
    let args = parse_args();

    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    models::set_models_dir(config.models_dir.clone());
    std::fs::create_dir_all(&config.posters_dir)?;

    let mut scheduler = Scheduler::new(config)?;
    scheduler.run(args.once)
}
