//! Daemon evaluating telemetry rules and producing alerts.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vigil_core::config::Config;
use vigil_engine::runtime::spawn_engine;
use vigil_transport::{Bus, MailboxRegistry};

/// Default configuration file location.
const CONFIG_FILE: &str = "/etc/vigil/engine.toml";

#[derive(Parser, Debug)]
#[command(name = "vigil-engine", about = "Daemon evaluating rules and producing alerts")]
struct Args {
    /// Use a custom config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(config: &Config, verbose: bool) {
    let directive = if verbose {
        "debug".to_string()
    } else if !config.log.config.is_empty() {
        config.log.config.clone()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    // An explicit config file must load; the default one may be absent.
    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("vigil-engine: cannot load {}: {}", path.display(), e);
                return ExitCode::from(2);
            }
        },
        None => Config::load(std::path::Path::new(CONFIG_FILE)).unwrap_or_default(),
    };

    init_tracing(&config, args.verbose);
    config.log_summary();

    let bus = Bus::new();
    let mailboxes = MailboxRegistry::new();
    let actors = match spawn_engine(&config, bus, mailboxes) {
        Ok(actors) => actors,
        Err(e) => {
            error!(error = %e, "engine initialization failed");
            return ExitCode::from(2);
        }
    };

    info!("vigil-engine running, press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for shutdown signal");
    }
    info!("shutdown requested, draining actors");
    actors.shutdown().await;
    ExitCode::SUCCESS
}
