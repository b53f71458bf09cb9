//! simbus-registry — rendezvous service for a simulation run
//!
//! Exit codes: 0 on success, -1 on argument errors, -2 on configuration
//! errors, -3 on any other failure. SIGINT/SIGTERM trigger graceful
//! teardown.

use clap::Parser;
use rand::Rng;
use simbus::config::{LogLevel, ParticipantConfiguration};
use simbus::net::Registry;
use simbus::services::logging;
use std::path::{Path, PathBuf};
use std::process::exit;
use tracing::{error, info, warn};

const EXIT_OK: i32 = 0;
const EXIT_ARGUMENT_ERROR: i32 = -1;
const EXIT_CONFIGURATION_ERROR: i32 = -2;
const EXIT_FAILURE: i32 = -3;

#[derive(Parser)]
#[command(
    name = "simbus-registry",
    version,
    about = "Registry for the simbus co-simulation middleware"
)]
struct Args {
    /// The silkit:// URI the registry should listen on
    #[arg(short = 'u', long, default_value = "silkit://localhost:8500")]
    listen_uri: String,

    /// Log to stdout with the given level
    #[arg(short = 'l', long, default_value = "info")]
    log: String,

    /// Configuration file applied to the registry itself
    #[arg(short = 'c', long)]
    registry_configuration: Option<PathBuf>,

    /// Write a configuration file whose registryUri is the effective listen URI
    #[arg(short = 'g', long)]
    generate_configuration: Option<PathBuf>,

    /// Dashboard URI (accepted for compatibility; the dashboard is unavailable)
    #[arg(short = 'd', long)]
    dashboard_uri: Option<String>,

    /// Change the working directory before doing anything else
    #[arg(short = 'C', long)]
    directory: Option<PathBuf>,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Help and version are not argument errors.
            use clap::error::ErrorKind;
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                let _ = e.print();
                exit(EXIT_OK);
            }
            let _ = e.print();
            exit(EXIT_ARGUMENT_ERROR);
        }
    };

    let Some(level) = LogLevel::parse(&args.log) else {
        eprintln!(
            "invalid log level '{}' (expected off, critical, error, warn, info, debug, trace)",
            args.log
        );
        exit(EXIT_ARGUMENT_ERROR);
    };

    if let Some(dir) = &args.directory {
        if let Err(e) = std::env::set_current_dir(dir) {
            eprintln!("cannot change directory to {}: {}", dir.display(), e);
            exit(EXIT_ARGUMENT_ERROR);
        }
    }

    logging::init_with_level(level);

    let config = match &args.registry_configuration {
        Some(path) => match ParticipantConfiguration::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("registry configuration rejected: {}", e);
                exit(EXIT_CONFIGURATION_ERROR);
            }
        },
        None => ParticipantConfiguration::default(),
    };

    if args.dashboard_uri.is_some() {
        warn!("the dashboard is not available in this build; --dashboard-uri is ignored");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("cannot start runtime: {}", e);
            exit(EXIT_FAILURE);
        }
    };

    let code = runtime.block_on(run(&args, &config));
    exit(code);
}

async fn run(args: &Args, config: &ParticipantConfiguration) -> i32 {
    let registry = match Registry::start(config, &args.listen_uri).await {
        Ok(registry) => registry,
        Err(e) => {
            error!("registry failed to start: {}", e);
            return EXIT_FAILURE;
        }
    };
    info!("listening on {}", registry.listen_uri());

    if let Some(path) = &args.generate_configuration {
        if let Err(e) = generate_configuration(path, registry.listen_uri()) {
            error!("cannot write generated configuration: {}", e);
            registry.shutdown();
            return EXIT_CONFIGURATION_ERROR;
        }
        info!("wrote configuration to {}", path.display());
    }

    registry.set_all_disconnected_handler(|| {
        info!("simulation is empty");
    });

    wait_for_signal().await;
    info!("signal received, exiting");
    registry.shutdown();
    EXIT_OK
}

/// Atomic write: a `<path>.<random>.tmp` sibling, then rename.
fn generate_configuration(path: &Path, listen_uri: &str) -> std::io::Result<()> {
    let mut config = ParticipantConfiguration::default();
    config.middleware.registry_uri = listen_uri.to_string();
    config.description = Some("Generated by simbus-registry".to_string());

    let is_json = path.extension().map(|e| e == "json").unwrap_or(false);
    let document = if is_json {
        serde_json::to_string_pretty(&config)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
    } else {
        serde_yaml::to_string(&config)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
    };

    let suffix: u32 = rand::thread_rng().gen();
    let tmp = path.with_extension(format!("{:08x}.tmp", suffix));
    std::fs::write(&tmp, document)?;
    std::fs::rename(&tmp, path)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
