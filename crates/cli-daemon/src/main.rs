//! CLI entry point for the NVR presence daemon
//!
//! `check` validates the configuration and prints the resolved decoder
//! command for each camera. `run` starts the daemon.

use clap::{Parser, Subcommand};
use nvr_presence::config::CameraConfig;
use nvr_presence::{Config, Daemon, DaemonError, DetectionBatch};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Default log filter when RUST_LOG is not set
const DEFAULT_LOG_FILTER: &str = "nvr_presence=info,nvr_presence_config=info";

/// NVR presence daemon - tracks recognized faces and objects per camera
#[derive(Parser, Debug)]
#[command(name = "nvr-presence")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and print each camera's decoder command
    Check,
    /// Start the daemon
    Run {
        /// Read detection batches as JSON lines from stdin
        #[arg(long, default_value = "false")]
        detections_from_stdin: bool,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_camera(camera: &CameraConfig) {
    println!("{} ({})", camera.name(), camera.mqtt_name());
    println!("  hwaccel: {}", camera.hwaccel());
    match (camera.redacted_stream_url(), camera.decoder_args()) {
        (Ok(url), Ok(args)) => {
            // The password stays out of the printed command
            let args: Vec<String> = args
                .into_iter()
                .map(|arg| if arg.contains("://") { url.clone() } else { arg })
                .collect();
            println!("  stream: {}", url);
            println!("  decoder: ffmpeg {}", args.join(" "));
        }
        (Err(e), _) | (_, Err(e)) => println!("  error: {}", e),
    }
}

fn check(config: &Config) {
    println!("{} camera(s) configured", config.cameras.len());
    for camera in &config.cameras {
        print_camera(camera);
    }
    if let Some(face) = &config.face_recognition {
        println!("face_recognition: expire_after={}s", face.base.expire_after);
    }
    if let Some(object) = &config.object_detector {
        println!("object_detector: expire_after={}s", object.base.expire_after);
    }
}

/// Feed JSON-lines detection batches from stdin into the daemon
async fn feed_stdin(daemon: Arc<Daemon>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let batch: DetectionBatch = match serde_json::from_str(&line) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "Invalid detection batch");
                continue;
            }
        };
        match daemon.submit(batch).await {
            Ok(()) => {}
            Err(DaemonError::UnknownCamera(camera)) => warn!(camera = %camera, "Batch for unknown camera"),
            Err(e) => {
                error!(error = %e, "Daemon stopped accepting batches");
                break;
            }
        }
    }
    info!("Detection input closed");
}

async fn run(config: Config, detections_from_stdin: bool) -> ExitCode {
    let daemon = Arc::new(Daemon::new(config).await);
    if daemon.init_failures() > 0 {
        warn!(failed = daemon.init_failures(), "Some backends failed to initialize");
    }

    let runner = {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.run_with_server().await })
    };
    if detections_from_stdin {
        tokio::spawn(feed_stdin(daemon.clone()));
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down");
    daemon.shutdown();

    match runner.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            error!(error = %e, "Daemon error");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "Daemon task failed");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    match args.command {
        Command::Check => {
            check(&config);
            ExitCode::SUCCESS
        }
        Command::Run {
            detections_from_stdin,
        } => {
            info!(config = %args.config.display(), cameras = config.cameras.len(), "NVR presence daemon starting");
            run(config, detections_from_stdin).await
        }
    }
}
