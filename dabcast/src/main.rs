//! dabcast: listen to DAB+ programs through the shared receiver controller.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use log::{error, info, warn};
use serde::Serialize;

use dabcast::config::{
    BackendKind, ConfigFile, DEFAULT_LOG_DIR, DEFAULT_LOG_RETENTION_DAYS,
};
use dabcast::logging;
use dabcast::radio::{AbortReason, DabDevice, RadioController};
use dabcast_types::{ChannelStatus, DecoderErrors};

/// dabcast - shared DAB+ receiver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long, global = true)]
    config: Option<PathBuf>,

    /// Engine backend (overrides the configuration file)
    #[arg(short, long, value_enum, global = true)]
    backend: Option<BackendKind>,

    /// Receiver device name
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long, global = true)]
    log_retention_days: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the channels the engine can tune to
    Channels,

    /// Subscribe to a program and report what is received
    Listen {
        /// Channel to tune, e.g. 5C
        #[arg(short, long)]
        channel: String,

        /// Program name as announced in the ensemble
        #[arg(short, long)]
        program: String,

        /// How long to listen
        #[arg(short, long, default_value = "10")]
        seconds: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct ListenReport {
    channel: String,
    program: String,
    service_id: String,
    frames: u64,
    bytes: u64,
    audio_format: Option<(u32, String)>,
    dynamic_label: Option<String>,
    errors: DecoderErrors,
    status: Option<ChannelStatus>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (file_config, config_path) = match ConfigFile::discover(args.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Failed to load config file: {}", e);
            return Err(e.into());
        }
    };

    // Command line takes precedence over the file
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
    let retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(DEFAULT_LOG_RETENTION_DAYS);
    logging::init_logging(
        &log_dir,
        retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    if let Some(path) = &config_path {
        info!("Loaded config from: {}", path.display());
    }

    let backend = file_config.backend(args.backend);
    let mut device_config = file_config.device.to_config();
    if let Some(device) = args.device.clone() {
        device_config.device_name = device;
    }

    match args.command {
        Command::Channels => {
            for channel in backend.all_channel_names() {
                println!("{}", channel);
            }
            Ok(())
        }
        Command::Listen {
            channel,
            program,
            seconds,
            json,
        } => {
            let device = Arc::new(DabDevice::open(backend, &device_config));
            if !device.is_usable() {
                error!("No usable receiver, try --backend simulated");
                return Err("receiver unavailable".into());
            }
            let controller = RadioController::new(device, file_config.controller.to_config());

            let result = listen(&controller, &channel, &program, Duration::from_secs(seconds)).await;
            controller.shutdown().await;

            let report = result?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(())
        }
    }
}

async fn listen(
    controller: &RadioController,
    channel: &str,
    program: &str,
    duration: Duration,
) -> Result<ListenReport, Box<dyn std::error::Error>> {
    info!("Subscribing to {} on {}", program, channel);
    let abort = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        AbortReason::Cancelled
    };
    let handler = controller
        .subscribe_program_until(channel, program, abort)
        .await?;

    let mut frames = 0u64;
    let mut bytes = 0u64;
    let mut stream = Box::pin(handler.audio_stream());
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            frame = stream.next() => match frame {
                Some(frame) => {
                    frames += 1;
                    bytes += frame.data.len() as u64;
                }
                None => {
                    warn!("Program {} was released", program);
                    break;
                }
            },
        }
    }

    let report = ListenReport {
        channel: channel.to_string(),
        program: program.to_string(),
        service_id: handler.service_id().to_string(),
        frames,
        bytes,
        audio_format: handler.audio_format(),
        dynamic_label: handler.dynamic_label(),
        errors: handler.decoder_errors(),
        status: controller.status(),
    };
    controller.unsubscribe_program(program);
    Ok(report)
}

fn print_report(report: &ListenReport) {
    println!(
        "{} on {} ({}): {} frames, {} bytes",
        report.program, report.channel, report.service_id, report.frames, report.bytes
    );
    if let Some((rate, mode)) = &report.audio_format {
        println!("  format: {} Hz, {}", rate, mode);
    }
    if let Some(label) = &report.dynamic_label {
        println!("  label: {}", label);
    }
    if let Some(status) = &report.status {
        println!(
            "  ensemble: {}",
            status.ensemble_label.as_deref().unwrap_or("(unknown)")
        );
        for p in &status.programs {
            println!(
                "    {} {:<16} subscribers={}",
                p.service_id,
                p.name.as_deref().unwrap_or("?"),
                p.subscribers
            );
        }
    }
    let e = &report.errors;
    println!(
        "  errors: frame={} rs={}/{} aac={}",
        e.frame_errors, e.rs_uncorrected, e.rs_corrected, e.aac_errors
    );
}
