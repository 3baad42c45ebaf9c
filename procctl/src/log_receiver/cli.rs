// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::info;
use procctl_wire::{DEFAULT_MAX_FRAME_LEN, DEFAULT_TCP_LOGGING_PORT};
use signal_hook::consts::signal::{SIGINT, SIGTERM};

use super::server::LogReceiver;
use crate::config::ReceiverConfig;

#[derive(Debug, Parser)]
#[command(author, version, about = "Receives streamed log records and stores them in rotating files")]
pub struct ReceiverArgs {
    /// Address to listen on
    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(long, default_value_t = DEFAULT_TCP_LOGGING_PORT)]
    port: u16,

    /// Directory for the log files
    #[arg(long, default_value = ".")]
    log_dir: PathBuf,

    /// Files are named <PREFIX>.<logger name>.log
    #[arg(long, value_name = "PREFIX", default_value = "procctl")]
    file_prefix: String,

    /// Rotation interval in seconds
    #[arg(long, default_value_t = 3600)]
    rotate_secs: u64,

    /// How often the accept loop checks for a stop request, in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,

    /// Frames announcing more bytes than this drop the connection
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_len: usize,

    /// Write every record under this logger name instead of its own
    #[arg(long)]
    logname: Option<String>,
}

impl From<ReceiverArgs> for ReceiverConfig {
    fn from(args: ReceiverArgs) -> Self {
        ReceiverConfig {
            host: args.host,
            port: args.port,
            log_dir: args.log_dir,
            file_prefix: args.file_prefix,
            rotation_secs: args.rotate_secs,
            poll_interval_ms: args.poll_ms,
            max_frame_len: args.max_frame_len,
            logname: args.logname,
        }
    }
}

/// Entry point of the receiver binaries.
pub fn cli_main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config: ReceiverConfig = ReceiverArgs::parse().into();
    let endpoint = config.endpoint();
    let mut receiver = LogReceiver::bind(config)
        .with_context(|| format!("failed to listen on {endpoint}"))?;

    let abort = receiver.stop_handle();
    for sig in [SIGTERM, SIGINT] {
        signal_hook::flag::register(sig, abort.clone())
            .with_context(|| format!("failed to register handler for signal {sig}"))?;
    }

    info!("About to start TCP log receiver on {}", receiver.local_addr()?);
    receiver.serve_until_stopped()?;
    Ok(())
}
