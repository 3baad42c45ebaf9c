// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Code that runs inside a worker process.
//!
//! A worker binary is started with `--invocation-base64 <BASE64>`, where the
//! payload is a JSON [`WorkerInvocation`]. In one-shot mode the worker runs a
//! single job, writes one [`WorkerReport`] to its channel and exits. In pool
//! mode it answers [`PoolRequest`]s until the controller closes the channel.

use std::io::BufReader;
use std::os::unix::net::UnixStream;

use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use clap::Parser;
use log::{debug, error};
use procctl_wire::{read_message, write_message, Level, DEFAULT_MAX_FRAME_LEN};
use serde::{Deserialize, Serialize};

use crate::config::Endpoint;
use crate::error::Error;
use crate::job::{JobArgs, JobOutcome, JobRegistry, JobSpec};
use crate::log_emitter::{install_facade, EmitError, LogContext, ProcessLogger};
use crate::process_tools::{self, WORKER_IPC_FD};

const INVOCATION_FLAG: &str = "--invocation-base64";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum WorkerMode {
    OneShot { args: JobArgs },
    Pool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInvocation {
    /// Process name, also the logger name of the worker.
    pub name: String,
    pub function: String,
    pub mode: WorkerMode,
    pub log_endpoint: Option<Endpoint>,
    pub log_level: Level,
}

impl WorkerInvocation {
    pub fn to_base64(&self) -> serde_json::Result<String> {
        Ok(BASE64_STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let json = BASE64_STANDARD
            .decode(encoded)
            .map_err(|e| Error::Invocation(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| Error::Invocation(e.to_string()))
    }
}

/// Result of a one-off process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub name: String,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRequest {
    pub task: u64,
    pub job: JobSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolResponse {
    pub task: u64,
    pub outcome: JobOutcome,
}

#[derive(Debug, Parser)]
#[command(about = "Runs jobs on behalf of a process controller")]
pub struct WorkerArgs {
    /// Invocation (base64-encoded JSON)
    #[arg(long = "invocation-base64", value_name = "BASE64")]
    pub invocation_base64: String,
}

/// Turns the current process into a worker if it was started as one.
/// Returns normally otherwise, so a program can use itself as its worker.
pub fn run_if_invoked(registry: &JobRegistry) {
    let invoked = std::env::args()
        .any(|arg| arg == INVOCATION_FLAG || arg.starts_with(&format!("{INVOCATION_FLAG}=")));
    if invoked {
        worker_main(registry);
    }
}

/// Entry point of dedicated worker binaries.
pub fn worker_main(registry: &JobRegistry) -> ! {
    let args = WorkerArgs::parse();
    let code = match WorkerInvocation::from_base64(&args.invocation_base64) {
        Ok(invocation) => run_worker(invocation, registry),
        Err(e) => {
            eprintln!("Error: {e}");
            2
        }
    };
    std::process::exit(code);
}

/// Runs an invocation and returns the exit code of the worker process:
/// 0 on success, 1 if the job failed, 2 if the worker could not talk to
/// its controller.
pub fn run_worker(invocation: WorkerInvocation, registry: &JobRegistry) -> i32 {
    let context = LogContext::with_process_name(
        invocation.log_endpoint.clone(),
        invocation.log_level,
        invocation.name.clone(),
    );
    init_process_logging(&context, &invocation.name);
    let logger = context.logger(&invocation.name);

    let stream = match process_tools::take_worker_ipc_stream() {
        Ok(stream) => stream,
        Err(e) => {
            error!("{}: no controller channel on fd {WORKER_IPC_FD}: {e}", invocation.name);
            return 2;
        }
    };

    match invocation.mode {
        WorkerMode::OneShot { args } => {
            let job = JobSpec {
                function: invocation.function,
                args,
            };
            run_one_shot(&invocation.name, job, registry, &logger, stream)
        }
        WorkerMode::Pool => serve_pool(&invocation.name, registry, &logger, stream),
    }
}

/// Job code logs through `log::*!`; route it to the receiver when there is one.
fn init_process_logging(context: &LogContext, name: &str) {
    if context.endpoint().is_some() {
        if let Err(e) = install_facade(context.emitter(name)) {
            eprintln!("{name}: {e}");
        }
    } else {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .try_init();
    }
}

fn lost(name: &str, result: Result<(), EmitError>) {
    if let Err(e) = result {
        eprintln!("{name}: {e}");
    }
}

fn run_one_shot(
    name: &str,
    job: JobSpec,
    registry: &JobRegistry,
    logger: &ProcessLogger,
    mut stream: UnixStream,
) -> i32 {
    lost(name, logger.info(format!("Running process {name}; waiting for results.")));
    let outcome = registry.run(&job);
    match &outcome {
        JobOutcome::Ok(_) => lost(
            name,
            logger.info("Ran target method, storing results and name of finished process."),
        ),
        JobOutcome::Failed(cause) => lost(name, logger.error(format!("{} failed: {cause}", job.function))),
    }

    let code = if outcome.is_ok() { 0 } else { 1 };
    let report = WorkerReport {
        name: name.to_string(),
        outcome,
    };
    if let Err(e) = write_message(&mut stream, &report) {
        lost(name, logger.error(format!("could not deliver the result: {e}")));
        return 2;
    }
    lost(name, logger.info(format!("Process {name} completed, exiting.")));
    code
}

fn serve_pool(name: &str, registry: &JobRegistry, logger: &ProcessLogger, stream: UnixStream) -> i32 {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            lost(name, logger.error(format!("could not clone the controller channel: {e}")));
            return 2;
        }
    };
    let mut reader = BufReader::new(stream);
    lost(name, logger.debug(format!("{name} waiting for jobs")));

    loop {
        let request: PoolRequest = match read_message(&mut reader, DEFAULT_MAX_FRAME_LEN) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                lost(name, logger.error(format!("broken controller channel: {e}")));
                return 2;
            }
        };
        debug!("{name} runs task {}", request.task);
        let outcome = registry.run(&request.job);
        if let JobOutcome::Failed(cause) = &outcome {
            lost(name, logger.error(format!("{} failed: {cause}", request.job.function)));
        }
        let response = PoolResponse {
            task: request.task,
            outcome,
        };
        if let Err(e) = write_message(&mut writer, &response) {
            lost(name, logger.error(format!("could not deliver task {}: {e}", request.task)));
            return 2;
        }
    }

    lost(name, logger.debug(format!("{name} channel closed, exiting")));
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invocation_survives_base64() {
        let invocation = WorkerInvocation {
            name: "Process-4".to_string(),
            function: "divide".to_string(),
            mode: WorkerMode::OneShot {
                args: JobArgs::Spread(vec![json!(1), json!(2)]),
            },
            log_endpoint: Some(Endpoint::new("127.0.0.1", 9021)),
            log_level: Level::Debug,
        };
        let encoded = invocation.to_base64().unwrap();
        assert_eq!(WorkerInvocation::from_base64(&encoded).unwrap(), invocation);

        let args = WorkerArgs::try_parse_from(["worker", "--invocation-base64", encoded.as_str()]).unwrap();
        assert_eq!(args.invocation_base64, encoded);
    }

    #[test]
    fn garbage_invocation_is_rejected() {
        assert!(matches!(
            WorkerInvocation::from_base64("not base64!"),
            Err(Error::Invocation(_))
        ));
        let not_json = BASE64_STANDARD.encode(b"{");
        assert!(matches!(
            WorkerInvocation::from_base64(&not_json),
            Err(Error::Invocation(_))
        ));
    }

    #[test]
    fn pool_mode_tag() {
        let json = serde_json::to_value(WorkerMode::Pool).unwrap();
        assert_eq!(json, json!({"mode": "pool"}));
    }
}
