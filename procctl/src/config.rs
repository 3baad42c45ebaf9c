// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use procctl_wire::{Level, DEFAULT_MAX_FRAME_LEN, DEFAULT_TCP_LOGGING_PORT};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Host and port of a log receiver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect((self.host.as_str(), self.port))
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_TCP_LOGGING_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Program (plus leading arguments) that acts as a worker process.
///
/// The program must hand control to [`crate::worker::run_if_invoked`] or
/// [`crate::worker::worker_main`] with a registry that knows the target
/// function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The running executable re-invoked as a worker.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub host: String,
    pub port: u16,
    /// Directory the rotating log files are created in.
    pub log_dir: PathBuf,
    /// Log files are named `{file_prefix}.{logger name}.log`.
    pub file_prefix: String,
    pub rotation_secs: u64,
    pub poll_interval_ms: u64,
    pub max_frame_len: usize,
    /// Routes every record to this logger name instead of the record's own.
    pub logname: Option<String>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_TCP_LOGGING_PORT,
            log_dir: PathBuf::from("."),
            file_prefix: "procctl".to_string(),
            rotation_secs: 60 * 60,
            poll_interval_ms: 1000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            logname: None,
        }
    }
}

impl ReceiverConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn rotation(&self) -> Duration {
        Duration::from_secs(self.rotation_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Command line understood by `procctl-log-receiver`.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--log-dir".to_string(),
            self.log_dir.to_string_lossy().into_owned(),
            "--file-prefix".to_string(),
            self.file_prefix.clone(),
            "--rotate-secs".to_string(),
            self.rotation_secs.to_string(),
            "--poll-ms".to_string(),
            self.poll_interval_ms.to_string(),
            "--max-frame-len".to_string(),
            self.max_frame_len.to_string(),
        ];
        if let Some(logname) = &self.logname {
            args.push("--logname".to_string());
            args.push(logname.clone());
        }
        args
    }
}

/// How a controller starts its own receiver subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverLaunch {
    pub command: WorkerCommand,
    #[serde(default)]
    pub config: ReceiverConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Receiver the controller and its workers stream to. Falls back to the
    /// embedded receiver, and to local logging if neither is set.
    pub log_endpoint: Option<Endpoint>,
    /// Records below this level are dropped by the emitters.
    pub log_level: Level,
    pub embedded_receiver: Option<ReceiverLaunch>,
    /// Worker program; `None` re-invokes the current executable.
    pub worker: Option<WorkerCommand>,
    pub poll_interval_ms: u64,
    /// Longest wait for the embedded receiver to accept connections.
    pub receiver_startup_ms: u64,
    pub install_signal_handlers: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            log_endpoint: None,
            log_level: Level::Info,
            embedded_receiver: None,
            worker: None,
            poll_interval_ms: 100,
            receiver_startup_ms: 5000,
            install_signal_handlers: true,
        }
    }
}

impl ControllerConfig {
    /// Builds a config from a flat option mapping. Values that parse as JSON
    /// are taken as such, everything else as a plain string, so both
    /// `log_level=WARNING` and `log_endpoint={"host":"h","port":1}` work.
    pub fn from_map(options: &HashMap<String, String>) -> Result<Self, Error> {
        let object: Map<String, Value> = options
            .iter()
            .map(|(key, raw)| {
                let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
                (key.clone(), value)
            })
            .collect();
        serde_json::from_value(Value::Object(object)).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// The endpoint emitters connect to, if any.
    pub fn effective_endpoint(&self) -> Option<Endpoint> {
        self.log_endpoint.clone().or_else(|| {
            self.embedded_receiver
                .as_ref()
                .map(|launch| launch.config.endpoint())
        })
    }

    pub fn worker_command(&self) -> Result<WorkerCommand, Error> {
        match &self.worker {
            Some(command) => Ok(command.clone()),
            None => WorkerCommand::current_exe().map_err(|e| Error::Config(e.to_string())),
        }
    }
}
