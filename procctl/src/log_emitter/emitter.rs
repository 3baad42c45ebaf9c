// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::io::{self, Write};
use std::net::TcpStream;
use std::panic::Location;
use std::sync::{Arc, Mutex};

use procctl_wire::{FramingError, Level, LogRecord};
use thiserror::Error;

use crate::config::Endpoint;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("cannot reach log receiver at {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    /// The connection broke while a frame was written. Nothing is retried.
    #[error("writing log record to {endpoint} failed: {source}")]
    Transport {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("log record could not be encoded: {0}")]
    Encode(#[from] FramingError),
}

/// Sends the records of one logger name to the receiver over a single,
/// lazily opened TCP connection.
///
/// Without an endpoint the records are handed to the local `log` facade
/// with the emitter name as target.
#[derive(Debug)]
pub struct LogEmitter {
    name: String,
    process_name: String,
    endpoint: Option<Endpoint>,
    level: Level,
    max_frame_len: usize,
    stream: Mutex<Option<TcpStream>>,
}

impl LogEmitter {
    pub(crate) fn new(
        name: impl Into<String>,
        process_name: impl Into<String>,
        endpoint: Option<Endpoint>,
        level: Level,
        max_frame_len: usize,
    ) -> Self {
        Self {
            name: name.into(),
            process_name: process_name.into(),
            endpoint,
            level,
            max_frame_len,
            stream: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn enabled(&self, level: Level) -> bool {
        level >= self.level
    }

    pub fn is_connected(&self) -> bool {
        self.stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn emit(&self, level: Level, msg: impl Into<String>, location: &Location<'_>) -> Result<(), EmitError> {
        if !self.enabled(level) {
            return Ok(());
        }
        let record = LogRecord::new(self.name.clone(), level, msg)
            .with_location(location.file(), location.line());
        self.send(record)
    }

    /// Writes one record. The level filter is not applied here.
    pub fn send(&self, record: LogRecord) -> Result<(), EmitError> {
        let record = record.with_process_name(self.process_name.clone());
        let Some(endpoint) = &self.endpoint else {
            log_locally(&record);
            return Ok(());
        };

        // an oversized frame would make the receiver drop the connection
        let frame = procctl_wire::encode_with_limit(&record, self.max_frame_len)?;
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        if stream.is_none() {
            let connection = endpoint.connect().map_err(|source| EmitError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
            connection.set_nodelay(true).ok();
            *stream = Some(connection);
        }
        if let Some(connection) = stream.as_mut() {
            if let Err(source) = connection.write_all(&frame) {
                // the next record starts over with a fresh connection
                *stream = None;
                return Err(EmitError::Transport {
                    endpoint: endpoint.clone(),
                    source,
                });
            }
        }
        Ok(())
    }
}

fn log_locally(record: &LogRecord) {
    let level = match record.levelname {
        Level::Debug => log::Level::Debug,
        Level::Info => log::Level::Info,
        Level::Warning => log::Level::Warn,
        Level::Error | Level::Critical => log::Level::Error,
    };
    match &record.exc_text {
        Some(exc_text) => log::log!(target: record.name.as_str(), level, "{}\n{}", record.msg, exc_text),
        None => log::log!(target: record.name.as_str(), level, "{}", record.msg),
    }
}

/// Cheap handle a component logs through. Every call reports the caller's
/// source location and returns transport failures to the caller.
#[derive(Debug, Clone)]
pub struct ProcessLogger {
    emitter: Arc<LogEmitter>,
}

impl ProcessLogger {
    pub fn new(emitter: Arc<LogEmitter>) -> Self {
        Self { emitter }
    }

    pub fn emitter(&self) -> &Arc<LogEmitter> {
        &self.emitter
    }

    #[track_caller]
    pub fn debug(&self, msg: impl Into<String>) -> Result<(), EmitError> {
        self.emitter.emit(Level::Debug, msg, Location::caller())
    }

    #[track_caller]
    pub fn info(&self, msg: impl Into<String>) -> Result<(), EmitError> {
        self.emitter.emit(Level::Info, msg, Location::caller())
    }

    #[track_caller]
    pub fn warn(&self, msg: impl Into<String>) -> Result<(), EmitError> {
        self.emitter.emit(Level::Warning, msg, Location::caller())
    }

    #[track_caller]
    pub fn error(&self, msg: impl Into<String>) -> Result<(), EmitError> {
        self.emitter.emit(Level::Error, msg, Location::caller())
    }

    /// Logs at ERROR with the error chain flattened into `exc_text`.
    #[track_caller]
    pub fn error_with(&self, msg: impl Into<String>, err: &anyhow::Error) -> Result<(), EmitError> {
        if !self.emitter.enabled(Level::Error) {
            return Ok(());
        }
        let location = Location::caller();
        let record = LogRecord::new(self.emitter.name(), Level::Error, msg)
            .with_location(location.file(), location.line())
            .with_exc_text(format!("{err:?}"));
        self.emitter.send(record)
    }
}
