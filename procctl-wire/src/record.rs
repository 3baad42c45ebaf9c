// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    /// Numeric severity as used by the common logging-handler conventions.
    pub fn number(self) -> u32 {
        match self {
            Level::Debug => 10,
            Level::Info => 20,
            Level::Warning => 30,
            Level::Error => 40,
            Level::Critical => 50,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single log event as it travels over the wire.
///
/// Field names follow the attribute names of the usual socket-handler JSON
/// dialect, so records from other emitters of that dialect decode as long as
/// they carry `name`, `msg`, `levelname`, `created` and `pathname`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub name: String,
    pub msg: String,
    pub levelname: Level,
    #[serde(default)]
    pub levelno: u32,
    /// Seconds since the Unix epoch.
    pub created: f64,
    pub pathname: String,
    #[serde(default)]
    pub lineno: u32,
    #[serde(default)]
    pub process: u32,
    #[serde(rename = "processName", default)]
    pub process_name: String,
    #[serde(rename = "threadName", default)]
    pub thread_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc_text: Option<String>,
}

impl LogRecord {
    pub fn new(name: impl Into<String>, level: Level, msg: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            name: name.into(),
            msg: msg.into(),
            levelname: level,
            levelno: level.number(),
            created: now.unix_timestamp_nanos() as f64 / 1e9,
            pathname: String::new(),
            lineno: 0,
            process: std::process::id(),
            process_name: current_process_name(),
            thread_name: std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string(),
            exc_text: None,
        }
    }

    pub fn with_location(mut self, pathname: impl Into<String>, lineno: u32) -> Self {
        self.pathname = pathname.into();
        self.lineno = lineno;
        self
    }

    pub fn with_process_name(mut self, process_name: impl Into<String>) -> Self {
        self.process_name = process_name.into();
        self
    }

    pub fn with_exc_text(mut self, exc_text: impl Into<String>) -> Self {
        self.exc_text = Some(exc_text.into());
        self
    }

    /// Timestamp of the record, `None` if `created` is out of range.
    pub fn created_at(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos((self.created * 1e9) as i128).ok()
    }
}

fn current_process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "MainProcess".to_string())
}
