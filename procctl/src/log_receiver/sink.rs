// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use procctl_wire::LogRecord;
use serde_json::{json, Value};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

const ROTATED_SUFFIX: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
const ASCTIME: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second],[subsecond digits:3]");

/// A log file that is renamed to `{path}.{interval start}` once its interval
/// has elapsed, after which writing continues in a fresh file.
#[derive(Debug)]
pub struct TimedRotatingFile {
    path: PathBuf,
    interval: Duration,
    file: File,
    rollover_at: OffsetDateTime,
}

impl TimedRotatingFile {
    pub fn open(path: impl Into<PathBuf>, interval: Duration) -> io::Result<Self> {
        Self::open_at(path.into(), interval, OffsetDateTime::now_utc())
    }

    fn open_at(path: PathBuf, interval: Duration, now: OffsetDateTime) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        Ok(Self {
            path,
            interval,
            file,
            rollover_at: now + interval,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_record(&mut self, record: &LogRecord) -> io::Result<()> {
        self.write_record_at(record, OffsetDateTime::now_utc())
    }

    fn write_record_at(&mut self, record: &LogRecord, now: OffsetDateTime) -> io::Result<()> {
        if now >= self.rollover_at {
            self.rotate(now)?;
        }
        let mut line = format_record(record).to_string();
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()
    }

    fn rotate(&mut self, now: OffsetDateTime) -> io::Result<()> {
        let started = self.rollover_at - self.interval;
        let suffix = started
            .format(ROTATED_SUFFIX)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let mut rotated = self.path.clone().into_os_string();
        rotated.push(".");
        rotated.push(suffix);
        let rotated = PathBuf::from(rotated);

        self.file.flush()?;
        if rotated.exists() {
            fs::remove_file(&rotated)?;
        }
        fs::rename(&self.path, &rotated)?;
        self.file = open_append(&self.path)?;
        debug!("rotated {} to {}", self.path.display(), rotated.display());

        while self.rollover_at <= now {
            self.rollover_at += self.interval;
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// One JSON object per line.
pub fn format_record(record: &LogRecord) -> Value {
    let asctime = record
        .created_at()
        .and_then(|at| at.format(ASCTIME).ok())
        .unwrap_or_default();
    let mut line = json!({
        "asctime": asctime,
        "name": record.name,
        "pathname": record.pathname,
        "lineno": record.lineno,
        "levelname": record.levelname,
        "message": record.msg,
        "process": record.process,
        "processName": record.process_name,
    });
    if let Some(exc_text) = &record.exc_text {
        line["exc_text"] = Value::String(exc_text.clone());
    }
    line
}

/// Lazily created sinks, one per logger name.
#[derive(Debug)]
pub struct SinkRegistry {
    dir: PathBuf,
    file_prefix: String,
    interval: Duration,
    sinks: Mutex<HashMap<String, Arc<Mutex<TimedRotatingFile>>>>,
}

impl SinkRegistry {
    pub fn new(dir: impl Into<PathBuf>, file_prefix: impl Into<String>, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            file_prefix: file_prefix.into(),
            interval,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        let name: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
            .collect();
        self.dir.join(format!("{}.{}.log", self.file_prefix, name))
    }

    /// Writes `record` to the sink of `name`. Every record is written, level
    /// filtering is left to the emitters.
    pub fn write(&self, name: &str, record: &LogRecord) -> io::Result<()> {
        let sink = self.sink_for(name)?;
        let mut sink = sink.lock().unwrap_or_else(|e| e.into_inner());
        sink.write_record(record)
    }

    fn sink_for(&self, name: &str) -> io::Result<Arc<Mutex<TimedRotatingFile>>> {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sink) = sinks.get(name) {
            return Ok(sink.clone());
        }
        let sink = Arc::new(Mutex::new(TimedRotatingFile::open(
            self.path_for(name),
            self.interval,
        )?));
        debug!("created sink {} for logger {name}", self.path_for(name).display());
        sinks.insert(name.to_string(), sink.clone());
        Ok(sink)
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
