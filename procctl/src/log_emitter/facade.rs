// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::Arc;

use anyhow::bail;
use log::{LevelFilter, Metadata, Record};
use procctl_wire::{Level, LogRecord};

use super::emitter::LogEmitter;

/// Routes the `log` macros of a process through its emitter, so job code
/// inside a worker can use `log::info!` and still reach the receiver.
struct EmitterFacade {
    emitter: Arc<LogEmitter>,
}

impl log::Log for EmitterFacade {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.emitter.enabled(to_wire_level(metadata.level()))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let wire = LogRecord::new(
            self.emitter.name(),
            to_wire_level(record.level()),
            record.args().to_string(),
        )
        .with_location(
            record.file().unwrap_or(record.target()),
            record.line().unwrap_or(0),
        );
        // log::Log has no way to report failures, stderr is all that is left
        if let Err(e) = self.emitter.send(wire) {
            eprintln!("{}: log record lost: {e}", self.emitter.name());
        }
    }

    fn flush(&self) {}
}

fn to_wire_level(level: log::Level) -> Level {
    match level {
        log::Level::Error => Level::Error,
        log::Level::Warn => Level::Warning,
        log::Level::Info => Level::Info,
        log::Level::Debug | log::Level::Trace => Level::Debug,
    }
}

fn to_level_filter(level: Level) -> LevelFilter {
    match level {
        Level::Debug => LevelFilter::Debug,
        Level::Info => LevelFilter::Info,
        Level::Warning => LevelFilter::Warn,
        Level::Error | Level::Critical => LevelFilter::Error,
    }
}

/// Installs `emitter` as the process-wide `log` backend.
///
/// Only emitters with an endpoint qualify: an emitter without one forwards
/// to the `log` facade itself.
pub fn install_facade(emitter: Arc<LogEmitter>) -> anyhow::Result<()> {
    if emitter.endpoint().is_none() {
        bail!("emitter {} has no receiver endpoint", emitter.name());
    }
    let level = to_level_filter(emitter.level());
    log::set_boxed_logger(Box::new(EmitterFacade { emitter }))?;
    log::set_max_level(level);
    Ok(())
}
