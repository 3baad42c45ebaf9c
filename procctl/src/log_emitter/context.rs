// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use procctl_wire::{Level, DEFAULT_MAX_FRAME_LEN};

use super::emitter::{LogEmitter, ProcessLogger};
use crate::config::Endpoint;

/// Owns the emitters of one process, one per logger name.
///
/// The context is created by whoever owns the process (the controller, or
/// the worker entry point) and handed to every component that logs.
#[derive(Debug, Clone)]
pub struct LogContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    endpoint: Option<Endpoint>,
    level: Level,
    process_name: String,
    max_frame_len: usize,
    emitters: Mutex<HashMap<String, Arc<LogEmitter>>>,
}

impl LogContext {
    pub fn new(endpoint: Option<Endpoint>, level: Level) -> Self {
        Self::with_process_name(endpoint, level, "MainProcess")
    }

    pub fn with_process_name(
        endpoint: Option<Endpoint>,
        level: Level,
        process_name: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                endpoint,
                level,
                process_name: process_name.into(),
                max_frame_len: DEFAULT_MAX_FRAME_LEN,
                emitters: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns a context whose emitters refuse records larger than
    /// `max_frame_len`. Match it to the receiver's limit. Emitters of `self`
    /// are not carried over.
    pub fn with_max_frame_len(self, max_frame_len: usize) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                endpoint: self.inner.endpoint.clone(),
                level: self.inner.level,
                process_name: self.inner.process_name.clone(),
                max_frame_len,
                emitters: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.inner.endpoint.as_ref()
    }

    pub fn level(&self) -> Level {
        self.inner.level
    }

    /// Returns the emitter registered for `name`, creating it on first use.
    /// Asking twice for the same name never opens a second connection.
    pub fn emitter(&self, name: &str) -> Arc<LogEmitter> {
        let mut emitters = self.inner.emitters.lock().unwrap_or_else(|e| e.into_inner());
        emitters
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(LogEmitter::new(
                    name,
                    self.inner.process_name.clone(),
                    self.inner.endpoint.clone(),
                    self.inner.level,
                    self.inner.max_frame_len,
                ))
            })
            .clone()
    }

    pub fn logger(&self, name: &str) -> ProcessLogger {
        ProcessLogger::new(self.emitter(name))
    }

    pub fn emitter_count(&self) -> usize {
        self.inner.emitters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
