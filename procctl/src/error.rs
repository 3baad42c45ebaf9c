// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::io;

use procctl_wire::FramingError;
use thiserror::Error;

use crate::log_emitter::EmitError;

#[derive(Debug, Error)]
pub enum Error {
    /// A log record could not be delivered to the receiver.
    #[error(transparent)]
    Log(#[from] EmitError),

    #[error("failed to start worker process {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Broken request/response stream between controller and a worker.
    #[error("worker channel failed: {0}")]
    Ipc(#[from] FramingError),

    #[error("no job function named {0:?} is registered")]
    UnknownFunction(String),

    #[error("failed to start the embedded log receiver: {0}")]
    Receiver(#[source] io::Error),

    #[error("failed to register termination signals: {0}")]
    Signal(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid worker invocation: {0}")]
    Invocation(String),

    #[error("the worker pool has been closed")]
    PoolClosed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
