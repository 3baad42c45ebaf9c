// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Runs a job function in worker processes and streams the log records of
//! every process to a central receiver.
//!
//! ```text
//! +--------------------+        fd 3         +-----------------+
//! |     Controller     +-------------------->+ PoolWorker-N /  |
//! | pool | supervisor  |<--------------------+ Process-N       |
//! +---------+----------+   results           +--------+--------+
//!           |                                          |
//!           | log frames (TCP)                         | log frames (TCP)
//!           v                                          v
//! +---------+------------------------------------------+--------+
//! |                 LogReceiver (rotating files per name)       |
//! +--------------------------------------------------------------+
//! ```
//!
//! Worker programs hand control to [`worker::run_if_invoked`] (when the
//! controller re-invokes its own executable) or [`worker::worker_main`]
//! (dedicated worker binaries) with a [`JobRegistry`] that knows the target.

pub mod config;
pub mod controller;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod log_emitter;
pub mod log_receiver;
pub mod pool;
pub mod process_tools;
pub mod supervisor;
pub mod worker;

pub use config::{ControllerConfig, Endpoint, ReceiverConfig, ReceiverLaunch, WorkerCommand};
pub use controller::Controller;
pub use error::{Error, Result};
pub use job::{JobArgs, JobFn, JobOutcome, JobRegistry, JobSpec, JobTarget, ResultEntry};
pub use lifecycle::ShutdownFlag;
pub use log_emitter::{LogContext, ProcessLogger};
pub use pool::BatchId;
pub use procctl_wire::Level;
