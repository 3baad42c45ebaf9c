// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Persistent pool of worker processes.
//!
//! ```text
//! +-------------------------+
//! | submit(batch)           |
//! +-----------+-------------+
//!             | one task per job
//!             v
//! +-----------+-------------+
//! |   shared task queue     |
//! +----+--------------+-----+
//!      |              |
//! +----v-----+   +----v-----+
//! | dispatch |   | dispatch |     one thread per worker
//! +----+-----+   +----+-----+
//!      | fd 3         | fd 3
//! +----v-----+   +----v-----+
//! | Pool     |   | Pool     |
//! | Worker-1 |   | Worker-2 |
//! +----------+   +----------+
//! ```
//!
//! A dispatch thread sends one request at a time and answers the batch the
//! task belongs to. A worker that dies mid-task fails that task and is
//! started again for the next one.

mod batch;

use std::fmt;
use std::io::{self, BufReader};
use std::os::unix::net::UnixStream;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use async_channel::{Receiver, Sender};
use log::{debug, error, warn};
use procctl_wire::{read_message, write_message, FramingError, DEFAULT_MAX_FRAME_LEN};

pub use batch::{BatchHandle, BatchId, BatchOutcome};

use crate::error::{Error, Result};
use crate::job::{JobOutcome, JobSpec};
use crate::process_tools::{terminate_child, ProcessNames, WorkerLauncher};
use crate::worker::{PoolRequest, PoolResponse, WorkerMode};

struct PoolTask {
    job: JobSpec,
    index: usize,
    reply: Sender<(usize, JobOutcome)>,
}

struct WorkerConnection {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl WorkerConnection {
    fn new(stream: UnixStream) -> io::Result<Self> {
        Ok(Self {
            writer: stream.try_clone()?,
            reader: BufReader::new(stream),
        })
    }

    fn run(&mut self, request: &PoolRequest) -> std::result::Result<Option<PoolResponse>, FramingError> {
        write_message(&mut self.writer, request)?;
        read_message(&mut self.reader, DEFAULT_MAX_FRAME_LEN)
    }
}

#[derive(Debug, Default)]
struct WorkerSlot {
    name: String,
    child: Option<Child>,
}

type SharedSlot = Arc<Mutex<WorkerSlot>>;

fn lock(slot: &SharedSlot) -> std::sync::MutexGuard<'_, WorkerSlot> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// State of one dispatch thread.
struct Dispatcher {
    tasks: Receiver<PoolTask>,
    launcher: WorkerLauncher,
    names: ProcessNames,
    function: String,
    slot: SharedSlot,
    stopping: Arc<AtomicBool>,
    connection: Option<WorkerConnection>,
    next_task: u64,
}

impl Dispatcher {
    fn run(mut self) {
        while let Ok(task) = self.tasks.recv_blocking() {
            let outcome = self.execute(task.job);
            // a dropped handle means nobody waits for this batch any more
            let _ = task.reply.send_blocking((task.index, outcome));
        }
        self.shut_down_worker();
    }

    fn execute(&mut self, job: JobSpec) -> JobOutcome {
        if self.connection.is_none() {
            if let Err(cause) = self.respawn() {
                return JobOutcome::Failed(cause);
            }
        }
        let Some(connection) = self.connection.as_mut() else {
            return JobOutcome::Failed("no pool worker available".to_string());
        };

        self.next_task += 1;
        let request = PoolRequest {
            task: self.next_task,
            job,
        };
        match connection.run(&request) {
            Ok(Some(response)) if response.task == request.task => response.outcome,
            Ok(Some(response)) => {
                self.discard_worker();
                JobOutcome::Failed(format!(
                    "pool worker answered task {} instead of {}",
                    response.task, request.task
                ))
            }
            Ok(None) | Err(_) => {
                let name = self.discard_worker();
                JobOutcome::Failed(format!("{name} exited while running {}", request.job.function))
            }
        }
    }

    /// Starts a fresh worker in this slot unless the pool is being torn down.
    fn respawn(&mut self) -> std::result::Result<(), String> {
        let mut slot = lock(&self.slot);
        if self.stopping.load(Ordering::SeqCst) {
            return Err("worker pool terminated".to_string());
        }
        let name = self.names.next_pool_worker();
        let (child, connection) = self
            .launcher
            .launch(&name, &self.function, WorkerMode::Pool)
            .and_then(|(mut child, stream)| match WorkerConnection::new(stream) {
                Ok(connection) => Ok((child, connection)),
                Err(e) => {
                    let _ = terminate_child(&mut child);
                    Err(e)
                }
            })
            .map_err(|e| format!("could not start {name}: {e}"))?;
        debug!("started {name} as replacement");
        slot.name = name;
        slot.child = Some(child);
        self.connection = Some(connection);
        Ok(())
    }

    /// Drops the connection and reaps the worker. Returns its name.
    fn discard_worker(&mut self) -> String {
        self.connection = None;
        let mut slot = lock(&self.slot);
        if let Some(mut child) = slot.child.take() {
            if let Err(e) = terminate_child(&mut child) {
                warn!("could not reap {}: {e}", slot.name);
            }
        }
        slot.name.clone()
    }

    /// Closing the channel tells the worker to exit; then it is reaped.
    fn shut_down_worker(&mut self) {
        self.connection = None;
        let mut slot = lock(&self.slot);
        if let Some(mut child) = slot.child.take() {
            match child.wait() {
                Ok(status) => debug!("{} exited with {status}", slot.name),
                Err(e) => warn!("could not reap {}: {e}", slot.name),
            }
        }
    }
}

struct PoolWorker {
    slot: SharedSlot,
    thread: Option<JoinHandle<()>>,
}

/// A fixed number of long-lived worker processes fed from one task queue.
pub struct WorkerPool {
    tasks: Option<Sender<PoolTask>>,
    workers: Vec<PoolWorker>,
    stopping: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts `size` workers for `function`. Fails if any of them cannot be
    /// started; the ones already running are terminated again.
    pub fn start(size: usize, function: &str, launcher: &WorkerLauncher, names: &ProcessNames) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("a worker pool needs at least one process".to_string()));
        }
        let (tx, rx) = async_channel::unbounded();
        let mut pool = WorkerPool {
            tasks: Some(tx),
            workers: Vec::with_capacity(size),
            stopping: Arc::new(AtomicBool::new(false)),
        };

        for _ in 0..size {
            let name = names.next_pool_worker();
            let (mut child, stream) = launcher
                .launch(&name, function, WorkerMode::Pool)
                .map_err(|source| Error::Spawn {
                    name: name.clone(),
                    source,
                })?;
            let connection = match WorkerConnection::new(stream) {
                Ok(connection) => connection,
                Err(source) => {
                    let _ = terminate_child(&mut child);
                    return Err(Error::Spawn { name, source });
                }
            };

            let slot = Arc::new(Mutex::new(WorkerSlot {
                name: name.clone(),
                child: Some(child),
            }));
            let dispatcher = Dispatcher {
                tasks: rx.clone(),
                launcher: launcher.clone(),
                names: names.clone(),
                function: function.to_string(),
                slot: slot.clone(),
                stopping: pool.stopping.clone(),
                connection: Some(connection),
                next_task: 0,
            };
            // the slot is registered first, so a failing thread spawn still
            // leaves the child to terminate()
            pool.workers.push(PoolWorker { slot, thread: None });
            let thread = thread::Builder::new()
                .name(format!("dispatch-{name}"))
                .spawn(move || dispatcher.run())
                .map_err(|source| Error::Spawn { name, source })?;
            if let Some(worker) = pool.workers.last_mut() {
                worker.thread = Some(thread);
            }
        }
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn is_open(&self) -> bool {
        self.tasks.is_some()
    }

    /// Pids of the current worker processes.
    pub fn pids(&self) -> Vec<u32> {
        self.workers
            .iter()
            .filter_map(|w| lock(&w.slot).child.as_ref().map(Child::id))
            .collect()
    }

    /// Queues the jobs of one batch. Never blocks.
    pub fn submit(&self, id: BatchId, jobs: Vec<JobSpec>) -> Result<BatchHandle> {
        let tasks = self.tasks.as_ref().ok_or(Error::PoolClosed)?;
        let (reply, rx) = async_channel::unbounded();
        let len = jobs.len();
        for (index, job) in jobs.into_iter().enumerate() {
            tasks
                .try_send(PoolTask {
                    job,
                    index,
                    reply: reply.clone(),
                })
                .map_err(|_| Error::PoolClosed)?;
        }
        Ok(BatchHandle::new(id, len, rx))
    }

    /// Lets the workers finish every queued task, then stops and reaps them.
    pub fn close(&mut self) {
        self.tasks = None;
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!("dispatch thread of {} panicked", lock(&worker.slot).name);
                }
            }
        }
        self.workers.clear();
    }

    /// Kills the workers right away. Queued and running tasks fail.
    pub fn terminate(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.tasks = None;
        for worker in &self.workers {
            let mut slot = lock(&worker.slot);
            if let Some(mut child) = slot.child.take() {
                if let Err(e) = terminate_child(&mut child) {
                    warn!("could not terminate {}: {e}", slot.name);
                }
            }
        }
        // with their workers gone the threads run dry immediately
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
        self.workers.clear();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.workers.len())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.terminate();
        }
    }
}
