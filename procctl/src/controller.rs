// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use log::warn;
use serde_json::Value;

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::job::{DispatchStrategy, JobOutcome, JobTarget, ResultEntry};
use crate::lifecycle::{Lifecycle, ShutdownFlag};
use crate::log_emitter::{LogContext, ProcessLogger};
use crate::log_receiver::EmbeddedReceiver;
use crate::pool::{BatchHandle, BatchId, WorkerPool};
use crate::process_tools::{ProcessNames, WorkerLauncher};
use crate::supervisor::Supervisor;

/// Logger name of the controller itself.
pub const CONTROLLER_LOGGER: &str = "controller";

/// Runs a job function in other processes, either through a pool of
/// long-lived workers or in one process per job.
///
/// All methods take `&mut self`; the controller is meant to be driven from
/// a single thread. Dropping it shuts everything down gracefully, or
/// abruptly if a termination signal was received.
pub struct Controller {
    target: JobTarget,
    config: ControllerConfig,
    context: LogContext,
    logger: ProcessLogger,
    launcher: WorkerLauncher,
    names: ProcessNames,
    pool: Option<WorkerPool>,
    /// Most recent batch first.
    pending: VecDeque<BatchHandle>,
    next_batch: u64,
    pool_history: Vec<ResultEntry>,
    supervisor: Supervisor,
    receiver: Option<EmbeddedReceiver>,
    lifecycle: Lifecycle,
}

impl Controller {
    pub fn new(target: JobTarget, config: ControllerConfig) -> Result<Self> {
        let command = config.worker_command()?;
        let lifecycle = if config.install_signal_handlers {
            Lifecycle::install()?
        } else {
            Lifecycle::new()
        };

        let receiver = match &config.embedded_receiver {
            Some(launch) => {
                let mut receiver = EmbeddedReceiver::launch(launch).map_err(Error::Receiver)?;
                let startup = Duration::from_millis(config.receiver_startup_ms);
                if let Err(e) = receiver.wait_until_accepting(startup) {
                    receiver.stop();
                    return Err(Error::Receiver(e));
                }
                Some(receiver)
            }
            None => None,
        };

        let endpoint = config.effective_endpoint();
        let mut context = LogContext::new(endpoint.clone(), config.log_level);
        if let Some(launch) = &config.embedded_receiver {
            context = context.with_max_frame_len(launch.config.max_frame_len);
        }
        let logger = context.logger(CONTROLLER_LOGGER);
        let launcher = WorkerLauncher::new(command, endpoint, config.log_level);
        let names = ProcessNames::new();
        let supervisor = Supervisor::new(
            target.clone(),
            launcher.clone(),
            names.clone(),
            logger.clone(),
            config.poll_interval(),
        );

        Ok(Self {
            target,
            config,
            context,
            logger,
            launcher,
            names,
            pool: None,
            pending: VecDeque::new(),
            next_batch: 0,
            pool_history: Vec::new(),
            supervisor,
            receiver,
            lifecycle,
        })
    }

    pub fn target(&self) -> &JobTarget {
        &self.target
    }

    /// The log context of the controller process, for callers that want to
    /// log through the same receiver.
    pub fn log_context(&self) -> &LogContext {
        &self.context
    }

    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        self.lifecycle.flag()
    }

    /// Replaces the pool (if any) with a new one of `size` workers. An
    /// existing pool finishes its queued jobs first; their batches stay
    /// collectable.
    ///
    /// This and the other dispatch methods first check for a termination
    /// signal; after one they shut everything down and do nothing else.
    pub fn create_pool(&mut self, size: usize) -> Result<()> {
        if self.poll_signals() {
            return Ok(());
        }
        if self.pool.is_some() {
            self.logger
                .info("Pool exists; waiting for existing jobs to finish before closing pool.")?;
        }
        if let Some(mut pool) = self.pool.take() {
            pool.close();
        }
        self.pool = Some(WorkerPool::start(
            size,
            &self.target.function,
            &self.launcher,
            &self.names,
        )?);
        self.logger
            .info(format!("Pool with {size} available processes created."))?;
        Ok(())
    }

    /// Closes the pool once its queued jobs are done.
    pub fn close_pool(&mut self) -> Result<()> {
        match self.pool.take() {
            Some(mut pool) => {
                pool.close();
                self.logger.info("Pool closed.")?;
            }
            None => self.logger.warn("No pool exists; nothing to close.")?,
        }
        Ok(())
    }

    pub fn has_pool(&self) -> bool {
        self.pool.is_some()
    }

    /// Dispatches one batch to the pool without waiting for it. Returns
    /// `None` (and logs a warning) if there is no pool.
    pub fn submit(&mut self, jobs: Vec<Value>) -> Result<Option<BatchId>> {
        if self.poll_signals() {
            return Ok(None);
        }
        let Some(pool) = &self.pool else {
            self.logger.warn("No pool exists; create a pool to run jobs.")?;
            return Ok(None);
        };

        let strategy = DispatchStrategy::choose(&self.target, &jobs);
        let specs = strategy.jobs(&self.target, jobs);
        let id = BatchId(self.next_batch);
        let handle = pool.submit(id, specs)?;
        let running = pool.pids();
        self.next_batch += 1;
        self.pending.push_front(handle);

        self.logger.debug(format!("Batch {id} dispatched as {strategy:?}."))?;
        self.logger
            .info(format!("Created worker processes; running processes: {running:?}"))?;
        self.logger
            .info("Caching pending batch of jobs in temporary storage.")?;
        Ok(Some(id))
    }

    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }

    /// Waits for every pending batch, most recently submitted first, and
    /// returns their results. Inside a batch the results are in job order;
    /// failed jobs are logged and come back with an empty payload.
    ///
    /// Retrieved entries are added to [`pool_results`](Self::pool_results)
    /// batch by batch, so they are kept even if logging fails halfway.
    pub fn collect_results(&mut self) -> Result<Vec<ResultEntry>> {
        if self.pool.is_none() && self.pending.is_empty() {
            self.logger.warn("No pool exists; create a pool to run jobs.")?;
            return Ok(Vec::new());
        }

        let mut collected = Vec::new();
        let mut batches = 0;
        while let Some(batch) = self.pending.pop_front() {
            self.logger.info(format!(
                "Unretrieved results in pool cache: {} batches. Attempting to retrieve a batch.",
                self.pending.len() + 1
            ))?;
            let origin = batch.id().origin_label();
            let outcome = batch.wait(self.lifecycle.flag(), self.config.poll_interval());
            if outcome.interrupted {
                self.terminate();
                break;
            }

            let mut failures = Vec::new();
            let mut entries = Vec::with_capacity(outcome.slots.len());
            for slot in outcome.slots {
                match slot {
                    Some(JobOutcome::Ok(value)) => entries.push(ResultEntry::new(Some(value), &origin)),
                    Some(JobOutcome::Failed(cause)) => {
                        failures.push(cause);
                        entries.push(ResultEntry::new(None, &origin));
                    }
                    None => {
                        failures.push("the worker pool went away before the job finished".to_string());
                        entries.push(ResultEntry::new(None, &origin));
                    }
                }
            }
            self.pool_history.extend(entries.iter().cloned());
            collected.extend(entries);
            batches += 1;

            if failures.is_empty() {
                self.logger
                    .info(format!("Result successfully retrieved for {origin}"))?;
            }
            for cause in failures {
                self.logger
                    .warn(format!("Result could not be retrieved; {origin}"))?;
                self.logger.error(format!("Specific cause for failure: {cause}"))?;
            }
            self.logger.info("Appending result to pool results queue.")?;
        }

        self.logger.info(format!(
            "All retrieved results returned; {batches} batches retrieved."
        ))?;
        Ok(collected)
    }

    /// Every pool result retrieved so far.
    pub fn pool_results(&self) -> &[ResultEntry] {
        &self.pool_history
    }

    pub fn pool_pids(&self) -> Vec<u32> {
        self.pool.as_ref().map(WorkerPool::pids).unwrap_or_default()
    }

    /// Runs the target once in a process of its own. Returns the process
    /// name, or `None` while a pool exists (logged as a warning) or after a
    /// termination signal.
    pub fn spawn(&mut self, args: Value) -> Result<Option<String>> {
        if self.poll_signals() {
            return Ok(None);
        }
        if self.pool.is_some() {
            self.logger
                .warn("Pool exists; close pool before using individual workers.")?;
            return Ok(None);
        }
        self.supervisor.spawn(args).map(Some)
    }

    pub fn reclaim_dead(&mut self) -> Result<Vec<String>> {
        if self.poll_signals() {
            return Ok(Vec::new());
        }
        self.supervisor.reclaim_dead()
    }

    /// Results of one-off processes that arrived since the last call.
    pub fn drain_results(&mut self) -> Result<Vec<ResultEntry>> {
        if self.poll_signals() {
            return Ok(Vec::new());
        }
        self.supervisor.drain_results()
    }

    /// Blocks until all one-off processes have finished. Returns `false`
    /// if a termination signal arrived first, in which case everything has
    /// been terminated.
    pub fn wait_for_processes(&mut self) -> bool {
        if self.supervisor.wait_all(self.lifecycle.flag()) {
            return true;
        }
        self.terminate();
        false
    }

    /// Every one-off result drained so far.
    pub fn process_results(&self) -> &[ResultEntry] {
        self.supervisor.history()
    }

    pub fn process_pids(&self) -> Vec<u32> {
        self.supervisor.pids()
    }

    pub fn live_processes(&mut self) -> usize {
        self.supervisor.live_count()
    }

    /// Runs the abrupt shutdown if a termination signal arrived. Returns
    /// whether it did.
    pub fn poll_signals(&mut self) -> bool {
        if !self.lifecycle.shutdown_requested() {
            return false;
        }
        self.terminate();
        true
    }

    fn has_work(&self) -> bool {
        self.pool.is_some()
            || self.supervisor.tracked() > 0
            || !self.pending.is_empty()
            || self.receiver.is_some()
    }

    /// Graceful shutdown: waits for the one-off processes, lets the pool
    /// finish its queue, then stops the embedded receiver. Unretrieved pool
    /// results stay collectable.
    pub fn quit(&mut self) -> Result<()> {
        if self.lifecycle.shutdown_requested() {
            self.terminate();
            return Ok(());
        }
        let mut first_error = None;

        if self.supervisor.tracked() > 0 {
            if !self.supervisor.wait_all(self.lifecycle.flag()) {
                self.terminate();
                return Ok(());
            }
            if let Err(e) = self.supervisor.reclaim_dead() {
                first_error.get_or_insert(e);
            }
        }
        if let Some(mut pool) = self.pool.take() {
            pool.close();
        }
        if let Some(receiver) = self.receiver.take() {
            if let Err(e) = self.logger.info("Stopping the log receiver.") {
                first_error.get_or_insert(e.into());
            }
            receiver.stop();
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Abrupt shutdown: kills every process without waiting. Running jobs,
    /// pending batches and their results are lost. Never fails and may be
    /// called any number of times.
    pub fn terminate(&mut self) {
        if !self.has_work() {
            return;
        }
        let _ = self
            .logger
            .warn("Terminating all processes; pending jobs and results are lost.");
        self.supervisor.terminate_all();
        if let Some(mut pool) = self.pool.take() {
            pool.terminate();
        }
        self.pending.clear();
        if let Some(receiver) = self.receiver.take() {
            receiver.stop();
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("target", &self.target)
            .field("pool", &self.pool)
            .field("pending", &self.pending.len())
            .field("next_batch", &self.next_batch)
            .field("processes", &self.supervisor.tracked())
            .finish()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.lifecycle.shutdown_requested() {
            self.terminate();
        } else if let Err(e) = self.quit() {
            warn!("controller shutdown incomplete: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerCommand;
    use serde_json::json;

    fn controller() -> Controller {
        let config = ControllerConfig {
            worker: Some(WorkerCommand::new("true")),
            install_signal_handlers: false,
            poll_interval_ms: 10,
            ..Default::default()
        };
        Controller::new(JobTarget::new("square", 1), config).unwrap()
    }

    #[test]
    fn without_pool_submit_and_collect_do_nothing() {
        let mut controller = controller();
        assert_eq!(controller.submit(vec![json!(1)]).unwrap(), None);
        assert!(controller.collect_results().unwrap().is_empty());
        assert_eq!(controller.pending_batches(), 0);
        assert!(controller.pool_results().is_empty());
    }

    #[test]
    fn batch_ids_count_up_from_zero() {
        let mut controller = controller();
        controller.create_pool(1).unwrap();
        assert_eq!(controller.submit(vec![json!(1)]).unwrap(), Some(BatchId(0)));
        assert_eq!(controller.submit(vec![json!(2)]).unwrap(), Some(BatchId(1)));
        controller.create_pool(1).unwrap();
        assert_eq!(controller.submit(vec![]).unwrap(), Some(BatchId(2)));
        assert_eq!(controller.pending_batches(), 3);

        // `true` never answers, every job comes back empty; most recent batch first
        let results = controller.collect_results().unwrap();
        let origins: Vec<_> = results.iter().map(|r| r.origin.as_str()).collect();
        assert_eq!(origins, vec!["Pool Batch ID: 1", "Pool Batch ID: 0"]);
        assert!(results.iter().all(|r| r.payload.is_none()));
        assert_eq!(controller.pool_results().len(), 2);
    }

    #[test]
    fn spawn_is_refused_while_a_pool_exists() {
        let mut controller = controller();
        controller.create_pool(1).unwrap();
        assert_eq!(controller.spawn(json!(3)).unwrap(), None);
        controller.close_pool().unwrap();
        assert!(!controller.has_pool());
        assert_eq!(controller.spawn(json!(3)).unwrap(), Some("Process-2".to_string()));
        assert!(controller.wait_for_processes());
    }

    #[test]
    fn terminate_is_idempotent() {
        let mut controller = controller();
        controller.create_pool(2).unwrap();
        controller.submit(vec![json!(1), json!(2)]).unwrap();
        controller.terminate();
        controller.terminate();
        assert!(!controller.has_pool());
        assert_eq!(controller.pending_batches(), 0);
    }

    #[test]
    fn raised_flag_stops_dispatching() {
        let mut controller = controller();
        controller.create_pool(1).unwrap();
        controller.shutdown_flag().raise();
        assert_eq!(controller.submit(vec![json!(1)]).unwrap(), None);
        assert!(!controller.has_pool());
        assert_eq!(controller.spawn(json!(2)).unwrap(), None);
        assert!(controller.process_pids().is_empty());
        controller.create_pool(1).unwrap();
        assert!(!controller.has_pool());
        assert!(controller.drain_results().unwrap().is_empty());
        assert!(controller.reclaim_dead().unwrap().is_empty());
    }

    #[test]
    fn raised_flag_turns_quit_into_terminate() {
        let mut controller = controller();
        controller.create_pool(1).unwrap();
        controller.shutdown_flag().raise();
        assert!(controller.poll_signals());
        assert!(!controller.has_pool());
        controller.quit().unwrap();
    }
}
