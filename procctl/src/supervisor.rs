// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::VecDeque;
use std::io::BufReader;
use std::os::unix::net::UnixStream;
use std::process::Child;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use log::{debug, error, warn};
use procctl_wire::{read_message, DEFAULT_MAX_FRAME_LEN};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::job::{JobArgs, JobOutcome, JobTarget, ResultEntry};
use crate::lifecycle::ShutdownFlag;
use crate::log_emitter::ProcessLogger;
use crate::process_tools::{is_alive, terminate_child, ProcessNames, WorkerLauncher};
use crate::worker::{WorkerMode, WorkerReport};

/// A one-off process and the thread forwarding its report.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    child: Child,
    /// Yields whether a report was forwarded.
    reader: Option<JoinHandle<bool>>,
    reported: bool,
    silence_logged: bool,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn is_alive(&mut self) -> bool {
        is_alive(&mut self.child)
    }

    fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            match reader.join() {
                Ok(reported) => self.reported = reported,
                Err(_) => error!("report reader of {} panicked", self.name),
            }
        }
    }

    /// True once, for a process whose report stream ended without a report.
    fn take_silent_exit(&mut self) -> bool {
        if self.reader.as_ref().is_some_and(JoinHandle::is_finished) {
            self.join_reader();
        }
        if self.reader.is_some() || self.reported || self.silence_logged {
            return false;
        }
        self.silence_logged = true;
        true
    }

    /// Kills (if needed) and reaps the process.
    fn reclaim(&mut self) {
        if let Err(e) = terminate_child(&mut self.child) {
            warn!("could not reap {}: {e}", self.name);
        }
        self.join_reader();
    }
}

/// Runs one job per process and gathers the reports of those processes.
#[derive(Debug)]
pub struct Supervisor {
    target: JobTarget,
    launcher: WorkerLauncher,
    names: ProcessNames,
    logger: ProcessLogger,
    processes: VecDeque<ProcessHandle>,
    results: Option<(Sender<WorkerReport>, Receiver<WorkerReport>)>,
    history: Vec<ResultEntry>,
    poll_interval: Duration,
}

impl Supervisor {
    pub fn new(
        target: JobTarget,
        launcher: WorkerLauncher,
        names: ProcessNames,
        logger: ProcessLogger,
        poll_interval: Duration,
    ) -> Self {
        Self {
            target,
            launcher,
            names,
            logger,
            processes: VecDeque::new(),
            results: None,
            history: Vec::new(),
            poll_interval,
        }
    }

    /// Terminates and reaps every tracked process that is no longer alive.
    /// Returns the names of the reclaimed processes.
    pub fn reclaim_dead(&mut self) -> Result<Vec<String>> {
        self.logger.info("Checking for dead or orphaned processes.")?;
        let mut reclaimed = Vec::new();
        let mut silent = Vec::new();
        let mut alive = VecDeque::with_capacity(self.processes.len());
        for mut handle in self.processes.drain(..) {
            if handle.is_alive() {
                alive.push_back(handle);
                continue;
            }
            handle.reclaim();
            if handle.take_silent_exit() {
                silent.push(handle.name.clone());
            }
            reclaimed.push(handle.name);
        }
        self.processes = alive;

        self.log_silent_exits(&silent)?;
        for name in &reclaimed {
            self.logger.info(format!("{name} is unresponsive; terminating process."))?;
        }
        Ok(reclaimed)
    }

    /// Starts a process running the target with `args`. Returns its name.
    pub fn spawn(&mut self, args: Value) -> Result<String> {
        self.reclaim_dead()?;
        let (tx, _) = self.results.get_or_insert_with(async_channel::unbounded);
        let tx = tx.clone();

        let name = self.names.next_process();
        let mode = WorkerMode::OneShot {
            args: JobArgs::for_target(&self.target, args),
        };
        let (mut child, stream) = self
            .launcher
            .launch(&name, &self.target.function, mode)
            .map_err(|source| Error::Spawn {
                name: name.clone(),
                source,
            })?;

        let reader = match spawn_report_reader(name.clone(), stream, tx) {
            Ok(reader) => reader,
            Err(source) => {
                let _ = terminate_child(&mut child);
                return Err(Error::Spawn { name, source });
            }
        };
        self.processes.push_back(ProcessHandle {
            name: name.clone(),
            child,
            reader: Some(reader),
            reported: false,
            silence_logged: false,
        });

        self.logger.info(format!("Created process; process name is {name}"))?;
        self.logger.info(format!("Process {name} started."))?;
        Ok(name)
    }

    /// Takes every report that has arrived so far without blocking. Failed
    /// jobs are logged and left out of the returned entries.
    pub fn drain_results(&mut self) -> Result<Vec<ResultEntry>> {
        let Some((_, rx)) = &self.results else {
            self.logger
                .info("No worker results queue; use a process to retrieve results.")?;
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        let mut failures = Vec::new();
        while let Ok(report) = rx.try_recv() {
            match report.outcome {
                JobOutcome::Ok(value) => entries.push(ResultEntry::new(Some(value), report.name)),
                JobOutcome::Failed(cause) => failures.push((report.name, cause)),
            }
        }
        self.history.extend(entries.iter().cloned());

        let silent: Vec<String> = self
            .processes
            .iter_mut()
            .filter_map(|handle| handle.take_silent_exit().then(|| handle.name.clone()))
            .collect();
        self.log_silent_exits(&silent)?;
        for (name, cause) in failures {
            self.logger
                .warn(format!("Process {name} finished without a result."))?;
            self.logger.error(format!("Specific cause for failure: {cause}"))?;
        }
        self.logger
            .info("Worker results queue is empty, returning retrieved results.")?;
        Ok(entries)
    }

    /// Blocks until every tracked process has exited and its report (if
    /// any) is in the results channel. Returns `false` if `shutdown` was
    /// raised first.
    pub fn wait_all(&mut self, shutdown: &ShutdownFlag) -> bool {
        while self.processes.iter_mut().any(ProcessHandle::is_alive) {
            if shutdown.is_raised() {
                return false;
            }
            thread::sleep(self.poll_interval);
        }
        for handle in &mut self.processes {
            handle.join_reader();
        }
        true
    }

    /// Kills and reaps every tracked process. Never fails.
    pub fn terminate_all(&mut self) {
        for mut handle in self.processes.drain(..) {
            debug!("terminating {} (pid {})", handle.name, handle.pid());
            handle.reclaim();
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        self.processes.iter().map(ProcessHandle::pid).collect()
    }

    pub fn live_count(&mut self) -> usize {
        self.processes
            .iter_mut()
            .map(|handle| handle.is_alive())
            .filter(|alive| *alive)
            .count()
    }

    pub fn tracked(&self) -> usize {
        self.processes.len()
    }

    pub fn history(&self) -> &[ResultEntry] {
        &self.history
    }

    fn log_silent_exits(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.logger
                .warn(format!("Process {name} exited without reporting a result."))?;
        }
        Ok(())
    }
}

fn spawn_report_reader(
    name: String,
    stream: UnixStream,
    tx: Sender<WorkerReport>,
) -> std::io::Result<JoinHandle<bool>> {
    thread::Builder::new()
        .name(format!("report-{name}"))
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            match read_message::<_, WorkerReport>(&mut reader, DEFAULT_MAX_FRAME_LEN) {
                // the receiver only goes away together with the supervisor
                Ok(Some(report)) => tx.send_blocking(report).is_ok(),
                Ok(None) => {
                    debug!("{name} exited without a report");
                    false
                }
                Err(e) => {
                    warn!("unreadable report from {name}: {e}");
                    false
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, WorkerCommand};
    use crate::log_emitter::LogContext;
    use procctl_wire::Level;
    use serde_json::json;

    fn supervisor(command: WorkerCommand) -> Supervisor {
        let context = LogContext::new(None, Level::Info);
        Supervisor::new(
            JobTarget::new("square", 1),
            WorkerLauncher::new(command, None, Level::Info),
            ProcessNames::new(),
            context.logger("controller"),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn silent_processes_are_reclaimed_once() {
        let mut supervisor = supervisor(WorkerCommand::new("true"));
        assert_eq!(supervisor.spawn(json!(2)).unwrap(), "Process-1");
        assert!(supervisor.wait_all(&ShutdownFlag::new()));

        assert_eq!(supervisor.reclaim_dead().unwrap(), vec!["Process-1".to_string()]);
        assert!(supervisor.reclaim_dead().unwrap().is_empty());
        assert_eq!(supervisor.tracked(), 0);
        assert!(supervisor.drain_results().unwrap().is_empty());
    }

    #[test]
    fn silent_exit_is_warned_about_once() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let context = LogContext::new(Some(Endpoint::new("127.0.0.1", port)), Level::Info);
        let mut supervisor = Supervisor::new(
            JobTarget::new("square", 1),
            WorkerLauncher::new(WorkerCommand::new("true"), None, Level::Info),
            ProcessNames::new(),
            context.logger("controller"),
            Duration::from_millis(10),
        );
        supervisor.spawn(json!(2)).unwrap();
        assert!(supervisor.wait_all(&ShutdownFlag::new()));
        assert!(supervisor.drain_results().unwrap().is_empty());
        assert!(supervisor.drain_results().unwrap().is_empty());
        assert_eq!(supervisor.reclaim_dead().unwrap(), vec!["Process-1".to_string()]);
        drop(supervisor);
        drop(context);

        let (mut stream, _) = listener.accept().unwrap();
        let mut warnings = Vec::new();
        while let Some(record) = procctl_wire::decode(&mut stream, DEFAULT_MAX_FRAME_LEN).unwrap() {
            if record.levelname == Level::Warning {
                warnings.push(record.msg);
            }
        }
        assert_eq!(warnings, vec!["Process Process-1 exited without reporting a result."]);
    }

    #[test]
    fn drain_without_processes_is_empty() {
        let mut supervisor = supervisor(WorkerCommand::new("true"));
        assert!(supervisor.drain_results().unwrap().is_empty());
        assert!(supervisor.history().is_empty());
    }

    #[test]
    fn terminate_all_kills_running_processes() {
        let command = WorkerCommand::new("sh").arg("-c").arg("exec sleep 30").arg("sh");
        let mut supervisor = supervisor(command);
        supervisor.spawn(json!(1)).unwrap();
        supervisor.spawn(json!(2)).unwrap();
        assert_eq!(supervisor.live_count(), 2);

        let shutdown = ShutdownFlag::new();
        shutdown.raise();
        assert!(!supervisor.wait_all(&shutdown));

        supervisor.terminate_all();
        assert_eq!(supervisor.tracked(), 0);
        assert!(supervisor.pids().is_empty());
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let mut supervisor = supervisor(WorkerCommand::new("/nonexistent/procctl-worker"));
        assert!(matches!(supervisor.spawn(json!(1)), Err(Error::Spawn { .. })));
        assert_eq!(supervisor.tracked(), 0);
    }
}
