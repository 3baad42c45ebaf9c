// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use nix::errno::Errno;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use procctl_wire::Level;

use crate::config::{Endpoint, WorkerCommand};
use crate::worker::{WorkerInvocation, WorkerMode};

/// Inside a worker, the stream to the controller is always this descriptor.
pub const WORKER_IPC_FD: RawFd = 3;

/// Hands out the names of the processes of one controller. One-off
/// processes and pool workers share the counter, so names never repeat.
#[derive(Debug, Clone, Default)]
pub struct ProcessNames {
    counter: Arc<AtomicU64>,
}

impl ProcessNames {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_process(&self) -> String {
        format!("Process-{}", self.next())
    }

    pub fn next_pool_worker(&self) -> String {
        format!("PoolWorker-{}", self.next())
    }
}

/// Starts worker processes with a stream socket mapped to [`WORKER_IPC_FD`].
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    command: WorkerCommand,
    log_endpoint: Option<Endpoint>,
    log_level: Level,
}

impl WorkerLauncher {
    pub fn new(command: WorkerCommand, log_endpoint: Option<Endpoint>, log_level: Level) -> Self {
        Self {
            command,
            log_endpoint,
            log_level,
        }
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Returns the child and the controller's end of its channel.
    pub fn launch(&self, name: &str, function: &str, mode: WorkerMode) -> io::Result<(Child, UnixStream)> {
        let invocation = WorkerInvocation {
            name: name.to_string(),
            function: function.to_string(),
            mode,
            log_endpoint: self.log_endpoint.clone(),
            log_level: self.log_level,
        };
        let encoded = invocation.to_base64().map_err(io::Error::other)?;

        // both ends close on exec; only the dup'ed copy survives in the child
        let (parent, child) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .arg("--invocation-base64")
            .arg(encoded);

        let fd = child.as_raw_fd();
        unsafe {
            cmd.pre_exec(move || {
                if fd == WORKER_IPC_FD {
                    let flags = Errno::result(libc::fcntl(fd, libc::F_GETFD))?;
                    Errno::result(libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC))?;
                } else {
                    Errno::result(libc::dup2(fd, WORKER_IPC_FD))?;
                }
                Ok(())
            })
        };

        let process = cmd.spawn()?;
        // without our copy of the child end, a dead worker shows up as EOF
        drop(child);
        debug!("launched {name} (pid {}) for {function}", process.id());
        Ok((process, UnixStream::from(parent)))
    }
}

pub fn is_alive(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

/// Kills the child if it is still running and reaps it.
pub fn terminate_child(child: &mut Child) -> io::Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    match child.kill() {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
        Err(e) => return Err(e),
    }
    child.wait().map(drop)
}

static IPC_TAKEN: AtomicBool = AtomicBool::new(false);

/// Claims the worker end of the controller channel. Succeeds once per
/// process and only if the descriptor is open.
pub fn take_worker_ipc_stream() -> io::Result<UnixStream> {
    if IPC_TAKEN.swap(true, Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "worker channel already taken",
        ));
    }
    let flags = Errno::result(unsafe { libc::fcntl(WORKER_IPC_FD, libc::F_GETFD) })?;
    // keep the channel away from processes the job itself starts
    Errno::result(unsafe { libc::fcntl(WORKER_IPC_FD, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    Ok(unsafe { UnixStream::from_raw_fd(WORKER_IPC_FD) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_never_reused() {
        let names = ProcessNames::new();
        let shared = names.clone();
        assert_eq!(names.next_process(), "Process-1");
        assert_eq!(shared.next_pool_worker(), "PoolWorker-2");
        assert_eq!(names.next_process(), "Process-3");
    }

    #[test]
    fn terminate_reaps_running_and_finished_children() {
        let mut sleeper = Command::new("sleep").arg("30").spawn().unwrap();
        assert!(is_alive(&mut sleeper));
        terminate_child(&mut sleeper).unwrap();
        assert!(!is_alive(&mut sleeper));

        let mut done = Command::new("true").spawn().unwrap();
        done.wait().unwrap();
        terminate_child(&mut done).unwrap();
    }
}
