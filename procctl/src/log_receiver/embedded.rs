// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::io;
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::config::{Endpoint, ReceiverLaunch};

const STARTUP_POLL: Duration = Duration::from_millis(20);

/// A receiver subprocess owned by a controller.
#[derive(Debug)]
pub struct EmbeddedReceiver {
    child: Child,
    endpoint: Endpoint,
}

impl EmbeddedReceiver {
    pub fn launch(launch: &ReceiverLaunch) -> io::Result<Self> {
        let child = Command::new(&launch.command.program)
            .args(&launch.command.args)
            .args(launch.config.to_cli_args())
            .spawn()?;
        debug!(
            "started log receiver {} (pid {})",
            launch.command.program.display(),
            child.id()
        );
        Ok(Self {
            child,
            endpoint: launch.config.endpoint(),
        })
    }

    /// Waits until the receiver accepts connections. Fails if it exits or
    /// `timeout` passes first.
    pub fn wait_until_accepting(&mut self, timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.endpoint.connect().is_ok() {
                debug!("log receiver accepts connections on {}", self.endpoint);
                return Ok(());
            }
            if let Some(status) = self.child.try_wait()? {
                return Err(io::Error::other(format!("log receiver exited early ({status})")));
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("log receiver not reachable on {} after {timeout:?}", self.endpoint),
                ));
            }
            thread::sleep(STARTUP_POLL);
        }
    }

    /// Asks the receiver to stop (SIGTERM) and reaps it, escalating to
    /// SIGKILL if it is still around after a second.
    pub fn stop(mut self) {
        let pid = Pid::from_raw(self.child.id() as i32);
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        let _ = signal::kill(pid, Signal::SIGTERM);

        for _ in 0..10 {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }

        warn!("log receiver (pid {pid}) ignored SIGTERM, killing it");
        let _ = signal::kill(pid, Signal::SIGKILL);
        let _ = self.child.wait();
    }
}
