// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use signal_hook::consts::signal::{SIGABRT, SIGTERM};
use signal_hook::SigId;

use crate::error::{Error, Result};

/// Set when the process was asked to terminate. Blocking loops check it at
/// every poll interval and switch to the abrupt shutdown path.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Signal registrations of a controller. The handlers only set the
/// [`ShutdownFlag`]; the controller does the actual work when it sees it.
#[derive(Debug, Default)]
pub struct Lifecycle {
    flag: ShutdownFlag,
    registrations: Vec<SigId>,
}

impl Lifecycle {
    /// A lifecycle that only reacts to [`ShutdownFlag::raise`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers SIGTERM and SIGABRT. The first one raises the flag; a
    /// second one while the flag is still raised exits the process.
    pub fn install() -> Result<Self> {
        let mut lifecycle = Self::new();
        for sig in [SIGTERM, SIGABRT] {
            // registered first, so it only sees the flag of an earlier signal
            let exit =
                signal_hook::flag::register_conditional_shutdown(sig, 1, lifecycle.flag.0.clone())
                    .map_err(Error::Signal)?;
            lifecycle.registrations.push(exit);
            let raise = signal_hook::flag::register(sig, lifecycle.flag.0.clone()).map_err(Error::Signal)?;
            lifecycle.registrations.push(raise);
        }
        debug!("termination signals registered");
        Ok(lifecycle)
    }

    pub fn flag(&self) -> &ShutdownFlag {
        &self.flag
    }

    pub fn shutdown_requested(&self) -> bool {
        self.flag.is_raised()
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        for id in self.registrations.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raised_flag_is_seen_by_clones() {
        let lifecycle = Lifecycle::new();
        let flag = lifecycle.flag().clone();
        assert!(!lifecycle.shutdown_requested());
        flag.raise();
        assert!(lifecycle.shutdown_requested());
    }

    #[test]
    fn signal_sets_the_flag() {
        let lifecycle = Lifecycle::install().unwrap();
        assert_eq!(lifecycle.registrations.len(), 4);
        signal_hook::low_level::raise(SIGTERM).unwrap();
        assert!(lifecycle.shutdown_requested());
    }
}
