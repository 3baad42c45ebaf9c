// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fmt;
use std::time::Duration;

use async_channel::{Receiver, RecvError};
use async_io::Timer;
use futures::future::{self, Either};
use futures::pin_mut;
use serde::{Deserialize, Serialize};

use crate::job::JobOutcome;
use crate::lifecycle::ShutdownFlag;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId(pub u64);

impl BatchId {
    /// Origin label of the results of this batch.
    pub fn origin_label(self) -> String {
        format!("Pool Batch ID: {}", self.0)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pending results of one submitted batch. The dispatch threads answer
/// into the channel as the jobs complete, in any order.
#[derive(Debug)]
pub struct BatchHandle {
    id: BatchId,
    len: usize,
    rx: Receiver<(usize, JobOutcome)>,
}

/// `slots` is in job order. `None` marks a job whose outcome never arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub slots: Vec<Option<JobOutcome>>,
    pub interrupted: bool,
}

impl BatchHandle {
    pub(crate) fn new(id: BatchId, len: usize, rx: Receiver<(usize, JobOutcome)>) -> Self {
        Self { id, len, rx }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Blocks until every job of the batch reported back, the pool dropped
    /// the batch, or `shutdown` was raised.
    pub fn wait(&self, shutdown: &ShutdownFlag, poll_interval: Duration) -> BatchOutcome {
        let mut slots: Vec<Option<JobOutcome>> = vec![None; self.len];
        let mut received = 0;
        while received < self.len {
            if shutdown.is_raised() {
                return BatchOutcome {
                    slots,
                    interrupted: true,
                };
            }
            match async_io::block_on(recv_or_timeout(&self.rx, poll_interval)) {
                Some(Ok((index, outcome))) => {
                    if let Some(slot) = slots.get_mut(index) {
                        if slot.is_none() {
                            received += 1;
                        }
                        *slot = Some(outcome);
                    }
                }
                // every sender is gone, nothing more will arrive
                Some(Err(RecvError)) => break,
                None => {}
            }
        }
        BatchOutcome {
            slots,
            interrupted: false,
        }
    }
}

async fn recv_or_timeout<T>(rx: &Receiver<T>, timeout: Duration) -> Option<Result<T, RecvError>> {
    let recv = rx.recv();
    let timer = Timer::after(timeout);
    pin_mut!(recv);
    match future::select(recv, timer).await {
        Either::Left((received, _)) => Some(received),
        Either::Right(_) => None,
    }
}
