// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Daemon task tracking.
//!
//! A daemon service runs its init as a task on the host's Tokio runtime. The
//! registry keeps a [`DaemonHandle`] for every running daemon so it can probe
//! whether the task is still alive, and deliver a graceful termination
//! request through the daemon's [`Shutdown`] receiver.

use crate::registry::STOP_POLL_INTERVAL;

use futures::FutureExt;
use std::time::{Duration, Instant};
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    sync::watch,
    task::JoinHandle,
};

/// Graceful termination request for a daemon.
///
/// Handed to every daemon init. Resolves once the registry asks the daemon
/// to stop, or once the registry drops the daemon's handle altogether.
#[derive(Debug, Clone)]
pub struct Shutdown {
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    pub(crate) fn new(receiver: watch::Receiver<bool>) -> Self {
        Self { receiver }
    }

    /// Check if termination has been requested without waiting.
    pub fn is_requested(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Wait until termination is requested.
    pub async fn requested(&mut self) {
        loop {
            if *self.receiver.borrow_and_update() {
                return;
            }

            // INVARIANT: Dropped sender means nobody tracks us anymore, so stop.
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Outcome of a daemon task that is no longer running.
#[derive(Debug)]
pub(crate) enum DaemonExit {
    /// Task returned without error.
    Clean,

    /// Task returned an error.
    Failed(anyhow::Error),

    /// Task panicked or was cancelled by the runtime.
    Aborted(String),
}

impl DaemonExit {
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Clean => "exited before the liveness check".into(),
            Self::Failed(error) => format!("exited with error: {error:#}"),
            Self::Aborted(reason) => format!("aborted: {reason}"),
        }
    }
}

/// Handle to a running daemon task.
#[derive(Debug)]
pub struct DaemonHandle {
    task: JoinHandle<anyhow::Result<()>>,
    terminate: watch::Sender<bool>,
    launched_at: Instant,
}

impl DaemonHandle {
    pub(crate) fn new(
        task: JoinHandle<anyhow::Result<()>>,
        terminate: watch::Sender<bool>,
    ) -> Self {
        Self {
            task,
            terminate,
            launched_at: Instant::now(),
        }
    }

    /// Check if the underlying task is still scheduled.
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Time elapsed since the task was launched.
    pub fn uptime(&self) -> Duration {
        self.launched_at.elapsed()
    }

    /// Deliver graceful termination request.
    ///
    /// Returns false if the daemon already dropped its [`Shutdown`] receiver.
    pub(crate) fn signal_terminate(&self) -> bool {
        self.terminate.send(true).is_ok()
    }

    /// Wait at most `grace` for the task to finish.
    ///
    /// Polls instead of joining so the caller never blocks past `grace`,
    /// and never needs to be inside the runtime.
    pub(crate) fn wait_finished(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while self.is_alive() {
            if Instant::now() >= deadline {
                return false;
            }
            blocking_sleep(STOP_POLL_INTERVAL);
        }

        true
    }

    /// Collect exit outcome of a finished task.
    ///
    /// Returns `None` if the task is still running, in which case the task
    /// is detached.
    pub(crate) fn into_exit(self) -> Option<DaemonExit> {
        if self.is_alive() {
            return None;
        }

        match self.task.now_or_never()? {
            Ok(Ok(())) => Some(DaemonExit::Clean),
            Ok(Err(error)) => Some(DaemonExit::Failed(error)),
            Err(error) => Some(DaemonExit::Aborted(error.to_string())),
        }
    }
}

/// Block current thread for `duration`.
///
/// Inside a multi-thread runtime worker, the worker's other tasks are handed
/// off first so daemons keep making progress while we wait on them.
pub(crate) fn blocking_sleep(duration: Duration) {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(duration));
        }
        _ => std::thread::sleep(duration),
    }
}
