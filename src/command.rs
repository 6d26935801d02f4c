// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Command backed services.
//!
//! Turn [`ServiceDefinition`] entries of a manifest into [`Service`] records
//! whose operations are shell commands. Every command is run as
//! `<shell> -c <command>`, so the shell handles quoting, globbing, and
//! variable expansion.
//!
//! Utility inits and cleanups block the caller until the command exits.
//! Daemon inits spawn the command as a child process on the registry's
//! runtime. When the registry asks a daemon to stop, the child gets SIGTERM,
//! and is killed outright if it ignores SIGTERM for longer than the stop
//! grace.

use crate::{
    config::{ManifestSettings, ServiceDefinition},
    service::{Service, ServiceKind, Shutdown},
};

use std::{
    path::PathBuf,
    process::{Command, Output, Stdio},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Shell command runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    shell: String,
    command: String,
    working_dir: Option<PathBuf>,
}

impl ShellCommand {
    /// Construct new shell command.
    pub fn new(shell: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            command: command.into(),
            working_dir: None,
        }
    }

    /// Run command inside target directory.
    pub fn working_dir(mut self, dir: Option<impl Into<PathBuf>>) -> Self {
        self.working_dir = dir.map(Into::into);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run command to completion in current process.
    ///
    /// Output to stdout and stderr is returned together as a [`String`].
    ///
    /// # Errors
    ///
    /// - Return [`CommandError::Spawn`] if shell cannot be executed.
    /// - Return [`CommandError::Failed`] if command exits unsuccessfully.
    #[instrument(skip(self), fields(command = self.command.as_str()), level = "debug")]
    pub fn run(&self) -> Result<String> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(&self.command).stdin(Stdio::null());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().map_err(|source| CommandError::Spawn {
            source,
            command: self.command.clone(),
        })?;
        let message = output_message(&output);
        if !output.status.success() {
            return Err(CommandError::Failed {
                command: self.command.clone(),
                status: output.status.to_string(),
                message,
            });
        }

        Ok(message)
    }

    /// Run command as supervised child until it exits, or shutdown is
    /// requested.
    ///
    /// # Errors
    ///
    /// - Return [`CommandError::Spawn`] if shell cannot be executed.
    /// - Return [`CommandError::Failed`] if child exits unsuccessfully
    ///   without being asked to.
    pub async fn supervise(&self, mut shutdown: Shutdown, stop_grace: Duration) -> Result<()> {
        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
            source,
            command: self.command.clone(),
        })?;
        debug!("spawned {:?} as pid {:?}", self.command, child.id());

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            () = shutdown.requested() => None,
        };

        match exited {
            Some(status) => {
                let status = status.map_err(|source| CommandError::Wait {
                    source,
                    command: self.command.clone(),
                })?;
                if !status.success() {
                    return Err(CommandError::Failed {
                        command: self.command.clone(),
                        status: status.to_string(),
                        message: String::new(),
                    });
                }

                info!("{:?} exited", self.command);
                Ok(())
            }
            None => {
                terminate(&mut child, &self.command, stop_grace).await;
                Ok(())
            }
        }
    }
}

async fn terminate(child: &mut tokio::process::Child, command: &str, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };

    debug!("send SIGTERM to {command:?} at pid {pid}");
    // INVARIANT: Never wait past grace period for child to exit.
    if send_sigterm(pid, command) && tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }

    warn!("{command:?} did not exit on SIGTERM, killing pid {pid}");
    if let Err(error) = child.kill().await {
        warn!("failed to kill {command:?}: {error}");
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32, command: &str) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(errno) => {
            warn!("failed to send SIGTERM to {command:?} at pid {pid}: {errno}");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32, _command: &str) -> bool {
    false
}

/// Build service from manifest definition.
///
/// Init and cleanup commands run through the shell given by the manifest
/// settings. Daemons use the manifest's stop grace when escalating from
/// SIGTERM to SIGKILL.
pub fn service_from_definition(
    definition: &ServiceDefinition,
    settings: &ManifestSettings,
) -> Service {
    let init = ShellCommand::new(&settings.shell, &definition.init)
        .working_dir(definition.working_dir.as_deref());

    let service = match definition.kind {
        ServiceKind::Utility => Service::utility(&definition.name, move |_| {
            let output = init.run()?;
            log_output(init.command(), &output);
            Ok(())
        }),
        ServiceKind::Daemon => {
            let stop_grace = Duration::from_millis(settings.stop_grace_ms);
            Service::daemon(&definition.name, move |shutdown| {
                let init = init.clone();
                async move {
                    init.supervise(shutdown, stop_grace)
                        .await
                        .map_err(anyhow::Error::from)
                }
            })
        }
    };

    let service = match &definition.cleanup {
        Some(cleanup) => {
            let cleanup = ShellCommand::new(&settings.shell, cleanup)
                .working_dir(definition.working_dir.as_deref());
            service.cleanup(move || {
                let output = cleanup.run()?;
                log_output(cleanup.command(), &output);
                Ok(())
            })
        }
        None => service,
    };

    service.depends_on(&definition.dependencies)
}

fn log_output(command: &str, output: &str) {
    if !output.is_empty() {
        info!("{command:?}: {output}");
    }
}

fn output_message(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();
    let mut message = String::new();

    if !stdout.is_empty() {
        message.push_str(format!("stdout: {stdout}").as_str());
    }

    if !stderr.is_empty() {
        message.push_str(format!("stderr: {stderr}").as_str());
    }

    // INVARIANT: Chomp trailing newlines.
    message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message)
}

/// Command execution error types.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Shell could not be executed.
    #[error("failed to spawn {command:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        command: String,
    },

    /// Waiting on child process failed.
    #[error("failed to wait on {command:?}")]
    Wait {
        #[source]
        source: std::io::Error,
        command: String,
    },

    /// Command exited unsuccessfully.
    #[error("command {command:?} failed with {status}:\n{message}")]
    Failed {
        command: String,
        status: String,
        message: String,
    },
}

/// Friendly result alias :3
pub type Result<T, E = CommandError> = std::result::Result<T, E>;
