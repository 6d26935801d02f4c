// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Service domain representation.
//!
//! A __service__ is a named unit of shell functionality, e.g., exporting the
//! environment, setting up the prompt, or keeping an ssh agent around. Each
//! service carries an init operation, an optional cleanup operation, and a
//! listing of other services it depends on.
//!
//! # Service Kinds
//!
//! Services come in two kinds:
//!
//! - __Utility__ services run their init synchronously in the caller's
//!   context, and hold no ongoing resource afterwards.
//! - __Daemon__ services run their init as a long-lived background task on
//!   the host's runtime. The registry retains a [`DaemonHandle`] for later
//!   signaling.
//!
//! The kind of a service is decided by the constructor that built it, i.e.,
//! [`Service::utility`] or [`Service::daemon`]. Thus, a daemon can never be
//! registered with a synchronous init by mistake.
//!
//! # See Also
//!
//! 1. [`ServiceRegistry`](crate::registry::ServiceRegistry)

pub mod daemon;

pub use daemon::{DaemonHandle, Shutdown};

use crate::registry::Launcher;

use futures::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    future::Future,
    sync::Arc,
};

/// Synchronous init of a utility service.
pub type UtilityInit = Box<dyn FnMut(&mut Launcher<'_>) -> anyhow::Result<()> + Send>;

/// Init of a daemon service producing the task to run in the background.
pub type DaemonInit = Arc<dyn Fn(Shutdown) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Best-effort cleanup invoked on stop.
pub type Cleanup = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// Kind of service.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Runs init synchronously, and holds no resource afterwards.
    #[default]
    Utility,

    /// Runs init as a long-lived background task.
    Daemon,
}

impl Display for ServiceKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Utility => fmt.pad("utility"),
            Self::Daemon => fmt.pad("daemon"),
        }
    }
}

/// Lifecycle status of a service.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ServiceStatus {
    #[default]
    Registered,
    Running,
    Stopped,
    Errored,
}

impl Display for ServiceStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Registered => fmt.pad("registered"),
            Self::Running => fmt.pad("running"),
            Self::Stopped => fmt.pad("stopped"),
            Self::Errored => fmt.pad("errored"),
        }
    }
}

/// Init operation of a service.
///
/// A utility init is kept in an [`Option`], because the registry takes it
/// out while it runs so the init itself can borrow the registry through a
/// [`Launcher`].
pub(crate) enum Init {
    Utility(Option<UtilityInit>),
    Daemon(DaemonInit),
}

/// A named unit of functionality.
///
/// Built through [`Service::utility`] or [`Service::daemon`], and handed over
/// to a [`ServiceRegistry`](crate::registry::ServiceRegistry) for lifecycle
/// management. Registration never executes the init.
pub struct Service {
    pub(crate) name: String,
    pub(crate) init: Init,
    pub(crate) cleanup: Option<Cleanup>,
    pub(crate) dependencies: Vec<String>,
    pub(crate) status: ServiceStatus,
    pub(crate) handle: Option<DaemonHandle>,
}

impl Service {
    /// Construct new utility service.
    pub fn utility<F>(name: impl Into<String>, init: F) -> Self
    where
        F: FnMut(&mut Launcher<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        Self::with_init(name, Init::Utility(Some(Box::new(init))))
    }

    /// Construct new daemon service.
    ///
    /// The init is called once per start, and the future it returns is
    /// spawned on the registry's runtime. The future should finish once the
    /// given [`Shutdown`] resolves.
    pub fn daemon<F, Fut>(name: impl Into<String>, init: F) -> Self
    where
        F: Fn(Shutdown) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let init: DaemonInit = Arc::new(move |shutdown: Shutdown| init(shutdown).boxed());
        Self::with_init(name, Init::Daemon(init))
    }

    fn with_init(name: impl Into<String>, init: Init) -> Self {
        Self {
            name: name.into(),
            init,
            cleanup: None,
            dependencies: Vec::new(),
            status: ServiceStatus::Registered,
            handle: None,
        }
    }

    /// Attach cleanup operation to run on stop.
    pub fn cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// List services that must be running before this one starts.
    ///
    /// Dependencies do not need to be registered yet.
    pub fn depends_on(mut self, dependencies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        for dependency in dependencies {
            let dependency = dependency.into();
            // INVARIANT: No duplicate dependencies.
            if !self.dependencies.contains(&dependency) {
                self.dependencies.push(dependency);
            }
        }

        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ServiceKind {
        match self.init {
            Init::Utility(_) => ServiceKind::Utility,
            Init::Daemon(_) => ServiceKind::Daemon,
        }
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn status(&self) -> ServiceStatus {
        self.status
    }

    /// Handle of background task, if running daemon.
    pub fn handle(&self) -> Option<&DaemonHandle> {
        self.handle.as_ref()
    }

    pub(crate) fn summary(&self) -> ServiceSummary {
        ServiceSummary {
            name: self.name.clone(),
            kind: self.kind(),
            status: self.status,
            dependencies: self.dependencies.clone(),
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("Service")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("has_cleanup", &self.cleanup.is_some())
            .field("dependencies", &self.dependencies)
            .field("status", &self.status)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Point-in-time view of a registered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSummary {
    pub name: String,
    pub kind: ServiceKind,
    pub status: ServiceStatus,
    pub dependencies: Vec<String>,
}

impl Display for ServiceSummary {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{:<24} {:<8} {:<10}", self.name, self.kind, self.status)?;
        if !self.dependencies.is_empty() {
            write!(fmt, " needs {}", self.dependencies.join(", "))?;
        }

        Ok(())
    }
}
