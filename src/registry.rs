// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Service registry and lifecycle management.
//!
//! The __service registry__ owns every registered [`Service`], and brings
//! them up or down in dependency order, exactly once each.
//!
//! # Dependency Resolution
//!
//! Starting a service first starts each of its dependencies, recursively.
//! A service that is already running is skipped, which keeps diamond shaped
//! dependency graphs and repeated calls cheap. The names currently being
//! resolved are tracked on a stack, so a dependency cycle is reported as
//! [`RegistryError::DependencyCycle`] instead of recursing forever.
//!
//! Dependencies are not required to exist at registration time. A missing
//! dependency is only discovered once something tries to start it.
//!
//! # Coordinators
//!
//! Utility inits receive a [`Launcher`] that can start other services while
//! the registry is busy starting the utility itself. This allows a
//! __coordinator__ service whose init starts everything else, letting the
//! host bring the whole system up with one call.
//!
//! # Concurrency
//!
//! The registry itself is synchronous. Daemons are spawned on the Tokio
//! runtime behind the handle given at construction, followed by a short
//! blocking liveness check. The handle must belong to a multi-thread
//! runtime, because a current-thread runtime only polls spawned tasks inside
//! its own `block_on`, which would leave the liveness check blind. Starting
//! a daemon on a current-thread handle fails with
//! [`RegistryError::DaemonLaunchFailure`]. Hosts that share a registry
//! between threads should go through [`SharedRegistry`].

use crate::service::{
    daemon::{blocking_sleep, DaemonExit},
    DaemonHandle, Init, Service, ServiceStatus, ServiceSummary, Shutdown,
};

use std::{
    any::Any,
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    sync::watch,
};
use tracing::{debug, info, instrument, warn};

/// Timing knobs of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Delay between launching a daemon and probing whether it is alive.
    pub liveness_grace: Duration,

    /// Upper bound on waiting for a daemon to exit after signaling it.
    pub stop_grace: Duration,
}

/// Interval between liveness probes while waiting for a daemon to exit.
pub(crate) const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            liveness_grace: Duration::from_millis(100),
            stop_grace: Duration::from_millis(500),
        }
    }
}

/// Registry of named services.
pub struct ServiceRegistry {
    runtime: Handle,
    options: RegistryOptions,
    services: BTreeMap<String, Service>,

    // INVARIANT: Holds exactly the running services, in the order they came up.
    launch_order: Vec<String>,
}

impl ServiceRegistry {
    /// Construct new registry spawning daemons on given runtime.
    pub fn new(runtime: Handle) -> Self {
        Self::with_options(runtime, RegistryOptions::default())
    }

    /// Construct new registry with custom timing options.
    pub fn with_options(runtime: Handle, options: RegistryOptions) -> Self {
        Self {
            runtime,
            options,
            services: BTreeMap::new(),
            launch_order: Vec::new(),
        }
    }

    /// Register a service.
    ///
    /// Inserts the service with status [`ServiceStatus::Registered`], or
    /// replaces an existing entry of the same name. A running entry is
    /// stopped before being replaced. Never executes the service's init.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::EmptyName`] if service name is empty.
    #[instrument(skip(self, service), fields(name = service.name()), level = "debug")]
    pub fn register(&mut self, mut service: Service) -> Result<()> {
        if service.name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }

        if self.is_running(&service.name) {
            warn!("replacing running service {:?}", service.name);
            if let Err(error) = self.stop(&service.name) {
                warn!("{error}");
            }
        }

        service.status = ServiceStatus::Registered;
        service.handle = None;
        if self.services.insert(service.name.clone(), service).is_some() {
            debug!("overwrote previous registration");
        }

        Ok(())
    }

    /// Start a service, starting its dependencies first.
    ///
    /// Idempotent: starting a running service is a no-op. Errored or stopped
    /// services simply re-run their init.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::UnknownService`] if the service, or any
    ///   service it transitively depends on, is not registered.
    /// - Return [`RegistryError::DependencyCycle`] if a cycle is reachable
    ///   from the service.
    /// - Return [`RegistryError::InitFailure`] if a utility init fails.
    /// - Return [`RegistryError::DaemonLaunchFailure`] if a daemon does not
    ///   survive its liveness check.
    pub fn start(&mut self, name: impl AsRef<str>) -> Result<()> {
        let mut resolving = Vec::new();
        self.start_resolving(name.as_ref(), &mut resolving)
    }

    fn start_resolving(&mut self, name: &str, resolving: &mut Vec<String>) -> Result<()> {
        let service = self
            .services
            .get(name)
            .ok_or_else(|| RegistryError::UnknownService(name.into()))?;

        if service.status == ServiceStatus::Running {
            debug!("service {name:?} already running");
            return Ok(());
        }

        check_cycle(name, resolving)?;
        let dependencies = service.dependencies.clone();

        resolving.push(name.into());
        let result = self.start_after_dependencies(name, &dependencies, resolving);
        resolving.pop();

        result
    }

    fn start_after_dependencies(
        &mut self,
        name: &str,
        dependencies: &[String],
        resolving: &mut Vec<String>,
    ) -> Result<()> {
        for dependency in dependencies {
            debug!("service {name:?} needs {dependency:?}");
            self.start_resolving(dependency, resolving)?;
        }

        let service = self
            .services
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownService(name.into()))?;

        match &mut service.init {
            Init::Utility(slot) => {
                let init = slot.take();
                self.launch_utility(name, init, resolving)
            }
            Init::Daemon(init) => {
                let init = init.clone();
                self.launch_daemon(name, init)
            }
        }
    }

    #[instrument(skip(self, init, resolving), level = "debug")]
    fn launch_utility(
        &mut self,
        name: &str,
        init: Option<crate::service::UtilityInit>,
        resolving: &mut Vec<String>,
    ) -> Result<()> {
        // INVARIANT: Init is only missing while it runs further up the stack,
        //   which the resolving stack already reports as a cycle.
        let Some(mut init) = init else {
            return Err(RegistryError::DependencyCycle(vec![name.into(), name.into()]));
        };

        info!("start {name}");
        let result = catch_unwind(AssertUnwindSafe(|| {
            init(&mut Launcher {
                registry: &mut *self,
                resolving: &mut *resolving,
            })
        }))
        .unwrap_or_else(|payload| {
            Err(anyhow::anyhow!("init panicked: {}", panic_message(&*payload)))
        });

        let Some(service) = self.services.get_mut(name) else {
            return Err(RegistryError::UnknownService(name.into()));
        };
        if let Init::Utility(slot) = &mut service.init {
            *slot = Some(init);
        }

        match result {
            Ok(()) => {
                service.status = ServiceStatus::Running;
                self.launch_order.push(name.into());
                Ok(())
            }
            Err(error) => {
                service.status = ServiceStatus::Errored;
                warn!("service {name:?} failed to start: {error:#}");
                Err(RegistryError::InitFailure {
                    name: name.into(),
                    source: error.into(),
                })
            }
        }
    }

    #[instrument(skip(self, init), level = "debug")]
    fn launch_daemon(&mut self, name: &str, init: crate::service::DaemonInit) -> Result<()> {
        if self.runtime.runtime_flavor() == RuntimeFlavor::CurrentThread {
            if let Some(service) = self.services.get_mut(name) {
                service.status = ServiceStatus::Errored;
            }

            return Err(RegistryError::DaemonLaunchFailure {
                name: name.into(),
                reason: "current-thread runtime cannot run daemons in the background".into(),
            });
        }

        info!("launch daemon {name}");
        let (terminate, receiver) = watch::channel(false);
        let task = self.runtime.spawn(init(Shutdown::new(receiver)));
        let handle = DaemonHandle::new(task, terminate);

        // INVARIANT: Daemon counts as running only if still alive after grace.
        blocking_sleep(self.options.liveness_grace);
        let service = self
            .services
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownService(name.into()))?;

        if handle.is_alive() {
            debug!("daemon {name:?} alive after {:?}", handle.uptime());
            service.handle = Some(handle);
            service.status = ServiceStatus::Running;
            self.launch_order.push(name.into());
            return Ok(());
        }

        service.status = ServiceStatus::Errored;
        let reason = handle
            .into_exit()
            .map(|exit| exit.describe())
            .unwrap_or_else(|| "not alive after launch".into());
        warn!("daemon {name:?} failed liveness check: {reason}");

        Err(RegistryError::DaemonLaunchFailure {
            name: name.into(),
            reason,
        })
    }

    /// Stop a service.
    ///
    /// Signals a running daemon to terminate, waiting at most the configured
    /// stop grace, then runs the cleanup operation if any. The service always
    /// ends up [`ServiceStatus::Stopped`], even if cleanup fails. Stopping a
    /// service that is not running is a no-op.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::UnknownService`] if service is not registered.
    /// - Return [`RegistryError::CleanupFailure`] if cleanup fails. The service
    ///   is stopped regardless.
    #[instrument(skip(self, name), fields(name = name.as_ref()), level = "debug")]
    pub fn stop(&mut self, name: impl AsRef<str>) -> Result<()> {
        let name = name.as_ref();
        let stop_grace = self.options.stop_grace;
        let service = self
            .services
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownService(name.into()))?;

        if service.status != ServiceStatus::Running {
            debug!("service {name:?} not running");
            return Ok(());
        }

        info!("stop {name}");
        if let Some(handle) = service.handle.take() {
            if !handle.signal_terminate() {
                debug!("daemon {name:?} already dropped its shutdown receiver");
            }

            if !handle.wait_finished(stop_grace) {
                warn!("daemon {name:?} still running after {stop_grace:?}, detaching");
            }
        }

        service.status = ServiceStatus::Stopped;
        self.launch_order.retain(|launched| launched != name);

        run_cleanup(service)
    }

    /// Stop every running service.
    ///
    /// Services are stopped in reverse launch order. Failures are collected
    /// and logged, but never keep other services from stopping.
    pub fn stop_all(&mut self) -> Vec<RegistryError> {
        let mut failures = Vec::new();
        let order = self.launch_order.iter().rev().cloned().collect::<Vec<_>>();
        for name in order {
            if let Err(error) = self.stop(&name) {
                warn!("{error}");
                failures.push(error);
            }
        }

        failures
    }

    /// Collect daemons that exited on their own.
    ///
    /// A clean exit marks the daemon as stopped, while an error exit marks it
    /// as errored. Cleanup runs either way.
    pub fn reap(&mut self) -> Vec<(String, ServiceStatus)> {
        let mut reaped = Vec::new();
        for service in self.services.values_mut() {
            let finished = service
                .handle
                .as_ref()
                .is_some_and(|handle| !handle.is_alive());
            if !finished {
                continue;
            }

            let exit = service.handle.take().and_then(DaemonHandle::into_exit);
            service.status = match exit {
                Some(DaemonExit::Clean) => {
                    info!("daemon {:?} exited", service.name);
                    ServiceStatus::Stopped
                }
                Some(exit) => {
                    warn!("daemon {:?} {}", service.name, exit.describe());
                    ServiceStatus::Errored
                }
                None => ServiceStatus::Errored,
            };

            if let Err(error) = run_cleanup(service) {
                warn!("{error}");
            }
            reaped.push((service.name.clone(), service.status));
        }

        self.launch_order
            .retain(|name| !reaped.iter().any(|(done, _)| done == name));

        reaped
    }

    /// Check if service is running.
    pub fn is_running(&self, name: impl AsRef<str>) -> bool {
        self.status(name) == Some(ServiceStatus::Running)
    }

    /// Current status of service, if registered.
    pub fn status(&self, name: impl AsRef<str>) -> Option<ServiceStatus> {
        self.services.get(name.as_ref()).map(Service::status)
    }

    /// Check if service is registered.
    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.services.contains_key(name.as_ref())
    }

    /// Summaries of all registered services, sorted by name.
    pub fn services(&self) -> Vec<ServiceSummary> {
        self.services.values().map(Service::summary).collect()
    }

    /// Resolve the order that starting a service would bring services up in.
    ///
    /// Purely inspects registered metadata. Running services are included,
    /// and no init is executed.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::UnknownService`] if any service in the
    ///   dependency graph is not registered.
    /// - Return [`RegistryError::DependencyCycle`] if a cycle is reachable.
    pub fn dependency_order(&self, name: impl AsRef<str>) -> Result<Vec<String>> {
        let mut order = Vec::new();
        let mut resolving = Vec::new();
        self.resolve_order(name.as_ref(), &mut resolving, &mut order)?;

        Ok(order)
    }

    fn resolve_order(
        &self,
        name: &str,
        resolving: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        let service = self
            .services
            .get(name)
            .ok_or_else(|| RegistryError::UnknownService(name.into()))?;

        if order.iter().any(|done| done == name) {
            return Ok(());
        }

        check_cycle(name, resolving)?;
        resolving.push(name.into());
        for dependency in &service.dependencies {
            self.resolve_order(dependency, resolving, order)?;
        }
        resolving.pop();
        order.push(name.into());

        Ok(())
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("ServiceRegistry")
            .field("options", &self.options)
            .field("services", &self.services)
            .field("launch_order", &self.launch_order)
            .finish()
    }
}

fn check_cycle(name: &str, resolving: &[String]) -> Result<()> {
    if let Some(position) = resolving.iter().position(|entry| entry == name) {
        let mut cycle = resolving[position..].to_vec();
        cycle.push(name.into());
        return Err(RegistryError::DependencyCycle(cycle));
    }

    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).into();
    }

    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }

    "unknown panic payload".into()
}

fn run_cleanup(service: &mut Service) -> Result<()> {
    let Some(cleanup) = service.cleanup.as_mut() else {
        return Ok(());
    };

    debug!("cleanup {}", service.name);
    cleanup().map_err(|error| RegistryError::CleanupFailure {
        name: service.name.clone(),
        source: error.into(),
    })
}

/// Access to the registry from inside a utility init.
///
/// Starting services through the launcher continues the dependency
/// resolution that is currently running, so cycles that pass through a
/// coordinator are still detected.
pub struct Launcher<'a> {
    registry: &'a mut ServiceRegistry,
    resolving: &'a mut Vec<String>,
}

impl Launcher<'_> {
    /// Start a service, and its dependencies.
    ///
    /// # Errors
    ///
    /// - Same as [`ServiceRegistry::start`].
    pub fn start(&mut self, name: impl AsRef<str>) -> Result<()> {
        self.registry.start_resolving(name.as_ref(), self.resolving)
    }

    /// Check if service is running.
    pub fn is_running(&self, name: impl AsRef<str>) -> bool {
        self.registry.is_running(name)
    }

    /// Current status of service, if registered.
    pub fn status(&self, name: impl AsRef<str>) -> Option<ServiceStatus> {
        self.registry.status(name)
    }
}

/// Registry shared between threads.
///
/// Serializes every operation behind one mutex, such that concurrent starts
/// of services sharing a dependency never race on that dependency's status.
#[derive(Debug, Clone)]
pub struct SharedRegistry {
    inner: Arc<Mutex<ServiceRegistry>>,
}

impl SharedRegistry {
    /// Construct new shared registry.
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            inner: Arc::new(Mutex::new(registry)),
        }
    }

    /// Lock registry for a sequence of operations.
    pub fn lock(&self) -> MutexGuard<'_, ServiceRegistry> {
        // INVARIANT: Panicking utility inits are caught by the registry, so a
        //   poisoned lock still guards a consistent registry.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, service: Service) -> Result<()> {
        self.lock().register(service)
    }

    pub fn start(&self, name: impl AsRef<str>) -> Result<()> {
        self.lock().start(name)
    }

    pub fn stop(&self, name: impl AsRef<str>) -> Result<()> {
        self.lock().stop(name)
    }

    pub fn stop_all(&self) -> Vec<RegistryError> {
        self.lock().stop_all()
    }

    pub fn is_running(&self, name: impl AsRef<str>) -> bool {
        self.lock().is_running(name)
    }

    pub fn status(&self, name: impl AsRef<str>) -> Option<ServiceStatus> {
        self.lock().status(name)
    }
}

/// All possible error types for service lifecycle management.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Service name is empty.
    #[error("service name cannot be empty")]
    EmptyName,

    /// Service was never registered.
    #[error("unknown service {0:?}")]
    UnknownService(String),

    /// Dependency graph contains a cycle.
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// Utility init failed.
    #[error("service {name:?} failed to initialize")]
    InitFailure {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Daemon did not survive its liveness check.
    #[error("daemon {name:?} failed to launch: {reason}")]
    DaemonLaunchFailure { name: String, reason: String },

    /// Cleanup failed during stop.
    #[error("service {name:?} failed to clean up")]
    CleanupFailure {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Friendly result alias :3
pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::runtime::Runtime;

    fn fast_registry(runtime: &Runtime) -> ServiceRegistry {
        ServiceRegistry::with_options(
            runtime.handle().clone(),
            RegistryOptions {
                liveness_grace: Duration::from_millis(50),
                stop_grace: Duration::from_secs(2),
            },
        )
    }

    fn logging(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Service {
        let log = log.clone();
        Service::utility(name, move |_| {
            log.lock().unwrap().push(name.into());
            Ok(())
        })
    }

    fn waits_for_shutdown(name: &str) -> Service {
        Service::daemon(name, |mut shutdown: Shutdown| async move {
            shutdown.requested().await;
            Ok(())
        })
    }

    #[test]
    fn dependencies_start_first() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        let log = Arc::new(Mutex::new(Vec::new()));

        // INVARIANT: Registration order does not matter.
        registry.register(logging("prompt", &log).depends_on(["config"]))?;
        registry.register(logging("config", &log))?;

        registry.start("prompt")?;
        assert_eq!(*log.lock().unwrap(), vec!["config", "prompt"]);
        assert!(registry.is_running("config"));
        assert!(registry.is_running("prompt"));

        Ok(())
    }

    #[test]
    fn start_is_idempotent() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        registry.register(Service::utility("env", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))?;

        registry.start("env")?;
        registry.start("env")?;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        Ok(())
    }

    #[test]
    fn diamond_dependency_runs_once() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(logging("base", &log))?;
        registry.register(logging("left", &log).depends_on(["base"]))?;
        registry.register(logging("right", &log).depends_on(["base"]))?;
        registry.register(logging("top", &log).depends_on(["left", "right"]))?;

        registry.start("top")?;
        assert_eq!(*log.lock().unwrap(), vec!["base", "left", "right", "top"]);

        Ok(())
    }

    #[test]
    fn cycle_is_reported() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        registry.register(Service::utility("a", |_| Ok(())).depends_on(["b"]))?;
        registry.register(Service::utility("b", |_| Ok(())).depends_on(["a"]))?;

        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = sender.send(registry.start("a"));
        });

        let result = receiver.recv_timeout(Duration::from_secs(5))?;
        match result {
            Err(RegistryError::DependencyCycle(cycle)) => assert_eq!(cycle, ["a", "b", "a"]),
            other => panic!("expected dependency cycle, got {other:?}"),
        }

        Ok(())
    }

    #[test]
    fn unknown_service_is_reported() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);

        let result = registry.start("nonexistent");
        assert!(matches!(result, Err(RegistryError::UnknownService(name)) if name == "nonexistent"));

        Ok(())
    }

    #[test]
    fn stopping_unknown_service_is_reported() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);

        let result = registry.stop("nonexistent");
        assert!(matches!(result, Err(RegistryError::UnknownService(name)) if name == "nonexistent"));

        Ok(())
    }

    #[test]
    fn missing_dependency_aborts_dependent() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        registry.register(Service::utility("prompt", |_| Ok(())).depends_on(["git"]))?;

        let result = registry.start("prompt");
        assert!(matches!(result, Err(RegistryError::UnknownService(name)) if name == "git"));
        assert_eq!(registry.status("prompt"), Some(ServiceStatus::Registered));

        Ok(())
    }

    #[test]
    fn failed_init_marks_errored_and_blocks_dependents() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        registry.register(Service::utility("venv", |_| anyhow::bail!("no python")))?;
        registry.register(Service::utility("prompt", |_| Ok(())).depends_on(["venv"]))?;

        let result = registry.start("prompt");
        match result {
            Err(RegistryError::InitFailure { name, source }) => {
                assert_eq!(name, "venv");
                assert_eq!(source.to_string(), "no python");
            }
            other => panic!("expected init failure, got {other:?}"),
        }
        assert_eq!(registry.status("venv"), Some(ServiceStatus::Errored));
        assert!(!registry.is_running("prompt"));

        Ok(())
    }

    #[test]
    fn errored_service_can_be_retried() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        registry.register(Service::utility("flaky", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("first try fails");
            }
            Ok(())
        }))?;

        assert!(registry.start("flaky").is_err());
        registry.start("flaky")?;
        assert!(registry.is_running("flaky"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        Ok(())
    }

    #[test]
    fn panicking_init_marks_errored_and_can_be_retried() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let shared = SharedRegistry::new(fast_registry(&runtime));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        shared.register(Service::utility("env", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("env file vanished");
            }
            Ok(())
        }))?;

        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.start("env"))
        };
        match worker.join().expect("worker panicked") {
            Err(RegistryError::InitFailure { name, source }) => {
                assert_eq!(name, "env");
                assert_eq!(source.to_string(), "init panicked: env file vanished");
            }
            other => panic!("expected init failure, got {other:?}"),
        }
        assert_eq!(shared.status("env"), Some(ServiceStatus::Errored));

        shared.start("env")?;
        assert!(shared.is_running("env"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        Ok(())
    }

    #[test]
    fn current_thread_runtime_rejects_daemons() -> anyhow::Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let mut registry = ServiceRegistry::new(runtime.handle().clone());
        registry.register(Service::daemon("watcher", |_| async {
            Err(anyhow::anyhow!("cannot watch"))
        }))?;

        let result = registry.start("watcher");
        assert!(matches!(
            result,
            Err(RegistryError::DaemonLaunchFailure { ref name, .. }) if name == "watcher"
        ));
        assert!(!registry.is_running("watcher"));
        assert_eq!(registry.status("watcher"), Some(ServiceStatus::Errored));

        Ok(())
    }

    #[test]
    fn daemon_exiting_early_fails_launch() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        registry.register(Service::daemon("watcher", |_| async {
            Err(anyhow::anyhow!("cannot watch"))
        }))?;

        let result = registry.start("watcher");
        assert!(matches!(
            result,
            Err(RegistryError::DaemonLaunchFailure { ref name, .. }) if name == "watcher"
        ));
        assert!(!registry.is_running("watcher"));
        assert_eq!(registry.status("watcher"), Some(ServiceStatus::Errored));

        Ok(())
    }

    #[test]
    fn stop_clears_daemon_handle() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        registry.register(waits_for_shutdown("agent"))?;

        registry.start("agent")?;
        assert!(registry.services.get("agent").and_then(Service::handle).is_some());

        registry.stop("agent")?;
        assert!(registry.services.get("agent").and_then(Service::handle).is_none());
        assert_eq!(registry.status("agent"), Some(ServiceStatus::Stopped));

        Ok(())
    }

    #[test]
    fn stop_after_daemon_exited_on_its_own() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        registry.register(Service::daemon("short", |_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }))?;

        registry.start("short")?;
        std::thread::sleep(Duration::from_millis(400));
        registry.stop("short")?;
        assert!(registry.services.get("short").and_then(Service::handle).is_none());
        assert_eq!(registry.status("short"), Some(ServiceStatus::Stopped));

        Ok(())
    }

    #[test]
    fn stop_all_survives_failing_cleanup() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        registry.register(Service::utility("env", |_| Ok(())))?;
        registry.register(
            Service::utility("history", |_| Ok(()))
                .cleanup(|| anyhow::bail!("history file locked")),
        )?;
        registry.register(waits_for_shutdown("agent").depends_on(["env"]))?;

        registry.start("history")?;
        registry.start("agent")?;

        let failures = registry.stop_all();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            &failures[0],
            RegistryError::CleanupFailure { name, .. } if name == "history"
        ));
        for name in ["env", "history", "agent"] {
            assert_eq!(registry.status(name), Some(ServiceStatus::Stopped));
        }

        Ok(())
    }

    #[test]
    fn stop_all_runs_in_reverse_launch_order() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        let log = Arc::new(Mutex::new(Vec::new()));
        for (name, deps) in [("config", vec![]), ("prompt", vec!["config"])] {
            let log = log.clone();
            registry.register(
                Service::utility(name, |_| Ok(()))
                    .cleanup(move || {
                        log.lock().unwrap().push(name.to_string());
                        Ok(())
                    })
                    .depends_on(deps),
            )?;
        }

        registry.start("prompt")?;
        assert!(registry.stop_all().is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["prompt", "config"]);

        Ok(())
    }

    #[test]
    fn stopped_service_restarts() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        registry.register(Service::utility("aliases", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))?;

        registry.start("aliases")?;
        registry.stop("aliases")?;
        registry.stop("aliases")?;
        registry.start("aliases")?;
        assert!(registry.is_running("aliases"));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        Ok(())
    }

    #[test]
    fn coordinator_starts_everything() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(logging("config", &log))?;
        registry.register(logging("prompt", &log).depends_on(["config"]))?;
        registry.register(Service::utility("all", |launcher| {
            launcher.start("prompt")?;
            launcher.start("config")?;
            assert!(launcher.is_running("config"));
            Ok(())
        }))?;

        registry.start("all")?;
        assert!(registry.is_running("all"));
        assert_eq!(*log.lock().unwrap(), vec!["config", "prompt"]);

        Ok(())
    }

    #[test]
    fn cycle_through_coordinator_is_reported() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        registry.register(Service::utility("child", |_| Ok(())).depends_on(["all"]))?;
        registry.register(Service::utility("all", |launcher| {
            launcher.start("child")?;
            Ok(())
        }))?;

        let result = registry.start("all");
        match result {
            Err(RegistryError::InitFailure { name, source }) => {
                assert_eq!(name, "all");
                match source.downcast_ref::<RegistryError>() {
                    Some(RegistryError::DependencyCycle(cycle)) => {
                        assert_eq!(cycle, &["all", "child", "all"]);
                    }
                    other => panic!("expected dependency cycle source, got {other:?}"),
                }
            }
            other => panic!("expected init failure, got {other:?}"),
        }
        assert_eq!(registry.status("all"), Some(ServiceStatus::Errored));
        assert_eq!(registry.status("child"), Some(ServiceStatus::Registered));

        Ok(())
    }

    #[test]
    fn empty_name_is_rejected() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);

        let result = registry.register(Service::utility("", |_| Ok(())));
        assert!(matches!(result, Err(RegistryError::EmptyName)));

        Ok(())
    }

    #[test]
    fn reregistering_running_service_stops_it() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        registry.register(waits_for_shutdown("agent"))?;
        registry.start("agent")?;

        registry.register(waits_for_shutdown("agent"))?;
        assert_eq!(registry.status("agent"), Some(ServiceStatus::Registered));
        assert_eq!(registry.services().len(), 1);
        assert!(registry.stop_all().is_empty());

        Ok(())
    }

    #[test]
    fn reap_collects_exited_daemons() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        registry.register(Service::daemon("crashy", |_| async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Err(anyhow::anyhow!("lost connection"))
        }))?;
        registry.register(waits_for_shutdown("steady"))?;

        registry.start("crashy")?;
        registry.start("steady")?;
        std::thread::sleep(Duration::from_millis(400));

        let reaped = registry.reap();
        assert_eq!(reaped, vec![("crashy".to_string(), ServiceStatus::Errored)]);
        assert!(registry.is_running("steady"));
        registry.stop("steady")?;

        Ok(())
    }

    #[test]
    fn dependency_order_is_side_effect_free() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let mut registry = fast_registry(&runtime);
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(logging("base", &log))?;
        registry.register(logging("left", &log).depends_on(["base"]))?;
        registry.register(logging("top", &log).depends_on(["left", "base"]))?;

        assert_eq!(registry.dependency_order("top")?, ["base", "left", "top"]);
        assert!(log.lock().unwrap().is_empty());

        registry.register(logging("base", &log).depends_on(["top"]))?;
        assert!(matches!(
            registry.dependency_order("top"),
            Err(RegistryError::DependencyCycle(_))
        ));

        Ok(())
    }

    #[test]
    fn shared_registry_starts_shared_dependency_once() -> anyhow::Result<()> {
        let runtime = Runtime::new()?;
        let shared = SharedRegistry::new(fast_registry(&runtime));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        shared.register(Service::utility("env", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            Ok(())
        }))?;
        for index in 0..8 {
            shared.register(Service::utility(format!("leaf{index}"), |_| Ok(())).depends_on(["env"]))?;
        }

        let workers = (0..8)
            .map(|index| {
                let shared = shared.clone();
                std::thread::spawn(move || shared.start(format!("leaf{index}")))
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().expect("worker panicked")?;
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(shared.is_running("env"));
        assert_eq!(shared.status("leaf3"), Some(ServiceStatus::Running));
        assert!(shared.stop_all().is_empty());

        Ok(())
    }
}
