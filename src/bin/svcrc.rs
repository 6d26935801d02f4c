// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use svcrc::{
    command::service_from_definition,
    config::{ServiceDefinition, ServiceManifest},
    path::default_config_dir,
    store::ManifestStore,
    Service, ServiceKind, ServiceRegistry,
};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::{path::PathBuf, process::exit, time::Duration};
use tokio::runtime::Runtime;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  svcrc [options] <svcrc-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to manifest store instead of the default.
    #[arg(short, long, global = true, value_name = "dir")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let store = match self.config {
            Some(root) => ManifestStore::open(root),
            None => ManifestStore::open(default_config_dir()?),
        };

        match self.command {
            Command::Init => run_init(&store),
            Command::List => run_list(&store),
            Command::Check => run_check(&store),
            Command::Up(opts) => run_up(&store, opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Write template manifest into manifest store.
    #[command(override_usage = "svcrc init [options]")]
    Init,

    /// List configured services.
    #[command(override_usage = "svcrc list [options]")]
    List,

    /// Check that every dependency resolves without cycles.
    #[command(override_usage = "svcrc check [options]")]
    Check,

    /// Start services, and stop them again on exit.
    #[command(override_usage = "svcrc up [options] [<service>]...")]
    Up(UpOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct UpOptions {
    /// Services to start, all of them if none given.
    #[arg(value_name = "service")]
    pub services: Vec<String>,

    /// Only print the order services would start in.
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn run_init(store: &ManifestStore) -> Result<()> {
    let path = store.init(&template_manifest())?;
    info!("edit {:?} to define your services", path.display());

    Ok(())
}

fn run_list(store: &ManifestStore) -> Result<()> {
    let manifest = store.load()?;
    for definition in &manifest.services {
        let mut line = format!("{:<24} {:<8}", definition.name, definition.kind);
        if !definition.dependencies.is_empty() {
            line.push_str(format!(" needs {}", definition.dependencies.join(", ")).as_str());
        }
        if let Some(description) = &definition.description {
            line.push_str(format!("  # {description}").as_str());
        }
        println!("{line}");
    }

    Ok(())
}

fn run_check(store: &ManifestStore) -> Result<()> {
    let manifest = store.load()?;
    let runtime = Runtime::new()?;
    let registry = build_registry(&manifest, &runtime)?;

    let mut broken = 0;
    for definition in &manifest.services {
        match registry.dependency_order(&definition.name) {
            Ok(order) => info!("{}: {}", definition.name, order.join(" -> ")),
            Err(error) => {
                error!("{}: {error}", definition.name);
                broken += 1;
            }
        }
    }

    if broken > 0 {
        bail!("{broken} services have unresolvable dependencies");
    }

    Ok(())
}

fn run_up(store: &ManifestStore, opts: UpOptions) -> Result<()> {
    let manifest = store.load()?;
    let runtime = Runtime::new()?;
    let mut registry = build_registry(&manifest, &runtime)?;

    let targets = if opts.services.is_empty() {
        manifest
            .services
            .iter()
            .map(|definition| definition.name.clone())
            .collect::<Vec<_>>()
    } else {
        opts.services
    };

    if opts.dry_run {
        for target in &targets {
            println!("{}", registry.dependency_order(target)?.join(" -> "));
        }
        return Ok(());
    }

    let coordinator = manifest.settings.coordinator.clone();
    if registry.contains(&coordinator) {
        bail!("coordinator name {coordinator:?} collides with a configured service");
    }
    registry.register(coordinator_service(&coordinator, targets)?)?;
    registry.start(&coordinator)?;

    for summary in registry.services() {
        if summary.name != coordinator {
            println!("{summary}");
        }
    }

    runtime.block_on(async {
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tick.tick() => {
                    for (name, status) in registry.reap() {
                        warn!("daemon {name} is now {status}");
                    }
                }
            }
        }
    });

    info!("shutting down");
    let failures = registry.stop_all();
    if !failures.is_empty() {
        warn!("{} services failed to clean up", failures.len());
    }

    Ok(())
}

fn build_registry(manifest: &ServiceManifest, runtime: &Runtime) -> Result<ServiceRegistry> {
    let mut registry = ServiceRegistry::with_options(
        runtime.handle().clone(),
        manifest.settings.registry_options(),
    );
    for definition in &manifest.services {
        registry.register(service_from_definition(definition, &manifest.settings))?;
    }

    Ok(registry)
}

/// Service that starts every target, reporting failures without aborting.
fn coordinator_service(name: &str, targets: Vec<String>) -> Result<Service> {
    let bar = ProgressBar::new(targets.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:30.yellow/blue}] {pos}/{len} {msg}")?
            .progress_chars("-Cco."),
    );

    Ok(Service::utility(name, move |launcher| {
        for target in &targets {
            bar.set_message(target.clone());
            if let Err(error) = launcher.start(target) {
                bar.suspend(|| warn!("{target}: {error:#}"));
            }
            bar.inc(1);
        }
        bar.finish_and_clear();

        Ok(())
    }))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(error) => {
                warn!("cannot listen for SIGTERM: {error}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn template_manifest() -> ServiceManifest {
    let mut manifest = ServiceManifest::default();
    manifest.insert(ServiceDefinition {
        name: "env".into(),
        description: Some("export environment variables".into()),
        init: "if test -f ~/.env; then . ~/.env; fi".into(),
        ..ServiceDefinition::default()
    });
    manifest.insert(ServiceDefinition {
        name: "ssh-agent".into(),
        description: Some("keep an ssh agent around".into()),
        kind: ServiceKind::Daemon,
        init: "exec ssh-agent -D -a \"$XDG_RUNTIME_DIR/ssh-agent.socket\"".into(),
        cleanup: Some("rm -f \"$XDG_RUNTIME_DIR/ssh-agent.socket\"".into()),
        dependencies: vec!["env".into()],
        ..ServiceDefinition::default()
    });

    manifest
}
