// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Modular shell service management.
//!
//! svcrc splits a shell's startup logic into named __services__, e.g.,
//! environment setup, prompt configuration, or a background ssh agent. Each
//! service lists the services it depends on. The [`ServiceRegistry`] brings
//! them up in dependency order exactly once each, keeps track of background
//! daemons, and tears everything down again when the host exits.

pub mod command;
pub mod config;
pub mod path;
pub mod registry;
pub mod service;
pub mod store;

pub use config::{ManifestSettings, ServiceDefinition, ServiceManifest};
pub use registry::{Launcher, RegistryError, RegistryOptions, ServiceRegistry, SharedRegistry};
pub use service::{Service, ServiceKind, ServiceStatus, ServiceSummary, Shutdown};
pub use store::ManifestStore;
