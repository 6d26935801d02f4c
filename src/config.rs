// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout for service manifests that svcrc uses to simplify the
//! process of serialization and deserialization. File I/O is left to the
//! caller to figure out, see [`store`](crate::store).

use crate::{registry::RegistryOptions, service::ServiceKind};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

/// Service manifest layout.
///
/// A __service manifest__ is a simple configuration file that lists every
/// service the host should manage, along with a few settings on how to
/// manage them.
///
/// # General Layout
///
/// A manifest is composed of two basic parts: settings and services. The
/// settings section configures the registry and the shell used to run
/// commands. Each service entry defines one service through shell commands.
/// Services can list other services as dependencies by name.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ServiceManifest {
    /// Settings for service management.
    #[serde(default)]
    pub settings: ManifestSettings,

    /// Listing of service definitions.
    #[serde(default, rename = "service", skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceDefinition>,
}

impl ServiceManifest {
    /// Add service definition, replacing any definition of the same name in
    /// place.
    pub fn insert(&mut self, definition: ServiceDefinition) {
        match self
            .services
            .iter_mut()
            .find(|entry| entry.name == definition.name)
        {
            Some(entry) => *entry = definition,
            None => self.services.push(definition),
        }
    }

    /// Find service definition by name.
    pub fn get(&self, name: impl AsRef<str>) -> Option<&ServiceDefinition> {
        self.services
            .iter()
            .find(|entry| entry.name == name.as_ref())
    }
}

impl FromStr for ServiceManifest {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let parsed: ServiceManifest = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Later duplicates replace earlier ones, like re-registration.
        let mut manifest = ServiceManifest {
            settings: parsed.settings,
            services: Vec::with_capacity(parsed.services.len()),
        };
        for mut definition in parsed.services {
            if definition.name.trim().is_empty() {
                return Err(ConfigError::EmptyServiceName);
            }

            // INVARIANT: Perform shell expansion on working directory field.
            if let Some(dir) = definition.working_dir.take() {
                let expanded = shellexpand::full(dir.to_string_lossy().as_ref())
                    .map_err(ConfigError::ShellExpansion)?
                    .into_owned();
                definition.working_dir = Some(PathBuf::from(expanded));
            }

            manifest.insert(definition);
        }

        Ok(manifest)
    }
}

impl Display for ServiceManifest {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Service management settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManifestSettings {
    /// Interpreter used to run commands as `<shell> -c <command>`.
    pub shell: String,

    /// Milliseconds to wait before checking that a daemon is alive.
    pub liveness_check_ms: u64,

    /// Milliseconds to wait for a daemon to exit after signaling it.
    pub stop_grace_ms: u64,

    /// Name of the service that starts every other service.
    pub coordinator: String,
}

impl ManifestSettings {
    /// Registry timing options described by these settings.
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            liveness_grace: Duration::from_millis(self.liveness_check_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }
}

impl Default for ManifestSettings {
    fn default() -> Self {
        let options = RegistryOptions::default();
        Self {
            shell: "sh".into(),
            liveness_check_ms: options.liveness_grace.as_millis() as u64,
            stop_grace_ms: options.stop_grace.as_millis() as u64,
            coordinator: "all".into(),
        }
    }
}

/// Service definition.
///
/// Defines a service through shell commands.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ServiceDefinition {
    /// Unique name of service.
    pub name: String,

    /// Brief description of what the service does.
    pub description: Option<String>,

    /// Kind of service, "utility" or "daemon".
    #[serde(default)]
    pub kind: ServiceKind,

    /// Command to run on start.
    pub init: String,

    /// Command to run on stop.
    pub cleanup: Option<String>,

    /// Names of services that must be running first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Directory to run commands in.
    pub working_dir: Option<PathBuf>,
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Service entry without a name.
    #[error("service definition has empty name")]
    EmptyServiceName,
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
