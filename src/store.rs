// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Manifest store management.
//!
//! svcrc groups service manifests together into one place called the
//! __manifest store__. The manifest store houses every service definition
//! the user wants their shell to manage.
//!
//! # Manifest Store Layout
//!
//! The manifest store can generally be placed anywhere on the user's file
//! system. However, the default location is `$XDG_CONFIG_HOME/svcrc`. The
//! store contains a main manifest named "services.toml", and a fragment
//! directory named "services.d". Every file matching "services.d/*.toml" is
//! a fragment manifest, loaded in lexical order after the main manifest.
//! Thus, a large rc setup can be split into one file per service.
//!
//! Only the main manifest provides settings. Fragments only contribute
//! service definitions. A definition that shows up again later replaces the
//! earlier one in place.

use crate::config::ServiceManifest;

use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Name of the main manifest file.
pub const MANIFEST_FILE: &str = "services.toml";

/// Name of the fragment directory.
pub const FRAGMENT_DIR: &str = "services.d";

/// Manifest store at a given root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    /// Open manifest store at target root.
    ///
    /// Does not require the root to exist yet.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to main manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Path to fragment directory.
    pub fn fragment_dir(&self) -> PathBuf {
        self.root.join(FRAGMENT_DIR)
    }

    /// List fragment manifests in lexical order.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Pattern`] if the fragment pattern is invalid.
    /// - Return [`StoreError::Glob`] if a fragment path cannot be read.
    pub fn fragments(&self) -> Result<Vec<PathBuf>> {
        let pattern = self.fragment_dir().join("*.toml");
        let pattern = pattern.to_string_lossy();
        let mut paths = glob::glob(pattern.as_ref())?.collect::<Result<Vec<_>, _>>()?;
        paths.sort();

        Ok(paths)
    }

    /// Load main manifest merged with every fragment.
    ///
    /// A missing main manifest is treated as an empty one.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::ReadManifest`] if a manifest cannot be read.
    /// - Return [`StoreError::ParseManifest`] if a manifest is invalid.
    /// - Return [`StoreError::Pattern`] or [`StoreError::Glob`] if fragment
    ///   listing fails.
    #[instrument(skip(self), fields(root = %self.root.display()), level = "debug")]
    pub fn load(&self) -> Result<ServiceManifest> {
        let main_path = self.manifest_path();
        let mut manifest = if main_path.exists() {
            read_manifest(&main_path)?
        } else {
            warn!("no main manifest at {:?}", main_path.display());
            ServiceManifest::default()
        };

        for path in self.fragments()? {
            debug!("load fragment {:?}", path.display());
            let fragment = read_manifest(&path)?;
            if fragment.settings != ServiceManifest::default().settings {
                warn!("ignoring settings in fragment {:?}", path.display());
            }

            for definition in fragment.services {
                manifest.insert(definition);
            }
        }

        info!("loaded {} service definitions", manifest.services.len());
        Ok(manifest)
    }

    /// Write a new main manifest.
    ///
    /// Creates the store root, and an empty fragment directory, if missing.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::AlreadyExists`] if main manifest already exists.
    /// - Return [`StoreError::CreateDir`] if directories cannot be created.
    /// - Return [`StoreError::WriteManifest`] if manifest cannot be written.
    #[instrument(skip(self, manifest), fields(root = %self.root.display()), level = "debug")]
    pub fn init(&self, manifest: &ServiceManifest) -> Result<PathBuf> {
        let path = self.manifest_path();
        if path.exists() {
            return Err(StoreError::AlreadyExists { path });
        }

        let fragment_dir = self.fragment_dir();
        mkdirp::mkdirp(&fragment_dir).map_err(|source| StoreError::CreateDir {
            source,
            path: fragment_dir.clone(),
        })?;

        write(&path, manifest.to_string().as_bytes()).map_err(|source| {
            StoreError::WriteManifest {
                source,
                path: path.clone(),
            }
        })?;
        info!("wrote manifest {:?}", path.display());

        Ok(path)
    }
}

fn read_manifest(path: &Path) -> Result<ServiceManifest> {
    let data = read_to_string(path).map_err(|source| StoreError::ReadManifest {
        source,
        path: path.into(),
    })?;

    data.parse().map_err(|source| StoreError::ParseManifest {
        source,
        path: path.into(),
    })
}

/// All possible error types for manifest store interaction.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Manifest cannot be read.
    #[error("failed to read manifest at {:?}", path.display())]
    ReadManifest {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Manifest content is invalid.
    #[error("failed to parse manifest at {:?}", path.display())]
    ParseManifest {
        #[source]
        source: crate::config::ConfigError,
        path: PathBuf,
    },

    /// Manifest cannot be written.
    #[error("failed to write manifest at {:?}", path.display())]
    WriteManifest {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Store directories cannot be created.
    #[error("failed to create directory at {:?}", path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Refuse to overwrite existing manifest.
    #[error("manifest already exists at {:?}", path.display())]
    AlreadyExists { path: PathBuf },

    /// Fragment pattern is invalid.
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    /// Fragment path cannot be accessed.
    #[error(transparent)]
    Glob(#[from] glob::GlobError),
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
