//! Build-time configuration consumed by the offline worker.
//!
//! The build pipeline substitutes a version token and two pre-cache URL
//! lists into the deployed bundle. This module models them as plain,
//! immutable data: constructed once at worker startup and passed to every
//! component, never read from shared globals.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Errors raised while loading build-time configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("build version token must not be empty")]
    EmptyVersion,

    #[error("malformed manifest: {0}")]
    MalformedManifest(#[from] serde_json::Error),
}

/// Opaque version token fixed at build time.
///
/// Identifies one deployment. Immutable for the lifetime of a worker
/// instance; a new deployment produces a new worker with a new token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildVersion(String);

impl BuildVersion {
    /// Create a version from the build-time token.
    pub fn new(token: impl Into<String>) -> Result<Self, ConfigError> {
        let token = token.into();
        if token.is_empty() {
            return Err(ConfigError::EmptyVersion);
        }
        Ok(Self(token))
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two fixed pre-cache URL lists known at install time.
///
/// The shell list may change with every version; the asset list is stable
/// across versions. Neither is mutated at runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Application shell resources.
    pub shell: Vec<String>,
    /// Long-lived static assets.
    pub assets: Vec<String>,
}

impl Manifest {
    /// Create a manifest from the two URL lists.
    pub fn new(
        shell: impl IntoIterator<Item = impl Into<String>>,
        assets: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            shell: shell.into_iter().map(Into::into).collect(),
            assets: assets.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a manifest from the JSON emitted by the build pipeline.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Total number of URLs across both lists.
    pub fn len(&self) -> usize {
        self.shell.len() + self.assets.len()
    }

    /// Whether both lists are empty.
    pub fn is_empty(&self) -> bool {
        self.shell.is_empty() && self.assets.is_empty()
    }
}

/// Immutable worker configuration, constructed once at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    version: BuildVersion,
    origin: Url,
    manifest: Manifest,
}

impl WorkerConfig {
    /// Combine the build-time inputs into one configuration value.
    ///
    /// `origin` is the application's own origin: relative manifest URLs are
    /// resolved against it, and responses landing on any other origin are
    /// treated as foreign.
    pub fn new(version: BuildVersion, origin: Url, manifest: Manifest) -> Self {
        Self {
            version,
            origin,
            manifest,
        }
    }

    /// The deployment's version token.
    pub fn version(&self) -> &BuildVersion {
        &self.version
    }

    /// The application's origin.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// The pre-cache manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}
