//! Configuration management for stackup.
//!
//! This module defines the structure of the `stackup.toml` configuration file,
//! the environment merge rules shared by every service, and the loader that
//! parses the file and fills in the default environment.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Highest configuration version this build understands.
pub const SUPPORTED_VERSION: u32 = 1;

/// Grace period between the interrupt and the kill signal when a service sets none.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// File looked up in the current directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "stackup.toml";

/// Variables every service environment carries unless set explicitly.
pub const DEFAULT_VARIABLES: [&str; 3] = ["PWD", "HOME", "PATH"];

/// Top-level configuration structure corresponding to `stackup.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Format version of the file.
    #[serde(default)]
    pub version: u32,
    /// Global environment variables available to all services.
    ///
    /// Values may reference the current environment with `$KEY` or `${KEY}`.
    #[serde(default)]
    pub environment: Environment,
    /// Service definitions keyed by name.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

/// Configuration for a single service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    /// Shell command that starts the service (required).
    #[serde(default)]
    pub command: String,
    /// Working directory for the command, relative to the current directory.
    pub workdir: Option<String>,
    /// Output substring that marks the service as ready.
    ///
    /// When empty, the service is ready as soon as it has started.
    pub ready_on: Option<String>,
    /// Services that must be ready before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Environment variables for the command, merged over the global ones.
    #[serde(default)]
    pub environment: Environment,
    /// Seconds to wait after the interrupt signal before killing the service.
    pub kill_timeout: Option<u64>,
}

impl ServiceConfig {
    /// Readiness substring, if one is configured.
    pub fn ready_on(&self) -> Option<&str> {
        self.ready_on.as_deref().filter(|marker| !marker.is_empty())
    }

    /// Effective kill timeout, falling back to [`DEFAULT_KILL_TIMEOUT`] when unset or zero.
    pub fn kill_timeout(&self) -> Duration {
        match self.kill_timeout {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => DEFAULT_KILL_TIMEOUT,
        }
    }
}

/// Mapping of environment variable names to values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns `true` if `key` is present with a non-empty value.
    pub fn is_set(&self, key: &str) -> bool {
        self.get(key).is_some_and(|value| !value.is_empty())
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns an environment with the entries of both `self` and `parent`.
    ///
    /// Keys present in both take the value from `self`.
    pub fn extends(&self, parent: &Environment) -> Environment {
        let mut merged = parent.0.clone();
        merged.extend(self.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Environment(merged)
    }

    /// Applies `f` to every value.
    pub fn map_values(&self, mut f: impl FnMut(&str) -> String) -> Environment {
        Environment(self.0.iter().map(|(k, v)| (k.clone(), f(v))).collect())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Environment(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl Config {
    /// Fills in `PWD`, `HOME` and `PATH` in the global environment when they are missing.
    ///
    /// `PWD` defaults to `pwd`; the others are taken from the current process.
    pub fn init_environment(&mut self, pwd: &Path) {
        if !self.environment.is_set("PWD") {
            self.environment.insert("PWD", pwd.to_string_lossy());
        }
        for key in ["PATH", "HOME"] {
            if !self.environment.is_set(key) {
                self.environment
                    .insert(key, std::env::var(key).unwrap_or_default());
            }
        }
    }
}

/// Parses configuration text without touching the environment.
pub fn parse_config(raw: &str) -> Result<Config> {
    toml::from_str(raw).context("failed to parse config")
}

/// Loads and parses the configuration from a file path.
///
/// The global environment gets `PWD` set to the directory holding the file.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    let absolute = std::path::absolute(path).with_context(|| {
        format!(
            "cannot determine absolute path to the config file {}",
            path.display()
        )
    })?;
    let dir = absolute.parent().unwrap_or(Path::new("/"));
    config.init_environment(dir);
    Ok(config)
}
