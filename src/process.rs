//! Per-service runtime state.
//!
//! A [`ServiceRuntime`] is built from a service definition before anything is
//! started. It holds the resolved command, working directory and environment,
//! the readiness marker, and the latches other tasks use to learn that the
//! service became ready or exited.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::{Captures, Regex};
use tokio::process::{Child, Command};

use crate::config::{Environment, ServiceConfig, DEFAULT_VARIABLES};
use crate::error::{Error, Result};
use crate::latch::Latch;

#[cfg(unix)]
const SHELL: [&str; 2] = ["sh", "-c"];
#[cfg(not(unix))]
const SHELL: [&str; 2] = ["cmd", "/C"];

/// Where a service is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Built, not started.
    Constructed,
    /// Process is running, readiness not yet observed.
    Spawned,
    /// Readiness observed.
    Ready,
    /// Process has exited and been reaped.
    Exited,
}

/// Runtime state of a single service.
#[derive(Debug)]
pub struct ServiceRuntime {
    /// Position in the start order, used to pick the prefix color.
    pub id: usize,
    pub name: String,
    /// Command line handed to the shell.
    pub command: String,
    /// Working directory; relative paths are resolved against the current
    /// directory when the service is spawned.
    pub workdir: Option<PathBuf>,
    /// Complete environment of the process.
    pub environment: Environment,
    /// Output substring that marks the service as ready.
    pub ready_on: Option<String>,
    /// Grace period between interrupt and kill during shutdown.
    pub kill_timeout: Duration,
    /// Prefix put in front of every output line.
    pub log_prefix: String,
    /// Fires once the service is ready.
    pub ready: Latch,
    /// Fires once the process has exited.
    pub exited: Latch,
    /// Process id (and process group id) once spawned.
    pub pid: Option<u32>,
}

impl ServiceRuntime {
    /// Builds the runtime for `name` with `global` as the base environment.
    pub fn build(
        id: usize,
        name: &str,
        config: &ServiceConfig,
        global: &Environment,
    ) -> Result<Self> {
        let command = config.command.trim();
        if command.is_empty() {
            return Err(Error::EmptyCommand(name.to_string()));
        }

        let mut environment = config
            .environment
            .extends(global)
            .map_values(|value| expand_env(value, |key| std::env::var(key).ok()));
        apply_default_variables(&mut environment);

        Ok(Self {
            id,
            name: name.to_string(),
            command: command.to_string(),
            workdir: config
                .workdir
                .as_deref()
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            environment,
            ready_on: config.ready_on().map(str::to_string),
            kill_timeout: config.kill_timeout(),
            log_prefix: String::new(),
            ready: Latch::new(),
            exited: Latch::new(),
            pid: None,
        })
    }

    pub fn status(&self) -> ServiceStatus {
        if self.exited.is_fired() {
            ServiceStatus::Exited
        } else if self.ready.is_fired() && self.pid.is_some() {
            ServiceStatus::Ready
        } else if self.pid.is_some() {
            ServiceStatus::Spawned
        } else {
            ServiceStatus::Constructed
        }
    }

    /// The full shell invocation, quoted for display.
    pub fn display_command(&self) -> String {
        shell_words::join([SHELL[0], SHELL[1], self.command.as_str()])
    }

    /// Starts the service process in a new process group with piped output.
    ///
    /// Services without a readiness marker are ready as soon as this returns.
    pub fn spawn(&mut self) -> Result<Child> {
        let spawn_error = |source| Error::Spawn {
            name: self.name.clone(),
            source,
        };

        let cwd = std::env::current_dir().map_err(spawn_error)?;
        let workdir = match &self.workdir {
            Some(dir) => cwd.join(dir),
            None => cwd,
        };

        let mut command = Command::new(SHELL[0]);
        command
            .arg(SHELL[1])
            .arg(&self.command)
            .current_dir(workdir)
            .env_clear()
            .envs(self.environment.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                if libc::setpgid(0, 0) == 0 {
                    Ok(())
                } else {
                    Err(std::io::Error::last_os_error())
                }
            });
        }

        let child = command.spawn().map_err(spawn_error)?;
        self.pid = child.id();

        if self.ready_on.is_none() {
            self.ready.fire();
        }
        Ok(child)
    }
}

/// Replaces `$NAME` and `${NAME}` references in `value` using `lookup`.
///
/// Unknown names expand to an empty string; a `$` that does not start a
/// reference is kept as is.
pub fn expand_env(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    static REFERENCE: OnceLock<Regex> = OnceLock::new();
    let reference = REFERENCE.get_or_init(|| {
        Regex::new(r"\$(?:\{([^}]*)\}|([A-Za-z_][A-Za-z0-9_]*))").expect("valid reference pattern")
    });
    reference
        .replace_all(value, |caps: &Captures<'_>| {
            let key = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            lookup(key).unwrap_or_default()
        })
        .into_owned()
}

// The child gets only `environment`, so these must be present.
fn apply_default_variables(environment: &mut Environment) {
    for key in DEFAULT_VARIABLES {
        if environment.is_set(key) {
            continue;
        }
        let value = match key {
            "PWD" => std::env::current_dir()
                .ok()
                .map(|dir| dir.to_string_lossy().into_owned()),
            _ => std::env::var(key).ok(),
        };
        if let Some(value) = value {
            environment.insert(key, value);
        }
    }
}
