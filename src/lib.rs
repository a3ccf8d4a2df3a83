//! Stackup: starts a development stack of services in dependency order.
//!
//! Services are declared in a `stackup.toml` file. Requested services and
//! their dependencies are started one after another, each waiting for its
//! dependencies to become ready. Their output is merged onto the console
//! behind colored name prefixes. When any service exits or the run is
//! interrupted, every service is stopped: first with SIGINT to its process
//! group, then with SIGKILL once its kill timeout expires.

pub mod config;
pub mod error;
pub mod latch;
pub mod logging;
pub mod output;
pub mod process;
pub mod resolve;
pub mod runner;
pub mod shutdown;

pub use config::{load_config, Config, Environment, ServiceConfig};
pub use error::{Error, Result};
pub use runner::{InterruptHandle, Orchestrator};
