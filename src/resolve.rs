//! Dependency resolution for requested services.
//!
//! [`resolve`] collects every service reachable from the requested names and
//! orders them so that each service comes after all of its dependencies.
//! Ordering uses repeated passes over the collected services rather than a
//! depth-first walk, so a stalled pass can report exactly which services are
//! stuck in a cycle.

use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::config::ServiceConfig;
use crate::error::{Error, Result};

/// Returns the requested services and their transitive dependencies in start order.
///
/// Fails with [`Error::UnknownService`] if a requested name or any dependency
/// has no definition, and with [`Error::CircularDependency`] if the
/// collected services cannot be ordered.
pub fn resolve<S: AsRef<str>>(
    services: &BTreeMap<String, ServiceConfig>,
    requested: &[S],
) -> Result<Vec<String>> {
    let to_start = collect(services, requested)?;

    let mut order = Vec::with_capacity(to_start.len());
    let mut resolved: HashSet<&str> = HashSet::with_capacity(to_start.len());

    while order.len() < to_start.len() {
        let mut progressed = false;

        for name in &to_start {
            if resolved.contains(name.as_str()) {
                continue;
            }
            let ready = services[name]
                .depends_on
                .iter()
                .all(|dependency| resolved.contains(dependency.as_str()));
            if ready {
                resolved.insert(name);
                order.push(name.clone());
                progressed = true;
            }
        }

        if !progressed {
            let remaining = to_start
                .iter()
                .filter(|name| !resolved.contains(name.as_str()))
                .cloned()
                .collect();
            return Err(Error::CircularDependency { remaining });
        }
    }

    Ok(order)
}

// Breadth-first walk over dependency edges. Each newly found service is placed
// before the ones found earlier, so deeper dependencies are scanned first.
fn collect<S: AsRef<str>>(
    services: &BTreeMap<String, ServiceConfig>,
    requested: &[S],
) -> Result<VecDeque<String>> {
    let mut queue: VecDeque<&str> = requested.iter().map(AsRef::as_ref).collect();
    let mut processed: HashSet<&str> = HashSet::new();
    let mut to_start = VecDeque::new();

    while let Some(name) = queue.pop_front() {
        if processed.contains(name) {
            continue;
        }

        let (name, service) = services
            .get_key_value(name)
            .ok_or_else(|| Error::UnknownService(name.to_string()))?;

        queue.extend(
            service
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|dependency| !processed.contains(dependency)),
        );

        to_start.push_front(name.clone());
        processed.insert(name.as_str());
    }

    Ok(to_start)
}
