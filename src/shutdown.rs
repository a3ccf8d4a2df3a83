//! Stopping launched services.
//!
//! Shutdown is the same for every service: interrupt its process group, give
//! it the service's kill timeout to exit, then kill the group and wait for the
//! process to be reaped. Signal delivery sits behind [`SignalDelivery`] so the
//! protocol does not depend on how a platform addresses process groups.

use std::fmt;
use std::io;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Error;
use crate::latch::Latch;

/// Signals sent to a service's process group during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Graceful interrupt (SIGINT).
    Interrupt,
    /// Forceful termination (SIGKILL).
    Kill,
}

impl ProcessSignal {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessSignal::Interrupt => "SIGINT",
            ProcessSignal::Kill => "SIGKILL",
        }
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Delivers a signal to every process in a process group.
pub trait SignalDelivery: Send + Sync {
    fn deliver(&self, pgid: u32, signal: ProcessSignal) -> io::Result<()>;
}

/// Sends real OS signals to process groups.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroupSignaller;

#[cfg(unix)]
impl SignalDelivery for ProcessGroupSignaller {
    fn deliver(&self, pgid: u32, signal: ProcessSignal) -> io::Result<()> {
        let sig = match signal {
            ProcessSignal::Interrupt => libc::SIGINT,
            ProcessSignal::Kill => libc::SIGKILL,
        };
        let pgid = libc::pid_t::try_from(pgid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "process group id out of range"))?;
        // A negative pid addresses the whole process group.
        let rc = unsafe { libc::kill(-pgid, sig) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(unix))]
impl SignalDelivery for ProcessGroupSignaller {
    fn deliver(&self, _pgid: u32, signal: ProcessSignal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{} to process groups is not supported on this platform", signal),
        ))
    }
}

/// What shutdown needs to know about one launched service.
pub struct ShutdownTarget<'a> {
    pub name: &'a str,
    /// Process group id, `None` if the service was never spawned.
    pub pgid: Option<u32>,
    /// Fires once the process has been reaped.
    pub exited: &'a Latch,
    pub kill_timeout: Duration,
}

/// Runs the shutdown protocol for one service and returns once it has exited.
///
/// Delivery failures are logged and never stop the protocol.
pub async fn stop_service(target: ShutdownTarget<'_>, delivery: &dyn SignalDelivery) {
    let name = target.name;
    let Some(pgid) = target.pgid else {
        debug!(service = %name, "cleanup skipped, never started");
        return;
    };
    if target.exited.is_fired() {
        debug!(service = %name, "cleanup skipped, already exited");
        return;
    }

    debug!(service = %name, pgid, "interrupting");
    send(name, pgid, ProcessSignal::Interrupt, delivery);

    if tokio::time::timeout(target.kill_timeout, target.exited.fired())
        .await
        .is_err()
    {
        debug!(service = %name, pgid, timeout = ?target.kill_timeout, "still running, killing");
        send(name, pgid, ProcessSignal::Kill, delivery);
        target.exited.fired().await;
    }
    debug!(service = %name, "stopped");
}

fn send(name: &str, pgid: u32, signal: ProcessSignal, delivery: &dyn SignalDelivery) {
    if let Err(source) = delivery.deliver(pgid, signal) {
        let err = Error::SignalDelivery {
            name: name.to_string(),
            signal,
            pgid,
            source,
        };
        warn!("{}", err);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // Records deliveries and fires `exited` when the configured signal arrives.
    struct FakeDelivery {
        calls: Mutex<Vec<(u32, ProcessSignal)>>,
        exits_on: Option<ProcessSignal>,
        fail: bool,
        exited: Latch,
    }

    impl FakeDelivery {
        fn new(exited: &Latch, exits_on: Option<ProcessSignal>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                exits_on,
                fail: false,
                exited: exited.clone(),
            }
        }

        fn calls(&self) -> Vec<(u32, ProcessSignal)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SignalDelivery for FakeDelivery {
        fn deliver(&self, pgid: u32, signal: ProcessSignal) -> io::Result<()> {
            self.calls.lock().unwrap().push((pgid, signal));
            if self.exits_on == Some(signal) {
                self.exited.fire();
            }
            if self.fail {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            Ok(())
        }
    }

    fn target<'a>(pgid: Option<u32>, exited: &'a Latch, timeout_ms: u64) -> ShutdownTarget<'a> {
        ShutdownTarget {
            name: "svc",
            pgid,
            exited,
            kill_timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn never_spawned_is_left_alone() {
        let exited = Latch::new();
        let delivery = FakeDelivery::new(&exited, None);
        stop_service(target(None, &exited, 10), &delivery).await;
        assert!(delivery.calls().is_empty());
    }

    #[tokio::test]
    async fn already_exited_is_left_alone() {
        let exited = Latch::new();
        exited.fire();
        let delivery = FakeDelivery::new(&exited, None);
        stop_service(target(Some(42), &exited, 10), &delivery).await;
        assert!(delivery.calls().is_empty());
    }

    #[tokio::test]
    async fn cooperative_service_only_gets_interrupt() {
        let exited = Latch::new();
        let delivery = FakeDelivery::new(&exited, Some(ProcessSignal::Interrupt));
        stop_service(target(Some(42), &exited, 5_000), &delivery).await;
        assert_eq!(delivery.calls(), vec![(42, ProcessSignal::Interrupt)]);
    }

    #[tokio::test]
    async fn stubborn_service_is_killed_after_timeout() {
        let exited = Latch::new();
        let delivery = FakeDelivery::new(&exited, Some(ProcessSignal::Kill));
        let started = std::time::Instant::now();
        stop_service(target(Some(7), &exited, 50), &delivery).await;
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(
            delivery.calls(),
            vec![(7, ProcessSignal::Interrupt), (7, ProcessSignal::Kill)]
        );
    }

    #[tokio::test]
    async fn delivery_failure_does_not_stop_escalation() {
        let exited = Latch::new();
        let mut delivery = FakeDelivery::new(&exited, Some(ProcessSignal::Kill));
        delivery.fail = true;
        stop_service(target(Some(9), &exited, 20), &delivery).await;
        assert_eq!(
            delivery.calls(),
            vec![(9, ProcessSignal::Interrupt), (9, ProcessSignal::Kill)]
        );
        assert!(exited.is_fired());
    }

    #[cfg(unix)]
    #[test]
    fn signalling_missing_group_reports_error() {
        // Far above any pid_max, so no such group exists.
        let err = ProcessGroupSignaller
            .deliver(i32::MAX as u32, ProcessSignal::Interrupt)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
    }
}
