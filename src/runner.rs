//! Run orchestration.
//!
//! The [`Orchestrator`] owns the runtimes of every service in the resolved
//! start order and drives a run through an explicit state machine:
//! `Preparing -> Starting -> Running -> ShuttingDown -> Done`. Services are
//! started one at a time; each start blocks until the service is ready, so a
//! dependent is never spawned before its dependencies. Every launched service
//! gets a watcher task that reaps it, drains its output and then reports the
//! exit to a shared [`RunControl`], which decides whether the exit ends the
//! run. Watchers belong to the run, so dropping the run kills its services.

use std::collections::HashSet;
use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{Config, SUPPORTED_VERSION};
use crate::error::{Error, Result};
use crate::output::{
    format_tool_message, log_prefix, read_stream, ConsoleSink, LineForwarder, OutputSink,
    StreamKind,
};
use crate::process::ServiceRuntime;
use crate::resolve::resolve;
use crate::shutdown::{stop_service, ProcessGroupSignaller, ShutdownTarget, SignalDelivery};

/// Soft limit requested for open file descriptors.
#[cfg(unix)]
const OPEN_FILE_LIMIT: libc::rlim_t = 65_000;

/// How long a watcher keeps forwarding output once its process is reaped.
///
/// A descendant that left the process group can hold a pipe open forever.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Shared completion state of a run.
///
/// Watchers report service exits here; interrupts are injected here too. The
/// first outcome that lands in the channel ends the run.
#[derive(Debug)]
pub struct RunControl {
    wait_for: Mutex<HashSet<String>>,
    outcome_tx: mpsc::Sender<Result<()>>,
}

impl RunControl {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<Result<()>>) {
        let (outcome_tx, outcome_rx) = mpsc::channel(capacity);
        let control = Self {
            wait_for: Mutex::new(HashSet::new()),
            outcome_tx,
        };
        (control, outcome_rx)
    }

    fn set_wait_for<I: IntoIterator<Item = String>>(&self, names: I) {
        let mut wait_for = self.wait_for.lock().unwrap_or_else(PoisonError::into_inner);
        wait_for.clear();
        wait_for.extend(names);
    }

    /// Applies the exit policy to a finished service.
    ///
    /// A clean exit of an awaited service only removes it from the wait-for
    /// set, and the run succeeds once that set is empty. Every other exit,
    /// clean or not, ends the run with its result.
    pub fn report_exit(&self, name: &str, result: Result<()>) {
        if result.is_ok() {
            let mut wait_for = self.wait_for.lock().unwrap_or_else(PoisonError::into_inner);
            if wait_for.remove(name) {
                if !wait_for.is_empty() {
                    debug!(service = %name, remaining = wait_for.len(), "awaited service finished");
                    return;
                }
                drop(wait_for);
                debug!(service = %name, "all awaited services finished");
                self.report(Ok(()));
                return;
            }
        }
        self.report(result);
    }

    // Never blocks; once the channel is full the run is already decided.
    fn report(&self, outcome: Result<()>) {
        if let Err(mpsc::error::TrySendError::Full(outcome)) = self.outcome_tx.try_send(outcome) {
            debug!(?outcome, "outcome dropped, run already decided");
        }
    }
}

/// Requests an interrupt of a run from anywhere.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    control: Arc<RunControl>,
}

impl InterruptHandle {
    /// Ends the run as if SIGINT had been received.
    pub fn interrupt(&self) {
        self.control.report(Err(Error::Interrupted));
    }
}

#[derive(Debug)]
enum RunState {
    Preparing,
    Starting { cursor: usize },
    Running,
    ShuttingDown { outcome: Result<()> },
    Done { outcome: Result<()> },
}

impl RunState {
    fn label(&self) -> &'static str {
        match self {
            RunState::Preparing => "preparing",
            RunState::Starting { .. } => "starting",
            RunState::Running => "running",
            RunState::ShuttingDown { .. } => "shutting down",
            RunState::Done { .. } => "done",
        }
    }
}

/// Starts, supervises and stops a set of services.
pub struct Orchestrator {
    services: Vec<ServiceRuntime>,
    control: Arc<RunControl>,
    outcome_rx: mpsc::Receiver<Result<()>>,
    sink: Arc<dyn OutputSink>,
    delivery: Arc<dyn SignalDelivery>,
}

impl Orchestrator {
    /// Resolves `requested` and their dependencies and builds every runtime.
    ///
    /// Nothing is spawned here; all configuration errors surface before a run.
    pub fn new<S: AsRef<str>>(config: &Config, requested: &[S]) -> Result<Self> {
        if config.version > SUPPORTED_VERSION {
            return Err(Error::ConfigVersionUnsupported {
                found: config.version,
                supported: SUPPORTED_VERSION,
            });
        }

        let order = resolve(&config.services, requested)?;
        let width = order
            .iter()
            .map(|name| name.chars().count())
            .max()
            .unwrap_or(0);

        let services = order
            .iter()
            .enumerate()
            .map(|(id, name)| {
                let mut runtime =
                    ServiceRuntime::build(id, name, &config.services[name], &config.environment)?;
                runtime.log_prefix = log_prefix(id, name, width);
                Ok(runtime)
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(order = ?order, "services resolved");

        // One slot per service exit plus one for an interrupt.
        let (control, outcome_rx) = RunControl::new(services.len() + 1);
        Ok(Self {
            services,
            control: Arc::new(control),
            outcome_rx,
            sink: Arc::new(ConsoleSink),
            delivery: Arc::new(ProcessGroupSignaller),
        })
    }

    /// Replaces the console with another output destination.
    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces OS signal delivery, mainly for observing shutdown.
    pub fn with_signal_delivery(mut self, delivery: Arc<dyn SignalDelivery>) -> Self {
        self.delivery = delivery;
        self
    }

    /// Service names in start order.
    pub fn services(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            control: self.control.clone(),
        }
    }

    pub fn interrupt(&self) {
        self.interrupt_handle().interrupt();
    }

    /// Runs until the first service exit or an interrupt.
    ///
    /// All launched services are stopped before this returns.
    pub async fn run(mut self) -> Result<()> {
        let mut listener = JoinSet::new();
        listener.spawn(listen_for_signals(self.interrupt_handle()));
        let mut watchers = JoinSet::new();

        let mut state = RunState::Preparing;
        let outcome = loop {
            debug!(state = state.label(), "run state");
            state = match state {
                RunState::Preparing => {
                    self.announce("Preparing stackup");
                    match raise_open_file_limit() {
                        Ok(()) => RunState::Starting { cursor: 0 },
                        Err(err) => RunState::ShuttingDown { outcome: Err(err) },
                    }
                }
                RunState::Starting { cursor } => self.start_service(cursor, &mut watchers).await,
                RunState::Running => {
                    let outcome = self
                        .outcome_rx
                        .recv()
                        .await
                        .unwrap_or(Err(Error::Interrupted));
                    RunState::ShuttingDown { outcome }
                }
                RunState::ShuttingDown { outcome } => {
                    self.shut_down(&outcome, &mut watchers).await;
                    RunState::Done { outcome }
                }
                RunState::Done { outcome } => break outcome,
            };
        };

        listener.abort_all();
        outcome
    }

    /// Like [`Orchestrator::run`], but succeeds once every service in `names`
    /// has exited cleanly. Remaining services are stopped at that point.
    pub async fn run_bounded<S: AsRef<str>>(self, names: &[S]) -> Result<()> {
        for name in names {
            let name = name.as_ref();
            if !self.services.iter().any(|s| s.name == name) {
                return Err(Error::UnknownService(name.to_string()));
            }
        }
        self.control
            .set_wait_for(names.iter().map(|name| name.as_ref().to_string()));
        self.run().await
    }

    fn announce(&self, text: &str) {
        self.sink
            .write_line(StreamKind::Stdout, &format_tool_message(text));
    }

    async fn start_service(
        &mut self,
        cursor: usize,
        watchers: &mut JoinSet<()>,
    ) -> RunState {
        if cursor == 0 {
            self.announce("Starting services");
        }
        if cursor >= self.services.len() {
            info!(services = self.services.len(), "all services ready");
            return RunState::Running;
        }
        // An interrupt or exit that is already pending stops further spawns.
        if let Ok(outcome) = self.outcome_rx.try_recv() {
            return RunState::ShuttingDown { outcome };
        }

        let name = self.services[cursor].name.clone();
        self.announce(&format!("Starting service {}", name));

        let service = &mut self.services[cursor];
        let child = match service.spawn() {
            Ok(child) => child,
            Err(err) => return RunState::ShuttingDown { outcome: Err(err) },
        };
        debug!(
            service = %name,
            pid = ?service.pid,
            command = %service.display_command(),
            "spawned"
        );

        let (failed_tx, mut failed_rx) = oneshot::channel();
        watch_service(
            watchers,
            service,
            child,
            self.sink.clone(),
            self.control.clone(),
            failed_tx,
        );

        let ready = service.ready.clone();
        if !ready.is_fired() {
            self.announce(&format!("Waiting for service {} to be ready", name));
        }

        let woken = tokio::select! {
            biased;
            Ok(()) = &mut failed_rx => None,
            _ = ready.fired() => {
                debug!(service = %name, status = ?self.services[cursor].status(), "ready");
                Some(RunState::Starting { cursor: cursor + 1 })
            }
            outcome = self.outcome_rx.recv() => Some(RunState::ShuttingDown {
                outcome: outcome.unwrap_or(Err(Error::Interrupted)),
            }),
        };
        match woken {
            Some(next) => next,
            // The watcher reports the failure before signalling it.
            None => RunState::ShuttingDown {
                outcome: self
                    .outcome_rx
                    .recv()
                    .await
                    .unwrap_or(Err(Error::Interrupted)),
            },
        }
    }

    async fn shut_down(&self, outcome: &Result<()>, watchers: &mut JoinSet<()>) {
        match outcome {
            Err(Error::Interrupted) => self.announce("Interrupting stackup"),
            Err(err) => debug!(error = %err, "stopping after failure"),
            Ok(()) => debug!("stopping after clean finish"),
        }

        let mut stops = JoinSet::new();
        for service in &self.services {
            debug!(service = %service.name, status = ?service.status(), "cleanup");
            let name = service.name.clone();
            let pgid = service.pid;
            let exited = service.exited.clone();
            let kill_timeout = service.kill_timeout;
            let delivery = self.delivery.clone();
            stops.spawn(async move {
                let target = ShutdownTarget {
                    name: &name,
                    pgid,
                    exited: &exited,
                    kill_timeout,
                };
                stop_service(target, delivery.as_ref()).await;
            });
        }
        while stops.join_next().await.is_some() {}

        while watchers.join_next().await.is_some() {}
        debug!("all services stopped");
    }
}

// Reaps the process while its output is forwarded, and reports the exit once
// both streams are drained or the drain timeout expires. `failed_tx` fires
// after a failure was reported.
fn watch_service(
    watchers: &mut JoinSet<()>,
    service: &ServiceRuntime,
    mut child: Child,
    sink: Arc<dyn OutputSink>,
    control: Arc<RunControl>,
    failed_tx: oneshot::Sender<()>,
) {
    let forwarder = |stream| {
        LineForwarder::new(
            service.name.clone(),
            stream,
            service.log_prefix.clone(),
            sink.clone(),
            service.ready_on.clone(),
            service.ready.clone(),
        )
    };

    let mut readers = JoinSet::new();
    if let Some(stdout) = child.stdout.take() {
        readers.spawn(read_stream(stdout, forwarder(StreamKind::Stdout)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.spawn(read_stream(stderr, forwarder(StreamKind::Stderr)));
    }

    let name = service.name.clone();
    let exited = service.exited.clone();
    watchers.spawn(async move {
        let status = child.wait().await;
        exited.fire();
        match &status {
            Ok(status) => debug!(service = %name, %status, "exited"),
            Err(err) => warn!(service = %name, error = %err, "failed to reap process"),
        }

        let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
            while readers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(service = %name, "output still open after exit, closing it");
            readers.shutdown().await;
        }

        let result = exit_result(&name, status);
        let failed = result.is_err();
        control.report_exit(&name, result);
        if failed {
            let _ = failed_tx.send(());
        }
    });
}

fn exit_result(name: &str, status: io::Result<ExitStatus>) -> Result<()> {
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(Error::ServiceExited {
            name: name.to_string(),
            status,
        }),
        Err(source) => Err(Error::ProcessReap {
            name: name.to_string(),
            source,
        }),
    }
}

/// Turns SIGINT and SIGHUP into interrupts of the run.
async fn listen_for_signals(handle: InterruptHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigint, mut sighup) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::hangup())) {
                (Ok(sigint), Ok(sighup)) => (sigint, sighup),
                (Err(err), _) | (_, Err(err)) => {
                    warn!(error = %err, "cannot listen for signals");
                    return;
                }
            };
        loop {
            tokio::select! {
                Some(()) = sigint.recv() => debug!("received SIGINT"),
                Some(()) = sighup.recv() => debug!("received SIGHUP"),
                else => return,
            }
            handle.interrupt();
        }
    }
    #[cfg(not(unix))]
    {
        while tokio::signal::ctrl_c().await.is_ok() {
            debug!("received Ctrl-C");
            handle.interrupt();
        }
    }
}

#[cfg(unix)]
fn raise_open_file_limit() -> Result<()> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(Error::ResourceLimit(io::Error::last_os_error()));
    }
    let wanted = OPEN_FILE_LIMIT.min(limit.rlim_max);
    if limit.rlim_cur >= wanted {
        return Ok(());
    }
    limit.rlim_cur = wanted;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } != 0 {
        return Err(Error::ResourceLimit(io::Error::last_os_error()));
    }
    debug!(limit = wanted, "raised open file limit");
    Ok(())
}

#[cfg(not(unix))]
fn raise_open_file_limit() -> Result<()> {
    Ok(())
}
