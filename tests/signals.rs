//! Terminal signals sent to stackup itself end the run.
//!
//! Raising a signal hits the whole test process, so this lives in its own
//! binary.

#![cfg(unix)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stackup::config::parse_config;
use stackup::output::MemorySink;
use stackup::shutdown::{ProcessGroupSignaller, ProcessSignal, SignalDelivery};
use stackup::{Error, Orchestrator};
use tokio::signal::unix::{signal, SignalKind};

#[derive(Default)]
struct RecordingDelivery {
    calls: Mutex<Vec<ProcessSignal>>,
}

impl SignalDelivery for RecordingDelivery {
    fn deliver(&self, pgid: u32, signal: ProcessSignal) -> io::Result<()> {
        self.calls.lock().unwrap().push(signal);
        ProcessGroupSignaller.deliver(pgid, signal)
    }
}

#[tokio::test]
async fn hangup_interrupts_the_run() {
    // Keeps the default SIGHUP action from ending the test binary.
    let _guard = signal(SignalKind::hangup()).unwrap();

    let config = parse_config(
        r#"
[services.web]
command = "echo up; sleep 30"
ready_on = "up"
kill_timeout = 1
"#,
    )
    .unwrap();
    let sink = Arc::new(MemorySink::new());
    let delivery = Arc::new(RecordingDelivery::default());
    let orchestrator = Orchestrator::new(&config, &["web"])
        .unwrap()
        .with_sink(sink.clone())
        .with_signal_delivery(delivery.clone());
    let run = tokio::spawn(orchestrator.run());

    tokio::time::timeout(Duration::from_secs(5), async {
        while !sink.lines().iter().any(|(_, line)| line.ends_with(" up")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("service became ready");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let raised = Instant::now();
    assert_eq!(unsafe { libc::raise(libc::SIGHUP) }, 0);
    let err = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run ended after SIGHUP")
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, Error::Interrupted));
    assert!(raised.elapsed() < Duration::from_secs(3));
    assert_eq!(
        delivery.calls.lock().unwrap().first(),
        Some(&ProcessSignal::Interrupt)
    );
    assert!(sink.contents().contains("[stackup] Interrupting stackup"));
}
