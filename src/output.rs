//! Output handling for service streams.
//!
//! Every service gets one reader per stream. A reader forwards each line to a
//! shared [`OutputSink`] behind a colored, name-aligned prefix, collapses runs
//! of repeated lines, and fires the service's ready latch when the readiness
//! marker shows up.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use crate::error::Error;
use crate::latch::Latch;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// Colors assigned to services by their position in the start order.
pub const PALETTE: [&str; 6] = [
    "\u{1b}[31m", // red
    "\u{1b}[32m", // green
    "\u{1b}[33m", // yellow
    "\u{1b}[34m", // blue
    "\u{1b}[35m", // magenta
    "\u{1b}[36m", // cyan
];

pub const RESET: &str = "\u{1b}[0m";

/// Builds the line prefix for service number `id`.
///
/// `width` is the length of the longest service name in the run; shorter
/// names are padded so the separators line up.
pub fn log_prefix(id: usize, name: &str, width: usize) -> String {
    let color = PALETTE[id % PALETTE.len()];
    let padding = " ".repeat(width.saturating_sub(name.chars().count()));
    format!("{}[{}]{} |{}", color, name, padding, RESET)
}

/// Formats a status message from the orchestrator itself.
pub fn format_tool_message(text: &str) -> String {
    format!("[stackup] {}", text)
}

/// Destination for forwarded lines.
pub trait OutputSink: Send + Sync {
    /// Writes one complete line (without trailing newline) to `stream`.
    fn write_line(&self, stream: StreamKind, line: &str);
}

/// Writes to the process's own stdout and stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl OutputSink for ConsoleSink {
    fn write_line(&self, stream: StreamKind, line: &str) {
        match stream {
            StreamKind::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{}", line);
            }
            StreamKind::Stderr => {
                let mut err = std::io::stderr().lock();
                let _ = writeln!(err, "{}", line);
            }
        }
    }
}

/// Keeps every line in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(StreamKind, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all lines written so far, in order.
    pub fn lines(&self) -> Vec<(StreamKind, String)> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns all lines joined with newlines, regardless of stream.
    pub fn contents(&self) -> String {
        self.lines()
            .into_iter()
            .map(|(_, line)| line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl OutputSink for MemorySink {
    fn write_line(&self, stream: StreamKind, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((stream, line.to_string()));
    }
}

/// Per-stream line handling: deduplication, prefixing and readiness.
pub struct LineForwarder {
    service: String,
    stream: StreamKind,
    prefix: String,
    sink: Arc<dyn OutputSink>,
    ready_on: Option<String>,
    ready: Latch,
    // Case-folded copy of the last forwarded line.
    last: Option<String>,
}

impl LineForwarder {
    pub fn new(
        service: impl Into<String>,
        stream: StreamKind,
        prefix: impl Into<String>,
        sink: Arc<dyn OutputSink>,
        ready_on: Option<String>,
        ready: Latch,
    ) -> Self {
        Self {
            service: service.into(),
            stream,
            prefix: prefix.into(),
            sink,
            ready_on: ready_on.filter(|marker| !marker.is_empty()),
            ready,
            last: None,
        }
    }

    /// Handles one raw line. Returns `false` if it was suppressed as a repeat.
    pub fn forward(&mut self, raw: &str) -> bool {
        let line = raw.trim_end_matches(['\r', '\n']);
        let folded = line.to_lowercase();
        if self.last.as_deref() == Some(folded.as_str()) {
            return false;
        }
        self.last = Some(folded);

        self.sink
            .write_line(self.stream, &format!("{} {}", self.prefix, line));

        if let Some(marker) = &self.ready_on {
            if line.contains(marker.as_str()) && self.ready.fire() {
                debug!(service = %self.service, stream = %self.stream, "readiness marker seen");
            }
        }
        true
    }
}

/// Reads `reader` line by line until end of input, forwarding every line.
///
/// Read errors end the loop and are logged; they never fail the run.
pub async fn read_stream<R>(reader: R, mut forwarder: LineForwarder)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                forwarder.forward(&String::from_utf8_lossy(&buf));
            }
            Err(source) => {
                let err = Error::OutputRead {
                    name: forwarder.service.clone(),
                    stream: forwarder.stream,
                    source,
                };
                warn!("{}", err);
                break;
            }
        }
    }
    debug!(service = %forwarder.service, stream = %forwarder.stream, "stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder(sink: &Arc<MemorySink>, ready_on: Option<&str>, ready: &Latch) -> LineForwarder {
        LineForwarder::new(
            "api",
            StreamKind::Stdout,
            "[api] |",
            sink.clone(),
            ready_on.map(str::to_string),
            ready.clone(),
        )
    }

    fn texts(sink: &MemorySink) -> Vec<String> {
        sink.lines().into_iter().map(|(_, line)| line).collect()
    }

    #[test]
    fn prefixes_are_aligned_and_colored() {
        let short = log_prefix(0, "db", 6);
        let long = log_prefix(1, "worker", 6);
        assert_eq!(short, "\u{1b}[31m[db]     |\u{1b}[0m");
        assert_eq!(long, "\u{1b}[32m[worker] |\u{1b}[0m");
        assert_eq!(short.len(), long.len());
    }

    #[test]
    fn palette_wraps_around() {
        assert_eq!(log_prefix(0, "a", 1), log_prefix(PALETTE.len(), "a", 1));
        assert_ne!(log_prefix(0, "a", 1), log_prefix(1, "a", 1));
    }

    #[test]
    fn repeated_lines_are_collapsed() {
        let sink = Arc::new(MemorySink::new());
        let ready = Latch::new();
        let mut fwd = forwarder(&sink, None, &ready);
        assert!(fwd.forward("loading\n"));
        assert!(!fwd.forward("loading\n"));
        assert!(!fwd.forward("LOADING\r\n"));
        assert!(fwd.forward("done\n"));
        assert!(fwd.forward("loading\n"));
        assert_eq!(
            texts(&sink),
            vec!["[api] | loading", "[api] | done", "[api] | loading"]
        );
    }

    #[test]
    fn first_empty_line_is_forwarded() {
        let sink = Arc::new(MemorySink::new());
        let ready = Latch::new();
        let mut fwd = forwarder(&sink, None, &ready);
        assert!(fwd.forward("\n"));
        assert!(!fwd.forward("\n"));
        assert_eq!(texts(&sink), vec!["[api] | "]);
    }

    #[test]
    fn readiness_fires_on_matching_line_only() {
        let sink = Arc::new(MemorySink::new());
        let ready = Latch::new();
        let mut fwd = forwarder(&sink, Some("Listening"), &ready);
        fwd.forward("booting\n");
        assert!(!ready.is_fired());
        fwd.forward("listening on 8080\n");
        assert!(!ready.is_fired(), "match is case-sensitive");
        fwd.forward("Listening on 8080\n");
        assert!(ready.is_fired());
        fwd.forward("Listening again\n");
        assert!(ready.is_fired());
    }

    #[test]
    fn suppressed_repeat_does_not_check_readiness() {
        let sink = Arc::new(MemorySink::new());
        let ready = Latch::new();
        let mut fwd = forwarder(&sink, Some("Ready"), &ready);
        fwd.forward("ready\n");
        fwd.forward("Ready\n");
        assert!(!ready.is_fired());
    }

    #[test]
    fn no_marker_never_fires() {
        let sink = Arc::new(MemorySink::new());
        let ready = Latch::new();
        let mut fwd = forwarder(&sink, Some(""), &ready);
        fwd.forward("anything\n");
        assert!(!ready.is_fired());
    }

    #[tokio::test]
    async fn read_stream_forwards_until_eof() {
        let sink = Arc::new(MemorySink::new());
        let ready = Latch::new();
        let input: &[u8] = b"one\r\ntwo\ntwo\nthree";
        read_stream(input, forwarder(&sink, Some("three"), &ready)).await;
        assert_eq!(
            texts(&sink),
            vec!["[api] | one", "[api] | two", "[api] | three"]
        );
        assert!(ready.is_fired());
    }

    #[tokio::test]
    async fn read_stream_keeps_long_lines_intact() {
        let sink = Arc::new(MemorySink::new());
        let ready = Latch::new();
        let long = "0".repeat(70_000);
        read_stream(long.as_bytes(), forwarder(&sink, None, &ready)).await;
        let lines = texts(&sink);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], format!("[api] | {}", long));
    }

    #[tokio::test]
    async fn read_stream_tolerates_invalid_utf8() {
        let sink = Arc::new(MemorySink::new());
        let ready = Latch::new();
        let input: &[u8] = b"ok \xff\xfe bytes\nnext\n";
        read_stream(input, forwarder(&sink, None, &ready)).await;
        let lines = texts(&sink);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("[api] | ok "));
        assert_eq!(lines[1], "[api] | next");
    }
}
