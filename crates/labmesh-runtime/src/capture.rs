//! Output capture for the stdout/stderr topics.
//!
//! A worker publishes, on every refresh tick, the lines it produced since
//! the previous tick.  Lines come from two places: explicit
//! [`OutputCapture::print`]/[`eprint`](OutputCapture::eprint) calls, and, when
//! the process installs a [`CaptureLayer`], every `tracing` event (INFO and
//! below go to stdout, WARN and ERROR to stderr).

use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Lines kept per stream between two drains.  Older lines are discarded.
pub const MAX_BUFFERED_LINES: usize = 1000;

#[derive(Default)]
struct Buffers {
    stdout: Vec<String>,
    stderr: Vec<String>,
    dropped: usize,
}

impl Buffers {
    fn push(stream: &mut Vec<String>, dropped: &mut usize, line: String) {
        if stream.len() >= MAX_BUFFERED_LINES {
            stream.remove(0);
            *dropped += 1;
        }
        stream.push(line);
    }
}

/// Shared, cloneable line buffer.
#[derive(Clone, Default)]
pub struct OutputCapture {
    inner: Arc<Mutex<Buffers>>,
}

/// Lines drained from an [`OutputCapture`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn print(&self, line: impl Into<String>) {
        let mut buffers = self.lock();
        let Buffers { stdout, dropped, .. } = &mut *buffers;
        Buffers::push(stdout, dropped, line.into());
    }

    pub fn eprint(&self, line: impl Into<String>) {
        let mut buffers = self.lock();
        let Buffers { stderr, dropped, .. } = &mut *buffers;
        Buffers::push(stderr, dropped, line.into());
    }

    /// Take everything captured since the previous drain.
    pub fn drain(&self) -> CapturedOutput {
        let mut buffers = self.lock();
        if buffers.dropped > 0 {
            let note = format!("[{} earlier lines dropped]", buffers.dropped);
            buffers.stderr.insert(0, note);
            buffers.dropped = 0;
        }
        CapturedOutput {
            stdout: std::mem::take(&mut buffers.stdout),
            stderr: std::mem::take(&mut buffers.stderr),
        }
    }

    /// A `tracing` layer feeding this buffer.
    pub fn layer(&self) -> CaptureLayer {
        CaptureLayer {
            capture: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffers> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `tracing_subscriber` layer that copies events into an [`OutputCapture`].
pub struct CaptureLayer {
    capture: OutputCapture,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut line = LineVisitor::default();
        event.record(&mut line);
        let text = format!("{} {}: {}", meta.level(), meta.target(), line.finish());
        if *meta.level() <= Level::WARN {
            self.capture.eprint(text);
        } else {
            self.capture.print(text);
        }
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn print_and_eprint_go_to_their_streams() {
        let capture = OutputCapture::new();
        capture.print("hello");
        capture.eprint("oops");
        let out = capture.drain();
        assert_eq!(out.stdout, vec!["hello"]);
        assert_eq!(out.stderr, vec!["oops"]);
        assert!(capture.drain().is_empty());
    }

    #[test]
    fn tracing_events_are_split_by_level() {
        let capture = OutputCapture::new();
        let subscriber = tracing_subscriber::registry().with(capture.layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(voltage = 1.5, "setpoint reached");
            tracing::warn!("interlock open");
        });
        let out = capture.drain();
        assert_eq!(out.stdout.len(), 1);
        assert!(out.stdout[0].starts_with("INFO"));
        assert!(out.stdout[0].ends_with("setpoint reached voltage=1.5"), "{:?}", out.stdout);
        assert_eq!(out.stderr.len(), 1);
        assert!(out.stderr[0].contains("interlock open"));
    }

    #[test]
    fn overflow_keeps_the_newest_lines() {
        let capture = OutputCapture::new();
        for i in 0..MAX_BUFFERED_LINES + 5 {
            capture.print(i.to_string());
        }
        let out = capture.drain();
        assert_eq!(out.stdout.len(), MAX_BUFFERED_LINES);
        assert_eq!(out.stdout[0], "5");
        assert_eq!(out.stderr, vec!["[5 earlier lines dropped]"]);
    }
}
