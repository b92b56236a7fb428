//! Tracing setup shared by the three binaries.
//!
//! Three sinks hang off the global subscriber: human-readable stderr (ends
//! up in `<bin>.output` under systemd), an append-only `<state>/<bin>.log`
//! file, and a channel towards the notifier so warnings reach the operator.
//! The filter sits behind a reload handle so the `!log` remote command can
//! retune verbosity at runtime.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot open log file: {0}")]
    LogFile(#[from] std::io::Error),

    #[error("invalid log spec {spec:?}: {reason}")]
    BadSpec { spec: String, reason: String },

    #[error("filter reload failed: {0}")]
    Reload(String),
}

/// A formatted log line on its way to the notifier.
#[derive(Debug)]
pub struct LogLine {
    pub level: Level,
    pub text: String,
}

/// Handle for runtime filter changes, kept for the process lifetime.
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    default: String,
}

impl LogHandle {
    /// Reset the filter to the startup default, then apply `spec` on top.
    /// A malformed spec leaves the active filter untouched.
    pub fn apply_spec(&self, spec: &str) -> Result<(), LoggingError> {
        let combined = format!("{},{}", self.default, spec.trim());
        let filter = EnvFilter::try_new(&combined).map_err(|e| LoggingError::BadSpec {
            spec: spec.to_owned(),
            reason: e.to_string(),
        })?;

        self.handle
            .reload(filter)
            .map_err(|e| LoggingError::Reload(e.to_string()))
    }
}

/// Install the global subscriber. Returns the reload handle and the
/// receiving end of the notifier feed; the caller wires the receiver to a
/// [`crate::telegram::Bot`] with [`spawn_forwarder`] once one exists.
pub fn init(
    state_path: &Path,
    bin_name: &str,
    default_filter: &str,
) -> Result<(LogHandle, mpsc::UnboundedReceiver<LogLine>), LoggingError> {
    let default = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_owned());

    let (filter, handle) = reload::Layer::new(EnvFilter::new(&default));

    fs::create_dir_all(state_path)?;
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(state_path.join(format!("{bin_name}.log")))?;

    let (tx, rx) = mpsc::unbounded_channel();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(log_file)),
        )
        .with(NotifyLayer { tx })
        .init();

    Ok((LogHandle { handle, default }, rx))
}

/// Pump formatted log lines into the notifier. WARN and above ring the
/// operator, everything else is silent.
pub fn spawn_forwarder(
    bot: std::sync::Arc<crate::telegram::Bot>,
    mut rx: mpsc::UnboundedReceiver<LogLine>,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let line = tokio::select! {
                () = cancel.cancelled() => return,
                line = rx.recv() => match line {
                    Some(line) => line,
                    None => return,
                },
            };

            let silent = line.level > Level::WARN;
            let _ = bot.send(&line.text, silent).await;
        }
    })
}

struct NotifyLayer {
    tx: mpsc::UnboundedSender<LogLine>,
}

impl<S: Subscriber> Layer<S> for NotifyLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let _ = self.tx.send(LogLine {
            level: *meta.level(),
            text: format_line(meta, &visitor.out),
        });
    }
}

fn format_line(meta: &Metadata<'_>, body: &str) -> String {
    format!("[{}|{}] {}", level_code(meta.level()), meta.target(), body)
}

fn level_code(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "E",
        Level::WARN => "W",
        Level::INFO => "I",
        Level::DEBUG => "D",
        Level::TRACE => "T",
    }
}

#[derive(Default)]
struct LineVisitor {
    out: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.prepend_message(value);
        } else {
            let _ = write!(self.out, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.prepend_message(&format!("{value:?}"));
        } else {
            let _ = write!(self.out, " {}={:?}", field.name(), value);
        }
    }
}

impl LineVisitor {
    fn prepend_message(&mut self, msg: &str) {
        if self.out.is_empty() {
            self.out.push_str(msg);
        } else {
            self.out.insert_str(0, msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_codes_are_single_letters() {
        assert_eq!(level_code(&Level::ERROR), "E");
        assert_eq!(level_code(&Level::TRACE), "T");
    }

    #[test]
    fn warn_and_error_ring_the_operator() {
        assert!(Level::WARN <= Level::WARN);
        assert!(Level::ERROR <= Level::WARN);
        assert!(Level::INFO > Level::WARN);
    }
}
