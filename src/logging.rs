//! Logging setup.
//!
//! Every line goes to stdout as `[YYYY-MM-DD HH:MM:SS] message`.

use std::fmt;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// strftime pattern for the line prefix.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Local wall-clock timer wrapped in square brackets.
#[derive(Debug, Clone, Copy, Default)]
pub struct BracketedLocalTime;

impl FormatTime for BracketedLocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "[{}]", chrono::Local::now().format(TIMESTAMP_FORMAT))
    }
}

/// Build the subscriber used by the server, writing lines to `writer`.
pub fn subscriber<W>(filter: EnvFilter, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(BracketedLocalTime)
        .with_target(false)
        .with_level(false)
        .with_ansi(false)
        .with_writer(writer)
        .finish()
}

/// Install the global subscriber on stdout. `RUST_LOG` wins over `level`.
pub fn init(level: LevelFilter) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));

    subscriber(filter, std::io::stdout).init();
}

/// In-memory writer for asserting on formatted log lines.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct CaptureWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl CaptureWriter {
    /// Everything written so far, one entry per line.
    pub fn lines(&self) -> Vec<String> {
        let buf = self.0.lock().unwrap();
        String::from_utf8_lossy(&buf)
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Install a debug-level subscriber writing here for the current thread.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(subscriber(EnvFilter::new("debug"), self.clone()))
    }
}

#[cfg(test)]
impl std::io::Write for CaptureWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl<'a> MakeWriter<'a> for CaptureWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Split a formatted line into its timestamp and message, checking the shape.
#[cfg(test)]
pub fn message_of(line: &str) -> &str {
    assert!(line.is_char_boundary(22), "line too short: {line:?}");
    let (prefix, message) = line.split_at(22);
    assert!(prefix.starts_with('['), "missing '[': {line:?}");
    assert!(prefix.ends_with("] "), "missing '] ': {line:?}");
    assert!(
        chrono::NaiveDateTime::parse_from_str(&prefix[1..20], TIMESTAMP_FORMAT).is_ok(),
        "bad timestamp: {line:?}"
    );
    message
}
