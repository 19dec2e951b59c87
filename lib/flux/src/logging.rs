//! Structured logging shared by every crate in the workspace. Every subsystem constructor takes
//! a `Logger` handle rather than reaching for a global; tests can pass `discard()`.
use serde_derive::{Deserialize, Serialize};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::panic;

pub use slog::{crit, debug, error, info, o, trace, warn, Logger};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl From<&LogLevel> for Severity {
    fn from(level: &LogLevel) -> Severity {
        match level {
            LogLevel::Trace => Severity::Trace,
            LogLevel::Debug => Severity::Debug,
            LogLevel::Info => Severity::Info,
            LogLevel::Warn => Severity::Warning,
            LogLevel::Error => Severity::Error,
            LogLevel::Critical => Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// `true` writes to stdout instead of stderr; used by interactive tools.
    pub stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            stdout: false,
        }
    }
}

/// Builds the root logger for a process from the supplied configuration and stamps it with a
/// component tag so every descendant logger (`.new(o!(...))`) inherits it.
pub fn init(component: &'static str, config: &LoggingConfig) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level((&config.level).into());
    builder.destination(if config.stdout {
        Destination::Stdout
    } else {
        Destination::Stderr
    });

    let root = builder.build().expect("failed to construct terminal logger");
    root.new(o!("component" => component))
}

/// A logger that discards everything, for unit tests that don't want to assert on log output.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Installs a panic hook that logs a structured crash report (message, location, thread name)
/// at `critical` before the default hook runs and the process aborts. This is the Rust-idiomatic
/// stand-in for a minidump writer: by the time a panic reaches here, it is an `OutOfMemory`-class
/// failure or an invariant violation that the recoverable error paths in `error::CoreError` were
/// never meant to catch.
pub fn install_crash_hook(log: Logger) {
    panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "<unknown>".into());
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed>");
        crit!(log, "panic";
            "message" => %info,
            "location" => location,
            "thread" => thread_name,
        );
    }));
}
