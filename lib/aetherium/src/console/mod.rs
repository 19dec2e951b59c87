//! Line-oriented admin command channel (§4.14). Reads newline-delimited commands from any
//! `BufRead` source — stdin in production, an in-memory cursor in tests — and posts each one as
//! a LAMBDA_JOB onto the dispatcher so it observes the same consistent state as packet handlers,
//! rather than racing them from its own thread.
use crate::dispatcher::Dispatcher;
use crate::metrics::Metrics;
use flux::logging;
use std::io::BufRead;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Commands recognized by the console (§4.14): `status`, `sessions`, `rooms`, `shutdown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Status,
    Sessions,
    Rooms,
    Shutdown,
    Unknown(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> ConsoleCommand {
        match line.trim() {
            "status" => ConsoleCommand::Status,
            "sessions" => ConsoleCommand::Sessions,
            "rooms" => ConsoleCommand::Rooms,
            "shutdown" => ConsoleCommand::Shutdown,
            other => ConsoleCommand::Unknown(other.to_string()),
        }
    }
}

/// Application-supplied counters the console reports for `sessions`/`rooms`; kept separate from
/// [`Metrics`] because those two counts are read directly rather than sampled.
pub trait ConsoleState: Send + Sync {
    fn live_session_count(&self) -> usize;
    fn live_room_count(&self) -> usize;
    fn request_shutdown(&self);
}

/// Reads commands from `input` line by line until EOF or a `shutdown` command, posting each as a
/// lambda job on `dispatcher`. Blocks the calling thread; run it on its own dedicated thread.
pub fn run(
    input: impl BufRead,
    dispatcher: Arc<Dispatcher>,
    metrics: Metrics,
    state: Arc<dyn ConsoleState>,
    log: logging::Logger,
) {
    let shutdown_requested = Arc::new(AtomicUsize::new(0));

    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = ConsoleCommand::parse(&line);
        let log = log.clone();
        let metrics = metrics.clone();
        let state = Arc::clone(&state);
        let shutdown_requested = Arc::clone(&shutdown_requested);
        let is_shutdown = command == ConsoleCommand::Shutdown;

        dispatcher.post_lambda(move || match command {
            ConsoleCommand::Status => {
                let snapshot = metrics.snapshot();
                logging::info!(log, "console: status"; "metrics" => ?snapshot);
            }
            ConsoleCommand::Sessions => {
                logging::info!(log, "console: sessions"; "live" => state.live_session_count());
            }
            ConsoleCommand::Rooms => {
                logging::info!(log, "console: rooms"; "live" => state.live_room_count());
            }
            ConsoleCommand::Shutdown => {
                shutdown_requested.store(1, Ordering::SeqCst);
                state.request_shutdown();
                logging::warn!(log, "console: shutdown requested");
            }
            ConsoleCommand::Unknown(cmd) => {
                logging::warn!(log, "console: unknown command"; "command" => cmd);
            }
        });

        if is_shutdown {
            break;
        }
    }
}
