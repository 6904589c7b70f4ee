//! Log routing for peer connection I/O.
//!
//! Every connection records its events inside a `peer` span carrying the
//! remote address and direction. The console shows what the caller asked
//! for; the log file under `logs/` keeps this crate's full TRACE output,
//! per-read dispatch included, and only warnings from everything else.

use std::fs::{File, create_dir_all};
use std::path::Path;

use tracing::{Level, Subscriber};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the per-run trace log written inside the logs directory.
pub const LOG_FILE_NAME: &str = "riptide-transport-last-run.log";

/// Name of the span each peer connection records its events in.
pub const PEER_SPAN_NAME: &str = "peer";

/// Creates the span a connection to `address` logs under.
pub(crate) fn peer_span(address: std::net::SocketAddr, is_incoming: bool) -> tracing::Span {
    let direction = if is_incoming { "in" } else { "out" };
    tracing::debug_span!(PEER_SPAN_NAME, %address, direction)
}

/// File filter: warnings from dependencies, everything from the transport.
pub fn file_filter() -> EnvFilter {
    EnvFilter::new(format!("warn,{}=trace", env!("CARGO_CRATE_NAME")))
}

/// Console filter: `RUST_LOG` if set, otherwise `console_level` everywhere.
pub fn console_filter(console_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(console_level.to_string()))
}

/// Builds the console plus trace-file subscriber without installing it.
pub fn peer_io_subscriber(
    console_level: Level,
    log_file: File,
) -> impl Subscriber + Send + Sync + 'static {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_filter(console_filter(console_level));

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(file_filter());

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
}

/// Installs the peer I/O subscriber globally.
///
/// # Arguments
/// * `console_level` - Log level for console output, unless `RUST_LOG` is set
/// * `logs_dir` - Directory to write the trace log (defaults to "./logs")
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - If the logs directory or file cannot be
///   created, or a global subscriber is already installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_path)?;

    let log_file_path = logs_path.join(LOG_FILE_NAME);
    let log_file = File::create(&log_file_path)?;

    peer_io_subscriber(console_level, log_file).try_init()?;

    tracing::info!(
        "Peer I/O tracing: console={}, trace_file={}",
        console_level,
        log_file_path.display()
    );

    Ok(())
}
