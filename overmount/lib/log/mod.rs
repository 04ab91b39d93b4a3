//! Tracing setup for the overmount engine.
//!
//! The engine logs everything through [`tracing`]; this module wires the
//! process-wide subscriber the way the engine expects it: one stdout layer and
//! one plain-text file layer per log file. Captured output of the external
//! mount and unmount utilities is replayed through the same subscriber line by
//! line, so the log file is the single place to look for utility detail that
//! public results do not carry.

use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{OvermountError, OvermountResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Installs the process-wide tracing subscriber with a stdout layer and a file layer.
///
/// `default_level` is used when `RUST_LOG` is not set. The returned guard must be
/// kept alive for the lifetime of the process; dropping it stops the background
/// writer and loses buffered log lines.
///
/// Calling this twice in one process returns an error since tracing subscribers
/// are global.
pub fn init_logging(
    log_file: impl AsRef<Path>,
    default_level: Level,
) -> OvermountResult<WorkerGuard> {
    let log_file = log_file.as_ref();
    let file_name = log_file
        .file_name()
        .ok_or_else(|| OvermountError::InvalidLogFile(log_file.display().to_string()))?;

    let log_dir = match log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let appender = tracing_appender::rolling::never(log_dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .map_err(OvermountError::custom)?;

    Ok(guard)
}
