//! Logging setup.

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the tracing subscriber according to the logging options.
///
/// Returns a guard that must stay alive for the lifetime of the process
/// when file logging is active, so buffered lines are flushed on exit.
pub fn setup_logging(disable_logs: bool, logs_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    // `disable_logs` with no log directory silences everything; with a
    // directory it only silences the console.
    let console = !disable_logs;

    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match logs_path {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "pavise.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if console {
                tracing_subscriber::registry()
                    .with(filter())
                    .with(fmt::layer())
                    .with(fmt::layer().with_ansi(false).with_writer(writer))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter())
                    .with(fmt::layer().with_ansi(false).with_writer(writer))
                    .init();
            }
            Ok(Some(guard))
        }
        None => {
            if console {
                tracing_subscriber::registry()
                    .with(filter())
                    .with(fmt::layer())
                    .init();
            }
            Ok(None)
        }
    }
}
