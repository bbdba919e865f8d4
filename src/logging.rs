//! Logging setup for hosts embedding the analysis core.
//!
//! The crate itself only emits `tracing` events; a host process that has no
//! subscriber of its own can call [`init`] to get env-filtered output with a
//! daily-rolling file fallback.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
///
/// Log level is controlled via the `LUMEN_LOG` environment variable:
/// - `LUMEN_LOG=debug` for verbose output
/// - `LUMEN_LOG=info` for standard output (default)
/// - `LUMEN_LOG=warn` for warnings and errors only
///
/// With `log_dir` set, output goes to a daily-rolling file there; otherwise
/// to stderr.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_env("LUMEN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            let file_appender = tracing_appender::rolling::daily(&dir, "lumen-analysis.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // Keep the writer guard alive for the process lifetime; init()
            // is only called once at startup.
            static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
                std::sync::OnceLock::new();
            let _ = GUARD.set(guard);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    tracing::info!("Logging initialized");
    Ok(())
}
