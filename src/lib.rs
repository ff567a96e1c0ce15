use color_eyre::eyre::eyre;
use color_eyre::eyre::WrapErr;
pub use color_eyre::eyre::{Error, Result};
use tracing_subscriber::EnvFilter;

use crate::args::LogFormat;

pub mod args;

pub mod bridge;

pub mod broker;

pub mod bus;

pub mod cli;

pub mod envelope;

pub mod events;

pub mod hooks;

pub mod store;

pub mod things;

pub mod topic;

pub fn bootstrap(log_format: LogFormat, log_level: &str) -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        // Don't die if the file doesn't exist.
        if !e.not_found() {
            return Err(e).context("error reading `.env` file");
        }
    }

    // Enables capturing backtraces on stable and adds color codes.
    color_eyre::install()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt::fmt().with_env_filter(filter);

    match log_format {
        // These all result in different typestate
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| eyre!(e))?;

    Ok(())
}

/// Flatten a `JoinHandle` result into the task's own result.
pub fn flatten_task_result<T>(res: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match res {
        Ok(res) => res,
        Err(e) => Err(eyre!(e)).context("task panicked or was cancelled"),
    }
}
