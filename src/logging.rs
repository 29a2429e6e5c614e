//! Diagnostic logging setup
//!
//! Diagnostics go to stderr, optionally mirrored to a file, as JSON or
//! human-readable lines. Stdout carries nothing but event lines.

use crate::config::LoggingConfig;
use anyhow::Result;
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directive for a configured level.
///
/// Only this crate is raised to `level`; dependencies stay at `warn`.
pub fn filter_directive(level: &str) -> String {
    format!("warn,gh_pulse={}", level.to_lowercase())
}

/// Subscriber for diagnostics emitted while configuration is still being
/// loaded: warnings and errors, plain text, stderr.
///
/// Install it with [`tracing::subscriber::with_default`] around
/// `Config::load`; [`init_logging`] takes over once the config is known.
pub fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .with_target(true)
        .finish()
}

/// Initialize logging based on configuration.
///
/// `RUST_LOG` wins over `config.level` when set.
///
/// # Errors
///
/// Returns error if the filter is invalid, the log file cannot be opened,
/// or a global subscriber is already installed.
///
/// # Examples
///
/// ```no_run
/// use gh_pulse::config::LoggingConfig;
/// use gh_pulse::logging::init_logging;
///
/// init_logging(&LoggingConfig::default()).unwrap();
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directive(&config.level)))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let file = match &config.file_path {
        Some(path) => Some(Arc::new(
            OpenOptions::new().create(true).append(true).open(path)?,
        )),
        None => None,
    };

    if config.json_format {
        let stderr_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr);
        let file_layer = file.map(|file| {
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(file)
        });
        registry.with(stderr_layer).with(file_layer).try_init()?;
    } else {
        let stderr_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr);
        let file_layer = file.map(|file| {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(false)
                .with_writer(file)
        });
        registry.with(stderr_layer).with(file_layer).try_init()?;
    }

    Ok(())
}
