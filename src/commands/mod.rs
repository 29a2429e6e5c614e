/*!
Command handlers for the CLI

This module provides the handlers invoked by the CLI entrypoint:

- `serve`   runs the webhook collector and WebSocket fan-out
- `stream`  prints events as they arrive
- `capture` buffers events and prints them when the session ends

Every handler returns the process exit code. Errors returned from here are
reported before any event is read; [`error_exit_code`] maps them.
*/

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::assertion::AssertionSet;
use crate::cli::{SessionArgs, TransportKind};
use crate::config::Config;
use crate::error::{PulseError, Result};
use crate::session::{
    SessionConfig, SessionMode, ShutdownSignal, StreamSession, EXIT_FATAL, EXIT_USAGE,
};
use crate::source::sse::SseTransport;
use crate::source::websocket::WebSocketTransport;
use crate::source::{ReconnectingSource, Transport};

/// Exit code for an error returned by a handler or by startup.
///
/// Configuration, assertion, and endpoint problems are usage errors;
/// anything else is fatal.
pub fn error_exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<PulseError>() {
        Some(PulseError::Config(_))
        | Some(PulseError::Assertion(_))
        | Some(PulseError::Transport(_)) => EXIT_USAGE,
        _ => EXIT_FATAL,
    }
}

/// Resolve when SIGINT or SIGTERM arrives, reporting which one.
pub async fn wait_for_signal() -> ShutdownSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
                    _ = term.recv() => ShutdownSignal::Terminate,
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                ShutdownSignal::Interrupt
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        ShutdownSignal::Interrupt
    }
}

// Serve command handler
pub mod serve {
    //! Webhook collector handler.

    use super::*;
    use crate::server;

    /// Run the collector until SIGINT or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound.
    pub async fn run_serve(config: Config) -> Result<i32> {
        let cancel = CancellationToken::new();
        let watcher = cancel.clone();
        let signals = tokio::spawn(async move {
            let signal = wait_for_signal().await;
            info!(?signal, "Shutting down");
            watcher.cancel();
        });

        let result = server::serve(&config, cancel).await;
        signals.abort();
        result.map(|()| 0)
    }
}

// Stream and capture command handler
pub mod stream {
    //! `stream` and `capture` handler.

    use super::*;

    /// Build the session settings from CLI flags and configuration.
    ///
    /// # Errors
    ///
    /// Returns an assertion error for malformed rules, and a configuration
    /// error for a capture with no way to end.
    pub fn session_config(
        config: &Config,
        mode: SessionMode,
        args: &SessionArgs,
        raw: bool,
    ) -> Result<SessionConfig> {
        let assertions =
            AssertionSet::parse(&args.success_on, &args.failure_on).map_err(PulseError::from)?;
        let timeout = args
            .timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        if mode == SessionMode::Capture && assertions.is_empty() && timeout.is_none() {
            return Err(PulseError::Config(
                "capture needs --success-on, --failure-on, or --timeout".to_string(),
            )
            .into());
        }

        Ok(SessionConfig {
            mode,
            assertions,
            timeout,
            raw,
            capture: config.capture.clone(),
            event_channel_capacity: config.source.event_channel_capacity,
        })
    }

    /// Run a `stream` or `capture` session against `args.url`.
    ///
    /// # Errors
    ///
    /// Returns error for invalid rules, an unusable URL, or a stdout write
    /// failure.
    pub async fn run_session(
        config: Config,
        mode: SessionMode,
        args: SessionArgs,
        raw: bool,
    ) -> Result<i32> {
        let session_config = session_config(&config, mode, &args, raw)?;

        let Some(kind) = args.resolved_transport() else {
            return Err(PulseError::Config(format!(
                "cannot infer transport from '{}'; pass --transport",
                args.url
            ))
            .into());
        };

        match kind {
            TransportKind::Ws => {
                let transport = WebSocketTransport::new(&args.url, args.events.clone())
                    .map_err(PulseError::from)?;
                drive(transport, &config, session_config).await
            }
            TransportKind::Sse => {
                let transport = SseTransport::new(&args.url)
                    .map_err(PulseError::from)?
                    .with_categories(args.events.clone());
                drive(transport, &config, session_config).await
            }
        }
    }

    async fn drive<T: Transport + 'static>(
        transport: T,
        config: &Config,
        session_config: SessionConfig,
    ) -> Result<i32> {
        info!(
            url = transport.endpoint(),
            mode = ?session_config.mode,
            "Starting session"
        );
        let source = ReconnectingSource::new(transport, config.source.backoff_policy());
        let session = StreamSession::new(source, session_config);

        let cancel = CancellationToken::new();
        let watcher = cancel.clone();
        let signals = tokio::spawn(async move {
            let signal = wait_for_signal().await;
            info!(?signal, "Shutdown requested");
            watcher.cancel();
            signal
        });

        let mut stdout = tokio::io::stdout();
        let exit = session.run(&mut stdout, &cancel).await;

        let signal = if cancel.is_cancelled() {
            signals.await.ok()
        } else {
            signals.abort();
            None
        };

        let exit = exit?;
        let code = exit.exit_code(signal);
        info!(?exit, code, "Session finished");
        Ok(code)
    }
}
