//! Stream and capture sessions
//!
//! A session wires a [`ReconnectingSource`] to the output sink and decides
//! when to stop. The source runs as its own task and forwards events over a
//! bounded channel; the session task races that channel against the timeout
//! timer and external cancellation.
//!
//! ```text
//! Running -> Matched(code) | Timeout | Fatal | Cancelled | SourceFailed
//! ```
//!
//! In stream mode each event line is written (and flushed) before the
//! assertions are evaluated, so the deciding event is always emitted. In
//! capture mode lines are buffered and the buffer is flushed on every exit
//! path, including cancellation and the fatal size limit.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assertion::{AssertionSet, Verdict};
use crate::capture::CaptureBuffer;
use crate::config::CaptureConfig;
use crate::error::{Outcome, PulseError, Result};
use crate::event::Event;
use crate::source::{EventHandler, Flow, ReconnectingSource, Transport};

/// Exit code when the timeout elapsed without a match.
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code for fatal conditions (capture limit, unrecoverable source).
pub const EXIT_FATAL: i32 = 1;
/// Exit code for configuration and parse errors reported before streaming.
pub const EXIT_USAGE: i32 = 2;
/// Exit code after SIGINT.
pub const EXIT_INTERRUPTED: i32 = 130;
/// Exit code after SIGTERM.
pub const EXIT_TERMINATED: i32 = 143;

/// How events reach the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Print each event as it arrives
    Stream,
    /// Buffer events and print them all when the session ends
    Capture,
}

/// Which signal requested shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl-C
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl ShutdownSignal {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Interrupt => EXIT_INTERRUPTED,
            Self::Terminate => EXIT_TERMINATED,
        }
    }
}

/// Everything a session needs besides its source.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: SessionMode,
    pub assertions: AssertionSet,
    /// `None` or zero disables the timer
    pub timeout: Option<Duration>,
    /// Forward undecodable upstream messages verbatim (stream mode only)
    pub raw: bool,
    pub capture: CaptureConfig,
    /// Capacity of the source-to-session channel
    pub event_channel_capacity: usize,
}

/// Terminal state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// An assertion matched; `code` is its exit code
    Matched { code: i32 },
    /// The timeout elapsed first
    Timeout,
    /// Capture limit reached
    Fatal(String),
    /// Shutdown was requested
    Cancelled,
    /// The source stopped with a non-recoverable error
    SourceFailed(String),
}

impl SessionExit {
    /// Process exit code for this outcome. `signal` decides the code of a
    /// cancelled session; without one, cancellation counts as an interrupt.
    pub fn exit_code(&self, signal: Option<ShutdownSignal>) -> i32 {
        match self {
            Self::Matched { code } => *code,
            Self::Timeout => EXIT_TIMEOUT,
            Self::Fatal(_) | Self::SourceFailed(_) => EXIT_FATAL,
            Self::Cancelled => signal.unwrap_or(ShutdownSignal::Interrupt).exit_code(),
        }
    }
}

#[derive(Debug)]
enum Item {
    Event(Event),
    Raw(String),
    Ended(Outcome),
}

struct Forwarder {
    tx: mpsc::Sender<Item>,
    raw: bool,
}

impl Forwarder {
    async fn forward(&self, item: Item) -> Flow {
        match self.tx.send(item).await {
            Ok(()) => Flow::Continue,
            // The session is gone; nobody will read further events.
            Err(_) => Flow::Stop(Outcome::Cancelled),
        }
    }
}

#[async_trait]
impl EventHandler for Forwarder {
    async fn on_event(&mut self, event: Event) -> Flow {
        self.forward(Item::Event(event)).await
    }

    async fn on_undecodable(&mut self, raw: String) -> Flow {
        if !self.raw {
            return Flow::Continue;
        }
        self.forward(Item::Raw(raw)).await
    }
}

/// One `stream` or `capture` invocation.
pub struct StreamSession<T: Transport> {
    source: ReconnectingSource<T>,
    config: SessionConfig,
}

impl<T: Transport + 'static> StreamSession<T> {
    pub fn new(source: ReconnectingSource<T>, config: SessionConfig) -> Self {
        Self { source, config }
    }

    /// Run until an exit condition, writing JSON lines to `out`.
    ///
    /// Errors are I/O failures on `out`; every other ending is a
    /// [`SessionExit`].
    pub async fn run<W>(self, out: &mut W, cancel: &CancellationToken) -> Result<SessionExit>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let Self { source, config } = self;
        let (tx, mut rx) = mpsc::channel(config.event_channel_capacity.max(1));

        let source_cancel = cancel.child_token();
        let task_cancel = source_cancel.clone();
        let raw = config.raw && config.mode == SessionMode::Stream;
        let source_task = tokio::spawn(async move {
            let mut forwarder = Forwarder {
                tx: tx.clone(),
                raw,
            };
            let outcome = source.run(&mut forwarder, &task_cancel).await;
            let _ = tx.send(Item::Ended(outcome)).await;
        });

        let mut capture = match config.mode {
            SessionMode::Capture => Some(CaptureBuffer::new(&config.capture)),
            SessionMode::Stream => None,
        };

        let driven = drive(&config, &mut rx, out, &mut capture, cancel).await;

        source_cancel.cancel();
        drop(rx);
        if let Err(e) = source_task.await {
            warn!(error = %e, "Source task did not finish cleanly");
        }

        let exit = driven?;

        if let Some(buffer) = &capture {
            match buffer.flush_to(out).await {
                Ok(()) => info!(
                    events = buffer.len(),
                    bytes = buffer.total_bytes(),
                    "Capture buffer flushed"
                ),
                // The fatal condition is what gets reported.
                Err(e) if matches!(exit, SessionExit::Fatal(_)) => {
                    error!(error = %e, "Failed to flush capture buffer")
                }
                Err(e) => return Err(PulseError::from(e).into()),
            }
        }

        info!(exit = ?exit, "Session finished");
        Ok(exit)
    }
}

async fn drive<W>(
    config: &SessionConfig,
    rx: &mut mpsc::Receiver<Item>,
    out: &mut W,
    capture: &mut Option<CaptureBuffer>,
    cancel: &CancellationToken,
) -> Result<SessionExit>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let timeout = config.timeout.filter(|t| !t.is_zero());
    let deadline = async move {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(SessionExit::Cancelled),
            _ = &mut deadline => {
                info!(timeout_secs = timeout.map(|t| t.as_secs_f64()), "Timeout elapsed without a match");
                return Ok(SessionExit::Timeout);
            }
            item = rx.recv() => item,
        };

        match item {
            Some(Item::Event(event)) => {
                let line = event.to_line().map_err(PulseError::from)?;
                match capture.as_mut() {
                    Some(buffer) => {
                        if let Err(e) = buffer.push(line) {
                            error!(error = %e, "Capture limit reached");
                            return Ok(SessionExit::Fatal(e.to_string()));
                        }
                    }
                    None => write_line(out, &line).await.map_err(PulseError::from)?,
                }

                if let Some(verdict) = evaluate(&config.assertions, &event)? {
                    info!(
                        event = %event.category,
                        delivery_id = %event.delivery_id,
                        exit_code = verdict.exit_code(),
                        success = matches!(verdict, Verdict::Success(_)),
                        "Assertion matched"
                    );
                    return Ok(SessionExit::Matched {
                        code: verdict.exit_code(),
                    });
                }
            }
            Some(Item::Raw(raw)) => {
                debug!(bytes = raw.len(), "Forwarding undecodable message verbatim");
                write_line(out, &raw).await.map_err(PulseError::from)?;
            }
            Some(Item::Ended(outcome)) => {
                return Ok(match outcome {
                    Outcome::Cancelled => SessionExit::Cancelled,
                    Outcome::ExitWithCode(code) => SessionExit::Matched { code },
                    Outcome::Fatal(reason) | Outcome::Recoverable(reason) => {
                        error!(error = %reason, "Source stopped");
                        SessionExit::SourceFailed(reason)
                    }
                });
            }
            None => {
                return Ok(SessionExit::SourceFailed(
                    "source task ended unexpectedly".to_string(),
                ))
            }
        }
    }
}

fn evaluate(assertions: &AssertionSet, event: &Event) -> Result<Option<Verdict>> {
    if assertions.is_empty() {
        return Ok(None);
    }
    let document = event.to_value().map_err(PulseError::from)?;
    Ok(assertions.evaluate(&document))
}

async fn write_line<W>(out: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}
