//! Resilient upstream event source
//!
//! [`ReconnectingSource`] keeps one upstream connection open at a time and
//! turns it into a continuous stream of [`Event`]s handed to an
//! [`EventHandler`]. On any recoverable failure it waits with exponential
//! backoff and dials again; only cancellation, a fatal transport error, or a
//! handler asking to stop ends [`ReconnectingSource::run`].
//!
//! # Design
//!
//! The wire protocol is a capability behind the [`Transport`] and
//! [`Connection`] traits:
//!
//! - [`websocket::WebSocketTransport`] -- subscribes with a control message
//!   and reads event envelopes from text frames.
//! - [`sse::SseTransport`] -- issues `Accept: text/event-stream` and decodes
//!   relay payloads from SSE data blocks.
//!
//! The state machine, backoff and cancellation handling are written once,
//! here, against those traits.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected (error, retry)
//!                                         -> Draining     (cancel or stop)
//! ```

pub mod sse;
pub mod websocket;

#[cfg(test)]
pub mod fake;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Outcome;
use crate::event::Event;

/// Errors raised by a concrete transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The endpoint can never be dialled (bad URL or scheme)
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Dialling failed
    #[error("connect failed: {0}")]
    Connect(String),

    /// The upstream refused the handshake (non-2xx/101 response, subscribe write failed)
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Reading from an established connection failed
    #[error("read failed: {0}")]
    Read(String),

    /// The byte stream can no longer be split into messages
    #[error("framing error: {0}")]
    Framing(String),
}

impl TransportError {
    /// Classify this error for the reconnect loop.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::InvalidEndpoint(_) => Outcome::Fatal(self.to_string()),
            _ => Outcome::Recoverable(self.to_string()),
        }
    }
}

/// One fully reconstructed upstream message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Decoded successfully
    Event(Event),
    /// Framed correctly but not a valid event; the connection stays up
    Undecodable {
        /// The message text as received
        raw: String,
        /// Why decoding failed
        reason: String,
    },
}

impl Inbound {
    /// Decode a message that should already be an event envelope.
    pub fn decode_envelope(raw: String) -> Self {
        match Event::from_json(&raw) {
            Ok(event) => Self::Event(event),
            Err(e) => Self::Undecodable {
                raw,
                reason: e.to_string(),
            },
        }
    }
}

/// A dialler for one wire protocol.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// The connection type produced by [`Transport::connect`].
    type Connection: Connection;

    /// Human-readable upstream address, used in logs.
    fn endpoint(&self) -> &str;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection, TransportError>;
}

/// An established upstream connection.
#[async_trait]
pub trait Connection: Send {
    /// Protocol-specific setup performed before the first read.
    async fn handshake(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Read the next full message.
    ///
    /// Returns `Ok(None)` when the upstream closed the connection cleanly.
    async fn next_message(&mut self) -> Result<Option<Inbound>, TransportError>;

    /// Release the connection. Best-effort.
    async fn close(&mut self) {}
}

/// Whether the handler wants more events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading
    Continue,
    /// Stop the source and report this outcome
    Stop(Outcome),
}

/// Consumer of the source's event stream.
#[async_trait]
pub trait EventHandler: Send {
    /// Called once per decoded event, in arrival order.
    async fn on_event(&mut self, event: Event) -> Flow;

    /// Called for a message that could not be decoded. The source has
    /// already logged it.
    async fn on_undecodable(&mut self, _raw: String) -> Flow {
        Flow::Continue
    }
}

/// Lifecycle of the current upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; possibly waiting out a backoff delay
    Disconnected,
    /// Dialling and handshaking
    Connecting,
    /// Reading messages
    Connected,
    /// Shutting down after cancellation or a stop request
    Draining,
}

/// Reconnect delay bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// First delay, and the delay after any successful connection
    pub initial: Duration,
    /// Ceiling for the doubling delay
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff: `initial`, doubling per consecutive failure up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    /// Start at the policy's initial delay.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.initial,
        }
    }

    /// Delay to wait now; advances the next delay.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use gh_pulse::source::{Backoff, BackoffPolicy};
    ///
    /// let mut backoff = Backoff::new(BackoffPolicy::default());
    /// assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    /// assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    /// backoff.reset();
    /// assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    /// ```
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.policy.max);
        delay
    }

    /// Go back to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.policy.initial;
    }
}

/// A logical event stream over an unreliable transport.
#[derive(Debug)]
pub struct ReconnectingSource<T: Transport> {
    transport: T,
    policy: BackoffPolicy,
    state: watch::Sender<ConnectionState>,
}

impl<T: Transport> ReconnectingSource<T> {
    /// Wrap a transport.
    pub fn new(transport: T, policy: BackoffPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            policy,
            state,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(url = %self.transport.endpoint(), from = ?previous, to = ?next, "Source state changed");
        }
    }

    /// Deliver events to `handler` until cancelled or told to stop.
    ///
    /// Never returns [`Outcome::Recoverable`]: recoverable errors are retried
    /// here after backing off.
    pub async fn run<H>(&self, handler: &mut H, cancel: &CancellationToken) -> Outcome
    where
        H: EventHandler + ?Sized,
    {
        let url = self.transport.endpoint();
        let mut backoff = Backoff::new(self.policy);

        loop {
            if cancel.is_cancelled() {
                self.transition(ConnectionState::Draining);
                return Outcome::Cancelled;
            }

            self.transition(ConnectionState::Connecting);
            info!(url = %url, "Connecting");

            let dialled = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.transition(ConnectionState::Draining);
                    return Outcome::Cancelled;
                }
                dialled = self.establish() => dialled,
            };

            let failure = match dialled {
                Ok(mut conn) => {
                    backoff.reset();
                    self.transition(ConnectionState::Connected);
                    info!(url = %url, "Connected");

                    match self.read_until_failure(&mut conn, handler, cancel).await {
                        ReadEnd::Finished(outcome) => {
                            self.transition(ConnectionState::Draining);
                            conn.close().await;
                            return outcome;
                        }
                        ReadEnd::Lost(reason) => {
                            conn.close().await;
                            reason
                        }
                    }
                }
                Err(e) => {
                    if let Outcome::Fatal(reason) = e.outcome() {
                        self.transition(ConnectionState::Disconnected);
                        return Outcome::Fatal(reason);
                    }
                    e.to_string()
                }
            };

            self.transition(ConnectionState::Disconnected);
            let delay = backoff.next_delay();
            warn!(
                url = %url,
                error = %failure,
                backoff_secs = delay.as_secs_f64(),
                "Disconnected, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.transition(ConnectionState::Draining);
                    return Outcome::Cancelled;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn establish(&self) -> Result<T::Connection, TransportError> {
        let mut conn = self.transport.connect().await?;
        if let Err(e) = conn.handshake().await {
            conn.close().await;
            return Err(e);
        }
        Ok(conn)
    }

    async fn read_until_failure<H>(
        &self,
        conn: &mut T::Connection,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> ReadEnd
    where
        H: EventHandler + ?Sized,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ReadEnd::Finished(Outcome::Cancelled),
                next = conn.next_message() => next,
            };

            let flow = match next {
                Ok(Some(Inbound::Event(event))) => {
                    debug!(event = %event.category, delivery_id = %event.delivery_id, "Event received");
                    handler.on_event(event).await
                }
                Ok(Some(Inbound::Undecodable { raw, reason })) => {
                    warn!(error = %reason, bytes = raw.len(), "Skipping undecodable message");
                    handler.on_undecodable(raw).await
                }
                Ok(None) => return ReadEnd::Lost("connection closed by upstream".to_string()),
                Err(e) => match e.outcome() {
                    Outcome::Fatal(reason) => return ReadEnd::Finished(Outcome::Fatal(reason)),
                    _ => return ReadEnd::Lost(e.to_string()),
                },
            };

            match flow {
                Flow::Continue => {}
                Flow::Stop(Outcome::Recoverable(reason)) => return ReadEnd::Lost(reason),
                Flow::Stop(outcome) => return ReadEnd::Finished(outcome),
            }
        }
    }
}

enum ReadEnd {
    Finished(Outcome),
    Lost(String),
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeDial, FakeTransport};
    use super::*;
    use serde_json::json;
    use tokio::time::Instant;

    struct Collecting {
        events: Vec<Event>,
        undecodable: Vec<String>,
        stop_after: Option<usize>,
    }

    impl Collecting {
        fn new(stop_after: Option<usize>) -> Self {
            Self {
                events: Vec::new(),
                undecodable: Vec::new(),
                stop_after,
            }
        }
    }

    #[async_trait]
    impl EventHandler for Collecting {
        async fn on_event(&mut self, event: Event) -> Flow {
            self.events.push(event);
            match self.stop_after {
                Some(n) if self.events.len() >= n => Flow::Stop(Outcome::ExitWithCode(0)),
                _ => Flow::Continue,
            }
        }

        async fn on_undecodable(&mut self, raw: String) -> Flow {
            self.undecodable.push(raw);
            Flow::Continue
        }
    }

    fn event(category: &str) -> Inbound {
        Inbound::Event(Event::new(category, "d", json!({})))
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_transport_error_classification() {
        assert!(matches!(
            TransportError::InvalidEndpoint("ftp://x".into()).outcome(),
            Outcome::Fatal(_)
        ));
        assert!(TransportError::Connect("refused".into()).outcome().is_recoverable());
        assert!(TransportError::Framing("utf8".into()).outcome().is_recoverable());
    }

    #[test]
    fn test_decode_envelope() {
        let ok = Inbound::decode_envelope(r#"{"type":"event","event":"push","payload":{}}"#.into());
        assert!(matches!(ok, Inbound::Event(e) if e.category == "push"));

        let bad = Inbound::decode_envelope("{oops".into());
        assert!(matches!(bad, Inbound::Undecodable { raw, .. } if raw == "{oops"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_events_in_order_and_stops_on_request() {
        let transport = FakeTransport::new(vec![FakeDial::Messages(vec![
            Ok(event("push")),
            Ok(event("issues")),
            Ok(event("never-read")),
        ])]);
        let source = ReconnectingSource::new(transport, BackoffPolicy::default());
        let mut handler = Collecting::new(Some(2));

        let outcome = source.run(&mut handler, &CancellationToken::new()).await;

        assert_eq!(outcome, Outcome::ExitWithCode(0));
        let categories: Vec<_> = handler.events.iter().map(|e| e.category.as_str()).collect();
        assert_eq!(categories, vec!["push", "issues"]);
        assert_eq!(source.state(), ConnectionState::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_across_failed_dials_and_resets_after_success() {
        let transport = FakeTransport::new(vec![
            FakeDial::Refuse,
            FakeDial::Refuse,
            FakeDial::Refuse,
            FakeDial::Messages(vec![Err(TransportError::Read("reset".into()))]),
            FakeDial::Refuse,
            FakeDial::Messages(vec![Ok(event("push"))]),
        ]);
        let dials = transport.dial_times();
        let source = ReconnectingSource::new(transport, BackoffPolicy::default());
        let mut handler = Collecting::new(Some(1));

        let start = Instant::now();
        let outcome = source.run(&mut handler, &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::ExitWithCode(0));

        let offsets: Vec<u64> = dials
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(start).as_secs())
            .collect();
        // waits: 1, 2, 4, then reset by the successful dial: 1, 2
        assert_eq!(offsets, vec![0, 1, 3, 7, 8, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_failure_is_retried() {
        let transport = FakeTransport::new(vec![
            FakeDial::RejectHandshake,
            FakeDial::Messages(vec![Ok(event("push"))]),
        ]);
        let source = ReconnectingSource::new(transport, BackoffPolicy::default());
        let mut handler = Collecting::new(Some(1));

        let outcome = source.run(&mut handler, &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::ExitWithCode(0));
        assert_eq!(handler.events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_message_skipped_without_reconnect() {
        let transport = FakeTransport::new(vec![FakeDial::Messages(vec![
            Ok(Inbound::Undecodable {
                raw: "{bad".into(),
                reason: "eof".into(),
            }),
            Ok(event("push")),
        ])]);
        let dials = transport.dial_times();
        let source = ReconnectingSource::new(transport, BackoffPolicy::default());
        let mut handler = Collecting::new(Some(1));

        source.run(&mut handler, &CancellationToken::new()).await;

        assert_eq!(handler.undecodable, vec!["{bad".to_string()]);
        assert_eq!(handler.events.len(), 1);
        assert_eq!(dials.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_framing_error_reconnects() {
        let transport = FakeTransport::new(vec![
            FakeDial::Messages(vec![Err(TransportError::Framing("bad utf-8".into()))]),
            FakeDial::Messages(vec![Ok(event("push"))]),
        ]);
        let dials = transport.dial_times();
        let source = ReconnectingSource::new(transport, BackoffPolicy::default());
        let mut handler = Collecting::new(Some(1));

        source.run(&mut handler, &CancellationToken::new()).await;
        assert_eq!(dials.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_dial_error_stops() {
        let transport = FakeTransport::new(vec![FakeDial::Fail(TransportError::InvalidEndpoint(
            "nope://".into(),
        ))]);
        let source = ReconnectingSource::new(transport, BackoffPolicy::default());
        let mut handler = Collecting::new(None);

        let outcome = source.run(&mut handler, &CancellationToken::new()).await;
        assert!(matches!(outcome, Outcome::Fatal(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff_wait() {
        let transport = FakeTransport::new(vec![FakeDial::Refuse]);
        let source = ReconnectingSource::new(transport, BackoffPolicy {
            initial: Duration::from_secs(3600),
            max: Duration::from_secs(3600),
        });
        let cancel = CancellationToken::new();
        let mut handler = Collecting::new(None);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let outcome = source.run(&mut handler, &cancel).await;
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unblocks_pending_read() {
        let transport = FakeTransport::new(vec![FakeDial::Hang]);
        let source = ReconnectingSource::new(transport, BackoffPolicy::default());
        let mut state = source.watch_state();
        let cancel = CancellationToken::new();
        let mut handler = Collecting::new(None);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            while *state.borrow_and_update() != ConnectionState::Connected {
                if state.changed().await.is_err() {
                    return;
                }
            }
            trigger.cancel();
        });

        let outcome = source.run(&mut handler, &cancel).await;
        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(source.state(), ConnectionState::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_close_reconnects() {
        let transport = FakeTransport::new(vec![
            FakeDial::Messages(vec![Ok(event("first"))]),
            FakeDial::Messages(vec![Ok(event("second"))]),
        ]);
        let source = ReconnectingSource::new(transport, BackoffPolicy::default());
        let mut handler = Collecting::new(Some(2));

        source.run(&mut handler, &CancellationToken::new()).await;
        let categories: Vec<_> = handler.events.iter().map(|e| e.category.as_str()).collect();
        assert_eq!(categories, vec!["first", "second"]);
    }
}
