//! Scripted in-memory transport for tests
//!
//! Each call to [`FakeTransport::connect`] consumes the next [`FakeDial`]
//! from the script. Once the script is exhausted every dial is refused.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{Connection, Inbound, Transport, TransportError};

/// What the next dial does.
#[derive(Debug)]
pub enum FakeDial {
    /// Fail with a recoverable connect error
    Refuse,
    /// Fail with the given error
    Fail(TransportError),
    /// Connect, then fail the handshake
    RejectHandshake,
    /// Connect and replay these results, then close cleanly
    Messages(Vec<Result<Inbound, TransportError>>),
    /// Connect and relay whatever arrives on the channel; closes when the
    /// sender is dropped
    Live(mpsc::UnboundedReceiver<Inbound>),
    /// Connect and never produce a message
    Hang,
}

/// A [`Transport`] driven by a fixed script.
#[derive(Debug, Clone)]
pub struct FakeTransport {
    script: Arc<Mutex<VecDeque<FakeDial>>>,
    dials: Arc<Mutex<Vec<Instant>>>,
}

impl FakeTransport {
    pub fn new(script: Vec<FakeDial>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            dials: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A transport with one live connection and its feeding sender.
    pub fn live() -> (Self, mpsc::UnboundedSender<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(vec![FakeDial::Live(rx)]), tx)
    }

    /// Shared record of when each dial happened.
    pub fn dial_times(&self) -> Arc<Mutex<Vec<Instant>>> {
        Arc::clone(&self.dials)
    }
}

#[derive(Debug)]
enum Feed {
    Scripted(VecDeque<Result<Inbound, TransportError>>),
    Live(mpsc::UnboundedReceiver<Inbound>),
    Hang,
}

#[derive(Debug)]
pub struct FakeConnection {
    feed: Feed,
    reject_handshake: bool,
}

#[async_trait]
impl Transport for FakeTransport {
    type Connection = FakeConnection;

    fn endpoint(&self) -> &str {
        "fake://upstream"
    }

    async fn connect(&self) -> Result<FakeConnection, TransportError> {
        self.dials.lock().unwrap().push(Instant::now());
        let next = self.script.lock().unwrap().pop_front();

        let (feed, reject_handshake) = match next {
            None | Some(FakeDial::Refuse) => {
                return Err(TransportError::Connect("connection refused".into()))
            }
            Some(FakeDial::Fail(e)) => return Err(e),
            Some(FakeDial::RejectHandshake) => (Feed::Hang, true),
            Some(FakeDial::Messages(messages)) => (Feed::Scripted(messages.into()), false),
            Some(FakeDial::Live(rx)) => (Feed::Live(rx), false),
            Some(FakeDial::Hang) => (Feed::Hang, false),
        };

        Ok(FakeConnection {
            feed,
            reject_handshake,
        })
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn handshake(&mut self) -> Result<(), TransportError> {
        if self.reject_handshake {
            return Err(TransportError::Handshake("status 503".into()));
        }
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<Inbound>, TransportError> {
        match &mut self.feed {
            Feed::Scripted(queue) => queue.pop_front().transpose(),
            Feed::Live(rx) => Ok(rx.recv().await),
            Feed::Hang => std::future::pending().await,
        }
    }
}
