//! In-process fan-out of events to downstream subscribers
//!
//! A single control task owns the subscriber set. Registration, removal and
//! event broadcast all arrive as [`Command`]s on one bounded inbox and are
//! processed in arrival order, so the set is never locked.
//!
//! Each subscriber gets a bounded outbound queue of serialized event lines.
//! Delivery never blocks the control task: a subscriber whose queue is full
//! is considered unresponsive and is evicted (its queue closes, which ends
//! its writer).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::event::Event;

/// Hub failures seen by callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The control task has stopped
    #[error("broadcast hub is closed")]
    Closed,

    /// The event could not be serialized
    #[error("failed to encode event: {0}")]
    Encode(String),
}

/// Categories a subscriber wants; empty means all.
///
/// Shared between the control task (reads on every broadcast) and the
/// subscriber's connection (replaces it on a new subscribe message).
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter(Arc<RwLock<HashSet<String>>>);

impl SubscriptionFilter {
    /// Build a filter from a category list.
    pub fn new<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Arc::new(RwLock::new(
            categories.into_iter().map(Into::into).collect(),
        )))
    }

    /// Replace (not merge) the current categories.
    pub fn replace<I, S>(&self, categories: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let next: HashSet<String> = categories.into_iter().map(Into::into).collect();
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Whether an event of `category` should be delivered.
    pub fn accepts(&self, category: &str) -> bool {
        let set = self.0.read().unwrap_or_else(PoisonError::into_inner);
        set.is_empty() || set.contains(category)
    }

    /// Current categories, sorted.
    pub fn categories(&self) -> Vec<String> {
        let set = self.0.read().unwrap_or_else(PoisonError::into_inner);
        let mut categories: Vec<String> = set.iter().cloned().collect();
        categories.sort();
        categories
    }
}

#[derive(Debug)]
enum Command {
    Register {
        id: u64,
        filter: SubscriptionFilter,
        queue: mpsc::Sender<Arc<str>>,
    },
    Unregister(u64),
    Broadcast {
        category: String,
        line: Arc<str>,
    },
    Count(oneshot::Sender<usize>),
}

struct Subscriber {
    filter: SubscriptionFilter,
    queue: mpsc::Sender<Arc<str>>,
}

/// The control task.
pub struct BroadcastHub {
    subscribers: HashMap<u64, Subscriber>,
    inbox: mpsc::Receiver<Command>,
    evicted: Arc<AtomicU64>,
}

impl BroadcastHub {
    /// Start the control task; it runs until `cancel` fires or every handle
    /// is dropped.
    pub fn spawn(config: &HubConfig, cancel: CancellationToken) -> (HubHandle, JoinHandle<()>) {
        let (tx, inbox) = mpsc::channel(config.inbox_capacity.max(1));
        let evicted = Arc::new(AtomicU64::new(0));

        let handle = HubHandle {
            tx,
            queue_capacity: config.queue_capacity.max(1),
            next_id: Arc::new(AtomicU64::new(1)),
            dropped: Arc::new(AtomicU64::new(0)),
            evicted: Arc::clone(&evicted),
        };

        let hub = Self {
            subscribers: HashMap::new(),
            inbox,
            evicted,
        };
        let join = tokio::spawn(hub.run(cancel));

        (handle, join)
    }

    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let command = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = self.inbox.recv() => command,
            };

            match command {
                Some(command) => self.apply(command),
                None => break,
            }
        }

        debug!(subscribers = self.subscribers.len(), "Broadcast hub stopped");
        // Dropping the subscriber map closes every outbound queue.
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register { id, filter, queue } => {
                info!(subscriber = id, filter = ?filter.categories(), "Subscriber registered");
                self.subscribers.insert(id, Subscriber { filter, queue });
            }
            Command::Unregister(id) => {
                if self.subscribers.remove(&id).is_some() {
                    info!(subscriber = id, "Subscriber unregistered");
                }
            }
            Command::Broadcast { category, line } => self.broadcast(&category, &line),
            Command::Count(reply) => {
                let _ = reply.send(self.subscribers.len());
            }
        }
    }

    fn broadcast(&mut self, category: &str, line: &Arc<str>) {
        let evicted = &self.evicted;
        self.subscribers.retain(|id, subscriber| {
            if !subscriber.filter.accepts(category) {
                return true;
            }
            match subscriber.queue.try_send(Arc::clone(line)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = *id, event = category, "Evicting unresponsive subscriber");
                    evicted.fetch_add(1, Ordering::Relaxed);
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = *id, "Subscriber queue closed");
                    false
                }
            }
        });
    }
}

/// Cloneable handle for producers and for registering subscribers.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Command>,
    queue_capacity: usize,
    next_id: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    evicted: Arc<AtomicU64>,
}

impl HubHandle {
    /// Register a subscriber with an initial filter.
    pub async fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription, HubError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, receiver) = mpsc::channel(self.queue_capacity);

        self.tx
            .send(Command::Register {
                id,
                filter: filter.clone(),
                queue,
            })
            .await
            .map_err(|_| HubError::Closed)?;

        Ok(Subscription {
            id,
            filter,
            receiver,
            control: self.tx.clone(),
        })
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub async fn unsubscribe(&self, id: u64) -> Result<(), HubError> {
        self.tx
            .send(Command::Unregister(id))
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Queue an event for broadcast, waiting for inbox space.
    pub async fn publish(&self, event: &Event) -> Result<(), HubError> {
        let command = Self::broadcast_command(event)?;
        self.tx.send(command).await.map_err(|_| HubError::Closed)
    }

    /// Queue an event for broadcast without waiting.
    ///
    /// Returns `Ok(false)` when the inbox is full and the event was dropped.
    pub fn try_publish(&self, event: &Event) -> Result<bool, HubError> {
        let command = Self::broadcast_command(event)?;
        match self.tx.try_send(command) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => Err(HubError::Closed),
        }
    }

    /// Number of live subscribers, as seen by the control task.
    pub async fn subscriber_count(&self) -> Result<usize, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Count(reply))
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Events dropped because the inbox was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Subscribers evicted for not keeping up.
    pub fn evicted_subscribers(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn broadcast_command(event: &Event) -> Result<Command, HubError> {
        let line = event.to_line().map_err(|e| HubError::Encode(e.to_string()))?;
        Ok(Command::Broadcast {
            category: event.category.clone(),
            line: Arc::from(line),
        })
    }
}

/// One registered subscriber.
///
/// Dropping it unregisters the subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    filter: SubscriptionFilter,
    receiver: mpsc::Receiver<Arc<str>>,
    control: mpsc::Sender<Command>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The live filter; replacing it takes effect on the next broadcast.
    pub fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }

    /// Next serialized event line, or `None` once the hub closed the queue
    /// (eviction or shutdown).
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // If the inbox is full the control task still drops us on the next
        // broadcast, when the closed queue is noticed.
        let _ = self.control.try_send(Command::Unregister(self.id));
    }
}
