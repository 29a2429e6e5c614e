//! Event envelope and subscription control message
//!
//! The [`Event`] envelope is both the unit flowing through the relay and the
//! output line format: one compact JSON object per line on stdout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only `type` tag an event envelope carries.
pub const EVENT_KIND: &str = "event";

/// The `type` tag of a subscription control message.
pub const SUBSCRIBE_KIND: &str = "subscribe";

/// One normalized webhook notification.
///
/// Serializes to
/// `{"type":"event","event":"push","delivery_id":"...","truncated":false,"payload":{...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Envelope tag, always `"event"`
    #[serde(rename = "type")]
    pub kind: String,

    /// Upstream event type, e.g. `push` or `pull_request`
    #[serde(rename = "event")]
    pub category: String,

    /// Opaque upstream delivery identifier (correlation only)
    #[serde(rename = "delivery_id", default)]
    pub delivery_id: String,

    /// Set when the collector cut oversized arrays out of the payload
    #[serde(default)]
    pub truncated: bool,

    /// Business content
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Create an envelope for a freshly received delivery.
    ///
    /// # Examples
    ///
    /// ```
    /// use gh_pulse::event::Event;
    /// use serde_json::json;
    ///
    /// let event = Event::new("push", "d-1", json!({"ref": "refs/heads/main"}));
    /// assert_eq!(event.kind, "event");
    /// assert!(!event.truncated);
    /// ```
    pub fn new(category: impl Into<String>, delivery_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: EVENT_KIND.to_string(),
            category: category.into(),
            delivery_id: delivery_id.into(),
            truncated: false,
            payload,
        }
    }

    /// Mark the payload as truncated.
    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    /// Decode an envelope from one upstream message.
    ///
    /// Rejects objects whose `type` is not `"event"` or that lack an `event`
    /// category.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let event: Event = serde_json::from_str(raw)?;
        if event.kind != EVENT_KIND {
            return Err(serde::de::Error::custom(format!(
                "unexpected message type {:?}",
                event.kind
            )));
        }
        if event.category.is_empty() {
            return Err(serde::de::Error::custom("missing event category"));
        }
        Ok(event)
    }

    /// Serialize as one compact JSON line (without the trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The envelope as a JSON value tree, used for assertion matching.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Sent by a downstream subscriber to choose categories.
///
/// An empty or omitted `events` list subscribes to everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeMessage {
    /// Always `"subscribe"`
    #[serde(rename = "type")]
    pub kind: String,

    /// Categories to receive
    #[serde(default)]
    pub events: Vec<String>,
}

impl SubscribeMessage {
    /// Build a subscription request for the given categories.
    pub fn new(events: Vec<String>) -> Self {
        Self {
            kind: SUBSCRIBE_KIND.to_string(),
            events,
        }
    }

    /// Parse a control message, returning `None` for anything that is not a
    /// well-formed subscription request.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str::<SubscribeMessage>(raw)
            .ok()
            .filter(|msg| msg.kind == SUBSCRIBE_KIND)
    }
}
