//! gh-pulse - webhook event relay and assertion engine
//!
//! This library provides the core functionality for gh-pulse: a webhook
//! collector that fans events out to WebSocket subscribers, and a resilient
//! streaming client that prints those events as JSON Lines and can stop on
//! the first event matching an assertion.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `event`: The event envelope and subscription control message
//! - `assertion`: Path/operator/value rules and their evaluation
//! - `source`: Reconnecting upstream client over WebSocket or SSE
//! - `hub`: In-process broadcast hub with per-subscriber filters
//! - `capture`: Bounded buffer for capture mode
//! - `session`: Stream/capture orchestration and exit status
//! - `server`: Webhook endpoint and WebSocket fan-out endpoint
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use gh_pulse::assertion::AssertionSet;
//! use gh_pulse::Event;
//!
//! let rules = AssertionSet::parse(&["payload.action=closed"], &[] as &[&str]).unwrap();
//! let event = Event::new("pull_request", "d1", serde_json::json!({"action": "closed"}));
//! assert!(rules.evaluate(&event.to_value().unwrap()).is_some());
//! ```

pub mod assertion;
pub mod capture;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod event;
pub mod hub;
pub mod logging;
pub mod server;
pub mod session;
pub mod source;

// Re-export commonly used types
pub use config::Config;
pub use error::{Outcome, PulseError, Result};
pub use event::Event;
