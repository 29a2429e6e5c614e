//! Command-line interface definition for gh-pulse
//!
//! This module defines the CLI structure using clap's derive API: `serve`
//! runs the webhook relay, `stream` and `capture` consume one.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// gh-pulse - relay webhook deliveries as a JSON Lines stream
///
/// Run `serve` behind a public webhook URL, then `stream` from anywhere to
/// receive events and stop on the first one that matches an assertion.
#[derive(Parser, Debug, Clone)]
#[command(name = "gh-pulse")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "GH_PULSE_CONFIG")]
    pub config: Option<String>,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit diagnostics as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Receive webhooks and fan them out to WebSocket subscribers
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print events as they arrive, one JSON object per line
    Stream {
        #[command(flatten)]
        session: SessionArgs,

        /// Also print upstream messages that are not valid events, verbatim
        #[arg(long)]
        raw: bool,
    },

    /// Buffer events and print them all when an exit condition is reached
    Capture {
        #[command(flatten)]
        session: SessionArgs,
    },
}

/// Upstream wire protocol.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// WebSocket (`ws://`, `wss://`)
    Ws,
    /// Server-Sent Events (`http://`, `https://`)
    Sse,
}

impl TransportKind {
    /// Pick the protocol matching a URL scheme.
    pub fn for_url(url: &str) -> Option<Self> {
        let scheme = url.split_once("://")?.0.to_ascii_lowercase();
        match scheme.as_str() {
            "ws" | "wss" => Some(Self::Ws),
            "http" | "https" => Some(Self::Sse),
            _ => None,
        }
    }
}

/// Flags shared by `stream` and `capture`.
#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// Upstream URL (ws(s):// relay or http(s):// SSE channel)
    #[arg(short, long)]
    pub url: String,

    /// Wire protocol; inferred from the URL scheme when omitted
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Only receive these event categories (repeatable)
    #[arg(short, long = "event", value_name = "CATEGORY")]
    pub events: Vec<String>,

    /// Exit 0 when an event matches RULE (repeatable)
    #[arg(long = "success-on", value_name = "RULE")]
    pub success_on: Vec<String>,

    /// Exit 1 when an event matches RULE (repeatable)
    #[arg(long = "failure-on", value_name = "RULE")]
    pub failure_on: Vec<String>,

    /// Exit 124 after SECS seconds without a match (0 disables)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl SessionArgs {
    /// Explicit `--transport`, or the one implied by the URL.
    pub fn resolved_transport(&self) -> Option<TransportKind> {
        self.transport.or_else(|| TransportKind::for_url(&self.url))
    }
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
