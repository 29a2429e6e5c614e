//! gh-pulse - webhook relay and event stream CLI
//!
#![doc = "gh-pulse - webhook relay and event stream CLI"]
#![doc = "Main entry point for the gh-pulse application."]

use gh_pulse::cli::{Cli, Commands};
use gh_pulse::commands::{self, error_exit_code};
use gh_pulse::config::{Config, DEFAULT_CONFIG_PATH};
use gh_pulse::logging::{bootstrap_subscriber, init_logging};
use gh_pulse::session::SessionMode;

#[tokio::main]
async fn main() {
    // Parse command line arguments; clap exits with 2 on usage errors
    let cli = Cli::parse_args();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("gh-pulse: {:#}", e);
            error_exit_code(&e)
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
    // Logging is configured by the file being loaded; report load-time
    // warnings through a temporary stderr subscriber.
    let config = tracing::subscriber::with_default(bootstrap_subscriber(), || {
        Config::load(config_path, &cli)
    })?;

    // Validate configuration
    config.validate()?;

    init_logging(&config.logging)?;

    // Execute command
    match cli.command {
        Commands::Serve { .. } => {
            tracing::info!(port = config.server.port, "Starting webhook relay");
            commands::serve::run_serve(config).await
        }
        Commands::Stream { session, raw } => {
            commands::stream::run_session(config, SessionMode::Stream, session, raw).await
        }
        Commands::Capture { session } => {
            commands::stream::run_session(config, SessionMode::Capture, session, false).await
        }
    }
}
