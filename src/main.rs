use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use session_keeper::{SessionRecord, SessionService};

#[derive(Parser)]
#[command(name = "session-keeper")]
#[command(version, about = "Issue, check and expire session tokens", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.session-keeper/config.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new session
    New {
        /// Caller identity the session belongs to
        #[arg(long)]
        key: String,

        /// Client address recorded with the session
        #[arg(long)]
        ip: String,

        /// Lifetime in seconds (0 or omitted uses the configured default)
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Show a live session
    Check {
        /// Session token
        token: String,
    },
    /// Delete a session (succeeds even if it is already gone)
    Delete {
        /// Session token
        token: String,
    },
    /// List every recorded session
    List,
    /// Keep the expiry schedule running until interrupted
    Watch,
}

/// A record as printed, with the expiry also shown in the display zone
#[derive(Serialize)]
struct SessionView {
    #[serde(flatten)]
    record: SessionRecord,
    expires_at_local: DateTime<FixedOffset>,
}

impl SessionView {
    fn new(service: &SessionService, record: SessionRecord) -> Self {
        let expires_at_local = service.display_expires_at(&record);
        Self {
            record,
            expires_at_local,
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive("info".parse().expect("valid log directive"))
    };

    // stdout carries JSON output
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{}", text);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let service = SessionService::builder()
        .from_config(cli.config.as_deref())
        .context("failed to load configuration")?
        .build()
        .await
        .context("failed to start session service")?;

    match cli.command {
        Commands::New { key, ip, ttl } => {
            let record = service
                .new_session(&key, &ip, ttl)
                .await
                .context("failed to create session")?;
            print_json(&SessionView::new(&service, record))?;
        }
        Commands::Check { token } => {
            let record = service
                .check_status(&token)
                .await
                .context("session check failed")?;
            print_json(&SessionView::new(&service, record))?;
        }
        Commands::Delete { token } => {
            service
                .delete_session(&token)
                .await
                .context("failed to delete session")?;
        }
        Commands::List => {
            let records: Vec<SessionRecord> = service
                .list_active_sessions()
                .try_collect()
                .await
                .context("failed to list sessions")?;
            let views: Vec<SessionView> = records
                .into_iter()
                .map(|record| SessionView::new(&service, record))
                .collect();
            print_json(&views)?;
        }
        Commands::Watch => {
            info!(
                mode = %service.expiry_mode(),
                pending = service.pending_expiries(),
                "watching session expiries, press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            info!(pending = service.pending_expiries(), "stopping");
        }
    }

    service.close().await.context("failed to close storage")?;
    Ok(())
}
