//! passage — thin D-Bus admin client for passaged.
//!
//! Frame capture and face detection happen at the terminals; this tool only
//! drives the administrative surface (status, users, audit log, index
//! maintenance).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "passage", about = "Passage access-control admin CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// List registered users
    Users,
    /// Show recent audit log entries
    Logs {
        /// Maximum number of entries
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Remove a registered user
    Remove {
        /// User id to remove
        id: i64,
    },
    /// Discard liveness history for a camera stream
    ResetSession {
        /// Stream id (e.g., "door-1")
        stream: String,
    },
    /// Clear the identity index and user registry
    ResetIndex,
    /// Rebuild the identity index from stored embeddings (drops orphans)
    RebuildIndex,
}

#[zbus::proxy(
    interface = "org.passage.Access1",
    default_service = "org.passage.Access1",
    default_path = "/org/passage/Access1"
)]
trait Passage {
    async fn status(&self) -> zbus::Result<String>;
    async fn list_users(&self) -> zbus::Result<String>;
    async fn recent_logs(&self, limit: u32) -> zbus::Result<String>;
    async fn remove_user(&self, user_id: i64) -> zbus::Result<bool>;
    async fn reset_session(&self, stream_id: &str) -> zbus::Result<bool>;
    async fn reset_index(&self) -> zbus::Result<()>;
    async fn rebuild_index(&self) -> zbus::Result<u32>;
}

async fn connect() -> Result<zbus::Connection> {
    let conn = if std::env::var("PASSAGE_SESSION_BUS").is_ok() {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    };
    conn.context("connecting to D-Bus — is passaged running?")
}

/// Re-serialize a JSON reply for readable terminal output.
fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("parsing daemon reply")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let conn = connect().await?;
    let proxy = PassageProxy::new(&conn).await?;

    match cli.command {
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
        Commands::Users => {
            print_json(&proxy.list_users().await?)?;
        }
        Commands::Logs { limit } => {
            print_json(&proxy.recent_logs(limit).await?)?;
        }
        Commands::Remove { id } => {
            if proxy.remove_user(id).await? {
                println!("user {id} removed");
            } else {
                println!("user {id} not found");
            }
        }
        Commands::ResetSession { stream } => {
            if proxy.reset_session(&stream).await? {
                println!("session for stream '{stream}' reset");
            } else {
                println!("no active session for stream '{stream}'");
            }
        }
        Commands::ResetIndex => {
            proxy.reset_index().await?;
            println!("identity index and user registry cleared");
        }
        Commands::RebuildIndex => {
            let count = proxy.rebuild_index().await?;
            println!("index rebuilt from {count} stored embeddings");
        }
    }

    Ok(())
}
