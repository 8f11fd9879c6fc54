use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use parley_core::ids::UserId;
use parley_server::{ParleyServer, ServerConfig, Stores};
use parley_store::{Database, SqliteChatStore};

/// Parley chat delivery server.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "Real-time chat delivery server")]
struct Cli {
    /// JSON config file, layered over defaults and under `PARLEY_*` env vars.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the `SQLite` database (overrides config).
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server until ctrl-c.
    Serve {
        /// Host to bind (overrides config).
        #[arg(long)]
        host: Option<String>,

        /// Port to bind, 0 for auto-assign (overrides config).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Mint a bearer token for a user and print it.
    IssueToken {
        #[arg(long)]
        user: String,

        /// Token lifetime in hours; never expires when omitted.
        #[arg(long)]
        ttl_hours: Option<i64>,
    },
    /// Invalidate a previously issued token.
    RevokeToken {
        #[arg(long)]
        token: String,
    },
}

impl Cli {
    fn load_config(&self) -> Result<ServerConfig> {
        let mut config = ServerConfig::load(self.config.as_deref()).context("Failed to load config")?;
        if let Some(path) = &self.database {
            config.database_path.clone_from(path);
        }
        if let Command::Serve { host, port } = &self.command {
            if let Some(host) = host {
                config.host.clone_from(host);
            }
            if let Some(port) = port {
                config.port = *port;
            }
        }
        Ok(config)
    }
}

fn open_store(path: &Path) -> Result<SqliteChatStore> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let db = Database::open(path).with_context(|| format!("Failed to open database: {}", path.display()))?;
    Ok(SqliteChatStore::new(db))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    let telemetry = config.log.to_config().context("Invalid log settings")?;
    parley_telemetry::init_telemetry(telemetry).context("Failed to initialize logging")?;

    match cli.command {
        Command::Serve { .. } => serve(config).await,
        Command::IssueToken { user, ttl_hours } => {
            let store = open_store(&config.database_path)?;
            let ttl = ttl_hours.map(chrono::Duration::hours);
            let token = store
                .issue_token(UserId::from_raw(user), ttl)
                .await
                .context("Failed to issue token")?;
            println!("{token}");
            Ok(())
        }
        Command::RevokeToken { token } => {
            let store = open_store(&config.database_path)?;
            if store.revoke_token(token).await.context("Failed to revoke token")? {
                println!("revoked");
            } else {
                anyhow::bail!("token not found");
            }
            Ok(())
        }
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    let store = open_store(&config.database_path)?;
    tracing::info!(path = %config.database_path.display(), "database opened");

    let server = ParleyServer::new(config, Stores::sqlite(store));
    let handle = server.listen().await.context("Failed to bind server")?;
    tracing::info!("parley listening on http://{}", handle.addr);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    handle.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
