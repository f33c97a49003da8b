use anyhow::{Context, Result};
use ankisyncd::users::SqliteUserManager;
use ankisyncd::{SyncApp, SyncConfig, router};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ankisyncd")]
#[command(about = "Personal sync server for spaced-repetition collections", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync server (default)
    Serve,
    /// Create a user account (prompts for a password)
    Adduser { username: String },
    /// Remove a user account
    Deluser { username: String },
    /// Set a new password for an existing user
    Passwd { username: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("failed to load server configuration")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Adduser { username } => {
            let users = SqliteUserManager::open(&config.auth_db_path)?;
            let password = prompt_password(&username)?;
            users.add_user(&username, &password)?;
            println!("user {username} added");
            Ok(())
        }
        Commands::Deluser { username } => {
            let users = SqliteUserManager::open(&config.auth_db_path)?;
            if users.del_user(&username)? {
                println!("user {username} removed");
            } else {
                println!("no such user: {username}");
            }
            Ok(())
        }
        Commands::Passwd { username } => {
            let users = SqliteUserManager::open(&config.auth_db_path)?;
            let password = prompt_password(&username)?;
            if users.set_password(&username, &password)? {
                println!("password updated for {username}");
            } else {
                println!("no such user: {username}");
            }
            Ok(())
        }
    }
}

async fn serve(config: SyncConfig) -> Result<()> {
    let app = Arc::new(SyncApp::from_config(&config).context("failed to build the sync app")?);

    let addr = config.address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(address = %addr, base_url = %config.base_url, "sync server started");

    axum::serve(listener, router(app.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Flush and close every open collection before exiting.
    app.shutdown();
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ankisyncd=info,tower_http=warn")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn prompt_password(username: &str) -> Result<String> {
    print!("password for {username}: ");
    std::io::stdout().flush()?;
    let mut password = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut password)
        .context("could not read password from stdin")?;
    let password = password.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        anyhow::bail!("password must not be empty");
    }
    Ok(password)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install Ctrl+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
