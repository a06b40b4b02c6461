//! CLI entry point for kai-relay

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use kai_relay_core::config::{Config, ConfigLoader};
use kai_relay_core::logging::init_logging;
use kai_relay_exchange::ChatRequest;
use kai_relay_server::{run_server, AppState};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod client;

use client::ApiClient;

#[derive(Parser)]
#[command(name = "kai-relay")]
#[command(about = "Chat relay with per-session history and streaming replies")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
    /// Run the HTTP relay server
    Serve {
        /// Address to bind (overrides server.host)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Send a message to a running server
    Chat {
        /// Message to send
        #[arg(short, long)]
        message: String,
        /// Session key for conversation continuity
        #[arg(short, long)]
        session: Option<String>,
        /// Start a fresh session with a generated key
        #[arg(long, conflicts_with = "session")]
        new: bool,
        /// Model to use
        #[arg(long)]
        model: Option<String>,
        /// Print the reply as it streams in
        #[arg(long)]
        stream: bool,
        /// Server URL (defaults to the configured host and port)
        #[arg(long)]
        url: Option<String>,
    },
    /// Inspect or clear session history
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },
}

#[derive(Subcommand)]
enum HistoryCommands {
    /// Print the turns of a session
    Show {
        #[arg(short, long)]
        session: String,
        #[arg(long)]
        url: Option<String>,
    },
    /// Delete the turns of a session
    Clear {
        #[arg(short, long)]
        session: String,
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_loader = if let Some(dir) = cli.config_dir {
        ConfigLoader::with_dir(dir)
    } else {
        ConfigLoader::new()
    };

    match cli.command {
        Commands::Init { force } => run_init(&config_loader, force),
        Commands::Serve { host, port } => run_serve(&config_loader, host, port).await,
        Commands::Chat {
            message,
            session,
            new,
            model,
            stream,
            url,
        } => {
            init_client_logging();
            let session = if new {
                Some(format!("cli-{}", uuid::Uuid::new_v4()))
            } else {
                session
            };
            run_chat(&config_loader, message, session, model, stream, url).await
        }
        Commands::History { command } => {
            init_client_logging();
            match command {
                HistoryCommands::Show { session, url } => {
                    run_history_show(&config_loader, &session, url).await
                }
                HistoryCommands::Clear { session, url } => {
                    run_history_clear(&config_loader, &session, url).await
                }
            }
        }
    }
}

/// Client commands log to stderr so replies stay clean on stdout
fn init_client_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_init(loader: &ConfigLoader, force: bool) -> Result<()> {
    let path = loader.config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    loader.save(&Config::default())?;
    println!(
        "{} {}",
        style("Configuration written to").green(),
        path.display()
    );
    println!(
        "Set {} or edit upstream.api_key, then run {}",
        style("OPENAI_API_KEY").cyan(),
        style("kai-relay serve").cyan()
    );
    Ok(())
}

async fn run_serve(loader: &ConfigLoader, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = loader.load()?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let _log_guard = init_logging(&config.logging);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?;

    println!("{}", style("Starting kai-relay...").bold().cyan());
    println!("Upstream: {}", config.upstream.api_base);
    println!("Default model: {}", config.upstream.model);
    println!("Session backend: {:?}", config.session.backend);

    let state = AppState::from_config(&config);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = run_server(state, addr, shutdown_rx).await {
            error!("Server error: {}", e);
        }
    });

    println!(
        "{}",
        style(format!("Listening on http://{}. Press Ctrl+C to stop.", addr)).green()
    );

    tokio::signal::ctrl_c().await?;
    println!("\n{}", style("Shutting down...").yellow());
    info!("Shutdown requested");

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    println!("{}", style("Server stopped.").green());
    Ok(())
}

/// Server URL from the flag or the configured bind address
fn server_url(loader: &ConfigLoader, url: Option<String>) -> Result<String> {
    if let Some(url) = url {
        return Ok(url);
    }
    let config = loader.load()?;
    let host = match config.server.host.as_str() {
        "0.0.0.0" => "127.0.0.1",
        host => host,
    };
    Ok(format!("http://{}:{}", host, config.server.port))
}

async fn run_chat(
    loader: &ConfigLoader,
    message: String,
    session: Option<String>,
    model: Option<String>,
    stream: bool,
    url: Option<String>,
) -> Result<()> {
    let client = ApiClient::new(server_url(loader, url)?);
    let request = ChatRequest {
        model,
        session_id: session.clone(),
        stream,
        ..ChatRequest::user(message)
    };

    if stream {
        let mut stdout = std::io::stdout();
        client
            .chat_stream(&request, |fragment| {
                let _ = write!(stdout, "{}", fragment);
                let _ = stdout.flush();
            })
            .await?;
        println!();
        if let Some(session) = session {
            println!("{}", style(format!("session: {}", session)).dim());
        }
    } else {
        let reply = client.chat(&request).await?;
        println!("{}", reply.reply);
        println!(
            "{}",
            style(format!("session: {} | model: {}", reply.session_id, reply.model)).dim()
        );
    }
    Ok(())
}

async fn run_history_show(loader: &ConfigLoader, session: &str, url: Option<String>) -> Result<()> {
    let client = ApiClient::new(server_url(loader, url)?);
    let history = client.history(session).await?;

    if history.turns.is_empty() {
        println!("{}", style(format!("Session '{}' has no history", session)).dim());
        return Ok(());
    }

    println!("{}", style(format!("Session {}", history.session_id)).bold().cyan());
    for turn in &history.turns {
        let role = match turn.role {
            kai_relay_core::Role::User => style(turn.role.as_str()).green().bold(),
            kai_relay_core::Role::Assistant => style(turn.role.as_str()).cyan().bold(),
            kai_relay_core::Role::System => style(turn.role.as_str()).yellow().bold(),
        };
        println!(
            "{} {} {}",
            style(turn.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
            role,
            turn.content
        );
    }
    Ok(())
}

async fn run_history_clear(loader: &ConfigLoader, session: &str, url: Option<String>) -> Result<()> {
    let client = ApiClient::new(server_url(loader, url)?);
    client.clear_history(session).await?;
    println!("{} {}", style("Cleared session").green(), session);
    Ok(())
}
