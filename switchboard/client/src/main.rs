//! Switchboard Client - Terminal Chat Session
//!
//! Joins the chat backend as a requester (anonymous guest) or a responder
//! (support agent), prints session updates and sends each stdin line as a
//! message.
//!
//! # Usage
//!
//! ```bash
//! # Anonymous guest against a local backend
//! switchboard-client --role requester
//!
//! # Support agent with credentials
//! switchboard-client --role responder --username agent1 --password secret
//!
//! # Custom backend
//! switchboard-client --base-url https://chat.example.com \
//!     --ws-url wss://chat.example.com/chat/websocket
//!
//! # Verbose logging
//! RUST_LOG=debug switchboard-client
//! ```
//!
//! # Commands
//!
//! - `/restart`: Re-resolve identity and reconnect
//! - `/status`: Print the current session status
//! - `/quit` or Ctrl-C: Close the session and exit

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use switchboard_core::config::{load_config_from_path, ConfigOverrides};
use switchboard_core::{
    ChatError, HttpServices, Role, Services, SessionHandle, SessionUpdate,
    StompWebSocketTransport,
};

/// Switchboard Client - Terminal surface for a realtime support chat
#[derive(Parser, Debug)]
#[command(name = "switchboard-client")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Participant role (requester or responder)
    #[arg(short = 'r', long, env = "SWITCHBOARD_ROLE", default_value = "requester")]
    role: Role,

    /// Configuration file path
    #[arg(short = 'c', long, env = "SWITCHBOARD_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// REST base URL of the chat backend
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// WebSocket endpoint of the chat backend
    #[arg(long, value_name = "URL")]
    ws_url: Option<String>,

    /// Responder username
    #[arg(short = 'u', long)]
    username: Option<String>,

    /// Responder password
    #[arg(short = 'p', long, env = "SWITCHBOARD_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

/// Initialize logging with the specified level
///
/// Logs go to stderr so they do not interleave with the conversation.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "switchboard_client={level},switchboard_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn overrides(args: &Args) -> ConfigOverrides {
    ConfigOverrides {
        base_url: args.base_url.clone(),
        ws_url: args.ws_url.clone(),
        username: args.username.clone(),
        password: args.password.clone(),
    }
}

/// Updates after which the local identity may have changed (restart)
fn may_change_identity(update: &SessionUpdate) -> bool {
    matches!(
        update,
        SessionUpdate::HistoryReplaced(_) | SessionUpdate::PeerChanged(_)
    )
}

/// A failed send ends the client only when the session itself is gone
fn send_failure_is_fatal(err: &ChatError) -> bool {
    !err.is_recoverable()
}

fn sender_label<'a>(sender: &'a str, local_id: &str) -> &'a str {
    if sender == local_id {
        "you"
    } else {
        sender
    }
}

fn print_update(update: &SessionUpdate, local_id: &str) {
    match update {
        SessionUpdate::MessageAppended(message) => {
            println!("[{}] {}", sender_label(&message.sender, local_id), message.content);
        }
        SessionUpdate::HistoryReplaced(messages) => {
            if !messages.is_empty() {
                println!("--- {} messages ---", messages.len());
                for message in messages {
                    println!("[{}] {}", sender_label(&message.sender, local_id), message.content);
                }
                println!("---");
            }
        }
        SessionUpdate::PeerChanged(Some(peer)) => println!("* Now chatting with {peer}"),
        SessionUpdate::PeerChanged(None) => println!("* Counterpart left"),
        SessionUpdate::StatusChanged { text, .. } => println!("* {text}"),
        SessionUpdate::Error(text) => println!("! {text}"),
        SessionUpdate::Closed => println!("* Session closed"),
    }
}

async fn handle_line(session: &SessionHandle, line: &str) -> Result<bool> {
    match line.trim() {
        "/quit" => return Ok(false),
        "/restart" => match session.restart().await {
            Ok(()) => println!("* Restarting session"),
            Err(e) => println!("! Restart failed: {e}"),
        },
        "/status" => {
            let snapshot = session.snapshot().await?;
            println!(
                "* {} as {} ({}), peer: {}, messages: {}",
                snapshot.status_text,
                snapshot.local_id,
                snapshot.role,
                snapshot.peer_id.as_deref().unwrap_or("none"),
                snapshot.messages.len()
            );
        }
        _ => match session.send(line).await {
            Ok(()) => {}
            Err(e) if !send_failure_is_fatal(&e) => println!("! {e}"),
            Err(e) => return Err(e).context("Send failed"),
        },
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Switchboard client starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config_from_path(args.config.clone())
        .context("Failed to load configuration")?;
    overrides(&args).apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        base_url = %config.base_url,
        ws_url = %config.ws_url,
        source = ?config.source(),
        role = %args.role,
        "Configuration loaded"
    );

    if args.role == Role::Responder && config.credentials().is_none() {
        anyhow::bail!("A responder needs --username and --password");
    }

    let backend = Arc::new(
        HttpServices::new(&config.base_url, config.credentials())
            .context("Failed to create backend client")?,
    );
    let transport = StompWebSocketTransport::new(config.websocket_settings());

    let session = SessionHandle::start(
        args.role,
        Services::from_backend(backend),
        transport,
        config.session_config(),
    )
    .await
    .context("Failed to start session")?;

    let mut updates = session.subscribe();
    let snapshot = session.snapshot().await?;
    println!("* Joined as {} ({})", snapshot.local_id, snapshot.role);
    let mut local_id = snapshot.local_id;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    if may_change_identity(&update) {
                        let current = session.snapshot().await?.local_id;
                        if current != local_id {
                            println!("* Now known as {current}");
                            local_id = current;
                        }
                    }
                    print_update(&update, &local_id);
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed session updates"),
                Err(RecvError::Closed) => break,
            },

            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if !handle_line(&session, &line).await? {
                        break;
                    }
                }
                None => break,
            },

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, closing session");
                break;
            }
        }
    }

    session.close().await?;
    info!("Switchboard client stopped");
    Ok(())
}
