//! ZeeChat command-line client

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeechat_core::{
    ApiClient, ChatSession, ClientConfig, ConnectionManager, ConnectionState, ConversationView,
    Delivery, OutgoingMessage,
};

/// ZeeChat CLI
#[derive(Parser)]
#[command(name = "zeechat")]
#[command(about = "Terminal client for ZeeChat conversations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "zeechat.json")]
    config: PathBuf,

    /// Session token
    #[arg(long, env = "ZEECHAT_TOKEN")]
    token: String,

    /// Signed-in user id
    #[arg(long, env = "ZEECHAT_USER")]
    user: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the conversation with a peer
    History { peer: String },

    /// Send a text message
    Send { peer: String, text: String },

    /// Follow a conversation live until Ctrl-C
    Watch { peer: String },

    /// Clear the conversation with a peer
    Clear { peer: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "zeechat_core=info,zeechat=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::load(&cli.config)?;
    tracing::debug!("Using server {}", config.http_url());

    match cli.command {
        Commands::History { peer } => {
            let session = offline_session(&config, &cli.user, &cli.token)?;
            session.select_peer(&peer).await?;
            render(&session.view());
        }
        Commands::Send { peer, text } => {
            let session = offline_session(&config, &cli.user, &cli.token)?;
            let message = session
                .composer()
                .send(&peer, OutgoingMessage::text(&text))
                .await?;
            println!("Sent {} at {}", message.id, message.created_at);
        }
        Commands::Watch { peer } => {
            watch(&config, &cli.user, &cli.token, &peer).await?;
        }
        Commands::Clear { peer } => {
            let session = ChatSession::connect(&config, &cli.user, &cli.token).await?;
            session.composer().clear_conversation(&peer).await?;
            session.transport().disconnect();
            println!("Conversation with {} cleared", peer);
        }
    }

    Ok(())
}

/// A session that only talks REST; socket emits are dropped.
fn offline_session(
    config: &ClientConfig,
    user: &str,
    token: &str,
) -> anyhow::Result<ChatSession<ApiClient, ConnectionManager>> {
    let api = ApiClient::new(config)?;
    api.set_token(token);
    let connection = ConnectionManager::new(config.clone());
    Ok(ChatSession::new(
        user,
        &config.sync,
        Arc::new(api),
        Arc::new(connection),
    ))
}

async fn watch(config: &ClientConfig, user: &str, token: &str, peer: &str) -> anyhow::Result<()> {
    let session = ChatSession::connect(config, user, token).await?;
    let mut changes = session.subscribe();
    let mut link = session.transport().subscribe_state();

    if let Err(e) = session.select_peer(peer).await {
        eprintln!("Could not load history: {}", e.user_message());
    }
    render(&session.view());

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                for notice in session.store().update(|s| s.take_notices()) {
                    eprintln!("! {}", notice.text);
                }
                // Draining notices is itself a store change.
                changes.borrow_and_update();
                render(&session.view());
            }
            _ = link.wait_for(|s| *s == ConnectionState::Disconnected) => {
                tracing::warn!("Connection lost");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    session.detach();
    session.transport().disconnect();
    Ok(())
}

fn render(view: &ConversationView) {
    let title = view
        .peer_name
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| view.peer_id.clone())
        .unwrap_or_default();
    println!("=== {} ({}) ===", title, view.status_text);

    for group in &view.groups {
        println!("--- {} ---", group.label);
        for msg in &group.messages {
            let who = if msg.is_mine { "me" } else { "them" };
            let status = match &msg.delivery {
                Delivery::Pending => " [sending]".to_string(),
                Delivery::Failed { reason } => format!(" [failed: {}]", reason),
                Delivery::Sent => String::new(),
            };
            let reactions: Vec<String> = msg
                .reactions
                .iter()
                .map(|c| format!("{}{}", c.emoji, c.count))
                .collect();

            println!("[{}] {}: {}{}", msg.time, who, msg.body, status);
            if !reactions.is_empty() {
                println!("        {}", reactions.join(" "));
            }
        }
    }
}
