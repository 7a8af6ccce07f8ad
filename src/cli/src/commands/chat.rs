//! Interactive chat command.
//!
//! Lines typed on stdin are sent to the conversation. Slash commands:
//! `/typing` toggles the typing indicator, `/read <id>` marks a message read,
//! `/history <page>` loads older messages, `/quit` leaves.

use anyhow::{Context as _, Result};
use clap::Args;
use eventconnect_core::cache::{FileMessageCache, InMemoryMessageCache, MessageCache};
use eventconnect_core::events::SessionEvent;
use eventconnect_core::history::RestHistoryClient;
use eventconnect_core::message::{MessageStatus, MessageType};
use eventconnect_core::runtime::{ChatClient, ChatClientBuilder};
use eventconnect_core::transport::{Credentials, WebSocketTransport};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};

use super::Context;
use crate::output;

#[derive(Args)]
pub struct ChatArgs {
    /// Conversation to join
    pub conversation: String,

    /// User ID to connect as (defaults to the stored `user-id`)
    #[arg(short, long, env = "EVENTCONNECT_USER_ID")]
    pub user: Option<String>,

    /// History pages to load after joining
    #[arg(long, default_value = "1")]
    pub history_pages: u32,

    /// Message type for lines sent from stdin
    #[arg(long = "type", default_value = "text")]
    pub message_type: String,
}

/// A line typed by the user.
#[derive(Debug, PartialEq)]
enum Input {
    Send(String),
    ToggleTyping,
    Read(String),
    History(u32),
    Quit,
    Unknown(String),
    Empty,
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Send(line.to_string());
    };

    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("quit" | "exit"), _) => Input::Quit,
        (Some("typing"), _) => Input::ToggleTyping,
        (Some("read"), Some(id)) => Input::Read(id.to_string()),
        (Some("history"), Some(page)) => match page.parse() {
            Ok(page) => Input::History(page),
            Err(_) => Input::Unknown(line.to_string()),
        },
        _ => Input::Unknown(line.to_string()),
    }
}

pub async fn execute(args: ChatArgs, ctx: Context) -> Result<()> {
    let token = ctx.require_token()?.to_string();
    let user_id = args
        .user
        .clone()
        .or_else(|| ctx.user_id.clone())
        .context("No user id; pass --user or run `eventconnect config set user-id <id>`")?;
    let message_type: MessageType = args
        .message_type
        .parse()
        .map_err(|_| anyhow::anyhow!("Unknown message type '{}'", args.message_type))?;

    let me = user_id.clone();
    let client = spawn_client(&ctx, &token)?;
    let printer = tokio::spawn(render_events(client.subscribe(), me.clone()));

    client.connect(Credentials::new(token, user_id)).await?;
    client.join(args.conversation.clone()).await?;
    for page in 1..=args.history_pages {
        if let Err(e) = client.load_history(args.conversation.clone(), page).await {
            output::print_warning(&format!("History page {} unavailable: {}", page, e));
            break;
        }
    }
    for message in client.messages(args.conversation.clone()).await? {
        output::print_message(&message, &me);
    }
    output::print_info(&format!(
        "Chatting in {}. /typing, /read <id>, /history <page>, /quit",
        args.conversation
    ));

    let result = read_loop(&client, &args.conversation, message_type).await;

    client.shutdown().await?;
    printer.abort();
    result
}

fn spawn_client(ctx: &Context, token: &str) -> Result<ChatClient> {
    let server = &ctx.config.server;
    let history = RestHistoryClient::new(&server.api_url, server.request_timeout)?
        .with_bearer_token(token);

    let capacity = ctx.config.cache.max_messages_per_conversation;
    let cache: Arc<dyn MessageCache> = match ctx
        .config
        .cache
        .directory
        .clone()
        .or_else(|| dirs::cache_dir().map(|d| d.join("eventconnect")))
    {
        Some(directory) => Arc::new(FileMessageCache::new(directory, capacity)),
        None => Arc::new(InMemoryMessageCache::new(capacity)),
    };

    let ws_url = server.ws_url.clone();
    let connect_timeout = server.connect_timeout;
    Ok(ChatClientBuilder::new(ctx.config.clone())
        .with_history(Arc::new(history))
        .with_cache(cache)
        .spawn(move |signals| WebSocketTransport::new(ws_url, connect_timeout, signals)))
}

async fn read_loop(client: &ChatClient, conversation: &str, message_type: MessageType) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut typing = false;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match parse_input(&line) {
            Input::Send(text) => {
                if typing {
                    typing = false;
                    client.set_typing(conversation, false).await?;
                }
                client.send_message(conversation, text, message_type).await?;
            }
            Input::ToggleTyping => {
                typing = !typing;
                client.set_typing(conversation, typing).await?;
            }
            Input::Read(id) => client.mark_read(id).await?,
            Input::History(page) => match client.load_history(conversation, page).await {
                Ok(inserted) => output::print_info(&format!("Loaded {} older messages", inserted)),
                Err(e) => output::print_warning(&format!("History page {} unavailable: {}", page, e)),
            },
            Input::Quit => break,
            Input::Unknown(text) => output::print_warning(&format!("Unknown command: {}", text)),
            Input::Empty => {}
        }
    }

    if typing {
        client.set_typing(conversation, false).await?;
    }
    Ok(())
}

async fn render_events(mut events: broadcast::Receiver<SessionEvent>, me: String) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                output::print_warning(&format!("Skipped {} events", skipped));
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            SessionEvent::ConnectionStateChanged { current, .. } => output::print_connection(current),
            SessionEvent::MessageAdded { message } if message.sender_id != me => {
                output::print_message(&message, &me)
            }
            SessionEvent::MessageAdded { .. } => {}
            SessionEvent::MessageUpdated { message, .. } => {
                if message.sender_id == me || message.status == MessageStatus::Failed {
                    output::print_status_change(&message);
                }
            }
            SessionEvent::TypingChanged {
                conversation_id,
                users,
            } => output::print_typing(&conversation_id, &users),
            SessionEvent::PresenceChanged { user_id, online } => {
                output::print_info(&format!(
                    "{} is {}",
                    user_id,
                    if online { "online" } else { "offline" }
                ));
            }
            SessionEvent::ReconnectScheduled { attempt, delay_ms } => output::print_info(&format!(
                "Reconnecting in {:.1}s (attempt {})",
                delay_ms as f64 / 1000.0,
                attempt
            )),
            SessionEvent::AuthFailed { reason } => {
                output::print_error(&format!("Authentication rejected: {}", reason))
            }
            SessionEvent::ConnectFailed { reason } => output::print_error(&format!(
                "Could not connect ({:?}); run /quit and try again",
                reason
            )),
            SessionEvent::EnvelopeExpired { event_name, .. } => {
                output::print_warning(&format!("Dropped stale {} while offline", event_name))
            }
            SessionEvent::HistoryLoaded { .. } => {}
        }
    }
}
