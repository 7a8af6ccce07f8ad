//! Message history command.

use anyhow::Result;
use clap::Args;
use eventconnect_core::history::{HistoryClient, RestHistoryClient};
use eventconnect_core::protocol::WireMessage;
use serde::Serialize;
use tabled::Tabled;

use super::Context;
use crate::output;

#[derive(Args)]
pub struct HistoryArgs {
    /// Conversation ID
    pub conversation: String,

    /// Page number (1 is the most recent page)
    #[arg(short, long, default_value = "1")]
    pub page: u32,
}

#[derive(Tabled, Serialize)]
struct MessageRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Sender")]
    sender: String,
    #[tabled(rename = "Type")]
    #[serde(rename = "type")]
    message_type: String,
    #[tabled(rename = "Sent")]
    sent_at: String,
    #[tabled(rename = "Content")]
    content: String,
}

impl MessageRow {
    fn from_wire(message: &WireMessage, table: bool) -> Self {
        Self {
            id: message.server_id.clone(),
            sender: message.sender_id.clone(),
            message_type: format!("{:?}", message.message_type).to_lowercase(),
            sent_at: message.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            content: if table {
                output::truncate(&message.content, 60)
            } else {
                message.content.clone()
            },
        }
    }
}

pub async fn execute(args: HistoryArgs, ctx: Context) -> Result<()> {
    let mut client = RestHistoryClient::new(&ctx.config.server.api_url, ctx.config.server.request_timeout)?;
    if let Some(token) = &ctx.token {
        client = client.with_bearer_token(token.clone());
    }

    let messages = client.fetch_messages(&args.conversation, args.page).await?;
    let table = matches!(ctx.format, output::OutputFormat::Table);
    let rows: Vec<MessageRow> = messages
        .iter()
        .map(|m| MessageRow::from_wire(m, table))
        .collect();

    if table {
        output::print_header(&format!("{} (page {})", args.conversation, args.page));
    }
    output::print_list(&rows, ctx.format)
}
