//! Output formatting for the EventConnect CLI.
//!
//! Supports table, JSON, and YAML output formats, plus the line-oriented
//! rendering used by interactive chat.

use anyhow::Result;
use chrono::Local;
use clap::ValueEnum;
use colored::*;
use eventconnect_core::message::{Message, MessageStatus};
use eventconnect_core::reconnect::ConnectionState;
use serde::Serialize;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

/// Output format selection.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Render as a formatted table
    #[default]
    Table,
    /// Render as JSON
    Json,
    /// Render as YAML
    Yaml,
}

/// Print a success message to stdout.
pub fn print_success(msg: &str) {
    println!("{} {}", "[OK]".green().bold(), msg);
}

/// Print an error message to stderr.
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), msg);
}

/// Print an informational message to stdout.
pub fn print_info(msg: &str) {
    println!("{} {}", "[INFO]".blue().bold(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "[WARN]".yellow().bold(), msg);
}

/// Print a list of items in the requested format.
///
/// For table output, items must implement `Tabled`. For JSON/YAML, items must
/// implement `Serialize`.
pub fn print_list<T: Tabled + Serialize>(items: &[T], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No messages found.".dimmed());
                return Ok(());
            }
            let table = Table::new(items)
                .with(Style::rounded())
                .with(Modify::new(Columns::first()).with(Alignment::left()))
                .to_string();
            println!("{}", table);
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(items)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(items)?),
    }
    Ok(())
}

/// Print a single item in the requested format.
pub fn print_item<T: Serialize>(item: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table | OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(item)?)
        }
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(item)?),
    }
    Ok(())
}

/// Print key-value details to the terminal (non-JSON/YAML output).
pub fn print_detail(key: &str, value: &str) {
    println!("  {}: {}", key.cyan(), value);
}

/// Print a section header.
pub fn print_header(title: &str) {
    println!();
    println!("{}", title.bold().underline());
    println!();
}

// ── Chat rendering ──────────────────────────────────────────────────────────

/// One chat line: `12:04 alice: hello`, with a status mark on own messages.
pub fn print_message(message: &Message, me: &str) {
    let time = message.created_at.with_timezone(&Local).format("%H:%M");
    if message.sender_id == me {
        println!(
            "{} {}: {} {}",
            time.to_string().dimmed(),
            "you".green().bold(),
            message.content,
            status_mark(message.status)
        );
    } else {
        println!(
            "{} {}: {}",
            time.to_string().dimmed(),
            message.sender_id.cyan().bold(),
            message.content
        );
    }
}

pub fn print_status_change(message: &Message) {
    let id = message
        .server_id
        .as_deref()
        .or(message.local_id.as_deref())
        .unwrap_or("?");
    println!(
        "{} {} {}",
        "  ->".dimmed(),
        truncate(&message.content, 24).dimmed(),
        format!("{} ({})", status_mark(message.status), id).dimmed()
    );
}

pub fn print_typing(conversation_id: &str, users: &[String]) {
    match users {
        [] => {}
        [one] => println!("{}", format!("{} is typing in {}...", one, conversation_id).italic().dimmed()),
        many => println!(
            "{}",
            format!("{} are typing in {}...", many.join(", "), conversation_id)
                .italic()
                .dimmed()
        ),
    }
}

pub fn print_connection(state: ConnectionState) {
    let label = match state {
        ConnectionState::Connected => state.as_str().green().bold(),
        ConnectionState::Connecting | ConnectionState::Reconnecting => state.as_str().yellow().bold(),
        ConnectionState::Disconnected => state.as_str().dimmed(),
        ConnectionState::Failed => state.as_str().red().bold(),
    };
    println!("{} {}", "[CONN]".blue().bold(), label);
}

fn status_mark(status: MessageStatus) -> ColoredString {
    match status {
        MessageStatus::Sending => "…".dimmed(),
        MessageStatus::Sent => "✓".normal(),
        MessageStatus::Delivered => "✓✓".normal(),
        MessageStatus::Read => "✓✓".blue(),
        MessageStatus::Failed => "✗ failed".red(),
    }
}

pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
