//! CLI subcommands.

pub mod chat;
pub mod config;
pub mod history;

use eventconnect_core::config::ClientConfig;

use crate::output::OutputFormat;

/// Resolved settings shared by commands that talk to the server.
pub struct Context {
    pub config: ClientConfig,
    pub token: Option<String>,
    pub user_id: Option<String>,
    pub format: OutputFormat,
}

impl Context {
    pub fn require_token(&self) -> anyhow::Result<&str> {
        self.token.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "No token configured; pass --token or run `eventconnect config set token <value>`"
            )
        })
    }
}
