//! Configuration management commands.
//!
//! Stores CLI settings (`api-url`, `ws-url`, `token`, `user-id`) in
//! `~/.eventconnect/config.toml`. Session tuning lives in the client config
//! file passed with `--config`.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Set a configuration value
    Set {
        /// Configuration key (api-url, ws-url, token, user-id)
        key: String,
        /// Value to set
        value: String,
    },

    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },

    /// Show all configuration
    Show,

    /// Reset configuration to defaults
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

/// Persistent CLI configuration stored on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

const KNOWN_KEYS: &[&str] = &["api-url", "ws-url", "token", "user-id"];

fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".eventconnect").join("config.toml"))
}

/// Load the CLI configuration from disk, returning defaults if the file does
/// not exist.
fn load_config() -> Result<CliConfig> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let cfg: CliConfig =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    Ok(cfg)
}

/// Save the CLI configuration to disk, creating the directory if needed.
fn save_config(cfg: &CliConfig) -> Result<()> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content =
        toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// A stored value, if set.
pub fn stored_value(key: &str) -> Option<String> {
    load_config()
        .ok()
        .and_then(|cfg| cfg.values.get(key).cloned())
}

/// Stored values with secrets masked for display.
fn displayable(cfg: &CliConfig) -> BTreeMap<String, String> {
    cfg.values
        .iter()
        .map(|(k, v)| {
            let shown = if k == "token" { mask(v) } else { v.clone() };
            (k.clone(), shown)
        })
        .collect()
}

fn mask(secret: &str) -> String {
    let tail: String = secret.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("****{}", tail)
}

pub async fn execute(cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Set { key, value } => {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                output::print_warning(&format!(
                    "'{}' is not used by the client (known keys: {})",
                    key,
                    KNOWN_KEYS.join(", ")
                ));
            }

            let mut cfg = load_config()?;
            cfg.values.insert(key.clone(), value.clone());
            save_config(&cfg)?;

            let shown = if key == "token" { mask(&value) } else { value };
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("{} = {}", key, shown));
                }
                _ => {
                    output::print_item(
                        &serde_json::json!({ "key": key, "value": shown }),
                        format,
                    )?;
                }
            }
        }

        ConfigCommands::Get { key } => {
            let cfg = load_config()?;
            match cfg.values.get(&key) {
                Some(value) => match format {
                    OutputFormat::Table => println!("{}", value),
                    _ => {
                        output::print_item(
                            &serde_json::json!({ "key": key, "value": value }),
                            format,
                        )?;
                    }
                },
                None => {
                    output::print_error(&format!("Key '{}' not found", key));
                }
            }
        }

        ConfigCommands::Show => {
            let cfg = load_config()?;

            if cfg.values.is_empty() {
                output::print_info("No configuration values set.");
                return Ok(());
            }

            let values = displayable(&cfg);
            match format {
                OutputFormat::Table => {
                    output::print_header("Configuration");
                    for (k, v) in &values {
                        output::print_detail(k, v);
                    }
                }
                _ => output::print_item(&values, format)?,
            }
        }

        ConfigCommands::Reset { force } => {
            if !force {
                output::print_info(
                    "This will remove all stored settings. Use --force to confirm.",
                );
                return Ok(());
            }

            let path = config_path()?;
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }

            output::print_success("Configuration reset to defaults");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_masked_for_display() {
        let mut cfg = CliConfig::default();
        cfg.values.insert("token".into(), "abcdef123456".into());
        cfg.values.insert("user-id".into(), "u1".into());

        let shown = displayable(&cfg);
        assert_eq!(shown["token"], "****3456");
        assert_eq!(shown["user-id"], "u1");
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let mut cfg = CliConfig::default();
        cfg.values.insert("ws-url".into(), "ws://chat.local/socket".into());

        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: CliConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.values["ws-url"], "ws://chat.local/socket");
    }
}
