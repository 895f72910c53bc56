//! CLI interface for Storyline
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Storyline conversation engine
///
/// Drives chatbot users through dialogue stories, one webhook message at a
/// time, and keeps every conversation in a local SQLite database.
#[derive(Parser, Debug)]
#[command(name = "storyline")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the webhook server until Ctrl-C
    Serve,

    /// Inspect the story catalog
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },

    /// Run one turn offline; replies are printed instead of sent
    Simulate {
        /// Platform id of the sender
        #[arg(long)]
        user: String,

        /// Message text
        #[arg(long)]
        text: String,

        /// Intent understood from the message
        #[arg(long)]
        intent: Option<String>,

        /// Integer entity, as name=value (repeatable)
        #[arg(long = "entity", value_name = "NAME=INT", value_parser = parse_entity)]
        entities: Vec<(String, i64)>,
    },

    /// POST a webhook payload file to the running server
    Receive {
        /// JSON payload file
        #[arg(long)]
        data: PathBuf,
    },

    /// Send a text message to a user through the Send API
    Send {
        #[arg(long)]
        user: String,

        #[arg(long)]
        text: String,
    },

    /// Show a user's conversations
    History {
        #[arg(long)]
        user: String,
    },

    /// Hand a conversation held by an operator back to the bot
    Release {
        #[arg(long)]
        user: String,

        /// End the conversation instead of resuming it
        #[arg(long)]
        close: bool,
    },
}

/// Story catalog actions
#[derive(Subcommand, Debug)]
pub enum CatalogAction {
    /// Validate a catalog file (the configured one by default)
    Check {
        path: Option<PathBuf>,
    },

    /// Print the catalog tree
    Show,
}

fn parse_entity(raw: &str) -> Result<(String, i64), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=INT, got '{}'", raw))?;

    let name = name.trim();
    if name.is_empty() {
        return Err("entity name cannot be empty".to_string());
    }

    let value = value
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("invalid value for '{}': {}", name, e))?;

    Ok((name.to_string(), value))
}
