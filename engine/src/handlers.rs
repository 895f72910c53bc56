//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - serve: run the webhook server
//! - catalog check / show: validate and print the story catalog
//! - simulate: run one offline turn against the local database
//! - receive: replay a webhook payload against the running server
//! - send: deliver a text message through the Send API
//! - history: show a user's conversations
//! - release: give a conversation held by an operator back to the engine

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use sdk::{EngineError, MessageSender, StorylineErrorExt};

use crate::config::Config;
use crate::conversation::{ConversationRepository, Message};
use crate::db::Database;
use crate::message_bus::{EventType, MessageBus};
use crate::messaging::{LogSender, MessengerClient};
use crate::nlu::WitParser;
use crate::orchestrator::{InboundMessage, Orchestrator, TurnOutcome};
use crate::server::{self, ServerState};
use crate::steps::StepRegistry;
use crate::story::{InMemoryStoryRepository, StoryCatalog, StoryRepository, TomlStoryRepository};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Load the configured catalog, or the built-in booking catalog
pub async fn load_catalog(config: &Config) -> Result<StoryCatalog> {
    let repository: Box<dyn StoryRepository> = match &config.catalog.path {
        Some(path) => Box::new(TomlStoryRepository::new(path)),
        None => Box::new(InMemoryStoryRepository::book_table()),
    };

    StoryCatalog::load(repository.as_ref())
        .await
        .map_err(|e| anyhow::anyhow!("{} ({})", e, e.user_hint()))
}

/// Wire an orchestrator over the SQLite database
pub async fn build_orchestrator(
    config: &Config,
    database: &Database,
    sender: Arc<dyn MessageSender>,
) -> Result<Orchestrator> {
    let catalog = load_catalog(config).await?;

    let orchestrator = Orchestrator::new(
        Arc::new(catalog),
        Arc::new(database.conversations()),
        Arc::new(WitParser::new(config.nlu.data_type_map())),
        StepRegistry::booking(),
        sender,
    )
    .context("Failed to build orchestrator")?
    .with_timeout(config.engine.collaborator_timeout());

    Ok(orchestrator)
}

/// Real Send API client when a token is configured, else a logging stub
fn outbound_sender(config: &Config) -> Arc<dyn MessageSender> {
    if config.messenger.page_access_token.is_empty() {
        warn!("No page access token configured; replies will only be logged");
        Arc::new(LogSender)
    } else {
        Arc::new(MessengerClient::new(
            &config.messenger.api_base_url,
            &config.messenger.api_version,
            &config.messenger.page_access_token,
            config.engine.collaborator_timeout(),
        ))
    }
}

async fn open_database(config: &Config) -> Result<Database> {
    Database::new(&config.database_path())
        .await
        .context("Failed to open database")
}

/// Run the webhook server until Ctrl-C
pub async fn handle_serve(config: &Config) -> Result<()> {
    let database = open_database(config).await?;
    let bus = Arc::new(MessageBus::new());
    let orchestrator = build_orchestrator(config, &database, outbound_sender(config))
        .await?
        .with_bus(Arc::clone(&bus));

    // Turn events end up in the debug log
    let mut events = bus.subscribe(EventType::All).await;
    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(?event, "Turn event");
        }
    });

    let state = ServerState::new(Arc::new(orchestrator), config.server.verify_token.clone());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    server::serve(&config.server.bind_addr, state, shutdown).await?;

    event_logger.abort();
    database.close().await?;
    info!("Storyline stopped");

    Ok(())
}

/// Validate a catalog file, or the configured catalog
pub async fn handle_catalog_check(
    path: Option<&Path>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let catalog = match path {
        Some(path) => {
            let repository = TomlStoryRepository::new(path);
            StoryCatalog::load(&repository).await
        }
        None => match &config.catalog.path {
            Some(path) => StoryCatalog::load(&TomlStoryRepository::new(path)).await,
            None => StoryCatalog::load(&InMemoryStoryRepository::book_table()).await,
        },
    };

    let registry = StepRegistry::booking();
    let missing: Vec<String> = match &catalog {
        Ok(catalog) => catalog
            .step_names()
            .filter(|name| !registry.contains(name))
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    };

    match format {
        OutputFormat::Text => match &catalog {
            Ok(catalog) => {
                println!(
                    "✓ Catalog is valid: {} stories, {} steps",
                    catalog.stories().len(),
                    catalog.step_count()
                );
                for name in &missing {
                    println!("  ⚠ no built-in handler for step '{}'", name);
                }
            }
            Err(e) => println!("✗ {}", e),
        },
        OutputFormat::Json => {
            let output = match &catalog {
                Ok(catalog) => json!({
                    "valid": true,
                    "stories": catalog.stories().len(),
                    "steps": catalog.step_count(),
                    "steps_without_handler": missing,
                }),
                Err(e) => json!({
                    "valid": false,
                    "error": e.to_string(),
                }),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    catalog.map(|_| ()).map_err(|e| anyhow::anyhow!(e))
}

/// Print the catalog as an indented tree
pub async fn handle_catalog_show(config: &Config, format: OutputFormat) -> Result<()> {
    let catalog = load_catalog(config).await?;

    match format {
        OutputFormat::Text => {
            let mut current_story = "";
            for item in catalog.walk() {
                if item.story.name != current_story {
                    current_story = &item.story.name;
                    println!("Story: {}", current_story);
                }

                let mut requirements = Vec::new();
                if let Some(intent) = item.step.intent() {
                    requirements.push(format!("intent={}", intent));
                }
                for entity in &item.step.required_entities {
                    requirements.push(format!("entity={}", entity));
                }

                println!(
                    "{}- {} [{}]",
                    "  ".repeat(item.depth + 1),
                    item.step.name,
                    requirements.join(", ")
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({ "stories": catalog.stories() });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Collects replies so `simulate` can print them
#[derive(Default)]
struct CaptureSender {
    replies: Mutex<Vec<String>>,
}

#[async_trait]
impl MessageSender for CaptureSender {
    async fn send_text(&self, _user_external_id: &str, text: &str) -> Result<(), EngineError> {
        self.replies.lock().await.push(text.to_string());
        Ok(())
    }
}

/// Wit-shaped payload for the given intent and integer entities
fn simulated_nlu(intent: Option<&str>, entities: &[(String, i64)]) -> Option<Vec<u8>> {
    if intent.is_none() && entities.is_empty() {
        return None;
    }

    let mut payload = Map::new();
    if let Some(intent) = intent {
        payload.insert("intent".to_string(), json!([{ "confidence": 1.0, "value": intent }]));
    }
    for (name, value) in entities {
        payload.insert(name.clone(), json!([{ "confidence": 1.0, "value": value }]));
    }

    Some(Value::Object(payload).to_string().into_bytes())
}

/// Run one turn offline against the local database
pub async fn handle_simulate(
    user: String,
    text: String,
    intent: Option<String>,
    entities: Vec<(String, i64)>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = open_database(config).await?;
    let sender = Arc::new(CaptureSender::default());
    let orchestrator =
        build_orchestrator(config, &database, Arc::clone(&sender) as Arc<dyn MessageSender>)
            .await?;

    let mut inbound = InboundMessage::new(user, text);
    if let Some(raw) = simulated_nlu(intent.as_deref(), &entities) {
        inbound = inbound.with_nlu(raw);
    }

    let result = orchestrator.handle_message(inbound).await;
    let replies = sender.replies.lock().await.clone();
    database.close().await?;

    let outcome = result.map_err(|e| anyhow::anyhow!("{} ({})", e, e.user_hint()))?;

    match format {
        OutputFormat::Text => {
            println!("{}", describe_outcome(&outcome));
            for reply in &replies {
                println!("  bot: {}", reply);
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "turn": outcome,
                "replies": replies,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn describe_outcome(outcome: &TurnOutcome) -> String {
    match outcome {
        TurnOutcome::NoUnderstanding => "Message logged (no understanding data)".to_string(),
        TurnOutcome::HumanOwned => "Message logged (a human owns this conversation)".to_string(),
        TurnOutcome::CannotStartStory => "No story can start from this message".to_string(),
        TurnOutcome::CannotProgress { step } => {
            format!("Cannot progress from step '{}'", step)
        }
        TurnOutcome::Rejected { step, reason } => {
            format!("Step '{}' did not accept the answer: {}", step, reason)
        }
        TurnOutcome::Duplicate => "Message already handled".to_string(),
        TurnOutcome::Advanced { from, to, status } if from.is_empty() => {
            format!("Started story at '{}' (conversation {})", to, status)
        }
        TurnOutcome::Advanced { from, to, status } => {
            format!("Advanced '{}' -> '{}' (conversation {})", from, to, status)
        }
    }
}

/// POST a webhook payload file to the running server
pub async fn handle_receive(data: &Path, config: &Config, format: OutputFormat) -> Result<()> {
    let contents = tokio::fs::read_to_string(data)
        .await
        .with_context(|| format!("Failed to read {}", data.display()))?;

    let payload: Value = serde_json::from_str(&contents).context("Payload is not valid JSON")?;

    let url = format!("http://{}/webhook", config.server.bind_addr);
    let response = reqwest::Client::new()
        .post(&url)
        .json(&payload)
        .timeout(config.engine.collaborator_timeout())
        .send()
        .await
        .with_context(|| format!("Failed to reach {} (is 'storyline serve' running?)", url))?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    match format {
        OutputFormat::Text => println!("{} {}", status, body),
        OutputFormat::Json => {
            let output = json!({ "status": status.as_u16(), "body": body });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    if status.is_success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Webhook answered {}", status))
    }
}

/// Deliver a text message through the Send API
pub async fn handle_send(user: &str, text: &str, config: &Config, format: OutputFormat) -> Result<()> {
    if config.messenger.page_access_token.is_empty() {
        return Err(anyhow::anyhow!(
            "No page access token configured. Set messenger.page_access_token or {}",
            crate::config::PAGE_ACCESS_TOKEN_ENV
        ));
    }

    outbound_sender(config)
        .send_text(user, text)
        .await
        .context("Failed to send message")?;

    match format {
        OutputFormat::Text => println!("✓ Sent to {}", user),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!({ "sent": true, "user": user }))?)
        }
    }

    Ok(())
}

/// Hand a conversation held by an operator back to the engine, or end it
pub async fn handle_release(
    user: &str,
    close: bool,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = open_database(config).await?;
    let orchestrator = build_orchestrator(config, &database, Arc::new(LogSender)).await?;

    let result = orchestrator.release(user, close).await;
    database.close().await?;
    let released = result.map_err(|e| anyhow::anyhow!("{} ({})", e, e.user_hint()))?;

    match format {
        OutputFormat::Text if released && close => println!("✓ Conversation of {} closed", user),
        OutputFormat::Text if released => println!("✓ Conversation of {} handed back to the bot", user),
        OutputFormat::Text => println!("No conversation of '{}' is waiting for an operator", user),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "user": user,
                "released": released,
                "closed": released && close,
            }))?
        ),
    }

    Ok(())
}

/// Show a user's conversations, oldest first
pub async fn handle_history(user: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;
    let repository = database.conversations();

    let Some(found) = repository
        .find_user(user)
        .await
        .context("Failed to look up user")?
    else {
        database.close().await?;
        match format {
            OutputFormat::Text => println!("No user with platform id '{}'", user),
            OutputFormat::Json => println!("{}", json!({ "user": user, "conversations": [] })),
        }
        return Ok(());
    };

    let conversations = repository
        .find_conversations(&found)
        .await
        .context("Failed to fetch conversations")?;
    database.close().await?;

    match format {
        OutputFormat::Text => {
            if conversations.is_empty() {
                println!("No conversations for '{}'", user);
                return Ok(());
            }

            for conversation in &conversations {
                println!(
                    "Conversation {} [{}]",
                    conversation.id.as_deref().unwrap_or("-"),
                    conversation.status
                );
                if !conversation.current_step.is_empty() {
                    println!("  Step: {}", conversation.current_step);
                }
                println!(
                    "  Started: {}",
                    conversation.created_at.format("%Y-%m-%d %H:%M:%S")
                );
                for message in &conversation.messages {
                    let who = match message {
                        Message::User(_) => "user",
                        Message::Bot(_) => "bot ",
                    };
                    println!(
                        "  {} {}: {}",
                        message.sent_at().format("%H:%M:%S"),
                        who,
                        message.text()
                    );
                }
                println!();
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "user": found,
                "conversations": conversations,
                "count": conversations.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
