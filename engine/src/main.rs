// Storyline conversation engine
// Main entry point for the storyline binary

use clap::Parser;
use storyline_engine::cli::{CatalogAction, Cli, Command};
use storyline_engine::config::Config;
use storyline_engine::handlers::{
    handle_catalog_check, handle_catalog_show, handle_history, handle_receive, handle_release,
    handle_send, handle_serve, handle_simulate, OutputFormat,
};
use storyline_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config file; RUST_LOG wins over both
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Storyline v{} ({} - {})", version, commit, timestamp);

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Handle commands
    match cli.command {
        Command::Serve => {
            tracing::info!("Starting webhook server...");
            handle_serve(&config).await
        }

        Command::Catalog { action } => match action {
            CatalogAction::Check { path } => {
                handle_catalog_check(path.as_deref(), &config, format).await
            }
            CatalogAction::Show => handle_catalog_show(&config, format).await,
        },

        Command::Simulate {
            user,
            text,
            intent,
            entities,
        } => {
            tracing::info!("Simulating turn for {}", user);
            handle_simulate(user, text, intent, entities, &config, format).await
        }

        Command::Receive { data } => handle_receive(&data, &config, format).await,

        Command::Send { user, text } => handle_send(&user, &text, &config, format).await,

        Command::History { user } => handle_history(&user, &config, format).await,

        Command::Release { user, close } => handle_release(&user, close, &config, format).await,
    }
}
