//! Storyline Engine Library
//!
//! This library provides the core functionality of the Storyline engine:
//! story catalogs, conversation persistence, and the orchestrator that moves
//! users through stories one message at a time. It is used by both the main
//! binary and integration tests.

/// Configuration management module
pub mod config;

/// Story and step graph, matcher and catalog sources
pub mod story;

/// Users, conversations and message logs
pub mod conversation;

/// Database persistence module
pub mod db;

/// NLU payload parsers
pub mod nlu;

/// Step side-effect handlers
pub mod steps;

/// Turn orchestration
pub mod orchestrator;

/// Message bus for turn events
pub mod message_bus;

/// Messenger Send API and webhook payloads
pub mod messaging;

/// Webhook HTTP server
pub mod server;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
