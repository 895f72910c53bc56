//! Error types and handling
//!
//! This module provides the error type shared by the Storyline engine and its
//! collaborators. Every error implements [`StorylineErrorExt`], which gives a
//! user-safe hint and tells the transport layer whether the delivery that
//! produced it is worth retrying.
//!
//! # Security
//!
//! Hints never echo the inner message: tokens, raw payloads and file paths
//! stay in the `Display` output, which only goes to the logs.

use thiserror::Error;

/// Trait for Storyline error extensions
///
/// Gives additional context for errors: a user-friendly hint and whether the
/// failed operation can be retried as-is.
pub trait StorylineErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors are transient: redelivering the same inbound event
    /// later may succeed. Non-recoverable errors need an operator to fix data
    /// or configuration first.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Catalog**: invalid story catalogs and dangling step pointers
/// - **Steps**: side-effect failures and missing handlers
/// - **Persistence**: repository read/write failures
/// - **NLU**: malformed understanding payloads
/// - **Transport**: network failures and timeouts
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, StorylineErrorExt};
///
/// let error = EngineError::Persistence("disk I/O error".to_string());
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::CatalogInconsistency("book_table_get_time".to_string());
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Catalog errors
    #[error("Invalid story catalog: {0}")]
    InvalidCatalog(String),

    #[error("Conversation points at step '{0}' which is not in the catalog")]
    CatalogInconsistency(String),

    // Step errors
    #[error("No side-effect handler registered for step '{0}'")]
    MissingStepHandler(String),

    #[error("Side-effect for step '{step}' failed: {message}")]
    SideEffect { step: String, message: String },

    /// The step refused the user's input; retrying the same input cannot help
    #[error("Step '{step}' rejected the input: {reason}")]
    StepRejected { step: String, reason: String },

    // Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("User with platform id '{0}' already exists")]
    DuplicateUser(String),

    // NLU errors
    #[error("NLU parse error: {0}")]
    NluParse(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Wrap a step handler failure
    pub fn side_effect(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SideEffect {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Refuse the input a step was entered with
    pub fn step_rejected(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StepRejected {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable tag, used in logs and turn events
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::InvalidCatalog(_) => "invalid_catalog",
            Self::CatalogInconsistency(_) => "catalog_inconsistency",
            Self::MissingStepHandler(_) => "missing_step_handler",
            Self::SideEffect { .. } => "side_effect_failure",
            Self::StepRejected { .. } => "step_rejected",
            Self::Persistence(_) => "persistence_failure",
            Self::DuplicateUser(_) => "duplicate_user",
            Self::NluParse(_) => "nlu_parse",
            Self::Network(_) => "network",
            Self::Timeout { .. } => "timeout",
            Self::Io(_) => "io",
        }
    }
}

impl StorylineErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",

            Self::InvalidCatalog(_) => "The story catalog is invalid. Run 'storyline catalog check'",
            Self::CatalogInconsistency(_) => {
                "The conversation references a step that no longer exists"
            }

            Self::MissingStepHandler(_) => "A catalog step has no side-effect handler",
            Self::SideEffect { .. } => "A step action failed. The message was kept",
            Self::StepRejected { .. } => "The answer was not accepted. The step was not entered",

            Self::Persistence(_) => "Database operation failed. The delivery can be retried",
            Self::DuplicateUser(_) => "The user was created concurrently. Try again",

            Self::NluParse(_) => "The understanding payload could not be read",

            Self::Network(_) => "Network operation failed. Check your connection",
            Self::Timeout { .. } => "A collaborator took too long to respond. Try again",

            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_)
            | Self::InvalidCatalog(_)
            | Self::CatalogInconsistency(_)
            | Self::MissingStepHandler(_)
            | Self::StepRejected { .. }
            | Self::NluParse(_) => false,

            // Side effects, storage and transport failures are worth a redelivery
            _ => true,
        }
    }
}
