//! Storyline SDK
//!
//! Shared library providing the error type, the normalized NLU data model and
//! the collaborator traits used by the engine and its adapters.

/// Error types and handling
pub mod errors;

/// Outbound messaging trait
pub mod messaging;

/// NLU data model and parser trait
pub mod nlu;

// Re-export commonly used types
pub use errors::{EngineError, StorylineErrorExt};
pub use messaging::MessageSender;
pub use nlu::{
    DataType, Entity, EntityValue, GranularTime, Granularity, Intent, NluParser, ParsedData,
};
