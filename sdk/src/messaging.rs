//! Outbound messaging seam
//!
//! Step side-effects reply to users through a [`MessageSender`]. The
//! orchestrator itself never sends anything.

use async_trait::async_trait;

use crate::errors::EngineError;

/// Delivers a text message to a user on a messaging platform
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send `text` to the user identified by their platform id
    async fn send_text(&self, user_external_id: &str, text: &str) -> Result<(), EngineError>;
}
