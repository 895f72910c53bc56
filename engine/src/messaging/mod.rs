//! Messaging platform adapters
//!
//! Outbound: [`MessengerClient`] and the offline [`LogSender`], both
//! implementing [`sdk::MessageSender`]. Inbound: webhook payload parsing.

pub mod messenger;
pub mod webhook;

pub use messenger::{LogSender, MessengerClient};
pub use webhook::WebhookPayload;
