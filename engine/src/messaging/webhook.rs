//! Messenger webhook payloads
//!
//! Only message events are turned into [`InboundMessage`]s; deliveries,
//! reads, echoes and postbacks are dropped.

use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::orchestrator::InboundMessage;

#[derive(Deserialize, Debug)]
pub struct WebhookPayload {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Deserialize, Debug)]
pub struct Entry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
}

#[derive(Deserialize, Debug)]
pub struct MessagingEvent {
    pub sender: Party,
    #[serde(default)]
    pub recipient: Option<Party>,
    /// Milliseconds since the epoch
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub message: Option<ReceivedMessage>,
}

#[derive(Deserialize, Debug)]
pub struct Party {
    pub id: String,
}

#[derive(Deserialize, Debug)]
pub struct ReceivedMessage {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_echo: bool,
    #[serde(default)]
    pub nlp: Option<Nlp>,
}

#[derive(Deserialize, Debug)]
pub struct Nlp {
    #[serde(default)]
    pub entities: Option<Value>,
}

impl WebhookPayload {
    pub fn is_page(&self) -> bool {
        self.object == "page"
    }

    /// Text messages sent by users, in delivery order
    pub fn inbound_messages(&self) -> Vec<InboundMessage> {
        self.entry
            .iter()
            .flat_map(|entry| entry.messaging.iter())
            .filter_map(MessagingEvent::to_inbound)
            .collect()
    }
}

impl MessagingEvent {
    fn to_inbound(&self) -> Option<InboundMessage> {
        let message = self.message.as_ref().filter(|m| !m.is_echo)?;
        let text = message.text.clone()?;

        let sent_at = self
            .timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        let nlu = message
            .nlp
            .as_ref()
            .and_then(|nlp| nlp.entities.as_ref())
            .filter(|entities| !entities.is_null())
            .map(|entities| entities.to_string().into_bytes());

        Some(InboundMessage {
            sender_id: self.sender.id.clone(),
            text,
            sent_at,
            nlu,
            message_id: message.mid.clone(),
        })
    }
}
