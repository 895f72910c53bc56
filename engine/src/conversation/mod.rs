//! Conversation aggregate and message log
//!
//! A [`Conversation`] is one dialogue session with one user: a status, the
//! name of the step the user is currently in, and an append-only log of the
//! messages exchanged. The orchestrator mutates it during a turn; the
//! [`ConversationRepository`] persists it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sdk::{EngineError, ParsedData};

pub mod repository;

pub use repository::{ConversationRepository, InMemoryConversationRepository};

/// End user of a messaging platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Platform-specific external id, e.g. a Messenger page-scoped id
    pub platform_id: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(platform_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            platform_id: platform_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Conversation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationStatus {
    Ongoing,
    /// A human operator owns the conversation; the engine only logs
    HumanIntervention,
    /// Terminal: the next message starts a new conversation
    Over,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ongoing => "ongoing",
            Self::HumanIntervention => "human-intervention",
            Self::Over => "over",
        }
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ongoing" => Ok(Self::Ongoing),
            "human-intervention" => Ok(Self::HumanIntervention),
            "over" => Ok(Self::Over),
            other => Err(EngineError::Persistence(format!(
                "Unknown conversation status '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message received from a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: String,
    pub text: String,
    /// Id of the sending [`User`]
    pub sender: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub parsed_data: Option<ParsedData>,
    /// Id the platform gave the message, used to spot redeliveries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
}

/// Message sent by the bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotMessage {
    pub id: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    /// Id of the [`UserMessage`] this answers
    #[serde(default)]
    pub replies_to: Option<String>,
}

/// Entry of the message log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Bot(BotMessage),
}

impl Message {
    pub fn user(
        text: impl Into<String>,
        sender: &User,
        sent_at: DateTime<Utc>,
        parsed_data: Option<ParsedData>,
    ) -> Self {
        Self::User(UserMessage {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            sender: sender.id.clone(),
            sent_at,
            parsed_data,
            platform_message_id: None,
        })
    }

    /// Tag a user message with the platform's id for it; bot messages are
    /// left untouched
    pub fn with_platform_id(mut self, platform_message_id: Option<String>) -> Self {
        if let Self::User(m) = &mut self {
            m.platform_message_id = platform_message_id;
        }
        self
    }

    pub fn bot(text: impl Into<String>, replies_to: Option<String>) -> Self {
        Self::Bot(BotMessage {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            sent_at: Utc::now(),
            replies_to,
        })
    }

    pub fn id(&self) -> &str {
        match self {
            Self::User(m) => &m.id,
            Self::Bot(m) => &m.id,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::User(m) => &m.text,
            Self::Bot(m) => &m.text,
        }
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        match self {
            Self::User(m) => m.sent_at,
            Self::Bot(m) => m.sent_at,
        }
    }

    /// Storage tag of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Bot(_) => "bot",
        }
    }
}

/// One dialogue session with one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unset until the first save
    pub id: Option<String>,
    pub user_id: String,
    pub status: ConversationStatus,
    /// Empty until a story has been entered
    pub current_step: String,
    pub messages: Vec<Message>,
    /// Id of the last user message whose turn completed
    #[serde(default)]
    pub handled_through: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Fresh ongoing conversation with no story and no messages
    pub fn start(user: &User) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            user_id: user.id.clone(),
            status: ConversationStatus::Ongoing,
            current_step: String::new(),
            messages: Vec::new(),
            handled_through: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// No message logged yet
    pub fn is_new(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_started_story(&self) -> bool {
        !self.current_step.is_empty()
    }

    pub fn is_over(&self) -> bool {
        self.status == ConversationStatus::Over
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Most recently appended message
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Logged user message the platform delivered as `platform_message_id`,
    /// with its position in the log
    pub fn find_delivery(&self, platform_message_id: &str) -> Option<(usize, &UserMessage)> {
        self.messages
            .iter()
            .enumerate()
            .find_map(|(position, message)| match message {
                Message::User(m) if m.platform_message_id.as_deref() == Some(platform_message_id) => {
                    Some((position, m))
                }
                _ => None,
            })
    }

    /// Whether the turn of the message at `position` completed
    ///
    /// Turns complete in log order, so everything up to the marker counts.
    pub fn is_handled(&self, position: usize) -> bool {
        self.handled_through
            .as_deref()
            .and_then(|id| self.messages.iter().position(|m| m.id() == id))
            .is_some_and(|marker| position <= marker)
    }

    pub fn mark_handled(&mut self, message_id: impl Into<String>) {
        self.handled_through = Some(message_id.into());
        self.updated_at = Utc::now();
    }

    pub fn advance_to(&mut self, step: impl Into<String>) {
        self.current_step = step.into();
        self.updated_at = Utc::now();
    }

    pub fn set_status(&mut self, status: ConversationStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
