//! Conversation orchestrator
//!
//! Runs one turn per inbound message:
//!
//! 1. resolve the user, creating it on first contact
//! 2. resume the latest conversation, or start one if there is none or it is over
//! 3. log the inbound message and persist it before anything else; a
//!    platform redelivery of a logged message is skipped if its turn
//!    completed, else the turn is retried without logging it again
//! 4. stop if there is no understanding data or a human owns the conversation
//! 5. pick the step to enter: first matching starting step when no story is
//!    running, else first matching successor of the current step
//! 6. run the step's side-effect, then advance and persist; input the step
//!    rejects leaves the step unchanged and still completes the turn
//!
//! Turns of one user are serialized; turns of different users run in parallel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use sdk::{EngineError, MessageSender, NluParser, ParsedData, StorylineErrorExt};

use crate::conversation::{
    Conversation, ConversationRepository, ConversationStatus, Message, User,
};
use crate::message_bus::{Event, MessageBus};
use crate::steps::{StepContext, StepRegistry};
use crate::story::StoryCatalog;

pub mod locks;

use locks::UserLocks;

/// Default bound on a single collaborator call
pub const DEFAULT_COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Message received from a platform
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Platform id of the sender
    pub sender_id: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    /// Raw NLU payload, if the platform attached one
    pub nlu: Option<Vec<u8>>,
    /// Platform id of the message, if the platform gives one
    pub message_id: Option<String>,
}

impl InboundMessage {
    pub fn new(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            text: text.into(),
            sent_at: Utc::now(),
            nlu: None,
            message_id: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_nlu(mut self, raw: impl Into<Vec<u8>>) -> Self {
        self.nlu = Some(raw.into());
        self
    }

    pub fn sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = sent_at;
        self
    }
}

/// How a turn ended when nothing failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// No usable understanding data; message logged only
    NoUnderstanding,
    /// A human operator owns the conversation; message logged only
    HumanOwned,
    /// No starting step matched
    CannotStartStory,
    /// No successor of `step` matched
    CannotProgress { step: String },
    /// `step` refused the input; the conversation did not move
    Rejected { step: String, reason: String },
    /// Redelivery of a message whose turn already completed
    Duplicate,
    /// Entered `to`; `from` is empty when a story was just started
    Advanced {
        from: String,
        to: String,
        status: ConversationStatus,
    },
}

pub struct Orchestrator {
    catalog: Arc<StoryCatalog>,
    repository: Arc<dyn ConversationRepository>,
    parser: Arc<dyn NluParser>,
    steps: StepRegistry,
    sender: Arc<dyn MessageSender>,
    bus: Arc<MessageBus>,
    locks: UserLocks,
    timeout: Duration,
}

impl Orchestrator {
    /// Fails with [`EngineError::MissingStepHandler`] if a catalog step has
    /// no handler in `steps`
    pub fn new(
        catalog: Arc<StoryCatalog>,
        repository: Arc<dyn ConversationRepository>,
        parser: Arc<dyn NluParser>,
        steps: StepRegistry,
        sender: Arc<dyn MessageSender>,
    ) -> Result<Self, EngineError> {
        steps.ensure_covers(&catalog)?;

        Ok(Self {
            catalog,
            repository,
            parser,
            steps,
            sender,
            bus: Arc::new(MessageBus::new()),
            locks: UserLocks::new(),
            timeout: DEFAULT_COLLABORATOR_TIMEOUT,
        })
    }

    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn catalog(&self) -> &StoryCatalog {
        &self.catalog
    }

    pub fn repository(&self) -> &Arc<dyn ConversationRepository> {
        &self.repository
    }

    /// Run one turn
    ///
    /// Errors are published as [`Event::TurnFailed`] and returned so the
    /// transport can decide whether to have the delivery retried.
    pub async fn handle_message(&self, inbound: InboundMessage) -> Result<TurnOutcome, EngineError> {
        let result = self.run_turn(&inbound).await;

        if let Err(e) = &result {
            error!(
                user = %inbound.sender_id,
                kind = e.kind(),
                recoverable = e.is_recoverable(),
                "Turn failed: {}",
                e
            );
            self.bus
                .publish(Event::TurnFailed {
                    user: inbound.sender_id.clone(),
                    kind: e.kind().to_string(),
                    error: e.to_string(),
                })
                .await;
        }

        result
    }

    async fn run_turn(&self, inbound: &InboundMessage) -> Result<TurnOutcome, EngineError> {
        let _guard = self.locks.lock(&inbound.sender_id).await;

        let user = self.resolve_user(&inbound.sender_id).await?;
        let latest = self
            .bounded(
                "find latest conversation",
                self.repository.find_latest_conversation(&user),
            )
            .await?;

        let redelivered = match (&latest, inbound.message_id.as_deref()) {
            (Some(conversation), Some(delivery)) => conversation
                .find_delivery(delivery)
                .map(|(position, logged)| (position, logged.id.clone(), logged.parsed_data.clone())),
            _ => None,
        };

        let (mut conversation, message_id, parsed) = match (latest, redelivered) {
            (Some(conversation), Some((position, message_id, parsed))) => {
                if conversation.is_handled(position) {
                    debug!(
                        user = %user.platform_id,
                        delivery = ?inbound.message_id,
                        "Redelivered message already handled"
                    );
                    return Ok(TurnOutcome::Duplicate);
                }
                info!(user = %user.platform_id, delivery = ?inbound.message_id, "Retrying turn");
                (conversation, message_id, parsed)
            }
            (latest, _) => {
                let mut conversation = self.resume_or_start(&user, latest);
                let parsed = self.parse(inbound);
                let message = Message::user(&inbound.text, &user, inbound.sent_at, parsed.clone())
                    .with_platform_id(inbound.message_id.clone());
                let message_id = message.id().to_string();
                conversation.add_message(message);

                // The inbound message is durable before any decision is made
                self.save(&mut conversation).await?;
                (conversation, message_id, parsed)
            }
        };

        let conversation_id = conversation.id.clone().unwrap_or_default();
        self.bus
            .publish(Event::TurnReceived {
                user: user.platform_id.clone(),
                conversation_id: conversation_id.clone(),
                has_nlu: parsed.is_some(),
            })
            .await;

        if conversation.status == ConversationStatus::HumanIntervention {
            debug!(user = %user.platform_id, "Conversation is owned by a human, not progressing");
            self.complete(&mut conversation, &message_id).await?;
            return Ok(TurnOutcome::HumanOwned);
        }

        let Some(data) = parsed else {
            debug!(user = %user.platform_id, "No understanding data, not progressing");
            self.complete(&mut conversation, &message_id).await?;
            return Ok(TurnOutcome::NoUnderstanding);
        };

        let from = conversation.current_step.clone();
        let (story, step) = if conversation.has_started_story() {
            let current = self
                .catalog
                .find_step(&from)
                .ok_or_else(|| EngineError::CatalogInconsistency(from.clone()))?;

            match current.find_next(&data) {
                Some(next) => (None, next),
                None => {
                    info!(user = %user.platform_id, step = %from, "Cannot progress");
                    self.complete(&mut conversation, &message_id).await?;
                    self.bus
                        .publish(Event::CannotProgress {
                            user: user.platform_id.clone(),
                            step: from.clone(),
                        })
                        .await;
                    return Ok(TurnOutcome::CannotProgress { step: from });
                }
            }
        } else {
            match self.catalog.find_entry_step(&data) {
                Some((story, step)) => (Some(story), step),
                None => {
                    info!(user = %user.platform_id, intent = ?data.intent_name(), "Cannot start story");
                    self.complete(&mut conversation, &message_id).await?;
                    self.bus
                        .publish(Event::CannotStartStory {
                            user: user.platform_id.clone(),
                        })
                        .await;
                    return Ok(TurnOutcome::CannotStartStory);
                }
            }
        };

        let handler = self
            .steps
            .get(&step.name)
            .ok_or_else(|| EngineError::MissingStepHandler(step.name.clone()))?;

        let mut ctx = StepContext::new(step, &data, &user, self.sender.as_ref());
        let processed = self
            .bounded(&format!("step '{}'", step.name), handler.process(&mut ctx))
            .await;
        let (replies, requested_status) = ctx.into_outcome();

        let replied = !replies.is_empty();
        for reply in replies {
            conversation.add_message(Message::bot(reply, Some(message_id.clone())));
        }

        match processed {
            Ok(()) => {}
            Err(EngineError::StepRejected { step: rejected, reason }) => {
                self.complete(&mut conversation, &message_id).await?;
                info!(user = %user.platform_id, step = %rejected, %reason, "Step rejected input");
                self.bus
                    .publish(Event::StepRejected {
                        user: user.platform_id.clone(),
                        step: rejected.clone(),
                        reason: reason.clone(),
                    })
                    .await;
                return Ok(TurnOutcome::Rejected {
                    step: rejected,
                    reason,
                });
            }
            Err(e) => {
                // Replies already went out; keep them in the log
                if replied {
                    self.save(&mut conversation).await?;
                }
                return Err(e);
            }
        }

        conversation.advance_to(&step.name);
        if let Some(status) = requested_status {
            conversation.set_status(status);
        }
        self.complete(&mut conversation, &message_id).await?;

        info!(
            user = %user.platform_id,
            from = %from,
            to = %step.name,
            status = %conversation.status,
            "Step entered"
        );

        let event = match story {
            Some(story) => Event::StoryStarted {
                user: user.platform_id.clone(),
                story: story.name.clone(),
                step: step.name.clone(),
            },
            None => Event::StepAdvanced {
                user: user.platform_id.clone(),
                from: from.clone(),
                to: step.name.clone(),
            },
        };
        self.bus.publish(event).await;

        if conversation.is_over() {
            self.bus
                .publish(Event::ConversationClosed {
                    user: user.platform_id.clone(),
                    conversation_id,
                })
                .await;
        }

        Ok(TurnOutcome::Advanced {
            from,
            to: step.name.clone(),
            status: conversation.status,
        })
    }

    /// Give a conversation held by a human operator back to the engine
    ///
    /// The conversation resumes where it was, or ends when `close` is set.
    /// Returns `false` if the user's latest conversation is not in
    /// [`ConversationStatus::HumanIntervention`].
    pub async fn release(&self, platform_id: &str, close: bool) -> Result<bool, EngineError> {
        let _guard = self.locks.lock(platform_id).await;

        let Some(user) = self
            .bounded("find user", self.repository.find_user(platform_id))
            .await?
        else {
            return Ok(false);
        };
        let Some(mut conversation) = self
            .bounded(
                "find latest conversation",
                self.repository.find_latest_conversation(&user),
            )
            .await?
        else {
            return Ok(false);
        };

        if conversation.status != ConversationStatus::HumanIntervention {
            debug!(user = %platform_id, status = %conversation.status, "Nothing to release");
            return Ok(false);
        }

        conversation.set_status(if close {
            ConversationStatus::Over
        } else {
            ConversationStatus::Ongoing
        });
        self.save(&mut conversation).await?;

        info!(user = %platform_id, closed = close, step = %conversation.current_step, "Conversation released");
        self.bus
            .publish(Event::ConversationReleased {
                user: platform_id.to_string(),
                conversation_id: conversation.id.clone().unwrap_or_default(),
                closed: close,
            })
            .await;
        Ok(true)
    }

    async fn resolve_user(&self, platform_id: &str) -> Result<User, EngineError> {
        if let Some(user) = self
            .bounded("find user", self.repository.find_user(platform_id))
            .await?
        {
            return Ok(user);
        }

        let user = User::new(platform_id);
        match self
            .bounded("insert user", self.repository.insert_user(&user))
            .await
        {
            Ok(()) => {
                info!(user = %platform_id, "Created user");
                Ok(user)
            }
            Err(EngineError::DuplicateUser(_)) => {
                // Created concurrently elsewhere: use the stored one
                self.bounded("find user", self.repository.find_user(platform_id))
                    .await?
                    .ok_or_else(|| {
                        EngineError::Persistence(format!(
                            "User '{}' reported as duplicate but not found",
                            platform_id
                        ))
                    })
            }
            Err(e) => Err(e),
        }
    }

    fn resume_or_start(&self, user: &User, latest: Option<Conversation>) -> Conversation {
        match latest {
            Some(conversation) if !conversation.is_over() => conversation,
            Some(_) => {
                debug!(user = %user.platform_id, "Latest conversation is over, starting a new one");
                Conversation::start(user)
            }
            None => Conversation::start(user),
        }
    }

    fn parse(&self, inbound: &InboundMessage) -> Option<ParsedData> {
        let raw = inbound.nlu.as_deref()?;
        match self.parser.parse(raw) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(user = %inbound.sender_id, "Ignoring NLU payload: {}", e);
                None
            }
        }
    }

    /// Mark the turn of `message_id` as done and persist
    async fn complete(
        &self,
        conversation: &mut Conversation,
        message_id: &str,
    ) -> Result<(), EngineError> {
        conversation.mark_handled(message_id);
        self.save(conversation).await
    }

    async fn save(&self, conversation: &mut Conversation) -> Result<(), EngineError> {
        self.bounded(
            "save conversation",
            self.repository.save_conversation(conversation),
        )
        .await
    }

    async fn bounded<T, F>(&self, operation: &str, future: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                operation: operation.to_string(),
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}
