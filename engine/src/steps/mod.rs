//! Step side-effects
//!
//! Every catalog step has a [`StepHandler`] that runs when a conversation
//! enters it. Handlers see the step, the understanding data and the user, may
//! reply through the outbound [`MessageSender`], and may ask for the
//! conversation to be closed or handed to a human. A handler error keeps the
//! conversation on its previous step. Input the handler refuses is reported
//! as [`EngineError::StepRejected`], which ends the turn normally.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use sdk::{EngineError, MessageSender, ParsedData};

use crate::conversation::{ConversationStatus, User};
use crate::story::{Step, StoryCatalog};

pub mod booking;

/// Business logic attached to a step
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn process(&self, ctx: &mut StepContext<'_>) -> Result<(), EngineError>;
}

/// What a handler sees and what it asks for
pub struct StepContext<'a> {
    step: &'a Step,
    data: &'a ParsedData,
    user: &'a User,
    sender: &'a dyn MessageSender,
    replies: Vec<String>,
    status: Option<ConversationStatus>,
}

impl<'a> StepContext<'a> {
    pub fn new(
        step: &'a Step,
        data: &'a ParsedData,
        user: &'a User,
        sender: &'a dyn MessageSender,
    ) -> Self {
        Self {
            step,
            data,
            user,
            sender,
            replies: Vec::new(),
            status: None,
        }
    }

    pub fn step(&self) -> &Step {
        self.step
    }

    pub fn data(&self) -> &ParsedData {
        self.data
    }

    pub fn user(&self) -> &User {
        self.user
    }

    /// Send `text` to the user and record it for the message log
    pub async fn reply(&mut self, text: impl Into<String>) -> Result<(), EngineError> {
        let text = text.into();
        self.sender
            .send_text(&self.user.platform_id, &text)
            .await
            .map_err(|e| EngineError::side_effect(&self.step.name, e.to_string()))?;
        self.replies.push(text);
        Ok(())
    }

    /// End the conversation once this step is persisted
    pub fn close(&mut self) {
        self.status = Some(ConversationStatus::Over);
    }

    /// Hand the conversation to a human operator
    pub fn hand_over(&mut self) {
        self.status = Some(ConversationStatus::HumanIntervention);
    }

    /// Replies sent and status requested, in that order
    pub fn into_outcome(self) -> (Vec<String>, Option<ConversationStatus>) {
        (self.replies, self.status)
    }
}

/// Step name to handler map, built explicitly and handed to the orchestrator
#[derive(Default, Clone)]
pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the table-booking handlers
    pub fn booking() -> Self {
        let mut registry = Self::new();
        booking::register(&mut registry);
        registry
    }

    pub fn register(&mut self, step: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(step.into(), handler);
    }

    pub fn get(&self, step: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step).cloned()
    }

    pub fn contains(&self, step: &str) -> bool {
        self.handlers.contains_key(step)
    }

    /// Every catalog step must have a handler
    pub fn ensure_covers(&self, catalog: &StoryCatalog) -> Result<(), EngineError> {
        match catalog.step_names().find(|name| !self.contains(name)) {
            Some(missing) => Err(EngineError::MissingStepHandler(missing.to_string())),
            None => Ok(()),
        }
    }
}
