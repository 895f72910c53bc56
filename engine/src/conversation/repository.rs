//! Conversation persistence contract
//!
//! "Not found" is `Ok(None)`; every other failure is an [`EngineError`] the
//! caller must see. The SQLite implementation lives in [`crate::db`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use sdk::EngineError;

use super::{Conversation, User};

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Most recently created conversation of `user`
    async fn find_latest_conversation(
        &self,
        user: &User,
    ) -> Result<Option<Conversation>, EngineError>;

    /// Every conversation of `user`, oldest first
    async fn find_conversations(&self, user: &User) -> Result<Vec<Conversation>, EngineError>;

    /// Insert when `conversation.id` is unset, update by id otherwise
    ///
    /// Assigns the id on insert and refreshes `updated_at` in both cases.
    async fn save_conversation(&self, conversation: &mut Conversation) -> Result<(), EngineError>;

    async fn find_user(&self, platform_id: &str) -> Result<Option<User>, EngineError>;

    /// Fails with [`EngineError::DuplicateUser`] if the platform id is taken
    async fn insert_user(&self, user: &User) -> Result<(), EngineError>;
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, User>,
    conversations: Vec<Conversation>,
}

/// Repository backed by process memory, used for offline simulation and tests
#[derive(Default)]
pub struct InMemoryConversationRepository {
    state: Mutex<MemoryState>,
}

impl InMemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn find_latest_conversation(
        &self,
        user: &User,
    ) -> Result<Option<Conversation>, EngineError> {
        let state = self.state.lock().await;
        Ok(state
            .conversations
            .iter()
            .filter(|c| c.user_id == user.id)
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn find_conversations(&self, user: &User) -> Result<Vec<Conversation>, EngineError> {
        let state = self.state.lock().await;
        let mut conversations: Vec<Conversation> = state
            .conversations
            .iter()
            .filter(|c| c.user_id == user.id)
            .cloned()
            .collect();
        conversations.sort_by_key(|c| c.created_at);
        Ok(conversations)
    }

    async fn save_conversation(&self, conversation: &mut Conversation) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        conversation.updated_at = Utc::now();

        match conversation.id.clone() {
            None => {
                conversation.id = Some(Uuid::new_v4().to_string());
                state.conversations.push(conversation.clone());
            }
            Some(id) => {
                let stored = state
                    .conversations
                    .iter_mut()
                    .find(|c| c.id.as_deref() == Some(id.as_str()))
                    .ok_or_else(|| {
                        EngineError::Persistence(format!("Conversation '{}' does not exist", id))
                    })?;
                *stored = conversation.clone();
            }
        }

        Ok(())
    }

    async fn find_user(&self, platform_id: &str) -> Result<Option<User>, EngineError> {
        let state = self.state.lock().await;
        Ok(state.users.get(platform_id).cloned())
    }

    async fn insert_user(&self, user: &User) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.users.contains_key(&user.platform_id) {
            return Err(EngineError::DuplicateUser(user.platform_id.clone()));
        }
        state.users.insert(user.platform_id.clone(), user.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationStatus, Message};

    #[tokio::test]
    async fn test_insert_assigns_id_and_update_keeps_it() {
        let repo = InMemoryConversationRepository::new();
        let user = User::new("psid-1");
        let mut conversation = Conversation::start(&user);

        repo.save_conversation(&mut conversation).await.unwrap();
        let id = conversation.id.clone().unwrap();

        conversation.add_message(Message::user("hi", &user, Utc::now(), None));
        repo.save_conversation(&mut conversation).await.unwrap();

        assert_eq!(conversation.id.as_deref(), Some(id.as_str()));
        let latest = repo.find_latest_conversation(&user).await.unwrap().unwrap();
        assert_eq!(latest, conversation);
        assert_eq!(repo.find_conversations(&user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_is_most_recently_created() {
        let repo = InMemoryConversationRepository::new();
        let user = User::new("psid-1");

        let mut first = Conversation::start(&user);
        first.set_status(ConversationStatus::Over);
        repo.save_conversation(&mut first).await.unwrap();

        let mut second = Conversation::start(&user);
        repo.save_conversation(&mut second).await.unwrap();

        let latest = repo.find_latest_conversation(&user).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
    }

    #[tokio::test]
    async fn test_unknown_user_has_no_conversation() {
        let repo = InMemoryConversationRepository::new();
        let user = User::new("nobody");
        assert!(repo.find_latest_conversation(&user).await.unwrap().is_none());
        assert!(repo.find_user("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_user_rejected() {
        let repo = InMemoryConversationRepository::new();
        repo.insert_user(&User::new("psid-1")).await.unwrap();

        let err = repo.insert_user(&User::new("psid-1")).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateUser(_)));
    }

    #[tokio::test]
    async fn test_update_of_unknown_id_fails() {
        let repo = InMemoryConversationRepository::new();
        let mut conversation = Conversation::start(&User::new("psid-1"));
        conversation.id = Some("missing".to_string());

        assert!(matches!(
            repo.save_conversation(&mut conversation).await,
            Err(EngineError::Persistence(_))
        ));
    }
}
