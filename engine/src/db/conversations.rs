/// Conversation persistence operations
///
/// Users, conversations and messages are stored in three tables. Messages are
/// kept as tagged JSON so the `User`/`Bot` variant and nested entity values
/// come back exactly as saved. All queries are parameterized.
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use sdk::EngineError;

use crate::conversation::{Conversation, ConversationRepository, Message, User};

/// SQLite-backed [`ConversationRepository`]
#[derive(Clone)]
pub struct SqliteConversationRepository {
    pool: SqlitePool,
}

fn persistence(context: &'static str) -> impl FnOnce(sqlx::Error) -> EngineError {
    move |e| EngineError::Persistence(format!("{}: {}", context, e))
}

/// Fixed-width RFC 3339 so text order is time order
fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(value: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::Persistence(format!("Invalid timestamp '{}': {}", value, e)))
}

impl SqliteConversationRepository {
    /// Create a new conversation repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_conversation(&self, row: SqliteRow) -> Result<Conversation, EngineError> {
        let id: String = row.get("id");

        let message_rows = sqlx::query(
            "SELECT message_type, payload FROM messages WHERE conversation_id = ? ORDER BY position ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence("Failed to fetch messages"))?;

        let mut messages = Vec::with_capacity(message_rows.len());
        for r in message_rows {
            let message_type: String = r.get("message_type");
            let payload: String = r.get("payload");
            let message: Message = serde_json::from_str(&payload).map_err(|e| {
                EngineError::Persistence(format!("Corrupt message in conversation {}: {}", id, e))
            })?;
            if message.kind() != message_type {
                return Err(EngineError::Persistence(format!(
                    "Message type mismatch in conversation {}: column says '{}', payload says '{}'",
                    id,
                    message_type,
                    message.kind()
                )));
            }
            messages.push(message);
        }

        Ok(Conversation {
            user_id: row.get("user_id"),
            status: row.get::<String, _>("status").parse()?,
            current_step: row.get("current_step"),
            messages,
            handled_through: row.get("handled_through"),
            created_at: decode_time(&row.get::<String, _>("created_at"))?,
            updated_at: decode_time(&row.get::<String, _>("updated_at"))?,
            id: Some(id),
        })
    }
}

#[async_trait]
impl ConversationRepository for SqliteConversationRepository {
    async fn find_latest_conversation(
        &self,
        user: &User,
    ) -> Result<Option<Conversation>, EngineError> {
        let row = sqlx::query(
            "SELECT id, user_id, status, current_step, handled_through, created_at, updated_at FROM conversations \
             WHERE user_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(&user.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(persistence("Failed to fetch latest conversation"))?;

        match row {
            Some(row) => Ok(Some(self.load_conversation(row).await?)),
            None => {
                tracing::debug!("No conversation found for user {}", user.platform_id);
                Ok(None)
            }
        }
    }

    async fn find_conversations(&self, user: &User) -> Result<Vec<Conversation>, EngineError> {
        let rows = sqlx::query(
            "SELECT id, user_id, status, current_step, handled_through, created_at, updated_at FROM conversations \
             WHERE user_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(&user.id)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence("Failed to fetch conversations"))?;

        let mut conversations = Vec::with_capacity(rows.len());
        for row in rows {
            conversations.push(self.load_conversation(row).await?);
        }
        Ok(conversations)
    }

    async fn save_conversation(&self, conversation: &mut Conversation) -> Result<(), EngineError> {
        let updated_at = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(persistence("Failed to begin transaction"))?;

        let id = match conversation.id.clone() {
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO conversations (id, user_id, status, current_step, handled_through, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&id)
                .bind(&conversation.user_id)
                .bind(conversation.status.as_str())
                .bind(&conversation.current_step)
                .bind(&conversation.handled_through)
                .bind(encode_time(&conversation.created_at))
                .bind(encode_time(&updated_at))
                .execute(&mut *tx)
                .await
                .map_err(persistence("Failed to insert conversation"))?;

                tracing::debug!("Inserted conversation {}", id);
                id
            }
            Some(id) => {
                let result = sqlx::query(
                    "UPDATE conversations SET status = ?, current_step = ?, handled_through = ?, updated_at = ? \
                     WHERE id = ?",
                )
                .bind(conversation.status.as_str())
                .bind(&conversation.current_step)
                .bind(&conversation.handled_through)
                .bind(encode_time(&updated_at))
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(persistence("Failed to update conversation"))?;

                if result.rows_affected() == 0 {
                    return Err(EngineError::Persistence(format!(
                        "Conversation '{}' does not exist",
                        id
                    )));
                }

                tracing::debug!("Updated conversation {}", id);
                id
            }
        };

        // The log is append-only: positions already stored are left alone
        for (position, message) in conversation.messages.iter().enumerate() {
            let payload = serde_json::to_string(message).map_err(|e| {
                EngineError::Persistence(format!("Failed to encode message: {}", e))
            })?;

            sqlx::query(
                "INSERT OR IGNORE INTO messages (conversation_id, position, message_id, message_type, payload) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(position as i64)
            .bind(message.id())
            .bind(message.kind())
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(persistence("Failed to append message"))?;
        }

        tx.commit()
            .await
            .map_err(persistence("Failed to commit conversation"))?;

        conversation.id = Some(id);
        conversation.updated_at = updated_at;
        Ok(())
    }

    async fn find_user(&self, platform_id: &str) -> Result<Option<User>, EngineError> {
        let row = sqlx::query("SELECT id, platform_id, created_at FROM users WHERE platform_id = ?")
            .bind(platform_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence("Failed to fetch user"))?;

        row.map(|r| {
            Ok(User {
                id: r.get("id"),
                platform_id: r.get("platform_id"),
                created_at: decode_time(&r.get::<String, _>("created_at"))?,
            })
        })
        .transpose()
    }

    async fn insert_user(&self, user: &User) -> Result<(), EngineError> {
        sqlx::query("INSERT INTO users (id, platform_id, created_at) VALUES (?, ?, ?)")
            .bind(&user.id)
            .bind(&user.platform_id)
            .bind(encode_time(&user.created_at))
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    EngineError::DuplicateUser(user.platform_id.clone())
                }
                _ => EngineError::Persistence(format!("Failed to insert user: {}", e)),
            })?;

        tracing::debug!("Inserted user {}", user.platform_id);
        Ok(())
    }
}
