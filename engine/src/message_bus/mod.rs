//! Message Bus for turn events
//!
//! The orchestrator publishes what happened during each turn (story started,
//! step advanced, no match, failure) and any number of observers subscribe
//! without the orchestrator knowing about them. Channels are bounded; a
//! subscriber that falls behind loses events instead of stalling turns.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    /// An inbound message was logged
    TurnReceived,
    /// A conversation entered a story's starting step
    StoryStarted,
    /// A conversation moved to a next step
    StepAdvanced,
    /// No starting step matched
    CannotStartStory,
    /// No next step matched
    CannotProgress,
    /// A step refused the user's input
    StepRejected,
    /// A turn ended with an error
    TurnFailed,
    /// A step handler closed the conversation
    ConversationClosed,
    /// An operator gave a conversation back to the engine
    ConversationReleased,
    /// Subscribe to all event types
    All,
}

/// Events that can be published on the message bus
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TurnReceived {
        user: String,
        conversation_id: String,
        has_nlu: bool,
    },
    StoryStarted {
        user: String,
        story: String,
        step: String,
    },
    StepAdvanced {
        user: String,
        from: String,
        to: String,
    },
    CannotStartStory {
        user: String,
    },
    CannotProgress {
        user: String,
        step: String,
    },
    StepRejected {
        user: String,
        step: String,
        reason: String,
    },
    TurnFailed {
        user: String,
        kind: String,
        error: String,
    },
    ConversationClosed {
        user: String,
        conversation_id: String,
    },
    ConversationReleased {
        user: String,
        conversation_id: String,
        closed: bool,
    },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::TurnReceived { .. } => EventType::TurnReceived,
            Event::StoryStarted { .. } => EventType::StoryStarted,
            Event::StepAdvanced { .. } => EventType::StepAdvanced,
            Event::CannotStartStory { .. } => EventType::CannotStartStory,
            Event::CannotProgress { .. } => EventType::CannotProgress,
            Event::StepRejected { .. } => EventType::StepRejected,
            Event::TurnFailed { .. } => EventType::TurnFailed,
            Event::ConversationClosed { .. } => EventType::ConversationClosed,
            Event::ConversationReleased { .. } => EventType::ConversationReleased,
        }
    }
}

/// Message bus for pub/sub communication between components
pub struct MessageBus {
    /// Each subscriber gets a bounded channel with CHANNEL_BUFFER_SIZE capacity
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    /// Create a new MessageBus
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type, or `EventType::All`
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to subscribers of its type and of `EventType::All`
    ///
    /// Never waits on a subscriber: full channels drop the event and closed
    /// channels are pruned.
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!("Subscriber channel full, dropping {:?}", event_type);
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
    }

    /// Number of live subscriptions, across all event types
    pub async fn subscriber_count(&self) -> usize {
        self.channels.lock().await.values().map(Vec::len).sum()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe(EventType::StoryStarted).await;

        bus.publish(Event::StoryStarted {
            user: "psid-1".to_string(),
            story: "Book a table".to_string(),
            step: "book_table_entrypoint".to_string(),
        })
        .await;

        match rx.recv().await.unwrap() {
            Event::StoryStarted { user, step, .. } => {
                assert_eq!(user, "psid-1");
                assert_eq!(step, "book_table_entrypoint");
            }
            _ => panic!("Wrong event type received"),
        }
    }

    #[tokio::test]
    async fn test_all_event_type() {
        let bus = MessageBus::new();
        let mut rx_all = bus.subscribe(EventType::All).await;
        let mut rx_specific = bus.subscribe(EventType::CannotStartStory).await;

        let event = Event::CannotStartStory {
            user: "psid-2".to_string(),
        };
        bus.publish(event.clone()).await;

        assert_eq!(rx_all.recv().await.unwrap(), event);
        assert_eq!(rx_specific.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_different_event_types() {
        let bus = MessageBus::new();
        let mut rx_advanced = bus.subscribe(EventType::StepAdvanced).await;
        let mut rx_failed = bus.subscribe(EventType::TurnFailed).await;

        bus.publish(Event::StepAdvanced {
            user: "psid-3".to_string(),
            from: "a".to_string(),
            to: "b".to_string(),
        })
        .await;

        assert!(rx_advanced.recv().await.is_some());
        assert!(rx_failed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_channel_does_not_block() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe(EventType::CannotStartStory).await;

        for i in 0..CHANNEL_BUFFER_SIZE + 10 {
            bus.publish(Event::CannotStartStory {
                user: format!("psid-{}", i),
            })
            .await;
        }

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, CHANNEL_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let bus = MessageBus::new();
        let rx = bus.subscribe(EventType::TurnFailed).await;
        assert_eq!(bus.subscriber_count().await, 1);

        drop(rx);
        bus.publish(Event::TurnFailed {
            user: "psid-4".to_string(),
            kind: "timeout".to_string(),
            error: "timed out".to_string(),
        })
        .await;

        assert_eq!(bus.subscriber_count().await, 0);
    }
}
