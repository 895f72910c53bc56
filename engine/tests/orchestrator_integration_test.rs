/// Integration tests for the conversation orchestrator
///
/// Tests complete turns over the in-memory repository:
/// - First-match story selection across a catalog
/// - Restarting after a conversation is over
/// - Logging the inbound message when nothing can be entered
/// - Side-effect failures and timeouts leave the step untouched
/// - Operators handing conversations back to the engine
/// - Concurrent turns of one user stay consistent
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;

use sdk::{EngineError, MessageSender, StorylineErrorExt};
use storyline_engine::conversation::{
    Conversation, ConversationRepository, ConversationStatus, InMemoryConversationRepository,
    Message, User,
};
use storyline_engine::message_bus::{Event, EventType, MessageBus};
use storyline_engine::nlu::WitParser;
use storyline_engine::orchestrator::{InboundMessage, Orchestrator, TurnOutcome};
use storyline_engine::steps::{StepContext, StepHandler, StepRegistry};
use storyline_engine::story::{InMemoryStoryRepository, Step, Story, StoryCatalog};

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl MessageSender for Outbox {
    async fn send_text(&self, user_external_id: &str, text: &str) -> Result<(), EngineError> {
        self.sent
            .lock()
            .await
            .push((user_external_id.to_string(), text.to_string()));
        Ok(())
    }
}

/// Replies with the step name
struct Echo;

#[async_trait]
impl StepHandler for Echo {
    async fn process(&self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        let name = ctx.step().name.clone();
        ctx.reply(format!("entered {}", name)).await
    }
}

struct Failing;

#[async_trait]
impl StepHandler for Failing {
    async fn process(&self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        Err(EngineError::side_effect(&ctx.step().name, "calendar unavailable"))
    }
}

struct Slow;

#[async_trait]
impl StepHandler for Slow {
    async fn process(&self, _ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }
}

fn intent(name: &str) -> String {
    format!(r#"{{"intent": [{{"confidence": 0.9, "value": "{}"}}]}}"#, name)
}

fn persons(count: i64) -> String {
    format!(r#"{{"nb_persons": [{{"confidence": 0.9, "value": {}}}]}}"#, count)
}

const DATE: &str = r#"{"booking_date": [{"confidence": 0.9, "value": "2024-06-01T20:00:00.000+02:00", "grain": "hour"}]}"#;

fn registry(handler: Arc<dyn StepHandler>, catalog: &StoryCatalog) -> StepRegistry {
    let mut steps = StepRegistry::new();
    for name in catalog.step_names() {
        steps.register(name, Arc::clone(&handler));
    }
    steps
}

async fn booking_orchestrator() -> (
    Orchestrator,
    Arc<InMemoryConversationRepository>,
    Arc<Outbox>,
) {
    let catalog = StoryCatalog::load(&InMemoryStoryRepository::book_table())
        .await
        .unwrap();
    let repository = Arc::new(InMemoryConversationRepository::new());
    let outbox = Arc::new(Outbox::default());

    let orchestrator = Orchestrator::new(
        Arc::new(catalog),
        Arc::clone(&repository) as Arc<dyn ConversationRepository>,
        Arc::new(WitParser::default()),
        StepRegistry::booking(),
        Arc::clone(&outbox) as Arc<dyn MessageSender>,
    )
    .unwrap();

    (orchestrator, repository, outbox)
}

async fn custom_orchestrator(
    stories: Vec<Story>,
    handler: Arc<dyn StepHandler>,
) -> (Orchestrator, Arc<InMemoryConversationRepository>) {
    let catalog = StoryCatalog::new(stories).unwrap();
    let steps = registry(handler, &catalog);
    let repository = Arc::new(InMemoryConversationRepository::new());

    let orchestrator = Orchestrator::new(
        Arc::new(catalog),
        Arc::clone(&repository) as Arc<dyn ConversationRepository>,
        Arc::new(WitParser::default()),
        steps,
        Arc::new(Outbox::default()),
    )
    .unwrap();

    (orchestrator, repository)
}

async fn latest(repository: &InMemoryConversationRepository, platform_id: &str) -> Conversation {
    let user = repository.find_user(platform_id).await.unwrap().unwrap();
    repository
        .find_latest_conversation(&user)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_first_matching_story_wins() {
    let stories = vec![
        Story::new(
            "Greet politely",
            vec![Step::new("polite_hello").requires_intent("greet")],
        ),
        Story::new(
            "Greet casually",
            vec![Step::new("casual_hello").requires_intent("greet")],
        ),
    ];
    let (orchestrator, repository) = custom_orchestrator(stories, Arc::new(Echo)).await;

    for user in ["psid-1", "psid-2", "psid-3"] {
        let outcome = orchestrator
            .handle_message(InboundMessage::new(user, "hi").with_nlu(intent("greet")))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TurnOutcome::Advanced {
                from: String::new(),
                to: "polite_hello".to_string(),
                status: ConversationStatus::Ongoing,
            }
        );
        assert_eq!(latest(&repository, user).await.current_step, "polite_hello");
    }
}

#[tokio::test]
async fn test_full_booking_then_restart() {
    let (orchestrator, repository, outbox) = booking_orchestrator().await;

    orchestrator
        .handle_message(InboundMessage::new("psid-1", "book a table").with_nlu(intent("book_table")))
        .await
        .unwrap();

    let outcome = orchestrator
        .handle_message(InboundMessage::new("psid-1", "tomorrow 8pm").with_nlu(DATE))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Advanced {
            from: "book_table_entrypoint".to_string(),
            to: "book_table_get_time".to_string(),
            status: ConversationStatus::Over,
        }
    );

    // Over: the next message opens a fresh conversation
    orchestrator
        .handle_message(InboundMessage::new("psid-1", "again").with_nlu(intent("book_table")))
        .await
        .unwrap();

    let user = repository.find_user("psid-1").await.unwrap().unwrap();
    let conversations = repository.find_conversations(&user).await.unwrap();
    assert_eq!(conversations.len(), 2);
    assert_eq!(conversations[0].status, ConversationStatus::Over);
    assert_eq!(conversations[0].messages.len(), 4);
    assert_eq!(conversations[1].status, ConversationStatus::Ongoing);
    assert_eq!(conversations[1].current_step, "book_table_entrypoint");

    assert_eq!(outbox.sent.lock().await.len(), 3);
}

#[tokio::test]
async fn test_party_size_closes_booking() {
    let (orchestrator, repository, _outbox) = booking_orchestrator().await;

    orchestrator
        .handle_message(InboundMessage::new("psid-1", "book").with_nlu(intent("book_table")))
        .await
        .unwrap();
    let outcome = orchestrator
        .handle_message(InboundMessage::new("psid-1", "4 people").with_nlu(persons(4)))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        TurnOutcome::Advanced { status: ConversationStatus::Over, .. }
    ));

    // Nobody has to step in for the user to be served again
    let outcome = orchestrator
        .handle_message(InboundMessage::new("psid-1", "book").with_nlu(intent("book_table")))
        .await
        .unwrap();
    assert!(matches!(outcome, TurnOutcome::Advanced { ref from, .. } if from.is_empty()));
    assert_eq!(
        latest(&repository, "psid-1").await.status,
        ConversationStatus::Ongoing
    );
}

/// Leaves the conversation to an operator
struct HandOver;

#[async_trait]
impl StepHandler for HandOver {
    async fn process(&self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        ctx.reply("Someone from the team will take it from here").await?;
        ctx.hand_over();
        Ok(())
    }
}

#[tokio::test]
async fn test_operator_hands_conversation_back() {
    let catalog = StoryCatalog::load(&InMemoryStoryRepository::book_table())
        .await
        .unwrap();
    let mut steps = StepRegistry::booking();
    steps.register(storyline_engine::steps::booking::ENTRYPOINT, Arc::new(HandOver));
    let repository = Arc::new(InMemoryConversationRepository::new());
    let orchestrator = Orchestrator::new(
        Arc::new(catalog),
        Arc::clone(&repository) as Arc<dyn ConversationRepository>,
        Arc::new(WitParser::default()),
        steps,
        Arc::new(Outbox::default()),
    )
    .unwrap();

    orchestrator
        .handle_message(InboundMessage::new("psid-1", "book").with_nlu(intent("book_table")))
        .await
        .unwrap();
    let outcome = orchestrator
        .handle_message(InboundMessage::new("psid-1", "4 people").with_nlu(persons(4)))
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::HumanOwned);

    let conversation = latest(&repository, "psid-1").await;
    assert_eq!(conversation.status, ConversationStatus::HumanIntervention);
    assert_eq!(conversation.last_message().map(Message::text), Some("4 people"));

    let mut released = orchestrator.bus().subscribe(EventType::ConversationReleased).await;
    assert!(orchestrator.release("psid-1", false).await.unwrap());
    assert!(matches!(
        released.recv().await,
        Some(Event::ConversationReleased { closed: false, .. })
    ));

    // The same answer now moves the story on
    let outcome = orchestrator
        .handle_message(InboundMessage::new("psid-1", "4 people").with_nlu(persons(4)))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Advanced {
            from: "book_table_entrypoint".to_string(),
            to: "book_table_get_nb_persons".to_string(),
            status: ConversationStatus::Over,
        }
    );
}

#[tokio::test]
async fn test_unmatched_message_is_still_logged() {
    let (orchestrator, repository, outbox) = booking_orchestrator().await;

    let outcome = orchestrator
        .handle_message(InboundMessage::new("psid-1", "what's the weather").with_nlu(intent("weather")))
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::CannotStartStory);

    orchestrator
        .handle_message(InboundMessage::new("psid-1", "book").with_nlu(intent("book_table")))
        .await
        .unwrap();

    let outcome = orchestrator
        .handle_message(InboundMessage::new("psid-1", "blue").with_nlu(intent("colour")))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::CannotProgress {
            step: "book_table_entrypoint".to_string()
        }
    );

    let conversation = latest(&repository, "psid-1").await;
    let texts: Vec<&str> = conversation.messages.iter().map(Message::text).collect();
    assert_eq!(texts.len(), 4);
    assert_eq!(texts[0], "what's the weather");
    assert_eq!(texts[3], "blue");
    assert_eq!(conversation.current_step, "book_table_entrypoint");

    // Only the entrypoint replied
    assert_eq!(outbox.sent.lock().await.len(), 1);
}

#[tokio::test]
async fn test_message_without_understanding() {
    let (orchestrator, repository, _outbox) = booking_orchestrator().await;

    let outcome = orchestrator
        .handle_message(InboundMessage::new("psid-1", "👍"))
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::NoUnderstanding);

    let outcome = orchestrator
        .handle_message(InboundMessage::new("psid-1", "garbled").with_nlu("not json"))
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::NoUnderstanding);

    let conversation = latest(&repository, "psid-1").await;
    assert_eq!(conversation.messages.len(), 2);
    assert!(!conversation.has_started_story());
}

#[tokio::test]
async fn test_failing_side_effect_keeps_step() {
    let stories = vec![Story::new(
        "Book",
        vec![Step::new("entry").requires_intent("book_table")],
    )];
    let (orchestrator, repository) = custom_orchestrator(stories, Arc::new(Failing)).await;

    let bus = Arc::new(MessageBus::new());
    let orchestrator = orchestrator.with_bus(Arc::clone(&bus));
    let mut failures = bus.subscribe(EventType::TurnFailed).await;

    let err = orchestrator
        .handle_message(InboundMessage::new("psid-1", "book").with_nlu(intent("book_table")))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SideEffect { .. }));
    assert!(err.is_recoverable());

    let conversation = latest(&repository, "psid-1").await;
    assert_eq!(conversation.messages.len(), 1);
    assert!(!conversation.has_started_story());

    match failures.recv().await.unwrap() {
        Event::TurnFailed { user, kind, .. } => {
            assert_eq!(user, "psid-1");
            assert_eq!(kind, "side_effect_failure");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_slow_side_effect_times_out() {
    let stories = vec![Story::new(
        "Book",
        vec![Step::new("entry").requires_intent("book_table")],
    )];
    let (orchestrator, repository) = custom_orchestrator(stories, Arc::new(Slow)).await;
    let orchestrator = orchestrator.with_timeout(Duration::from_millis(50));

    let err = orchestrator
        .handle_message(InboundMessage::new("psid-1", "book").with_nlu(intent("book_table")))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout { .. }));

    let conversation = latest(&repository, "psid-1").await;
    assert_eq!(conversation.current_step, "");
}

#[tokio::test]
async fn test_dangling_current_step_is_inconsistency() {
    let (orchestrator, repository, _outbox) = booking_orchestrator().await;

    let user = User::new("psid-1");
    repository.insert_user(&user).await.unwrap();
    let mut conversation = Conversation::start(&user);
    conversation.advance_to("book_table_removed_step");
    repository.save_conversation(&mut conversation).await.unwrap();

    let err = orchestrator
        .handle_message(InboundMessage::new("psid-1", "4").with_nlu(persons(4)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CatalogInconsistency(ref step) if step == "book_table_removed_step"));
    assert!(!err.is_recoverable());

    // The inbound message was persisted before the lookup failed
    let stored = latest(&repository, "psid-1").await;
    assert_eq!(stored.messages.len(), 1);
}

#[tokio::test]
async fn test_missing_handler_rejected_at_construction() {
    let catalog = StoryCatalog::load(&InMemoryStoryRepository::book_table())
        .await
        .unwrap();

    let result = Orchestrator::new(
        Arc::new(catalog),
        Arc::new(InMemoryConversationRepository::new()),
        Arc::new(WitParser::default()),
        StepRegistry::new(),
        Arc::new(Outbox::default()),
    );

    assert!(matches!(result, Err(EngineError::MissingStepHandler(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_turns_for_one_user() {
    let (orchestrator, repository, _outbox) = booking_orchestrator().await;
    let orchestrator = Arc::new(orchestrator);

    let turns = (0..20).map(|i| {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator
                .handle_message(InboundMessage::new("psid-1", format!("message {}", i)))
                .await
        })
    });

    for result in join_all(turns).await {
        assert_eq!(result.unwrap().unwrap(), TurnOutcome::NoUnderstanding);
    }

    let user = repository.find_user("psid-1").await.unwrap().unwrap();
    let conversations = repository.find_conversations(&user).await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].messages.len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_users_start_independently() {
    let (orchestrator, repository, outbox) = booking_orchestrator().await;
    let orchestrator = Arc::new(orchestrator);

    let turns = (0..10).map(|i| {
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            orchestrator
                .handle_message(
                    InboundMessage::new(format!("psid-{}", i), "book").with_nlu(intent("book_table")),
                )
                .await
        }
    });

    for result in join_all(turns).await {
        assert!(matches!(result.unwrap(), TurnOutcome::Advanced { .. }));
    }

    for i in 0..10 {
        let conversation = latest(&repository, &format!("psid-{}", i)).await;
        assert_eq!(conversation.current_step, "book_table_entrypoint");
    }
    assert_eq!(outbox.sent.lock().await.len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_turns_advance_once_from_same_step() {
    let (orchestrator, repository, _outbox) = booking_orchestrator().await;
    let orchestrator = Arc::new(orchestrator);

    orchestrator
        .handle_message(InboundMessage::new("psid-1", "book").with_nlu(intent("book_table")))
        .await
        .unwrap();

    // Both messages could leave the entrypoint on their own
    let racing = [
        InboundMessage::new("psid-1", "4 people").with_nlu(persons(4)),
        InboundMessage::new("psid-1", "tomorrow 8pm").with_nlu(DATE),
    ]
    .into_iter()
    .map(|message| {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.handle_message(message).await })
    });

    let outcomes: Vec<TurnOutcome> = join_all(racing)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let from_entrypoint = outcomes
        .iter()
        .filter(|outcome| {
            matches!(outcome, TurnOutcome::Advanced { from, .. } if from == "book_table_entrypoint")
        })
        .count();
    assert_eq!(from_entrypoint, 1, "outcomes: {:?}", outcomes);

    // Every inbound message was kept, across however many conversations
    let user = repository.find_user("psid-1").await.unwrap().unwrap();
    let conversations = repository.find_conversations(&user).await.unwrap();
    let user_messages = conversations
        .iter()
        .flat_map(|conversation| conversation.messages.iter())
        .filter(|message| matches!(message, Message::User(_)))
        .count();
    assert_eq!(user_messages, 3);
}
