//! End-to-end coverage for the sync engine over in-memory repositories and a
//! scripted message source: full batch runs, idempotent re-runs, the error
//! budget, cancellation, and incremental resume.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use threadline_core::classify::KeywordClassifier;
use threadline_core::domain::conversation::{ConversationId, ConversationKey, ConversationPriority};
use threadline_core::domain::customer::{CustomerId, PhoneMapping, SourceAccountId};
use threadline_core::domain::message::{ExternalIdMapping, Message, MessageDirection, MessageId};
use threadline_core::domain::sync::{SyncSessionId, SyncSessionStatus, SyncType};
use threadline_db::repositories::{
    ConversationRepository, CustomerRepository, InMemoryConversationRepository,
    InMemoryCustomerRepository, InMemoryMessageRepository, InMemorySyncSessionRepository,
    MessageRepository, RepositoryError, SyncSessionRepository,
};
use threadline_sync::{
    ConversationResolver, ConversationResolverConfig, DuplicateDetector, DuplicateDetectorConfig,
    ExternalMessage, IdentityResolver, MessageImporter, MessagePipeline, ResolutionPolicy,
    ScriptedMessageSource, SourceError, SyncError, SyncOptions, SyncOrchestrator,
    SyncOrchestratorConfig, SyncProgress,
};

/// Delegates to the in-memory repository but fails any import whose content
/// contains the poison marker, standing in for a store that rejects writes.
struct PoisonedMessageRepository {
    inner: Arc<InMemoryMessageRepository>,
    poison_marker: String,
}

#[async_trait]
impl MessageRepository for PoisonedMessageRepository {
    async fn find_by_id(&self, id: &MessageId) -> Result<Option<Message>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn find_mapped_message(
        &self,
        external_message_id: &str,
        account_id: &SourceAccountId,
    ) -> Result<Option<MessageId>, RepositoryError> {
        self.inner.find_mapped_message(external_message_id, account_id).await
    }

    async fn find_content_match(
        &self,
        phone: &str,
        content: &str,
        direction: MessageDirection,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<MessageId>, RepositoryError> {
        self.inner.find_content_match(phone, content, direction, window_start, window_end).await
    }

    async fn import(
        &self,
        message: Message,
        mapping: ExternalIdMapping,
        customer_id: &CustomerId,
        phone: &str,
    ) -> Result<(), RepositoryError> {
        if message.content.contains(&self.poison_marker) {
            return Err(RepositoryError::Decode("simulated write failure".to_string()));
        }
        self.inner.import(message, mapping, customer_id, phone).await
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, RepositoryError> {
        self.inner.list_for_conversation(conversation_id).await
    }

    async fn reassign_conversation(
        &self,
        from: &ConversationId,
        to: &ConversationId,
    ) -> Result<u64, RepositoryError> {
        self.inner.reassign_conversation(from, to).await
    }

    async fn find_phone_mapping(
        &self,
        account_id: &SourceAccountId,
        phone: &str,
    ) -> Result<Option<PhoneMapping>, RepositoryError> {
        self.inner.find_phone_mapping(account_id, phone).await
    }
}

struct Engine {
    customers: Arc<InMemoryCustomerRepository>,
    conversations: Arc<InMemoryConversationRepository>,
    messages: Arc<InMemoryMessageRepository>,
    sessions: Arc<InMemorySyncSessionRepository>,
    source: Arc<ScriptedMessageSource>,
    orchestrator: SyncOrchestrator,
}

fn build_engine(pages: Vec<Vec<ExternalMessage>>, config: SyncOrchestratorConfig) -> Engine {
    build_engine_with_poison(pages, config, None)
}

fn build_engine_with_poison(
    pages: Vec<Vec<ExternalMessage>>,
    config: SyncOrchestratorConfig,
    poison_marker: Option<&str>,
) -> Engine {
    let customers = Arc::new(InMemoryCustomerRepository::default());
    let conversations = Arc::new(InMemoryConversationRepository::default());
    let messages = Arc::new(InMemoryMessageRepository::default());
    let sessions = Arc::new(InMemorySyncSessionRepository::default());
    let source = Arc::new(ScriptedMessageSource::new(pages));
    let classifier = Arc::new(KeywordClassifier::default());

    let message_store: Arc<dyn MessageRepository> = match poison_marker {
        Some(marker) => Arc::new(PoisonedMessageRepository {
            inner: messages.clone(),
            poison_marker: marker.to_string(),
        }),
        None => messages.clone(),
    };

    let pipeline = Arc::new(MessagePipeline::new(
        DuplicateDetector::new(message_store.clone(), DuplicateDetectorConfig::default()),
        IdentityResolver::new(customers.clone()),
        ConversationResolver::new(
            conversations.clone(),
            message_store.clone(),
            classifier.clone(),
            ConversationResolverConfig::default(),
        ),
        MessageImporter::new(message_store, classifier),
        ResolutionPolicy::default(),
        "sms",
    ));

    let orchestrator =
        SyncOrchestrator::new(source.clone(), pipeline, sessions.clone(), config);

    Engine { customers, conversations, messages, sessions, source, orchestrator }
}

fn fast_config() -> SyncOrchestratorConfig {
    SyncOrchestratorConfig { page_delay_ms: 0, ..SyncOrchestratorConfig::default() }
}

fn account() -> SourceAccountId {
    SourceAccountId("acct-e2e".to_string())
}

fn inbound(external_id: &str, phone: &str, body: &str) -> ExternalMessage {
    ExternalMessage {
        external_id: external_id.to_string(),
        external_thread_id: None,
        phone_number: phone.to_string(),
        direction: MessageDirection::Inbound,
        body: body.to_string(),
        sent_at: Utc::now() - Duration::minutes(5),
        contact_name: None,
        contact_email: None,
        attachments: Vec::new(),
    }
}

async fn wait_terminal(engine: &Engine, session_id: &SyncSessionId) -> SyncProgress {
    for _ in 0..500 {
        let progress = engine
            .orchestrator
            .progress(session_id)
            .await
            .expect("progress lookup")
            .expect("session known");
        if progress.status.is_terminal() {
            return progress;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    panic!("session did not reach a terminal state");
}

#[tokio::test]
async fn two_page_feed_creates_customers_threads_and_completes() {
    let pages = vec![
        vec![inbound("ext-1", "+15551234567", "emergency, flooding in the basement")],
        vec![inbound("ext-2", "+15559876543", "need a quote for a new water heater")],
    ];
    let engine = build_engine(pages, fast_config());

    let session_id = engine
        .orchestrator
        .start_sync(
            account(),
            SyncOptions { sync_type: SyncType::Manual, ..SyncOptions::default() },
        )
        .await
        .expect("start sync");

    let progress = wait_terminal(&engine, &session_id).await;
    assert_eq!(progress.status, SyncSessionStatus::Completed);
    assert_eq!(progress.counters.messages_processed, 2);
    assert_eq!(progress.counters.customers_created, 2);
    assert_eq!(progress.counters.duplicates_skipped, 0);
    assert_eq!(progress.counters.errors_encountered, 0);

    let customers = engine.customers.list_active().await.expect("list customers");
    assert_eq!(customers.len(), 2);

    let mut priorities = Vec::new();
    for customer in &customers {
        let key = ConversationKey {
            customer_id: customer.id.clone(),
            phone_number: customer.primary_phone.clone(),
            platform: "sms".to_string(),
        };
        let conversation = engine
            .conversations
            .find_active_for_key(&key)
            .await
            .expect("conversation lookup")
            .expect("active conversation");
        priorities.push(conversation.priority);

        let owned =
            engine.messages.list_for_conversation(&conversation.id).await.expect("messages");
        assert_eq!(owned.len(), 1);
    }
    priorities.sort();
    assert_eq!(priorities, vec![ConversationPriority::Medium, ConversationPriority::Emergency]);

    // The emergency body also flags its message row.
    let flood_customer = customers
        .iter()
        .find(|customer| customer.primary_phone == "+15551234567")
        .expect("flood customer");
    let key = ConversationKey {
        customer_id: flood_customer.id.clone(),
        phone_number: "+15551234567".to_string(),
        platform: "sms".to_string(),
    };
    let conversation =
        engine.conversations.find_active_for_key(&key).await.expect("lookup").expect("exists");
    let flood_messages =
        engine.messages.list_for_conversation(&conversation.id).await.expect("messages");
    assert!(flood_messages[0].emergency);
}

#[tokio::test]
async fn rerunning_the_same_feed_is_idempotent() {
    let feed = vec![
        inbound("ext-10", "+15551310010", "message one"),
        inbound("ext-11", "+15551310011", "message two"),
        inbound("ext-12", "+15551310012", "message three"),
    ];
    let engine = build_engine(vec![feed.clone()], fast_config());

    let first = engine
        .orchestrator
        .start_sync(
            account(),
            SyncOptions { sync_type: SyncType::Manual, ..SyncOptions::default() },
        )
        .await
        .expect("first run");
    let first_progress = wait_terminal(&engine, &first).await;
    assert_eq!(first_progress.counters.messages_processed, 3);
    assert_eq!(first_progress.counters.duplicates_skipped, 0);

    let second = engine
        .orchestrator
        .start_sync(
            account(),
            SyncOptions { sync_type: SyncType::Manual, ..SyncOptions::default() },
        )
        .await
        .expect("second run");
    let second_progress = wait_terminal(&engine, &second).await;

    assert_eq!(second_progress.status, SyncSessionStatus::Completed);
    assert_eq!(second_progress.counters.messages_processed, 0);
    assert_eq!(second_progress.counters.duplicates_skipped, 3);

    // Still exactly one customer per number, one message per thread.
    let customers = engine.customers.list_active().await.expect("list");
    assert_eq!(customers.len(), 3);
    for customer in customers {
        let key = ConversationKey {
            customer_id: customer.id.clone(),
            phone_number: customer.primary_phone.clone(),
            platform: "sms".to_string(),
        };
        let conversation =
            engine.conversations.find_active_for_key(&key).await.expect("lookup").expect("one");
        let owned =
            engine.messages.list_for_conversation(&conversation.id).await.expect("messages");
        assert_eq!(owned.len(), 1);
    }
}

#[tokio::test]
async fn error_budget_exhaustion_fails_the_session() {
    let mut feed = vec![
        inbound("ok-1", "+15551320001", "fine"),
        inbound("ok-2", "+15551320002", "also fine"),
    ];
    for index in 0..6 {
        feed.push(inbound(
            &format!("bad-{index}"),
            &format!("+1555133{index:04}"),
            "poison payload",
        ));
    }
    let engine = build_engine_with_poison(vec![feed], fast_config(), Some("poison"));

    let session_id = engine
        .orchestrator
        .start_sync(
            account(),
            SyncOptions { sync_type: SyncType::Manual, ..SyncOptions::default() },
        )
        .await
        .expect("start");
    let progress = wait_terminal(&engine, &session_id).await;

    assert_eq!(progress.status, SyncSessionStatus::Failed);
    assert_eq!(progress.counters.errors_encountered, 5);
    // Only the successfully imported messages count as processed.
    assert_eq!(progress.counters.messages_processed, 2);
    assert!(progress.error_message.as_deref().unwrap_or_default().contains("error budget"));

    let persisted = engine
        .sessions
        .find_by_id(&session_id)
        .await
        .expect("lookup")
        .expect("persisted terminal row");
    assert_eq!(persisted.status, SyncSessionStatus::Failed);
}

#[tokio::test]
async fn malformed_messages_do_not_burn_the_error_budget() {
    let feed = vec![
        inbound("m-1", "", "no phone"),
        inbound("m-2", "+15551340001", ""),
        inbound("m-3", "banana", "unparseable phone"),
        inbound("m-4", "+15551340002", "real message"),
    ];
    let engine = build_engine(vec![feed], fast_config());

    let session_id = engine
        .orchestrator
        .start_sync(
            account(),
            SyncOptions { sync_type: SyncType::Manual, ..SyncOptions::default() },
        )
        .await
        .expect("start");
    let progress = wait_terminal(&engine, &session_id).await;

    assert_eq!(progress.status, SyncSessionStatus::Completed);
    assert_eq!(progress.counters.malformed_skipped, 3);
    assert_eq!(progress.counters.errors_encountered, 0);
    assert_eq!(progress.counters.messages_processed, 1);
}

#[tokio::test]
async fn page_fetch_failure_fails_the_session() {
    let engine =
        build_engine(vec![vec![inbound("f-1", "+15551350001", "hello")]], fast_config());
    engine.source.fail_page(0, SourceError::Transport("rate limited".to_string())).await;

    let session_id = engine
        .orchestrator
        .start_sync(
            account(),
            SyncOptions { sync_type: SyncType::Manual, ..SyncOptions::default() },
        )
        .await
        .expect("start");
    let progress = wait_terminal(&engine, &session_id).await;

    assert_eq!(progress.status, SyncSessionStatus::Failed);
    assert!(progress.error_message.as_deref().unwrap_or_default().contains("rate limited"));
}

#[tokio::test]
async fn concurrent_start_for_same_account_is_rejected() {
    let pages = vec![
        vec![inbound("c-1", "+15551360001", "page one")],
        vec![inbound("c-2", "+15551360002", "page two")],
    ];
    let config = SyncOrchestratorConfig { page_delay_ms: 200, ..SyncOrchestratorConfig::default() };
    let engine = build_engine(pages, config);

    let first = engine
        .orchestrator
        .start_sync(
            account(),
            SyncOptions { sync_type: SyncType::Manual, ..SyncOptions::default() },
        )
        .await
        .expect("first start");

    let second = engine
        .orchestrator
        .start_sync(
            account(),
            SyncOptions { sync_type: SyncType::Manual, ..SyncOptions::default() },
        )
        .await;
    assert!(matches!(second, Err(SyncError::AlreadyRunning(_))));

    // A different account is free to sync concurrently.
    let other = engine
        .orchestrator
        .start_sync(
            SourceAccountId("acct-other".to_string()),
            SyncOptions { sync_type: SyncType::Manual, ..SyncOptions::default() },
        )
        .await;
    assert!(other.is_ok());

    wait_terminal(&engine, &first).await;
}

#[tokio::test]
async fn cancellation_is_page_granular() {
    let pages: Vec<Vec<ExternalMessage>> = (0..20)
        .map(|page| {
            vec![inbound(
                &format!("cx-{page}"),
                &format!("+1555138{page:04}"),
                "steady traffic",
            )]
        })
        .collect();
    let config = SyncOrchestratorConfig { page_delay_ms: 50, ..SyncOrchestratorConfig::default() };
    let engine = build_engine(pages, config);

    let session_id = engine
        .orchestrator
        .start_sync(
            account(),
            SyncOptions { sync_type: SyncType::Manual, ..SyncOptions::default() },
        )
        .await
        .expect("start");

    // Let at least one page land, then cancel.
    tokio::time::sleep(StdDuration::from_millis(20)).await;
    assert!(engine.orchestrator.cancel(&session_id).await);

    let progress = wait_terminal(&engine, &session_id).await;
    assert_eq!(progress.status, SyncSessionStatus::Cancelled);

    // Every fetched page was fully processed; nothing was torn down mid-page.
    let fetched = engine.source.fetch_count().await;
    assert!(fetched < 20, "cancellation should stop the loop early, fetched {fetched}");
    assert_eq!(progress.counters.messages_processed, fetched);

    // Cancelling a finished session is a no-op.
    assert!(!engine.orchestrator.cancel(&session_id).await);
}

#[tokio::test]
async fn incremental_sync_resumes_from_last_completed_session() {
    let first_feed = vec![inbound("r-1", "+15551390001", "first batch")];
    let engine = build_engine(vec![first_feed], fast_config());

    let first = engine
        .orchestrator
        .start_sync(
            account(),
            SyncOptions { sync_type: SyncType::Manual, ..SyncOptions::default() },
        )
        .await
        .expect("first run");
    let first_progress = wait_terminal(&engine, &first).await;
    assert_eq!(first_progress.status, SyncSessionStatus::Completed);
    let resume_point = first_progress.last_message_date.expect("resume point recorded");

    let second = engine
        .orchestrator
        .start_sync(account(), SyncOptions::default())
        .await
        .expect("incremental run");
    wait_terminal(&engine, &second).await;

    let requests = engine.source.requests().await;
    let incremental_request = requests.last().expect("incremental fetch recorded");
    assert_eq!(incremental_request.start_time, Some(resume_point));
}

#[tokio::test]
async fn incremental_sync_without_history_uses_short_lookback() {
    let engine = build_engine(vec![vec![]], fast_config());

    let session_id = engine
        .orchestrator
        .start_sync(account(), SyncOptions::default())
        .await
        .expect("start");
    let progress = wait_terminal(&engine, &session_id).await;
    assert_eq!(progress.status, SyncSessionStatus::Completed);

    let requests = engine.source.requests().await;
    let start_time = requests[0].start_time.expect("lookback window set");
    let lookback = Utc::now() - start_time;
    assert!(lookback > Duration::hours(23) && lookback < Duration::hours(25));
}
