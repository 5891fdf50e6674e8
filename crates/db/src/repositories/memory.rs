//! In-memory repository implementations backing engine tests and local smoke
//! runs. Same contracts as the SQL implementations, no persistence.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use threadline_core::domain::conversation::{
    Conversation, ConversationId, ConversationKey, ConversationStatus,
};
use threadline_core::domain::customer::{Customer, CustomerId, PhoneMapping, SourceAccountId};
use threadline_core::domain::message::{
    ExternalIdMapping, Message, MessageDirection, MessageId,
};
use threadline_core::domain::sync::{SyncSession, SyncSessionId, SyncSessionStatus};

use super::{
    ConversationRepository, CustomerRepository, MessageRepository, RepositoryError,
    SyncSessionRepository,
};

#[derive(Default)]
pub struct InMemoryCustomerRepository {
    customers: RwLock<HashMap<String, Customer>>,
}

#[async_trait::async_trait]
impl CustomerRepository for InMemoryCustomerRepository {
    async fn find_by_id(&self, id: &CustomerId) -> Result<Option<Customer>, RepositoryError> {
        let customers = self.customers.read().await;
        Ok(customers.get(&id.0).cloned())
    }

    async fn find_by_primary_phone(
        &self,
        phone: &str,
    ) -> Result<Option<Customer>, RepositoryError> {
        let customers = self.customers.read().await;
        Ok(customers
            .values()
            .filter(|customer| customer.active && customer.primary_phone == phone)
            .min_by_key(|customer| customer.created_at)
            .cloned())
    }

    async fn find_by_alternate_phone(
        &self,
        phone: &str,
    ) -> Result<Option<Customer>, RepositoryError> {
        let customers = self.customers.read().await;
        Ok(customers
            .values()
            .filter(|customer| {
                customer.active && customer.alternate_phone.as_deref() == Some(phone)
            })
            .min_by_key(|customer| customer.created_at)
            .cloned())
    }

    async fn list_active(&self) -> Result<Vec<Customer>, RepositoryError> {
        let customers = self.customers.read().await;
        let mut active: Vec<Customer> =
            customers.values().filter(|customer| customer.active).cloned().collect();
        active.sort_by_key(|customer| customer.created_at);
        Ok(active)
    }

    async fn save(&self, customer: Customer) -> Result<(), RepositoryError> {
        let mut customers = self.customers.write().await;
        customers.insert(customer.id.0.clone(), customer);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryConversationRepository {
    conversations: RwLock<HashMap<String, Conversation>>,
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(&id.0).cloned())
    }

    async fn find_active_for_key(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .values()
            .filter(|conversation| {
                conversation.status == ConversationStatus::Active && &conversation.key() == key
            })
            .max_by_key(|conversation| conversation.updated_at)
            .cloned())
    }

    async fn find_recent_resolved_for_key(
        &self,
        key: &ConversationKey,
        since: DateTime<Utc>,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .values()
            .filter(|conversation| {
                conversation.status == ConversationStatus::Resolved
                    && &conversation.key() == key
                    && conversation.last_message_at >= since
            })
            .max_by_key(|conversation| conversation.last_message_at)
            .cloned())
    }

    async fn list_open_for_key(
        &self,
        key: &ConversationKey,
        created_since: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        let mut open: Vec<Conversation> = conversations
            .values()
            .filter(|conversation| {
                conversation.status != ConversationStatus::Archived
                    && &conversation.key() == key
                    && conversation.created_at >= created_since
            })
            .cloned()
            .collect();
        open.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(open)
    }

    async fn save(&self, conversation: Conversation) -> Result<(), RepositoryError> {
        let mut conversations = self.conversations.write().await;
        conversations.insert(conversation.id.0.clone(), conversation);
        Ok(())
    }
}

#[derive(Default)]
struct MessageStore {
    messages: HashMap<String, Message>,
    /// message id -> conversation phone at import time.
    message_phones: HashMap<String, String>,
    /// (external id, account) -> message id.
    mappings: HashMap<(String, String), String>,
    /// (account, phone) -> mapping row.
    phone_mappings: HashMap<(String, String), PhoneMapping>,
}

#[derive(Default)]
pub struct InMemoryMessageRepository {
    store: RwLock<MessageStore>,
}

#[async_trait::async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn find_by_id(&self, id: &MessageId) -> Result<Option<Message>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store.messages.get(&id.0).cloned())
    }

    async fn find_mapped_message(
        &self,
        external_message_id: &str,
        account_id: &SourceAccountId,
    ) -> Result<Option<MessageId>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store
            .mappings
            .get(&(external_message_id.to_string(), account_id.0.clone()))
            .cloned()
            .map(MessageId))
    }

    async fn find_content_match(
        &self,
        phone: &str,
        content: &str,
        direction: MessageDirection,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<MessageId>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store
            .messages
            .values()
            .filter(|message| {
                store.message_phones.get(&message.id.0).map(String::as_str) == Some(phone)
                    && message.content == content
                    && message.direction == direction
                    && message.sent_at >= window_start
                    && message.sent_at <= window_end
            })
            .min_by_key(|message| message.sent_at)
            .map(|message| message.id.clone()))
    }

    async fn import(
        &self,
        message: Message,
        mapping: ExternalIdMapping,
        customer_id: &CustomerId,
        phone: &str,
    ) -> Result<(), RepositoryError> {
        let phone = phone.to_string();
        let mut store = self.store.write().await;

        let mapping_key = (mapping.external_message_id.clone(), mapping.source_account_id.0.clone());
        if store.mappings.contains_key(&mapping_key) {
            return Err(RepositoryError::MappingConflict {
                external_message_id: mapping.external_message_id,
                account_id: mapping.source_account_id.0,
            });
        }

        store.mappings.insert(mapping_key, message.id.0.clone());
        store.message_phones.insert(message.id.0.clone(), phone.clone());

        let phone_key = (mapping.source_account_id.0.clone(), phone.clone());
        store
            .phone_mappings
            .entry(phone_key)
            .and_modify(|existing| {
                existing.customer_id = customer_id.clone();
                existing.last_contact_at = message.sent_at;
                existing.message_count += 1;
            })
            .or_insert_with(|| PhoneMapping {
                source_account_id: mapping.source_account_id.clone(),
                phone_number: phone,
                customer_id: customer_id.clone(),
                first_contact_at: message.sent_at,
                last_contact_at: message.sent_at,
                message_count: 1,
            });

        store.messages.insert(message.id.0.clone(), message);
        Ok(())
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, RepositoryError> {
        let store = self.store.read().await;
        let mut messages: Vec<Message> = store
            .messages
            .values()
            .filter(|message| message.conversation_id == *conversation_id)
            .cloned()
            .collect();
        messages.sort_by_key(|message| message.sent_at);
        Ok(messages)
    }

    async fn reassign_conversation(
        &self,
        from: &ConversationId,
        to: &ConversationId,
    ) -> Result<u64, RepositoryError> {
        let mut store = self.store.write().await;
        let mut moved = 0;
        for message in store.messages.values_mut() {
            if message.conversation_id == *from {
                message.conversation_id = to.clone();
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn find_phone_mapping(
        &self,
        account_id: &SourceAccountId,
        phone: &str,
    ) -> Result<Option<PhoneMapping>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store.phone_mappings.get(&(account_id.0.clone(), phone.to_string())).cloned())
    }
}

#[derive(Default)]
pub struct InMemorySyncSessionRepository {
    sessions: RwLock<HashMap<String, SyncSession>>,
}

#[async_trait::async_trait]
impl SyncSessionRepository for InMemorySyncSessionRepository {
    async fn find_by_id(&self, id: &SyncSessionId) -> Result<Option<SyncSession>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id.0).cloned())
    }

    async fn find_in_flight_for_account(
        &self,
        account_id: &SourceAccountId,
    ) -> Result<Option<SyncSession>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|session| {
                session.source_account_id == *account_id
                    && matches!(
                        session.status,
                        SyncSessionStatus::Pending | SyncSessionStatus::Running
                    )
            })
            .max_by_key(|session| session.started_at)
            .cloned())
    }

    async fn last_completed_for_account(
        &self,
        account_id: &SourceAccountId,
    ) -> Result<Option<SyncSession>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|session| {
                session.source_account_id == *account_id
                    && session.status == SyncSessionStatus::Completed
            })
            .max_by_key(|session| session.completed_at)
            .cloned())
    }

    async fn save(&self, session: SyncSession) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id.0.clone(), session);
        Ok(())
    }
}
