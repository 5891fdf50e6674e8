//! The provider-facing message source: the trait the sync loop pulls pages
//! through, a reqwest-backed implementation of the provider's cursor API, and
//! a scripted implementation for tests and smoke runs.
//!
//! Transport-level retry and backoff live with the provider client; a fetch
//! error surfacing here means retries are already exhausted and the sync
//! session should fail.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

use threadline_core::config::ProviderConfig;
use threadline_core::domain::customer::SourceAccountId;
use threadline_core::domain::message::MessageDirection;

/// A message as delivered by the upstream voice/SMS provider. Transient:
/// mapped into a [`threadline_core::Message`] on import, never stored as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalMessage {
    pub external_id: String,
    pub external_thread_id: Option<String>,
    pub phone_number: String,
    pub direction: MessageDirection,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
    pub attachments: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchPageRequest {
    pub cursor: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub page_size: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub messages: Vec<ExternalMessage>,
    pub next_cursor: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("provider request failed: {0}")]
    Transport(String),
    #[error("provider returned malformed payload: {0}")]
    Payload(String),
}

/// Paginated feed access for one external account. Implementations must be
/// idempotent under retry: fetching the same page twice is safe.
#[async_trait]
pub trait MessageSourceClient: Send + Sync {
    async fn fetch_page(
        &self,
        account_id: &SourceAccountId,
        request: FetchPageRequest,
    ) -> Result<MessagePage, SourceError>;
}

/// Provider REST client: `GET {base}/v1/accounts/{account}/messages` with
/// cursor pagination and a bearer token.
pub struct HttpMessageSource {
    client: reqwest::Client,
    base_url: String,
    api_token: SecretString,
}

#[derive(Debug, Deserialize)]
struct WireMessagePage {
    messages: Vec<WireMessage>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    phone_number: String,
    direction: String,
    #[serde(default)]
    body: String,
    sent_at: DateTime<Utc>,
    #[serde(default)]
    contact_name: Option<String>,
    #[serde(default)]
    contact_email: Option<String>,
    #[serde(default)]
    attachments: Vec<String>,
}

impl HttpMessageSource {
    pub fn new(config: &ProviderConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| SourceError::Transport(error.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl MessageSourceClient for HttpMessageSource {
    async fn fetch_page(
        &self,
        account_id: &SourceAccountId,
        request: FetchPageRequest,
    ) -> Result<MessagePage, SourceError> {
        let url = format!("{}/v1/accounts/{}/messages", self.base_url, account_id.0);

        let mut query: Vec<(&str, String)> =
            vec![("limit", request.page_size.to_string())];
        if let Some(cursor) = &request.cursor {
            query.push(("cursor", cursor.clone()));
        }
        if let Some(start_time) = request.start_time {
            query.push(("start", start_time.to_rfc3339()));
        }
        if let Some(end_time) = request.end_time {
            query.push(("end", end_time.to_rfc3339()));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.api_token.expose_secret())
            .query(&query)
            .send()
            .await
            .map_err(|error| SourceError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Transport(format!(
                "provider returned status {status} for {url}"
            )));
        }

        let wire: WireMessagePage = response
            .json()
            .await
            .map_err(|error| SourceError::Payload(error.to_string()))?;

        let mut messages = Vec::with_capacity(wire.messages.len());
        for message in wire.messages {
            messages.push(external_from_wire(message)?);
        }

        Ok(MessagePage { messages, next_cursor: wire.next_cursor })
    }
}

fn external_from_wire(wire: WireMessage) -> Result<ExternalMessage, SourceError> {
    let direction = MessageDirection::parse(&wire.direction).ok_or_else(|| {
        SourceError::Payload(format!("unknown message direction `{}`", wire.direction))
    })?;

    Ok(ExternalMessage {
        external_id: wire.id,
        external_thread_id: wire.thread_id,
        phone_number: wire.phone_number,
        direction,
        body: wire.body,
        sent_at: wire.sent_at,
        contact_name: wire.contact_name,
        contact_email: wire.contact_email,
        attachments: wire.attachments,
    })
}

/// Scripted source for tests and offline smoke runs: a fixed sequence of
/// pages addressed by synthetic cursors, with optional per-page fetch
/// failures. Page `n` hands out cursor `page-{n+1}` until the sequence ends.
pub struct ScriptedMessageSource {
    pages: Vec<Vec<ExternalMessage>>,
    failures: Mutex<HashMap<usize, SourceError>>,
    requests: Mutex<Vec<FetchPageRequest>>,
}

impl ScriptedMessageSource {
    pub fn new(pages: Vec<Vec<ExternalMessage>>) -> Self {
        Self { pages, failures: Mutex::new(HashMap::new()), requests: Mutex::new(Vec::new()) }
    }

    /// Make the fetch of page `index` fail once with the given error.
    pub async fn fail_page(&self, index: usize, error: SourceError) {
        let mut failures = self.failures.lock().await;
        failures.insert(index, error);
    }

    pub async fn fetch_count(&self) -> u32 {
        self.requests.lock().await.len() as u32
    }

    /// Every request seen so far, in order.
    pub async fn requests(&self) -> Vec<FetchPageRequest> {
        self.requests.lock().await.clone()
    }

    fn page_index(cursor: Option<&str>) -> Result<usize, SourceError> {
        match cursor {
            None => Ok(0),
            Some(value) => value
                .strip_prefix("page-")
                .and_then(|raw| raw.parse::<usize>().ok())
                .ok_or_else(|| SourceError::Payload(format!("unknown cursor `{value}`"))),
        }
    }
}

#[async_trait]
impl MessageSourceClient for ScriptedMessageSource {
    async fn fetch_page(
        &self,
        _account_id: &SourceAccountId,
        request: FetchPageRequest,
    ) -> Result<MessagePage, SourceError> {
        {
            let mut requests = self.requests.lock().await;
            requests.push(request.clone());
        }

        let index = Self::page_index(request.cursor.as_deref())?;

        {
            let mut failures = self.failures.lock().await;
            if let Some(error) = failures.remove(&index) {
                return Err(error);
            }
        }

        let messages = self
            .pages
            .get(index)
            .cloned()
            .ok_or_else(|| SourceError::Payload(format!("no page at index {index}")))?;

        let next_cursor =
            (index + 1 < self.pages.len()).then(|| format!("page-{}", index + 1));

        Ok(MessagePage { messages, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use threadline_core::domain::customer::SourceAccountId;
    use threadline_core::domain::message::MessageDirection;

    use super::{
        ExternalMessage, FetchPageRequest, MessageSourceClient, ScriptedMessageSource, SourceError,
    };

    fn message(external_id: &str) -> ExternalMessage {
        ExternalMessage {
            external_id: external_id.to_string(),
            external_thread_id: None,
            phone_number: "+15551234567".to_string(),
            direction: MessageDirection::Inbound,
            body: "hello".to_string(),
            sent_at: Utc::now(),
            contact_name: None,
            contact_email: None,
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn scripted_source_pages_through_cursors() {
        let source =
            ScriptedMessageSource::new(vec![vec![message("a")], vec![message("b")]]);
        let account = SourceAccountId("acct".to_string());

        let first = source
            .fetch_page(&account, FetchPageRequest { page_size: 10, ..Default::default() })
            .await
            .expect("first page");
        assert_eq!(first.messages[0].external_id, "a");
        assert_eq!(first.next_cursor.as_deref(), Some("page-1"));

        let second = source
            .fetch_page(
                &account,
                FetchPageRequest { cursor: first.next_cursor, page_size: 10, ..Default::default() },
            )
            .await
            .expect("second page");
        assert_eq!(second.messages[0].external_id, "b");
        assert!(second.next_cursor.is_none());

        assert_eq!(source.fetch_count().await, 2);
    }

    #[tokio::test]
    async fn scripted_source_injects_one_shot_failures() {
        let source = ScriptedMessageSource::new(vec![vec![message("a")]]);
        let account = SourceAccountId("acct".to_string());
        source.fail_page(0, SourceError::Transport("boom".to_string())).await;

        let failed = source
            .fetch_page(&account, FetchPageRequest { page_size: 10, ..Default::default() })
            .await;
        assert!(matches!(failed, Err(SourceError::Transport(_))));

        let retried = source
            .fetch_page(&account, FetchPageRequest { page_size: 10, ..Default::default() })
            .await;
        assert!(retried.is_ok());
    }
}
