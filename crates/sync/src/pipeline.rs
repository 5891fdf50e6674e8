//! The single per-message ingestion path.
//!
//! Both ingestion modes converge here: the orchestrator's batch loop and the
//! webhook boundary call [`MessagePipeline::ingest`] for every message, so
//! dedup and threading behave identically whether a message arrived by poll
//! or by push.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use threadline_core::domain::conversation::ConversationId;
use threadline_core::domain::customer::{CustomerId, SourceAccountId};
use threadline_core::domain::message::{Message, MessageId};
use threadline_core::phone;
use threadline_db::repositories::RepositoryError;

use crate::dedup::DuplicateDetector;
use crate::identity::{IdentityHints, IdentityResolver, MatchType, ResolutionPolicy};
use crate::importer::MessageImporter;
use crate::source::ExternalMessage;
use crate::thread::ConversationResolver;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingPhone,
    MissingBody,
    UnparseablePhone,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingPhone => "missing_phone",
            Self::MissingBody => "missing_body",
            Self::UnparseablePhone => "unparseable_phone",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum IngestOutcome {
    Imported {
        message: Message,
        customer_id: CustomerId,
        customer_match: MatchType,
        conversation_id: ConversationId,
        conversation_is_new: bool,
        merged_conversations: Vec<ConversationId>,
    },
    Duplicate {
        matched_message_id: Option<MessageId>,
        confidence: f64,
    },
    Skipped(SkipReason),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("no customer could be resolved for phone `{phone}`")]
    IdentityUnavailable { phone: String },
}

pub struct MessagePipeline {
    dedup: DuplicateDetector,
    identity: IdentityResolver,
    threads: ConversationResolver,
    importer: MessageImporter,
    policy: ResolutionPolicy,
    platform: String,
}

impl MessagePipeline {
    pub fn new(
        dedup: DuplicateDetector,
        identity: IdentityResolver,
        threads: ConversationResolver,
        importer: MessageImporter,
        policy: ResolutionPolicy,
        platform: impl Into<String>,
    ) -> Self {
        Self { dedup, identity, threads, importer, policy, platform: platform.into() }
    }

    pub async fn ingest(
        &self,
        external: &ExternalMessage,
        account_id: &SourceAccountId,
    ) -> Result<IngestOutcome, PipelineError> {
        if external.phone_number.trim().is_empty() {
            return Ok(IngestOutcome::Skipped(SkipReason::MissingPhone));
        }
        if external.body.trim().is_empty() {
            return Ok(IngestOutcome::Skipped(SkipReason::MissingBody));
        }
        let Ok(normalized_phone) = phone::normalize(&external.phone_number) else {
            return Ok(IngestOutcome::Skipped(SkipReason::UnparseablePhone));
        };

        let check = self.dedup.check(external, account_id).await;
        if check.duplicate {
            debug!(
                event_name = "sync.pipeline.duplicate",
                account_id = %account_id.0,
                external_message_id = %external.external_id,
                confidence = check.confidence,
                "skipping duplicate message"
            );
            return Ok(IngestOutcome::Duplicate {
                matched_message_id: check.matched_message_id,
                confidence: check.confidence,
            });
        }

        let hints = IdentityHints {
            name: external.contact_name.clone(),
            email: external.contact_email.clone(),
        };
        let resolved = self.identity.resolve(&normalized_phone, &hints, &self.policy).await?;
        let customer = resolved.customer.ok_or_else(|| PipelineError::IdentityUnavailable {
            phone: normalized_phone.clone(),
        })?;

        let thread = self
            .threads
            .resolve(
                &customer.id,
                &normalized_phone,
                &self.platform,
                Some(&external.body),
                external.external_thread_id.as_deref(),
                external.sent_at,
            )
            .await?;

        let message = self
            .importer
            .import(&thread.conversation.id, external, account_id, &customer.id, &normalized_phone)
            .await?;

        Ok(IngestOutcome::Imported {
            message,
            customer_id: customer.id,
            customer_match: resolved.match_type,
            conversation_id: thread.conversation.id,
            conversation_is_new: thread.is_new,
            merged_conversations: thread.merged,
        })
    }
}
