//! Ingestion API: the webhook boundary for provider push events and the
//! sync start/progress/cancel surface.
//!
//! Webhook deliveries are normalized into the same [`ExternalMessage`] shape
//! the batch loop consumes and run through the same pipeline, so push and
//! poll ingestion share one set of dedup and threading semantics. Redelivery
//! of a webhook is therefore safe.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use threadline_core::domain::customer::SourceAccountId;
use threadline_core::domain::message::MessageDirection;
use threadline_core::domain::sync::{SyncSessionId, SyncType};
use threadline_sync::{
    ExternalMessage, IngestOutcome, MessagePipeline, SyncError, SyncOptions, SyncOrchestrator,
    SyncProgress,
};
use tracing::{info, warn};

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<MessagePipeline>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}

fn api_error(message: impl Into<String>) -> Json<ApiError> {
    Json(ApiError { error: message.into() })
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/webhooks/messages", post(ingest_webhook))
        .route("/sync/{account_id}", post(start_sync))
        .route("/sync/sessions/{session_id}", get(sync_progress))
        .route("/sync/sessions/{session_id}/cancel", post(cancel_sync))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct WebhookMessageRequest {
    pub account_id: String,
    pub message_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub phone_number: String,
    pub direction: String,
    #[serde(default)]
    pub body: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookMessageResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_match: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<&'static str>,
}

pub async fn ingest_webhook(
    State(state): State<ApiState>,
    Json(request): Json<WebhookMessageRequest>,
) -> Result<Json<WebhookMessageResponse>, (StatusCode, Json<ApiError>)> {
    let Some(direction) = MessageDirection::parse(&request.direction) else {
        return Err((
            StatusCode::BAD_REQUEST,
            api_error(format!("unknown message direction `{}`", request.direction)),
        ));
    };

    let account_id = SourceAccountId(request.account_id);
    let external = ExternalMessage {
        external_id: request.message_id,
        external_thread_id: request.thread_id,
        phone_number: request.phone_number,
        direction,
        body: request.body,
        sent_at: request.sent_at,
        contact_name: request.contact_name,
        contact_email: request.contact_email,
        attachments: request.attachments,
    };

    match state.pipeline.ingest(&external, &account_id).await {
        Ok(IngestOutcome::Imported {
            message,
            customer_match,
            conversation_id,
            conversation_is_new,
            ..
        }) => {
            info!(
                event_name = "ingest.webhook.imported",
                account_id = %account_id.0,
                message_id = %message.id.0,
                conversation_id = %conversation_id.0,
                customer_match = customer_match.as_str(),
                conversation_is_new,
                "webhook message imported"
            );
            Ok(Json(WebhookMessageResponse {
                outcome: "imported",
                message_id: Some(message.id.0),
                customer_match: Some(customer_match.as_str()),
                matched_message_id: None,
                confidence: None,
                skip_reason: None,
            }))
        }
        Ok(IngestOutcome::Duplicate { matched_message_id, confidence }) => {
            Ok(Json(WebhookMessageResponse {
                outcome: "duplicate",
                message_id: None,
                customer_match: None,
                matched_message_id: matched_message_id.map(|id| id.0),
                confidence: Some(confidence),
                skip_reason: None,
            }))
        }
        Ok(IngestOutcome::Skipped(reason)) => Ok(Json(WebhookMessageResponse {
            outcome: "skipped",
            message_id: None,
            customer_match: None,
            matched_message_id: None,
            confidence: None,
            skip_reason: Some(reason.as_str()),
        })),
        Err(error) => {
            warn!(
                event_name = "ingest.webhook.failed",
                account_id = %account_id.0,
                external_message_id = %external.external_id,
                error = %error,
                "webhook ingest failed"
            );
            Err((StatusCode::INTERNAL_SERVER_ERROR, api_error(error.to_string())))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StartSyncRequest {
    #[serde(default)]
    pub sync_type: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartSyncResponse {
    pub session_id: String,
}

pub async fn start_sync(
    State(state): State<ApiState>,
    Path(account_id): Path<String>,
    Json(request): Json<StartSyncRequest>,
) -> Result<(StatusCode, Json<StartSyncResponse>), (StatusCode, Json<ApiError>)> {
    let sync_type = match request.sync_type.as_deref() {
        None => SyncType::Incremental,
        Some(raw) => SyncType::parse(raw).ok_or_else(|| {
            (StatusCode::BAD_REQUEST, api_error(format!("unknown sync type `{raw}`")))
        })?,
    };

    let options = SyncOptions {
        sync_type,
        start_time: request.start_time,
        end_time: request.end_time,
        cursor: request.cursor,
    };

    match state.orchestrator.start_sync(SourceAccountId(account_id), options).await {
        Ok(session_id) => {
            Ok((StatusCode::ACCEPTED, Json(StartSyncResponse { session_id: session_id.0 })))
        }
        Err(SyncError::AlreadyRunning(account)) => Err((
            StatusCode::CONFLICT,
            api_error(format!("a sync is already in flight for account `{account}`")),
        )),
        Err(error) => {
            Err((StatusCode::SERVICE_UNAVAILABLE, api_error(error.to_string())))
        }
    }
}

pub async fn sync_progress(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SyncProgress>, (StatusCode, Json<ApiError>)> {
    match state.orchestrator.progress(&SyncSessionId(session_id.clone())).await {
        Ok(Some(progress)) => Ok(Json(progress)),
        Ok(None) => {
            Err((StatusCode::NOT_FOUND, api_error(format!("unknown sync session `{session_id}`"))))
        }
        Err(error) => Err((StatusCode::SERVICE_UNAVAILABLE, api_error(error.to_string()))),
    }
}

#[derive(Debug, Serialize)]
pub struct CancelSyncResponse {
    pub cancelled: bool,
}

pub async fn cancel_sync(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<CancelSyncResponse>, (StatusCode, Json<ApiError>)> {
    let cancelled = state.orchestrator.cancel(&SyncSessionId(session_id.clone())).await;
    if cancelled {
        Ok(Json(CancelSyncResponse { cancelled }))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            api_error(format!("no cancellable sync session `{session_id}`")),
        ))
    }
}
