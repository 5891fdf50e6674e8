use std::sync::Arc;
use std::time::Duration;

use crate::commands::CommandResult;
use threadline_core::classify::KeywordClassifier;
use threadline_core::config::{AppConfig, LoadOptions};
use threadline_core::domain::customer::SourceAccountId;
use threadline_core::domain::sync::{SyncSessionStatus, SyncType};
use threadline_db::repositories::{
    SqlConversationRepository, SqlCustomerRepository, SqlMessageRepository,
    SqlSyncSessionRepository,
};
use threadline_db::connect_with_settings;
use threadline_sync::{
    ConversationResolver, ConversationResolverConfig, DuplicateDetector, DuplicateDetectorConfig,
    HttpMessageSource, IdentityResolver, MessageImporter, MessagePipeline, ResolutionPolicy,
    SyncOptions, SyncOrchestrator, SyncOrchestratorConfig,
};

/// Runs one sync session to a terminal state and reports its counters.
pub fn run(account: &str, sync_type: &str) -> CommandResult {
    let Some(sync_type) = SyncType::parse(sync_type) else {
        return CommandResult::failure(
            "sync",
            "invalid_sync_type",
            format!("unknown sync type `{sync_type}` (expected initial|incremental|manual)"),
            2,
        );
    };

    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "sync",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "sync",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let account_id = SourceAccountId(account.to_string());
    let outcome = runtime.block_on(run_sync(config, account_id, sync_type));

    match outcome {
        Ok(progress) => {
            let message = format!(
                "session {} finished {}: processed={} created={} matched={} duplicates={} malformed={} errors={}",
                progress.session_id.0,
                progress.status.as_str(),
                progress.counters.messages_processed,
                progress.counters.customers_created,
                progress.counters.customers_matched,
                progress.counters.duplicates_skipped,
                progress.counters.malformed_skipped,
                progress.counters.errors_encountered,
            );
            if progress.status == SyncSessionStatus::Completed {
                CommandResult::success("sync", message)
            } else {
                CommandResult::failure("sync", "sync_not_completed", message, 6)
            }
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("sync", error_class, message, exit_code)
        }
    }
}

async fn run_sync(
    config: AppConfig,
    account_id: SourceAccountId,
    sync_type: SyncType,
) -> Result<threadline_sync::SyncProgress, (&'static str, String, u8)> {
    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

    threadline_db::migrations::run_pending(&pool)
        .await
        .map_err(|error| ("migration", error.to_string(), 5u8))?;

    let customers = Arc::new(SqlCustomerRepository::new(pool.clone()));
    let conversations = Arc::new(SqlConversationRepository::new(pool.clone()));
    let messages = Arc::new(SqlMessageRepository::new(pool.clone()));
    let sessions = Arc::new(SqlSyncSessionRepository::new(pool.clone()));
    let classifier = Arc::new(KeywordClassifier::default());

    let pipeline = Arc::new(MessagePipeline::new(
        DuplicateDetector::new(
            messages.clone(),
            DuplicateDetectorConfig { window_hours: config.sync.duplicate_window_hours },
        ),
        IdentityResolver::new(customers),
        ConversationResolver::new(
            conversations,
            messages.clone(),
            classifier.clone(),
            ConversationResolverConfig::default(),
        ),
        MessageImporter::new(messages, classifier),
        ResolutionPolicy {
            min_confidence: config.sync.min_match_confidence,
            ..ResolutionPolicy::default()
        },
        config.sync.default_platform.clone(),
    ));

    let source = Arc::new(
        HttpMessageSource::new(&config.provider)
            .map_err(|error| ("provider_client", error.to_string(), 4u8))?,
    );
    let orchestrator = SyncOrchestrator::new(
        source,
        pipeline,
        sessions,
        SyncOrchestratorConfig::from(&config.sync),
    );

    let session_id = orchestrator
        .start_sync(account_id, SyncOptions { sync_type, ..SyncOptions::default() })
        .await
        .map_err(|error| ("sync_start", error.to_string(), 6u8))?;

    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let progress = orchestrator
            .progress(&session_id)
            .await
            .map_err(|error| ("sync_progress", error.to_string(), 6u8))?
            .ok_or_else(|| ("sync_progress", "session disappeared".to_string(), 6u8))?;

        if progress.status.is_terminal() {
            pool.close().await;
            return Ok(progress);
        }
    }
}
