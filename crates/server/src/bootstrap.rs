use std::sync::Arc;

use thiserror::Error;
use threadline_core::classify::KeywordClassifier;
use threadline_core::config::{AppConfig, ConfigError, LoadOptions};
use threadline_db::repositories::{
    SqlConversationRepository, SqlCustomerRepository, SqlMessageRepository,
    SqlSyncSessionRepository,
};
use threadline_db::{connect_with_settings, migrations, DbPool};
use threadline_sync::{
    ConversationResolver, ConversationResolverConfig, DuplicateDetector, DuplicateDetectorConfig,
    HttpMessageSource, IdentityResolver, MessageImporter, MessagePipeline, ResolutionPolicy,
    SourceError, SyncOrchestrator, SyncOrchestratorConfig,
};
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub pipeline: Arc<MessagePipeline>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("provider client construction failed: {0}")]
    Source(#[from] SourceError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let customers = Arc::new(SqlCustomerRepository::new(db_pool.clone()));
    let conversations = Arc::new(SqlConversationRepository::new(db_pool.clone()));
    let messages = Arc::new(SqlMessageRepository::new(db_pool.clone()));
    let sessions = Arc::new(SqlSyncSessionRepository::new(db_pool.clone()));
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

    let source = Arc::new(HttpMessageSource::new(&config.provider)?);
    let orchestrator = Arc::new(SyncOrchestrator::new(
        source,
        pipeline.clone(),
        sessions,
        SyncOrchestratorConfig::from(&config.sync),
    ));

    Ok(Application { config, db_pool, pipeline, orchestrator })
}
