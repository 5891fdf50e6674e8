pub mod dedup;
pub mod identity;
pub mod importer;
pub mod orchestrator;
pub mod pipeline;
pub mod source;
pub mod thread;

pub use dedup::{DuplicateCheck, DuplicateDetector, DuplicateDetectorConfig};
pub use identity::{
    IdentityHints, IdentityResolver, MatchType, ResolutionPolicy, ResolvedCustomer,
};
pub use importer::MessageImporter;
pub use orchestrator::{
    SyncError, SyncOptions, SyncOrchestrator, SyncOrchestratorConfig, SyncProgress,
};
pub use pipeline::{IngestOutcome, MessagePipeline, PipelineError, SkipReason};
pub use source::{
    ExternalMessage, FetchPageRequest, HttpMessageSource, MessagePage, MessageSourceClient,
    ScriptedMessageSource, SourceError,
};
pub use thread::{ConversationResolver, ConversationResolverConfig, ResolvedConversation};
