pub mod agent;
pub mod config;
pub mod context_compactor;
pub mod dispatcher;
pub mod embedding;
pub mod errors;
pub mod learning;
pub mod llm;
pub mod lock_manager;
pub mod part;
pub mod session_store;
pub mod sub_task;
pub mod tool;
pub mod vector_store;

pub use agent::{Agent, AgentConfig, CancellationToken, PartEvent, StreamSink};
pub use config::{AppConfig, ConfigManager, ConfigReloadEvent};
pub use context_compactor::ContextCompactor;
pub use dispatcher::{Dispatcher, RemoteToolCall, RemoteToolReply};
pub use embedding::{build_provider as build_embedding_provider, EmbeddingProvider};
pub use errors::{CoreError, ErrorPayload};
pub use learning::{
    DoomLoopConfig, DoomLoopGuard, EvolutionLoop, LearningRecord, LearningRecorder, ProjectMemory,
    QuestionGenerator,
};
pub use llm::{
    AnthropicClient, Content, GenerateConfig, GenerateResponse, GeminiClient, LLMProvider, Message,
    OpenAIClient, ProviderChain, Role as LlmRole, StopReason, ToolCall, ToolResult, ToolSchema, Usage,
};
pub use lock_manager::ClassLockManager;
pub use part::{ItemStatus, Part, PartPayload, Role, Session, SessionStatus, ToolState};
pub use session_store::{SessionStore, TurnGuard};
pub use sub_task::run_sub_task;
pub use tool::{ExecutionMode, PermissionLevel, Tool, ToolRegistry, ToolSchemaInfo};
pub use vector_store::{VectorFragment, VectorStore};

/// Install the process-wide `tracing` subscriber. Called exactly once, before
/// anything else runs. JSON output is the default (production-friendly, one
/// event per line); set `ARBORIST_LOG_FORMAT=pretty` for a human-readable
/// multi-line format during local development.
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::from_default_env();
    let pretty = std::env::var("ARBORIST_LOG_FORMAT").map(|v| v == "pretty").unwrap_or(false);

    if pretty {
        fmt().pretty().with_env_filter(filter).init();
    } else {
        fmt().json().with_env_filter(filter).init();
    }
}
