pub mod app;
pub mod manager;

pub use app::{AppConfig, EmbeddingConfig, EvolutionConfig, GatewayConfig, LlmConfig, MemoryConfig, RuntimeConfig};
pub use manager::{ConfigManager, ConfigReloadEvent};
