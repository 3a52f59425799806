//! `AppConfig`.
//!
//! Every field carries `serde(default)` so a missing or partial TOML file still
//! produces a usable configuration, a fixed environment-variable prefix overrides
//! the handful of fields operators actually reach for, and validation runs once at
//! startup and is fatal rather than deferred to first use.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const ENV_PREFIX: &str = "ARBORIST";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            memory: MemoryConfig::default(),
            evolution: EvolutionConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default = "default_root_path")]
    pub root_path: String,
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_parallel_tools")]
    pub max_parallel_tools: usize,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

fn default_root_path() -> String {
    ".".to_string()
}
fn default_dry_run() -> bool {
    false
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_parallel_tools() -> usize {
    4
}
fn default_max_file_size_mb() -> u64 {
    10
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            dry_run: default_dry_run(),
            default_timeout_secs: default_timeout_secs(),
            max_parallel_tools: default_max_parallel_tools(),
            max_file_size_mb: default_max_file_size_mb(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub anthropic_api_key: String,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default)]
    pub gemini_api_key: String,
}

fn default_llm_provider() -> String {
    "anthropic".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: String::new(),
            anthropic_api_key: String::new(),
            openai_api_key: String::new(),
            gemini_api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_embedding_dims")]
    pub dimensions: usize,
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embedding_dims() -> usize {
    1536
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            api_key: String::new(),
            dimensions: default_embedding_dims(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_hot_cache_bytes")]
    pub hot_cache_bytes: usize,
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_threshold: f32,
    #[serde(default = "default_compaction_token_budget")]
    pub compaction_token_budget: usize,
}

fn default_data_dir() -> String {
    "./.arborist".to_string()
}
fn default_hot_cache_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_duplicate_threshold() -> f32 {
    0.85
}
fn default_compaction_token_budget() -> usize {
    8_000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: default_data_dir(),
            hot_cache_bytes: default_hot_cache_bytes(),
            duplicate_threshold: default_duplicate_threshold(),
            compaction_token_budget: default_compaction_token_budget(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_questions_per_cycle")]
    pub questions_per_cycle: usize,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_daily_questions")]
    pub max_daily_questions: u32,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_questions_per_cycle() -> usize {
    5
}
fn default_interval_secs() -> u64 {
    900
}
fn default_max_daily_questions() -> u32 {
    50
}
fn default_max_consecutive_errors() -> u32 {
    3
}
fn default_base_backoff_secs() -> u64 {
    30
}
fn default_max_backoff_secs() -> u64 {
    3600
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            questions_per_cycle: default_questions_per_cycle(),
            interval_secs: default_interval_secs(),
            max_daily_questions: default_max_daily_questions(),
            max_consecutive_errors: default_max_consecutive_errors(),
            base_backoff_secs: default_base_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl EvolutionConfig {
    pub fn loop_config(&self) -> crate::learning::evolution::EvolutionConfig {
        crate::learning::evolution::EvolutionConfig {
            enabled: self.enabled,
            questions_per_cycle: self.questions_per_cycle,
            interval_secs: self.interval_secs,
        }
    }

    pub fn guard_config(&self) -> crate::learning::DoomLoopConfig {
        crate::learning::DoomLoopConfig {
            max_consecutive_errors: self.max_consecutive_errors,
            base_backoff: std::time::Duration::from_secs(self.base_backoff_secs),
            max_backoff: std::time::Duration::from_secs(self.max_backoff_secs),
            max_daily_questions: self.max_daily_questions,
            duplicate_threshold: default_duplicate_threshold_guard(),
        }
    }
}

fn default_duplicate_threshold_guard() -> f32 {
    0.85
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_max_message_bytes() -> usize {
    1024 * 1024
}
fn default_requests_per_minute() -> u32 {
    120
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_token: None,
            max_message_bytes: default_max_message_bytes(),
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

const RECOGNIZED_LLM_PROVIDERS: &[&str] = &["anthropic", "openai", "gemini"];
const RECOGNIZED_EMBEDDING_PROVIDERS: &[&str] = &["openai", "mock"];

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.runtime.default_timeout_secs == 0 {
            bail!("runtime.defaultTimeoutSecs must be > 0");
        }
        if self.runtime.max_parallel_tools == 0 || self.runtime.max_parallel_tools > 256 {
            bail!("runtime.maxParallelTools must be between 1 and 256");
        }
        if self.runtime.max_file_size_mb == 0 {
            bail!("runtime.maxFileSizeMb must be > 0");
        }
        if !RECOGNIZED_LLM_PROVIDERS.contains(&self.llm.provider.as_str()) {
            bail!("llm.provider {:?} is not recognized (expected one of {:?})", self.llm.provider, RECOGNIZED_LLM_PROVIDERS);
        }
        if !RECOGNIZED_EMBEDDING_PROVIDERS.contains(&self.embedding.provider.as_str()) {
            bail!(
                "embedding.provider {:?} is not recognized (expected one of {:?})",
                self.embedding.provider,
                RECOGNIZED_EMBEDDING_PROVIDERS
            );
        }
        if self.evolution.enabled && self.evolution.interval_secs == 0 {
            bail!("evolution.intervalSecs must be > 0 when evolution is enabled");
        }
        if self.gateway.requests_per_minute == 0 {
            bail!("gateway.requestsPerMinute must be > 0");
        }
        Ok(())
    }

    /// Override the fields operators most commonly need to flip without editing a
    /// file: dry-run, timeout, max parallel tools, and API keys when still blank.
    pub fn apply_env_overrides(&mut self) {
        if let Some(val) = env_var("DRY_RUN") {
            if let Ok(b) = val.parse::<bool>() {
                self.runtime.dry_run = b;
            }
        }
        if let Some(val) = env_var("TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.runtime.default_timeout_secs = secs;
            }
        }
        if let Some(val) = env_var("MAX_PARALLEL_TOOLS") {
            if let Ok(n) = val.parse::<usize>() {
                self.runtime.max_parallel_tools = n;
            }
        }
        if let Some(key) = env_var("ANTHROPIC_API_KEY") {
            if self.llm.anthropic_api_key.is_empty() {
                self.llm.anthropic_api_key = key;
            }
        }
        if let Some(key) = env_var("OPENAI_API_KEY") {
            if self.llm.openai_api_key.is_empty() {
                self.llm.openai_api_key = key;
            }
        }
        if let Some(key) = env_var("GEMINI_API_KEY") {
            if self.llm.gemini_api_key.is_empty() {
                self.llm.gemini_api_key = key;
            }
        }
        if let Some(key) = env_var("EMBEDDING_API_KEY") {
            if self.embedding.api_key.is_empty() {
                self.embedding.api_key = key;
            }
        }
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}_{suffix}")).ok()
}

/// Load, env-override and validate an `AppConfig` from `path`. A missing file
/// falls back to an all-default config (still validated, still subject to
/// overrides) rather than failing, matching the "partial file still works" rule.
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(p) if p.exists() => {
            let content = std::fs::read_to_string(p).with_context(|| format!("failed to read config file {}", p.display()))?;
            toml::from_str(&content).with_context(|| format!("failed to parse config file {}", p.display()))?
        }
        _ => AppConfig::default(),
    };

    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}
