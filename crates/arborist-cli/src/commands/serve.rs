use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use arborist_core::learning::{DoomLoopGuard, EvolutionLoop, LearningRecorder, QuestionGenerator};
use arborist_core::{
    AgentConfig, AppConfig, CancellationToken, ConfigManager, ConfigReloadEvent, Dispatcher, SessionStore,
    ToolRegistry, VectorStore,
};
use arborist_gateway::{start_server, AppState, AuthConfig, RateLimiter, SessionManager};
use arborist_tools::register_filesystem_tools;

use crate::commands::chat::build_provider;

pub async fn execute(
    host: Option<String>,
    port: Option<u16>,
    project_key: String,
    config: &AppConfig,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let host = host.unwrap_or_else(|| config.gateway.host.clone());
    let port = port.unwrap_or(config.gateway.port);
    info!(host = %host, port, project = %project_key, "starting gateway server");

    let provider = build_provider(config)?;

    let registry = ToolRegistry::new();
    let workspace = PathBuf::from(shellexpand::tilde(&config.runtime.root_path).into_owned());
    register_filesystem_tools(&registry, workspace, config.runtime.max_file_size_mb)?;

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(registry),
        config.runtime.max_parallel_tools,
        Duration::from_secs(config.runtime.default_timeout_secs),
    ));
    let agent_config = AgentConfig { model: config.llm.model.clone(), ..AgentConfig::default() };
    let agent = Arc::new(arborist_core::Agent::new(agent_config, provider.clone(), dispatcher.clone()));

    let data_root = PathBuf::from(&config.memory.data_dir);
    let store = Arc::new(SessionStore::new(data_root.join("sessions")));

    let session_manager = Arc::new(SessionManager::new(store, agent.clone(), dispatcher));

    let auth_config = Arc::new(AuthConfig::new(config.gateway.auth_token.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(config.gateway.requests_per_minute));

    let state = AppState {
        session_manager,
        auth_config: auth_config.clone(),
        rate_limiter: rate_limiter.clone(),
        allowed_origins: vec![],
        max_message_bytes: config.gateway.max_message_bytes,
    };

    if let Some(path) = config_path.filter(|p| p.exists()) {
        let manager = Arc::new(ConfigManager::<AppConfig>::new(path.clone(), config.clone()));
        let mut reload_rx = manager.subscribe_reload();
        let watcher = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.watch().await {
                warn!(error = %e, path = ?path, "gateway: failed to start config file watcher");
            }
        });

        let live_config = manager.config();
        tokio::spawn(async move {
            while let Ok(event) = reload_rx.recv().await {
                match event {
                    ConfigReloadEvent::Success => {
                        let fresh = live_config.read().await.clone();
                        rate_limiter.set_limit(fresh.gateway.requests_per_minute);
                        auth_config.set_token(fresh.gateway.auth_token.clone());
                        info!("gateway: applied reloaded config to rate limiter and auth");
                    }
                    ConfigReloadEvent::Failure(reason) => {
                        warn!(reason, "gateway: config reload failed, keeping previous settings");
                    }
                }
            }
        });
    }

    if config.evolution.enabled {
        let embedder: Arc<dyn arborist_core::EmbeddingProvider> = Arc::from(arborist_core::build_embedding_provider(
            &config.embedding.provider,
            &config.embedding.api_key,
            &config.embedding.model,
            config.embedding.dimensions,
        )?);
        let vector_store = Arc::new(VectorStore::new(
            data_root.join("vectors"),
            config.embedding.dimensions,
            config.memory.hot_cache_bytes,
        ));
        vector_store.load_existing_classes().await?;
        let guard = Arc::new(DoomLoopGuard::new(config.evolution.guard_config(), vector_store.clone(), embedder.clone()));
        let generator = QuestionGenerator::new(provider.clone());
        let recorder = LearningRecorder::new(provider.clone(), embedder, vector_store, data_root.join("learning_records"));
        let evolution = EvolutionLoop::new(
            project_key.clone(),
            data_root.clone(),
            config.evolution.loop_config(),
            generator,
            guard,
            recorder,
            agent,
        );
        let evolution_cancel = CancellationToken::new();
        tokio::spawn(async move {
            evolution.run(&evolution_cancel).await;
        });
    }

    start_server(state, &host, port).await?;

    Ok(())
}
