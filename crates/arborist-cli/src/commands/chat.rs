use anyhow::{anyhow, Result};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use arborist_core::llm::provider::LLMProvider;
use arborist_core::{
    AgentConfig, AnthropicClient, CancellationToken, Dispatcher, GeminiClient, OpenAIClient,
    ProviderChain,
};
use arborist_core::{Agent, AppConfig, SessionStore, ToolRegistry};
use arborist_tools::register_filesystem_tools;

/// Build the LLM provider chain from config, preferring the configured
/// provider and falling back to whichever other provider has a key set.
pub fn build_provider(config: &AppConfig) -> Result<Arc<dyn LLMProvider>> {
    let anthropic_key = non_empty(&config.llm.anthropic_api_key);
    let openai_key = non_empty(&config.llm.openai_api_key);
    let gemini_key = non_empty(&config.llm.gemini_api_key);

    let mut providers: Vec<Arc<dyn LLMProvider>> = Vec::new();
    let mut push_anthropic = |providers: &mut Vec<Arc<dyn LLMProvider>>| {
        if let Some(key) = &anthropic_key {
            let mut client = AnthropicClient::new(key);
            if !config.llm.model.is_empty() {
                client = client.with_model(&config.llm.model);
            }
            providers.push(Arc::new(client));
        }
    };
    let mut push_openai = |providers: &mut Vec<Arc<dyn LLMProvider>>| {
        if let Some(key) = &openai_key {
            let mut client = OpenAIClient::new(key);
            if !config.llm.model.is_empty() {
                client = client.with_model(&config.llm.model);
            }
            providers.push(Arc::new(client));
        }
    };
    let mut push_gemini = |providers: &mut Vec<Arc<dyn LLMProvider>>| {
        if let Some(key) = &gemini_key {
            let mut client = GeminiClient::new(key);
            if !config.llm.model.is_empty() {
                client = client.with_model(&config.llm.model);
            }
            providers.push(Arc::new(client));
        }
    };

    match config.llm.provider.as_str() {
        "openai" => {
            push_openai(&mut providers);
            push_anthropic(&mut providers);
            push_gemini(&mut providers);
        }
        "gemini" => {
            push_gemini(&mut providers);
            push_anthropic(&mut providers);
            push_openai(&mut providers);
        }
        _ => {
            push_anthropic(&mut providers);
            push_openai(&mut providers);
            push_gemini(&mut providers);
        }
    }

    if providers.is_empty() {
        return Err(anyhow!(
            "no LLM provider configured; set llm.anthropicApiKey/openaiApiKey/geminiApiKey or the matching env var"
        ));
    }
    if providers.len() == 1 {
        Ok(providers.into_iter().next().unwrap())
    } else {
        Ok(Arc::new(ProviderChain::new(providers)))
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Interactive stdin/stdout REPL against the agent loop, for local debugging
/// without the gateway.
pub async fn execute(project_key: String, session_id: Option<String>, config: &AppConfig) -> Result<()> {
    info!(project = %project_key, "starting chat session");

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
    let agent = Arc::new(Agent::new(agent_config, provider, dispatcher));

    let sessions_root = PathBuf::from(&config.memory.data_dir).join("sessions");
    let store = Arc::new(SessionStore::new(sessions_root));

    println!("Arborist agent — project '{project_key}'. Type 'exit' to quit.");
    println!("---");

    let mut current_session_id = session_id.unwrap_or_default();
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break; // EOF
        }
        let input = input.trim();

        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }

        let (id, mut turn) = store.begin_turn(&current_session_id, &project_key).await?;
        current_session_id = id.clone();
        let cancel = CancellationToken::new();

        match agent.run_turn(&mut turn, input, &cancel, None, None).await {
            Ok(response) => {
                store.end_turn(&project_key, turn).await;
                println!("\n{response}\n");
            }
            Err(e) => {
                store.end_turn(&project_key, turn).await;
                eprintln!("\nerror: {e}\n");
            }
        }
    }

    println!("session saved: {current_session_id}");
    Ok(())
}
