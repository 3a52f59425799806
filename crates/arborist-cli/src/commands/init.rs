use anyhow::Result;
use std::path::Path;

const DEFAULT_CONFIG: &str = r#"# Arborist configuration

[runtime]
rootPath = "."
dryRun = false
defaultTimeoutSecs = 60
maxParallelTools = 4

[llm]
provider = "anthropic"
model = ""

[embedding]
provider = "openai"
model = "text-embedding-3-small"
dimensions = 1536

[memory]
enabled = true
dataDir = "./.arborist"

[evolution]
enabled = false
questionsPerCycle = 5
intervalSecs = 900

[gateway]
host = "127.0.0.1"
port = 8787
"#;

/// Scaffold a default config file.
pub fn run_init(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("config already exists at {:?}", path);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, DEFAULT_CONFIG)?;
    println!("Created config at {:?}", path);
    Ok(())
}
