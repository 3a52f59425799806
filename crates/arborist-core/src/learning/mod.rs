//! Self-evolution subsystem: question generation, the doom-loop guard, the
//! learning recorder, and the composite loop that ties them together.

pub mod doom_loop_guard;
pub mod evolution;
pub mod question_generator;
pub mod recorder;

pub use doom_loop_guard::{DoomLoopConfig, DoomLoopGuard, SkipDecision};
pub use evolution::{EvolutionConfig, EvolutionLoop, EvolutionState};
pub use question_generator::{GeneratedQuestion, QuestionGenerator, QuestionRequest, QuestionType};
pub use recorder::{ExplorationResult, ExplorationStep, LearningRecord, LearningRecorder};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionStatus {
    #[serde(default)]
    pub questions_generated_today: u32,
    #[serde(default)]
    pub total_questions_explored: u32,
    pub last_generated_at: Option<DateTime<Utc>>,
}

impl Default for EvolutionStatus {
    fn default() -> Self {
        Self { questions_generated_today: 0, total_questions_explored: 0, last_generated_at: None }
    }
}

impl EvolutionStatus {
    /// `questions_generated_today` as of right now: zero if the last update fell
    /// on an earlier UTC day (the counter rolls over without a separate reset call).
    pub fn today_count(&self) -> u32 {
        let same_day = self
            .last_generated_at
            .map(|t| t.date_naive() == Utc::now().date_naive())
            .unwrap_or(false);
        if same_day {
            self.questions_generated_today
        } else {
            0
        }
    }

    pub fn update(&mut self, delta: i64) {
        self.questions_generated_today = (self.today_count() as i64 + delta).max(0) as u32;
        self.total_questions_explored = (self.total_questions_explored as i64 + delta).max(0) as u32;
        self.last_generated_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMemory {
    pub project_key: String,
    #[serde(default)]
    pub domain_knowledge: Vec<String>,
    #[serde(default)]
    pub learning_record_ids: Vec<String>,
    #[serde(default)]
    pub evolution_status: EvolutionStatus,
}

impl ProjectMemory {
    pub fn new(project_key: impl Into<String>) -> Self {
        Self { project_key: project_key.into(), ..Default::default() }
    }

    fn path(root: &Path) -> PathBuf {
        root.join("memory.json")
    }

    pub async fn load(root: &Path, project_key: &str) -> anyhow::Result<Self> {
        let path = Self::path(root);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(project_key)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, root: &Path) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(root).await?;
        let bytes = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(Self::path(root), bytes).await?;
        Ok(())
    }
}
