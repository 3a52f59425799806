//! Self-evolution loop.
//!
//! Ties the question generator, the doom-loop guard, an unattended agent
//! exploration session and the learning recorder into a single cooperative task
//! per project: a loop with a sleep at the bottom and a cooperative cancellation
//! check at the top, between cycles, and between questions within a cycle.

use crate::agent::{Agent, CancellationToken};
use crate::learning::doom_loop_guard::DoomLoopGuard;
use crate::learning::question_generator::{GeneratedQuestion, QuestionGenerator, QuestionRequest};
use crate::learning::recorder::{ExplorationResult, ExplorationStep, LearningRecorder};
use crate::learning::ProjectMemory;
use crate::part::{PartPayload, Session, ToolState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_questions_per_cycle")]
    pub questions_per_cycle: usize,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_questions_per_cycle() -> usize {
    5
}
fn default_interval_secs() -> u64 {
    900
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            questions_per_cycle: default_questions_per_cycle(),
            interval_secs: default_interval_secs(),
        }
    }
}

/// Resumable progress marker: which question (if any) was mid-exploration when
/// the loop last stopped, plus the exploration steps gathered so far.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionState {
    pub current_question: Option<String>,
    #[serde(default)]
    pub partial_steps: Vec<ExplorationStep>,
}

impl EvolutionState {
    fn path(root: &Path) -> PathBuf {
        root.join("evolution_state.json")
    }

    pub async fn load(root: &Path) -> Self {
        match tokio::fs::read(Self::path(root)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub async fn save(&self, root: &Path) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(root).await?;
        let bytes = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(Self::path(root), bytes).await?;
        Ok(())
    }

    async fn clear(root: &Path) -> anyhow::Result<()> {
        Self::default().save(root).await
    }
}

pub struct EvolutionLoop {
    project_key: String,
    root: PathBuf,
    config: EvolutionConfig,
    generator: QuestionGenerator,
    guard: Arc<DoomLoopGuard>,
    recorder: LearningRecorder,
    agent: Arc<Agent>,
}

impl EvolutionLoop {
    pub fn new(
        project_key: impl Into<String>,
        root: PathBuf,
        config: EvolutionConfig,
        generator: QuestionGenerator,
        guard: Arc<DoomLoopGuard>,
        recorder: LearningRecorder,
        agent: Arc<Agent>,
    ) -> Self {
        Self { project_key: project_key.into(), root, config, generator, guard, recorder, agent }
    }

    /// Drive the loop until `cancel` fires. Checked at the top of every cycle, at
    /// the top of every question iteration, and at the sleep between cycles.
    pub async fn run(&self, cancel: &CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                info!(project = %self.project_key, "evolution loop cancelled before cycle start");
                return;
            }

            if let Err(e) = self.run_cycle(cancel).await {
                warn!(project = %self.project_key, error = %e, "evolution cycle failed, will retry next interval");
            }

            if cancel.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_secs(self.config.interval_secs)).await;
        }
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let mut memory = ProjectMemory::load(&self.root, &self.project_key).await?;

        let request = QuestionRequest {
            project_key: self.project_key.clone(),
            tech_stack: Vec::new(),
            domains: Vec::new(),
            recent_questions: Vec::new(),
            knowledge_gaps: memory.domain_knowledge.clone(),
            count: self.config.questions_per_cycle,
        };
        let questions = self.generator.generate(&request).await?;
        info!(project = %self.project_key, count = questions.len(), "generated evolution questions");

        for question in &questions {
            if cancel.is_cancelled() {
                info!(project = %self.project_key, "evolution loop cancelled mid-cycle");
                return Ok(());
            }

            let quota = memory.evolution_status.today_count();
            let decision = self.guard.should_skip_question(&self.project_key, &question.question, quota).await;
            if decision.should_skip {
                info!(project = %self.project_key, reason = ?decision.reason, "skipping question");
                continue;
            }

            EvolutionState { current_question: Some(question.question.clone()), partial_steps: Vec::new() }
                .save(&self.root)
                .await?;

            match self.explore(question, cancel).await {
                Ok(result) => {
                    self.guard.record_success(&self.project_key);
                    let record = self.recorder.summarize(&self.project_key, &result).await?;
                    self.recorder.save(&record).await?;
                    memory.learning_record_ids.push(record.id.clone());
                    memory.evolution_status.update(1);
                    memory.save(&self.root).await?;
                }
                Err(e) => {
                    warn!(project = %self.project_key, question = %question.question, error = %e, "exploration failed");
                    self.guard.record_failure(&self.project_key);
                }
            }

            EvolutionState::clear(&self.root).await?;
        }

        Ok(())
    }

    /// Run one question through the agent loop in a fresh, unattended session and
    /// fold the resulting tool parts into an exploration transcript.
    async fn explore(
        &self,
        question: &GeneratedQuestion,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ExplorationResult> {
        let mut session = Session::new(&self.project_key);
        let answer = self.agent.run_turn(&mut session, &question.question, cancel, None, None).await?;

        let mut steps = Vec::new();
        let mut source_files = Vec::new();
        let mut had_error = false;
        for msg in &session.messages {
            for part in &msg.parts {
                if let PartPayload::Tool { tool_name, parameters, state, result, error, .. } = &part.payload {
                    let is_error = matches!(state, ToolState::Error);
                    had_error = had_error || is_error;
                    let summary = result
                        .as_ref()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .or_else(|| error.clone())
                        .unwrap_or_default();
                    steps.push(ExplorationStep { tool_name: tool_name.clone(), is_error, summary });

                    for key in ["path", "relativePath", "file", "filePath"] {
                        if let Some(path) = parameters.get(key).and_then(|v| v.as_str()) {
                            if !source_files.iter().any(|p: &String| p == path) {
                                source_files.push(path.to_string());
                            }
                        }
                    }
                }
            }
        }

        if had_error && steps.iter().all(|s| s.is_error) {
            anyhow::bail!("exploration of \"{}\" produced only failing tool calls", question.question);
        }

        steps.push(ExplorationStep { tool_name: "final_answer".to_string(), is_error: false, summary: answer });
        Ok(ExplorationResult { question: question.question.clone(), question_type: question.kind, steps, source_files })
    }
}
