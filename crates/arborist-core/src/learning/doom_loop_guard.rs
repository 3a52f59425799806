//! Doom-loop guard.
//!
//! Three independent checks composed in order (cheapest first): backoff grounded
//! on `llm/failover.rs`'s doubling-backoff retry shape, a daily quota grounded on
//! `tool_policy/layers.rs::RateLimitLayer`'s sliding window adapted to a
//! per-UTC-day counter, and semantic dedup grounded on the vector store's cosine
//! search.

use crate::embedding::EmbeddingProvider;
use crate::vector_store::VectorStore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct DoomLoopConfig {
    pub max_consecutive_errors: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_daily_questions: u32,
    pub duplicate_threshold: f32,
}

impl Default for DoomLoopConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 3,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(3600),
            max_daily_questions: 50,
            duplicate_threshold: 0.85,
        }
    }
}

#[derive(Default)]
struct ProjectState {
    consecutive_errors: u32,
}

pub struct SkipDecision {
    pub should_skip: bool,
    pub reason: Option<String>,
}

impl SkipDecision {
    fn allow() -> Self {
        Self { should_skip: false, reason: None }
    }
    fn skip(reason: impl Into<String>) -> Self {
        Self { should_skip: true, reason: Some(reason.into()) }
    }
}

pub struct DoomLoopGuard {
    config: DoomLoopConfig,
    state: DashMap<String, ProjectState>,
    vector_store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl DoomLoopGuard {
    pub fn new(config: DoomLoopConfig, vector_store: Arc<VectorStore>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { config, state: DashMap::new(), vector_store, embedder }
    }

    /// Backoff duration to sleep before generating the next question, derived from
    /// the current consecutive-error count: `min(base * 2^errors, max)`.
    pub fn backoff_for(&self, project_key: &str) -> Duration {
        let errors = self.state.get(project_key).map(|s| s.consecutive_errors).unwrap_or(0);
        if errors == 0 {
            return Duration::ZERO;
        }
        let scaled = self.config.base_backoff.saturating_mul(1u32.checked_shl(errors).unwrap_or(u32::MAX));
        scaled.min(self.config.max_backoff)
    }

    /// `questions_today` comes from the caller's durable `ProjectMemory.evolution_status`
    /// (already rolled over per UTC day there) rather than a separate in-process
    /// counter, so the quota survives a process restart instead of resetting to zero.
    pub async fn should_skip_question(&self, project_key: &str, question: &str, questions_today: u32) -> SkipDecision {
        {
            let state = self.state.entry(project_key.to_string()).or_default();
            if state.consecutive_errors >= self.config.max_consecutive_errors {
                return SkipDecision::skip(format!(
                    "backoff: {} consecutive failures, next attempt after {:?}",
                    state.consecutive_errors,
                    self.backoff_for(project_key)
                ));
            }
        }

        if questions_today >= self.config.max_daily_questions {
            return SkipDecision::skip(format!(
                "daily quota exhausted: {} >= {}",
                questions_today, self.config.max_daily_questions
            ));
        }

        match self.embedder.embed(question).await {
            Ok(vector) => {
                let hits = self.vector_store.search(&vector, 1).await;
                if let Some(top) = hits.first() {
                    if top.score >= self.config.duplicate_threshold {
                        return SkipDecision::skip(format!(
                            "semantic duplicate of {} (similarity {:.3})",
                            top.fragment.id(),
                            top.score
                        ));
                    }
                }
            }
            Err(_) => {
                // Embedding unavailable: fail open on the dedup check alone, the
                // other two checks already ran.
            }
        }

        SkipDecision::allow()
    }

    pub fn record_failure(&self, project_key: &str) {
        let mut state = self.state.entry(project_key.to_string()).or_default();
        state.consecutive_errors += 1;
    }

    pub fn record_success(&self, project_key: &str) {
        let mut state = self.state.entry(project_key.to_string()).or_default();
        state.consecutive_errors = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedding;
    use crate::vector_store::VectorFragment;

    fn guard() -> (DoomLoopGuard, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VectorStore::new(dir.path().to_path_buf(), 32, 1_000_000));
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(MockEmbedding::new(32));
        (DoomLoopGuard::new(DoomLoopConfig::default(), store, embedder), dir)
    }

    #[tokio::test]
    async fn backoff_doubles_with_each_consecutive_failure() {
        let (guard, _dir) = guard();
        guard.record_failure("P1");
        let b1 = guard.backoff_for("P1");
        guard.record_failure("P1");
        let b2 = guard.backoff_for("P1");
        assert!(b2 > b1);
    }

    #[tokio::test]
    async fn skips_after_max_consecutive_errors() {
        let (guard, _dir) = guard();
        for _ in 0..3 {
            guard.record_failure("P1");
        }
        let decision = guard.should_skip_question("P1", "why does X happen?", 0).await;
        assert!(decision.should_skip);
        assert!(decision.reason.unwrap().contains("backoff"));
    }

    #[tokio::test]
    async fn success_resets_consecutive_errors() {
        let (guard, _dir) = guard();
        guard.record_failure("P1");
        guard.record_failure("P1");
        guard.record_success("P1");
        assert_eq!(guard.backoff_for("P1"), Duration::ZERO);
    }

    #[tokio::test]
    async fn semantic_duplicate_is_skipped() {
        let (guard, _dir) = guard();
        let embedder = MockEmbedding::new(32);
        let vector = embedder.embed("why does caching fail under load?").await.unwrap();
        guard
            .vector_store
            .add(VectorFragment::new("question:1", "why does caching fail under load?", Some(vector)))
            .await
            .unwrap();

        let decision = guard
            .should_skip_question("P1", "why does caching fail under load?", 0)
            .await;
        assert!(decision.should_skip);
    }

    #[tokio::test]
    async fn distinct_question_is_allowed() {
        let (guard, _dir) = guard();
        let decision = guard.should_skip_question("P1", "a fresh question", 0).await;
        assert!(!decision.should_skip);
    }

    #[tokio::test]
    async fn skips_once_caller_supplied_quota_is_reached() {
        let (guard, _dir) = guard();
        let quota = DoomLoopConfig::default().max_daily_questions;
        let decision = guard.should_skip_question("P1", "a fresh question", quota).await;
        assert!(decision.should_skip);
        assert!(decision.reason.unwrap().contains("quota"));
    }
}
