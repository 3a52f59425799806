//! Learning recorder.
//!
//! Owns both the flat-file learning-record store and the vector store together. An
//! embedding failure is logged but does not roll back the record write, so it stays
//! queryable by id even though it won't show up in vector search.

use crate::embedding::EmbeddingProvider;
use crate::learning::question_generator::QuestionType;
use crate::llm::provider::LLMProvider;
use crate::llm::types::{GenerateConfig, Message as LlmMessage};
use crate::vector_store::{VectorFragment, VectorStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplorationStep {
    pub tool_name: String,
    pub is_error: bool,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplorationResult {
    pub question: String,
    pub question_type: QuestionType,
    pub steps: Vec<ExplorationStep>,
    #[serde(default)]
    pub source_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningRecord {
    pub id: String,
    pub project_key: String,
    pub question: String,
    pub question_type: QuestionType,
    pub answer: String,
    pub exploration_path: Vec<String>,
    pub confidence: f32,
    pub source_files: Vec<String>,
    #[serde(default)]
    pub related_records: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub domain: Option<String>,
    pub created_time: DateTime<Utc>,
}

#[derive(Deserialize)]
struct SummaryResponse {
    answer: String,
    confidence: f32,
}

/// Coarse retrieval tag for a question kind, stored alongside the record so
/// vector search can filter by it without deserializing the full JSON.
fn tag_for(kind: QuestionType) -> &'static str {
    match kind {
        QuestionType::CodeStructure => "code_structure",
        QuestionType::BusinessLogic => "business_logic",
        QuestionType::DataFlow => "data_flow",
        QuestionType::Dependency => "dependency",
        QuestionType::Configuration => "configuration",
        QuestionType::ErrorAnalysis => "error_analysis",
        QuestionType::BestPractice => "best_practice",
        QuestionType::DomainKnowledge => "domain_knowledge",
    }
}

pub struct LearningRecorder {
    provider: Arc<dyn LLMProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    vector_store: Arc<VectorStore>,
    records_dir: PathBuf,
}

impl LearningRecorder {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        vector_store: Arc<VectorStore>,
        records_dir: PathBuf,
    ) -> Self {
        Self { provider, embedder, vector_store, records_dir }
    }

    pub async fn summarize(&self, project_key: &str, result: &ExplorationResult) -> Result<LearningRecord> {
        let had_error_step = result.steps.iter().any(|s| s.is_error);
        let transcript = result
            .steps
            .iter()
            .map(|s| format!("[{}{}] {}", s.tool_name, if s.is_error { " ERROR" } else { "" }, s.summary))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Question under exploration: {}\n\nExploration transcript:\n{}\n\n\
             Summarize what was learned as JSON: {{\"answer\": str, \"confidence\": 0.0-1.0}}.",
            result.question, transcript
        );

        let raw = self
            .provider
            .generate_json(&[LlmMessage::user(&prompt)], &GenerateConfig::default())
            .await
            .context("learning recorder: summary generation failed")?;
        let parsed: SummaryResponse =
            serde_json::from_value(raw).context("learning recorder: summary response malformed")?;

        if parsed.answer.trim().is_empty() {
            anyhow::bail!("learning recorder: summary produced a blank answer");
        }

        let confidence = if had_error_step { parsed.confidence.min(0.7) } else { parsed.confidence };
        let exploration_path = result.steps.iter().map(|s| s.tool_name.clone()).collect();
        let tags = vec![tag_for(result.question_type).to_string()];

        Ok(LearningRecord {
            id: Uuid::new_v4().to_string(),
            project_key: project_key.to_string(),
            question: result.question.clone(),
            question_type: result.question_type,
            answer: parsed.answer,
            exploration_path,
            confidence,
            source_files: result.source_files.clone(),
            related_records: Vec::new(),
            tags,
            domain: None,
            created_time: Utc::now(),
        })
    }

    /// Persist `record` to the relational store, then best-effort embed and index
    /// it. The question and answer fragments are embedded together: if either
    /// embed call fails, neither is added, so the pair never shows up half-indexed.
    /// Either way the failure is logged, never rolled back onto the relational write.
    pub async fn save(&self, record: &LearningRecord) -> Result<()> {
        self.persist_relational(record).await?;

        let question_id = format!("learning:{}:question", record.id);
        let answer_id = format!("learning:{}:answer", record.id);

        let question_embed = self.embedder.embed(&record.question).await;
        let answer_embed = self.embedder.embed(&record.answer).await;
        match (question_embed, answer_embed) {
            (Ok(question_vector), Ok(answer_vector)) => {
                self.vector_store
                    .add(VectorFragment::new(question_id, record.question.clone(), Some(question_vector)))
                    .await?;
                self.vector_store
                    .add(VectorFragment::new(answer_id, record.answer.clone(), Some(answer_vector)))
                    .await?;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(record_id = %record.id, error = %e, "failed to embed learning question/answer pair, record remains queryable by id");
            }
        }

        Ok(())
    }

    async fn persist_relational(&self, record: &LearningRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.records_dir).await?;
        let path = self.records_dir.join(format!("{}.json", record.id));
        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    pub async fn load(&self, record_id: &str) -> Result<LearningRecord> {
        let path = self.records_dir.join(format!("{record_id}.json"));
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedding;
    use crate::llm::types::{Content, GenerateResponse, StopReason, ToolSchema, Usage};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct StubProvider(Value);

    #[async_trait]
    impl LLMProvider for StubProvider {
        async fn generate(
            &self,
            _messages: &[LlmMessage],
            _tools: &[ToolSchema],
            _config: &GenerateConfig,
        ) -> Result<GenerateResponse> {
            Ok(GenerateResponse {
                content: Content::Text { text: self.0.to_string() },
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
                model: "mock".into(),
            })
        }
        fn supports_vision(&self) -> bool {
            false
        }
        fn model_name(&self) -> &str {
            "mock"
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            anyhow::bail!("embedding service unreachable")
        }
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("embedding service unreachable")
        }
        fn dimensions(&self) -> usize {
            32
        }
    }

    fn exploration(had_error: bool) -> ExplorationResult {
        ExplorationResult {
            question: "why does X happen?".to_string(),
            question_type: QuestionType::ErrorAnalysis,
            steps: vec![ExplorationStep {
                tool_name: "grep_file".into(),
                is_error: had_error,
                summary: "found relevant code".into(),
            }],
            source_files: vec!["src/lib.rs".into()],
        }
    }

    #[tokio::test]
    async fn confidence_capped_when_any_step_errored() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StubProvider(json!({"answer": "because of caching", "confidence": 0.95}));
        let store = Arc::new(VectorStore::new(dir.path().to_path_buf(), 32, 1_000_000));
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(MockEmbedding::new(32));
        let recorder = LearningRecorder::new(Arc::new(provider), embedder, store, dir.path().join("records"));

        let record = recorder.summarize("P1", &exploration(true)).await.unwrap();
        assert!(record.confidence <= 0.7);
    }

    #[tokio::test]
    async fn blank_answer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StubProvider(json!({"answer": "   ", "confidence": 0.5}));
        let store = Arc::new(VectorStore::new(dir.path().to_path_buf(), 32, 1_000_000));
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(MockEmbedding::new(32));
        let recorder = LearningRecorder::new(Arc::new(provider), embedder, store, dir.path().join("records"));

        let err = recorder.summarize("P1", &exploration(false)).await.unwrap_err();
        assert!(err.to_string().contains("blank"));
    }

    #[tokio::test]
    async fn save_persists_relational_record_even_when_embedding_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VectorStore::new(dir.path().to_path_buf(), 32, 1_000_000));
        let recorder = LearningRecorder::new(
            Arc::new(StubProvider(json!({}))),
            Arc::new(FailingEmbedder),
            store,
            dir.path().join("records"),
        );

        let record = LearningRecord {
            id: "abc".to_string(),
            project_key: "P1".to_string(),
            question: "q".to_string(),
            question_type: QuestionType::BusinessLogic,
            answer: "a".to_string(),
            exploration_path: vec!["grep_file".into()],
            confidence: 0.5,
            source_files: vec![],
            related_records: vec![],
            tags: vec!["business_logic".into()],
            domain: None,
            created_time: Utc::now(),
        };

        recorder.save(&record).await.unwrap();
        let loaded = recorder.load("abc").await.unwrap();
        assert_eq!(loaded.answer, "a");
    }

    struct PartialFailEmbedder;

    #[async_trait]
    impl EmbeddingProvider for PartialFailEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text == "a" {
                anyhow::bail!("embedding service unreachable for answer")
            }
            Ok(vec![0.0; 32])
        }
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("unused in this test")
        }
        fn dimensions(&self) -> usize {
            32
        }
    }

    #[tokio::test]
    async fn save_writes_zero_fragments_when_only_one_embed_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VectorStore::new(dir.path().to_path_buf(), 32, 1_000_000));
        let recorder = LearningRecorder::new(
            Arc::new(StubProvider(json!({}))),
            Arc::new(PartialFailEmbedder),
            store.clone(),
            dir.path().join("records"),
        );

        let record = LearningRecord {
            id: "xyz".to_string(),
            project_key: "P1".to_string(),
            question: "q".to_string(),
            question_type: QuestionType::BusinessLogic,
            answer: "a".to_string(),
            exploration_path: vec!["grep_file".into()],
            confidence: 0.5,
            source_files: vec![],
            related_records: vec![],
            tags: vec!["business_logic".into()],
            domain: None,
            created_time: Utc::now(),
        };

        recorder.save(&record).await.unwrap();
        assert!(store.get("learning:xyz:question").await.is_none());
        assert!(store.get("learning:xyz:answer").await.is_none());
    }
}
