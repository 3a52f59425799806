//! Question generator.
//!
//! Routed through `LLMProvider::generate_json`. An unparseable `type` falls back to
//! `BUSINESS_LOGIC` rather than rejecting the whole item; a genuinely malformed
//! item (missing `question`, or a `priority` that won't parse as a number at all)
//! is dropped instead of being padded with a substitute value.

use crate::llm::provider::LLMProvider;
use crate::llm::types::{GenerateConfig, Message as LlmMessage};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionType {
    CodeStructure,
    BusinessLogic,
    DataFlow,
    Dependency,
    Configuration,
    ErrorAnalysis,
    BestPractice,
    DomainKnowledge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedQuestion {
    pub question: String,
    #[serde(rename = "type")]
    pub kind: QuestionType,
    pub priority: u8,
    pub reason: String,
    #[serde(default)]
    pub suggested_tools: Vec<String>,
    pub expected_outcome: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRequest {
    pub project_key: String,
    pub tech_stack: Vec<String>,
    pub domains: Vec<String>,
    pub recent_questions: Vec<String>,
    pub knowledge_gaps: Vec<String>,
    pub count: usize,
}

pub struct QuestionGenerator {
    provider: Arc<dyn LLMProvider>,
}

impl QuestionGenerator {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }

    pub async fn generate(&self, request: &QuestionRequest) -> Result<Vec<GeneratedQuestion>> {
        let prompt = format!(
            "You are exploring the codebase at project \"{}\". Tech stack: {:?}. \
             Domains: {:?}. Knowledge gaps to address: {:?}. Do not repeat any of \
             these already-asked questions: {:?}.\n\n\
             Generate up to {} exploration questions as a JSON object: \
             {{\"questions\": [{{\"question\": str, \"type\": one of \
             CODE_STRUCTURE|BUSINESS_LOGIC|DATA_FLOW|DEPENDENCY|CONFIGURATION|ERROR_ANALYSIS|BEST_PRACTICE|DOMAIN_KNOWLEDGE, \
             \"priority\": 1-10, \"reason\": str, \"suggestedTools\": [str], \
             \"expectedOutcome\": str}}]}}.",
            request.project_key,
            request.tech_stack,
            request.domains,
            request.knowledge_gaps,
            request.recent_questions,
            request.count,
        );

        let response = self
            .provider
            .generate_json(&[LlmMessage::user(&prompt)], &GenerateConfig::default())
            .await
            .context("question generator: LLM call failed")?;

        let raw_items = response
            .get("questions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut questions: Vec<GeneratedQuestion> = raw_items
            .into_iter()
            .filter_map(parse_question)
            .collect();

        questions.sort_by(|a, b| b.priority.cmp(&a.priority));
        questions.truncate(request.count);
        Ok(questions)
    }
}

fn parse_question(raw: Value) -> Option<GeneratedQuestion> {
    let obj = raw.as_object()?;
    let question = obj.get("question")?.as_str()?.trim().to_string();
    if question.is_empty() {
        return None;
    }

    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_value(Value::String(s.to_string())).ok())
        .unwrap_or(QuestionType::BusinessLogic);

    let priority_raw = obj.get("priority").and_then(Value::as_f64)?;
    let priority = priority_raw.round().clamp(1.0, 10.0) as u8;

    let reason = obj.get("reason").and_then(Value::as_str).unwrap_or_default().to_string();
    let expected_outcome = obj
        .get("expectedOutcome")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let suggested_tools = obj
        .get("suggestedTools")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    Some(GeneratedQuestion { question, kind, priority, reason, suggested_tools, expected_outcome })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{Content, GenerateResponse, StopReason, ToolSchema, Usage};
    use async_trait::async_trait;
    use serde_json::json;

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

    fn request() -> QuestionRequest {
        QuestionRequest {
            project_key: "P1".into(),
            tech_stack: vec!["rust".into()],
            domains: vec!["backend".into()],
            recent_questions: vec![],
            knowledge_gaps: vec![],
            count: 5,
        }
    }

    #[tokio::test]
    async fn sorts_by_descending_priority_and_respects_count() {
        let provider = StubProvider(json!({
            "questions": [
                {"question": "low", "type": "BEST_PRACTICE", "priority": 2, "reason": "r", "expectedOutcome": "o"},
                {"question": "high", "type": "DATA_FLOW", "priority": 9, "reason": "r", "expectedOutcome": "o"},
            ]
        }));
        let generator = QuestionGenerator::new(Arc::new(provider));
        let result = generator.generate(&request()).await.unwrap();
        assert_eq!(result[0].question, "high");
        assert_eq!(result[1].question, "low");
    }

    #[tokio::test]
    async fn priority_is_clamped_to_one_through_ten() {
        let provider = StubProvider(json!({
            "questions": [
                {"question": "over", "type": "BEST_PRACTICE", "priority": 99, "reason": "r", "expectedOutcome": "o"}
            ]
        }));
        let generator = QuestionGenerator::new(Arc::new(provider));
        let result = generator.generate(&request()).await.unwrap();
        assert_eq!(result[0].priority, 10);
    }

    #[tokio::test]
    async fn unparseable_type_falls_back_to_business_logic() {
        let provider = StubProvider(json!({
            "questions": [
                {"question": "q", "type": "NOT_A_REAL_TYPE", "priority": 5, "reason": "r", "expectedOutcome": "o"}
            ]
        }));
        let generator = QuestionGenerator::new(Arc::new(provider));
        let result = generator.generate(&request()).await.unwrap();
        assert_eq!(result[0].kind, QuestionType::BusinessLogic);
    }

    #[tokio::test]
    async fn malformed_item_is_dropped_not_substituted() {
        let provider = StubProvider(json!({
            "questions": [
                {"question": "", "type": "BEST_PRACTICE", "priority": 5, "reason": "r", "expectedOutcome": "o"},
                {"type": "BEST_PRACTICE", "priority": 5, "reason": "r", "expectedOutcome": "o"},
                {"question": "valid", "type": "BEST_PRACTICE", "priority": 5, "reason": "r", "expectedOutcome": "o"},
            ]
        }));
        let generator = QuestionGenerator::new(Arc::new(provider));
        let result = generator.generate(&request()).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].question, "valid");
    }
}
