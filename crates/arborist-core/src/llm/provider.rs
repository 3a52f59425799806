use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::types::{GenerateConfig, GenerateResponse, Message, StreamChunk, ToolSchema};

/// LLM provider trait - abstraction over Anthropic, OpenAI, etc.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Generate a response from the LLM (non-streaming)
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        config: &GenerateConfig,
    ) -> Result<GenerateResponse>;

    /// Generate a streaming response from the LLM.
    /// Default impl wraps non-streaming generate() as a single-shot stream.
    async fn generate_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        config: &GenerateConfig,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>> {
        let response = self.generate(messages, tools, config).await?;
        Ok(response_to_stream(response))
    }

    /// Whether this provider supports vision (image content)
    fn supports_vision(&self) -> bool;

    /// Provider model name for logging/tracking
    fn model_name(&self) -> &str;

    /// Generate a response constrained to a single JSON object matching no particular
    /// schema beyond "valid JSON". Used by the question generator (§4.11) and the
    /// learning recorder (§4.13), neither of which needs tool calling.
    ///
    /// Default impl appends a JSON-only instruction to the system prompt and strips
    /// a markdown code fence if the model wraps its answer in one anyway.
    async fn generate_json(&self, messages: &[Message], config: &GenerateConfig) -> Result<Value> {
        let mut json_config = config.clone();
        let instruction = "Respond with a single JSON object and nothing else. Do not wrap it in markdown code fences.";
        json_config.system_prompt = Some(match &config.system_prompt {
            Some(existing) => format!("{existing}\n\n{instruction}"),
            None => instruction.to_string(),
        });

        let response = self.generate(messages, &[], &json_config).await?;
        let raw = response.content.extract_text();
        let trimmed = strip_code_fence(&raw);
        serde_json::from_str(trimmed)
            .with_context(|| format!("generate_json: model output was not valid JSON: {trimmed}"))
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let without_lang = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_lang.strip_suffix("```").unwrap_or(without_lang).trim()
}

/// Build a fallback stream from a GenerateResponse (for non-streaming providers)
pub fn response_to_stream(response: GenerateResponse) -> tokio::sync::mpsc::Receiver<StreamChunk> {
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    tokio::spawn(async move {
        let text = response.content.extract_text();
        if !text.is_empty() {
            let _ = tx.send(StreamChunk::TextDelta(text)).await;
        }
        for tc in response.content.extract_tool_calls() {
            let _ = tx
                .send(StreamChunk::ToolCallStart {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                })
                .await;
            let input_str = tc.input.to_string();
            if input_str != "null" {
                let _ = tx
                    .send(StreamChunk::ToolCallDelta {
                        id: tc.id.clone(),
                        input_delta: input_str,
                    })
                    .await;
            }
        }
        let _ = tx
            .send(StreamChunk::Done {
                stop_reason: response.stop_reason,
                usage: response.usage,
            })
            .await;
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{Content, StopReason, Usage};

    struct FencedProvider;

    #[async_trait]
    impl LLMProvider for FencedProvider {
        async fn generate(
            &self,
            _messages: &[Message],
            _tools: &[ToolSchema],
            config: &GenerateConfig,
        ) -> Result<GenerateResponse> {
            assert!(config.system_prompt.as_ref().unwrap().contains("JSON object"));
            Ok(GenerateResponse {
                content: Content::Text {
                    text: "```json\n{\"question\": \"why?\"}\n```".to_string(),
                },
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
                model: "mock".to_string(),
            })
        }
        fn supports_vision(&self) -> bool {
            false
        }
        fn model_name(&self) -> &str {
            "mock"
        }
    }

    #[tokio::test]
    async fn generate_json_strips_code_fence() {
        let provider = FencedProvider;
        let value = provider
            .generate_json(&[Message::user("anything")], &GenerateConfig::default())
            .await
            .unwrap();
        assert_eq!(value["question"], "why?");
    }

    #[test]
    fn strip_code_fence_handles_bare_and_langtagged() {
        assert_eq!(strip_code_fence("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("{}"), "{}");
    }
}
