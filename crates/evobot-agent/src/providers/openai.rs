// ABOUTME: OpenAI-compatible adapter implementing the Synthesizer trait.
// ABOUTME: Sends the transcript to the Chat Completions API and parses the JSON reply into draft fields.

use async_trait::async_trait;
use evobot_core::DraftFields;
use serde_json::{Value, json};

use crate::synthesis::{SYSTEM_PROMPT, SynthesisError, Synthesizer, fields_from_reply, transcript_prompt};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const MAX_TOKENS: u32 = 1024;

/// Synthesizer backed by any OpenAI-compatible Chat Completions endpoint.
pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiSynthesizer {
    pub fn new(api_key: String, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn build_request_body(&self, transcript: &[String]) -> Value {
        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": transcript_prompt(transcript) }
            ]
        })
    }

    /// Pull the assistant text out of a Chat Completions response and parse it.
    pub fn parse_response(response_body: &Value) -> Result<DraftFields, SynthesisError> {
        let content = response_body
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .ok_or_else(|| SynthesisError::InvalidResponse("missing choices[0].message.content".to_string()))?;

        fields_from_reply(content)
    }
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, transcript: &[String]) -> Result<DraftFields, SynthesisError> {
        let body = self.build_request_body(transcript);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| SynthesisError::Provider(format!("HTTP request failed: {}", e)))?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SynthesisError::RateLimited);
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SynthesisError::Provider(
                "Unauthorized: check OPENAI_API_KEY".to_string(),
            ));
        }

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Provider(format!(
                "API error {}: {}",
                status, error_body
            )));
        }

        let response_body: Value = response
            .json()
            .await
            .map_err(|e| SynthesisError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        tracing::debug!("synthesis reply received from {}", self.model);
        Self::parse_response(&response_body)
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthesizer() -> OpenAiSynthesizer {
        OpenAiSynthesizer::new(
            "test-key".to_string(),
            Some("https://llm.example.com/".to_string()),
            None,
        )
    }

    #[test]
    fn defaults_and_trailing_slash() {
        let s = synthesizer();
        assert_eq!(s.base_url, "https://llm.example.com");
        assert_eq!(s.model_name(), DEFAULT_MODEL);
        assert_eq!(s.provider_name(), "openai");
    }

    #[test]
    fn request_body_carries_prompt_and_transcript() {
        let body = synthesizer().build_request_body(&["raid friday".to_string(), "20 people".to_string()]);

        assert_eq!(body["model"], DEFAULT_MODEL);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[0]["content"].as_str().unwrap().contains("max_slots"));
        assert_eq!(messages[1]["content"], "TRANSCRIPT:\nraid friday\n20 people");
    }

    #[test]
    fn parses_completion_content() {
        let response = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "```json\n{\"name\": \"Raid\", \"start_time\": \"01/02/2031 20:00\", \"max_slots\": 12}\n```"
                },
                "finish_reason": "stop"
            }]
        });

        let fields = OpenAiSynthesizer::parse_response(&response).unwrap();
        assert_eq!(fields.name.as_deref(), Some("Raid"));
        assert_eq!(fields.max_slots, Some(12));
    }

    #[test]
    fn missing_content_is_invalid() {
        let response = json!({"choices": []});
        assert!(matches!(
            OpenAiSynthesizer::parse_response(&response),
            Err(SynthesisError::InvalidResponse(_))
        ));
    }
}
