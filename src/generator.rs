/// Text generation module
///
/// Turns a topic and a style template into candidate post text using the
/// Gemini `generateContent` endpoint. No retries happen here; the workflow
/// decides whether to ask again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TOPIC_SLOT;
use crate::error::BotError;

/// Generated text that has not been published yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub text: String,
    pub topic: String,
    pub style_template: String,
}

/// Anything that can produce candidate text
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, topic: &str, style_template: &str) -> Result<Candidate, BotError>;
}

/// Substitute the topic into every `{topic}` slot of the template
pub fn render_prompt(style_template: &str, topic: &str) -> String {
    style_template.replace(TOPIC_SLOT, topic)
}

/// Gemini API request/response structures
#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

/// Gemini-backed generator
pub struct GeminiGenerator {
    api_key: String,
    model: String,
    base_url: String,
    http_client: reqwest::Client,
}

impl GeminiGenerator {
    pub fn new(
        http_client: reqwest::Client,
        base_url: &str,
        api_key: &str,
        model: &str,
    ) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.trim_start_matches("models/").to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }

    fn extract_text(response: GenerateContentResponse) -> String {
        response
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TextGenerator for GeminiGenerator {
    async fn generate(&self, topic: &str, style_template: &str) -> Result<Candidate, BotError> {
        let prompt = render_prompt(style_template, topic);
        log::debug!("Generating text for topic '{}' with prompt: {}", topic, prompt);

        let request = GenerateContentRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart { text: Some(prompt) }],
            }],
        };

        let response = self
            .http_client
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| BotError::Generation(format!("request failed: {}", e)))?;

        // Check HTTP status
        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(BotError::Generation(format!(
                "Gemini API error (status {}): {}",
                status, error_text
            )));
        }

        let response: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| BotError::Generation(format!("invalid response body: {}", e)))?;

        let text = Self::extract_text(response).trim().to_string();
        log::info!("Generated text ({} chars) for topic '{}'", text.chars().count(), topic);

        Ok(Candidate {
            text,
            topic: topic.to_string(),
            style_template: style_template.to_string(),
        })
    }
}
