//! Panel node transport and verdict parsing
//!
//! Every configured endpoint speaks the OpenAI-compatible chat-completion
//! wire shape. The transport returns the raw completion text; parsing strips
//! code-fence markers before reading the verdict JSON so models that wrap
//! their answer in a markdown block still count as valid.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::LlmVerdict;
use crate::config::LlmEndpointConfig;
use crate::types::Result as CorridorResult;

/// Transport seam: one completion call per node per request
#[async_trait]
pub trait VerdictTransport: Send + Sync {
    async fn complete(
        &self,
        endpoint: &LlmEndpointConfig,
        prompt: &str,
    ) -> Result<String, String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// reqwest transport for OpenAI-compatible endpoints
pub struct OpenAiCompatTransport {
    client: reqwest::Client,
}

impl OpenAiCompatTransport {
    pub fn new(timeout: Duration) -> CorridorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::CorridorError::Internal(format!("http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl VerdictTransport for OpenAiCompatTransport {
    async fn complete(
        &self,
        endpoint: &LlmEndpointConfig,
        prompt: &str,
    ) -> Result<String, String> {
        let body = ChatRequest {
            model: &endpoint.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.2,
        };

        let mut builder = self.client.post(&endpoint.url).json(&body);
        if let Some(key) = &endpoint.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("http {}", response.status()));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| format!("bad completion body: {}", e))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| "empty completion".to_string())
    }
}

/// Strip markdown code-fence markers around a model answer
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

/// Parse a node's completion into a verdict.
///
/// Tolerates fenced answers and leading/trailing prose around the JSON
/// object; anything else marks the node invalid.
pub fn parse_verdict(content: &str) -> Result<LlmVerdict, String> {
    let stripped = strip_code_fences(content);
    let json = match (stripped.find('{'), stripped.rfind('}')) {
        (Some(start), Some(end)) if end > start => &stripped[start..=end],
        _ => return Err("no JSON object in response".to_string()),
    };
    let verdict: LlmVerdict =
        serde_json::from_str(json).map_err(|e| format!("verdict parse: {}", e))?;

    if verdict.recommended_aid > 5 {
        return Err(format!("recommended_aid {} out of range", verdict.recommended_aid));
    }
    if verdict.fulfiller_type > 1 {
        return Err(format!("fulfiller_type {} out of range", verdict.fulfiller_type));
    }
    if verdict.confidence > 100 {
        return Err(format!("confidence {} out of range", verdict.confidence));
    }
    Ok(verdict)
}
