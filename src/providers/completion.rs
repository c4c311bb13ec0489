//! OpenAI-compatible chat completion client (text + vision models).

use crate::error::{Result, RagError};
use crate::providers::{CompletionPurpose, CompletionProvider, CompletionRequest};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Chat completion client bound to a text model and a vision model
pub struct OpenAICompletion {
    http: Client,
    api_key: String,
    base_url: String,
    text_model: String,
    vision_model: String,
}

impl OpenAICompletion {
    pub fn new(
        api_key: String,
        base_url: &str,
        text_model: String,
        vision_model: String,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("ragserve/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            text_model,
            vision_model,
        })
    }

    async fn chat(&self, model: &str, messages: Vec<ChatMessage>, temperature: f32) -> Result<String> {
        let request = ChatRequest {
            model,
            messages,
            temperature,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::Completion(format!("Request to {} failed: {}", model, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RagError::Completion(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(RagError::Completion(format!("Completion API error {}: {}", status, text)));
        }

        let chat_response: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| RagError::Completion(format!("Invalid response: {}", e)))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| RagError::Completion(format!("Empty response from {}", model)))
    }
}

fn text_messages(request: CompletionRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = request.system {
        messages.push(ChatMessage {
            role: "system",
            content: Value::String(system),
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: Value::String(request.prompt),
    });
    messages
}

fn image_message(prompt: &str, mime_type: &str, image: &[u8]) -> ChatMessage {
    let data_url = format!("data:{};base64,{}", mime_type, STANDARD.encode(image));
    ChatMessage {
        role: "user",
        content: json!([
            { "type": "text", "text": prompt },
            { "type": "image_url", "image_url": { "url": data_url } }
        ]),
    }
}

#[async_trait]
impl CompletionProvider for OpenAICompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        // Extraction output is parsed, so keep it deterministic
        let temperature = match request.purpose {
            CompletionPurpose::Extraction => 0.0,
            CompletionPurpose::Answer => 0.2,
        };
        self.chat(&self.text_model, text_messages(request), temperature).await
    }

    async fn describe_image(&self, prompt: &str, mime_type: &str, image: &[u8]) -> Result<String> {
        let message = image_message(prompt, mime_type, image);
        self.chat(&self.vision_model, vec![message], 0.0).await
    }
}
