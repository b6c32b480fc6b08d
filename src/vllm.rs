//! Client for the OpenAI-compatible chat completions API served by vLLM.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{DynamicImage, ImageFormat};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::{debug, info};

use crate::config::ParserConfig;
use crate::prompt::IMAGE_PLACEHOLDER;

/// Chat-completions client bound to one model on one server.
#[derive(Clone)]
pub struct VllmClient {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
    top_p: f32,
    max_completion_tokens: u32,
}

impl VllmClient {
    pub fn new(config: &ParserConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url()),
            model: config.model_name.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_completion_tokens: config.max_completion_tokens,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one image plus an instruction and return the raw completion text.
    pub async fn infer(&self, image: &DynamicImage, instruction: &str) -> Result<String> {
        let data_url = image_to_data_url(image)?;
        let request = self.build_request(data_url, instruction);
        self.send_request(request).await
    }

    fn build_request(&self, image_url: String, instruction: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: Role::User,
                content: vec![
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: image_url },
                    },
                    ContentPart::Text {
                        text: format!("{}{}", IMAGE_PLACEHOLDER, instruction),
                    },
                ],
            }],
            temperature: self.temperature,
            top_p: self.top_p,
            max_completion_tokens: self.max_completion_tokens,
        }
    }

    async fn send_request(&self, request: ChatCompletionRequest) -> Result<String> {
        debug!("Sending request to vLLM: model={} url={}", request.model, self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth("0")
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to reach model server at {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Model server error ({}): {}", status, error_text);
        }

        let response: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse model server response")?;

        if let Some(usage) = &response.usage {
            info!(
                "vLLM response: {} tokens (prompt: {}, completion: {})",
                usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
            );
        }

        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

/// Encode an image as a PNG `data:` URL.
pub fn image_to_data_url(image: &DynamicImage) -> Result<String> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .context("Failed to encode image as PNG")?;
    Ok(format!("data:image/png;base64,{}", BASE64.encode(buf.into_inner())))
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    top_p: f32,
    max_completion_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: Role,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    User,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}
