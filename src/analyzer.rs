//! Vision analyzer backed by an OpenAI-compatible chat completions endpoint

use crate::error::AnalysisError;
use crate::image::{ImageConfig, ImageEncoder};
use crate::video::VideoFrame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const SYSTEM_PROMPT: &str = "Analyze parking lot images and identify available spaces.";

pub const USER_PROMPT: &str = "Analyze this parking lot image and respond in this exact format:\n\
1. Available spaces: [number]\n\
2. Recommended spots:\n\
- [spot description]\n\
- [spot description]\n\
...";

/// Longest error body kept in [`AnalysisError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Turns one frame into the model's free-text answer.
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn analyze(&self, frame: &VideoFrame) -> Result<String, AnalysisError>;
}

#[derive(Clone)]
pub struct AnalyzerConfig {
    pub api_key: String,
    /// Base URL up to and including the version segment, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub image: ImageConfig,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 300,
            timeout: Duration::from_secs(30),
            image: ImageConfig::default(),
        }
    }
}

impl std::fmt::Debug for AnalyzerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzerConfig")
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .field("image", &self.image)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: MessageContent<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

pub struct OpenAiVisionAnalyzer {
    client: reqwest::Client,
    config: AnalyzerConfig,
    encoder: ImageEncoder,
}

impl OpenAiVisionAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        let encoder = ImageEncoder::new(config.image);
        Ok(Self { client, config, encoder })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl VisionAnalyzer for OpenAiVisionAnalyzer {
    async fn analyze(&self, frame: &VideoFrame) -> Result<String, AnalysisError> {
        let data_url = self.encoder.encode_data_url(&frame.image)?;

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(SYSTEM_PROMPT),
                },
                ChatMessage {
                    role: "user",
                    content: MessageContent::Parts(vec![
                        ContentPart::Text { text: USER_PROMPT },
                        ContentPart::ImageUrl { image_url: ImageUrl { url: data_url } },
                    ]),
                },
            ],
            max_tokens: self.config.max_tokens,
        };

        let response = self.client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AnalysisError::RateLimited);
        }
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(AnalysisError::Status { status: status.as_u16(), body });
        }

        let parsed: ChatResponse = response.json().await?;
        let content = parsed.choices.into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| AnalysisError::Malformed("response has no message content".to_string()))?;

        debug!(frame_index = frame.index, chars = content.len(), "Received analysis");

        Ok(content)
    }
}
