//! Vision classification client.
//!
//! `Classifier` is the seam the pipeline depends on. `OpenAiClassifier`
//! talks to an OpenAI-compatible chat completions endpoint and asks for a
//! JSON-schema constrained answer (labels + description).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

const MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed classification response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("malformed classification response: {0}")]
    Malformed(String),

    #[error("model refused to classify: {0}")]
    Refused(String),

    #[error("classification response had no content")]
    EmptyContent,

    #[error("classification timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("classification aborted: {0}")]
    Aborted(String),
}

/// What the classifier is asked about one capture.
#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub capture_id: i64,
    pub image: Arc<Vec<u8>>,
    pub prompt: String,
}

/// A successful classification. Label names are as returned by the service;
/// normalization happens during reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub description: String,
    pub labels: Vec<String>,
    /// Full service response, kept for diagnostics.
    pub raw: Option<String>,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<Classification, ClassificationError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    /// Vision detail hint: "low", "high" or "auto".
    pub image_detail: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ActivityClassification {
    labels: Vec<String>,
    description: String,
}

#[derive(Clone)]
pub struct OpenAiClassifier {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiClassifier {
    pub fn new(config: OpenAiConfig) -> Result<Self, ClassificationError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    fn request_body(&self, request: &ClassificationRequest) -> serde_json::Value {
        let mime = match image::guess_format(request.image.as_slice()) {
            Ok(image::ImageFormat::Jpeg) => "image/jpeg",
            _ => "image/png",
        };
        let image_url = format!("data:{mime};base64,{}", BASE64.encode(request.image.as_slice()));
        json!({
            "model": self.config.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": request.prompt },
                    {
                        "type": "image_url",
                        "image_url": { "url": image_url, "detail": self.config.image_detail }
                    }
                ]
            }],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "activity_classification",
                    "strict": true,
                    "schema": {
                        "type": "object",
                        "properties": {
                            "labels": {
                                "type": "array",
                                "items": { "type": "string" },
                                "description": "Activity labels. Reuse existing labels when they fit; several may apply."
                            },
                            "description": {
                                "type": "string",
                                "description": "What the user is doing in this screenshot, 2-3 sentences."
                            }
                        },
                        "required": ["labels", "description"],
                        "additionalProperties": false
                    }
                }
            }
        })
    }
}

/// Extracts labels and description from a chat completions response body.
pub(crate) fn parse_completion(body: &str) -> Result<Classification, ClassificationError> {
    let response: ChatCompletionResponse = serde_json::from_str(body)?;
    let message = response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message)
        .ok_or(ClassificationError::EmptyContent)?;

    if let Some(refusal) = message.refusal {
        return Err(ClassificationError::Refused(refusal));
    }

    let content = message
        .content
        .filter(|content| !content.trim().is_empty())
        .ok_or(ClassificationError::EmptyContent)?;

    let parsed: ActivityClassification = serde_json::from_str(&content)?;
    let description = parsed.description.trim().to_string();
    if description.is_empty() {
        return Err(ClassificationError::Malformed("empty description".into()));
    }

    Ok(Classification {
        description,
        labels: parsed.labels,
        raw: Some(body.to_string()),
    })
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<Classification, ClassificationError> {
        let body = self.request_body(request);
        let mut last_error: Option<ClassificationError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!(
                    "classification attempt {} for capture {} failed, retrying after {}ms",
                    attempt,
                    request.capture_id,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .client
                .post(&self.config.endpoint)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    last_error = Some(ClassificationError::Http(err));
                    continue;
                }
            };

            let status = response.status();
            let text = response.text().await?;

            if status.as_u16() == 429 || status.is_server_error() {
                warn!("classification API returned {status}: {text}");
                last_error = Some(ClassificationError::Api {
                    status: status.as_u16(),
                    message: text,
                });
                continue;
            }

            if !status.is_success() {
                let message = serde_json::from_str::<ApiErrorEnvelope>(&text)
                    .map(|envelope| envelope.error.message)
                    .unwrap_or(text);
                return Err(ClassificationError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            let classification = parse_completion(&text)?;
            debug!(
                "capture {} classified with {} labels",
                request.capture_id,
                classification.labels.len()
            );
            return Ok(classification);
        }

        Err(last_error.unwrap_or(ClassificationError::EmptyContent))
    }
}
