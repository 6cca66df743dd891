//! The language-model oracle.
//!
//! `Oracle` is the only seam the pipeline talks to. `OpenAiOracle` speaks the
//! chat.completions protocol (OpenAI or any compatible endpoint) and
//! `TrackedOracle` wraps any oracle to feed the usage recorder.
//!
//! NOTE: We never log the API key and we keep payload truncations short.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::error::OracleError;
use crate::usage::{estimate_tokens, UsageRecord, UsageRecorder};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelTier {
  Fast,
  Strong,
}

/// One oracle call.
#[derive(Clone, Debug)]
pub struct OracleRequest {
  /// Label used for usage accounting (`code_gen`, `verify`, ...).
  pub operation: &'static str,
  pub system: String,
  pub prompt: String,
  /// `data:<mime>;base64,...` URL attached to the user turn.
  pub image: Option<String>,
  pub temperature: f32,
  /// Ask the provider for a JSON object response.
  pub json: bool,
  pub tier: ModelTier,
}

impl OracleRequest {
  pub fn new(operation: &'static str, system: impl Into<String>, prompt: impl Into<String>) -> Self {
    Self {
      operation,
      system: system.into(),
      prompt: prompt.into(),
      image: None,
      temperature: 0.2,
      json: false,
      tier: ModelTier::Strong,
    }
  }

  pub fn json(mut self) -> Self {
    self.json = true;
    self
  }

  pub fn fast(mut self) -> Self {
    self.tier = ModelTier::Fast;
    self
  }

  pub fn temperature(mut self, t: f32) -> Self {
    self.temperature = t;
    self
  }

  pub fn with_image(mut self, image: Option<String>) -> Self {
    self.image = image;
    self
  }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TokenUsage {
  pub prompt_tokens: u64,
  pub completion_tokens: u64,
}

#[derive(Clone, Debug)]
pub struct OracleResponse {
  pub text: String,
  pub model: String,
  pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait Oracle: Send + Sync {
  async fn generate(&self, request: OracleRequest) -> Result<OracleResponse, OracleError>;

  /// Model a request of this tier would go to. Used to attribute failed calls.
  fn model_for(&self, _tier: ModelTier) -> String {
    "unknown".to_string()
  }
}

/// Normalize client-supplied image data into a data URL.
/// Accepts a ready `data:` URL or bare base64 (assumed PNG); rejects anything that does not decode.
pub fn image_data_url(raw: &str) -> Result<String, String> {
  let raw = raw.trim();
  let (prefix, payload) = match raw.strip_prefix("data:") {
    Some(rest) => {
      let (meta, data) = rest.split_once(',').ok_or("data URL without payload")?;
      if !meta.ends_with(";base64") {
        return Err("only base64 data URLs are supported".into());
      }
      (format!("data:{},", meta), data)
    }
    None => ("data:image/png;base64,".to_string(), raw),
  };
  base64::engine::general_purpose::STANDARD
    .decode(payload)
    .map_err(|e| format!("invalid base64 image: {}", e))?;
  Ok(format!("{}{}", prefix, payload))
}

#[derive(Clone)]
pub struct OpenAiOracle {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub fast_model: String,
  pub strong_model: String,
}

impl OpenAiOracle {
  /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env() -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty())?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let fast_model =
      std::env::var("OPENAI_FAST_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
    let strong_model =
      std::env::var("OPENAI_STRONG_MODEL").unwrap_or_else(|_| "gpt-4o".into());

    // Code generation responses are long; keep a generous ceiling.
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(120))
      .build()
      .ok()?;

    Some(Self { client, api_key, base_url, fast_model, strong_model })
  }

  fn model(&self, tier: ModelTier) -> &str {
    match tier {
      ModelTier::Fast => &self.fast_model,
      ModelTier::Strong => &self.strong_model,
    }
  }
}

#[async_trait]
impl Oracle for OpenAiOracle {
  #[instrument(level = "info", skip(self, request), fields(operation = request.operation, model = %self.model(request.tier), json = request.json, has_image = request.image.is_some()))]
  async fn generate(&self, request: OracleRequest) -> Result<OracleResponse, OracleError> {
    let model = self.model(request.tier).to_string();
    let url = format!("{}/chat/completions", self.base_url);

    let user_content = match request.image {
      None => MessageContent::Text(request.prompt),
      Some(url) => MessageContent::Parts(vec![
        ContentPart::Text { text: request.prompt },
        ContentPart::ImageUrl { image_url: ImageUrl { url } },
      ]),
    };
    let req = ChatCompletionRequest {
      model: model.clone(),
      messages: vec![
        ChatMessageReq { role: "system".into(), content: MessageContent::Text(request.system) },
        ChatMessageReq { role: "user".into(), content: user_content },
      ],
      temperature: request.temperature,
      response_format: request.json.then(|| ResponseFormat { r#type: "json_object".into() }),
    };

    let res = self.client.post(&url)
      .header(USER_AGENT, "qvariant-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&req).send().await
      .map_err(|e| OracleError::RequestFailed(e.to_string()))?;

    let status = res.status();
    if !status.is_success() {
      let body = res.text().await.unwrap_or_default();
      let message = extract_openai_error(&body).unwrap_or(body);
      error!(target: "oracle", %status, "Provider returned an error");
      if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(OracleError::RateLimited(message));
      }
      return Err(OracleError::Http { status: status.as_u16(), message });
    }

    let body: ChatCompletionResponse = res.json().await
      .map_err(|e| OracleError::RequestFailed(format!("unreadable response body: {}", e)))?;
    if let Some(usage) = &body.usage {
      info!(target: "oracle", prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
    }
    let text = body.choices.first()
      .and_then(|c| c.message.content.clone())
      .unwrap_or_default().trim().to_string();
    if text.is_empty() {
      return Err(OracleError::EmptyResponse);
    }

    Ok(OracleResponse {
      text,
      model,
      usage: body.usage.map(|u| TokenUsage {
        prompt_tokens: u.prompt_tokens.unwrap_or(0),
        completion_tokens: u.completion_tokens.unwrap_or(0),
      }),
    })
  }

  fn model_for(&self, tier: ModelTier) -> String {
    self.model(tier).to_string()
  }
}

/// Records every call (success or failure) on the injected recorder.
pub struct TrackedOracle {
  inner: Arc<dyn Oracle>,
  recorder: Arc<dyn UsageRecorder>,
}

impl TrackedOracle {
  pub fn new(inner: Arc<dyn Oracle>, recorder: Arc<dyn UsageRecorder>) -> Self {
    Self { inner, recorder }
  }
}

#[async_trait]
impl Oracle for TrackedOracle {
  async fn generate(&self, request: OracleRequest) -> Result<OracleResponse, OracleError> {
    let operation = request.operation;
    let prompt_estimate = estimate_tokens(&request.system) + estimate_tokens(&request.prompt);
    let fallback_model = self.inner.model_for(request.tier);

    let started = Instant::now();
    let result = self.inner.generate(request).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match &result {
      Ok(resp) => {
        let (input, output) = match &resp.usage {
          Some(u) => (u.prompt_tokens, u.completion_tokens),
          None => (prompt_estimate, estimate_tokens(&resp.text)),
        };
        self.recorder.record(UsageRecord::new(&resp.model, operation, input, output, latency_ms));
      }
      Err(e) => {
        warn!(target: "oracle", operation, error = %e, latency_ms, "Oracle call failed");
        self.recorder.record(UsageRecord::new(&fallback_model, operation, prompt_estimate, 0, latency_ms).failed(e.to_string()));
      }
    }
    result
  }

  fn model_for(&self, tier: ModelTier) -> String {
    self.inner.model_for(tier)
  }
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: MessageContent }
#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent {
  Text(String),
  Parts(Vec<ContentPart>),
}
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
  Text { text: String },
  ImageUrl { image_url: ImageUrl },
}
#[derive(Serialize)]
struct ImageUrl { url: String }
#[derive(Serialize)]
struct ResponseFormat { #[serde(rename = "type")] r#type: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u64>,
  #[serde(default)] completion_tokens: Option<u64>,
  #[serde(default)] total_tokens: Option<u64>,
}

/// Try to extract a clean error message from OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  serde_json::from_str::<EWrap>(body).ok().map(|w| w.error.message)
}
