use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{future, stream, Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::{Duration, Instant};

use crate::config::ClientConfig;
use crate::error::{AssistError, Result};
use crate::models::{Attachment, Endpoint, MediaKind};
use crate::prompts::PromptProfile;

// Alias for the stream type we return. Every stream ends with exactly one
// token whose `is_complete` is true, carrying an error if it ended abnormally.
pub type TokenStream = Pin<Box<dyn Stream<Item = StreamToken> + Send>>;

/// Literal data value the server sends after the last token.
pub const DONE_MARKER: &str = "[DONE]";

/// Prefix of the single data value the server sends when generation fails
/// after the response has started.
pub const SERVER_ERROR_PREFIX: &str = "Error:";

pub const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;
pub const MAX_AUDIO_BYTES: usize = 10 * 1024 * 1024;

const HEALTH_PATH: &str = "/health";
const GENERATE_PATH: &str = "/vlm/generate";
const GENERATE_STREAM_PATH: &str = "/vlm/generate/stream";
const CLEAR_PATH: &str = "/vlm/clear";

#[derive(Clone, Debug, PartialEq)]
pub struct StreamToken {
    pub text: String,
    pub is_complete: bool,
    pub error: Option<AssistError>,
}

impl StreamToken {
    pub fn fragment(text: impl Into<String>) -> Self {
        Self { text: text.into(), is_complete: false, error: None }
    }

    pub fn done() -> Self {
        Self { text: String::new(), is_complete: true, error: None }
    }

    pub fn failed(error: AssistError) -> Self {
        Self { text: String::new(), is_complete: true, error: Some(error) }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self { max_tokens: 512, temperature: 1.0, top_k: 64, top_p: 0.95 }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HealthReport {
    pub status: String,
    pub model_loaded: bool,
    pub model_name: Option<String>,
    pub last_error: Option<String>,
}

impl HealthReport {
    /// `healthy` and `degraded` servers accept requests (a degraded server
    /// loads its model on first use); `unhealthy` ones do not.
    pub fn is_usable(&self) -> bool {
        !self.status.eq_ignore_ascii_case("unhealthy")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerateResult {
    pub text: String,
    pub latency_ms: u64,
    pub tokens_per_second: Option<f64>,
    pub model_info: Option<String>,
}

// Request body shared by the batch and streaming endpoints
#[derive(Serialize, Debug)]
struct GenerateRequestBody<'a> {
    prompt: &'a str,
    prompt_name: &'a str,
    max_tokens: u32,
    temperature: f32,
    top_k: u32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_base64: Option<String>,
}

impl<'a> GenerateRequestBody<'a> {
    fn new(
        prompt: &'a str,
        profile: PromptProfile,
        attachments: &[Attachment],
        options: &GenerationOptions,
    ) -> Self {
        let encode = |kind: MediaKind| {
            attachments
                .iter()
                .find(|a| a.kind() == kind)
                .map(|a| BASE64.encode(&a.data))
        };
        Self {
            prompt,
            prompt_name: profile.wire_name(),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            top_k: options.top_k,
            top_p: options.top_p,
            image_base64: encode(MediaKind::Image),
            audio_base64: encode(MediaKind::Audio),
        }
    }
}

#[derive(Deserialize, Debug)]
struct GenerateResponseBody {
    generated_text: String,
    #[serde(default)]
    response_time_ms: Option<u64>,
    #[serde(default)]
    tokens_per_second: Option<f64>,
    #[serde(default)]
    model_info: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

/// Checks attachments against what the server accepts: one image and one
/// audio clip at most, within the server's size limits.
pub fn validate_attachments(attachments: &[Attachment]) -> Result<()> {
    for (kind, limit, label) in [
        (MediaKind::Image, MAX_IMAGE_BYTES, "image"),
        (MediaKind::Audio, MAX_AUDIO_BYTES, "audio clip"),
    ] {
        let matching: Vec<&Attachment> = attachments.iter().filter(|a| a.kind() == kind).collect();
        if matching.len() > 1 {
            return Err(AssistError::InvalidRequest(format!("Only one {} can be sent per message.", label)));
        }
        if let Some(attachment) = matching.first() {
            if attachment.data.is_empty() {
                return Err(AssistError::InvalidRequest(format!("The attached {} is empty.", label)));
            }
            if attachment.data.len() > limit {
                return Err(AssistError::InvalidRequest(format!(
                    "The attached {} is too large (max {} MB).",
                    label,
                    limit / (1024 * 1024)
                )));
            }
        }
    }
    Ok(())
}

// --- Remote Inference Client ---

#[derive(Clone, Debug)]
pub struct RemoteInferenceClient {
    client: Client,
    endpoint: Endpoint,
    health_timeout: Duration,
    request_timeout: Duration,
}

impl RemoteInferenceClient {
    pub fn new(endpoint: Endpoint, config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| AssistError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint,
            health_timeout: config.health_timeout,
            request_timeout: config.request_timeout,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.base_url(), path)
    }

    pub async fn health(&self) -> Result<HealthReport> {
        let url = self.url(HEALTH_PATH);
        log::debug!("Checking server health at {}", url);
        let response = self.client.get(&url).timeout(self.health_timeout).send().await?;
        let response = ensure_success(response).await?;
        let body: serde_json::Value = response.json().await?;
        let report = parse_health(&body)?;
        log::info!(
            "Server at {} reports status '{}' (model loaded: {})",
            self.endpoint,
            report.status,
            report.model_loaded
        );
        Ok(report)
    }

    pub async fn generate(
        &self,
        prompt: &str,
        profile: PromptProfile,
        attachments: &[Attachment],
        options: &GenerationOptions,
    ) -> Result<GenerateResult> {
        let body = GenerateRequestBody::new(prompt, profile, attachments, options);
        let url = self.url(GENERATE_PATH);
        log::info!("Sending generate request to {} (prompt: {} chars)", url, prompt.len());

        let started = Instant::now();
        let response = self.client.post(&url).timeout(self.request_timeout).json(&body).send().await?;
        let response = ensure_success(response).await?;
        let parsed: GenerateResponseBody = response.json().await?;
        let elapsed = started.elapsed();

        let result = build_generate_result(parsed, elapsed);
        log::info!("Generation finished in {} ms ({} chars)", result.latency_ms, result.text.len());
        Ok(result)
    }

    /// Opens a fresh streaming connection. Connection failures surface as the
    /// stream's terminal error token rather than as an `Err`.
    pub fn generate_streaming(
        &self,
        prompt: &str,
        profile: PromptProfile,
        attachments: &[Attachment],
        options: &GenerationOptions,
    ) -> TokenStream {
        let url = self.url(GENERATE_STREAM_PATH);
        log::info!("Sending STREAM request to {} (prompt: {} chars)", url, prompt.len());
        let request = self
            .client
            .post(&url)
            .json(&GenerateRequestBody::new(prompt, profile, attachments, options));

        let connect = async move {
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    log::error!("Stream request to {} failed: {}", url, e);
                    return single(StreamToken::failed(AssistError::from(e)));
                }
            };
            match ensure_success(response).await {
                Ok(response) => decode_token_stream(response.bytes_stream()),
                Err(e) => {
                    log::error!("Stream request to {} rejected: {}", url, e);
                    single(StreamToken::failed(e))
                }
            }
        };
        Box::pin(stream::once(connect).flatten())
    }

    /// Asks the server to drop its own copy of the conversation.
    pub async fn clear_history(&self) -> Result<()> {
        let url = self.url(CLEAR_PATH);
        log::debug!("Clearing server conversation history at {}", url);
        let response = self.client.post(&url).timeout(self.health_timeout).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}

fn single(token: StreamToken) -> TokenStream {
    Box::pin(stream::once(future::ready(token)))
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_else(|_| "<Failed to read error body>".to_string());
    log::error!("Server request failed with status {}: {}", status, body);
    Err(AssistError::Transport(describe_failure(status, &body)))
}

// FastAPI puts the human-readable reason in `detail`.
fn describe_failure(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    if detail.is_empty() {
        format!("server returned {}", status)
    } else {
        format!("server returned {}: {}", status, detail)
    }
}

/// Decodes a health body in either the flat shape or the server's nested
/// `services` shape.
pub fn parse_health(body: &serde_json::Value) -> Result<HealthReport> {
    let status = body
        .get("status")
        .and_then(|s| s.as_str())
        .ok_or_else(|| AssistError::Decode("health response has no status".to_string()))?
        .to_string();

    let text = |value: Option<&serde_json::Value>| {
        value.and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(str::to_string)
    };

    if let Some(loaded) = body.get("model_loaded").and_then(|v| v.as_bool()) {
        return Ok(HealthReport {
            status,
            model_loaded: loaded,
            model_name: text(body.get("model_name")),
            last_error: text(body.get("last_error")),
        });
    }

    let services = body.get("services");
    if let Some(vlm) = services.and_then(|s| s.get("vlm")) {
        return Ok(HealthReport {
            status,
            model_loaded: vlm.get("loaded").and_then(|v| v.as_bool()).unwrap_or(false),
            model_name: text(vlm.get("model_name")),
            last_error: text(vlm.get("last_error")),
        });
    }
    if let Some(service) = services.and_then(|s| s.get("vlm_service")) {
        return Ok(HealthReport {
            status,
            model_loaded: service.get("status").and_then(|v| v.as_str()) == Some("online"),
            model_name: text(service.get("model")),
            last_error: text(service.get("last_error")),
        });
    }

    Ok(HealthReport { status, model_loaded: false, model_name: None, last_error: None })
}

fn build_generate_result(body: GenerateResponseBody, elapsed: Duration) -> GenerateResult {
    let meta = body.metadata.as_ref();
    let meta_u64 = |key: &str| meta.and_then(|m| m.get(key)).and_then(|v| v.as_u64());

    let latency_ms = body
        .response_time_ms
        .or_else(|| meta_u64("request_time_ms"))
        .or_else(|| meta_u64("generation_time_ms"))
        .unwrap_or(elapsed.as_millis() as u64);

    let model_info = body.model_info.or_else(|| {
        meta.and_then(|m| m.get("model")).and_then(|v| v.as_str()).map(str::to_string)
    });

    // Word count stands in for tokens when the server does not report throughput.
    let tokens_per_second = body.tokens_per_second.or_else(|| {
        let words = body.generated_text.split_whitespace().count();
        (latency_ms > 0 && words > 0).then(|| words as f64 / (latency_ms as f64 / 1000.0))
    });

    GenerateResult { text: body.generated_text, latency_ms, tokens_per_second, model_info }
}

/// Turns a raw `data: <token>` byte stream into [`StreamToken`]s.
///
/// `data: [DONE]` completes the stream; `data: Error: ...` ends it with a
/// [`AssistError::Generation`]; any other non-empty value is a literal fragment. A transport error, undecodable data, or the body ending
/// without the done marker yields a single terminal error token.
pub fn decode_token_stream<S, B, E>(body: S) -> TokenStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let events = Box::pin(body.eventsource());
    let tokens = stream::unfold(Some(events), |state| async move {
        let Some(mut events) = state else {
            return None;
        };
        loop {
            let token = match events.next().await {
                Some(Ok(event)) => {
                    if event.data.trim() == DONE_MARKER {
                        log::info!("Stream finished with [DONE]");
                        StreamToken::done()
                    } else if event.data.is_empty() {
                        continue;
                    } else if let Some(detail) = event.data.strip_prefix(SERVER_ERROR_PREFIX) {
                        log::error!("Server reported a generation error: {}", detail.trim());
                        StreamToken::failed(AssistError::Generation(detail.trim().to_string()))
                    } else {
                        return Some((StreamToken::fragment(event.data), Some(events)));
                    }
                }
                Some(Err(EventStreamError::Transport(e))) => {
                    log::error!("Error reading token stream: {}", e);
                    StreamToken::failed(AssistError::Transport(e.to_string()))
                }
                Some(Err(e)) => {
                    log::error!("Undecodable data in token stream: {}", e);
                    StreamToken::failed(AssistError::Decode(e.to_string()))
                }
                None => {
                    log::warn!("Token stream closed before [DONE]");
                    StreamToken::failed(AssistError::Transport(
                        "connection closed before the response was complete".to_string(),
                    ))
                }
            };
            return Some((token, None));
        }
    });
    Box::pin(tokens)
}
