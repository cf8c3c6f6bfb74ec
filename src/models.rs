use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::prompts::PromptProfile;

// Author of a message
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

// Inference execution target that produced (or will produce) a message
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Remote,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Remote => "remote",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(BackendKind::Local),
            "remote" => Some(BackendKind::Remote),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a message. Only assistant messages are ever `Pending`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Complete,
    Errored,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Complete => "complete",
            MessageStatus::Errored => "errored",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MessageStatus::Pending),
            "complete" => Some(MessageStatus::Complete),
            "errored" => Some(MessageStatus::Errored),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
}

// Reference to caller-owned media attached to a message (e.g. a file path or content URI)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub reference: String,
}

/// Media bytes handed over for a single send. Only the [`MediaRef`] is kept
/// on the resulting message; the bytes are never persisted.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub media: MediaRef,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn image(reference: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            media: MediaRef { kind: MediaKind::Image, reference: reference.into() },
            data,
        }
    }

    pub fn audio(reference: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            media: MediaRef { kind: MediaKind::Audio, reference: reference.into() },
            data,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.media.kind
    }
}

// Timing information recorded when a response is finalized
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PerformanceMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_info: Option<String>,
}

// Represents a single message in a conversation
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub backend: BackendKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PerformanceMetrics>,
}

impl Message {
    pub fn user(
        conversation_id: Uuid,
        content: impl Into<String>,
        backend: BackendKind,
        media: Vec<MediaRef>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            status: MessageStatus::Complete,
            backend,
            media,
            metadata: None,
        }
    }

    /// Empty assistant turn that is filled in as tokens arrive.
    pub fn placeholder(conversation_id: Uuid, backend: BackendKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: Role::Assistant,
            content: String::new(),
            timestamp: Utc::now(),
            status: MessageStatus::Pending,
            backend,
            media: Vec::new(),
            metadata: None,
        }
    }
}

// Represents the metadata for a conversation thread
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Conversation {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub title: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_updated_at: DateTime<Utc>,
    pub profile: PromptProfile,
}

/// Fields of a conversation that may be changed after creation.
#[derive(Clone, Debug, Default)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub profile: Option<PromptProfile>,
}

/// Host and port of a desktop inference server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Parses a manually entered address such as `http://192.168.1.20:8000`
    /// or `192.168.1.20:8000`. A missing port falls back to `default_port`.
    pub fn parse(input: &str, default_port: u16) -> anyhow::Result<Self> {
        let trimmed = input.trim();
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        };
        let url = reqwest::Url::parse(&with_scheme)
            .map_err(|e| anyhow::anyhow!("Invalid server address '{}': {}", trimmed, e))?;
        if url.scheme() != "http" {
            anyhow::bail!("Unsupported scheme '{}', only http is served", url.scheme());
        }
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("Server address '{}' has no host", trimmed))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        Ok(Self { host, port: url.port().unwrap_or(default_port) })
    }

    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url())
    }
}

/// Connectivity as observed by the UI. `Idle` is the disconnected state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "state", content = "detail", rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected(Endpoint),
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}
