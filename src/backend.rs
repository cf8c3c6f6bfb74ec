use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::{
    validate_attachments, GenerateResult, GenerationOptions, HealthReport, RemoteInferenceClient,
    StreamToken, TokenStream,
};
use crate::config::ClientConfig;
use crate::error::{AssistError, Result};
use crate::models::{Attachment, BackendKind, ConnectionState, Endpoint};
use crate::prompts::PromptProfile;

/// On-device model runtime. Prompt in, full reply out.
#[async_trait]
pub trait LocalEngine: Send + Sync {
    fn model_name(&self) -> String;
    async fn generate(&self, prompt: &str) -> Result<String>;
    /// Frees the runtime. Called once, when the owning selector shuts down.
    fn release(&self);
}

/// One inference target, selected at runtime.
#[derive(Clone)]
pub enum Backend {
    Local(Arc<dyn LocalEngine>),
    Remote(RemoteInferenceClient),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Local(_) => BackendKind::Local,
            Backend::Remote(_) => BackendKind::Remote,
        }
    }

    pub fn supports_media(&self) -> bool {
        matches!(self, Backend::Remote(_))
    }

    pub async fn health(&self) -> Result<HealthReport> {
        match self {
            Backend::Local(engine) => Ok(HealthReport {
                status: "healthy".to_string(),
                model_loaded: true,
                model_name: Some(engine.model_name()),
                last_error: None,
            }),
            Backend::Remote(client) => client.health().await,
        }
    }

    pub async fn generate(
        &self,
        prompt: &str,
        profile: PromptProfile,
        attachments: &[Attachment],
        options: &GenerationOptions,
    ) -> Result<GenerateResult> {
        match self {
            Backend::Local(engine) => {
                let started = Instant::now();
                let text = engine.generate(prompt).await?;
                Ok(GenerateResult {
                    text,
                    latency_ms: started.elapsed().as_millis() as u64,
                    tokens_per_second: None,
                    model_info: Some(engine.model_name()),
                })
            }
            Backend::Remote(client) => client.generate(prompt, profile, attachments, options).await,
        }
    }

    /// The local engine produces its reply in one piece, so its stream is a
    /// single fragment followed by completion.
    pub fn generate_streaming(
        &self,
        prompt: &str,
        profile: PromptProfile,
        attachments: &[Attachment],
        options: &GenerationOptions,
    ) -> TokenStream {
        match self {
            Backend::Local(engine) => {
                let engine = engine.clone();
                let prompt = prompt.to_string();
                let reply = async move {
                    let tokens = match engine.generate(&prompt).await {
                        Ok(text) if text.is_empty() => vec![StreamToken::done()],
                        Ok(text) => vec![StreamToken::fragment(text), StreamToken::done()],
                        Err(e) => {
                            log::error!("Local generation failed: {}", e);
                            vec![StreamToken::failed(e)]
                        }
                    };
                    stream::iter(tokens)
                };
                Box::pin(stream::once(reply).flatten())
            }
            Backend::Remote(client) => client.generate_streaming(prompt, profile, attachments, options),
        }
    }
}

// --- Backend Selector ---

// The joined network a paired server is reached through.
struct NetworkLink {
    joined: watch::Receiver<ConnectionState>,
    forward: JoinHandle<()>,
}

impl Drop for NetworkLink {
    fn drop(&mut self) {
        self.forward.abort();
    }
}

/// How a connected server looks once its network is in `network` state.
/// `None` while the network is still up.
fn network_loss(network: &ConnectionState) -> Option<ConnectionState> {
    match network {
        ConnectionState::Connected(_) => None,
        ConnectionState::Failed(reason) => Some(ConnectionState::Failed(reason.clone())),
        ConnectionState::Idle | ConnectionState::Connecting => {
            Some(ConnectionState::Failed("Left the paired network".to_string()))
        }
    }
}

/// Tracks the active backend and the remote server's connectivity.
pub struct BackendSelector {
    config: ClientConfig,
    mode: BackendKind,
    local: Option<Arc<dyn LocalEngine>>,
    remote: Option<RemoteInferenceClient>,
    state: Arc<watch::Sender<ConnectionState>>,
    network: Option<NetworkLink>,
    last_health: Option<HealthReport>,
    released: AtomicBool,
}

impl BackendSelector {
    /// Starts in local mode with no server configured.
    pub fn new(config: ClientConfig, local: Option<Arc<dyn LocalEngine>>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            config,
            mode: BackendKind::Local,
            local,
            remote: None,
            state: Arc::new(state),
            network: None,
            last_health: None,
            released: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> BackendKind {
        self.mode
    }

    /// The server is only connected while the network it was paired over is.
    pub fn connection_state(&self) -> ConnectionState {
        let state = self.state.borrow().clone();
        if state.is_connected() {
            if let Some(lost) = self.network.as_ref().and_then(|link| network_loss(&link.joined.borrow())) {
                return lost;
            }
        }
        state
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.remote.as_ref().map(|client| client.endpoint())
    }

    pub fn last_health(&self) -> Option<&HealthReport> {
        self.last_health.as_ref()
    }

    /// Points the remote backend at a new server. Connectivity has to be
    /// re-established with [`check_connection`](Self::check_connection) or a switch to remote.
    pub fn set_endpoint(&mut self, endpoint: Endpoint) -> Result<()> {
        log::info!("Remote server set to {}", endpoint);
        self.remote = Some(RemoteInferenceClient::new(endpoint, &self.config)?);
        self.network = None;
        self.last_health = None;
        self.state.send_replace(ConnectionState::Idle);
        Ok(())
    }

    /// Ties the current server to the network it was paired over. Losing or
    /// leaving that network moves a connected server to `Failed`.
    pub fn follow_network(&mut self, joined: watch::Receiver<ConnectionState>) {
        let state = self.state.clone();
        let mut watched = joined.clone();
        let forward = tokio::spawn(async move {
            while watched.changed().await.is_ok() {
                let network = watched.borrow_and_update().clone();
                let Some(lost) = network_loss(&network) else {
                    continue;
                };
                state.send_if_modified(|current| {
                    if !current.is_connected() {
                        return false;
                    }
                    log::warn!("Paired network went away ({:?}); server marked unreachable", network);
                    *current = lost;
                    true
                });
            }
        });
        self.network = Some(NetworkLink { joined, forward });
    }

    /// Switching to remote checks the server once; switching to local drops
    /// the remote connection state without probing.
    pub async fn switch_mode(&mut self, mode: BackendKind) -> ConnectionState {
        log::info!("Switching backend mode: {} -> {}", self.mode, mode);
        self.mode = mode;
        match mode {
            BackendKind::Local => {
                self.state.send_replace(ConnectionState::Idle);
                ConnectionState::Idle
            }
            BackendKind::Remote => self.check_connection().await,
        }
    }

    /// Checks the server's health and records the outcome. Also serves as the
    /// manual reconnect.
    pub async fn check_connection(&mut self) -> ConnectionState {
        let Some(client) = self.remote.clone() else {
            let state = ConnectionState::Failed("No server address configured".to_string());
            self.state.send_replace(state.clone());
            return state;
        };

        self.state.send_replace(ConnectionState::Connecting);
        let state = match Backend::Remote(client.clone()).health().await {
            Ok(report) if report.is_usable() => {
                self.last_health = Some(report);
                ConnectionState::Connected(client.endpoint().clone())
            }
            Ok(report) => {
                let reason = match &report.last_error {
                    Some(detail) => format!("Server is {}: {}", report.status, detail),
                    None => format!("Server is {}", report.status),
                };
                self.last_health = Some(report);
                ConnectionState::Failed(reason)
            }
            Err(e) => {
                log::warn!("Health check against {} failed: {}", client.endpoint(), e);
                self.last_health = None;
                ConnectionState::Failed(e.to_string())
            }
        };
        self.state.send_replace(state);
        self.connection_state()
    }

    /// Decides whether a send may go ahead. Nothing is dispatched or recorded
    /// when this fails.
    pub fn admit(&self, text: &str, attachments: &[Attachment]) -> Result<()> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(AssistError::InvalidRequest("Type a message or attach media first.".to_string()));
        }
        match self.mode {
            BackendKind::Local => {
                if !attachments.is_empty() {
                    return Err(AssistError::CapabilityUnsupported(
                        "The on-device model only understands text. Switch to the desktop server to send images or audio."
                            .to_string(),
                    ));
                }
                self.local_engine().map(|_| ())
            }
            BackendKind::Remote => {
                if self.remote.is_none() || !self.connection_state().is_connected() {
                    return Err(AssistError::NotConnected);
                }
                validate_attachments(attachments)
            }
        }
    }

    pub fn active(&self) -> Result<Backend> {
        match self.mode {
            BackendKind::Local => self.local_engine().map(|engine| Backend::Local(engine.clone())),
            BackendKind::Remote => self.remote.clone().map(Backend::Remote).ok_or(AssistError::NotConnected),
        }
    }

    fn local_engine(&self) -> Result<&Arc<dyn LocalEngine>> {
        if self.released.load(Ordering::SeqCst) {
            return Err(AssistError::BackendUnavailable("The on-device model has been shut down.".to_string()));
        }
        self.local
            .as_ref()
            .ok_or_else(|| AssistError::BackendUnavailable("No on-device model is loaded.".to_string()))
    }

    /// Streams from the active backend. Failures to pick a backend come back
    /// as the stream's terminal error token.
    pub fn stream(&self, prompt: &str, profile: PromptProfile, attachments: &[Attachment]) -> TokenStream {
        match self.active() {
            Ok(backend) => {
                log::debug!("Dispatching to {} backend (supports media: {})", backend.kind(), backend.supports_media());
                backend.generate_streaming(prompt, profile, attachments, &self.config.generation)
            }
            Err(e) => Box::pin(stream::once(future::ready(StreamToken::failed(e)))),
        }
    }

    pub async fn generate(
        &self,
        prompt: &str,
        profile: PromptProfile,
        attachments: &[Attachment],
    ) -> Result<GenerateResult> {
        self.active()?.generate(prompt, profile, attachments, &self.config.generation).await
    }

    pub fn model_info(&self) -> Option<String> {
        match self.mode {
            BackendKind::Local => self.local.as_ref().map(|engine| engine.model_name()),
            BackendKind::Remote => self.last_health.as_ref().and_then(|h| h.model_name.clone()),
        }
    }

    /// Best effort: a failure only means the server keeps its own history.
    pub async fn clear_remote_history(&self) {
        if self.mode != BackendKind::Remote || !self.connection_state().is_connected() {
            return;
        }
        if let Some(client) = &self.remote {
            if let Err(e) = client.clear_history().await {
                log::warn!("Could not clear server history: {}", e);
            }
        }
    }

    /// Releases the local runtime. Later calls, and the drop, do nothing.
    pub fn shutdown(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(engine) = &self.local {
            log::info!("Releasing on-device model '{}'", engine.model_name());
            engine.release();
        }
    }
}

impl Drop for BackendSelector {
    fn drop(&mut self) {
        self.shutdown();
    }
}
