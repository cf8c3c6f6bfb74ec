use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backend::{BackendSelector, LocalEngine};
use crate::config::ClientConfig;
use crate::error::{AssistError, Result};
use crate::models::{BackendKind, ConnectionState, Endpoint};
use crate::network::{LocalNetworkJoiner, NetworkPlatform};
use crate::pairing::PairingPayload;
use crate::prompts::PromptProfile;
use crate::session::{ConversationSession, SessionEvent};
use crate::storage::{ConversationStore, StorageManager};

const LAST_SERVER_URL_KEY: &str = "last_server_url";

// Core application state shared by the front end
pub struct AppState {
    pub config: ClientConfig,
    pub storage: Arc<StorageManager>,
    pub selector: BackendSelector,
    pub joiner: LocalNetworkJoiner,
}

impl AppState {
    /// Opens the configured database and wires the backends together.
    pub async fn new(
        config: ClientConfig,
        platform: Arc<dyn NetworkPlatform>,
        local: Option<Arc<dyn LocalEngine>>,
    ) -> anyhow::Result<Self> {
        let storage = StorageManager::open(&config.database_path).await?;
        Ok(Self::with_storage(config, storage, platform, local))
    }

    pub fn with_storage(
        config: ClientConfig,
        storage: StorageManager,
        platform: Arc<dyn NetworkPlatform>,
        local: Option<Arc<dyn LocalEngine>>,
    ) -> Self {
        let joiner = LocalNetworkJoiner::new(platform, config.join_timeout);
        let selector = BackendSelector::new(config.clone(), local);
        Self { config, storage: Arc::new(storage), selector, joiner }
    }

    /// Scanned code -> joined network -> remote mode with a passing health check.
    pub async fn pair(&mut self, code: &str) -> Result<Endpoint> {
        let payload = PairingPayload::parse_with_default_port(code, self.config.default_port)?;
        log::info!("Pairing with network '{}', server {}", payload.ssid, payload.endpoint());

        let mut states = self.joiner.join(&payload).await;
        let endpoint = loop {
            match states.next().await {
                Some(ConnectionState::Connected(endpoint)) => break endpoint,
                Some(ConnectionState::Failed(reason)) => return Err(AssistError::NetworkJoinFailed(reason)),
                Some(_) => continue,
                None => return Err(AssistError::NetworkJoinFailed("the join was cancelled".to_string())),
            }
        };
        let endpoint = self.connect(endpoint).await?;
        self.selector.follow_network(self.joiner.subscribe());
        Ok(endpoint)
    }

    /// Manual alternative to pairing, for servers already reachable on the current network.
    pub async fn use_server_url(&mut self, url: &str) -> Result<Endpoint> {
        let endpoint = Endpoint::parse(url, self.config.default_port)
            .map_err(|e| AssistError::InvalidRequest(format!("{:#}", e)))?;
        self.connect(endpoint).await
    }

    /// Reconnects to the last server that passed a health check, if one is remembered.
    pub async fn restore_last_server(&mut self) -> Result<Option<Endpoint>> {
        let saved = self
            .storage
            .get_setting(LAST_SERVER_URL_KEY)
            .await
            .map_err(AssistError::storage)?;
        match saved {
            Some(url) => {
                log::info!("Restoring last server {}", url);
                self.use_server_url(&url).await.map(Some)
            }
            None => Ok(None),
        }
    }

    async fn connect(&mut self, endpoint: Endpoint) -> Result<Endpoint> {
        self.selector.set_endpoint(endpoint.clone())?;
        match self.selector.switch_mode(BackendKind::Remote).await {
            ConnectionState::Connected(endpoint) => {
                if let Err(e) = self.storage.set_setting(LAST_SERVER_URL_KEY, &endpoint.base_url()).await {
                    log::warn!("Could not remember server address: {:#}", e);
                }
                Ok(endpoint)
            }
            ConnectionState::Failed(reason) => Err(AssistError::Transport(reason)),
            other => Err(AssistError::Transport(format!("health check ended in state {:?}", other))),
        }
    }

    pub async fn use_local(&mut self) {
        self.selector.switch_mode(BackendKind::Local).await;
    }

    /// Opens a session on an existing conversation, or a fresh one. A fresh
    /// conversation in remote mode also resets the server's own history.
    pub async fn open_session(
        &self,
        conversation_id: Option<Uuid>,
        profile: PromptProfile,
    ) -> Result<(ConversationSession, mpsc::UnboundedReceiver<SessionEvent>)> {
        let store: Arc<dyn ConversationStore> = self.storage.clone();
        let (mut session, events) = ConversationSession::new(store, profile, self.config.context_window);
        if conversation_id.is_none() {
            self.selector.clear_remote_history().await;
        }
        session.start(conversation_id).await?;
        Ok((session, events))
    }

    pub async fn shutdown(&self) {
        self.joiner.disconnect().await;
        self.selector.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{NetworkHandle, NetworkRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RefusingPlatform {
        requests: AtomicUsize,
    }

    #[async_trait]
    impl NetworkPlatform for RefusingPlatform {
        async fn request_network(&self, _request: &NetworkRequest) -> anyhow::Result<NetworkHandle> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("network not in range")
        }
        async fn bind_process(&self, _handle: &NetworkHandle) -> anyhow::Result<()> {
            Ok(())
        }
        async fn wait_for_loss(&self, _handle: &NetworkHandle) {
            futures::future::pending::<()>().await
        }
        async fn unbind_process(&self) {}
        async fn unregister(&self, _request_id: Uuid) {}
    }

    /// Joins at once and drops the network when `lost` is notified.
    #[derive(Default)]
    struct FlakyPlatform {
        lost: Notify,
    }

    #[async_trait]
    impl NetworkPlatform for FlakyPlatform {
        async fn request_network(&self, request: &NetworkRequest) -> anyhow::Result<NetworkHandle> {
            Ok(NetworkHandle { request_id: request.id, ssid: request.ssid.clone(), interface: None })
        }
        async fn bind_process(&self, _handle: &NetworkHandle) -> anyhow::Result<()> {
            Ok(())
        }
        async fn wait_for_loss(&self, _handle: &NetworkHandle) {
            self.lost.notified().await
        }
        async fn unbind_process(&self) {}
        async fn unregister(&self, _request_id: Uuid) {}
    }

    async fn healthy_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "healthy", "model_loaded": true
            })))
            .mount(&server)
            .await;
        server
    }

    async fn app(platform: Arc<dyn NetworkPlatform>) -> AppState {
        let storage = StorageManager::in_memory().await.unwrap();
        AppState::with_storage(ClientConfig::default(), storage, platform, None)
    }

    #[tokio::test]
    async fn invalid_code_never_reaches_the_platform() {
        let platform = Arc::new(RefusingPlatform::default());
        let mut app = app(platform.clone()).await;

        let err = app.pair("WIFI:T:WPA;S:LabPort;I:192.168.137.1;;").await.unwrap_err();
        assert!(matches!(err, AssistError::InvalidPayload(_)));
        assert_eq!(platform.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_join_is_reported_as_join_failure() {
        let platform = Arc::new(RefusingPlatform::default());
        let mut app = app(platform.clone()).await;

        let err = app.pair("WIFI:T:WPA;S:LabPort;P:gemma3n8080;I:192.168.137.1;;").await.unwrap_err();
        assert!(matches!(err, AssistError::NetworkJoinFailed(reason) if reason.contains("not in range")));
        assert_eq!(app.selector.mode(), BackendKind::Local);
    }

    #[tokio::test]
    async fn losing_the_joined_network_blocks_sends() {
        let server = healthy_server().await;
        let platform = Arc::new(FlakyPlatform::default());
        let mut app = app(platform.clone()).await;
        let code = format!("WIFI:T:WPA;S:LabPort;P:gemma3n8080;I:127.0.0.1;O:{};;", server.address().port());

        app.pair(&code).await.unwrap();
        assert!(app.selector.admit("hello", &[]).is_ok());

        let mut network = app.joiner.subscribe();
        platform.lost.notify_one();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !matches!(*network.borrow_and_update(), ConnectionState::Failed(_)) {
                network.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(app.selector.admit("hello", &[]), Err(AssistError::NotConnected));
        assert!(matches!(app.selector.connection_state(), ConnectionState::Failed(reason) if reason.contains("lost")));
    }

    #[tokio::test]
    async fn manual_url_is_remembered_after_a_passing_health_check() {
        let server = healthy_server().await;

        let mut app = app(Arc::new(RefusingPlatform::default())).await;
        let url = format!("http://{}", server.address());
        let endpoint = app.use_server_url(&url).await.unwrap();
        assert_eq!(endpoint.port, server.address().port());

        let saved = app.storage.get_setting(LAST_SERVER_URL_KEY).await.unwrap();
        assert_eq!(saved, Some(endpoint.base_url()));

        app.use_local().await;
        assert_eq!(app.restore_last_server().await.unwrap(), Some(endpoint));
        assert_eq!(app.selector.mode(), BackendKind::Remote);
    }

    #[tokio::test]
    async fn unreachable_url_is_not_remembered() {
        let mut app = app(Arc::new(RefusingPlatform::default())).await;
        assert!(matches!(app.use_server_url("127.0.0.1:9").await, Err(AssistError::Transport(_))));
        assert_eq!(app.storage.get_setting(LAST_SERVER_URL_KEY).await.unwrap(), None);
        assert!(app.use_server_url("ftp://10.0.0.1").await.is_err());
    }
}
