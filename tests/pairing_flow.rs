use async_trait::async_trait;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use labport::models::MessageStatus;
use labport::network::{NetworkHandle, NetworkRequest};
use labport::{
    AppState, BackendKind, ClientConfig, ConnectionState, ConversationStore, Endpoint, LocalNetworkJoiner,
    NetworkPlatform, PairingPayload, PromptProfile, SessionEvent, StorageManager,
};

/// Associates instantly and records what it was asked to do.
#[derive(Default)]
struct HotspotPlatform {
    calls: Mutex<Vec<String>>,
}

impl HotspotPlatform {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkPlatform for HotspotPlatform {
    async fn request_network(&self, request: &NetworkRequest) -> anyhow::Result<NetworkHandle> {
        self.calls.lock().unwrap().push(format!("request:{}:{}", request.ssid, request.passphrase));
        Ok(NetworkHandle { request_id: request.id, ssid: request.ssid.clone(), interface: Some("wlan0".into()) })
    }

    async fn bind_process(&self, _handle: &NetworkHandle) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("bind".into());
        Ok(())
    }

    async fn wait_for_loss(&self, _handle: &NetworkHandle) {
        futures::future::pending::<()>().await
    }

    async fn unbind_process(&self) {
        self.calls.lock().unwrap().push("unbind".into());
    }

    async fn unregister(&self, _request_id: Uuid) {
        self.calls.lock().unwrap().push("unregister".into());
    }
}

async fn desktop_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "healthy",
            "timestamp": "2026-10-14T09:00:00",
            "services": {"vlm": {"loaded": true, "loading": false, "model_name": "gemma-3n-E4B-it"}}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/vlm/clear"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "success"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/vlm/generate/stream"))
        .and(body_partial_json(serde_json::json!({"prompt_name": "lab_protocol_guide"})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "data: Wear\n\ndata:  gloves\n\ndata:  first.\n\ndata: [DONE]\n\n",
            "text/event-stream",
        ))
        .expect(1)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn desktop_code_joins_the_hotspot_at_the_default_port() {
    let platform = Arc::new(HotspotPlatform::default());
    let joiner = LocalNetworkJoiner::new(platform.clone(), Duration::from_secs(5));
    let payload = PairingPayload::parse("WIFI:T:WPA;S:LabPort;P:gemma3n8080;I:192.168.137.1;;").unwrap();

    let states: Vec<ConnectionState> = joiner.join(&payload).await.take(2).collect().await;
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected(Endpoint::new("192.168.137.1", 8000)),
        ]
    );
    assert_eq!(platform.calls(), ["request:LabPort:gemma3n8080", "bind"]);

    joiner.disconnect().await;
    assert_eq!(platform.calls(), ["request:LabPort:gemma3n8080", "bind", "unbind", "unregister"]);
}

#[tokio::test]
async fn scan_join_check_and_chat() {
    let server = desktop_server().await;
    let code = format!("WIFI:T:WPA;S:LabPort;P:gemma3n8080;I:127.0.0.1;O:{};;", server.address().port());

    let platform = Arc::new(HotspotPlatform::default());
    let storage = StorageManager::in_memory().await.unwrap();
    let mut app = AppState::with_storage(ClientConfig::default(), storage, platform.clone(), None);

    let endpoint = app.pair(&code).await.unwrap();
    assert_eq!(endpoint.base_url(), format!("http://127.0.0.1:{}", server.address().port()));
    assert_eq!(app.selector.mode(), BackendKind::Remote);
    assert!(app.selector.connection_state().is_connected());
    assert!(app.joiner.state().is_connected());

    let (mut session, mut events) = app.open_session(None, PromptProfile::LabProtocolGuide).await.unwrap();
    let reply = session
        .send(&app.selector, "How do I handle ethidium bromide?", Vec::new())
        .await
        .unwrap();
    assert_eq!(reply.content, "Wear gloves first.");
    assert_eq!(reply.status, MessageStatus::Complete);
    assert_eq!(reply.backend, BackendKind::Remote);

    let mut streamed = String::new();
    let mut finalized = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::MessageUpdated { delta, .. } => streamed.push_str(&delta),
            SessionEvent::MessageFinalized(_) => finalized += 1,
            _ => {}
        }
    }
    assert_eq!(streamed, "Wear gloves first.");
    assert_eq!(finalized, 1);

    let conversation_id = session.conversation().unwrap().id;
    let history = app.storage.list_messages(conversation_id).await.unwrap();
    let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["How do I handle ethidium bromide?", "Wear gloves first."]);
    let metrics = history[1].metadata.as_ref().unwrap();
    assert_eq!(metrics.model_info.as_deref(), Some("gemma-3n-E4B-it"));

    app.shutdown().await;
    assert_eq!(platform.calls().last().map(String::as_str), Some("unregister"));
}
