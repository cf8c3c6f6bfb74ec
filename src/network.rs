//! Joining the desktop's ad-hoc Wi-Fi network.
//!
//! The OS side (associating, binding traffic, noticing loss) sits behind
//! [`NetworkPlatform`]. [`LocalNetworkJoiner`] drives one join at a time and
//! reports its transitions as [`ConnectionState`]s.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{ConnectionState, Endpoint};
use crate::pairing::PairingPayload;

/// Request to associate with a specific network.
#[derive(Clone)]
pub struct NetworkRequest {
    pub id: Uuid,
    pub ssid: String,
    pub passphrase: String,
    /// Always false for pairing: the desktop hotspot has no uplink, so the
    /// platform must not wait for (or require) internet validation.
    pub require_internet: bool,
}

impl fmt::Debug for NetworkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkRequest")
            .field("id", &self.id)
            .field("ssid", &self.ssid)
            .field("require_internet", &self.require_internet)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct NetworkHandle {
    pub request_id: Uuid,
    pub ssid: String,
    pub interface: Option<String>,
}

#[async_trait]
pub trait NetworkPlatform: Send + Sync {
    /// Registers the request and resolves once the network is available.
    /// Dropping the future abandons negotiation; `unregister` still has to be called.
    async fn request_network(&self, request: &NetworkRequest) -> Result<NetworkHandle>;
    /// Routes the process's outbound traffic over the joined network.
    async fn bind_process(&self, handle: &NetworkHandle) -> Result<()>;
    /// Resolves when the joined network goes away.
    async fn wait_for_loss(&self, handle: &NetworkHandle);
    /// Restores default routing.
    async fn unbind_process(&self);
    /// Drops the registered request and any association it made. Must be
    /// safe for requests that never completed.
    async fn unregister(&self, request_id: Uuid);
}

/// Transitions of a single join. Ends when the join is released.
pub type JoinStream = UnboundedReceiverStream<ConnectionState>;

struct ActiveJoin {
    ssid: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct Publisher {
    events: mpsc::UnboundedSender<ConnectionState>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Publisher {
    fn publish(&self, state: ConnectionState) {
        log::debug!("Network join state -> {:?}", state);
        self.state.send_replace(state.clone());
        // The join's own stream may already have been dropped by its caller.
        let _ = self.events.send(state);
    }
}

pub struct LocalNetworkJoiner {
    platform: Arc<dyn NetworkPlatform>,
    join_timeout: Duration,
    active: Mutex<Option<ActiveJoin>>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl LocalNetworkJoiner {
    pub fn new(platform: Arc<dyn NetworkPlatform>, join_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self { platform, join_timeout, active: Mutex::new(None), state: Arc::new(state) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Starts joining the payload's network, releasing any previous join first.
    /// The returned stream yields `Connecting` immediately.
    pub async fn join(&self, payload: &PairingPayload) -> JoinStream {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            log::info!("Releasing previous join of '{}' before joining '{}'", previous.ssid, payload.ssid);
            Self::release(previous).await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = Publisher { events: tx, state: self.state.clone() };
        publisher.publish(ConnectionState::Connecting);

        let request = NetworkRequest {
            id: Uuid::new_v4(),
            ssid: payload.ssid.clone(),
            passphrase: payload.passphrase.clone(),
            require_internet: false,
        };
        log::info!("Joining network '{}' (request {})", request.ssid, request.id);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_join(
            self.platform.clone(),
            request,
            payload.endpoint(),
            self.join_timeout,
            cancel.clone(),
            publisher,
        ));
        *active = Some(ActiveJoin { ssid: payload.ssid.clone(), cancel, task });

        UnboundedReceiverStream::new(rx)
    }

    /// Releases the current join, if any, and returns to `Idle`. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            log::info!("Disconnecting from '{}'", previous.ssid);
            Self::release(previous).await;
        }
        self.state.send_replace(ConnectionState::Idle);
    }

    async fn release(join: ActiveJoin) {
        join.cancel.cancel();
        if let Err(e) = join.task.await {
            log::error!("Join task for '{}' ended abnormally: {}", join.ssid, e);
        }
    }
}

impl Drop for LocalNetworkJoiner {
    fn drop(&mut self) {
        // The task performs its own cleanup once cancelled.
        if let Some(active) = self.active.get_mut().take() {
            active.cancel.cancel();
        }
    }
}

async fn run_join(
    platform: Arc<dyn NetworkPlatform>,
    request: NetworkRequest,
    endpoint: Endpoint,
    join_timeout: Duration,
    cancel: CancellationToken,
    publisher: Publisher,
) {
    let negotiation = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            log::info!("Join of '{}' cancelled during negotiation", request.ssid);
            platform.unregister(request.id).await;
            return;
        }
        result = tokio::time::timeout(join_timeout, platform.request_network(&request)) => result,
    };

    let handle = match negotiation {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            log::error!("Association with '{}' failed: {:#}", request.ssid, e);
            platform.unregister(request.id).await;
            publisher.publish(ConnectionState::Failed(format!("{:#}", e)));
            return;
        }
        Err(_) => {
            log::error!("Association with '{}' timed out", request.ssid);
            platform.unregister(request.id).await;
            publisher.publish(ConnectionState::Failed(format!(
                "timed out after {}s waiting for '{}'",
                join_timeout.as_secs_f32(),
                request.ssid
            )));
            return;
        }
    };

    if let Err(e) = platform.bind_process(&handle).await {
        log::error!("Binding traffic to '{}' failed: {:#}", request.ssid, e);
        platform.unregister(request.id).await;
        publisher.publish(ConnectionState::Failed(format!("{:#}", e)));
        return;
    }

    log::info!(
        "Joined '{}' on {}; server endpoint {}",
        handle.ssid,
        handle.interface.as_deref().unwrap_or("default interface"),
        endpoint
    );
    publisher.publish(ConnectionState::Connected(endpoint));

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            platform.unbind_process().await;
            platform.unregister(request.id).await;
        }
        _ = platform.wait_for_loss(&handle) => {
            log::warn!("Lost network '{}'", handle.ssid);
            platform.unbind_process().await;
            platform.unregister(request.id).await;
            publisher.publish(ConnectionState::Failed(format!("lost connection to '{}'", handle.ssid)));
        }
    }
}

// --- NetworkManager (nmcli) platform ---

/// Joins networks through NetworkManager's `nmcli`.
///
/// Requests go to an explicit base URL, so there is no process-wide rebind:
/// `bind_process` only records the interface in the log.
pub struct NmcliPlatform {
    activated: DashMap<Uuid, String>,
    poll_interval: Duration,
    wait: Duration,
}

impl NmcliPlatform {
    pub fn new(wait: Duration) -> Self {
        Self { activated: DashMap::new(), poll_interval: Duration::from_secs(3), wait }
    }

    async fn device_status(&self) -> Result<String> {
        run_nmcli(&["-t", "-f", "DEVICE,TYPE,STATE,CONNECTION", "device", "status"]).await
    }
}

async fn run_nmcli(args: &[&str]) -> Result<String> {
    let output = Command::new("nmcli")
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .context("Failed to run nmcli")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("nmcli exited with {}: {}", output.status, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Finds the Wi-Fi device currently connected to `ssid` in terse
/// `DEVICE:TYPE:STATE:CONNECTION` output.
pub fn connected_wifi_device(status_output: &str, ssid: &str) -> Option<String> {
    status_output.lines().find_map(|line| {
        let fields = split_terse(line);
        match fields.as_slice() {
            [device, kind, state, connection]
                if kind == "wifi" && state.starts_with("connected") && connection == ssid =>
            {
                Some(device.clone())
            }
            _ => None,
        }
    })
}

// nmcli terse mode escapes ':' and '\' inside values with a backslash.
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = vec![String::new()];
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let (Some(next), Some(field)) = (chars.next(), fields.last_mut()) {
                    field.push(next);
                }
            }
            ':' => fields.push(String::new()),
            other => {
                if let Some(field) = fields.last_mut() {
                    field.push(other);
                }
            }
        }
    }
    fields
}

#[async_trait]
impl NetworkPlatform for NmcliPlatform {
    async fn request_network(&self, request: &NetworkRequest) -> Result<NetworkHandle> {
        log::info!("nmcli: connecting to '{}'", request.ssid);
        let wait = self.wait.as_secs().max(1).to_string();
        run_nmcli(&[
            "--wait",
            &wait,
            "device",
            "wifi",
            "connect",
            &request.ssid,
            "password",
            &request.passphrase,
        ])
        .await
        .with_context(|| format!("Could not connect to '{}'", request.ssid))?;
        self.activated.insert(request.id, request.ssid.clone());

        let interface = match self.device_status().await {
            Ok(output) => connected_wifi_device(&output, &request.ssid),
            Err(e) => {
                log::warn!("nmcli: could not read device status: {:#}", e);
                None
            }
        };
        Ok(NetworkHandle { request_id: request.id, ssid: request.ssid.clone(), interface })
    }

    async fn bind_process(&self, handle: &NetworkHandle) -> Result<()> {
        log::debug!(
            "nmcli: traffic to the server goes out via {} by address",
            handle.interface.as_deref().unwrap_or("the default route")
        );
        Ok(())
    }

    async fn wait_for_loss(&self, handle: &NetworkHandle) {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            match self.device_status().await {
                Ok(output) if connected_wifi_device(&output, &handle.ssid).is_some() => {}
                Ok(_) => return,
                Err(e) => log::warn!("nmcli: status poll failed: {:#}", e),
            }
        }
    }

    async fn unbind_process(&self) {}

    async fn unregister(&self, request_id: Uuid) {
        if let Some((_, ssid)) = self.activated.remove(&request_id) {
            log::info!("nmcli: bringing down '{}'", ssid);
            if let Err(e) = run_nmcli(&["connection", "down", "id", &ssid]).await {
                log::warn!("nmcli: failed to bring down '{}': {:#}", ssid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct ScriptedPlatform {
        fail_with: Option<String>,
        hang: bool,
        lost: Notify,
        calls: StdMutex<Vec<String>>,
    }

    impl ScriptedPlatform {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NetworkPlatform for ScriptedPlatform {
        async fn request_network(&self, request: &NetworkRequest) -> Result<NetworkHandle> {
            assert!(!request.require_internet);
            self.record(format!("request:{}", request.ssid));
            if self.hang {
                futures::future::pending::<()>().await;
            }
            if let Some(reason) = &self.fail_with {
                anyhow::bail!("{}", reason);
            }
            Ok(NetworkHandle { request_id: request.id, ssid: request.ssid.clone(), interface: Some("wlan0".into()) })
        }

        async fn bind_process(&self, _handle: &NetworkHandle) -> Result<()> {
            self.record("bind");
            Ok(())
        }

        async fn wait_for_loss(&self, _handle: &NetworkHandle) {
            self.lost.notified().await;
        }

        async fn unbind_process(&self) {
            self.record("unbind");
        }

        async fn unregister(&self, _request_id: Uuid) {
            self.record("unregister");
        }
    }

    fn payload(ssid: &str) -> PairingPayload {
        PairingPayload::parse(&format!("WIFI:T:WPA;S:{};P:gemma3n8080;I:192.168.137.1;;", ssid)).unwrap()
    }

    fn joiner(platform: &Arc<ScriptedPlatform>, timeout: Duration) -> LocalNetworkJoiner {
        LocalNetworkJoiner::new(platform.clone(), timeout)
    }

    #[tokio::test]
    async fn successful_join_then_disconnect() {
        let platform = Arc::new(ScriptedPlatform::default());
        let joiner = joiner(&platform, Duration::from_secs(5));

        let mut events = joiner.join(&payload("LabPort")).await;
        assert_eq!(events.next().await, Some(ConnectionState::Connecting));
        assert_eq!(
            events.next().await,
            Some(ConnectionState::Connected(Endpoint::new("192.168.137.1", 8000)))
        );
        assert!(joiner.state().is_connected());

        joiner.disconnect().await;
        assert_eq!(events.next().await, None);
        assert_eq!(joiner.state(), ConnectionState::Idle);
        assert_eq!(platform.calls(), ["request:LabPort", "bind", "unbind", "unregister"]);

        joiner.disconnect().await;
        assert_eq!(platform.calls().len(), 4);
    }

    #[tokio::test]
    async fn association_failure_is_reported_and_unregistered() {
        let platform = Arc::new(ScriptedPlatform { fail_with: Some("wrong password".into()), ..Default::default() });
        let joiner = joiner(&platform, Duration::from_secs(5));

        let events: Vec<_> = joiner.join(&payload("LabPort")).await.collect().await;
        assert_eq!(events[0], ConnectionState::Connecting);
        match &events[1] {
            ConnectionState::Failed(reason) => assert!(reason.contains("wrong password")),
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(events.len(), 2);
        assert_eq!(platform.calls(), ["request:LabPort", "unregister"]);
    }

    #[tokio::test]
    async fn negotiation_times_out() {
        let platform = Arc::new(ScriptedPlatform { hang: true, ..Default::default() });
        let joiner = joiner(&platform, Duration::from_millis(50));

        let events: Vec<_> = joiner.join(&payload("LabPort")).await.collect().await;
        assert!(matches!(&events[1], ConnectionState::Failed(reason) if reason.contains("timed out")));
        assert_eq!(platform.calls(), ["request:LabPort", "unregister"]);
    }

    #[tokio::test]
    async fn disconnect_mid_negotiation_unregisters() {
        let platform = Arc::new(ScriptedPlatform { hang: true, ..Default::default() });
        let joiner = joiner(&platform, Duration::from_secs(60));

        let mut events = joiner.join(&payload("LabPort")).await;
        assert_eq!(events.next().await, Some(ConnectionState::Connecting));
        tokio::task::yield_now().await;

        joiner.disconnect().await;
        assert_eq!(events.next().await, None);
        assert_eq!(joiner.state(), ConnectionState::Idle);
        assert_eq!(platform.calls().last().map(String::as_str), Some("unregister"));
    }

    #[tokio::test]
    async fn new_join_releases_previous_one_first() {
        let platform = Arc::new(ScriptedPlatform::default());
        let joiner = joiner(&platform, Duration::from_secs(5));

        let mut first = joiner.join(&payload("LabA")).await;
        first.next().await;
        first.next().await;

        let mut second = joiner.join(&payload("LabB")).await;
        assert_eq!(second.next().await, Some(ConnectionState::Connecting));
        assert!(second.next().await.unwrap().is_connected());
        assert_eq!(first.next().await, None);
        assert_eq!(
            platform.calls(),
            ["request:LabA", "bind", "unbind", "unregister", "request:LabB", "bind"]
        );
    }

    #[tokio::test]
    async fn losing_the_network_fails_the_join() {
        let platform = Arc::new(ScriptedPlatform::default());
        let joiner = joiner(&platform, Duration::from_secs(5));

        let mut events = joiner.join(&payload("LabPort")).await;
        events.next().await;
        events.next().await;
        platform.lost.notify_one();

        assert!(matches!(events.next().await, Some(ConnectionState::Failed(reason)) if reason.contains("lost")));
        assert_eq!(events.next().await, None);
        assert_eq!(platform.calls(), ["request:LabPort", "bind", "unbind", "unregister"]);
    }

    #[test]
    fn finds_connected_wifi_device() {
        let output = "eth0:ethernet:unavailable:\nwlan0:wifi:connected:LabPort\np2p-dev-wlan0:wifi-p2p:disconnected:\n";
        assert_eq!(connected_wifi_device(output, "LabPort").as_deref(), Some("wlan0"));
        assert_eq!(connected_wifi_device(output, "Other"), None);

        let escaped = "wlan1:wifi:connected (externally):Lab\\:Port\n";
        assert_eq!(connected_wifi_device(escaped, "Lab:Port").as_deref(), Some("wlan1"));
    }
}
